//! The `StepCapability` trait — the contract every step type must fulfil.

use std::sync::Arc;

use async_trait::async_trait;
use db::DocumentStore;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::StepError;

/// Everything a capability gets to see about the step it is running.
///
/// Defined here (in the capabilities crate) so both the engine and individual
/// capability implementations can import it without a circular dependency.
#[derive(Clone)]
pub struct ExecutionContext {
    /// ID of the job this step belongs to.
    pub job_id: String,
    pub flow_name: String,
    pub step_name: String,
    /// Upper-case type tag, e.g. `CUSTOM`.
    pub step_type: String,
    pub source_collection: Option<String>,
    pub destination_collection: Option<String>,
    /// Opaque step options; only the capability interprets them.
    pub config: Map<String, Value>,
    /// Backing document store the collections live in.
    pub store: Arc<dyn DocumentStore>,
    /// Tripped when the job is cancelled. Capabilities check it between
    /// writes; they are never interrupted mid-write.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("job_id", &self.job_id)
            .field("flow_name", &self.flow_name)
            .field("step_name", &self.step_name)
            .field("step_type", &self.step_type)
            .field("source_collection", &self.source_collection)
            .field("destination_collection", &self.destination_collection)
            .finish_non_exhaustive()
    }
}

/// The core capability trait.
///
/// One implementation per step type, registered with the executor under the
/// type's tag.
#[async_trait]
pub trait StepCapability: Send + Sync {
    /// Run the step against its collections and return a JSON summary that is
    /// recorded on the job.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value, StepError>;
}
