//! `engine` crate — step and flow definitions, their stores, and the background flow executor.

pub mod error;
pub mod executor;
pub mod jobs;
pub mod manager;
pub mod models;
pub mod registry;
pub mod sequence;
pub mod store;

pub use error::{EngineError, Entity, ErrorKind};
pub use executor::{CapabilityRegistry, ExecutorConfig, FailurePolicy, FlowExecutor, RunFlowResponse};
pub use jobs::{JobEvent, JobRecord, JobStatus, JobTracker, StepOutcome, StepRunStatus};
pub use manager::{FlowManager, StepPayload};
pub use models::{Flow, FlowDefinition, Step, StepType, StepView};
pub use registry::{FlowRegistry, StepLocator};
pub use sequence::{OrderToken, StepSequence};
pub use store::StepStore;
