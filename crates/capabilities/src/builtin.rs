//! Built-in capabilities.
//!
//! `CopyCollection` moves every document of the step's source collection into
//! its destination collection, keeping keys. It is what the CLI registers for
//! step types that have no dedicated implementation.

use async_trait::async_trait;
use db::WriteCondition;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{ExecutionContext, StepCapability, StepError};

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyCollection;

#[async_trait]
impl StepCapability for CopyCollection {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value, StepError> {
        let source = ctx
            .source_collection
            .as_deref()
            .ok_or_else(|| StepError::Fatal(format!("step '{}' has no source collection", ctx.step_name)))?;
        let destination = ctx.destination_collection.as_deref().ok_or_else(|| {
            StepError::Fatal(format!("step '{}' has no destination collection", ctx.step_name))
        })?;

        let documents = ctx
            .store
            .list(source)
            .await
            .map_err(|e| StepError::Retryable(e.to_string()))?;

        let mut copied = 0usize;
        for doc in documents {
            // Checkpoint: each put is atomic, so stopping here leaves no torn document.
            if ctx.cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            ctx.store
                .put(destination, &doc.key, doc.body, WriteCondition::Any)
                .await
                .map_err(|e| StepError::Retryable(e.to_string()))?;
            copied += 1;
            debug!(key = %doc.key, source, destination, "copied document");
        }

        info!(step = %ctx.step_name, copied, source, destination, "collection copied");
        Ok(json!({ "copied": copied, "source": source, "destination": destination }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use db::{DocumentStore, MemoryStore};
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn ctx(store: Arc<dyn DocumentStore>, source: Option<&str>, dest: Option<&str>) -> ExecutionContext {
        ExecutionContext {
            job_id: "job".into(),
            flow_name: "orders-flow".into(),
            step_name: "copy".into(),
            step_type: "INGESTION".into(),
            source_collection: source.map(Into::into),
            destination_collection: dest.map(Into::into),
            config: Default::default(),
            store,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn copies_every_document() {
        let store = Arc::new(MemoryStore::new());
        for key in ["o1", "o2"] {
            store
                .put("raw", key, json!({ "id": key }), WriteCondition::Any)
                .await
                .unwrap();
        }

        let out = CopyCollection
            .execute(&ctx(store.clone(), Some("raw"), Some("staged")))
            .await
            .unwrap();

        assert_eq!(out["copied"], 2);
        let staged = store.get("staged", "o2").await.unwrap().unwrap();
        assert_eq!(staged.body, json!({ "id": "o2" }));
    }

    #[tokio::test]
    async fn missing_collections_are_fatal() {
        let store = Arc::new(MemoryStore::new());
        let result = CopyCollection.execute(&ctx(store, Some("raw"), None)).await;
        assert!(matches!(result, Err(StepError::Fatal(_))));
    }
}
