//! Step Definition Store.
//!
//! Persists step definitions on their own, keyed by step name, so one
//! definition can be referenced by several flows.  `create` and `save` are
//! deliberately distinct: `create` never overwrites and `save` never creates.

use std::sync::Arc;

use db::{Document, DocumentStore, WriteCondition};
use tracing::{debug, info, instrument};

use crate::error::Entity;
use crate::models::{FlowDocument, FLOWS_COLLECTION, STEPS_COLLECTION};
use crate::{EngineError, Step, StepType};

/// Handle on the `steps` collection of a document store. Cheap to clone.
#[derive(Clone)]
pub struct StepStore {
    store: Arc<dyn DocumentStore>,
}

impl StepStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Parse a step payload; see [`Step::from_json`].
    pub fn parse(payload: &str) -> Result<Step, EngineError> {
        Step::from_json(payload)
    }

    /// Persist a new step at version 1.
    ///
    /// # Errors
    /// [`EngineError::StepExists`] if a step with this name is already stored.
    #[instrument(skip(self, step), fields(step = %step.name))]
    pub async fn create(&self, step: &Step) -> Result<Step, EngineError> {
        step.validate()?;
        let document = self.write(step, WriteCondition::Absent).await?;
        info!(version = document.version, "step created");
        Ok(with_version(step, document.version))
    }

    /// Update an existing step and bump its version.
    ///
    /// A non-zero `step.version` must match the stored version; with version 0
    /// the currently stored version is used.
    ///
    /// # Errors
    /// - [`EngineError::StepNotFound`] if the step was never created.
    /// - [`EngineError::StaleVersion`] if someone else saved in between.
    /// - [`EngineError::StepInUse`] if the type changes while flows reference the step.
    pub async fn save(&self, step: &Step) -> Result<Step, EngineError> {
        self.save_within(step, None).await
    }

    /// [`StepStore::save`], ignoring references held by flow `owner`, which
    /// is being rewritten together with the step.
    #[instrument(skip(self, step), fields(step = %step.name))]
    pub(crate) async fn save_within(&self, step: &Step, owner: Option<&str>) -> Result<Step, EngineError> {
        step.validate()?;
        let stored = self
            .get_by_name(&step.name)
            .await?
            .ok_or_else(|| EngineError::StepNotFound(step.name.clone()))?;
        if stored.step_type != step.step_type {
            self.ensure_unreferenced(&step.name, owner).await?;
        }

        let expected = match step.version {
            0 => stored.version,
            version => version,
        };
        let document = self.write(step, WriteCondition::Version(expected)).await?;
        info!(version = document.version, "step saved");
        Ok(with_version(step, document.version))
    }

    /// Fail with [`EngineError::StepInUse`] if storing `step` would retype a
    /// definition that flows other than `owner` reference.
    pub(crate) async fn check_retype(&self, step: &Step, owner: Option<&str>) -> Result<(), EngineError> {
        match self.get_by_name(&step.name).await? {
            Some(stored) if stored.step_type != step.step_type => {
                self.ensure_unreferenced(&step.name, owner).await
            }
            _ => Ok(()),
        }
    }

    /// Fetch a step by name and type. A missing step, or one stored under a
    /// different type, is `Ok(None)`.
    pub async fn get(&self, name: &str, step_type: StepType) -> Result<Option<Step>, EngineError> {
        Ok(self.get_by_name(name).await?.filter(|step| step.step_type == step_type))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Step>, EngineError> {
        self.store
            .get(STEPS_COLLECTION, name)
            .await?
            .map(decode)
            .transpose()
    }

    /// All stored steps in name order.
    pub async fn list(&self) -> Result<Vec<Step>, EngineError> {
        self.store
            .list(STEPS_COLLECTION)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Remove a step definition. Removing an absent step is not an error.
    ///
    /// # Errors
    /// [`EngineError::StepInUse`] while any flow references the step.
    pub async fn delete(&self, step: &Step) -> Result<(), EngineError> {
        self.delete_by_name(&step.name).await
    }

    pub async fn delete_by_name(&self, name: &str) -> Result<(), EngineError> {
        self.ensure_unreferenced(name, None).await?;
        let removed = self.store.delete(STEPS_COLLECTION, name).await?;
        debug!(step = name, removed, "step delete");
        Ok(())
    }

    /// Names of the flows whose documents reference `step_name`, in name order.
    pub async fn referencing_flows(&self, step_name: &str) -> Result<Vec<String>, EngineError> {
        let mut names = Vec::new();
        for document in self.store.list(FLOWS_COLLECTION).await? {
            let flow: FlowDocument =
                serde_json::from_value(document.body).map_err(EngineError::Serialization)?;
            if flow.steps.values().any(|step| step.name == step_name) {
                names.push(flow.name);
            }
        }
        Ok(names)
    }

    async fn ensure_unreferenced(&self, step_name: &str, owner: Option<&str>) -> Result<(), EngineError> {
        let flows: Vec<String> = self
            .referencing_flows(step_name)
            .await?
            .into_iter()
            .filter(|flow| Some(flow.as_str()) != owner)
            .collect();
        if flows.is_empty() {
            Ok(())
        } else {
            Err(EngineError::StepInUse {
                step: step_name.to_owned(),
                flows,
            })
        }
    }

    async fn write(&self, step: &Step, condition: WriteCondition) -> Result<Document, EngineError> {
        let body = serde_json::to_value(step).map_err(EngineError::Serialization)?;
        self.store
            .put(STEPS_COLLECTION, &step.name, body, condition)
            .await
            .map_err(|e| EngineError::from_write(Entity::Step, &step.name, e))
    }
}

fn with_version(step: &Step, version: u64) -> Step {
    let mut stored = step.clone();
    stored.version = version;
    stored
}

fn decode(document: Document) -> Result<Step, EngineError> {
    let mut step: Step = serde_json::from_value(document.body).map_err(EngineError::Serialization)?;
    step.version = document.version;
    Ok(step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::MemoryStore;
    use serde_json::json;

    fn step_store() -> StepStore {
        StepStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn create_assigns_version_one_and_rejects_duplicates() {
        let steps = step_store();
        let step = Step::new("load", StepType::Custom).with_collections("raw", "staged");

        let created = steps.create(&step).await.unwrap();
        assert_eq!(created.version, 1);

        assert!(matches!(
            steps.create(&step).await,
            Err(EngineError::StepExists(name)) if name == "load"
        ));
    }

    #[tokio::test]
    async fn save_requires_existing_step_and_bumps_version() {
        let steps = step_store();
        let step = Step::new("load", StepType::Custom);

        assert!(matches!(steps.save(&step).await, Err(EngineError::StepNotFound(_))));
        assert!(steps.get_by_name("load").await.unwrap().is_none(), "save must not create");

        let created = steps.create(&step).await.unwrap();
        let updated = steps
            .save(&created.clone().with_config("batchSize", json!(100)))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        let fetched = steps.get("load", StepType::Custom).await.unwrap().unwrap();
        assert_eq!(fetched.version, 2);
        assert_eq!(fetched.config["batchSize"], json!(100));
    }

    #[tokio::test]
    async fn save_with_stale_version_is_a_conflict() {
        let steps = step_store();
        let created = steps.create(&Step::new("load", StepType::Custom)).await.unwrap();
        steps.save(&created).await.unwrap();

        assert!(matches!(
            steps.save(&created).await,
            Err(EngineError::StaleVersion { expected: 1, actual: 2, .. })
        ));
    }

    #[tokio::test]
    async fn get_is_none_for_absent_or_mismatched_type() {
        let steps = step_store();
        steps.create(&Step::new("load", StepType::Ingestion)).await.unwrap();

        assert!(steps.get("missing", StepType::Ingestion).await.unwrap().is_none());
        assert!(steps.get("load", StepType::Custom).await.unwrap().is_none());
        assert!(steps.get("load", StepType::Ingestion).await.unwrap().is_some());
    }

    /// Store a one-step flow document pointing at `step`.
    async fn reference_from(steps: &StepStore, flow: &str, step: &str, step_type: &str) {
        let body = json!({ "name": flow, "steps": { "1": { "name": step, "type": step_type } } });
        steps
            .store
            .put(FLOWS_COLLECTION, flow, body, WriteCondition::Any)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn referenced_step_cannot_be_deleted() {
        let steps = step_store();
        let step = steps.create(&Step::new("load", StepType::Custom)).await.unwrap();
        reference_from(&steps, "a", "load", "CUSTOM").await;

        let err = steps.delete(&step).await.unwrap_err();
        assert!(matches!(&err, EngineError::StepInUse { flows, .. } if flows == &vec!["a".to_string()]));
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
        assert!(steps.get_by_name("load").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn referenced_step_keeps_its_type() {
        let steps = step_store();
        steps.create(&Step::new("load", StepType::Mapping)).await.unwrap();
        reference_from(&steps, "a", "load", "MAPPING").await;

        let retyped = Step::new("load", StepType::Ingestion);
        assert!(matches!(steps.save(&retyped).await, Err(EngineError::StepInUse { .. })));
        assert!(steps.get("load", StepType::Mapping).await.unwrap().is_some());

        // The flow that owns the only reference may retype it.
        let saved = steps.save_within(&retyped, Some("a")).await.unwrap();
        assert_eq!(saved.step_type, StepType::Ingestion);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let steps = step_store();
        let step = steps.create(&Step::new("load", StepType::Custom)).await.unwrap();

        steps.delete(&step).await.unwrap();
        steps.delete(&step).await.unwrap();
        assert!(steps.list().await.unwrap().is_empty());
    }
}
