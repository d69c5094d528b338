//! Orchestration facade.
//!
//! [`FlowManager`] bundles the registry, the step store and the executor
//! behind the operations a service or CLI exposes: flow CRUD, step
//! attachment by payload, step listings and runs.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, instrument, warn};

use db::DocumentStore;

use crate::error::Entity;
use crate::executor::{CapabilityRegistry, ExecutorConfig, FlowExecutor};
use crate::jobs::{JobRecord, JobTracker};
use crate::registry::FlowRegistry;
use crate::sequence::{OrderToken, StepSequence};
use crate::store::StepStore;
use crate::{EngineError, Flow, Step, StepView};

/// Inbound "add step" payload: a step definition plus an optional order token.
///
/// Any `version` in the payload is dropped; versions belong to the store.
#[derive(Debug, Clone, Deserialize)]
pub struct StepPayload {
    #[serde(default)]
    pub order: Option<String>,
    #[serde(flatten)]
    pub step: Step,
}

impl StepPayload {
    pub fn from_json(payload: &str) -> Result<Self, EngineError> {
        let mut parsed: StepPayload = serde_json::from_str(payload).map_err(|source| EngineError::MalformedPayload {
            entity: Entity::Step,
            source,
        })?;
        parsed.step.validate()?;
        parsed.step.version = 0;
        Ok(parsed)
    }
}

/// Service facade over one document store.
#[derive(Clone)]
pub struct FlowManager {
    registry: FlowRegistry,
    executor: FlowExecutor,
}

impl FlowManager {
    /// Wire a registry, step store and executor onto `store`.
    pub fn new(store: Arc<dyn DocumentStore>, capabilities: CapabilityRegistry, config: ExecutorConfig) -> Self {
        let registry = FlowRegistry::new(Arc::clone(&store), StepStore::new(Arc::clone(&store)));
        let executor = FlowExecutor::new(registry.clone(), store, capabilities, config);
        Self { registry, executor }
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &FlowExecutor {
        &self.executor
    }

    pub fn jobs(&self) -> &Arc<JobTracker> {
        self.executor.jobs()
    }

    // -----------------------------------------------------------------------
    // Flows
    // -----------------------------------------------------------------------

    pub async fn flows(&self) -> Result<Vec<Flow>, EngineError> {
        self.registry.list_flows().await
    }

    pub async fn flow_names(&self) -> Result<Vec<String>, EngineError> {
        self.registry.list_flow_names().await
    }

    pub async fn flow(&self, name: &str) -> Result<Option<Flow>, EngineError> {
        self.registry.get_flow(name).await
    }

    pub async fn create_flow(&self, payload: &str, check_exists: bool) -> Result<Flow, EngineError> {
        self.registry.create_from_definition(payload, check_exists).await
    }

    pub async fn delete_flow(&self, name: &str) -> Result<(), EngineError> {
        self.registry.delete_flow(name).await
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Display records for every step of a flow, in execution order.
    pub async fn steps(&self, flow_name: &str) -> Result<Vec<StepView>, EngineError> {
        let steps = self.registry.get_steps(flow_name).await?;
        Ok(steps.iter().map(|(token, step)| StepView::new(token, step)).collect())
    }

    /// Attach a step to a flow from a JSON payload.
    ///
    /// The step definition is created or updated in the step store, then
    /// placed at the payload's `order` token, or after the last numeric token
    /// when none is given.  Nothing is written if the payload is malformed
    /// or its token or name clashes with a step already in the flow.
    ///
    /// The flow must still be at the version the steps were read at when it
    /// is saved; a concurrent change to the flow is a
    /// [`EngineError::StaleVersion`] and a definition created here is removed
    /// again.
    #[instrument(skip(self, payload))]
    pub async fn add_step(&self, flow_name: &str, payload: &str) -> Result<StepView, EngineError> {
        let StepPayload { order, step } = StepPayload::from_json(payload)?;

        let mut steps = self.registry.get_steps(flow_name).await?;
        let token = match order {
            Some(order) => OrderToken::new(order)?,
            None => steps.next_token(),
        };

        // Dry run on a copy so a clash fails before anything is stored.
        steps.clone().insert(token.clone(), step.clone())?;

        let step_store = self.registry.step_store();
        let existing = step_store.get_by_name(&step.name).await?;
        let stored = match existing {
            Some(_) => step_store.save(&step).await?,
            None => step_store.create(&step).await?,
        };
        steps.insert(token.clone(), stored.clone())?;

        if let Err(err) = self.attach(flow_name, steps).await {
            if existing.is_none() {
                if let Err(cleanup) = step_store.delete(&stored).await {
                    warn!(step = %stored.name, error = %cleanup, "could not remove unattached step");
                }
            }
            return Err(err);
        }

        info!(step = %stored.name, order = %token, "step attached");
        Ok(StepView::new(&token, &stored))
    }

    /// Detach the step at `order` from a flow.
    ///
    /// The step definition is deleted too unless another flow still uses
    /// it.  Returns the detached step, or `None` if nothing sits at `order`.
    #[instrument(skip(self, order), fields(order = %order))]
    pub async fn remove_step(&self, flow_name: &str, order: &OrderToken) -> Result<Option<Step>, EngineError> {
        let mut steps = self.registry.get_steps(flow_name).await?;
        let Some(removed) = steps.remove(order) else {
            return Ok(None);
        };

        self.attach(flow_name, steps).await?;

        match self.registry.step_store().delete(&removed).await {
            Ok(()) => info!(step = %removed.name, "step detached and deleted"),
            Err(EngineError::StepInUse { .. }) => {
                info!(step = %removed.name, "step detached, definition still shared")
            }
            Err(err) => return Err(err),
        }
        Ok(Some(removed))
    }

    /// `set_steps` + `save`, both checked against the version `steps` was read at.
    async fn attach(&self, flow_name: &str, steps: StepSequence) -> Result<Flow, EngineError> {
        let flow = self.registry.set_steps(flow_name, steps).await?;
        self.registry.save(&flow).await
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Start a run of the whole flow, or of the named steps only. Returns the job id.
    pub async fn run_flow(&self, flow_name: &str, steps: Option<&[String]>) -> Result<String, EngineError> {
        let response = match steps {
            Some(names) => self.executor.run_steps(flow_name, names).await?,
            None => self.executor.run(flow_name).await?,
        };
        Ok(response.job_id)
    }

    pub async fn job(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs().get(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StepType;
    use db::MemoryStore;

    fn manager() -> FlowManager {
        FlowManager::new(Arc::new(MemoryStore::new()), CapabilityRegistry::new(), ExecutorConfig::default())
    }

    #[test]
    fn payload_keeps_order_out_of_the_step() {
        let payload = StepPayload::from_json(r#"{ "order": "3", "name": "load", "type": "custom" }"#).unwrap();
        assert_eq!(payload.order.as_deref(), Some("3"));
        assert_eq!(payload.step.step_type, StepType::Custom);
    }

    #[tokio::test]
    async fn add_step_appends_after_last_numeric_token() {
        let manager = manager();
        manager.create_flow(r#"{ "name": "f" }"#, true).await.unwrap();

        let first = manager.add_step("f", r#"{ "name": "load", "type": "INGESTION" }"#).await.unwrap();
        let second = manager.add_step("f", r#"{ "name": "map", "type": "MAPPING" }"#).await.unwrap();

        assert_eq!(first.order, "1");
        assert_eq!(second.order, "2");
        assert_eq!(second.id, "map-MAPPING");
        assert_eq!(second.version, "1");
    }

    #[tokio::test]
    async fn malformed_step_payload_attaches_nothing() {
        let manager = manager();
        manager.create_flow(r#"{ "name": "f" }"#, true).await.unwrap();

        let err = manager.add_step("f", r#"{ "name": "load", "type": 7 }"#).await.unwrap_err();
        assert!(matches!(err, EngineError::MalformedPayload { entity: Entity::Step, .. }));
        assert!(manager.steps("f").await.unwrap().is_empty());
        assert!(manager.registry().step_store().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clashing_token_stores_nothing() {
        let manager = manager();
        manager.create_flow(r#"{ "name": "f" }"#, true).await.unwrap();
        manager
            .add_step("f", r#"{ "order": "1", "name": "load", "type": "CUSTOM" }"#)
            .await
            .unwrap();

        let err = manager
            .add_step("f", r#"{ "order": "1", "name": "other", "type": "CUSTOM" }"#)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateOrderToken(_)));
        assert!(manager.registry().step_store().get_by_name("other").await.unwrap().is_none());
    }

    #[test]
    fn payload_version_is_ignored() {
        let payload = StepPayload::from_json(r#"{ "name": "load", "type": "CUSTOM", "version": 5 }"#).unwrap();
        assert_eq!(payload.step.version, 0);
    }

    #[tokio::test]
    async fn add_step_with_a_client_version_updates_the_stored_step() {
        let manager = manager();
        manager.create_flow(r#"{ "name": "a", "steps": { "1": { "name": "load", "type": "CUSTOM" } } }"#, true).await.unwrap();
        manager.create_flow(r#"{ "name": "b" }"#, true).await.unwrap();

        let view = manager
            .add_step("b", r#"{ "name": "load", "type": "CUSTOM", "version": 5 }"#)
            .await
            .unwrap();
        assert_eq!(view.version, "2");
    }

    #[tokio::test]
    async fn add_step_cannot_retype_a_shared_step() {
        let manager = manager();
        manager.create_flow(r#"{ "name": "a", "steps": { "1": { "name": "load", "type": "MAPPING" } } }"#, true).await.unwrap();
        manager.create_flow(r#"{ "name": "b" }"#, true).await.unwrap();

        let err = manager
            .add_step("b", r#"{ "name": "load", "type": "INGESTION" }"#)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepInUse { .. }));
        assert!(manager.steps("b").await.unwrap().is_empty());
        assert_eq!(manager.steps("a").await.unwrap()[0].id, "load-MAPPING");
    }

    #[tokio::test]
    async fn add_step_after_a_concurrent_change_is_stale() {
        let manager = manager();
        manager.create_flow(r#"{ "name": "f" }"#, true).await.unwrap();

        // Another writer read the flow before this add_step landed.
        let registry = manager.registry();
        let mut stale = registry.get_steps("f").await.unwrap();
        manager.add_step("f", r#"{ "name": "a", "type": "CUSTOM" }"#).await.unwrap();

        let b = registry.step_store().create(&Step::new("b", StepType::Custom)).await.unwrap();
        stale.insert(OrderToken::new("2").unwrap(), b).unwrap();
        assert!(matches!(
            registry.set_steps("f", stale).await,
            Err(EngineError::StaleVersion { .. })
        ));

        let names: Vec<String> = manager.steps("f").await.unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["a"]);
    }

    #[tokio::test]
    async fn remove_step_keeps_definitions_shared_with_other_flows() {
        let manager = manager();
        manager
            .create_flow(r#"{ "name": "a", "steps": { "1": { "name": "load", "type": "CUSTOM" } } }"#, true)
            .await
            .unwrap();
        manager
            .create_flow(r#"{ "name": "b", "steps": { "1": { "name": "load", "type": "CUSTOM" } } }"#, true)
            .await
            .unwrap();

        let token = OrderToken::new("1").unwrap();
        let removed = manager.remove_step("a", &token).await.unwrap().unwrap();
        assert_eq!(removed.name, "load");
        assert!(manager.steps("a").await.unwrap().is_empty());
        assert!(manager.registry().step_store().get_by_name("load").await.unwrap().is_some());

        manager.remove_step("b", &token).await.unwrap();
        assert!(manager.registry().step_store().get_by_name("load").await.unwrap().is_none());

        // Nothing left at that token.
        assert!(manager.remove_step("b", &token).await.unwrap().is_none());
    }
}
