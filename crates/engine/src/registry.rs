//! Flow Registry.
//!
//! Persists flows as [`FlowDocument`]s keyed by flow name and resolves their
//! step references through the [`StepStore`] on every read.
//!
//! Mutation and persistence are separate calls: [`FlowRegistry::set_steps`]
//! only returns the updated in-memory flow, and the caller decides whether to
//! [`FlowRegistry::save`] it.

use std::sync::Arc;

use db::{Document, DocumentStore, WriteCondition};
use tracing::{debug, info, instrument, warn};

use crate::error::Entity;
use crate::models::{FlowDocument, FLOWS_COLLECTION};
use crate::sequence::{OrderToken, StepSequence};
use crate::store::StepStore;
use crate::{EngineError, Flow, Step};

/// How a step inside a flow is addressed.
///
/// The order token is the canonical address.  The `name-type` display id is
/// accepted only when the caller asks for it explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepLocator {
    Order(OrderToken),
    DisplayId(String),
}

/// Handle on the `flows` collection. Cheap to clone.
#[derive(Clone)]
pub struct FlowRegistry {
    store: Arc<dyn DocumentStore>,
    steps: StepStore,
}

impl FlowRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, steps: StepStore) -> Self {
        Self { store, steps }
    }

    pub fn step_store(&self) -> &StepStore {
        &self.steps
    }

    /// All flows, in name order.
    ///
    /// A flow whose steps no longer resolve is left out with a warning;
    /// [`FlowRegistry::get_flow`] still reports it by name.
    pub async fn list_flows(&self) -> Result<Vec<Flow>, EngineError> {
        let mut flows = Vec::new();
        for document in self.store.list(FLOWS_COLLECTION).await? {
            match self.resolve(document).await {
                Ok(flow) => flows.push(flow),
                Err(EngineError::UnresolvedStep { flow, step }) => {
                    warn!(flow = %flow, step = %step, "skipping flow with an unresolved step");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(flows)
    }

    /// All flow names, in name order.
    pub async fn list_flow_names(&self) -> Result<Vec<String>, EngineError> {
        Ok(self
            .store
            .list(FLOWS_COLLECTION)
            .await?
            .into_iter()
            .map(|document| document.key)
            .collect())
    }

    pub async fn exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.store.exists(FLOWS_COLLECTION, name).await?)
    }

    /// Parse a flow definition and persist it together with its embedded steps.
    ///
    /// With `check_exists` an existing flow of the same name is a
    /// [`EngineError::FlowExists`] conflict; without it the flow is overwritten.
    ///
    /// The flow document is written before its steps, so a create that loses
    /// the race for the name leaves the shared step definitions untouched.
    /// A step definition used by another flow may not change type
    /// ([`EngineError::StepInUse`]).
    #[instrument(skip(self, payload))]
    pub async fn create_from_definition(
        &self,
        payload: &str,
        check_exists: bool,
    ) -> Result<Flow, EngineError> {
        let flow = Flow::from_json(payload)?;

        if check_exists && self.exists(flow.name()).await? {
            return Err(EngineError::FlowExists(flow.name().to_owned()));
        }
        for (_, step) in flow.steps.iter() {
            self.steps.check_retype(step, Some(flow.name())).await?;
        }

        let condition = if check_exists {
            WriteCondition::Absent
        } else {
            WriteCondition::Any
        };
        let saved = self.write(&flow, condition).await?;

        for (_, step) in flow.steps.iter() {
            if let Err(err) = self.upsert_step(step, flow.name()).await {
                if check_exists {
                    self.store.delete(FLOWS_COLLECTION, flow.name()).await?;
                    warn!(flow = %flow.name(), step = %step.name, "flow create rolled back");
                }
                return Err(err);
            }
        }

        info!(flow = %saved.name(), steps = saved.steps.len(), "flow created from definition");
        Ok(saved)
    }

    /// Look a flow up by name. Absence is `Ok(None)`.
    pub async fn get_flow(&self, name: &str) -> Result<Option<Flow>, EngineError> {
        match self.store.get(FLOWS_COLLECTION, name).await? {
            Some(document) => Ok(Some(self.resolve(document).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_flow_names(&self) -> Result<Vec<String>, EngineError> {
        self.list_flow_names().await
    }

    /// The ordered steps of a flow that must exist.
    pub async fn get_steps(&self, flow_name: &str) -> Result<StepSequence, EngineError> {
        Ok(self.require(flow_name).await?.steps)
    }

    /// Replace the flow's steps with `steps` and return the updated flow.
    ///
    /// Nothing is persisted; pass the result to [`FlowRegistry::save`], which
    /// checks the flow version again when writing.
    ///
    /// # Errors
    /// - [`EngineError::FlowNotFound`] if the flow does not exist.
    /// - [`EngineError::StaleVersion`] if `steps` was read from an older
    ///   version of the flow.
    pub async fn set_steps(&self, flow_name: &str, steps: StepSequence) -> Result<Flow, EngineError> {
        let mut flow = self.require(flow_name).await?;
        if let Some(read_at) = steps.read_at() {
            if read_at != flow.version {
                return Err(EngineError::StaleVersion {
                    entity: Entity::Flow,
                    name: flow.name,
                    expected: read_at,
                    actual: flow.version,
                });
            }
        }
        flow.steps = steps;
        Ok(flow)
    }

    /// Persist a flow.
    ///
    /// A flow that was never persisted (version 0) overwrites whatever is
    /// stored under its name; a loaded flow must still be at the version it
    /// was loaded at.
    ///
    /// # Errors
    /// - [`EngineError::UnresolvedStep`] if a step is not in the step store.
    /// - [`EngineError::StaleVersion`] on a lost update.
    #[instrument(skip(self, flow), fields(flow = %flow.name()))]
    pub async fn save(&self, flow: &Flow) -> Result<Flow, EngineError> {
        for (_, step) in flow.steps.iter() {
            if self.steps.get(&step.name, step.step_type).await?.is_none() {
                return Err(EngineError::UnresolvedStep {
                    flow: flow.name().to_owned(),
                    step: step.name.clone(),
                });
            }
        }

        let condition = match flow.version() {
            0 => WriteCondition::Any,
            version => WriteCondition::Version(version),
        };
        let saved = self.write(flow, condition).await?;
        info!(version = saved.version(), "flow saved");
        Ok(saved)
    }

    /// Remove a flow. Its steps stay in the step store.
    pub async fn delete_flow(&self, name: &str) -> Result<(), EngineError> {
        let removed = self.store.delete(FLOWS_COLLECTION, name).await?;
        debug!(flow = name, removed, "flow delete");
        Ok(())
    }

    /// Resolve a step inside a flow that must exist. A missing step is `Ok(None)`.
    pub async fn get_step(&self, flow_name: &str, locator: &StepLocator) -> Result<Option<Step>, EngineError> {
        let steps = self.get_steps(flow_name).await?;
        let step = match locator {
            StepLocator::Order(token) => steps.get(token),
            StepLocator::DisplayId(id) => steps.find_by_id(id).map(|(_, step)| step),
        };
        Ok(step.cloned())
    }

    /// Names of the flows whose documents reference `step_name`.
    pub async fn flows_referencing(&self, step_name: &str) -> Result<Vec<String>, EngineError> {
        self.steps.referencing_flows(step_name).await
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    async fn require(&self, flow_name: &str) -> Result<Flow, EngineError> {
        self.get_flow(flow_name)
            .await?
            .ok_or_else(|| EngineError::FlowNotFound(flow_name.to_owned()))
    }

    /// Create the step if it is new, otherwise save over the stored version.
    async fn upsert_step(&self, step: &Step, owner: &str) -> Result<Step, EngineError> {
        match self.steps.get_by_name(&step.name).await? {
            Some(_) => self.steps.save_within(step, Some(owner)).await,
            None => self.steps.create(step).await,
        }
    }

    async fn write(&self, flow: &Flow, condition: WriteCondition) -> Result<Flow, EngineError> {
        let body = serde_json::to_value(FlowDocument::from(flow)).map_err(EngineError::Serialization)?;
        let document = self
            .store
            .put(FLOWS_COLLECTION, flow.name(), body, condition)
            .await
            .map_err(|e| EngineError::from_write(Entity::Flow, flow.name(), e))?;

        let mut saved = flow.clone();
        saved.version = document.version;
        saved.steps.mark_read_at(document.version);
        Ok(saved)
    }

    /// Turn a stored flow document back into a flow with full step bodies.
    async fn resolve(&self, document: Document) -> Result<Flow, EngineError> {
        let version = document.version;
        let stored: FlowDocument =
            serde_json::from_value(document.body).map_err(EngineError::Serialization)?;

        let mut flow = Flow::new(stored.name)?;
        flow.description = stored.description;
        flow.version = version;

        for (token, reference) in stored.steps {
            let step = self
                .steps
                .get(&reference.name, reference.step_type)
                .await?
                .ok_or_else(|| EngineError::UnresolvedStep {
                    flow: flow.name.clone(),
                    step: reference.name.clone(),
                })?;
            flow.steps.insert(OrderToken::new(token)?, step)?;
        }
        flow.steps.mark_read_at(version);
        Ok(flow)
    }
}
