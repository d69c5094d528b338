//! Core domain models for the orchestration engine.
//!
//! These types are the source of truth for what a step and a flow look like
//! in memory.  Steps are persisted whole in the `steps` collection; flows are
//! persisted as a [`FlowDocument`] that only references its steps by name.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Entity};
use crate::sequence::{OrderToken, StepSequence};

/// Collection holding one document per flow, keyed by flow name.
pub const FLOWS_COLLECTION: &str = "flows";
/// Collection holding one document per step definition, keyed by step name.
pub const STEPS_COLLECTION: &str = "steps";

// ---------------------------------------------------------------------------
// StepType
// ---------------------------------------------------------------------------

/// Capability tag of a step. Selects the `StepCapability` used at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    #[serde(alias = "ingestion")]
    Ingestion,
    #[serde(alias = "mapping")]
    Mapping,
    #[serde(alias = "mastering")]
    Mastering,
    #[serde(alias = "custom")]
    Custom,
}

impl StepType {
    pub const ALL: [StepType; 4] = [Self::Ingestion, Self::Mapping, Self::Mastering, Self::Custom];

    /// The tag capabilities are registered under.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingestion => "INGESTION",
            Self::Mapping => "MAPPING",
            Self::Mastering => "MASTERING",
            Self::Custom => "CUSTOM",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown step type: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single typed transformation between two collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique within a flow and the primary key in the step store.
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_collection: Option<String>,
    /// Opaque options, interpreted only by the step's capability.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Assigned by the store; 0 until the step is first persisted.
    #[serde(default)]
    pub version: u64,
}

impl Step {
    pub fn new(name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            name: name.into(),
            step_type,
            description: None,
            source_collection: None,
            destination_collection: None,
            config: Map::new(),
            version: 0,
        }
    }

    pub fn with_collections(mut self, source: impl Into<String>, destination: impl Into<String>) -> Self {
        self.source_collection = Some(source.into());
        self.destination_collection = Some(destination.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Display identifier `name-type`, e.g. `ingest1-CUSTOM`.
    pub fn id(&self) -> String {
        format!("{}-{}", self.name, self.step_type)
    }

    pub fn reference(&self) -> StepRef {
        StepRef {
            name: self.name.clone(),
            step_type: self.step_type,
        }
    }

    /// Parse a step payload.
    ///
    /// Undecodable JSON is [`EngineError::MalformedPayload`]; a decodable
    /// payload with an empty name is [`EngineError::EmptyName`].
    pub fn from_json(payload: &str) -> Result<Self, EngineError> {
        let step: Step = serde_json::from_str(payload).map_err(|source| EngineError::MalformedPayload {
            entity: Entity::Step,
            source,
        })?;
        step.validate()?;
        Ok(step)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::EmptyName(Entity::Step));
        }
        Ok(())
    }
}

/// How a flow document points at a step definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRef {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// A named, versioned, ordered pipeline of steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub(crate) name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: StepSequence,
    pub(crate) version: u64,
}

impl Flow {
    /// Create an empty, not yet persisted flow.
    pub fn new(name: impl Into<String>) -> Result<Self, EngineError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(EngineError::EmptyName(Entity::Flow));
        }
        Ok(Self {
            name,
            description: None,
            steps: StepSequence::new(),
            version: 0,
        })
    }

    /// The flow's name never changes after construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store-assigned version; 0 means the flow has not been persisted.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Parse a flow definition payload (see [`FlowDefinition`]).
    pub fn from_json(payload: &str) -> Result<Self, EngineError> {
        let definition: FlowDefinition =
            serde_json::from_str(payload).map_err(|source| EngineError::MalformedPayload {
                entity: Entity::Flow,
                source,
            })?;
        Self::try_from(definition)
    }
}

/// Inbound flow definition: steps are embedded whole, keyed by order token.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: BTreeMap<String, Step>,
}

impl TryFrom<FlowDefinition> for Flow {
    type Error = EngineError;

    fn try_from(definition: FlowDefinition) -> Result<Self, Self::Error> {
        let mut flow = Flow::new(definition.name)?;
        flow.description = definition.description;
        for (token, mut step) in definition.steps {
            // Versions belong to the store, not to the payload.
            step.version = 0;
            flow.steps.insert(OrderToken::new(token)?, step)?;
        }
        Ok(flow)
    }
}

/// Persisted shape of a flow: step references instead of step bodies, so a
/// step definition can be shared by several flows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDocument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepRef>,
}

impl From<&Flow> for FlowDocument {
    fn from(flow: &Flow) -> Self {
        Self {
            name: flow.name.clone(),
            description: flow.description.clone(),
            steps: flow
                .steps
                .iter()
                .map(|(token, step)| (token.to_string(), step.reference()))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// StepView
// ---------------------------------------------------------------------------

/// Descriptive record returned by step listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    /// `name-type` display identifier.
    pub id: String,
    /// Order token of the step within its flow.
    pub order: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source_collection: Option<String>,
    pub destination_collection: Option<String>,
    pub config: Map<String, Value>,
    pub version: String,
}

impl StepView {
    pub fn new(order: &OrderToken, step: &Step) -> Self {
        Self {
            id: step.id(),
            order: order.to_string(),
            name: step.name.clone(),
            step_type: step.step_type,
            description: step.description.clone(),
            source_collection: step.source_collection.clone(),
            destination_collection: step.destination_collection.clone(),
            config: step.config.clone(),
            version: step.version.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn display_id_is_name_dash_type() {
        let step = Step::new("ingest1", StepType::Custom);
        assert_eq!(step.id(), "ingest1-CUSTOM");
    }

    #[test]
    fn step_type_parses_case_insensitively() {
        assert_eq!("mastering".parse::<StepType>().unwrap(), StepType::Mastering);
        assert!("transform".parse::<StepType>().is_err());
    }

    #[test]
    fn malformed_step_payload_is_not_a_validation_of_the_name() {
        let err = Step::from_json("{ not json").unwrap_err();
        assert!(matches!(err, EngineError::MalformedPayload { entity: Entity::Step, .. }));

        let err = Step::from_json(r#"{ "name": "", "type": "CUSTOM" }"#).unwrap_err();
        assert!(matches!(err, EngineError::EmptyName(Entity::Step)));
    }

    #[test]
    fn step_payload_uses_camel_case_fields() {
        let step = Step::from_json(
            r#"{ "name": "load", "type": "INGESTION", "sourceCollection": "raw",
                 "destinationCollection": "staged", "config": { "batch": 10 } }"#,
        )
        .unwrap();

        assert_eq!(step.source_collection.as_deref(), Some("raw"));
        assert_eq!(step.destination_collection.as_deref(), Some("staged"));
        assert_eq!(step.config["batch"], json!(10));
        assert_eq!(step.version, 0);
    }

    #[test]
    fn flow_definition_with_empty_name_is_rejected() {
        let err = Flow::from_json(r#"{ "steps": {} }"#).unwrap_err();
        assert!(matches!(err, EngineError::EmptyName(Entity::Flow)));
    }

    #[test]
    fn flow_document_references_steps_by_name() {
        let mut flow = Flow::new("orders-flow").unwrap();
        flow.steps
            .insert(OrderToken::new("1").unwrap(), Step::new("load", StepType::Custom))
            .unwrap();

        let document = FlowDocument::from(&flow);
        assert_eq!(
            serde_json::to_value(&document).unwrap(),
            json!({ "name": "orders-flow", "steps": { "1": { "name": "load", "type": "CUSTOM" } } })
        );
    }
}
