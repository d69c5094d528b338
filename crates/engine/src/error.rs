//! Engine-level error types.

use std::fmt;

use thiserror::Error;

use crate::StepType;

/// Which kind of definition an error is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Flow,
    Step,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flow => f.write_str("flow"),
            Self::Step => f.write_str("step"),
        }
    }
}

/// Coarse classification callers branch on (e.g. to pick a status code).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or semantically invalid input. Never retried.
    Validation,
    /// Name collision or lost update.
    Conflict,
    /// Something that had to exist does not.
    NotFound,
    Internal,
}

/// Errors produced by the orchestration engine (definitions + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// The payload could not be decoded at all.
    #[error("malformed {entity} payload: {source}")]
    MalformedPayload {
        entity: Entity,
        source: serde_json::Error,
    },

    #[error("{0} name must not be empty")]
    EmptyName(Entity),

    #[error("invalid order token '{0}'")]
    InvalidOrderToken(String),

    /// Two steps of one flow share an order token.
    #[error("duplicate order token: '{0}'")]
    DuplicateOrderToken(String),

    /// Two steps of one flow share a name.
    #[error("duplicate step name: '{0}'")]
    DuplicateStepName(String),

    /// A run request named steps the flow does not have.
    #[error("flow '{flow}' has no step(s) named {names:?}")]
    UnknownSteps { flow: String, names: Vec<String> },

    #[error("run request for flow '{0}' selects no steps")]
    EmptyStepSelection(String),

    #[error("no capability registered for step '{step}' of type {step_type}")]
    UnsupportedStepType { step: String, step_type: StepType },

    /// A flow references a step the step store cannot produce.
    #[error("flow '{flow}' references step '{step}' which is not in the step store")]
    UnresolvedStep { flow: String, step: String },

    // ------ Conflict errors ------

    #[error("flow '{0}' already exists")]
    FlowExists(String),

    #[error("step '{0}' already exists")]
    StepExists(String),

    /// A shared step definition cannot be deleted or retyped while flows use it.
    #[error("step '{step}' is referenced by flow(s) {flows:?}")]
    StepInUse { step: String, flows: Vec<String> },

    /// Optimistic-concurrency check failed.
    #[error("{entity} '{name}' was modified concurrently (expected version {expected}, found {actual})")]
    StaleVersion {
        entity: Entity,
        name: String,
        expected: u64,
        actual: u64,
    },

    // ------ Not-found errors ------

    #[error("flow '{0}' not found")]
    FlowNotFound(String),

    #[error("step '{0}' not found")]
    StepNotFound(String),

    // ------ Execution errors ------

    /// A step failed with a fatal error.
    #[error("step '{step}' failed fatally: {message}")]
    StepFatal { step: String, message: String },

    /// A step's retryable error was exhausted.
    #[error("step '{step}' exceeded retry limit: {message}")]
    StepRetryExhausted { step: String, message: String },

    #[error("step '{0}' stopped because the job was cancelled")]
    StepCancelled(String),

    // ------ Infrastructure errors ------

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    /// A stored document did not match the expected shape.
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedPayload { .. }
            | Self::EmptyName(_)
            | Self::InvalidOrderToken(_)
            | Self::DuplicateOrderToken(_)
            | Self::DuplicateStepName(_)
            | Self::UnknownSteps { .. }
            | Self::EmptyStepSelection(_)
            | Self::UnsupportedStepType { .. }
            | Self::UnresolvedStep { .. } => ErrorKind::Validation,

            Self::FlowExists(_)
            | Self::StepExists(_)
            | Self::StepInUse { .. }
            | Self::StaleVersion { .. } => ErrorKind::Conflict,

            Self::FlowNotFound(_) | Self::StepNotFound(_) => ErrorKind::NotFound,

            Self::StepFatal { .. }
            | Self::StepRetryExhausted { .. }
            | Self::StepCancelled(_)
            | Self::Database(_)
            | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Translate a failed conditional write into the domain error for `entity`.
    pub(crate) fn from_write(entity: Entity, name: &str, err: db::DbError) -> Self {
        match (entity, err) {
            (Entity::Flow, db::DbError::AlreadyExists { .. }) => Self::FlowExists(name.to_owned()),
            (Entity::Step, db::DbError::AlreadyExists { .. }) => Self::StepExists(name.to_owned()),
            (Entity::Flow, db::DbError::NotFound { .. }) => Self::FlowNotFound(name.to_owned()),
            (Entity::Step, db::DbError::NotFound { .. }) => Self::StepNotFound(name.to_owned()),
            (entity, db::DbError::VersionConflict { expected, actual, .. }) => Self::StaleVersion {
                entity,
                name: name.to_owned(),
                expected,
                actual,
            },
            (_, other) => Self::Database(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_conflicts_map_to_domain_errors() {
        let err = EngineError::from_write(
            Entity::Flow,
            "orders-flow",
            db::DbError::AlreadyExists {
                collection: "flows".into(),
                key: "orders-flow".into(),
            },
        );
        assert!(matches!(&err, EngineError::FlowExists(name) if name == "orders-flow"));
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = EngineError::from_write(
            Entity::Step,
            "load",
            db::DbError::VersionConflict {
                collection: "steps".into(),
                key: "load".into(),
                expected: 1,
                actual: 2,
            },
        );
        assert!(matches!(err, EngineError::StaleVersion { entity: Entity::Step, expected: 1, actual: 2, .. }));
    }

    #[test]
    fn step_in_use_is_a_conflict() {
        let err = EngineError::StepInUse {
            step: "load".into(),
            flows: vec!["a".into()],
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.to_string(), r#"step 'load' is referenced by flow(s) ["a"]"#);
    }

    #[test]
    fn unknown_steps_is_a_validation_error() {
        let err = EngineError::UnknownSteps {
            flow: "f".into(),
            names: vec!["ghost".into()],
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), r#"flow 'f' has no step(s) named ["ghost"]"#);
    }
}
