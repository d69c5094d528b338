//! Capability-level error type.

use thiserror::Error;

/// Errors returned by a capability's `execute` method.
///
/// The executor uses the variant to decide retry behaviour:
/// - `Retryable` — the step is re-run with exponential back-off.
/// - `Fatal`     — the step is immediately marked as failed.
/// - `Cancelled` — the capability stopped at a checkpoint after the job was cancelled.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepError {
    /// Transient failure; the executor should re-try the step.
    #[error("retryable step error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal step error: {0}")]
    Fatal(String),

    #[error("step cancelled at checkpoint")]
    Cancelled,
}
