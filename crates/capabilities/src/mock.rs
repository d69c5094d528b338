//! `MockCapability` — a test double for `StepCapability`.
//!
//! Useful in unit and integration tests where a real capability is either
//! unavailable or irrelevant.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{ExecutionContext, StepCapability, StepError};

/// Behaviour injected into `MockCapability` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with `Retryable` for the first `n` calls, then return the value.
    Flaky { failures: usize, value: Value },
    /// Sleep before returning, honouring cancellation while asleep.
    Sleep(Duration),
    /// Request cancellation of the job, then return the value anyway.
    CancelJobThenReturn(Value),
    /// Panic with the given message.
    Panic(String),
}

/// A mock capability that records the name of every step it runs and returns
/// a programmer-specified result.
pub struct MockCapability {
    /// Label used in test assertions.
    pub name: String,
    /// What the capability will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// Steps that fail fatally regardless of `behaviour`.
    pub fatal_steps: HashSet<String>,
    /// Step names seen by this capability (in call order).
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockCapability {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            fatal_steps: HashSet::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that fails `failures` times before succeeding.
    pub fn flaky(name: impl Into<String>, failures: usize, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::Flaky { failures, value })
    }

    /// Create a mock that takes `delay` to finish each step.
    pub fn sleeping(name: impl Into<String>, delay: Duration) -> Self {
        Self::with_behaviour(name, MockBehaviour::Sleep(delay))
    }

    /// Create a mock whose step completes after the job was asked to stop.
    pub fn cancelling_job(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::CancelJobThenReturn(value))
    }

    /// Create a mock that panics inside `execute`.
    pub fn panicking(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Panic(msg.into()))
    }

    /// Make the named step fail fatally.
    pub fn with_fatal_step(mut self, step_name: impl Into<String>) -> Self {
        self.fatal_steps.insert(step_name.into());
        self
    }

    /// Shared handle on the call log, usable after the mock is moved into a registry.
    pub fn call_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.calls)
    }

    /// Number of times this capability has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or_default()
    }

    fn record(&self, step_name: &str) -> usize {
        match self.calls.lock() {
            Ok(mut calls) => {
                calls.push(step_name.to_owned());
                calls.len()
            }
            Err(_) => 0,
        }
    }
}

#[async_trait]
impl StepCapability for MockCapability {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value, StepError> {
        let call_number = self.record(&ctx.step_name);

        if self.fatal_steps.contains(&ctx.step_name) {
            return Err(StepError::Fatal(format!("{} refused step '{}'", self.name, ctx.step_name)));
        }

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => {
                // Tag the output so tests can tell which step produced it.
                let mut out = json!({ "capability": self.name, "step": ctx.step_name });
                if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
                    for (k, val) in v_obj {
                        out_obj.insert(k.clone(), val.clone());
                    }
                }
                Ok(out)
            }
            MockBehaviour::FailRetryable(msg) => Err(StepError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(StepError::Fatal(msg.clone())),
            MockBehaviour::Flaky { failures, value } => {
                if call_number <= *failures {
                    Err(StepError::Retryable(format!("flaky failure #{call_number}")))
                } else {
                    Ok(value.clone())
                }
            }
            MockBehaviour::Sleep(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(*delay) => Ok(json!({ "slept_ms": delay.as_millis() as u64 })),
                    _ = ctx.cancel.cancelled() => Err(StepError::Cancelled),
                }
            }
            MockBehaviour::CancelJobThenReturn(value) => {
                ctx.cancel.cancel();
                Ok(value.clone())
            }
            MockBehaviour::Panic(msg) => panic!("{}: {msg}", self.name),
        }
    }
}
