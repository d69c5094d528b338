//! Flow execution engine.
//!
//! `FlowExecutor` is the central orchestrator:
//! 1. Resolves the flow and the requested steps, failing fast on bad input.
//! 2. Registers a job with the [`JobTracker`] and returns its id right away.
//! 3. Runs the steps sequentially in a background task, dispatching each via
//!    the [`StepCapability`] registered for its type.
//! 4. Handles `StepError::Retryable` (up to `max_retries`) and
//!    `StepError::Fatal` (fail the step immediately).
//! 5. Applies the configured [`FailurePolicy`] once a step has failed.
//!
//! Each job task is watched by a second task, so a job whose task panics
//! still ends `Failed` instead of staying `Running`.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, warn, Instrument};

use capabilities::{ExecutionContext, StepCapability, StepError};
use db::DocumentStore;

use crate::jobs::{JobStatus, JobTracker, StepRunStatus};
use crate::registry::FlowRegistry;
use crate::sequence::OrderToken;
use crate::{EngineError, Step};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What happens to the rest of a job once one step has failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Skip every remaining step; the job ends `Failed`.
    #[default]
    AbortRemaining,
    /// Keep going; the job ends `PartiallyFailed` if anything succeeded.
    ContinueRemaining,
}

impl FromStr for FailurePolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" | "abort_remaining" => Ok(Self::AbortRemaining),
            "continue" | "continue_remaining" => Ok(Self::ContinueRemaining),
            other => Err(format!("unknown failure policy: {other}")),
        }
    }
}

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of times a retryable step failure will be retried.
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            failure_policy: FailurePolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Capability registry
// ---------------------------------------------------------------------------

/// Maps step type tags (`INGESTION`, `CUSTOM`, ...) to capability implementations.
pub type CapabilityRegistry = HashMap<String, Arc<dyn StepCapability>>;

// ---------------------------------------------------------------------------
// Response of an accepted run
// ---------------------------------------------------------------------------

/// Returned as soon as a run has been accepted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFlowResponse {
    pub job_id: String,
    pub flow_name: String,
    /// Steps that will run, in execution order.
    pub steps: Vec<String>,
}

// ---------------------------------------------------------------------------
// FlowExecutor
// ---------------------------------------------------------------------------

/// Launches flow runs as background jobs. Cheap to clone.
#[derive(Clone)]
pub struct FlowExecutor {
    registry: FlowRegistry,
    store: Arc<dyn DocumentStore>,
    capabilities: Arc<CapabilityRegistry>,
    jobs: Arc<JobTracker>,
    config: ExecutorConfig,
}

impl FlowExecutor {
    pub fn new(
        registry: FlowRegistry,
        store: Arc<dyn DocumentStore>,
        capabilities: CapabilityRegistry,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            store,
            capabilities: Arc::new(capabilities),
            jobs: Arc::new(JobTracker::new()),
            config,
        }
    }

    /// The status channel for jobs launched by this executor.
    pub fn jobs(&self) -> &Arc<JobTracker> {
        &self.jobs
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run every step of the flow.
    ///
    /// Returns once the job is accepted; failures of individual steps are
    /// recorded on the job and never returned here.
    ///
    /// # Errors
    /// - [`EngineError::FlowNotFound`] for an unknown flow.
    /// - [`EngineError::UnsupportedStepType`] if a step has no capability.
    pub async fn run(&self, flow_name: &str) -> Result<RunFlowResponse, EngineError> {
        self.dispatch(flow_name, None).await
    }

    /// Run only the named steps, keeping the flow's order.
    ///
    /// # Errors
    /// As [`FlowExecutor::run`], plus [`EngineError::UnknownSteps`] and
    /// [`EngineError::EmptyStepSelection`]. No job is created on error.
    pub async fn run_steps(&self, flow_name: &str, step_names: &[String]) -> Result<RunFlowResponse, EngineError> {
        self.dispatch(flow_name, Some(step_names)).await
    }

    #[instrument(skip(self, selection))]
    async fn dispatch(
        &self,
        flow_name: &str,
        selection: Option<&[String]>,
    ) -> Result<RunFlowResponse, EngineError> {
        let flow = self
            .registry
            .get_flow(flow_name)
            .await?
            .ok_or_else(|| EngineError::FlowNotFound(flow_name.to_owned()))?;

        let selected: Vec<(&OrderToken, &Step)> = match selection {
            None => flow.steps.iter().collect(),
            Some([]) => return Err(EngineError::EmptyStepSelection(flow_name.to_owned())),
            Some(names) => flow.steps.select(names).map_err(|names| EngineError::UnknownSteps {
                flow: flow_name.to_owned(),
                names,
            })?,
        };

        let mut plan = Vec::with_capacity(selected.len());
        for (token, step) in selected {
            let capability = self
                .capabilities
                .get(step.step_type.as_str())
                .cloned()
                .ok_or_else(|| EngineError::UnsupportedStepType {
                    step: step.name.clone(),
                    step_type: step.step_type,
                })?;
            plan.push(PlannedStep {
                token: token.clone(),
                step: step.clone(),
                capability,
            });
        }

        let outline: Vec<(OrderToken, Step)> = plan
            .iter()
            .map(|planned| (planned.token.clone(), planned.step.clone()))
            .collect();
        let (job_id, cancel) = self.jobs.accept(flow_name, &outline).await;

        let response = RunFlowResponse {
            job_id: job_id.clone(),
            flow_name: flow_name.to_owned(),
            steps: plan.iter().map(|planned| planned.step.name.clone()).collect(),
        };
        info!(job_id = %job_id, steps = ?response.steps, "job accepted");

        let run = JobRun {
            job_id: job_id.clone(),
            flow_name: flow_name.to_owned(),
            plan,
            store: Arc::clone(&self.store),
            jobs: Arc::clone(&self.jobs),
            config: self.config.clone(),
            cancel,
        };
        let span = info_span!("job", job_id = %job_id, flow = flow_name);
        let task = tokio::spawn(run.execute().instrument(span.clone()));

        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(
            async move {
                if let Err(err) = task.await {
                    error!(error = %err, "job task ended abnormally");
                    jobs.abandon(&job_id, format!("job task ended abnormally: {err}")).await;
                }
            }
            .instrument(span),
        );

        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// Background job
// ---------------------------------------------------------------------------

struct PlannedStep {
    token: OrderToken,
    step: Step,
    capability: Arc<dyn StepCapability>,
}

/// One accepted run, owned by its background task.
struct JobRun {
    job_id: String,
    flow_name: String,
    plan: Vec<PlannedStep>,
    store: Arc<dyn DocumentStore>,
    jobs: Arc<JobTracker>,
    config: ExecutorConfig,
    cancel: CancellationToken,
}

/// The first failure of a job, reported on its record.
struct FirstFailure {
    step: String,
    error: EngineError,
}

impl JobRun {
    async fn execute(self) {
        self.jobs.start(&self.job_id).await;

        let mut succeeded = 0usize;
        let mut first_failure: Option<FirstFailure> = None;
        let mut halted = false;
        // Set only when cancellation actually stopped a step.
        let mut interrupted = false;

        for planned in &self.plan {
            let name = planned.step.name.as_str();

            if halted {
                self.jobs.step_skipped(&self.job_id, name).await;
                continue;
            }
            if self.cancel.is_cancelled() {
                interrupted = true;
                self.jobs.step_skipped(&self.job_id, name).await;
                continue;
            }

            self.jobs.step_started(&self.job_id, name).await;
            info!(step = name, order = %planned.token, "step started");

            let (result, attempts) = self.execute_with_retry(planned).await;
            match result {
                Ok(output) => {
                    info!(step = name, attempts, "step succeeded");
                    self.jobs.step_succeeded(&self.job_id, name, output, attempts).await;
                    succeeded += 1;
                }
                Err(err) => {
                    let status = match err {
                        EngineError::StepCancelled(_) => StepRunStatus::Cancelled,
                        _ => StepRunStatus::Failed,
                    };
                    error!(step = name, attempts, error = %err, "step failed");
                    self.jobs
                        .step_failed(&self.job_id, name, status, err.to_string(), attempts)
                        .await;

                    if status == StepRunStatus::Cancelled {
                        interrupted = true;
                        halted = true;
                    } else if self.config.failure_policy == FailurePolicy::AbortRemaining {
                        halted = true;
                    }
                    if first_failure.is_none() {
                        first_failure = Some(FirstFailure {
                            step: name.to_owned(),
                            error: err,
                        });
                    }
                }
            }
        }

        let status = if interrupted {
            JobStatus::Cancelled
        } else {
            match &first_failure {
                None => JobStatus::Succeeded,
                Some(_) if succeeded > 0 && self.config.failure_policy == FailurePolicy::ContinueRemaining => {
                    JobStatus::PartiallyFailed
                }
                Some(_) => JobStatus::Failed,
            }
        };

        let (failed_step, error) = match first_failure {
            Some(failure) => (Some(failure.step), Some(failure.error.to_string())),
            None => (None, None),
        };
        self.jobs.finish(&self.job_id, status, failed_step, error).await;
        info!(flow = %self.flow_name, %status, succeeded, total = self.plan.len(), "job complete");
    }

    fn context(&self, step: &Step) -> ExecutionContext {
        ExecutionContext {
            job_id: self.job_id.clone(),
            flow_name: self.flow_name.clone(),
            step_name: step.name.clone(),
            step_type: step.step_type.as_str().to_owned(),
            source_collection: step.source_collection.clone(),
            destination_collection: step.destination_collection.clone(),
            config: step.config.clone(),
            store: Arc::clone(&self.store),
            cancel: self.cancel.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Internal: execute a single step with retry logic.
    // -----------------------------------------------------------------------

    /// Returns the result together with the number of attempts made.
    async fn execute_with_retry(&self, planned: &PlannedStep) -> (Result<Value, EngineError>, u32) {
        let step_name = planned.step.name.as_str();
        let ctx = self.context(&planned.step);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match planned.capability.execute(&ctx).await {
                Ok(output) => return (Ok(output), attempts),

                Err(StepError::Fatal(message)) => {
                    return (
                        Err(EngineError::StepFatal {
                            step: step_name.to_owned(),
                            message,
                        }),
                        attempts,
                    );
                }

                Err(StepError::Cancelled) => {
                    return (Err(EngineError::StepCancelled(step_name.to_owned())), attempts);
                }

                Err(StepError::Retryable(message)) => {
                    let retries = attempts - 1;
                    if retries >= self.config.max_retries {
                        return (
                            Err(EngineError::StepRetryExhausted {
                                step: step_name.to_owned(),
                                message,
                            }),
                            attempts,
                        );
                    }

                    let delay = self.config.retry_base_delay * 2u32.saturating_pow(retries);
                    warn!(
                        "step '{}' retryable error (retry {}/{}), retrying in {:?}: {}",
                        step_name,
                        retries + 1,
                        self.config.max_retries,
                        delay,
                        message
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            return (Err(EngineError::StepCancelled(step_name.to_owned())), attempts);
                        }
                    }
                }
            }
        }
    }
}
