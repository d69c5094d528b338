//! Job tracking.
//!
//! Every accepted run gets a [`JobRecord`] here.  The executor is the only
//! writer; callers observe progress by polling [`JobTracker::get`] or by
//! subscribing to [`JobEvent`]s.
//!
//! Job state machine:
//!
//! ```text
//! Accepted → Running → { Succeeded | Failed | PartiallyFailed | Cancelled }
//! ```
//!
//! Terminal states are final and job ids are never reused.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::sequence::OrderToken;
use crate::Step;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Accepted,
    Running,
    Succeeded,
    Failed,
    PartiallyFailed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::PartiallyFailed | Self::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Accepted, Self::Running)
                | (
                    Self::Running,
                    Self::Succeeded | Self::Failed | Self::PartiallyFailed | Self::Cancelled
                )
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted        => write!(f, "accepted"),
            Self::Running         => write!(f, "running"),
            Self::Succeeded       => write!(f, "succeeded"),
            Self::Failed          => write!(f, "failed"),
            Self::PartiallyFailed => write!(f, "partially_failed"),
            Self::Cancelled       => write!(f, "cancelled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted"         => Ok(Self::Accepted),
            "running"          => Ok(Self::Running),
            "succeeded"        => Ok(Self::Succeeded),
            "failed"           => Ok(Self::Failed),
            "partially_failed" => Ok(Self::PartiallyFailed),
            "cancelled"        => Ok(Self::Cancelled),
            other              => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Status of one step within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// What happened to one step of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub order: String,
    pub step_name: String,
    /// `name-type` display id.
    pub step_id: String,
    pub status: StepRunStatus,
    pub attempts: u32,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Snapshot of a job as seen through the status channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub flow_name: String,
    pub status: JobStatus,
    /// Dispatched steps in execution order.
    pub steps: Vec<StepOutcome>,
    /// First step that failed, if any.
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn outcome(&self, step_name: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|outcome| outcome.step_name == step_name)
    }

    fn outcome_mut(&mut self, step_name: &str) -> Option<&mut StepOutcome> {
        self.steps.iter_mut().find(|outcome| outcome.step_name == step_name)
    }
}

/// Progress notifications, broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    JobAccepted { job_id: String, flow_name: String },
    JobStarted { job_id: String },
    StepStarted { job_id: String, step_name: String },
    StepSucceeded { job_id: String, step_name: String },
    StepFailed { job_id: String, step_name: String, error: String },
    StepSkipped { job_id: String, step_name: String },
    JobFinished { job_id: String, status: JobStatus },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::JobAccepted { job_id, .. }
            | Self::JobStarted { job_id }
            | Self::StepStarted { job_id, .. }
            | Self::StepSucceeded { job_id, .. }
            | Self::StepFailed { job_id, .. }
            | Self::StepSkipped { job_id, .. }
            | Self::JobFinished { job_id, .. } => job_id,
        }
    }
}

// ---------------------------------------------------------------------------
// JobTracker
// ---------------------------------------------------------------------------

struct TrackedJob {
    record: JobRecord,
    cancel: CancellationToken,
}

/// In-process job-status channel shared by the executor and its callers.
pub struct JobTracker {
    jobs: RwLock<HashMap<String, TrackedJob>>,
    events: broadcast::Sender<JobEvent>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self::with_event_buffer(256)
    }

    /// `buffer` bounds how far a slow subscriber may lag before it starts
    /// missing events.
    pub fn with_event_buffer(buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        Self {
            jobs: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.read().await.get(job_id).map(|job| job.record.clone())
    }

    /// Every known job, oldest first.
    pub async fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .jobs
            .read()
            .await
            .values()
            .map(|job| job.record.clone())
            .collect();
        records.sort_by_key(|record| record.created_at);
        records
    }

    /// Resolve once the job reaches a terminal state. `None` for unknown ids.
    pub async fn wait(&self, job_id: &str) -> Option<JobRecord> {
        // Subscribe before reading so a transition in between is not missed.
        let mut events = self.subscribe();
        loop {
            let record = self.get(job_id).await?;
            if record.status.is_terminal() {
                return Some(record);
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return self.get(job_id).await,
            }
        }
    }

    /// Ask a job to stop at its next checkpoint.
    ///
    /// Returns `false` for unknown or already finished jobs.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let jobs = self.jobs.read().await;
        match jobs.get(job_id) {
            Some(job) if !job.record.status.is_terminal() => {
                job.cancel.cancel();
                info!(job_id, "job cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Drop terminal jobs that finished before `before`. Returns how many were removed.
    pub async fn prune_finished(&self, before: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write().await;
        let initial = jobs.len();
        jobs.retain(|_, job| {
            !(job.record.status.is_terminal()
                && job.record.finished_at.map_or(false, |at| at < before))
        });
        initial - jobs.len()
    }

    // -----------------------------------------------------------------------
    // Executor-side updates
    // -----------------------------------------------------------------------

    /// Register a new job in `Accepted` with every planned step `Pending`.
    pub(crate) async fn accept(
        &self,
        flow_name: &str,
        plan: &[(OrderToken, Step)],
    ) -> (String, CancellationToken) {
        let job_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        let record = JobRecord {
            job_id: job_id.clone(),
            flow_name: flow_name.to_owned(),
            status: JobStatus::Accepted,
            steps: plan
                .iter()
                .map(|(token, step)| StepOutcome {
                    order: token.to_string(),
                    step_name: step.name.clone(),
                    step_id: step.id(),
                    status: StepRunStatus::Pending,
                    attempts: 0,
                    output: None,
                    error: None,
                    started_at: None,
                    finished_at: None,
                })
                .collect(),
            failed_step: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        self.jobs.write().await.insert(
            job_id.clone(),
            TrackedJob {
                record,
                cancel: cancel.clone(),
            },
        );
        self.emit(JobEvent::JobAccepted {
            job_id: job_id.clone(),
            flow_name: flow_name.to_owned(),
        });
        (job_id, cancel)
    }

    pub(crate) async fn start(&self, job_id: &str) {
        let moved = self
            .update(job_id, |record| {
                if transition(record, JobStatus::Running) {
                    record.started_at = Some(Utc::now());
                    true
                } else {
                    false
                }
            })
            .await;
        if moved == Some(true) {
            self.emit(JobEvent::JobStarted { job_id: job_id.to_owned() });
        }
    }

    pub(crate) async fn step_started(&self, job_id: &str, step_name: &str) {
        self.update(job_id, |record| {
            if let Some(outcome) = record.outcome_mut(step_name) {
                outcome.status = StepRunStatus::Running;
                outcome.started_at = Some(Utc::now());
            }
        })
        .await;
        self.emit(JobEvent::StepStarted {
            job_id: job_id.to_owned(),
            step_name: step_name.to_owned(),
        });
    }

    pub(crate) async fn step_succeeded(&self, job_id: &str, step_name: &str, output: Value, attempts: u32) {
        self.update(job_id, |record| {
            if let Some(outcome) = record.outcome_mut(step_name) {
                outcome.status = StepRunStatus::Succeeded;
                outcome.attempts = attempts;
                outcome.output = Some(output);
                outcome.finished_at = Some(Utc::now());
            }
        })
        .await;
        self.emit(JobEvent::StepSucceeded {
            job_id: job_id.to_owned(),
            step_name: step_name.to_owned(),
        });
    }

    pub(crate) async fn step_failed(
        &self,
        job_id: &str,
        step_name: &str,
        status: StepRunStatus,
        error: String,
        attempts: u32,
    ) {
        self.update(job_id, |record| {
            if let Some(outcome) = record.outcome_mut(step_name) {
                outcome.status = status;
                outcome.attempts = attempts;
                outcome.error = Some(error.clone());
                outcome.finished_at = Some(Utc::now());
            }
        })
        .await;
        self.emit(JobEvent::StepFailed {
            job_id: job_id.to_owned(),
            step_name: step_name.to_owned(),
            error,
        });
    }

    pub(crate) async fn step_skipped(&self, job_id: &str, step_name: &str) {
        self.update(job_id, |record| {
            if let Some(outcome) = record.outcome_mut(step_name) {
                outcome.status = StepRunStatus::Skipped;
            }
        })
        .await;
        self.emit(JobEvent::StepSkipped {
            job_id: job_id.to_owned(),
            step_name: step_name.to_owned(),
        });
    }

    pub(crate) async fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        failed_step: Option<String>,
        error: Option<String>,
    ) {
        let moved = self
            .update(job_id, |record| {
                if transition(record, status) {
                    record.failed_step = failed_step;
                    record.error = error;
                    record.finished_at = Some(Utc::now());
                    true
                } else {
                    false
                }
            })
            .await;
        if moved == Some(true) {
            info!(job_id, %status, "job finished");
            self.emit(JobEvent::JobFinished {
                job_id: job_id.to_owned(),
                status,
            });
        }
    }

    /// Close out a job whose task died before finishing it.
    ///
    /// The step that was running fails with `error`, pending steps are
    /// skipped and the job ends `Failed`.  A finished job is left alone.
    pub(crate) async fn abandon(&self, job_id: &str, error: String) {
        let changed = self
            .update(job_id, |record| {
                if record.status.is_terminal() {
                    return None;
                }
                let mut failed = Vec::new();
                let mut skipped = Vec::new();
                for outcome in &mut record.steps {
                    match outcome.status {
                        StepRunStatus::Running => {
                            outcome.status = StepRunStatus::Failed;
                            outcome.error = Some(error.clone());
                            outcome.finished_at = Some(Utc::now());
                            failed.push(outcome.step_name.clone());
                        }
                        StepRunStatus::Pending => {
                            outcome.status = StepRunStatus::Skipped;
                            skipped.push(outcome.step_name.clone());
                        }
                        _ => {}
                    }
                }
                let first_failed = record
                    .steps
                    .iter()
                    .find(|outcome| outcome.status == StepRunStatus::Failed)
                    .map(|outcome| outcome.step_name.clone());
                Some((failed, skipped, first_failed))
            })
            .await
            .flatten();

        let Some((failed, skipped, first_failed)) = changed else {
            return;
        };
        for step_name in failed {
            self.emit(JobEvent::StepFailed {
                job_id: job_id.to_owned(),
                step_name,
                error: error.clone(),
            });
        }
        for step_name in skipped {
            self.emit(JobEvent::StepSkipped {
                job_id: job_id.to_owned(),
                step_name,
            });
        }
        warn!(job_id, error = %error, "job abandoned");
        self.finish(job_id, JobStatus::Failed, first_failed, Some(error)).await;
    }

    async fn update<T>(&self, job_id: &str, f: impl FnOnce(&mut JobRecord) -> T) -> Option<T> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(job_id)?;
        Some(f(&mut job.record))
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn transition(record: &mut JobRecord, next: JobStatus) -> bool {
    if record.status.can_transition_to(next) {
        record.status = next;
        true
    } else {
        warn!(
            job_id = %record.job_id,
            from = %record.status,
            to = %next,
            "ignoring invalid job state transition"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StepType;

    fn plan(names: &[&str]) -> Vec<(OrderToken, Step)> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                (
                    OrderToken::new((i + 1).to_string()).unwrap(),
                    Step::new(*name, StepType::Custom),
                )
            })
            .collect()
    }

    #[test]
    fn state_machine_only_moves_forward() {
        use JobStatus::*;
        assert!(Accepted.can_transition_to(Running));
        assert!(Running.can_transition_to(PartiallyFailed));
        assert!(!Accepted.can_transition_to(Succeeded));
        assert!(!Running.can_transition_to(Accepted));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Succeeded));
    }

    #[test]
    fn status_round_trips_through_its_text_form() {
        assert_eq!("partially_failed".parse::<JobStatus>().unwrap(), JobStatus::PartiallyFailed);
        assert_eq!(JobStatus::Cancelled.to_string(), "cancelled");
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[tokio::test]
    async fn accepted_job_is_visible_with_pending_steps() {
        let tracker = JobTracker::new();
        let (job_id, _) = tracker.accept("f", &plan(&["a", "b"])).await;

        let record = tracker.get(&job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Accepted);
        assert_eq!(record.steps.len(), 2);
        assert!(record.steps.iter().all(|s| s.status == StepRunStatus::Pending));
        assert_eq!(record.outcome("b").unwrap().step_id, "b-CUSTOM");
    }

    #[tokio::test]
    async fn terminal_state_is_final() {
        let tracker = JobTracker::new();
        let (job_id, _) = tracker.accept("f", &plan(&["a"])).await;

        // Cannot finish a job that never started.
        tracker.finish(&job_id, JobStatus::Succeeded, None, None).await;
        assert_eq!(tracker.get(&job_id).await.unwrap().status, JobStatus::Accepted);

        tracker.start(&job_id).await;
        tracker.finish(&job_id, JobStatus::Failed, Some("a".into()), Some("boom".into())).await;
        tracker.finish(&job_id, JobStatus::Succeeded, None, None).await;

        let record = tracker.get(&job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.failed_step.as_deref(), Some("a"));
        assert!(!tracker.cancel(&job_id).await);
    }

    #[tokio::test]
    async fn wait_resolves_on_terminal_state() {
        let tracker = std::sync::Arc::new(JobTracker::new());
        let (job_id, _) = tracker.accept("f", &plan(&["a"])).await;

        let waiter = {
            let tracker = tracker.clone();
            let job_id = job_id.clone();
            tokio::spawn(async move { tracker.wait(&job_id).await })
        };

        tracker.start(&job_id).await;
        tracker.finish(&job_id, JobStatus::Succeeded, None, None).await;

        let record = waiter.await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Succeeded);
        assert!(tracker.wait("unknown").await.is_none());
    }

    #[tokio::test]
    async fn events_are_broadcast_in_order() {
        let tracker = JobTracker::new();
        let mut events = tracker.subscribe();
        let (job_id, _) = tracker.accept("f", &plan(&["a"])).await;
        tracker.start(&job_id).await;

        assert!(matches!(events.recv().await.unwrap(), JobEvent::JobAccepted { .. }));
        let started = events.recv().await.unwrap();
        assert!(matches!(started, JobEvent::JobStarted { .. }));
        assert_eq!(started.job_id(), job_id);
    }

    #[tokio::test]
    async fn abandoned_job_fails_its_running_step() {
        let tracker = JobTracker::new();
        let (job_id, _) = tracker.accept("f", &plan(&["a", "b", "c"])).await;
        tracker.start(&job_id).await;
        tracker.step_succeeded(&job_id, "a", Value::Null, 1).await;
        tracker.step_started(&job_id, "b").await;

        tracker.abandon(&job_id, "task died".into()).await;

        let record = tracker.get(&job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.failed_step.as_deref(), Some("b"));
        assert_eq!(record.outcome("a").unwrap().status, StepRunStatus::Succeeded);
        assert_eq!(record.outcome("b").unwrap().error.as_deref(), Some("task died"));
        assert_eq!(record.outcome("c").unwrap().status, StepRunStatus::Skipped);

        // A finished job is not touched again.
        tracker.abandon(&job_id, "again".into()).await;
        assert_eq!(tracker.get(&job_id).await.unwrap().error.as_deref(), Some("task died"));
    }

    #[tokio::test]
    async fn prune_drops_only_finished_jobs() {
        let tracker = JobTracker::new();
        let (done, _) = tracker.accept("f", &plan(&["a"])).await;
        let (active, _) = tracker.accept("f", &plan(&["a"])).await;
        tracker.start(&done).await;
        tracker.finish(&done, JobStatus::Succeeded, None, None).await;

        let removed = tracker.prune_finished(Utc::now() + chrono::Duration::seconds(1)).await;
        assert_eq!(removed, 1);
        assert!(tracker.get(&done).await.is_none());
        assert!(tracker.get(&active).await.is_some());
    }
}
