//! Per-mutation job events for telemetry consumers.
//!
//! Every mutation, successful or not, produces one `JobEvent`. Events are
//! logged through `tracing` and fanned out on a broadcast channel; nothing
//! blocks when no subscriber is listening.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::lifecycle::Caller;
use super::model::Job;
use super::phase::ExecutionPhase;
use crate::error::{ErrorKind, JobError};

/// Which mutation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOperation {
    Create,
    UpdatePhase,
    Queue,
    Complete,
    Fail,
    AppendResult,
    SetError,
    UpdateParameters,
    SetDestructionTime,
    SetExecutionDuration,
    SetQuote,
    Delete,
    /// Deletion by the expiration sweeper.
    Expire,
}

impl JobOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::UpdatePhase => "update_phase",
            Self::Queue => "queue",
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::AppendResult => "append_result",
            Self::SetError => "set_error",
            Self::UpdateParameters => "update_parameters",
            Self::SetDestructionTime => "set_destruction_time",
            Self::SetExecutionDuration => "set_execution_duration",
            Self::SetQuote => "set_quote",
            Self::Delete => "delete",
            Self::Expire => "expire",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EventOutcome {
    Success,
    Failure { kind: ErrorKind },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub operation: JobOperation,
    /// Absent only when creation failed before an id was assigned.
    pub job_id: Option<Uuid>,
    pub service: String,
    /// The job's owner, or the calling user when the job could not be loaded.
    pub owner: String,
    pub old_phase: Option<ExecutionPhase>,
    pub new_phase: Option<ExecutionPhase>,
    pub outcome: EventOutcome,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    /// A mutation that left `job` in its current state.
    pub fn succeeded(operation: JobOperation, job: &Job, old_phase: Option<ExecutionPhase>) -> Self {
        Self {
            operation,
            job_id: Some(job.id),
            service: job.service.clone(),
            owner: job.owner.clone(),
            old_phase,
            new_phase: Some(job.phase),
            outcome: EventOutcome::Success,
            at: Utc::now(),
        }
    }

    /// A job removed from storage while in `phase`.
    pub fn removed(
        operation: JobOperation,
        id: Uuid,
        service: &str,
        owner: &str,
        phase: ExecutionPhase,
    ) -> Self {
        Self {
            operation,
            job_id: Some(id),
            service: service.to_string(),
            owner: owner.to_string(),
            old_phase: Some(phase),
            new_phase: None,
            outcome: EventOutcome::Success,
            at: Utc::now(),
        }
    }

    /// A rejected or failed mutation. `snapshot` is the job as loaded
    /// before the attempt, when it could be loaded.
    pub fn failed(
        operation: JobOperation,
        id: Option<Uuid>,
        caller: &Caller,
        snapshot: Option<&Job>,
        error: &JobError,
    ) -> Self {
        let (service, owner, old_phase) = match snapshot {
            Some(job) => (job.service.clone(), job.owner.clone(), Some(job.phase)),
            None => (caller.service.clone(), caller.user.clone(), None),
        };
        Self {
            operation,
            job_id: id,
            service,
            owner,
            old_phase,
            new_phase: None,
            outcome: EventOutcome::Failure { kind: error.kind() },
            at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, EventOutcome::Success)
    }
}

/// Broadcast publisher for job events.
#[derive(Clone)]
pub struct JobEvents {
    tx: broadcast::Sender<JobEvent>,
}

impl JobEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: JobEvent) {
        let job_id = event.job_id.map(|id| id.to_string()).unwrap_or_default();
        match event.outcome {
            EventOutcome::Success => info!(
                operation = event.operation.as_str(),
                job_id = %job_id,
                service = %event.service,
                owner = %event.owner,
                old_phase = ?event.old_phase,
                new_phase = ?event.new_phase,
                "Job mutation applied"
            ),
            EventOutcome::Failure { kind } if kind.is_retryable() => warn!(
                operation = event.operation.as_str(),
                job_id = %job_id,
                service = %event.service,
                owner = %event.owner,
                kind = %kind,
                "Job mutation failed"
            ),
            EventOutcome::Failure { kind } => debug!(
                operation = event.operation.as_str(),
                job_id = %job_id,
                service = %event.service,
                owner = %event.owner,
                kind = %kind,
                "Job mutation rejected"
            ),
        }
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for JobEvents {
    fn default() -> Self {
        Self::new(256)
    }
}
