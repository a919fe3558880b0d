//! `JobStore` trait: the durable storage contract for job records.
//!
//! Every method is atomic with respect to one job: it runs in a single
//! transaction and either commits entirely or leaves the job untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{DatabaseError, JobError};
use crate::jobs::filter::{JobFilter, JobPage, PageToken};
use crate::jobs::model::{ErrorSummary, Job, JobParameter, JobResult, NewJob};
use crate::jobs::phase::ExecutionPhase;
use crate::store::migrations::SchemaStatus;

/// Outcome of a phase change: the phase the job left and the job afterwards.
#[derive(Debug, Clone)]
pub struct PhaseTransition {
    pub from: ExecutionPhase,
    pub job: Job,
}

/// A job found past its destruction time by the sweeper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredJob {
    pub id: Uuid,
    pub service: String,
    pub owner: String,
    pub phase: ExecutionPhase,
    pub destruction_time: DateTime<Utc>,
}

/// Keyset position inside a sweep pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredCursor {
    pub destruction_time: DateTime<Utc>,
    pub id: Uuid,
}

impl From<&ExpiredJob> for ExpiredCursor {
    fn from(job: &ExpiredJob) -> Self {
        Self {
            destruction_time: job.destruction_time,
            id: job.id,
        }
    }
}

/// Backend-agnostic storage for UWS job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Apply all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Compare the applied schema version with the one this build expects.
    async fn schema_status(&self) -> Result<SchemaStatus, DatabaseError>;

    /// Cheap round trip to check the backend is reachable.
    async fn ping(&self) -> Result<(), DatabaseError>;

    // ── Reads ───────────────────────────────────────────────────────

    /// Persist a new job in PENDING with phase time equal to its creation time.
    async fn create(&self, job: NewJob) -> Result<Job, JobError>;

    /// Full snapshot of a job. Expired jobs are `NotFound` unless
    /// `include_expired` is set.
    async fn get(&self, id: Uuid, include_expired: bool) -> Result<Job, JobError>;

    /// One page of job summaries, newest first.
    async fn list(&self, filter: &JobFilter, page: Option<&PageToken>)
    -> Result<JobPage, JobError>;

    /// Distinct service names with at least one job.
    async fn list_services(&self) -> Result<Vec<String>, JobError>;

    /// Distinct owners with at least one job, optionally within one service.
    async fn list_users(&self, service: Option<&str>) -> Result<Vec<String>, JobError>;

    /// Jobs whose destruction time is at or before `now`, ordered by
    /// destruction time, strictly after `after`.
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        after: Option<ExpiredCursor>,
        limit: usize,
    ) -> Result<Vec<ExpiredJob>, JobError>;

    // ── Mutations ───────────────────────────────────────────────────

    /// Conditional phase change. Fails with `Conflict` when `expected` is
    /// given and differs from the stored phase, and with `IllegalTransition`
    /// when the table forbids the move.
    async fn update_phase(
        &self,
        id: Uuid,
        expected: Option<ExecutionPhase>,
        new_phase: ExecutionPhase,
        occurred_at: DateTime<Utc>,
    ) -> Result<PhaseTransition, JobError>;

    /// Move to QUEUED and, when given, record the queue message id in the
    /// same transaction.
    async fn queue(
        &self,
        id: Uuid,
        expected: Option<ExecutionPhase>,
        message_id: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Result<PhaseTransition, JobError>;

    /// Move to COMPLETED and attach results in one transaction.
    async fn complete(
        &self,
        id: Uuid,
        expected: Option<ExecutionPhase>,
        results: Vec<JobResult>,
        occurred_at: DateTime<Utc>,
    ) -> Result<PhaseTransition, JobError>;

    /// Move to ERROR and record the error in one transaction.
    async fn fail(
        &self,
        id: Uuid,
        expected: Option<ExecutionPhase>,
        error: ErrorSummary,
        occurred_at: DateTime<Utc>,
    ) -> Result<PhaseTransition, JobError>;

    /// Append one result to a COMPLETED job.
    async fn append_result(&self, id: Uuid, result: JobResult) -> Result<Job, JobError>;

    /// Record or replace the error of an ERROR/ABORTED job.
    async fn set_error(&self, id: Uuid, error: ErrorSummary) -> Result<Job, JobError>;

    /// Replace the parameter list.
    async fn update_parameters(
        &self,
        id: Uuid,
        parameters: Vec<JobParameter>,
    ) -> Result<Job, JobError>;

    /// Change or clear the destruction time.
    async fn set_destruction_time(
        &self,
        id: Uuid,
        destruction_time: Option<DateTime<Utc>>,
    ) -> Result<Job, JobError>;

    /// Change or clear the execution quota (seconds).
    async fn set_execution_duration(
        &self,
        id: Uuid,
        execution_duration: Option<u64>,
    ) -> Result<Job, JobError>;

    /// Change or clear the estimated completion time.
    async fn set_quote(&self, id: Uuid, quote: Option<DateTime<Utc>>) -> Result<Job, JobError>;

    /// Remove a job and everything it owns. Returns whether a row existed;
    /// deleting a missing job is not an error.
    async fn delete(&self, id: Uuid) -> Result<bool, JobError>;
}
