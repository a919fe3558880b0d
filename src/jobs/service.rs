//! `JobService`, the operation set exposed to request layers.
//!
//! Each operation loads the job, lets the `LifecycleController` judge the
//! caller and the job's phase, then delegates to the store. The whole
//! sequence runs under the configured operation timeout, and every mutation
//! publishes a `JobEvent` whatever its outcome.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::events::{JobEvent, JobEvents, JobOperation};
use super::filter::{JobFilter, JobPage, PageToken};
use super::lifecycle::{Caller, LifecycleController};
use super::model::{ErrorSummary, Job, JobCreate, JobParameter, JobResult};
use super::phase::{ExecutionPhase, JobField};
use crate::config::StoreConfig;
use crate::error::{DatabaseError, JobError};
use crate::store::traits::{JobStore, PhaseTransition};

/// Run `fut`, failing with `StorageUnavailable` once `timeout` elapses.
pub(crate) async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, JobError>
where
    F: Future<Output = Result<T, JobError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(JobError::StorageUnavailable(DatabaseError::Timeout(timeout))),
    }
}

pub struct JobService {
    store: Arc<dyn JobStore>,
    controller: LifecycleController,
    events: JobEvents,
    operation_timeout: Duration,
    default_lifetime: Option<chrono::Duration>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, config: &StoreConfig) -> Self {
        Self {
            store,
            controller: LifecycleController::new(config.allow_reparameterization),
            events: JobEvents::default(),
            operation_timeout: config.operation_timeout,
            default_lifetime: config.default_lifetime,
        }
    }

    /// Builder: publish on an existing event channel.
    pub fn with_events(mut self, events: JobEvents) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &JobEvents {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Fetch a job the caller may see. Expired jobs are `NotFound` unless
    /// `include_expired` is set.
    pub async fn get_job(
        &self,
        caller: &Caller,
        id: Uuid,
        include_expired: bool,
    ) -> Result<Job, JobError> {
        bounded(self.operation_timeout, async {
            let job = self.store.get(id, include_expired).await?;
            self.controller.authorize(caller, &job)?;
            Ok::<_, JobError>(job)
        })
        .await
    }

    /// List jobs newest first. Callers without the override only ever see
    /// their own jobs in their own service, whatever the filter says.
    pub async fn list_jobs(
        &self,
        caller: &Caller,
        mut filter: JobFilter,
        page: Option<&PageToken>,
    ) -> Result<JobPage, JobError> {
        if !caller.admin {
            filter.service = Some(caller.service.clone());
            filter.owner = Some(caller.user.clone());
        }
        bounded(self.operation_timeout, self.store.list(&filter, page)).await
    }

    pub async fn list_services(&self, caller: &Caller) -> Result<Vec<String>, JobError> {
        self.controller.authorize_admin(caller)?;
        bounded(self.operation_timeout, self.store.list_services()).await
    }

    pub async fn list_users(
        &self,
        caller: &Caller,
        service: Option<&str>,
    ) -> Result<Vec<String>, JobError> {
        self.controller.authorize_admin(caller)?;
        bounded(self.operation_timeout, self.store.list_users(service)).await
    }

    /// Administrative listing of one user's jobs in one service.
    pub async fn list_user_jobs(
        &self,
        caller: &Caller,
        service: &str,
        user: &str,
        mut filter: JobFilter,
        page: Option<&PageToken>,
    ) -> Result<JobPage, JobError> {
        self.controller.authorize_admin(caller)?;
        filter.service = Some(service.to_string());
        filter.owner = Some(user.to_string());
        bounded(self.operation_timeout, self.store.list(&filter, page)).await
    }

    /// Round trip to the backend; `StorageUnavailable` when it is unreachable.
    pub async fn availability(&self) -> Result<(), JobError> {
        bounded(self.operation_timeout, async {
            self.store.ping().await.map_err(JobError::from)
        })
        .await
    }

    // ── Mutations ───────────────────────────────────────────────────

    /// Create a PENDING job owned by the caller.
    pub async fn create_job(&self, caller: &Caller, request: JobCreate) -> Result<Job, JobError> {
        let outcome = async {
            caller.validate()?;
            let new_job = request.into_new_job(
                &caller.service,
                &caller.user,
                Utc::now(),
                self.default_lifetime,
            )?;
            let job = bounded(self.operation_timeout, self.store.create(new_job)).await?;
            Ok::<_, JobError>((None, job))
        }
        .await;
        self.observe(JobOperation::Create, caller, None, None, outcome)
    }

    /// Move to `new_phase`. The phase time is `occurred_at`, or now.
    pub async fn update_phase(
        &self,
        caller: &Caller,
        id: Uuid,
        expected: Option<ExecutionPhase>,
        new_phase: ExecutionPhase,
        occurred_at: Option<DateTime<Utc>>,
    ) -> Result<Job, JobError> {
        self.transition(
            JobOperation::UpdatePhase,
            caller,
            id,
            expected,
            new_phase,
            occurred_at,
            |at| self.store.update_phase(id, expected, new_phase, at),
        )
        .await
    }

    /// Move to QUEUED, recording the message id the job was queued under.
    pub async fn queue_job(
        &self,
        caller: &Caller,
        id: Uuid,
        expected: Option<ExecutionPhase>,
        message_id: Option<String>,
        occurred_at: Option<DateTime<Utc>>,
    ) -> Result<Job, JobError> {
        self.transition(
            JobOperation::Queue,
            caller,
            id,
            expected,
            ExecutionPhase::Queued,
            occurred_at,
            |at| self.store.queue(id, expected, message_id, at),
        )
        .await
    }

    /// Move to COMPLETED and attach `results` in one step.
    pub async fn complete_job(
        &self,
        caller: &Caller,
        id: Uuid,
        expected: Option<ExecutionPhase>,
        results: Vec<JobResult>,
    ) -> Result<Job, JobError> {
        self.transition(
            JobOperation::Complete,
            caller,
            id,
            expected,
            ExecutionPhase::Completed,
            None,
            |at| self.store.complete(id, expected, results, at),
        )
        .await
    }

    /// Move to ERROR and record `error` in one step.
    pub async fn fail_job(
        &self,
        caller: &Caller,
        id: Uuid,
        expected: Option<ExecutionPhase>,
        error: ErrorSummary,
    ) -> Result<Job, JobError> {
        self.transition(
            JobOperation::Fail,
            caller,
            id,
            expected,
            ExecutionPhase::Error,
            None,
            |at| self.store.fail(id, expected, error, at),
        )
        .await
    }

    pub async fn append_result(
        &self,
        caller: &Caller,
        id: Uuid,
        result: JobResult,
    ) -> Result<Job, JobError> {
        self.mutate(JobOperation::AppendResult, caller, id, JobField::Results, || {
            self.store.append_result(id, result)
        })
        .await
    }

    pub async fn set_error(
        &self,
        caller: &Caller,
        id: Uuid,
        error: ErrorSummary,
    ) -> Result<Job, JobError> {
        self.mutate(JobOperation::SetError, caller, id, JobField::Error, || {
            self.store.set_error(id, error)
        })
        .await
    }

    pub async fn update_parameters(
        &self,
        caller: &Caller,
        id: Uuid,
        parameters: Vec<JobParameter>,
    ) -> Result<Job, JobError> {
        self.mutate(
            JobOperation::UpdateParameters,
            caller,
            id,
            JobField::Parameters,
            || self.store.update_parameters(id, parameters),
        )
        .await
    }

    /// Change or clear the destruction time. A past time is accepted and
    /// makes the job eligible for the next sweep.
    pub async fn set_destruction_time(
        &self,
        caller: &Caller,
        id: Uuid,
        destruction_time: Option<DateTime<Utc>>,
    ) -> Result<Job, JobError> {
        self.mutate(
            JobOperation::SetDestructionTime,
            caller,
            id,
            JobField::DestructionTime,
            || self.store.set_destruction_time(id, destruction_time),
        )
        .await
    }

    pub async fn set_execution_duration(
        &self,
        caller: &Caller,
        id: Uuid,
        execution_duration: Option<u64>,
    ) -> Result<Job, JobError> {
        self.mutate(
            JobOperation::SetExecutionDuration,
            caller,
            id,
            JobField::ExecutionDuration,
            || self.store.set_execution_duration(id, execution_duration),
        )
        .await
    }

    /// Change or clear the estimated completion time.
    pub async fn set_quote(
        &self,
        caller: &Caller,
        id: Uuid,
        quote: Option<DateTime<Utc>>,
    ) -> Result<Job, JobError> {
        self.mutate(JobOperation::SetQuote, caller, id, JobField::Quote, || {
            self.store.set_quote(id, quote)
        })
        .await
    }

    /// Delete a job and everything it owns. Expired jobs can still be
    /// deleted by their owner. Returns whether anything was removed;
    /// deleting a missing job is not an error.
    pub async fn delete_job(&self, caller: &Caller, id: Uuid) -> Result<bool, JobError> {
        let mut loaded: Option<Job> = None;
        let outcome = bounded(self.operation_timeout, async {
            let job = match self.store.get(id, true).await {
                Ok(job) => loaded.insert(job),
                Err(JobError::NotFound { .. }) => return Ok(false),
                Err(e) => return Err(e),
            };
            self.controller.authorize(caller, job)?;
            Ok::<_, JobError>(self.store.delete(id).await?)
        })
        .await;

        match (outcome, loaded) {
            (Ok(true), Some(job)) => {
                self.events.publish(JobEvent::removed(
                    JobOperation::Delete,
                    job.id,
                    &job.service,
                    &job.owner,
                    job.phase,
                ));
                Ok(true)
            }
            (Ok(_), _) => {
                debug!(job_id = %id, principal = %caller.principal(), "Delete of absent job ignored");
                Ok(false)
            }
            (Err(e), loaded) => {
                self.events.publish(JobEvent::failed(
                    JobOperation::Delete,
                    Some(id),
                    caller,
                    loaded.as_ref(),
                    &e,
                ));
                Err(e)
            }
        }
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Load, check the transition, apply it at `occurred_at` or now.
    #[allow(clippy::too_many_arguments)]
    async fn transition<F, Fut>(
        &self,
        operation: JobOperation,
        caller: &Caller,
        id: Uuid,
        expected: Option<ExecutionPhase>,
        to: ExecutionPhase,
        occurred_at: Option<DateTime<Utc>>,
        apply: F,
    ) -> Result<Job, JobError>
    where
        F: FnOnce(DateTime<Utc>) -> Fut,
        Fut: Future<Output = Result<PhaseTransition, JobError>>,
    {
        let mut loaded: Option<Job> = None;
        let outcome = bounded(self.operation_timeout, async {
            let job = loaded.insert(self.store.get(id, false).await?);
            self.controller.check_transition(caller, job, expected, to)?;
            let transition = apply(occurred_at.unwrap_or_else(Utc::now)).await?;
            Ok::<_, JobError>((Some(transition.from), transition.job))
        })
        .await;
        self.observe(operation, caller, Some(id), loaded.as_ref(), outcome)
    }

    /// Load, check that `field` may change, apply the change.
    async fn mutate<F, Fut>(
        &self,
        operation: JobOperation,
        caller: &Caller,
        id: Uuid,
        field: JobField,
        apply: F,
    ) -> Result<Job, JobError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Job, JobError>>,
    {
        let mut loaded: Option<Job> = None;
        let outcome = bounded(self.operation_timeout, async {
            let job = loaded.insert(self.store.get(id, false).await?);
            self.controller.check_mutation(caller, job, field)?;
            let old_phase = job.phase;
            let updated = apply().await?;
            Ok::<_, JobError>((Some(old_phase), updated))
        })
        .await;
        self.observe(operation, caller, Some(id), loaded.as_ref(), outcome)
    }

    fn observe(
        &self,
        operation: JobOperation,
        caller: &Caller,
        id: Option<Uuid>,
        snapshot: Option<&Job>,
        outcome: Result<(Option<ExecutionPhase>, Job), JobError>,
    ) -> Result<Job, JobError> {
        match outcome {
            Ok((old_phase, job)) => {
                self.events
                    .publish(JobEvent::succeeded(operation, &job, old_phase));
                Ok(job)
            }
            Err(e) => {
                self.events
                    .publish(JobEvent::failed(operation, id, caller, snapshot, &e));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::LibSqlBackend;

    async fn service() -> JobService {
        let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        JobService::new(store, &StoreConfig::default())
    }

    #[tokio::test]
    async fn slow_operations_time_out() {
        let err = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, JobError>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
        assert!(err.kind().is_retryable());
    }

    #[tokio::test]
    async fn create_applies_default_lifetime() {
        let svc = service().await;
        let alice = Caller::new("cutout", "alice");
        let job = svc
            .create_job(&alice, JobCreate::new(vec![JobParameter::new("id", "a")]))
            .await
            .unwrap();

        assert_eq!(job.owner, "alice");
        assert_eq!(job.service, "cutout");
        let lifetime = job.destruction_time.unwrap() - job.creation_time;
        assert_eq!(lifetime, chrono::Duration::days(30));
    }

    #[tokio::test]
    async fn past_destruction_time_rejected_at_create() {
        let svc = service().await;
        let request = JobCreate::new(Vec::new())
            .with_destruction_time(Utc::now() - chrono::Duration::minutes(1));
        let err = svc
            .create_job(&Caller::new("cutout", "alice"), request)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn events_follow_mutations() {
        let svc = service().await;
        let mut rx = svc.events().subscribe();
        let alice = Caller::new("cutout", "alice");

        let job = svc.create_job(&alice, JobCreate::default()).await.unwrap();
        let created = rx.recv().await.unwrap();
        assert_eq!(created.operation, JobOperation::Create);
        assert_eq!(created.new_phase, Some(ExecutionPhase::Pending));

        svc.update_phase(&alice, job.id, None, ExecutionPhase::Executing, None)
            .await
            .unwrap_err();
        let rejected = rx.recv().await.unwrap();
        assert!(!rejected.is_success());
        assert_eq!(rejected.job_id, Some(job.id));

        svc.update_phase(
            &alice,
            job.id,
            Some(ExecutionPhase::Pending),
            ExecutionPhase::Queued,
            None,
        )
        .await
        .unwrap();
        let moved = rx.recv().await.unwrap();
        assert_eq!(moved.old_phase, Some(ExecutionPhase::Pending));
        assert_eq!(moved.new_phase, Some(ExecutionPhase::Queued));
    }

    #[tokio::test]
    async fn admin_views_need_override() {
        let svc = service().await;
        let alice = Caller::new("cutout", "alice");
        svc.create_job(&alice, JobCreate::default()).await.unwrap();

        let err = svc.list_services(&alice).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let admin = Caller::new("ops", "root").with_admin(true);
        assert_eq!(svc.list_services(&admin).await.unwrap(), ["cutout"]);
        assert_eq!(svc.list_users(&admin, Some("cutout")).await.unwrap(), ["alice"]);
    }

    #[tokio::test]
    async fn user_job_listing_needs_override() {
        let svc = service().await;
        let alice = Caller::new("cutout", "alice");
        let job = svc.create_job(&alice, JobCreate::default()).await.unwrap();
        svc.create_job(&Caller::new("cutout", "bob"), JobCreate::default())
            .await
            .unwrap();

        let err = svc
            .list_user_jobs(&alice, "cutout", "alice", JobFilter::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let admin = Caller::new("ops", "root").with_admin(true);
        let page = svc
            .list_user_jobs(&admin, "cutout", "alice", JobFilter::default(), None)
            .await
            .unwrap();
        let ids: Vec<Uuid> = page.jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, [job.id]);
    }

    #[tokio::test]
    async fn rejected_mutation_reports_the_stored_job() {
        let svc = service().await;
        let alice = Caller::new("cutout", "alice");
        let job = svc.create_job(&alice, JobCreate::default()).await.unwrap();
        let mut rx = svc.events().subscribe();

        let bob = Caller::new("cutout", "bob");
        let err = svc
            .update_phase(&bob, job.id, None, ExecutionPhase::Queued, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let event = rx.recv().await.unwrap();
        assert!(!event.is_success());
        assert_eq!(event.owner, "alice");
        assert_eq!(event.old_phase, Some(ExecutionPhase::Pending));

        svc.set_quote(&bob, job.id, None).await.unwrap_err();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.operation, JobOperation::SetQuote);
        assert_eq!(event.owner, "alice");

        svc.delete_job(&bob, job.id).await.unwrap_err();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.operation, JobOperation::Delete);
        assert_eq!(event.owner, "alice");
        assert_eq!(event.old_phase, Some(ExecutionPhase::Pending));

        // Unknown ids still fall back to the caller.
        svc.update_phase(&bob, Uuid::new_v4(), None, ExecutionPhase::Queued, None)
            .await
            .unwrap_err();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.owner, "bob");
        assert!(event.old_phase.is_none());
    }

    #[tokio::test]
    async fn phase_change_at_supplied_time() {
        let svc = service().await;
        let alice = Caller::new("cutout", "alice");
        let job = svc.create_job(&alice, JobCreate::default()).await.unwrap();

        let queued_at = job.creation_time + chrono::Duration::seconds(3);
        let queued = svc
            .queue_job(
                &alice,
                job.id,
                Some(ExecutionPhase::Pending),
                Some("m-1".into()),
                Some(queued_at),
            )
            .await
            .unwrap();
        assert_eq!(queued.phase_time, queued_at);
        assert_eq!(queued.message_id.as_deref(), Some("m-1"));

        let started_at = job.creation_time + chrono::Duration::seconds(9);
        let running = svc
            .update_phase(&alice, job.id, None, ExecutionPhase::Executing, Some(started_at))
            .await
            .unwrap();
        assert_eq!(running.start_time, Some(started_at));
        assert_eq!(running.phase_time, started_at);

        let quote = started_at + chrono::Duration::minutes(5);
        let quoted = svc.set_quote(&alice, job.id, Some(quote)).await.unwrap();
        assert_eq!(quoted.quote, Some(quote));
    }

    #[tokio::test]
    async fn availability_reports_ok() {
        assert!(service().await.availability().await.is_ok());
    }
}
