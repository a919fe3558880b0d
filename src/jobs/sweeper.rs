//! Expiration sweeper. Deletes jobs whose destruction time has passed.
//!
//! One pass walks the expired jobs in `(destruction_time, id)` order, one
//! bounded batch at a time, and deletes each through the store. A job that
//! fails to delete is logged and skipped; the keyset cursor moves past it,
//! so it is retried on the next pass rather than blocking this one.
//! Overlapping passes are harmless: deleting a job twice is a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::{JobEvent, JobEvents, JobOperation};
use super::service::bounded;
use crate::config::StoreConfig;
use crate::error::JobError;
use crate::store::traits::{ExpiredCursor, JobStore};

/// Counters for one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired jobs found.
    pub examined: usize,
    /// Jobs this pass actually removed.
    pub deleted: usize,
    /// Jobs whose deletion failed and were skipped.
    pub failed: usize,
}

pub struct ExpirationSweeper {
    store: Arc<dyn JobStore>,
    events: Option<JobEvents>,
    batch_size: usize,
    operation_timeout: Duration,
}

impl ExpirationSweeper {
    pub fn new(store: Arc<dyn JobStore>, config: &StoreConfig) -> Self {
        Self {
            store,
            events: None,
            batch_size: config.sweep_batch_size.max(1),
            operation_timeout: config.operation_timeout,
        }
    }

    /// Builder: publish an `Expire` event for each deleted job.
    pub fn with_events(mut self, events: JobEvents) -> Self {
        self.events = Some(events);
        self
    }

    /// Run one pass over jobs expired at `now`.
    ///
    /// Only a failure to list candidates aborts the pass.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport, JobError> {
        let mut report = SweepReport::default();
        let mut cursor: Option<ExpiredCursor> = None;

        loop {
            let batch = bounded(
                self.operation_timeout,
                self.store.list_expired(now, cursor, self.batch_size),
            )
            .await?;
            if batch.is_empty() {
                break;
            }

            for job in &batch {
                report.examined += 1;
                match bounded(self.operation_timeout, self.store.delete(job.id)).await {
                    Ok(true) => {
                        report.deleted += 1;
                        debug!(
                            job_id = %job.id,
                            service = %job.service,
                            owner = %job.owner,
                            destruction_time = %job.destruction_time,
                            "Expired job deleted"
                        );
                        if let Some(events) = &self.events {
                            events.publish(JobEvent::removed(
                                JobOperation::Expire,
                                job.id,
                                &job.service,
                                &job.owner,
                                job.phase,
                            ));
                        }
                    }
                    // Someone else got there first.
                    Ok(false) => {}
                    Err(e) => {
                        report.failed += 1;
                        warn!(job_id = %job.id, error = %e, "Failed to delete expired job, skipping");
                    }
                }
            }

            let full = batch.len() == self.batch_size;
            cursor = batch.last().map(ExpiredCursor::from);
            if !full {
                break;
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                deleted = report.deleted,
                failed = report.failed,
                "Expiration sweep finished"
            );
        }
        Ok(report)
    }
}

/// Spawn the recurring sweep. The first pass runs immediately.
pub fn spawn_sweep_task(sweeper: Arc<ExpirationSweeper>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Expiration sweeper started (interval: {}s)", interval.as_secs());

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            if let Err(e) = sweeper.run_once(Utc::now()).await {
                warn!(error = %e, "Expiration sweep aborted");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    use super::*;
    use crate::error::DatabaseError;
    use crate::jobs::filter::{JobFilter, JobPage, PageToken};
    use crate::jobs::model::{ErrorSummary, Job, JobCreate, JobParameter, JobResult, NewJob};
    use crate::jobs::phase::ExecutionPhase;
    use crate::store::LibSqlBackend;
    use crate::store::migrations::SchemaStatus;
    use crate::store::traits::{ExpiredJob, PhaseTransition};

    /// Delegates to a real backend, but deleting `broken` always fails.
    struct BrokenDelete {
        inner: LibSqlBackend,
        broken: Uuid,
    }

    #[async_trait]
    impl JobStore for BrokenDelete {
        async fn run_migrations(&self) -> Result<(), DatabaseError> {
            self.inner.run_migrations().await
        }
        async fn schema_status(&self) -> Result<SchemaStatus, DatabaseError> {
            self.inner.schema_status().await
        }
        async fn ping(&self) -> Result<(), DatabaseError> {
            self.inner.ping().await
        }
        async fn create(&self, job: NewJob) -> Result<Job, JobError> {
            self.inner.create(job).await
        }
        async fn get(&self, id: Uuid, include_expired: bool) -> Result<Job, JobError> {
            self.inner.get(id, include_expired).await
        }
        async fn list(
            &self,
            filter: &JobFilter,
            page: Option<&PageToken>,
        ) -> Result<JobPage, JobError> {
            self.inner.list(filter, page).await
        }
        async fn list_services(&self) -> Result<Vec<String>, JobError> {
            self.inner.list_services().await
        }
        async fn list_users(&self, service: Option<&str>) -> Result<Vec<String>, JobError> {
            self.inner.list_users(service).await
        }
        async fn list_expired(
            &self,
            now: DateTime<Utc>,
            after: Option<ExpiredCursor>,
            limit: usize,
        ) -> Result<Vec<ExpiredJob>, JobError> {
            self.inner.list_expired(now, after, limit).await
        }
        async fn update_phase(
            &self,
            id: Uuid,
            expected: Option<ExecutionPhase>,
            new_phase: ExecutionPhase,
            occurred_at: DateTime<Utc>,
        ) -> Result<PhaseTransition, JobError> {
            self.inner.update_phase(id, expected, new_phase, occurred_at).await
        }
        async fn queue(
            &self,
            id: Uuid,
            expected: Option<ExecutionPhase>,
            message_id: Option<String>,
            occurred_at: DateTime<Utc>,
        ) -> Result<PhaseTransition, JobError> {
            self.inner.queue(id, expected, message_id, occurred_at).await
        }
        async fn complete(
            &self,
            id: Uuid,
            expected: Option<ExecutionPhase>,
            results: Vec<JobResult>,
            occurred_at: DateTime<Utc>,
        ) -> Result<PhaseTransition, JobError> {
            self.inner.complete(id, expected, results, occurred_at).await
        }
        async fn fail(
            &self,
            id: Uuid,
            expected: Option<ExecutionPhase>,
            error: ErrorSummary,
            occurred_at: DateTime<Utc>,
        ) -> Result<PhaseTransition, JobError> {
            self.inner.fail(id, expected, error, occurred_at).await
        }
        async fn append_result(&self, id: Uuid, result: JobResult) -> Result<Job, JobError> {
            self.inner.append_result(id, result).await
        }
        async fn set_error(&self, id: Uuid, error: ErrorSummary) -> Result<Job, JobError> {
            self.inner.set_error(id, error).await
        }
        async fn update_parameters(
            &self,
            id: Uuid,
            parameters: Vec<JobParameter>,
        ) -> Result<Job, JobError> {
            self.inner.update_parameters(id, parameters).await
        }
        async fn set_destruction_time(
            &self,
            id: Uuid,
            destruction_time: Option<DateTime<Utc>>,
        ) -> Result<Job, JobError> {
            self.inner.set_destruction_time(id, destruction_time).await
        }
        async fn set_execution_duration(
            &self,
            id: Uuid,
            execution_duration: Option<u64>,
        ) -> Result<Job, JobError> {
            self.inner.set_execution_duration(id, execution_duration).await
        }
        async fn set_quote(
            &self,
            id: Uuid,
            quote: Option<DateTime<Utc>>,
        ) -> Result<Job, JobError> {
            self.inner.set_quote(id, quote).await
        }
        async fn delete(&self, id: Uuid) -> Result<bool, JobError> {
            if id == self.broken {
                return Err(DatabaseError::Query("disk I/O error".into()).into());
            }
            self.inner.delete(id).await
        }
    }

    async fn seeded(expired: usize, live: usize) -> Arc<dyn JobStore> {
        let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let now = Utc::now();
        for i in 0..expired + live {
            let job = JobCreate::new(vec![JobParameter::new("n", i.to_string())])
                .into_new_job("cutout", "alice", now, Some(ChronoDuration::days(1)))
                .unwrap();
            let job = store.create(job).await.unwrap();
            if i < expired {
                store
                    .set_destruction_time(job.id, Some(now - ChronoDuration::minutes(1)))
                    .await
                    .unwrap();
            }
        }
        store
    }

    fn small_batches() -> StoreConfig {
        StoreConfig {
            sweep_batch_size: 2,
            ..StoreConfig::default()
        }
    }

    #[tokio::test]
    async fn sweep_deletes_only_expired() {
        let store = seeded(5, 2).await;
        let sweeper = ExpirationSweeper::new(Arc::clone(&store), &small_batches());

        let report = sweeper.run_once(Utc::now()).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                examined: 5,
                deleted: 5,
                failed: 0
            }
        );

        let remaining = store
            .list(&crate::jobs::filter::JobFilter::new().include_expired(true), None)
            .await
            .unwrap();
        assert_eq!(remaining.jobs.len(), 2);
    }

    #[tokio::test]
    async fn second_sweep_is_a_no_op() {
        let store = seeded(3, 1).await;
        let sweeper = ExpirationSweeper::new(store, &small_batches());
        let now = Utc::now();

        assert_eq!(sweeper.run_once(now).await.unwrap().deleted, 3);
        assert_eq!(sweeper.run_once(now).await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn failed_delete_is_skipped_and_retried() {
        let inner = LibSqlBackend::new_memory().await.unwrap();
        let now = Utc::now();
        let mut expired = Vec::new();
        for i in 0..5 {
            let job = JobCreate::new(vec![JobParameter::new("n", i.to_string())])
                .into_new_job("cutout", "alice", now, Some(ChronoDuration::days(1)))
                .unwrap();
            let job = inner.create(job).await.unwrap();
            inner
                .set_destruction_time(job.id, Some(now - ChronoDuration::minutes(5 - i)))
                .await
                .unwrap();
            expired.push(job.id);
        }
        // First job of the second batch.
        let broken = expired[2];
        let store: Arc<dyn JobStore> = Arc::new(BrokenDelete { inner, broken });
        let sweeper = ExpirationSweeper::new(Arc::clone(&store), &small_batches());

        let report = sweeper.run_once(now).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                examined: 5,
                deleted: 4,
                failed: 1
            }
        );
        for id in &expired {
            let found = store.get(*id, true).await;
            if *id == broken {
                assert!(found.is_ok(), "the failed job must survive for the next pass");
            } else {
                assert!(matches!(found, Err(JobError::NotFound { .. })));
            }
        }

        let retry = sweeper.run_once(now).await.unwrap();
        assert_eq!(retry.examined, 1);
        assert_eq!(retry.failed, 1);
    }

    #[tokio::test]
    async fn sweep_publishes_expire_events() {
        let store = seeded(1, 0).await;
        let events = JobEvents::default();
        let mut rx = events.subscribe();
        let sweeper = ExpirationSweeper::new(store, &StoreConfig::default()).with_events(events);

        sweeper.run_once(Utc::now()).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.operation, JobOperation::Expire);
        assert_eq!(event.owner, "alice");
    }
}
