//! End-to-end scenarios through `JobService` against a real libSQL store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use uws_store::config::StoreConfig;
use uws_store::error::{ErrorKind, JobError};
use uws_store::jobs::{
    Caller, ErrorSummary, ErrorType, ExecutionPhase, ExpirationSweeper, JobCreate, JobFilter,
    JobParameter, JobResult, JobService,
};
use uws_store::store::{JobStore, LibSqlBackend};

async fn memory_service() -> (Arc<dyn JobStore>, JobService) {
    let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let service = JobService::new(Arc::clone(&store), &StoreConfig::default());
    (store, service)
}

fn alice() -> Caller {
    Caller::new("cutout", "alice")
}

fn bob() -> Caller {
    Caller::new("cutout", "bob")
}

fn admin() -> Caller {
    Caller::new("ops", "root").with_admin(true)
}

fn params() -> Vec<JobParameter> {
    vec![
        JobParameter::new("id", "ivo://example/1"),
        JobParameter::new("circle", "0 0 1"),
        JobParameter::new("id", "ivo://example/2"),
    ]
}

#[tokio::test]
async fn create_then_get_round_trips() {
    let (_, svc) = memory_service().await;
    let created = svc
        .create_job(&alice(), JobCreate::new(params()).with_run_id("nightly"))
        .await
        .unwrap();

    let fetched = svc.get_job(&alice(), created.id, false).await.unwrap();
    assert_eq!(fetched.owner, "alice");
    assert_eq!(fetched.phase, ExecutionPhase::Pending);
    assert_eq!(fetched.parameters, params());
    assert_eq!(fetched.run_id.as_deref(), Some("nightly"));
    assert!(fetched.results.is_empty());
    assert!(fetched.error.is_none());
}

#[tokio::test]
async fn alice_cannot_go_back_to_pending() {
    let (_, svc) = memory_service().await;
    let job = svc.create_job(&alice(), JobCreate::new(params())).await.unwrap();

    svc.update_phase(&alice(), job.id, None, ExecutionPhase::Queued, None)
        .await
        .unwrap();
    svc.update_phase(&alice(), job.id, None, ExecutionPhase::Executing, None)
        .await
        .unwrap();

    let err = svc
        .update_phase(&alice(), job.id, None, ExecutionPhase::Pending, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalTransition);

    let job = svc.get_job(&alice(), job.id, false).await.unwrap();
    assert_eq!(job.phase, ExecutionPhase::Executing);
}

#[tokio::test]
async fn other_principals_are_forbidden() {
    let (_, svc) = memory_service().await;
    let job = svc.create_job(&alice(), JobCreate::new(params())).await.unwrap();
    let id = job.id;
    let bob = bob();

    let forbidden = |result: Result<_, JobError>| {
        assert_eq!(result.map(|_| ()).unwrap_err().kind(), ErrorKind::Forbidden);
    };

    forbidden(svc.get_job(&bob, id, false).await);
    forbidden(svc.update_phase(&bob, id, None, ExecutionPhase::Queued, None).await);
    forbidden(svc.update_parameters(&bob, id, Vec::new()).await);
    forbidden(svc.set_destruction_time(&bob, id, None).await);
    forbidden(svc.set_execution_duration(&bob, id, Some(10)).await);
    forbidden(
        svc.append_result(&bob, id, JobResult::new("r", "https://example.com/r"))
            .await,
    );
    forbidden(
        svc.set_error(&bob, id, ErrorSummary::new(ErrorType::Fatal, "x", "y"))
            .await,
    );
    forbidden(svc.delete_job(&bob, id).await.map(|_| job.clone()));

    // Same user name in another service is a different principal.
    forbidden(svc.get_job(&Caller::new("tap", "alice"), id, false).await);

    // The owner's equivalent calls go through.
    svc.update_parameters(&alice(), id, params()).await.unwrap();
    svc.set_execution_duration(&alice(), id, Some(10)).await.unwrap();
    svc.update_phase(&alice(), id, None, ExecutionPhase::Queued, None)
        .await
        .unwrap();

    // And the administrative override reaches everything.
    svc.get_job(&admin(), id, false).await.unwrap();
    assert!(svc.delete_job(&admin(), id).await.unwrap());
}

#[tokio::test]
async fn listings_are_scoped_to_the_caller() {
    let (_, svc) = memory_service().await;
    svc.create_job(&alice(), JobCreate::default()).await.unwrap();
    svc.create_job(&alice(), JobCreate::default()).await.unwrap();
    svc.create_job(&bob(), JobCreate::default()).await.unwrap();

    // A filter naming someone else is overridden for normal callers.
    let page = svc
        .list_jobs(&alice(), JobFilter::new().owner("bob"), None)
        .await
        .unwrap();
    assert_eq!(page.jobs.len(), 2);
    assert!(page.jobs.iter().all(|j| j.owner == "alice"));

    let page = svc.list_jobs(&admin(), JobFilter::new(), None).await.unwrap();
    assert_eq!(page.jobs.len(), 3);
}

#[tokio::test]
async fn stale_expectation_conflicts_without_writing() {
    let (_, svc) = memory_service().await;
    let job = svc.create_job(&alice(), JobCreate::default()).await.unwrap();
    svc.update_phase(&alice(), job.id, None, ExecutionPhase::Queued, None)
        .await
        .unwrap();

    let err = svc
        .update_phase(
            &alice(),
            job.id,
            Some(ExecutionPhase::Pending),
            ExecutionPhase::Held,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(
        svc.get_job(&alice(), job.id, false).await.unwrap().phase,
        ExecutionPhase::Queued
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_callers_exactly_one_wins() {
    let tmp = tempfile::tempdir().unwrap();
    let config = StoreConfig::default();
    let backend = LibSqlBackend::new_local(&tmp.path().join("race.db"), &config)
        .await
        .unwrap();
    backend.run_migrations().await.unwrap();
    let store: Arc<dyn JobStore> = Arc::new(backend);
    let svc = Arc::new(JobService::new(store, &config));

    let job = svc.create_job(&alice(), JobCreate::default()).await.unwrap();
    svc.update_phase(&alice(), job.id, None, ExecutionPhase::Queued, None)
        .await
        .unwrap();

    // Both callers observed QUEUED.
    let seen = svc.get_job(&alice(), job.id, false).await.unwrap().phase;
    assert_eq!(seen, ExecutionPhase::Queued);

    let attempts = (0..2).map(|_| {
        let svc = Arc::clone(&svc);
        tokio::spawn(async move {
            svc.update_phase(&alice(), job.id, Some(seen), ExecutionPhase::Executing, None)
                .await
        })
    });
    let outcomes: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let wins = outcomes.iter().filter(|o| o.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|o| matches!(o, Err(e) if e.kind() == ErrorKind::Conflict))
        .count();
    assert_eq!((wins, conflicts), (1, 1));
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (_, svc) = memory_service().await;
    let job = svc.create_job(&alice(), JobCreate::new(params())).await.unwrap();

    assert!(svc.delete_job(&alice(), job.id).await.unwrap());
    assert!(!svc.delete_job(&alice(), job.id).await.unwrap());

    let err = svc.get_job(&alice(), job.id, true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn swept_jobs_disappear_and_second_sweep_is_noop() {
    let (store, svc) = memory_service().await;
    let doomed = svc.create_job(&alice(), JobCreate::new(params())).await.unwrap();
    let kept = svc.create_job(&alice(), JobCreate::new(params())).await.unwrap();

    svc.set_destruction_time(&alice(), doomed.id, Some(Utc::now() - Duration::seconds(5)))
        .await
        .unwrap();

    // Expired but not yet swept: hidden unless asked for.
    let err = svc.get_job(&alice(), doomed.id, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(svc.get_job(&alice(), doomed.id, true).await.is_ok());
    let err = svc
        .update_phase(&alice(), doomed.id, None, ExecutionPhase::Queued, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let sweeper = ExpirationSweeper::new(Arc::clone(&store), &StoreConfig::default());
    let now = Utc::now();
    let first = sweeper.run_once(now).await.unwrap();
    assert_eq!(first.deleted, 1);

    assert!(svc.get_job(&alice(), doomed.id, true).await.is_err());
    let page = svc.list_jobs(&alice(), JobFilter::new(), None).await.unwrap();
    assert_eq!(page.jobs.iter().map(|j| j.id).collect::<Vec<_>>(), [kept.id]);

    let second = sweeper.run_once(now).await.unwrap();
    assert_eq!(second.examined, 0);
    assert_eq!(second.deleted, 0);
}

#[tokio::test]
async fn completion_and_failure_are_atomic() {
    let (_, svc) = memory_service().await;
    let job = svc.create_job(&alice(), JobCreate::default()).await.unwrap();
    svc.update_phase(&alice(), job.id, None, ExecutionPhase::Queued, None)
        .await
        .unwrap();

    // A duplicate result id fails validation; the phase must not move.
    let dupes = vec![
        JobResult::new("r", "https://example.com/1"),
        JobResult::new("r", "https://example.com/2"),
    ];
    svc.update_phase(&alice(), job.id, None, ExecutionPhase::Executing, None)
        .await
        .unwrap();
    let err = svc
        .complete_job(&alice(), job.id, None, dupes)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert_eq!(
        svc.get_job(&alice(), job.id, false).await.unwrap().phase,
        ExecutionPhase::Executing
    );

    let done = svc
        .complete_job(
            &alice(),
            job.id,
            Some(ExecutionPhase::Executing),
            vec![JobResult::new("r", "https://example.com/1").with_mime_type("image/fits")],
        )
        .await
        .unwrap();
    assert_eq!(done.phase, ExecutionPhase::Completed);
    assert_eq!(done.results.len(), 1);
    assert!(done.start_time.is_some() && done.end_time.is_some());

    let other = svc.create_job(&alice(), JobCreate::default()).await.unwrap();
    svc.update_phase(&alice(), other.id, None, ExecutionPhase::Queued, None)
        .await
        .unwrap();
    let failed = svc
        .fail_job(
            &alice(),
            other.id,
            Some(ExecutionPhase::Queued),
            ErrorSummary::new(ErrorType::Transient, "no_backend", "nothing to run on"),
        )
        .await
        .unwrap();
    assert_eq!(failed.phase, ExecutionPhase::Error);
    assert_eq!(failed.error.unwrap().code, "no_backend");
}

#[tokio::test]
async fn only_admins_archive() {
    let (_, svc) = memory_service().await;
    let job = svc.create_job(&alice(), JobCreate::default()).await.unwrap();
    svc.update_phase(&alice(), job.id, None, ExecutionPhase::Aborted, None)
        .await
        .unwrap();
    svc.set_error(
        &alice(),
        job.id,
        ErrorSummary::new(ErrorType::Fatal, "aborted", "user request"),
    )
    .await
    .unwrap();

    let err = svc
        .update_phase(&alice(), job.id, None, ExecutionPhase::Archived, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let archived = svc
        .update_phase(&admin(), job.id, None, ExecutionPhase::Archived, None)
        .await
        .unwrap();
    assert_eq!(archived.phase, ExecutionPhase::Archived);
    assert!(archived.error.is_none());
}

#[tokio::test]
async fn reparameterization_is_a_deployment_switch() {
    let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let strict = JobService::new(Arc::clone(&store), &StoreConfig::default());
    let job = strict.create_job(&alice(), JobCreate::new(params())).await.unwrap();
    strict
        .update_phase(&alice(), job.id, None, ExecutionPhase::Held, None)
        .await
        .unwrap();

    let err = strict
        .update_parameters(&alice(), job.id, Vec::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalTransition);

    let lenient_config = StoreConfig {
        allow_reparameterization: true,
        ..StoreConfig::default()
    };
    let lenient_store: Arc<dyn JobStore> =
        Arc::new(LibSqlBackend::new_memory_with(&lenient_config).await.unwrap());
    let lenient = JobService::new(lenient_store, &lenient_config);
    let job = lenient.create_job(&alice(), JobCreate::new(params())).await.unwrap();
    lenient
        .update_phase(&alice(), job.id, None, ExecutionPhase::Held, None)
        .await
        .unwrap();
    let updated = lenient
        .update_parameters(&alice(), job.id, vec![JobParameter::new("id", "x")])
        .await
        .unwrap();
    assert_eq!(updated.parameters.len(), 1);
}

#[tokio::test]
async fn random_walks_respect_the_phase_table() {
    let (_, svc) = memory_service().await;
    let caller = admin();
    let mut conflicts = 0;

    for seed in [0x9E37_79B9_7F4A_7C15_u64, 42, 7_777_777] {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut job = svc.create_job(&caller, JobCreate::default()).await.unwrap();

        for _ in 0..150 {
            let target = *ExecutionPhase::ALL.choose(&mut rng).unwrap();
            let before = job.phase;
            // Now and then claim a phase the job has already left.
            let stale = rng
                .gen_bool(0.2)
                .then(|| *ExecutionPhase::ALL.choose(&mut rng).unwrap())
                .filter(|phase| *phase != before);
            let outcome = svc
                .update_phase(&caller, job.id, stale.or(Some(before)), target, None)
                .await;

            if stale.is_some() {
                let err = outcome.unwrap_err();
                assert_eq!(err.kind(), ErrorKind::Conflict, "stale {stale:?} for {before}");
                conflicts += 1;
            } else if before.can_transition_to(target) {
                job = outcome.unwrap_or_else(|e| panic!("{before} -> {target} failed: {e}"));
                assert_eq!(job.phase, target);
                assert!(job.invariants_hold());
            } else {
                let err = outcome.unwrap_err();
                assert_eq!(err.kind(), ErrorKind::IllegalTransition, "{before} -> {target}");
            }
            if job.phase == before {
                let current = svc.get_job(&caller, job.id, false).await.unwrap();
                assert_eq!(current.phase, before);
            }

            if job.phase.is_terminal() {
                job = svc.create_job(&caller, JobCreate::default()).await.unwrap();
            }
        }
    }
    assert!(conflicts > 0, "the walk never tried a stale expectation");
}
