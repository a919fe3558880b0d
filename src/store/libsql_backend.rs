//! libSQL backend: async `JobStore` implementation.
//!
//! Every mutation runs inside one `BEGIN IMMEDIATE` transaction on a pooled
//! connection, so concurrent writers to the same job serialize and the later
//! one re-reads the committed phase before deciding.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use libsql::{Connection, Transaction, TransactionBehavior, Value, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{DatabaseError, JobError};
use crate::jobs::filter::{JobFilter, JobPage, PageToken};
use crate::jobs::model::{
    ErrorSummary, ErrorType, Job, JobParameter, JobResult, JobSummary, NewJob, validate_message_id,
    validate_parameters, validate_results, validate_storable,
};
use crate::jobs::phase::{ExecutionPhase, JobField};
use crate::store::migrations::{self, SchemaStatus};
use crate::store::pool::ConnectionPool;
use crate::store::traits::{ExpiredCursor, ExpiredJob, JobStore, PhaseTransition};

/// libSQL database backend.
pub struct LibSqlBackend {
    pool: ConnectionPool,
    allow_reparameterization: bool,
    max_page_size: usize,
}

impl LibSqlBackend {
    /// Open (or create) a local database file. Does not migrate.
    pub async fn new_local(path: &Path, config: &StoreConfig) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::with_pool(
            ConnectionPool::new(db, config.pool_size, config.operation_timeout),
            config,
        );

        {
            let conn = backend.pool.acquire().await?;
            let mut rows = conn
                .query("PRAGMA journal_mode = WAL", ())
                .await
                .map_err(|e| DatabaseError::Pool(format!("Failed to enable WAL: {e}")))?;
            rows.next()
                .await
                .map_err(|e| DatabaseError::Pool(format!("Failed to enable WAL: {e}")))?;
        }

        info!(path = %path.display(), pool_size = config.pool_size, "Database opened");
        Ok(backend)
    }

    /// Create a migrated in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        Self::new_memory_with(&StoreConfig::default()).await
    }

    /// Create a migrated in-memory database with explicit settings.
    ///
    /// Every libSQL connection to `:memory:` is a separate database, so the
    /// pool is pinned to a single connection.
    pub async fn new_memory_with(config: &StoreConfig) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::with_pool(ConnectionPool::new(db, 1, config.operation_timeout), config);
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn with_pool(pool: ConnectionPool, config: &StoreConfig) -> Self {
        Self {
            pool,
            allow_reparameterization: config.allow_reparameterization,
            max_page_size: config.max_page_size.max(1),
        }
    }

    /// Drop all tables, then migrate from scratch.
    pub async fn reset(&self) -> Result<(), DatabaseError> {
        let conn = self.pool.acquire().await?;
        migrations::reset(&conn).await?;
        migrations::run_migrations(&conn).await
    }

    /// Load the phase and fail unless `field` may change in it.
    async fn guard_field(
        &self,
        conn: &Connection,
        id: Uuid,
        field: JobField,
    ) -> Result<ExecutionPhase, JobError> {
        let state = load_phase_state(conn, id)
            .await?
            .ok_or(JobError::NotFound { id })?;
        if !state.phase.allows(field, self.allow_reparameterization) {
            return Err(JobError::IllegalMutation {
                id,
                phase: state.phase,
                field,
            });
        }
        Ok(state.phase)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp text. Fixed width, so string order is time order.
fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Drop sub-microsecond precision so stored and returned times agree.
fn normalize(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(6)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn parse_optional_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_phase(s: &str) -> Result<ExecutionPhase, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

fn parse_id(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad job id {s:?}: {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn opt_ts(t: Option<DateTime<Utc>>) -> Value {
    match t {
        Some(t) => Value::Text(fmt_ts(t)),
        None => Value::Null,
    }
}

fn opt_int(n: Option<u64>) -> Result<Value, DatabaseError> {
    match n {
        Some(n) => i64::try_from(n)
            .map(Value::Integer)
            .map_err(|_| DatabaseError::Serialization(format!("{n} does not fit a stored integer"))),
        None => Ok(Value::Null),
    }
}

/// Read a nullable non-negative integer column.
fn opt_u64(row: &libsql::Row, idx: i32, what: &str) -> Result<Option<u64>, DatabaseError> {
    row.get::<i64>(idx)
        .ok()
        .map(|n| {
            u64::try_from(n)
                .map_err(|_| DatabaseError::Serialization(format!("stored {what} is negative: {n}")))
        })
        .transpose()
}

fn query_err(context: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{context}: {e}"))
}

async fn begin(conn: &Connection, behavior: TransactionBehavior) -> Result<Transaction, DatabaseError> {
    conn.transaction_with_behavior(behavior)
        .await
        .map_err(|e| DatabaseError::Query(format!("begin transaction: {e}")))
}

/// Commit on success, roll back on failure.
async fn finish<T>(tx: Transaction, outcome: Result<T, JobError>) -> Result<T, JobError> {
    match outcome {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("commit: {e}")))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "Rollback failed");
            }
            Err(err)
        }
    }
}

/// Push a positional argument and return its placeholder.
fn bind(args: &mut Vec<Value>, value: Value) -> String {
    args.push(value);
    format!("?{}", args.len())
}

const JOB_COLUMNS: &str = "id, service, owner, run_id, phase, creation_time, phase_time, start_time, end_time, destruction_time, execution_duration, quote, message_id";

const SUMMARY_COLUMNS: &str = "id, service, owner, run_id, phase, creation_time, destruction_time";

/// Map a row selected with JOB_COLUMNS to a Job with empty collections.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Serialization(format!("job row: {e}"));
    let id: String = row.get(0).map_err(get_err)?;
    let phase: String = row.get(4).map_err(get_err)?;
    let creation: String = row.get(5).map_err(get_err)?;
    let phase_time: String = row.get(6).map_err(get_err)?;

    Ok(Job {
        id: parse_id(&id)?,
        service: row.get(1).map_err(get_err)?,
        owner: row.get(2).map_err(get_err)?,
        run_id: row.get::<String>(3).ok(),
        phase: parse_phase(&phase)?,
        parameters: Vec::new(),
        results: Vec::new(),
        error: None,
        creation_time: parse_ts(&creation)?,
        phase_time: parse_ts(&phase_time)?,
        start_time: parse_optional_ts(row.get::<String>(7).ok())?,
        end_time: parse_optional_ts(row.get::<String>(8).ok())?,
        destruction_time: parse_optional_ts(row.get::<String>(9).ok())?,
        execution_duration: opt_u64(row, 10, "execution duration")?,
        quote: parse_optional_ts(row.get::<String>(11).ok())?,
        message_id: row.get::<String>(12).ok(),
    })
}

/// Map a row selected with SUMMARY_COLUMNS to a JobSummary.
fn row_to_summary(row: &libsql::Row) -> Result<JobSummary, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Serialization(format!("job summary row: {e}"));
    let id: String = row.get(0).map_err(get_err)?;
    let phase: String = row.get(4).map_err(get_err)?;
    let creation: String = row.get(5).map_err(get_err)?;

    Ok(JobSummary {
        id: parse_id(&id)?,
        service: row.get(1).map_err(get_err)?,
        owner: row.get(2).map_err(get_err)?,
        run_id: row.get::<String>(3).ok(),
        phase: parse_phase(&phase)?,
        creation_time: parse_ts(&creation)?,
        destruction_time: parse_optional_ts(row.get::<String>(6).ok())?,
    })
}

/// Fully materialize one job: the row plus every owned collection.
async fn load_job(conn: &Connection, id: Uuid) -> Result<Option<Job>, DatabaseError> {
    let key = id.to_string();
    let mut rows = conn
        .query(
            &format!("SELECT {JOB_COLUMNS} FROM job WHERE id = ?1"),
            params![key.clone()],
        )
        .await
        .map_err(query_err("load_job"))?;

    let mut job = match rows.next().await.map_err(query_err("load_job"))? {
        Some(row) => row_to_job(&row)?,
        None => return Ok(None),
    };

    let mut rows = conn
        .query(
            "SELECT name, value FROM job_parameter WHERE job_id = ?1 ORDER BY sequence",
            params![key.clone()],
        )
        .await
        .map_err(query_err("load_job parameters"))?;
    while let Some(row) = rows.next().await.map_err(query_err("load_job parameters"))? {
        job.parameters.push(JobParameter {
            name: row.get(0).map_err(query_err("parameter name"))?,
            value: row.get(1).map_err(query_err("parameter value"))?,
        });
    }

    let mut rows = conn
        .query(
            "SELECT result_id, url, size, mime_type FROM job_result WHERE job_id = ?1 ORDER BY sequence",
            params![key.clone()],
        )
        .await
        .map_err(query_err("load_job results"))?;
    while let Some(row) = rows.next().await.map_err(query_err("load_job results"))? {
        job.results.push(JobResult {
            id: row.get(0).map_err(query_err("result id"))?,
            url: row.get(1).map_err(query_err("result url"))?,
            size: opt_u64(&row, 2, "result size")?,
            mime_type: row.get::<String>(3).ok(),
        });
    }

    let mut rows = conn
        .query(
            "SELECT error_type, code, message, detail FROM job_error WHERE job_id = ?1",
            params![key],
        )
        .await
        .map_err(query_err("load_job error"))?;
    if let Some(row) = rows.next().await.map_err(query_err("load_job error"))? {
        let error_type: String = row.get(0).map_err(query_err("error type"))?;
        job.error = Some(ErrorSummary {
            error_type: error_type
                .parse::<ErrorType>()
                .map_err(DatabaseError::Serialization)?,
            code: row.get(1).map_err(query_err("error code"))?,
            message: row.get(2).map_err(query_err("error message"))?,
            detail: row.get::<String>(3).ok(),
        });
    }

    Ok(Some(job))
}

/// Load a job inside a mutation, which must have found it already.
async fn reload(conn: &Connection, id: Uuid) -> Result<Job, JobError> {
    load_job(conn, id).await?.ok_or(JobError::NotFound { id })
}

/// The columns a phase change reads.
struct PhaseState {
    phase: ExecutionPhase,
    start_time: Option<DateTime<Utc>>,
}

async fn load_phase_state(conn: &Connection, id: Uuid) -> Result<Option<PhaseState>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT phase, start_time FROM job WHERE id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(query_err("load_phase_state"))?;

    match rows.next().await.map_err(query_err("load_phase_state"))? {
        Some(row) => {
            let phase: String = row.get(0).map_err(query_err("phase"))?;
            Ok(Some(PhaseState {
                phase: parse_phase(&phase)?,
                start_time: parse_optional_ts(row.get::<String>(1).ok())?,
            }))
        }
        None => Ok(None),
    }
}

/// Validate and apply a phase change inside an open transaction.
/// A `message_id` replaces the stored one; `None` keeps it.
async fn apply_phase_change(
    conn: &Connection,
    id: Uuid,
    expected: Option<ExecutionPhase>,
    new_phase: ExecutionPhase,
    occurred_at: DateTime<Utc>,
    message_id: Option<&str>,
) -> Result<ExecutionPhase, JobError> {
    let state = load_phase_state(conn, id)
        .await?
        .ok_or(JobError::NotFound { id })?;

    if let Some(expected) = expected
        && expected != state.phase
    {
        return Err(JobError::Conflict {
            id,
            expected,
            actual: state.phase,
        });
    }
    if !state.phase.can_transition_to(new_phase) {
        return Err(JobError::IllegalTransition {
            id,
            from: state.phase,
            to: new_phase,
        });
    }

    let at = normalize(occurred_at);
    let (start_time, end_time) = match new_phase {
        ExecutionPhase::Executing => (state.start_time.or(Some(at)), None),
        ExecutionPhase::Completed | ExecutionPhase::Error => {
            (state.start_time.or(Some(at)), Some(at))
        }
        ExecutionPhase::Aborted => (state.start_time, state.start_time.map(|_| at)),
        _ => (state.start_time, None),
    };

    let changed = conn
        .execute(
            "UPDATE job SET phase = ?1, phase_time = ?2, start_time = ?3,
                end_time = COALESCE(?4, end_time), message_id = COALESCE(?7, message_id)
             WHERE id = ?5 AND phase = ?6",
            params![
                new_phase.as_str(),
                fmt_ts(at),
                opt_ts(start_time),
                opt_ts(end_time),
                id.to_string(),
                state.phase.as_str(),
                opt_text(message_id),
            ],
        )
        .await
        .map_err(query_err("update_phase"))?;
    if changed != 1 {
        // Unreachable under BEGIN IMMEDIATE.
        return Err(JobError::Conflict {
            id,
            expected: state.phase,
            actual: state.phase,
        });
    }

    if new_phase == ExecutionPhase::Archived {
        conn.execute("DELETE FROM job_result WHERE job_id = ?1", params![id.to_string()])
            .await
            .map_err(query_err("archive results"))?;
        conn.execute("DELETE FROM job_error WHERE job_id = ?1", params![id.to_string()])
            .await
            .map_err(query_err("archive error"))?;
    }

    Ok(state.phase)
}

async fn insert_parameters(
    conn: &Connection,
    id: Uuid,
    parameters: &[JobParameter],
) -> Result<(), DatabaseError> {
    for (sequence, parameter) in parameters.iter().enumerate() {
        conn.execute(
            "INSERT INTO job_parameter (job_id, sequence, name, value) VALUES (?1, ?2, ?3, ?4)",
            params![
                id.to_string(),
                sequence as i64,
                parameter.name.clone(),
                parameter.value.clone(),
            ],
        )
        .await
        .map_err(query_err("insert parameter"))?;
    }
    Ok(())
}

async fn insert_results(
    conn: &Connection,
    id: Uuid,
    first_sequence: i64,
    results: &[JobResult],
) -> Result<(), DatabaseError> {
    for (offset, result) in results.iter().enumerate() {
        conn.execute(
            "INSERT INTO job_result (job_id, sequence, result_id, url, size, mime_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                first_sequence + offset as i64,
                result.id.clone(),
                result.url.clone(),
                opt_int(result.size)?,
                opt_text(result.mime_type.as_deref()),
            ],
        )
        .await
        .map_err(query_err("insert result"))?;
    }
    Ok(())
}

async fn upsert_error(conn: &Connection, id: Uuid, error: &ErrorSummary) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO job_error (job_id, error_type, code, message, detail)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (job_id) DO UPDATE SET
            error_type = excluded.error_type,
            code = excluded.code,
            message = excluded.message,
            detail = excluded.detail",
        params![
            id.to_string(),
            error.error_type.as_str(),
            error.code.clone(),
            error.message.clone(),
            opt_text(error.detail.as_deref()),
        ],
    )
    .await
    .map_err(query_err("upsert error"))?;
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.pool.acquire().await?;
        migrations::run_migrations(&conn).await
    }

    async fn schema_status(&self) -> Result<SchemaStatus, DatabaseError> {
        let conn = self.pool.acquire().await?;
        migrations::check_schema(&conn).await
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let conn = self.pool.acquire().await?;
        let mut rows = conn.query("SELECT 1", ()).await.map_err(query_err("ping"))?;
        rows.next().await.map_err(query_err("ping"))?;
        Ok(())
    }

    async fn create(&self, job: NewJob) -> Result<Job, JobError> {
        job.validate()?;
        let id = Uuid::new_v4();
        let created = fmt_ts(normalize(job.creation_time));

        let conn = self.pool.acquire().await?;
        let tx = begin(&conn, TransactionBehavior::Immediate).await?;
        let outcome = async {
            tx.execute(
                "INSERT INTO job (id, service, owner, run_id, phase, creation_time, phase_time,
                    destruction_time, execution_duration)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?8)",
                params![
                    id.to_string(),
                    job.service.clone(),
                    job.owner.clone(),
                    opt_text(job.run_id.as_deref()),
                    ExecutionPhase::Pending.as_str(),
                    created,
                    opt_ts(job.destruction_time.map(normalize)),
                    opt_int(job.execution_duration)?,
                ],
            )
            .await
            .map_err(query_err("create"))?;
            insert_parameters(&tx, id, &job.parameters).await?;
            reload(&tx, id).await
        }
        .await;
        let created = finish(tx, outcome).await?;

        debug!(job_id = %id, service = %created.service, owner = %created.owner, "Job inserted into DB");
        Ok(created)
    }

    async fn get(&self, id: Uuid, include_expired: bool) -> Result<Job, JobError> {
        let conn = self.pool.acquire().await?;
        // Deferred transaction: one snapshot across the job and its collections.
        let tx = begin(&conn, TransactionBehavior::Deferred).await?;
        let outcome = reload(&tx, id).await;
        let job = finish(tx, outcome).await?;

        if !include_expired && job.is_expired(Utc::now()) {
            return Err(JobError::NotFound { id });
        }
        Ok(job)
    }

    async fn list(&self, filter: &JobFilter, page: Option<&PageToken>) -> Result<JobPage, JobError> {
        let limit = filter
            .limit
            .unwrap_or(self.max_page_size)
            .clamp(1, self.max_page_size);

        let mut sql = format!("SELECT {SUMMARY_COLUMNS} FROM job WHERE 1 = 1");
        let mut args: Vec<Value> = Vec::new();

        if let Some(service) = &filter.service {
            let p = bind(&mut args, Value::Text(service.clone()));
            sql.push_str(&format!(" AND service = {p}"));
        }
        if let Some(owner) = &filter.owner {
            let p = bind(&mut args, Value::Text(owner.clone()));
            sql.push_str(&format!(" AND owner = {p}"));
        }
        if !filter.phases.is_empty() {
            let placeholders: Vec<String> = filter
                .phases
                .iter()
                .map(|phase| bind(&mut args, Value::Text(phase.as_str().to_string())))
                .collect();
            sql.push_str(&format!(" AND phase IN ({})", placeholders.join(", ")));
        }
        if let Some(after) = filter.created_after {
            let p = bind(&mut args, Value::Text(fmt_ts(normalize(after))));
            sql.push_str(&format!(" AND creation_time > {p}"));
        }
        if let Some(before) = filter.destruction_before {
            let p = bind(&mut args, Value::Text(fmt_ts(normalize(before))));
            sql.push_str(&format!(
                " AND destruction_time IS NOT NULL AND destruction_time < {p}"
            ));
        }
        if let Some(after) = filter.destruction_after {
            let p = bind(&mut args, Value::Text(fmt_ts(normalize(after))));
            sql.push_str(&format!(
                " AND (destruction_time IS NULL OR destruction_time > {p})"
            ));
        }
        if !filter.include_expired {
            let p = bind(&mut args, Value::Text(fmt_ts(Utc::now())));
            sql.push_str(&format!(
                " AND (destruction_time IS NULL OR destruction_time > {p})"
            ));
        }
        if let Some(token) = page {
            let c = bind(&mut args, Value::Text(fmt_ts(token.creation_time)));
            let i = bind(&mut args, Value::Text(token.id.to_string()));
            sql.push_str(&format!(
                " AND (creation_time < {c} OR (creation_time = {c} AND id < {i}))"
            ));
        }
        let l = bind(&mut args, Value::Integer(limit as i64 + 1));
        sql.push_str(&format!(" ORDER BY creation_time DESC, id DESC LIMIT {l}"));

        let conn = self.pool.acquire().await?;
        let mut rows = conn
            .query(&sql, libsql::params::Params::Positional(args))
            .await
            .map_err(query_err("list"))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list"))? {
            jobs.push(row_to_summary(&row)?);
        }

        let next_page = if jobs.len() > limit {
            jobs.truncate(limit);
            jobs.last().map(PageToken::after)
        } else {
            None
        };
        Ok(JobPage { jobs, next_page })
    }

    async fn list_services(&self) -> Result<Vec<String>, JobError> {
        let conn = self.pool.acquire().await?;
        let mut rows = conn
            .query("SELECT DISTINCT service FROM job ORDER BY service", ())
            .await
            .map_err(query_err("list_services"))?;

        let mut services = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_services"))? {
            services.push(row.get(0).map_err(query_err("list_services"))?);
        }
        Ok(services)
    }

    async fn list_users(&self, service: Option<&str>) -> Result<Vec<String>, JobError> {
        let conn = self.pool.acquire().await?;
        let mut rows = conn
            .query(
                "SELECT DISTINCT owner FROM job WHERE ?1 IS NULL OR service = ?1 ORDER BY owner",
                params![opt_text(service)],
            )
            .await
            .map_err(query_err("list_users"))?;

        let mut users = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_users"))? {
            users.push(row.get(0).map_err(query_err("list_users"))?);
        }
        Ok(users)
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        after: Option<ExpiredCursor>,
        limit: usize,
    ) -> Result<Vec<ExpiredJob>, JobError> {
        let (after_time, after_id) = match after {
            Some(cursor) => (
                Value::Text(fmt_ts(cursor.destruction_time)),
                Value::Text(cursor.id.to_string()),
            ),
            None => (Value::Null, Value::Null),
        };

        let conn = self.pool.acquire().await?;
        let mut rows = conn
            .query(
                "SELECT id, service, owner, phase, destruction_time FROM job
                 WHERE destruction_time IS NOT NULL AND destruction_time <= ?1
                   AND (?2 IS NULL OR destruction_time > ?2
                        OR (destruction_time = ?2 AND id > ?3))
                 ORDER BY destruction_time ASC, id ASC
                 LIMIT ?4",
                params![fmt_ts(now), after_time, after_id, limit.max(1) as i64],
            )
            .await
            .map_err(query_err("list_expired"))?;

        let mut expired = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_expired"))? {
            let id: String = row.get(0).map_err(query_err("list_expired"))?;
            let phase: String = row.get(3).map_err(query_err("list_expired"))?;
            let destruction: String = row.get(4).map_err(query_err("list_expired"))?;
            expired.push(ExpiredJob {
                id: parse_id(&id)?,
                service: row.get(1).map_err(query_err("list_expired"))?,
                owner: row.get(2).map_err(query_err("list_expired"))?,
                phase: parse_phase(&phase)?,
                destruction_time: parse_ts(&destruction)?,
            });
        }
        Ok(expired)
    }

    async fn update_phase(
        &self,
        id: Uuid,
        expected: Option<ExecutionPhase>,
        new_phase: ExecutionPhase,
        occurred_at: DateTime<Utc>,
    ) -> Result<PhaseTransition, JobError> {
        let conn = self.pool.acquire().await?;
        let tx = begin(&conn, TransactionBehavior::Immediate).await?;
        let outcome = async {
            let from =
                apply_phase_change(&tx, id, expected, new_phase, occurred_at, None).await?;
            Ok::<_, JobError>(PhaseTransition {
                from,
                job: reload(&tx, id).await?,
            })
        }
        .await;
        let transition = finish(tx, outcome).await?;

        debug!(job_id = %id, from = %transition.from, to = %new_phase, "Job phase updated in DB");
        Ok(transition)
    }

    async fn queue(
        &self,
        id: Uuid,
        expected: Option<ExecutionPhase>,
        message_id: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Result<PhaseTransition, JobError> {
        if let Some(message_id) = &message_id {
            validate_message_id(message_id)?;
        }

        let conn = self.pool.acquire().await?;
        let tx = begin(&conn, TransactionBehavior::Immediate).await?;
        let outcome = async {
            let from = apply_phase_change(
                &tx,
                id,
                expected,
                ExecutionPhase::Queued,
                occurred_at,
                message_id.as_deref(),
            )
            .await?;
            Ok::<_, JobError>(PhaseTransition {
                from,
                job: reload(&tx, id).await?,
            })
        }
        .await;
        let transition = finish(tx, outcome).await?;

        debug!(job_id = %id, message_id = ?message_id, "Job queued in DB");
        Ok(transition)
    }

    async fn complete(
        &self,
        id: Uuid,
        expected: Option<ExecutionPhase>,
        results: Vec<JobResult>,
        occurred_at: DateTime<Utc>,
    ) -> Result<PhaseTransition, JobError> {
        validate_results(&[], &results)?;

        let conn = self.pool.acquire().await?;
        let tx = begin(&conn, TransactionBehavior::Immediate).await?;
        let outcome = async {
            let from =
                apply_phase_change(&tx, id, expected, ExecutionPhase::Completed, occurred_at, None)
                    .await?;
            insert_results(&tx, id, 1, &results).await?;
            Ok::<_, JobError>(PhaseTransition {
                from,
                job: reload(&tx, id).await?,
            })
        }
        .await;
        let transition = finish(tx, outcome).await?;

        debug!(job_id = %id, results = results.len(), "Job completed in DB");
        Ok(transition)
    }

    async fn fail(
        &self,
        id: Uuid,
        expected: Option<ExecutionPhase>,
        error: ErrorSummary,
        occurred_at: DateTime<Utc>,
    ) -> Result<PhaseTransition, JobError> {
        error.validate()?;

        let conn = self.pool.acquire().await?;
        let tx = begin(&conn, TransactionBehavior::Immediate).await?;
        let outcome = async {
            let from =
                apply_phase_change(&tx, id, expected, ExecutionPhase::Error, occurred_at, None)
                    .await?;
            upsert_error(&tx, id, &error).await?;
            Ok::<_, JobError>(PhaseTransition {
                from,
                job: reload(&tx, id).await?,
            })
        }
        .await;
        let transition = finish(tx, outcome).await?;

        debug!(job_id = %id, code = %error.code, "Job failed in DB");
        Ok(transition)
    }

    async fn append_result(&self, id: Uuid, result: JobResult) -> Result<Job, JobError> {
        let conn = self.pool.acquire().await?;
        let tx = begin(&conn, TransactionBehavior::Immediate).await?;
        let outcome = async {
            self.guard_field(&tx, id, JobField::Results).await?;
            let current = reload(&tx, id).await?;
            validate_results(&current.results, std::slice::from_ref(&result))?;
            insert_results(&tx, id, current.results.len() as i64 + 1, &[result]).await?;
            reload(&tx, id).await
        }
        .await;
        finish(tx, outcome).await
    }

    async fn set_error(&self, id: Uuid, error: ErrorSummary) -> Result<Job, JobError> {
        error.validate()?;

        let conn = self.pool.acquire().await?;
        let tx = begin(&conn, TransactionBehavior::Immediate).await?;
        let outcome = async {
            self.guard_field(&tx, id, JobField::Error).await?;
            upsert_error(&tx, id, &error).await?;
            reload(&tx, id).await
        }
        .await;
        finish(tx, outcome).await
    }

    async fn update_parameters(
        &self,
        id: Uuid,
        parameters: Vec<JobParameter>,
    ) -> Result<Job, JobError> {
        validate_parameters(&parameters)?;

        let conn = self.pool.acquire().await?;
        let tx = begin(&conn, TransactionBehavior::Immediate).await?;
        let outcome = async {
            self.guard_field(&tx, id, JobField::Parameters).await?;
            tx.execute(
                "DELETE FROM job_parameter WHERE job_id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err("update_parameters"))?;
            insert_parameters(&tx, id, &parameters).await?;
            reload(&tx, id).await
        }
        .await;
        finish(tx, outcome).await
    }

    async fn set_destruction_time(
        &self,
        id: Uuid,
        destruction_time: Option<DateTime<Utc>>,
    ) -> Result<Job, JobError> {
        let conn = self.pool.acquire().await?;
        let tx = begin(&conn, TransactionBehavior::Immediate).await?;
        let outcome = async {
            self.guard_field(&tx, id, JobField::DestructionTime).await?;
            tx.execute(
                "UPDATE job SET destruction_time = ?1 WHERE id = ?2",
                params![opt_ts(destruction_time.map(normalize)), id.to_string()],
            )
            .await
            .map_err(query_err("set_destruction_time"))?;
            reload(&tx, id).await
        }
        .await;
        finish(tx, outcome).await
    }

    async fn set_execution_duration(
        &self,
        id: Uuid,
        execution_duration: Option<u64>,
    ) -> Result<Job, JobError> {
        if let Some(secs) = execution_duration {
            validate_storable("execution duration", secs)?;
        }

        let conn = self.pool.acquire().await?;
        let tx = begin(&conn, TransactionBehavior::Immediate).await?;
        let outcome = async {
            self.guard_field(&tx, id, JobField::ExecutionDuration).await?;
            tx.execute(
                "UPDATE job SET execution_duration = ?1 WHERE id = ?2",
                params![opt_int(execution_duration)?, id.to_string()],
            )
            .await
            .map_err(query_err("set_execution_duration"))?;
            reload(&tx, id).await
        }
        .await;
        finish(tx, outcome).await
    }

    async fn set_quote(&self, id: Uuid, quote: Option<DateTime<Utc>>) -> Result<Job, JobError> {
        let conn = self.pool.acquire().await?;
        let tx = begin(&conn, TransactionBehavior::Immediate).await?;
        let outcome = async {
            self.guard_field(&tx, id, JobField::Quote).await?;
            tx.execute(
                "UPDATE job SET quote = ?1 WHERE id = ?2",
                params![opt_ts(quote.map(normalize)), id.to_string()],
            )
            .await
            .map_err(query_err("set_quote"))?;
            reload(&tx, id).await
        }
        .await;
        finish(tx, outcome).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool, JobError> {
        let conn = self.pool.acquire().await?;
        let tx = begin(&conn, TransactionBehavior::Immediate).await?;
        // Owned rows go with the job through ON DELETE CASCADE.
        let outcome = tx
            .execute("DELETE FROM job WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| JobError::from(query_err("delete")(e)));
        let count = finish(tx, outcome).await?;

        if count > 0 {
            debug!(job_id = %id, "Job deleted from DB");
        }
        Ok(count > 0)
    }
}
