//! Schema versions for the libSQL backend.
//!
//! Steps are numbered; `_migrations` records the ones applied. A step and
//! its version record commit together, so a failed step leaves the database
//! at the previous version. Serving processes never migrate: they call
//! `check_schema()` and refuse to start against an outdated database.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only; released steps are never edited.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "uws_jobs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS job (
                id TEXT PRIMARY KEY,
                service TEXT NOT NULL,
                owner TEXT NOT NULL,
                run_id TEXT,
                phase TEXT NOT NULL,
                creation_time TEXT NOT NULL,
                phase_time TEXT NOT NULL,
                start_time TEXT,
                end_time TEXT,
                destruction_time TEXT,
                execution_duration INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_job_service_owner_phase
                ON job(service, owner, phase, creation_time);
            CREATE INDEX IF NOT EXISTS idx_job_service_owner_time
                ON job(service, owner, creation_time);

            CREATE TABLE IF NOT EXISTS job_parameter (
                job_id TEXT NOT NULL REFERENCES job(id) ON DELETE CASCADE,
                sequence INTEGER NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (job_id, sequence)
            );

            CREATE TABLE IF NOT EXISTS job_result (
                job_id TEXT NOT NULL REFERENCES job(id) ON DELETE CASCADE,
                sequence INTEGER NOT NULL,
                result_id TEXT NOT NULL,
                url TEXT NOT NULL,
                size INTEGER,
                mime_type TEXT,
                PRIMARY KEY (job_id, sequence),
                UNIQUE (job_id, result_id)
            );

            CREATE TABLE IF NOT EXISTS job_error (
                job_id TEXT PRIMARY KEY REFERENCES job(id) ON DELETE CASCADE,
                error_type TEXT NOT NULL,
                code TEXT NOT NULL,
                message TEXT NOT NULL,
                detail TEXT
            );
        "#,
    },
    Migration {
        version: 2,
        name: "job_destruction_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_job_destruction
                ON job(destruction_time, id) WHERE destruction_time IS NOT NULL;
        "#,
    },
    Migration {
        version: 3,
        name: "job_quote_and_message",
        sql: r#"
            ALTER TABLE job ADD COLUMN quote TEXT;
            ALTER TABLE job ADD COLUMN message_id TEXT;
        "#,
    },
];

/// Tables owned by this schema, children first.
const TABLES: &[&str] = &["job_error", "job_result", "job_parameter", "job", "_migrations"];

/// The version a fully migrated database is at.
pub fn latest_version() -> i64 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Where a database stands relative to this build's migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current: i64,
    pub expected: i64,
}

impl SchemaStatus {
    pub fn is_current(&self) -> bool {
        self.current == self.expected
    }
}

/// Bring the schema up to `latest_version()`.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    create_version_table(conn).await?;
    let applied = applied_version(conn).await?;

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema already current");
        return Ok(());
    }

    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Applying schema step");
        apply_step(conn, step).await?;
    }

    tracing::info!(version = latest_version(), "Schema migrated");
    Ok(())
}

async fn apply_step(conn: &Connection, step: &Migration) -> Result<(), DatabaseError> {
    let failed = |e: libsql::Error| {
        DatabaseError::Migration(format!("V{} {} failed: {e}", step.version, step.name))
    };

    let tx = conn.transaction().await.map_err(failed)?;
    tx.execute_batch(step.sql).await.map_err(failed)?;
    tx.execute(
        "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![step.version, step.name],
    )
    .await
    .map_err(failed)?;
    tx.commit().await.map_err(failed)
}

/// Report the applied version without changing anything.
pub async fn check_schema(conn: &Connection) -> Result<SchemaStatus, DatabaseError> {
    let current = if table_exists(conn, "_migrations").await? {
        applied_version(conn).await?
    } else {
        0
    };
    Ok(SchemaStatus {
        current,
        expected: latest_version(),
    })
}

/// Drop every table this schema owns. Used by `init --reset`.
pub async fn reset(conn: &Connection) -> Result<(), DatabaseError> {
    for table in TABLES {
        conn.execute(&format!("DROP TABLE IF EXISTS {table}"), ())
            .await
            .map_err(|e| DatabaseError::Migration(format!("drop {table}: {e}")))?;
    }
    tracing::warn!("Dropped all job tables");
    Ok(())
}

async fn create_version_table(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create _migrations: {e}")))?;
    Ok(())
}

/// Highest recorded version; 0 for an empty table.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let read_err = |e: libsql::Error| DatabaseError::Migration(format!("read schema version: {e}"));
    let mut rows = conn
        .query("SELECT IFNULL(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(read_err)?;
    match rows.next().await.map_err(read_err)? {
        Some(row) => row.get::<i64>(0).map_err(read_err),
        None => Ok(0),
    }
}

async fn table_exists(conn: &Connection, table: &str) -> Result<bool, DatabaseError> {
    let check_err = |e: libsql::Error| DatabaseError::Query(format!("look up table {table}: {e}"));
    let mut rows = conn
        .query(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            libsql::params![table],
        )
        .await
        .map_err(check_err)?;
    Ok(rows.next().await.map_err(check_err)?.is_some())
}
