//! Bounded libSQL connection pool.
//!
//! A connection is checked out for exactly one logical operation and goes
//! back to the idle list when the guard drops, on every exit path.

use std::ops::Deref;
use std::sync::Mutex;
use std::time::Duration;

use libsql::{Connection, Database as LibSqlDatabase};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

use crate::error::DatabaseError;

pub struct ConnectionPool {
    db: LibSqlDatabase,
    idle: Mutex<Vec<Connection>>,
    permits: Semaphore,
    size: usize,
    busy_timeout: Duration,
}

impl ConnectionPool {
    /// Wrap an opened database. At most `size` connections are ever live.
    pub fn new(db: LibSqlDatabase, size: usize, busy_timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            db,
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Semaphore::new(size),
            size,
            busy_timeout,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Check out a connection, waiting for one to free up if all are busy.
    pub async fn acquire(&self) -> Result<PooledConnection<'_>, DatabaseError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Connection pool closed: {e}")))?;

        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let conn = match reused {
            Some(conn) => conn,
            None => self.open_connection().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self,
            _permit: permit,
        })
    }

    async fn open_connection(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;

        // busy_timeout reports its new value as a row, so it has to be stepped.
        let pragma = format!("PRAGMA busy_timeout = {}", self.busy_timeout.as_millis());
        let mut rows = conn
            .query(&pragma, ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;
        rows.next()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;

        debug!(pool_size = self.size, "Opened pooled database connection");
        Ok(conn)
    }
}

/// A checked-out connection. Returned to the pool on drop.
pub struct PooledConnection<'a> {
    conn: Option<Connection>,
    pool: &'a ConnectionPool,
    _permit: SemaphorePermit<'a>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `Drop` takes the connection out.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take()
            && let Ok(mut idle) = self.pool.idle.lock()
        {
            idle.push(conn);
        }
    }
}
