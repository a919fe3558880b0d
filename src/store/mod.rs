//! Persistence layer for UWS job records, backed by libSQL.

pub mod libsql_backend;
pub mod migrations;
pub mod pool;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use migrations::SchemaStatus;
pub use traits::{ExpiredCursor, ExpiredJob, JobStore, PhaseTransition};
