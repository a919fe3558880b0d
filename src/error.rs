//! Error types for the UWS job store.

use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::jobs::phase::{ExecutionPhase, JobField};

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Database schema is at V{current}, expected V{expected}")]
    SchemaOutdated { current: i64, expected: i64 },
}

/// Failures of a job operation, as seen by callers.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Principal {principal} may not access {resource}")]
    Forbidden { principal: String, resource: String },

    #[error("Job {id} cannot transition from {from} to {to}")]
    IllegalTransition {
        id: Uuid,
        from: ExecutionPhase,
        to: ExecutionPhase,
    },

    #[error("Job {id} in phase {phase} does not allow changing {field}")]
    IllegalMutation {
        id: Uuid,
        phase: ExecutionPhase,
        field: JobField,
    },

    #[error("Job {id} is in phase {actual}, caller expected {expected}")]
    Conflict {
        id: Uuid,
        expected: ExecutionPhase,
        actual: ExecutionPhase,
    },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] DatabaseError),
}

/// The externally visible failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    IllegalTransition,
    Conflict,
    ValidationError,
    StorageUnavailable,
}

impl ErrorKind {
    /// Only backend unavailability is worth retrying; everything else is a
    /// deterministic outcome of the caller's input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::IllegalTransition => "illegal_transition",
            Self::Conflict => "conflict",
            Self::ValidationError => "validation_error",
            Self::StorageUnavailable => "storage_unavailable",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobError {
    /// Classify this error onto the external taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::IllegalTransition { .. } | Self::IllegalMutation { .. } => {
                ErrorKind::IllegalTransition
            }
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
        }
    }
}
