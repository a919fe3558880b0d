//! Job record data model: the job and the collections it owns.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::phase::ExecutionPhase;
use crate::error::JobError;

/// Longest accepted service name, owner, or run identifier.
pub const MAX_LABEL_LEN: usize = 64;

/// A single UWS input parameter. Names may repeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameter {
    pub name: String,
    pub value: String,
}

impl JobParameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Descriptor of one job output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Identifier of the result, unique within its job.
    pub id: String,
    /// Where the result can be retrieved.
    pub url: String,
    /// Size in bytes, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// MIME type, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl JobResult {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            size: None,
            mime_type: None,
        }
    }

    /// Builder: set size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Builder: set MIME type.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    fn validate(&self) -> Result<(), JobError> {
        if self.id.trim().is_empty() {
            return Err(JobError::Validation("result id must not be empty".into()));
        }
        if self.url.trim().is_empty() {
            return Err(JobError::Validation(format!(
                "result {} has an empty url",
                self.id
            )));
        }
        if let Some(size) = self.size {
            validate_storable("result size", size)?;
        }
        Ok(())
    }
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Fatal,
    Transient,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Transient => "transient",
        }
    }
}

impl FromStr for ErrorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fatal" => Ok(Self::Fatal),
            "transient" => Ok(Self::Transient),
            other => Err(format!("unknown error type: {other}")),
        }
    }
}

/// The terminal error recorded against a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub error_type: ErrorType,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorSummary {
    pub fn new(error_type: ErrorType, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type,
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }

    /// Builder: set detail.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), JobError> {
        if self.code.trim().is_empty() {
            return Err(JobError::Validation("error code must not be empty".into()));
        }
        Ok(())
    }
}

/// A fully materialized UWS job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Client service that created the job.
    pub service: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub phase: ExecutionPhase,
    pub parameters: Vec<JobParameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
    pub creation_time: DateTime<Utc>,
    /// When the job entered its current phase.
    pub phase_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// `None` means the job never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destruction_time: Option<DateTime<Utc>>,
    /// Execution quota in seconds (UWS `executionDuration`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_duration: Option<u64>,
    /// Expected completion time, if the service has estimated one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<DateTime<Utc>>,
    /// Identifier of the queue message that carries the job to a worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl Job {
    /// Whether the job has reached its destruction time as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.destruction_time.is_some_and(|t| t <= now)
    }

    /// Results only on COMPLETED jobs, an error only on ERROR/ABORTED jobs.
    pub fn invariants_hold(&self) -> bool {
        let results_ok = self.results.is_empty() || self.phase == ExecutionPhase::Completed;
        let error_ok = self.error.is_none()
            || matches!(self.phase, ExecutionPhase::Error | ExecutionPhase::Aborted);
        results_ok && error_ok
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            service: self.service.clone(),
            owner: self.owner.clone(),
            run_id: self.run_id.clone(),
            phase: self.phase,
            creation_time: self.creation_time,
            destruction_time: self.destruction_time,
        }
    }
}

/// The listing view of a job, without its owned collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub service: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub phase: ExecutionPhase,
    pub creation_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destruction_time: Option<DateTime<Utc>>,
}

/// Client-supplied data for a new job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobCreate {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub parameters: Vec<JobParameter>,
    /// Overrides the deployment's default lifetime.
    #[serde(default)]
    pub destruction_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_duration: Option<u64>,
}

impl JobCreate {
    pub fn new(parameters: Vec<JobParameter>) -> Self {
        Self {
            parameters,
            ..Default::default()
        }
    }

    /// Builder: set run ID.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Builder: set destruction time.
    pub fn with_destruction_time(mut self, when: DateTime<Utc>) -> Self {
        self.destruction_time = Some(when);
        self
    }

    /// Builder: set execution duration in seconds.
    pub fn with_execution_duration(mut self, secs: u64) -> Self {
        self.execution_duration = Some(secs);
        self
    }

    /// Resolve into a storable record for `service`/`owner` created at `now`.
    ///
    /// Without an explicit destruction time the job lives for
    /// `default_lifetime`, or forever when that is `None`.
    pub fn into_new_job(
        self,
        service: &str,
        owner: &str,
        now: DateTime<Utc>,
        default_lifetime: Option<Duration>,
    ) -> Result<NewJob, JobError> {
        if let Some(when) = self.destruction_time
            && when <= now
        {
            return Err(JobError::Validation(format!(
                "destruction time {} is not in the future",
                when.to_rfc3339()
            )));
        }
        let destruction_time = self
            .destruction_time
            .or_else(|| default_lifetime.map(|lifetime| now + lifetime));

        let job = NewJob {
            service: service.to_string(),
            owner: owner.to_string(),
            run_id: self.run_id,
            parameters: self.parameters,
            creation_time: now,
            destruction_time,
            execution_duration: self.execution_duration,
        };
        job.validate()?;
        Ok(job)
    }
}

/// A validated job ready to be persisted in PENDING.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub service: String,
    pub owner: String,
    pub run_id: Option<String>,
    pub parameters: Vec<JobParameter>,
    pub creation_time: DateTime<Utc>,
    pub destruction_time: Option<DateTime<Utc>>,
    pub execution_duration: Option<u64>,
}

impl NewJob {
    pub fn validate(&self) -> Result<(), JobError> {
        validate_label("service", &self.service)?;
        validate_label("owner", &self.owner)?;
        if let Some(run_id) = &self.run_id
            && run_id.chars().count() > MAX_LABEL_LEN
        {
            return Err(JobError::Validation(format!(
                "run_id is longer than {MAX_LABEL_LEN} characters"
            )));
        }
        if let Some(secs) = self.execution_duration {
            validate_storable("execution duration", secs)?;
        }
        validate_parameters(&self.parameters)
    }
}

/// Reject empty or over-long identity strings.
pub fn validate_label(what: &str, value: &str) -> Result<(), JobError> {
    if value.trim().is_empty() {
        return Err(JobError::Validation(format!("{what} must not be empty")));
    }
    if value.chars().count() > MAX_LABEL_LEN {
        return Err(JobError::Validation(format!(
            "{what} is longer than {MAX_LABEL_LEN} characters"
        )));
    }
    Ok(())
}

/// Stored integers are signed 64-bit; reject what would not round-trip.
pub(crate) fn validate_storable(what: &str, value: u64) -> Result<(), JobError> {
    i64::try_from(value)
        .map(|_| ())
        .map_err(|_| JobError::Validation(format!("{what} {value} is out of range")))
}

/// A queue message id follows the same length limit as other labels.
pub(crate) fn validate_message_id(message_id: &str) -> Result<(), JobError> {
    validate_label("message_id", message_id)
}

pub(crate) fn validate_parameters(parameters: &[JobParameter]) -> Result<(), JobError> {
    if let Some(index) = parameters.iter().position(|p| p.name.trim().is_empty()) {
        return Err(JobError::Validation(format!(
            "parameter {index} has an empty name"
        )));
    }
    Ok(())
}

/// Validate new results against each other and against those already stored.
pub(crate) fn validate_results(existing: &[JobResult], new: &[JobResult]) -> Result<(), JobError> {
    let mut seen: HashSet<&str> = existing.iter().map(|r| r.id.as_str()).collect();
    for result in new {
        result.validate()?;
        if !seen.insert(result.id.as_str()) {
            return Err(JobError::Validation(format!(
                "duplicate result id {}",
                result.id
            )));
        }
    }
    Ok(())
}
