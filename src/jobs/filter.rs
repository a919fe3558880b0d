//! Listing filters and keyset pagination.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::JobSummary;
use super::phase::ExecutionPhase;
use crate::error::JobError;

/// Predicate for `list`. Unset fields do not constrain the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub service: Option<String>,
    pub owner: Option<String>,
    /// Include only jobs in one of these phases. Empty means any phase.
    pub phases: BTreeSet<ExecutionPhase>,
    /// Include only jobs created strictly after this time.
    pub created_after: Option<DateTime<Utc>>,
    /// Include only jobs whose destruction time is strictly before this time.
    pub destruction_before: Option<DateTime<Utc>>,
    /// Include only jobs whose destruction time is strictly after this time,
    /// or that never expire.
    pub destruction_after: Option<DateTime<Utc>>,
    /// Also return jobs that have passed their destruction time.
    pub include_expired: bool,
    /// Page size; the store clamps it to its configured maximum.
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: restrict to a service.
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Builder: restrict to an owner.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Builder: restrict to a set of phases.
    pub fn phases(mut self, phases: impl IntoIterator<Item = ExecutionPhase>) -> Self {
        self.phases = phases.into_iter().collect();
        self
    }

    /// Builder: only jobs created after `when`.
    pub fn created_after(mut self, when: DateTime<Utc>) -> Self {
        self.created_after = Some(when);
        self
    }

    /// Builder: only jobs destroyed before `when`.
    pub fn destruction_before(mut self, when: DateTime<Utc>) -> Self {
        self.destruction_before = Some(when);
        self
    }

    /// Builder: only jobs destroyed after `when`.
    pub fn destruction_after(mut self, when: DateTime<Utc>) -> Self {
        self.destruction_after = Some(when);
        self
    }

    /// Builder: include jobs past their destruction time.
    pub fn include_expired(mut self, include: bool) -> Self {
        self.include_expired = include;
        self
    }

    /// Builder: set page size.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Opaque continuation token for `list`.
///
/// Encodes the `(creation_time, id)` of the last job returned; the next page
/// starts strictly after it in descending order, so concurrent deletes never
/// shift or repeat entries the way offsets would.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PageToken {
    pub(crate) creation_time: DateTime<Utc>,
    pub(crate) id: Uuid,
}

impl PageToken {
    pub(crate) fn after(summary: &JobSummary) -> Self {
        Self {
            creation_time: summary.creation_time,
            id: summary.id,
        }
    }

    pub fn encode(&self) -> String {
        let micros = self.creation_time.timestamp_micros() as u64;
        format!("{micros:016x}{}", self.id.simple())
    }

    pub fn decode(token: &str) -> Result<Self, JobError> {
        let invalid = || JobError::Validation(format!("invalid page token: {token}"));
        if token.len() != 48 || !token.is_ascii() {
            return Err(invalid());
        }
        let (time_hex, id_hex) = token.split_at(16);
        let micros = u64::from_str_radix(time_hex, 16).map_err(|_| invalid())? as i64;
        let creation_time = DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(invalid)?;
        let id = Uuid::parse_str(id_hex).map_err(|_| invalid())?;
        Ok(Self { creation_time, id })
    }
}

impl std::fmt::Display for PageToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

impl TryFrom<String> for PageToken {
    type Error = JobError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::decode(&value)
    }
}

impl From<PageToken> for String {
    fn from(token: PageToken) -> Self {
        token.encode()
    }
}

/// One page of a listing, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<JobSummary>,
    /// Present when more jobs may follow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page: Option<PageToken>,
}
