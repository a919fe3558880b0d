//! Ownership and legality checks applied to every caller-initiated mutation.
//!
//! The controller holds no state beyond deployment policy. It judges a job
//! snapshot; the store re-checks phase legality inside its transaction, so a
//! stale snapshot can only cause a spurious rejection, never a bad write.

use super::model::{Job, validate_label};
use super::phase::{ExecutionPhase, JobField};
use crate::error::JobError;

/// A pre-authenticated principal: the client service and the user it acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub service: String,
    pub user: String,
    /// Administrative override: may act on any job and reach admin views.
    pub admin: bool,
}

impl Caller {
    pub fn new(service: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            user: user.into(),
            admin: false,
        }
    }

    /// Builder: grant the administrative override.
    pub fn with_admin(mut self, admin: bool) -> Self {
        self.admin = admin;
        self
    }

    /// `service/user`, as used in log lines and errors.
    pub fn principal(&self) -> String {
        format!("{}/{}", self.service, self.user)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        validate_label("service", &self.service)?;
        validate_label("user", &self.user)
    }

    fn owns(&self, job: &Job) -> bool {
        self.service == job.service && self.user == job.owner
    }

    fn forbidden(&self, resource: String) -> JobError {
        JobError::Forbidden {
            principal: self.principal(),
            resource,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LifecycleController {
    allow_reparameterization: bool,
}

impl LifecycleController {
    pub fn new(allow_reparameterization: bool) -> Self {
        Self {
            allow_reparameterization,
        }
    }

    pub fn allow_reparameterization(&self) -> bool {
        self.allow_reparameterization
    }

    /// The caller must own the job or hold the administrative override.
    pub fn authorize(&self, caller: &Caller, job: &Job) -> Result<(), JobError> {
        if caller.admin || caller.owns(job) {
            Ok(())
        } else {
            Err(caller.forbidden(format!("job {}", job.id)))
        }
    }

    /// Admin views are reserved for administrative callers.
    pub fn authorize_admin(&self, caller: &Caller) -> Result<(), JobError> {
        if caller.admin {
            Ok(())
        } else {
            Err(caller.forbidden("administrative views".to_string()))
        }
    }

    /// Ownership, then the optimistic-concurrency guard, then the phase table.
    ///
    /// ARCHIVED is the storage-operator path and needs the override even
    /// for the job's owner.
    pub fn check_transition(
        &self,
        caller: &Caller,
        job: &Job,
        expected: Option<ExecutionPhase>,
        to: ExecutionPhase,
    ) -> Result<(), JobError> {
        self.authorize(caller, job)?;

        if let Some(expected) = expected
            && expected != job.phase
        {
            return Err(JobError::Conflict {
                id: job.id,
                expected,
                actual: job.phase,
            });
        }
        if !job.phase.can_transition_to(to) {
            return Err(JobError::IllegalTransition {
                id: job.id,
                from: job.phase,
                to,
            });
        }
        if to == ExecutionPhase::Archived && !caller.admin {
            return Err(caller.forbidden(format!("archival of job {}", job.id)));
        }
        Ok(())
    }

    /// Ownership, then whether `field` may change in the job's phase.
    pub fn check_mutation(
        &self,
        caller: &Caller,
        job: &Job,
        field: JobField,
    ) -> Result<(), JobError> {
        self.authorize(caller, job)?;

        if job.phase.allows(field, self.allow_reparameterization) {
            Ok(())
        } else {
            Err(JobError::IllegalMutation {
                id: job.id,
                phase: job.phase,
                field,
            })
        }
    }
}
