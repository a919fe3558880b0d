//! UWS execution phase state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Execution phase of a UWS job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionPhase {
    /// Accepted, not yet submitted for execution.
    Pending,
    /// Submitted and waiting for an executor.
    Queued,
    /// Currently running.
    Executing,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Error,
    /// Stopped by the owner or the service.
    Aborted,
    /// Waiting on something outside the job before it can be queued.
    Held,
    /// Paused mid-execution.
    Suspended,
    /// Results discarded; only the job record remains.
    Archived,
}

impl ExecutionPhase {
    /// Every phase, in declaration order.
    pub const ALL: [ExecutionPhase; 9] = [
        Self::Pending,
        Self::Queued,
        Self::Executing,
        Self::Completed,
        Self::Error,
        Self::Aborted,
        Self::Held,
        Self::Suspended,
        Self::Archived,
    ];

    /// Check if this phase allows transitioning to another phase.
    pub fn can_transition_to(&self, target: ExecutionPhase) -> bool {
        use ExecutionPhase::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Queued) | (Pending, Aborted) | (Pending, Held) |
            // From Queued
            (Queued, Executing) | (Queued, Aborted) | (Queued, Held) | (Queued, Error) |
            // From Held
            (Held, Queued) | (Held, Aborted) |
            // From Executing
            (Executing, Completed) | (Executing, Error) |
            (Executing, Aborted) | (Executing, Suspended) |
            // From Suspended
            (Suspended, Executing) | (Suspended, Aborted) | (Suspended, Error) |
            // Finished phases may only be archived
            (Completed, Archived) | (Error, Archived) | (Aborted, Archived)
        )
    }

    /// COMPLETED, ERROR and ABORTED: the job has stopped and will not run again.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Aborted)
    }

    /// Check if this is a terminal phase with no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Archived)
    }

    /// Whether `field` may be changed while a job sits in this phase.
    ///
    /// Parameters are frozen once a job leaves PENDING/QUEUED unless the
    /// deployment enables reparameterization, which re-opens HELD and
    /// SUSPENDED jobs.
    pub fn allows(&self, field: JobField, allow_reparameterization: bool) -> bool {
        use ExecutionPhase::*;

        match field {
            JobField::Parameters => match self {
                Pending | Queued => true,
                Held | Suspended => allow_reparameterization,
                _ => false,
            },
            JobField::DestructionTime => !self.is_terminal(),
            JobField::ExecutionDuration => matches!(self, Pending | Queued | Held),
            JobField::Results => matches!(self, Completed),
            JobField::Error => matches!(self, Error | Aborted),
            JobField::Quote => !self.is_finished() && !self.is_terminal(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::Aborted => "ABORTED",
            Self::Held => "HELD",
            Self::Suspended => "SUSPENDED",
            Self::Archived => "ARCHIVED",
        }
    }
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|phase| phase.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown execution phase: {s}"))
    }
}

/// Mutable parts of a job other than its phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobField {
    Parameters,
    DestructionTime,
    ExecutionDuration,
    Results,
    Error,
    Quote,
}

impl std::fmt::Display for JobField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Parameters => "parameters",
            Self::DestructionTime => "destruction time",
            Self::ExecutionDuration => "execution duration",
            Self::Results => "results",
            Self::Error => "error",
            Self::Quote => "quote",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_transitions_valid() {
        use ExecutionPhase::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Pending.can_transition_to(Held));
        assert!(Queued.can_transition_to(Executing));
        assert!(Queued.can_transition_to(Error));
        assert!(Held.can_transition_to(Queued));
        assert!(Executing.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Executing));
        assert!(Completed.can_transition_to(Archived));
        assert!(Aborted.can_transition_to(Archived));
    }

    #[test]
    fn phase_transitions_invalid() {
        use ExecutionPhase::*;
        assert!(!Executing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Executing));
        assert!(!Error.can_transition_to(Queued));
        assert!(!Pending.can_transition_to(Executing));
        assert!(!Pending.can_transition_to(Archived));
        assert!(!Held.can_transition_to(Executing));
        for phase in ExecutionPhase::ALL {
            assert!(!Archived.can_transition_to(phase));
            assert!(!phase.can_transition_to(phase), "{phase} -> {phase}");
        }
    }

    #[test]
    fn transition_table_size() {
        let legal = ExecutionPhase::ALL
            .iter()
            .flat_map(|from| ExecutionPhase::ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .count();
        assert_eq!(legal, 19);
    }

    #[test]
    fn finished_and_terminal() {
        assert!(ExecutionPhase::Completed.is_finished());
        assert!(ExecutionPhase::Error.is_finished());
        assert!(ExecutionPhase::Aborted.is_finished());
        assert!(!ExecutionPhase::Archived.is_finished());
        assert!(ExecutionPhase::Archived.is_terminal());
        assert!(!ExecutionPhase::Completed.is_terminal());
    }

    #[test]
    fn parameters_frozen_after_queue() {
        use ExecutionPhase::*;
        assert!(Pending.allows(JobField::Parameters, false));
        assert!(Queued.allows(JobField::Parameters, false));
        assert!(!Held.allows(JobField::Parameters, false));
        assert!(Held.allows(JobField::Parameters, true));
        assert!(Suspended.allows(JobField::Parameters, true));
        assert!(!Executing.allows(JobField::Parameters, true));
        assert!(!Completed.allows(JobField::Parameters, true));
    }

    #[test]
    fn results_and_errors_follow_phase() {
        use ExecutionPhase::*;
        assert!(Completed.allows(JobField::Results, false));
        assert!(!Executing.allows(JobField::Results, false));
        assert!(Error.allows(JobField::Error, false));
        assert!(Aborted.allows(JobField::Error, false));
        assert!(!Completed.allows(JobField::Error, false));
        assert!(!Archived.allows(JobField::DestructionTime, false));
        assert!(Completed.allows(JobField::DestructionTime, false));
        assert!(!Executing.allows(JobField::ExecutionDuration, false));
        assert!(Executing.allows(JobField::Quote, false));
        assert!(!Completed.allows(JobField::Quote, false));
        assert!(!Archived.allows(JobField::Quote, false));
    }

    #[test]
    fn phase_parse_and_display() {
        for phase in ExecutionPhase::ALL {
            assert_eq!(phase.to_string().parse::<ExecutionPhase>().unwrap(), phase);
        }
        assert_eq!("queued".parse::<ExecutionPhase>().unwrap(), ExecutionPhase::Queued);
        assert!("RUNNING".parse::<ExecutionPhase>().is_err());
    }

    #[test]
    fn phase_serde_uses_uws_names() {
        let json = serde_json::to_string(&ExecutionPhase::Executing).unwrap();
        assert_eq!(json, "\"EXECUTING\"");
        let parsed: ExecutionPhase = serde_json::from_str("\"HELD\"").unwrap();
        assert_eq!(parsed, ExecutionPhase::Held);
    }
}
