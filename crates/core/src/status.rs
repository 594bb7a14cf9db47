//! Job status state machine.
//!
//! ```text
//! Queued --(engine accepts)--> Preparing --(first batch ready)--> Running
//! Running --(all items done)--> Completed      (errors alone never fail a job)
//! Running --(unrecoverable error)--> Failed
//! Queued | Preparing --(failure before the first batch)--> Failed
//! Queued | Preparing | Running --(cancel accepted)--> Aborted
//! ```
//!
//! Completed, Failed and Aborted are terminal.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted by the engine, not yet picked up.
    Queued,
    /// Opening the input source, total item count may still be unknown.
    Preparing,
    /// Processing slices.
    Running,
    /// All items done (possibly with per-item errors).
    Completed,
    /// Unrecoverable failure.
    Failed,
    /// Cancelled on request.
    Aborted,
}

impl JobStatus {
    /// Statuses that hold a logical job's slot in the duplicate guard.
    pub const ACTIVE: [JobStatus; 3] = [JobStatus::Queued, JobStatus::Preparing, JobStatus::Running];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Aborted)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Position along the forward path; terminal states share the last step.
    fn step(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Preparing => 1,
            JobStatus::Running => 2,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Aborted => 3,
        }
    }

    /// Whether a single transition `self -> next` is allowed.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Preparing)
                | (Preparing, Running)
                | (Running, Completed)
                | (Queued | Preparing | Running, Failed)
                | (Queued | Preparing | Running, Aborted)
        )
    }

    /// Ordered single-step transitions leading from `self` to `target`.
    ///
    /// Polling may observe the engine several states ahead of the record; the
    /// returned path lets the record walk through each intermediate state so
    /// Queued/Preparing are never revisited. Returns `None` when `target` is
    /// unreachable (backwards, or out of a terminal state).
    pub fn path_to(self, target: JobStatus) -> Option<Vec<JobStatus>> {
        if self == target {
            return Some(Vec::new());
        }
        if self.is_terminal() || target.step() < self.step() {
            return None;
        }
        if self.can_transition_to(target) {
            return Some(vec![target]);
        }

        let mut path = Vec::new();
        let mut current = self;
        while current != target {
            let next = match current {
                JobStatus::Queued => JobStatus::Preparing,
                JobStatus::Preparing => JobStatus::Running,
                JobStatus::Running if target.is_terminal() => target,
                _ => return None,
            };
            if !current.can_transition_to(next) {
                return None;
            }
            path.push(next);
            current = next;
        }
        Some(path)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Preparing => "preparing",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = crate::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "preparing" => Ok(JobStatus::Preparing),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "aborted" => Ok(JobStatus::Aborted),
            other => Err(crate::DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::JobStatus::*;
    use super::*;

    const ALL: [JobStatus; 6] = [Queued, Preparing, Running, Completed, Failed, Aborted];

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [Completed, Failed, Aborted] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn running_never_returns_to_setup_states() {
        assert!(!Running.can_transition_to(Queued));
        assert!(!Running.can_transition_to(Preparing));
        assert!(!Preparing.can_transition_to(Queued));
    }

    #[test]
    fn completion_requires_running() {
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Preparing.can_transition_to(Completed));
        assert!(Running.can_transition_to(Completed));
    }

    #[test]
    fn path_walks_intermediate_states() {
        assert_eq!(Queued.path_to(Completed), Some(vec![Preparing, Running, Completed]));
        assert_eq!(Preparing.path_to(Running), Some(vec![Running]));
        assert_eq!(Queued.path_to(Failed), Some(vec![Failed]));
        assert_eq!(Running.path_to(Running), Some(vec![]));
        assert_eq!(Running.path_to(Preparing), None);
        assert_eq!(Completed.path_to(Aborted), None);
    }

    #[test]
    fn status_names_round_trip() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }
}
