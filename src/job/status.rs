//! Job and task status enums, and the job lifecycle state machine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    New,
    Queued,
    Processing,
    Finished,
    FinishedWithErrors,
    Stopped,
    Expired,
    Reset,
    Error,
}

/// Every job status, in declaration order.
pub const ALL_JOB_STATUSES: [JobStatus; 9] = [
    JobStatus::New,
    JobStatus::Queued,
    JobStatus::Processing,
    JobStatus::Finished,
    JobStatus::FinishedWithErrors,
    JobStatus::Stopped,
    JobStatus::Expired,
    JobStatus::Reset,
    JobStatus::Error,
];

/// Outcome of a permitted status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The job moved to a new status.
    Changed,
    /// The job was already in the requested status.
    Unchanged,
}

/// A status change the state machine does not permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid job state change from {from} to {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl JobStatus {
    /// Targets reachable from this status. Same-state requests are handled
    /// separately by [`JobStatus::transition_to`].
    pub fn allowed_targets(self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            New => &[Queued, Processing, Stopped, Expired],
            Queued => &[New, Queued, Error],
            Reset => &[Processing, Error],
            Processing => &[
                Finished,
                FinishedWithErrors,
                Processing,
                Stopped,
                Expired,
                Error,
            ],
            Finished => &[
                Queued,
                Reset,
                Error,
                Processing,
                FinishedWithErrors,
                Finished,
            ],
            FinishedWithErrors => &[
                Queued,
                Reset,
                Error,
                Processing,
                Finished,
                FinishedWithErrors,
            ],
            Stopped => &[Queued, Reset],
            Expired => &[Finished, FinishedWithErrors, Reset, Stopped],
            Error => &[Queued],
        }
    }

    /// Check a status change against the lifecycle table.
    ///
    /// Asking for the current status is always `Ok(Transition::Unchanged)`.
    pub fn transition_to(self, target: JobStatus) -> Result<Transition, InvalidTransition> {
        if self == target {
            return Ok(Transition::Unchanged);
        }
        if self.allowed_targets().contains(&target) {
            Ok(Transition::Changed)
        } else {
            Err(InvalidTransition {
                from: self,
                to: target,
            })
        }
    }

    /// True for statuses a RESET command may start from.
    pub fn is_resettable(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::FinishedWithErrors | JobStatus::Stopped | JobStatus::Reset
        )
    }

    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::New => "NEW",
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Finished => "FINISHED",
            JobStatus::FinishedWithErrors => "FINISHED_WITH_ERRORS",
            JobStatus::Stopped => "STOPPED",
            JobStatus::Expired => "EXPIRED",
            JobStatus::Reset => "RESET",
            JobStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_JOB_STATUSES
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Queued for, or being worked on by, a worker
    Processing,
    Complete,
    Failed,
    /// A failed task that has been re-dispatched by a retry
    Replayed,
    /// Closed without dispatch because the job was stopped or too large
    Dropped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Replayed => "REPLAYED",
            TaskStatus::Dropped => "DROPPED",
        }
    }

    pub fn is_active(self) -> bool {
        self == TaskStatus::Processing
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            TaskStatus::Processing,
            TaskStatus::Complete,
            TaskStatus::Failed,
            TaskStatus::Replayed,
            TaskStatus::Dropped,
        ]
        .into_iter()
        .find(|status| status.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
