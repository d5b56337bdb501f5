//! Job and task model shared by every coordinator component

mod config;
mod model;
mod status;
mod task;

pub use config::{AdapterOverride, JobConfig};
pub use model::{normalize_adapters, HistoryEntry, HistoryKind, Job, JobError, JobId};
pub use status::{
    InvalidTransition, JobStatus, TaskStatus, Transition, UnknownStatus, ALL_JOB_STATUSES,
};
pub use task::{RevisionWindow, Task, TaskId};
