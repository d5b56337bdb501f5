//! Tasks: one unit of work sent to one worker instance

use super::{JobId, TaskStatus};
use crate::adapter::AdapterId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Inclusive range of graph revisions a task was dispatched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionWindow {
    pub start: u64,
    pub end: u64,
}

impl RevisionWindow {
    /// Window covering the `update_count` revisions ending at `max_revision`.
    ///
    /// Returns `None` when the batch introduced no revisions.
    pub fn ending_at(max_revision: u64, update_count: u64) -> Option<Self> {
        if update_count == 0 || update_count > max_revision {
            return None;
        }
        Some(Self {
            start: max_revision - update_count + 1,
            end: max_revision,
        })
    }

    pub fn contains(&self, revision: u64) -> bool {
        self.start <= revision && revision <= self.end
    }
}

/// A unit of work dispatched to one worker instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    /// Task whose result produced this one; `None` for seeds, post-actions and retries
    pub parent_id: Option<TaskId>,
    pub adapter_id: AdapterId,
    pub adapter_name: String,
    pub node_count: usize,
    pub status: TaskStatus,
    pub current_graph_revision: u64,
    pub max_graph_revision: u64,
    /// Which chunk of a larger match set this task carries
    pub node_page_index: usize,
    pub create_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        job_id: JobId,
        adapter_id: AdapterId,
        adapter_name: impl Into<String>,
        node_count: usize,
    ) -> Self {
        Self {
            id: TaskId::new(),
            job_id,
            parent_id: None,
            adapter_id,
            adapter_name: adapter_name.into(),
            node_count,
            status: TaskStatus::Processing,
            current_graph_revision: 0,
            max_graph_revision: 0,
            node_page_index: 0,
            create_time: Utc::now(),
            end_time: None,
        }
    }

    pub fn with_parent(mut self, parent: Option<TaskId>) -> Self {
        self.parent_id = parent;
        self
    }

    pub fn with_window(mut self, window: RevisionWindow) -> Self {
        self.current_graph_revision = window.start;
        self.max_graph_revision = window.end;
        self
    }

    pub fn with_page(mut self, page: usize) -> Self {
        self.node_page_index = page;
        self
    }

    pub fn window(&self) -> RevisionWindow {
        RevisionWindow {
            start: self.current_graph_revision,
            end: self.max_graph_revision,
        }
    }
}
