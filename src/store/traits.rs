//! Storage trait definitions

use crate::adapter::{AdapterId, AdapterRecord, AdapterStatus};
use crate::message::NodeData;
use crate::job::{
    HistoryEntry, Job, JobConfig, JobError, JobId, JobStatus, RevisionWindow, Task, TaskId,
    TaskStatus,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// An engine cycle that started but has not been acknowledged yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleMark {
    pub job_id: JobId,
    /// Revisions the message added to the graph on its first attempt
    pub window: Option<RevisionWindow>,
}

/// Persistence for jobs, their tasks and their logs.
///
/// Every mutation is a single atomic update so that concurrent writers
/// (the dispatch partitions and the maintenance loop) never lose each
/// other's changes.
pub trait JobStore: Send + Sync {
    // === Job Operations ===

    /// Insert or replace a job's own columns. Tasks and logs are untouched.
    fn save_job(&self, job: &Job) -> StorageResult<()>;

    /// Load a job with its tasks, history and errors
    fn get_job(&self, id: &JobId) -> StorageResult<Option<Job>>;

    /// Current status and graph activity, without loading the rest
    fn job_state(&self, id: &JobId) -> StorageResult<Option<(JobStatus, u64)>>;

    /// Delete a job together with its tasks and logs
    fn delete_job(&self, id: &JobId) -> StorageResult<bool>;

    /// Set status only if it is currently `expected`
    fn compare_and_set_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        status: JobStatus,
    ) -> StorageResult<bool>;

    fn set_reason(&self, id: &JobId, reason: &str) -> StorageResult<()>;

    fn set_config(&self, id: &JobId, config: &JobConfig) -> StorageResult<()>;

    fn set_adapters(&self, id: &JobId, adapters: &BTreeSet<String>) -> StorageResult<()>;

    /// Record the first time the job started processing; later calls keep the original
    fn mark_started(&self, id: &JobId, at: DateTime<Utc>) -> StorageResult<()>;

    fn touch_last_task_time(&self, id: &JobId, at: DateTime<Utc>) -> StorageResult<()>;

    /// Raise graph activity to `revision` if higher; returns the stored value
    fn raise_graph_activity(&self, id: &JobId, revision: u64) -> StorageResult<u64>;

    fn append_history(&self, id: &JobId, entry: &HistoryEntry) -> StorageResult<()>;

    fn append_error(&self, id: &JobId, error: &JobError) -> StorageResult<()>;

    /// Remove job errors attributed to a task
    fn remove_errors_for_task(&self, id: &JobId, task_id: &TaskId) -> StorageResult<usize>;

    // === Range Queries ===

    fn list_jobs(&self) -> StorageResult<Vec<JobId>>;

    fn jobs_by_status(&self, status: JobStatus) -> StorageResult<Vec<JobId>>;

    /// Jobs whose reset time has passed and whose status is one of `statuses`
    fn jobs_due_for_reset(
        &self,
        now: DateTime<Utc>,
        statuses: &[JobStatus],
    ) -> StorageResult<Vec<JobId>>;

    fn jobs_due_for_expire(&self, now: DateTime<Utc>) -> StorageResult<Vec<JobId>>;

    fn jobs_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<JobId>>;

    // === Task Operations ===

    fn insert_task(&self, task: &Task) -> StorageResult<()>;

    fn get_task(&self, id: &TaskId) -> StorageResult<Option<Task>>;

    fn tasks_for_job(&self, job_id: &JobId) -> StorageResult<Vec<Task>>;

    fn active_task_count(&self, job_id: &JobId) -> StorageResult<usize>;

    /// Set a task's status only if it is currently `expected`
    fn transition_task(
        &self,
        id: &TaskId,
        expected: TaskStatus,
        status: TaskStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<bool>;

    // === Task Errors ===

    fn append_task_error(&self, task_id: &TaskId, error: &JobError) -> StorageResult<()>;

    fn latest_task_error(&self, task_id: &TaskId) -> StorageResult<Option<JobError>>;

    fn clear_task_errors(&self, task_id: &TaskId) -> StorageResult<usize>;

    // === Cycle Marks ===

    /// Remember that the engine is handling message `message_id`
    fn mark_cycle(
        &self,
        job_id: &JobId,
        message_id: &Uuid,
        window: Option<RevisionWindow>,
    ) -> StorageResult<()>;

    /// The mark an earlier attempt at this message left behind
    fn cycle_mark(&self, message_id: &Uuid) -> StorageResult<Option<CycleMark>>;

    fn clear_cycle_mark(&self, message_id: &Uuid) -> StorageResult<()>;

    // === Node Cache ===

    /// Last known attributes of a node, keyed by its identity
    fn cached_node(&self, job_id: &JobId, key: &str) -> StorageResult<Option<NodeData>>;

    fn cache_node(&self, job_id: &JobId, key: &str, node: &NodeData) -> StorageResult<()>;

    fn clear_node_cache(&self, job_id: &JobId) -> StorageResult<usize>;
}

/// The adapter registry's key-value namespace: one typed record per worker id.
pub trait AdapterStore: Send + Sync {
    fn upsert_adapter(&self, record: &AdapterRecord) -> StorageResult<()>;

    fn get_adapter(&self, id: &AdapterId) -> StorageResult<Option<AdapterRecord>>;

    /// All records, in registration order
    fn adapters(&self) -> StorageResult<Vec<AdapterRecord>>;

    fn heartbeat(&self, id: &AdapterId, at: DateTime<Utc>) -> StorageResult<bool>;

    fn set_adapter_status(&self, id: &AdapterId, status: AdapterStatus) -> StorageResult<bool>;

    fn increment_task_count(&self, id: &AdapterId) -> StorageResult<()>;

    fn remove_adapter(&self, id: &AdapterId) -> StorageResult<bool>;
}

/// Everything the coordinator persists.
pub trait Store: JobStore + AdapterStore {}

impl<T: JobStore + AdapterStore> Store for T {}

/// Extension trait for opening stores from paths
pub trait OpenStore: Store + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
