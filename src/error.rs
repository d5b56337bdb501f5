//! Coordinator error taxonomy

use crate::graph::GraphError;
use crate::job::{InvalidTransition, JobId, TaskId};
use crate::store::StorageError;
use crate::transport::TransportError;
use thiserror::Error;

/// Errors raised while processing commands and payloads.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// A rejected state change. Logged by callers and never retried.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Unknown adapter: {0}")]
    UnknownAdapter(String),

    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    /// The graph store does not recognize the job
    #[error("Invalid graph for job {0}")]
    InvalidGraph(JobId),

    #[error("Graph store unavailable: {0}")]
    GraphUnavailable(String),

    /// Unrecoverable failure while processing a task
    #[error("Job {job_id} failed on task {task_id:?}: {reason}")]
    JobFailure {
        job_id: JobId,
        task_id: Option<TaskId>,
        reason: String,
    },

    #[error("Publish failed: {0}")]
    TransportPublish(#[source] TransportError),

    /// A command whose preconditions do not hold
    #[error("Command rejected for job {job_id}: {reason}")]
    Rejected { job_id: JobId, reason: String },

    #[error("Malformed seed: {0}")]
    MalformedSeed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

impl CoordinatorError {
    pub fn rejected(job_id: &JobId, reason: impl Into<String>) -> Self {
        Self::Rejected {
            job_id: job_id.clone(),
            reason: reason.into(),
        }
    }

    /// Whether the message that caused this error should be redelivered.
    ///
    /// Failures of a dependency that may come back are retried; failures of
    /// the message itself are not. A `JobFailure` has already been recorded
    /// against its task, so it is not retried either.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::GraphUnavailable(_)
                | CoordinatorError::TransportPublish(_)
                | CoordinatorError::Storage(_)
        )
    }
}

impl From<TransportError> for CoordinatorError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Serialization(e) => CoordinatorError::Serialization(e),
            other => CoordinatorError::TransportPublish(other),
        }
    }
}

/// Graph errors as seen from one job.
pub fn graph_error(job_id: &JobId, e: GraphError) -> CoordinatorError {
    match e {
        GraphError::InvalidGraph(id) => CoordinatorError::InvalidGraph(id),
        GraphError::Unavailable(reason) => CoordinatorError::GraphUnavailable(reason),
        GraphError::InvalidQuery(reason) | GraphError::InvalidData(reason) => {
            CoordinatorError::JobFailure {
                job_id: job_id.clone(),
                task_id: None,
                reason,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;

    #[test]
    fn retryable_errors() {
        let job = JobId::new("j");
        assert!(CoordinatorError::GraphUnavailable("down".into()).is_retryable());
        assert!(!CoordinatorError::rejected(&job, "nope").is_retryable());
        assert!(!CoordinatorError::InvalidGraph(job.clone()).is_retryable());
        let invalid = InvalidTransition {
            from: JobStatus::Stopped,
            to: JobStatus::Processing,
        };
        assert!(!CoordinatorError::from(invalid).is_retryable());
    }

    #[test]
    fn graph_errors_map_to_taxonomy() {
        let job = JobId::new("j");
        assert!(matches!(
            graph_error(&job, GraphError::InvalidGraph(job.clone())),
            CoordinatorError::InvalidGraph(_)
        ));
        assert!(matches!(
            graph_error(&job, GraphError::InvalidQuery("bad".into())),
            CoordinatorError::JobFailure { .. }
        ));
    }
}
