//! Graph store interface
//!
//! The coordinator treats the graph store as a black box: it creates and
//! deletes per-job graphs, appends worker results, and runs batched pattern
//! queries over a revision window.

mod memory;
mod query;

pub use memory::MemoryGraph;
pub use query::{CompiledQuery, GraphQuery};

use crate::adapter::AdapterId;
use crate::job::{JobConfig, JobId, RevisionWindow};
use crate::message::{NodeData, Payload};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    /// The store does not know this job's graph
    #[error("Invalid graph: {0}")]
    InvalidGraph(JobId),

    #[error("Graph store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid graph data: {0}")]
    InvalidData(String),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Outcome of appending data to a job's graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostResult {
    pub success: bool,
    /// Latest revision of the graph after the append
    pub max_revision_id: u64,
    /// Revisions introduced by this append
    pub update_count: u64,
}

impl PostResult {
    pub fn window(&self) -> Option<RevisionWindow> {
        RevisionWindow::ending_at(self.max_revision_id, self.update_count)
    }
}

/// Matched nodes keyed by the rendered query that matched them.
pub type PatternMatches = HashMap<String, Vec<NodeData>>;

#[async_trait]
pub trait GraphService: Send + Sync {
    /// Create a graph for a new job and return its id.
    async fn create_graph(&self, config: &JobConfig) -> GraphResult<JobId>;

    /// Delete a job's graph. Deleting a graph that does not exist succeeds.
    async fn delete_graph(&self, job_id: &JobId) -> GraphResult<()>;

    /// Append the payload's response nodes and edges.
    async fn post_to_graph(&self, job_id: &JobId, payload: &Payload) -> GraphResult<PostResult>;

    /// Run several queries in one call.
    ///
    /// `queries` maps each worker instance to its rendered query. The
    /// result holds one entry per distinct query. With a window, only nodes
    /// changed inside it can match.
    async fn query_patterns(
        &self,
        job_id: &JobId,
        queries: &BTreeMap<AdapterId, String>,
        window: Option<RevisionWindow>,
    ) -> GraphResult<PatternMatches>;
}
