//! Worker trait: the contract enrichment workers implement
//!
//! A worker declares which graph nodes it wants (its query pattern and
//! optional required keys) and turns each batch of matched nodes into new
//! nodes and edges.

use crate::adapter::AdapterRecord;
use crate::error::CoordinatorError;
use crate::message::{Edge, NodeData, Payload};
use crate::store::StorageError;
use crate::transport::TransportError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("worker error: {0}")]
    Internal(String),

    #[error("unknown worker type: {0}")]
    UnknownWorker(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

impl From<CoordinatorError> for WorkerError {
    fn from(e: CoordinatorError) -> Self {
        match e {
            CoordinatorError::Storage(e) => WorkerError::Storage(e),
            CoordinatorError::TransportPublish(e) => WorkerError::Transport(e),
            other => WorkerError::Internal(other.to_string()),
        }
    }
}

/// New graph data produced for one task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkResult {
    pub nodes: Vec<NodeData>,
    pub edges: Vec<Edge>,
}

impl WorkResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, node: NodeData) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

/// The contract workers implement.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Logical name; instances sharing a name are interchangeable
    fn name(&self) -> &str;

    /// Graph pattern selecting the nodes this worker handles
    fn graph_query(&self) -> &str;

    /// Depth bound used when the job sets none
    fn default_depth(&self) -> Option<u32> {
        None
    }

    /// Attribute regexes a changed node must satisfy
    fn required_keys(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Nodes per task when this worker is the only match; 0 defers to the coordinator
    fn max_nodes_per_task(&self) -> i64 {
        0
    }

    /// Process one task request.
    async fn process(&self, request: &Payload) -> WorkerResult<WorkResult>;

    /// The registry record announcing a new instance of this worker.
    fn record(&self) -> AdapterRecord {
        self.required_keys().into_iter().fold(
            AdapterRecord::new(self.name(), self.graph_query())
                .with_default_depth(self.default_depth())
                .with_max_nodes(self.max_nodes_per_task()),
            |record, (key, pattern)| record.with_required_key(key, pattern),
        )
    }
}
