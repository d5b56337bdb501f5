//! Ripple: coordination engine for graph-enrichment jobs
//!
//! A job starts from a few seed nodes. Independent workers each watch the
//! job's graph for nodes matching their pattern, and whatever they return is
//! appended to the graph, which may in turn match other workers. The
//! coordinator drives that cascade until nothing new matches.
//!
//! # Core Concepts
//!
//! - **Jobs**: a graph under enrichment, with its lifecycle status and logs
//! - **Tasks**: one batch of matched nodes sent to one worker
//! - **Adapters**: registered worker instances with their query patterns
//! - **Cycles**: one inbound payload appended to the graph and fanned out as tasks
//!
//! # Example
//!
//! ```
//! use ripple::{JobConfig, JobStatus};
//!
//! let config = JobConfig::new().with_depth(2);
//! assert_eq!(config.depth, Some(2));
//! assert!(JobStatus::New.transition_to(JobStatus::Processing).is_ok());
//! ```

pub mod adapter;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod graph;
pub mod job;
pub mod logging;
pub mod message;
pub mod store;
pub mod transport;
pub mod worker;

pub use adapter::{resolve_depth, AdapterId, AdapterRecord, AdapterRegistry, AdapterStatus};
pub use config::{ConfigError, GraphStoreMode, Settings};
pub use coordinator::{
    CancellationToken, Coordinator, CoordinatorContext, CoordinatorHandle, JobSubmitter,
};
pub use error::{CoordinatorError, CoordinatorResult};
pub use graph::{GraphError, GraphQuery, GraphService, MemoryGraph, PostResult};
pub use job::{
    HistoryEntry, HistoryKind, Job, JobConfig, JobError, JobId, JobStatus, RevisionWindow, Task,
    TaskId, TaskStatus,
};
pub use message::{node, Command, CommandKind, Edge, NodeData, Payload, PayloadKind, Seed};
pub use store::{AdapterStore, CycleMark, JobStore, OpenStore, SqliteStore, StorageError, StorageResult, Store};
pub use transport::{MemoryTransport, Transport, TransportError};
pub use worker::{WorkResult, Worker, WorkerError, WorkerFactory, WorkerHost};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
