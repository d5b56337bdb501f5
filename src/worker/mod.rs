//! Worker side of the coordinator contract
//!
//! Workers run in their own hosts, read task requests from a per-instance
//! queue and answer on the engine queue.

pub mod demo;
mod factory;
mod host;
mod traits;

pub use factory::WorkerFactory;
pub use host::WorkerHost;
pub use traits::{WorkResult, Worker, WorkerError, WorkerResult};
