//! Persistence for jobs, tasks and adapter registrations
//!
//! The coordinator talks to storage through the `JobStore` and
//! `AdapterStore` traits. The primary implementation is `SqliteStore`.

mod sqlite;
mod traits;

pub use sqlite::SqliteStore;
pub use traits::{AdapterStore, CycleMark, JobStore, OpenStore, StorageError, StorageResult, Store};
