//! Worker capability records and the adapter registry

mod record;
mod registry;

pub use record::{AdapterId, AdapterRecord, AdapterStatus};
pub use registry::{resolve_depth, AdapterRegistry};
