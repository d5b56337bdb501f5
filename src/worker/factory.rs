//! Worker type registry
//!
//! Maps a worker type name to a constructor, so a host can start the workers
//! named in its configuration.

use super::demo::{HelloWorker, ReverseWorker};
use super::traits::{Worker, WorkerError, WorkerResult};
use std::collections::BTreeMap;
use std::sync::Arc;

type Constructor = Box<dyn Fn() -> Arc<dyn Worker> + Send + Sync>;

#[derive(Default)]
pub struct WorkerFactory {
    constructors: BTreeMap<String, Constructor>,
}

impl WorkerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory knowing the built-in workers.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.register("hello", || Arc::new(HelloWorker));
        factory.register("reverse", || Arc::new(ReverseWorker));
        factory
    }

    /// Register a constructor. Names are case-insensitive; a later registration wins.
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn() -> Arc<dyn Worker> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_lowercase(), Box::new(constructor));
    }

    pub fn create(&self, name: &str) -> WorkerResult<Arc<dyn Worker>> {
        self.constructors
            .get(&name.to_lowercase())
            .map(|constructor| constructor())
            .ok_or_else(|| WorkerError::UnknownWorker(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}
