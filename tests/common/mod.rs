//! Common fixtures for coordinator integration tests
//!
//! A [`Harness`] wires an in-memory SQLite store, graph and transport into a
//! coordinator plus any number of in-process worker hosts. Nothing runs in
//! the background: tests advance the system by pumping queues.

#![allow(dead_code)]

use async_trait::async_trait;
use ripple::coordinator::pump;
use ripple::message::node;
use ripple::worker::WorkerResult;
use ripple::{
    Coordinator, CoordinatorContext, Job, JobConfig, JobId, JobStatus, JobStore, MemoryGraph,
    MemoryTransport, NodeData, OpenStore, Payload, Seed, Settings, SqliteStore, WorkResult,
    Worker, WorkerError, WorkerHost,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const MAX_ROUNDS: usize = 1_000;

pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub graph: Arc<MemoryGraph>,
    pub transport: Arc<MemoryTransport>,
    pub ctx: CoordinatorContext,
    pub coordinator: Coordinator,
    pub hosts: Vec<WorkerHost>,
}

impl Harness {
    pub async fn new(settings: Settings) -> Self {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let graph = Arc::new(MemoryGraph::new());
        let transport = Arc::new(MemoryTransport::new());
        let ctx = CoordinatorContext::new(settings, store.clone(), graph.clone(), transport.clone());
        ctx.declare_queues().await.unwrap();
        Self {
            coordinator: Coordinator::new(ctx.clone()),
            store,
            graph,
            transport,
            ctx,
            hosts: Vec::new(),
        }
    }

    pub async fn with_workers(settings: Settings, workers: Vec<Arc<dyn Worker>>) -> Self {
        let mut harness = Self::new(settings).await;
        for worker in workers {
            harness.add_worker(worker).await;
        }
        harness
    }

    /// Register and host one worker instance.
    pub async fn add_worker(&mut self, worker: Arc<dyn Worker>) -> &WorkerHost {
        let host = WorkerHost::new(worker, &self.ctx);
        host.register().await.unwrap();
        self.hosts.push(host);
        self.hosts.last().unwrap()
    }

    /// One round: ready commands, payloads and task requests are each handled once.
    pub async fn step(&self) -> usize {
        let mut handled = self.coordinator.pump().await.unwrap();
        for host in &self.hosts {
            handled += host.pump().await.unwrap();
        }
        handled
    }

    /// Handle the ready commands only.
    pub async fn pump_commands(&self) -> usize {
        let queue = &self.ctx.settings.command_queue;
        pump(self.transport.as_ref(), queue, self.coordinator.commands())
            .await
            .unwrap()
    }

    /// Handle the ready engine payloads only.
    pub async fn pump_engine(&self) -> usize {
        let queue = &self.ctx.settings.engine_queue;
        pump(self.transport.as_ref(), queue, self.coordinator.engine())
            .await
            .unwrap()
    }

    /// Step until every queue is empty.
    pub async fn settle(&self) {
        for _ in 0..MAX_ROUNDS {
            if self.step().await == 0 {
                return;
            }
        }
        panic!("system did not settle within {MAX_ROUNDS} rounds");
    }

    pub async fn submit(&self, adapters: &[&str], seed: Seed) -> JobId {
        self.coordinator
            .submitter()
            .submit_new(adapters.iter().copied(), seed)
            .await
            .unwrap()
    }

    pub fn job(&self, id: &JobId) -> Job {
        self.store.get_job(id).unwrap().unwrap()
    }

    pub fn status(&self, id: &JobId) -> JobStatus {
        self.store.job_state(id).unwrap().unwrap().0
    }
}

pub fn seed_of(nodes: Vec<NodeData>, config: JobConfig) -> Seed {
    Seed {
        nodes,
        edges: Vec::new(),
        config,
    }
}

fn value_of(data: &NodeData) -> String {
    match data.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Turns each matched node into one new node of `output` type.
pub struct PatternWorker {
    pub name: String,
    pub query: String,
    pub output: String,
    pub default_depth: Option<u32>,
    pub max_nodes: i64,
    pub required_keys: BTreeMap<String, String>,
}

impl PatternWorker {
    pub fn new(name: &str, query: &str, output: &str) -> Self {
        Self {
            name: name.to_string(),
            query: query.to_string(),
            output: output.to_string(),
            default_depth: None,
            max_nodes: 0,
            required_keys: BTreeMap::new(),
        }
    }

    pub fn with_required_key(mut self, key: &str, pattern: &str) -> Self {
        self.required_keys.insert(key.to_string(), pattern.to_string());
        self
    }

    pub fn with_default_depth(mut self, depth: u32) -> Self {
        self.default_depth = Some(depth);
        self
    }

    pub fn with_max_nodes(mut self, max_nodes: i64) -> Self {
        self.max_nodes = max_nodes;
        self
    }
}

#[async_trait]
impl Worker for PatternWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn graph_query(&self) -> &str {
        &self.query
    }

    fn default_depth(&self) -> Option<u32> {
        self.default_depth
    }

    fn max_nodes_per_task(&self) -> i64 {
        self.max_nodes
    }

    fn required_keys(&self) -> BTreeMap<String, String> {
        self.required_keys.clone()
    }

    async fn process(&self, request: &Payload) -> WorkerResult<WorkResult> {
        Ok(request
            .request_nodes
            .iter()
            .fold(WorkResult::new(), |result, source| {
                let value = format!("{}>{}", value_of(source), self.name);
                result.with_node(node(&self.output, &value))
            }))
    }
}

/// Emits `batch` brand-new nodes of `output` type for every request.
pub struct FloodWorker {
    pub query: String,
    pub output: String,
    pub batch: usize,
    counter: AtomicU64,
}

impl FloodWorker {
    pub fn new(query: &str, output: &str, batch: usize) -> Self {
        Self {
            query: query.to_string(),
            output: output.to_string(),
            batch,
            counter: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Worker for FloodWorker {
    fn name(&self) -> &str {
        "flood"
    }

    fn graph_query(&self) -> &str {
        &self.query
    }

    async fn process(&self, _request: &Payload) -> WorkerResult<WorkResult> {
        let mut result = WorkResult::new();
        for _ in 0..self.batch {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            result = result.with_node(node(&self.output, &format!("flood-{n}")));
        }
        Ok(result)
    }
}

/// Fails every request while `failing` is set, otherwise echoes one node per request.
pub struct FlakyWorker {
    pub failing: AtomicBool,
}

impl FlakyWorker {
    pub fn new(failing: bool) -> Self {
        Self {
            failing: AtomicBool::new(failing),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl Worker for FlakyWorker {
    fn name(&self) -> &str {
        "flaky"
    }

    fn graph_query(&self) -> &str {
        "n(type=host)"
    }

    async fn process(&self, request: &Payload) -> WorkerResult<WorkResult> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(WorkerError::Internal("upstream lookup timed out".into()));
        }
        Ok(request
            .request_nodes
            .iter()
            .fold(WorkResult::new(), |result, source| {
                result.with_node(node("address", &format!("addr-of-{}", value_of(source))))
            }))
    }
}
