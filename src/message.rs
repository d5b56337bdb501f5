//! Messages exchanged over the transport
//!
//! Commands flow from submitters to the command processor. Payloads flow
//! between the command processor, the dispatch engine and the workers.
//! Both are encoded as JSON on the wire.

use crate::job::{JobConfig, JobId, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Priority of lifecycle commands.
pub const COMMAND_PRIORITY: u8 = 10;
/// Priority of worker responses and task requests.
pub const RESPONSE_PRIORITY: u8 = 5;
/// Priority of new-job seeds.
pub const NEW_JOB_PRIORITY: u8 = 1;

/// Attributes of a graph node. A node is identified by its `type` and `value`.
pub type NodeData = Map<String, Value>;

/// An edge between two nodes, each identified by `type` and `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeData,
    pub target: NodeData,
    #[serde(default)]
    pub attributes: NodeData,
}

impl Edge {
    pub fn new(source: NodeData, target: NodeData, kind: &str) -> Self {
        let mut attributes = NodeData::new();
        attributes.insert("type".into(), Value::String(kind.to_string()));
        Self {
            source,
            target,
            attributes,
        }
    }
}

/// Build a node from its type and value.
pub fn node(kind: &str, value: &str) -> NodeData {
    let mut data = NodeData::new();
    data.insert("type".into(), Value::String(kind.to_string()));
    data.insert("value".into(), Value::String(value.to_string()));
    data
}

/// Identity of a node: its `type` and `value`, when both are present.
pub fn node_key(data: &NodeData) -> Option<String> {
    let text = |v: &Value| match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    Some(format!("{}\u{1f}{}", text(data.get("type")?)?, text(data.get("value")?)?))
}

/// Attributes of `current` that `cached` lacks or holds a different value for.
pub fn attribute_diff(cached: &NodeData, current: &NodeData) -> NodeData {
    current
        .iter()
        .filter(|(key, value)| cached.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Anything routed by job id.
pub trait JobScoped {
    fn job_id(&self) -> &JobId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    New,
    Add,
    Stop,
    Reset,
    ExecuteOnNodes,
    Retry,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommandKind::New => "NEW",
            CommandKind::Add => "ADD",
            CommandKind::Stop => "STOP",
            CommandKind::Reset => "RESET",
            CommandKind::ExecuteOnNodes => "EXECUTE_ON_NODES",
            CommandKind::Retry => "RETRY",
        };
        f.write_str(s)
    }
}

/// A job lifecycle command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    pub job_id: JobId,
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub adapters: Vec<String>,
    #[serde(default)]
    pub seed: Seed,
    /// Annotation for RESET
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Lets a RESET replace the reason of an already reset job
    #[serde(default)]
    pub overwrite: bool,
    /// Target node ids for EXECUTE_ON_NODES
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_ids: Vec<u64>,
    /// Restricts RETRY to these tasks; empty means every failed task
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_ids: Vec<TaskId>,
}

/// Graph data and configuration carried by NEW and ADD.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub nodes: Vec<NodeData>,
    pub edges: Vec<Edge>,
    pub config: JobConfig,
}

impl Command {
    pub fn new(kind: CommandKind, job_id: JobId) -> Self {
        Self {
            kind,
            job_id,
            ttl: 0,
            priority: String::new(),
            adapters: Vec::new(),
            seed: Seed::default(),
            reason: None,
            overwrite: false,
            node_ids: Vec::new(),
            task_ids: Vec::new(),
        }
    }

    pub fn with_adapters<I, S>(mut self, adapters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.adapters = adapters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_seed(mut self, seed: Seed) -> Self {
        self.ttl = seed.config.ttl;
        self.priority = seed.config.priority.clone();
        self.seed = seed;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>, overwrite: bool) -> Self {
        self.reason = Some(reason.into());
        self.overwrite = overwrite;
        self
    }

    pub fn with_node_ids(mut self, ids: Vec<u64>) -> Self {
        self.node_ids = ids;
        self
    }

    pub fn with_task_ids(mut self, ids: Vec<TaskId>) -> Self {
        self.task_ids = ids;
        self
    }

    /// Queue priority of this command.
    pub fn queue_priority(&self) -> u8 {
        match self.kind {
            CommandKind::New => NEW_JOB_PRIORITY,
            _ => COMMAND_PRIORITY,
        }
    }
}

impl JobScoped for Command {
    fn job_id(&self) -> &JobId {
        &self.job_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadKind {
    /// A request from the coordinator, either to a worker or to the engine
    Command,
    AdapterResponse,
    AdapterResponseFailure,
}

/// Coordinator-internal instructions for the dispatch engine.
///
/// Kept out of the job config so they are never persisted with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InternalOp {
    /// Run a one-time adapter list against explicit node ids
    PostAction {
        node_ids: Vec<u64>,
        adapters: Vec<String>,
    },
    /// Re-dispatch these failed tasks
    Retry { task_ids: Vec<TaskId> },
}

/// The unit of data exchanged between the coordinator and workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Fresh for every payload built; a redelivery carries the same id
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub job_id: JobId,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub request_nodes: Vec<NodeData>,
    #[serde(default)]
    pub request_edges: Vec<Edge>,
    #[serde(default)]
    pub response_nodes: Vec<NodeData>,
    #[serde(default)]
    pub response_edges: Vec<Edge>,
    #[serde(default)]
    pub job_config: JobConfig,
    pub kind: PayloadKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<InternalOp>,
}

impl Payload {
    fn empty(job_id: JobId, kind: PayloadKind, job_config: JobConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            task_id: None,
            request_nodes: Vec::new(),
            request_edges: Vec::new(),
            response_nodes: Vec::new(),
            response_edges: Vec::new(),
            job_config,
            kind,
            internal: None,
        }
    }

    /// Seed data entering the engine as if a worker had produced it.
    pub fn seed(job_id: JobId, seed: Seed) -> Self {
        let mut payload = Self::empty(job_id, PayloadKind::AdapterResponse, seed.config);
        payload.response_nodes = seed.nodes;
        payload.response_edges = seed.edges;
        payload
    }

    /// A task request sent to a worker queue.
    pub fn task_request(
        job_id: JobId,
        task_id: TaskId,
        nodes: Vec<NodeData>,
        job_config: JobConfig,
    ) -> Self {
        let mut payload = Self::empty(job_id, PayloadKind::Command, job_config);
        payload.task_id = Some(task_id);
        payload.request_nodes = nodes;
        payload
    }

    /// A coordinator-internal instruction for the engine.
    pub fn internal(job_id: JobId, op: InternalOp, job_config: JobConfig) -> Self {
        let mut payload = Self::empty(job_id, PayloadKind::Command, job_config);
        payload.internal = Some(op);
        payload
    }

    /// The successful answer to this task request.
    pub fn respond(&self, nodes: Vec<NodeData>, edges: Vec<Edge>) -> Self {
        let mut payload = Self::empty(
            self.job_id.clone(),
            PayloadKind::AdapterResponse,
            self.job_config.clone(),
        );
        payload.task_id = self.task_id;
        payload.request_nodes = self.request_nodes.clone();
        payload.request_edges = self.request_edges.clone();
        payload.response_nodes = nodes;
        payload.response_edges = edges;
        payload
    }

    /// The failure answer to this task request.
    pub fn fail(&self) -> Self {
        let mut payload = self.respond(Vec::new(), Vec::new());
        payload.kind = PayloadKind::AdapterResponseFailure;
        payload
    }
}

impl JobScoped for Payload {
    fn job_id(&self) -> &JobId {
        &self.job_id
    }
}
