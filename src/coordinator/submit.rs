//! Client side of the command queue
//!
//! [`JobSubmitter`] creates jobs and sends lifecycle commands. A new job gets
//! its id from the graph store, is recorded as NEW, and is then handed to the
//! command processor.

use super::CoordinatorContext;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::graph::GraphError;
use crate::job::{HistoryEntry, HistoryKind, Job, JobId, TaskId};
use crate::message::{Command, CommandKind, Edge, NodeData, Seed};
use crate::transport::publish_json;
use serde_json::Value;
use tracing::info;

/// Check that a seed holds only well-formed nodes and edges.
///
/// A node needs non-empty string `type` and `value` attributes; an edge
/// needs well-formed endpoints.
pub fn validate_seed(seed: &Seed) -> CoordinatorResult<()> {
    for (i, node) in seed.nodes.iter().enumerate() {
        check_node(node).map_err(|why| CoordinatorError::MalformedSeed(format!("node {i}: {why}")))?;
    }
    for (i, edge) in seed.edges.iter().enumerate() {
        check_edge(edge).map_err(|why| CoordinatorError::MalformedSeed(format!("edge {i}: {why}")))?;
    }
    Ok(())
}

fn check_node(node: &NodeData) -> Result<(), String> {
    for key in ["type", "value"] {
        match node.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            Some(Value::String(_)) => return Err(format!("empty {key}")),
            Some(_) => return Err(format!("{key} is not a string")),
            None => return Err(format!("missing {key}")),
        }
    }
    Ok(())
}

fn check_edge(edge: &Edge) -> Result<(), String> {
    check_node(&edge.source).map_err(|why| format!("source {why}"))?;
    check_node(&edge.target).map_err(|why| format!("target {why}"))
}

pub struct JobSubmitter {
    ctx: CoordinatorContext,
}

impl JobSubmitter {
    pub fn new(ctx: CoordinatorContext) -> Self {
        Self { ctx }
    }

    /// Create a job and queue its NEW command.
    pub async fn submit_new<I, S>(&self, adapters: I, seed: Seed) -> CoordinatorResult<JobId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        validate_seed(&seed)?;
        let adapters: Vec<String> = adapters.into_iter().map(Into::into).collect();

        let job_id = self
            .ctx
            .graph
            .create_graph(&seed.config)
            .await
            .map_err(|e| match e {
                GraphError::Unavailable(reason) => CoordinatorError::GraphUnavailable(reason),
                other => CoordinatorError::MalformedSeed(other.to_string()),
            })?;

        let job = Job::new(job_id.clone(), &adapters, seed.config.clone()).with_default_schedule(
            self.ctx.settings.default_reset_days,
            self.ctx.settings.default_expire_days,
        );
        self.ctx.store.save_job(&job)?;
        self.ctx
            .store
            .append_history(&job_id, &HistoryEntry::new(HistoryKind::Created, "job submitted"))?;

        let command = Command::new(CommandKind::New, job_id.clone())
            .with_adapters(adapters)
            .with_seed(seed);
        self.send(&command).await?;
        info!(job_id = %job_id, "job submitted");
        Ok(job_id)
    }

    /// Add seed data and adapters to a running job.
    pub async fn send_add<I, S>(&self, job_id: &JobId, adapters: I, seed: Seed) -> CoordinatorResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        validate_seed(&seed)?;
        let command = Command::new(CommandKind::Add, job_id.clone())
            .with_adapters(adapters)
            .with_seed(seed);
        self.send(&command).await
    }

    pub async fn send_stop(&self, job_id: &JobId) -> CoordinatorResult<()> {
        self.send(&Command::new(CommandKind::Stop, job_id.clone())).await
    }

    pub async fn send_reset(&self, job_id: &JobId, reason: &str, overwrite: bool) -> CoordinatorResult<()> {
        let command = Command::new(CommandKind::Reset, job_id.clone()).with_reason(reason, overwrite);
        self.send(&command).await
    }

    /// Run the given adapters once over specific graph nodes.
    pub async fn send_execute_on_nodes<I, S>(
        &self,
        job_id: &JobId,
        node_ids: Vec<u64>,
        adapters: I,
    ) -> CoordinatorResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = Command::new(CommandKind::ExecuteOnNodes, job_id.clone())
            .with_adapters(adapters)
            .with_node_ids(node_ids);
        self.send(&command).await
    }

    /// Replay failed tasks; an empty list means all of them.
    pub async fn send_retry(&self, job_id: &JobId, task_ids: Vec<TaskId>) -> CoordinatorResult<()> {
        let command = Command::new(CommandKind::Retry, job_id.clone()).with_task_ids(task_ids);
        self.send(&command).await
    }

    async fn send(&self, command: &Command) -> CoordinatorResult<()> {
        publish_json(
            self.ctx.transport.as_ref(),
            &self.ctx.settings.command_queue,
            command.queue_priority(),
            command,
        )
        .await
        .map_err(CoordinatorError::from)
    }
}
