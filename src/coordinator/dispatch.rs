//! Dispatch engine: turns graph deltas into tasks
//!
//! Each inbound payload is one cycle. A worker response is appended to the
//! job's graph; the revisions it introduced are then matched against every
//! approved worker's pattern, and the matches are split into tasks and
//! published to the workers' queues. A cycle that spawns nothing and leaves
//! no task active finishes the job. With the internal graph-store mode the
//! workers are picked per node instead: each response node is diffed against
//! the job's node cache and the changed attributes are matched against the
//! workers' required keys.
//!
//! Payloads arrive at least once. A cycle leaves a mark keyed by the payload
//! id until it is acknowledged, so a redelivered payload reuses the revision
//! window of its first attempt and skips the tasks that attempt published.

use super::lifecycle;
use super::pool::{Disposition, MessageHandler};
use super::CoordinatorContext;
use crate::adapter::AdapterRecord;
use crate::config::GraphStoreMode;
use crate::error::{graph_error, CoordinatorError, CoordinatorResult};
use crate::graph::{GraphError, GraphQuery};
use crate::job::{
    normalize_adapters, HistoryEntry, HistoryKind, Job, JobError, JobId, JobStatus,
    RevisionWindow, Task, TaskId, TaskStatus, Transition,
};
use crate::message::{
    attribute_diff, node_key, InternalOp, NodeData, Payload, PayloadKind, RESPONSE_PRIORITY,
};
use crate::store::CycleMark;
use crate::transport::publish_json;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::ops::Range;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a job accepts no further work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    Stopped,
    Expired,
    /// Graph activity is above the configured ceiling
    GraphLimit,
}

/// Check whether a job in this state may still dispatch.
pub fn halt_reason(status: JobStatus, graph_activity: u64, max_graph_size: i64) -> Option<Halt> {
    match status {
        JobStatus::Stopped => Some(Halt::Stopped),
        JobStatus::Expired => Some(Halt::Expired),
        _ if max_graph_size > 0 && graph_activity > max_graph_size as u64 => Some(Halt::GraphLimit),
        _ => None,
    }
}

/// Chunk size for one worker.
///
/// The worker's own limit applies only when it is the sole worker for the
/// pattern and it splits more finely than the global setting.
pub fn effective_chunk_size(global: i64, worker: &AdapterRecord, eligible: usize) -> i64 {
    let own = worker.max_nodes_per_task;
    if eligible == 1 && own > 0 && (global <= 0 || own < global) {
        own
    } else {
        global
    }
}

/// Split `len` matches into consecutive chunks of at most `size`.
///
/// A size of zero or less keeps everything in one chunk.
pub fn plan_chunks(len: usize, size: i64) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    if size <= 0 {
        return vec![0..len];
    }
    let size = size as usize;
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub spawned: Vec<TaskId>,
    pub dropped: Vec<TaskId>,
    pub update_count: u64,
    pub halted: Option<Halt>,
    pub finished: Option<JobStatus>,
}

/// Which nodes a dispatch considers and how tasks are labelled.
struct Scope<'a> {
    window: Option<RevisionWindow>,
    ids: &'a [u64],
    /// Add the resolved depth bound to each query
    bounded: bool,
    /// Only dispatch this chunk index
    page: Option<usize>,
    /// Reuse tasks an earlier attempt at the same payload already published
    redelivered: bool,
}

/// A task an earlier attempt published for the same worker, window and chunk.
fn published_earlier<'a>(
    job: &'a Job,
    worker: &AdapterRecord,
    parent: Option<TaskId>,
    window: RevisionWindow,
    page: usize,
) -> Option<&'a Task> {
    job.tasks.values().find(|t| {
        matches!(t.status, TaskStatus::Processing | TaskStatus::Complete)
            && t.adapter_name.eq_ignore_ascii_case(&worker.name)
            && t.parent_id == parent
            && t.window() == window
            && t.node_page_index == page
    })
}

pub struct DispatchEngine {
    ctx: CoordinatorContext,
}

impl DispatchEngine {
    pub fn new(ctx: CoordinatorContext) -> Self {
        Self { ctx }
    }

    /// Run one cycle for an inbound payload.
    pub async fn handle(&self, payload: Payload) -> CoordinatorResult<CycleReport> {
        let Some(job) = self.ctx.store.get_job(&payload.job_id)? else {
            warn!(job_id = %payload.job_id, "payload for unknown job dropped");
            return Ok(CycleReport::default());
        };

        let message_id = payload.id;
        let earlier = self.ctx.store.cycle_mark(&message_id)?;
        if earlier.is_some() {
            info!(job_id = %job.id, message_id = %message_id, "resuming a redelivered payload");
        }

        let report = match payload.internal.clone() {
            Some(InternalOp::PostAction { node_ids, adapters }) => {
                self.post_action(job, payload, &node_ids, adapters, earlier.is_some())
                    .await?
            }
            Some(InternalOp::Retry { task_ids }) => {
                self.retry(job, message_id, &task_ids, earlier.is_some())
                    .await?
            }
            None => self.respond(job, payload, earlier).await?,
        };
        self.ctx.store.clear_cycle_mark(&message_id)?;
        Ok(report)
    }

    fn max_graph_size(&self) -> i64 {
        self.ctx.settings.max_graph_size
    }

    async fn respond(
        &self,
        job: Job,
        mut payload: Payload,
        earlier: Option<CycleMark>,
    ) -> CoordinatorResult<CycleReport> {
        let started = Utc::now();
        let origin = payload.task_id.take();
        let adapter = match origin {
            Some(id) => self.ctx.store.get_task(&id)?.map(|t| t.adapter_name),
            None => None,
        };
        let mut report = CycleReport::default();

        if let Some(halt) = halt_reason(job.status, job.graph_activity, self.max_graph_size()) {
            if let Some(task_id) = origin {
                if self.close_task(&task_id, TaskStatus::Dropped)? {
                    report.dropped.push(task_id);
                }
            }
            if halt == Halt::GraphLimit {
                self.stop_for_size(&job.id, job.graph_activity)?;
            }
            debug!(job_id = %job.id, ?halt, "job halted, response dropped");
            report.halted = Some(halt);
            return Ok(report);
        }

        self.mark_processing(&job.id)?;

        if payload.kind == PayloadKind::AdapterResponseFailure {
            if let Some(task_id) = origin {
                self.fail_task(&job.id, task_id, adapter.as_deref(), None)?;
            }
        } else {
            let post = match self.ctx.graph.post_to_graph(&job.id, &payload).await {
                Ok(post) => post,
                Err(GraphError::Unavailable(reason)) => {
                    return Err(CoordinatorError::GraphUnavailable(reason));
                }
                Err(e) => {
                    let err = graph_error(&job.id, e);
                    if let Some(task_id) = origin {
                        self.fail_task(&job.id, task_id, adapter.as_deref(), Some(err.to_string()))?;
                    }
                    return Err(err);
                }
            };
            if !post.success {
                if let Some(task_id) = origin {
                    let reason = "graph store rejected the update".to_string();
                    self.fail_task(&job.id, task_id, adapter.as_deref(), Some(reason))?;
                }
                return Err(CoordinatorError::JobFailure {
                    job_id: job.id.clone(),
                    task_id: origin,
                    reason: "graph store rejected the update".into(),
                });
            }

            report.update_count = post.update_count;
            // an append repeated on redelivery adds nothing, so keep the first window
            let window = post.window().or(earlier.as_ref().and_then(|m| m.window));
            self.ctx.store.mark_cycle(&job.id, &payload.id, window)?;
            let activity = self
                .ctx
                .store
                .raise_graph_activity(&job.id, post.max_revision_id)?;
            let status = self
                .ctx
                .store
                .job_state(&job.id)?
                .map_or(job.status, |(status, _)| status);

            if let Some(halt) = halt_reason(status, activity, self.max_graph_size()) {
                if halt == Halt::GraphLimit {
                    self.stop_for_size(&job.id, activity)?;
                }
                report.halted = Some(halt);
            } else if self.ctx.settings.graph_store_mode == GraphStoreMode::Internal {
                let window = window.unwrap_or(RevisionWindow { start: 0, end: 0 });
                report.spawned = self
                    .dispatch_by_diff(&job, &payload, origin, window, earlier.is_some())
                    .await?;
            } else if let Some(window) = window {
                let adapters: Vec<String> = job.approved_adapters.iter().cloned().collect();
                let scope = Scope {
                    window: Some(window),
                    ids: &[],
                    bounded: true,
                    page: None,
                    redelivered: earlier.is_some(),
                };
                report.spawned = self.dispatch(&job, &adapters, scope, origin).await?;
            }

            if let Some(task_id) = origin {
                self.close_task(&task_id, TaskStatus::Complete)?;
            }
        }

        self.close_cycle(&job.id, origin, adapter.as_deref(), started, &mut report)?;
        Ok(report)
    }

    async fn post_action(
        &self,
        mut job: Job,
        payload: Payload,
        node_ids: &[u64],
        adapters: Vec<String>,
        redelivered: bool,
    ) -> CoordinatorResult<CycleReport> {
        let started = Utc::now();
        let mut report = CycleReport::default();
        if let Some(halt) = halt_reason(job.status, job.graph_activity, self.max_graph_size()) {
            report.halted = Some(halt);
            return Ok(report);
        }

        self.ctx.store.mark_cycle(&job.id, &payload.id, None)?;
        // The one-time adapter list lives in the internal op, never in the config.
        self.ctx.store.set_config(&job.id, &payload.job_config)?;
        job.config = payload.job_config;
        self.mark_processing(&job.id)?;

        let adapters: Vec<String> = normalize_adapters(adapters).into_iter().collect();
        let scope = Scope {
            window: None,
            ids: node_ids,
            bounded: false,
            page: None,
            redelivered,
        };
        report.spawned = self.dispatch(&job, &adapters, scope, None).await?;
        info!(job_id = %job.id, nodes = node_ids.len(), spawned = report.spawned.len(), "post-action dispatched");

        self.close_cycle(&job.id, None, Some("post-action"), started, &mut report)?;
        Ok(report)
    }

    /// Replay failed tasks. A task is marked REPLAYED only once its
    /// replacement is published, so a redelivered retry still finds it FAILED.
    async fn retry(
        &self,
        job: Job,
        message_id: Uuid,
        task_ids: &[TaskId],
        redelivered: bool,
    ) -> CoordinatorResult<CycleReport> {
        let started = Utc::now();
        let mut report = CycleReport::default();
        if let Some(halt) = halt_reason(job.status, job.graph_activity, self.max_graph_size()) {
            report.halted = Some(halt);
            return Ok(report);
        }
        self.ctx.store.mark_cycle(&job.id, &message_id, None)?;
        self.mark_processing(&job.id)?;

        for task_id in task_ids {
            let Some(task) = job.tasks.get(task_id) else {
                warn!(job_id = %job.id, task_id = %task_id, "retry of unknown task skipped");
                continue;
            };
            if task.status != TaskStatus::Failed {
                debug!(job_id = %job.id, task_id = %task_id, status = %task.status, "task no longer failed");
                continue;
            }

            let scope = Scope {
                window: Some(task.window()),
                ids: &[],
                bounded: true,
                page: Some(task.node_page_index),
                redelivered,
            };
            let adapters = [task.adapter_name.clone()];
            let spawned = self.dispatch(&job, &adapters, scope, None).await?;

            let replayed = self.ctx.store.transition_task(
                task_id,
                TaskStatus::Failed,
                TaskStatus::Replayed,
                Utc::now(),
            )?;
            if replayed {
                self.ctx.store.clear_task_errors(task_id)?;
                self.ctx.store.remove_errors_for_task(&job.id, task_id)?;
            }
            info!(job_id = %job.id, task_id = %task_id, spawned = spawned.len(), "failed task replayed");
            report.spawned.extend(spawned);
        }

        self.close_cycle(&job.id, None, Some("retry"), started, &mut report)?;
        Ok(report)
    }

    /// Query the graph for each adapter and publish the matches as tasks.
    async fn dispatch(
        &self,
        job: &Job,
        adapters: &[String],
        scope: Scope<'_>,
        parent: Option<TaskId>,
    ) -> CoordinatorResult<Vec<TaskId>> {
        let mut workers: Vec<AdapterRecord> = Vec::new();
        let mut queries = BTreeMap::new();
        for name in adapters {
            match self.ctx.registry.resolve_instance(name)? {
                Some(record) => {
                    let query = if scope.bounded {
                        self.ctx.registry.build_query(&record, &job.config)
                    } else {
                        GraphQuery::new(record.graph_query.clone())
                    };
                    queries.insert(record.id, query.with_ids(scope.ids).render());
                    workers.push(record);
                }
                None => {
                    let err = CoordinatorError::UnknownAdapter(name.clone());
                    warn!(job_id = %job.id, error = %err, "adapter skipped this cycle");
                }
            }
        }
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let matches = self
            .ctx
            .graph
            .query_patterns(&job.id, &queries, scope.window)
            .await
            .map_err(|e| graph_error(&job.id, e))?;

        let window = scope.window.unwrap_or(RevisionWindow {
            start: 0,
            end: job.graph_activity,
        });
        let mut spawned = Vec::new();
        for worker in &workers {
            let pattern = &queries[&worker.id];
            let Some(nodes) = matches.get(pattern) else {
                continue;
            };
            let eligible = workers
                .iter()
                .filter(|w| &queries[&w.id] == pattern)
                .count();
            let size = effective_chunk_size(self.ctx.settings.max_nodes_per_task, worker, eligible);

            for (page, range) in plan_chunks(nodes.len(), size).into_iter().enumerate() {
                if scope.page.is_some_and(|p| p != page) {
                    continue;
                }
                if scope.redelivered {
                    if let Some(task) = published_earlier(job, worker, parent, window, page) {
                        debug!(job_id = %job.id, task_id = %task.id, page, "task already published");
                        if task.status == TaskStatus::Processing {
                            spawned.push(task.id);
                        }
                        continue;
                    }
                }
                let chunk = nodes[range].to_vec();
                match self
                    .publish_task(job, worker, chunk, parent, window, page)
                    .await?
                {
                    Some(task_id) => spawned.push(task_id),
                    None => return Ok(spawned),
                }
            }
        }
        Ok(spawned)
    }

    /// Send each changed node to the approved workers whose required keys
    /// match its changed attributes, one node per task.
    ///
    /// The node cache is written only after every task is out, so a
    /// redelivered payload computes the same diffs again.
    async fn dispatch_by_diff(
        &self,
        job: &Job,
        payload: &Payload,
        parent: Option<TaskId>,
        window: RevisionWindow,
        redelivered: bool,
    ) -> CoordinatorResult<Vec<TaskId>> {
        let nodes = payload.response_nodes.iter().chain(
            payload
                .response_edges
                .iter()
                .flat_map(|e| [&e.source, &e.target]),
        );

        let mut seen = HashSet::new();
        let mut updates = Vec::new();
        let mut spawned = Vec::new();
        let mut page = 0;
        'nodes: for current in nodes {
            let Some(key) = node_key(current) else {
                debug!(job_id = %job.id, "node without type and value not diffed");
                continue;
            };
            if !seen.insert(key.clone()) {
                continue;
            }
            let mut node = self.ctx.store.cached_node(&job.id, &key)?.unwrap_or_default();
            let diff = attribute_diff(&node, current);
            if diff.is_empty() {
                continue;
            }
            node.extend(diff.clone());

            for worker in self.ctx.registry.candidates_for_diff(&diff)? {
                if !job.approves(&worker.name) {
                    debug!(job_id = %job.id, adapter = %worker.name, "adapter not approved for job");
                    continue;
                }
                page += 1;
                if redelivered {
                    if let Some(task) = published_earlier(job, &worker, parent, window, page) {
                        if task.status == TaskStatus::Processing {
                            spawned.push(task.id);
                        }
                        continue;
                    }
                }
                match self
                    .publish_task(job, &worker, vec![node.clone()], parent, window, page)
                    .await?
                {
                    Some(task_id) => spawned.push(task_id),
                    None => {
                        updates.push((key, node));
                        break 'nodes;
                    }
                }
            }
            updates.push((key, node));
        }

        for (key, node) in &updates {
            self.ctx.store.cache_node(&job.id, key, node)?;
        }
        Ok(spawned)
    }

    /// Persist then publish one task. Returns `None` once the job halts.
    async fn publish_task(
        &self,
        job: &Job,
        worker: &AdapterRecord,
        nodes: Vec<NodeData>,
        parent: Option<TaskId>,
        window: RevisionWindow,
        page: usize,
    ) -> CoordinatorResult<Option<TaskId>> {
        if self.current_halt(&job.id)?.is_some() {
            return Ok(None);
        }

        let task = Task::new(job.id.clone(), worker.id, worker.name.clone(), nodes.len())
            .with_parent(parent)
            .with_window(window)
            .with_page(page);
        self.ctx.store.insert_task(&task)?;

        // a STOP may have landed while the task was being written
        if let Some(halt) = self.current_halt(&job.id)? {
            debug!(job_id = %job.id, task_id = %task.id, ?halt, "job halted before publish");
            self.close_task(&task.id, TaskStatus::Dropped)?;
            return Ok(None);
        }

        let request = Payload::task_request(job.id.clone(), task.id, nodes, job.config.clone());
        let queue = worker.queue_name();
        if let Err(e) =
            publish_json(self.ctx.transport.as_ref(), &queue, RESPONSE_PRIORITY, &request).await
        {
            warn!(job_id = %job.id, task_id = %task.id, queue = %queue, error = %e, "task publish failed");
            self.close_task(&task.id, TaskStatus::Dropped)?;
            return Err(e.into());
        }

        self.ctx.registry.record_task(&worker.id)?;
        self.ctx.store.touch_last_task_time(&job.id, Utc::now())?;
        debug!(
            job_id = %job.id,
            task_id = %task.id,
            adapter = %worker.name,
            nodes = task.node_count,
            page,
            "task published"
        );
        Ok(Some(task.id))
    }

    fn current_halt(&self, job_id: &JobId) -> CoordinatorResult<Option<Halt>> {
        let (status, activity) = self
            .ctx
            .store
            .job_state(job_id)?
            .ok_or_else(|| CoordinatorError::UnknownJob(job_id.clone()))?;
        Ok(halt_reason(status, activity, self.max_graph_size()))
    }

    fn mark_processing(&self, job_id: &JobId) -> CoordinatorResult<()> {
        match lifecycle::set_status(self.ctx.store.as_ref(), job_id, JobStatus::Processing) {
            Ok(_) => Ok(()),
            Err(CoordinatorError::InvalidTransition(e)) => {
                warn!(job_id = %job_id, error = %e, "job not moved to PROCESSING");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Set a processing task's terminal status. False if it was already closed.
    fn close_task(&self, task_id: &TaskId, status: TaskStatus) -> CoordinatorResult<bool> {
        Ok(self
            .ctx
            .store
            .transition_task(task_id, TaskStatus::Processing, status, Utc::now())?)
    }

    /// Stop a job whose graph outgrew the ceiling, recording one error.
    fn stop_for_size(&self, job_id: &JobId, activity: u64) -> CoordinatorResult<()> {
        match lifecycle::set_status(self.ctx.store.as_ref(), job_id, JobStatus::Stopped) {
            Ok(Transition::Changed) => {
                let message = format!(
                    "graph size {activity} exceeds the limit of {}; job stopped",
                    self.max_graph_size()
                );
                warn!(job_id = %job_id, activity, "{message}");
                self.ctx.store.append_error(job_id, &JobError::new(message.clone()))?;
                self.ctx
                    .store
                    .append_history(job_id, &HistoryEntry::new(HistoryKind::Status, message))?;
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(CoordinatorError::InvalidTransition(e)) => {
                warn!(job_id = %job_id, error = %e, "oversized job could not be stopped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Mark a task FAILED and record why. Does nothing if it was already closed.
    fn fail_task(
        &self,
        job_id: &JobId,
        task_id: TaskId,
        adapter: Option<&str>,
        reason: Option<String>,
    ) -> CoordinatorResult<()> {
        if !self.close_task(&task_id, TaskStatus::Failed)? {
            return Ok(());
        }
        let adapter = adapter.unwrap_or("unknown");
        let error = match reason {
            Some(reason) => JobError::new(reason),
            None => self.ctx.store.latest_task_error(&task_id)?.unwrap_or_else(|| {
                JobError::new(format!("failed to receive a response from adapter {adapter}"))
            }),
        };
        let error = JobError {
            task_id: Some(task_id),
            adapter: Some(adapter.to_string()),
            ..error
        };
        warn!(job_id = %job_id, task_id = %task_id, adapter, error = %error.message, "task failed");
        self.ctx.store.append_error(job_id, &error)?;
        self.ctx.store.append_history(
            job_id,
            &HistoryEntry::new(HistoryKind::TaskFailed, error.message.clone())
                .for_task(Some(task_id), Some(adapter)),
        )?;
        Ok(())
    }

    fn close_cycle(
        &self,
        job_id: &JobId,
        origin: Option<TaskId>,
        adapter: Option<&str>,
        started: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> CoordinatorResult<()> {
        let finished_at = Utc::now();
        let source = adapter.unwrap_or("seed");
        self.ctx.store.touch_last_task_time(job_id, finished_at)?;
        let entry = HistoryEntry::new(
            HistoryKind::Cycle,
            format!(
                "{source}: {} graph updates, {} tasks spawned",
                report.update_count,
                report.spawned.len()
            ),
        )
        .for_task(origin, adapter)
        .with_details(json!({
            "start": started,
            "end": finished_at,
            "update_count": report.update_count,
            "spawned": report.spawned.len(),
        }));
        self.ctx.store.append_history(job_id, &entry)?;

        if report.halted.is_some() || !report.spawned.is_empty() {
            return Ok(());
        }
        if self.ctx.store.active_task_count(job_id)? > 0 {
            return Ok(());
        }
        match lifecycle::finish_job(self.ctx.store.as_ref(), job_id, "no active tasks remain") {
            Ok(status) => {
                report.finished = Some(status);
                Ok(())
            }
            Err(CoordinatorError::InvalidTransition(e)) => {
                debug!(job_id = %job_id, error = %e, "job not finished");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl MessageHandler for DispatchEngine {
    type Message = Payload;

    async fn handle_message(&self, payload: Payload) -> Disposition {
        let job_id = payload.job_id.clone();
        match self.handle(payload).await {
            Ok(report) => {
                debug!(
                    job_id = %job_id,
                    spawned = report.spawned.len(),
                    dropped = report.dropped.len(),
                    finished = ?report.finished,
                    "cycle complete"
                );
                Disposition::Ack
            }
            Err(e) if e.is_retryable() => {
                warn!(job_id = %job_id, error = %e, "cycle failed, payload will be redelivered");
                Disposition::Requeue
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "cycle failed");
                Disposition::Ack
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn halts_on_stop_expiry_and_size() {
        assert_eq!(halt_reason(JobStatus::Stopped, 0, 0), Some(Halt::Stopped));
        assert_eq!(halt_reason(JobStatus::Expired, 0, 0), Some(Halt::Expired));
        assert_eq!(halt_reason(JobStatus::Processing, 51, 50), Some(Halt::GraphLimit));
        assert_eq!(halt_reason(JobStatus::Processing, 50, 50), None);
        assert_eq!(halt_reason(JobStatus::Processing, 1_000_000, 0), None);
    }

    #[test]
    fn chunks_cover_matches_exactly() {
        assert_eq!(plan_chunks(0, 3), Vec::<Range<usize>>::new());
        assert_eq!(plan_chunks(7, 3), vec![0..3, 3..6, 6..7]);
        assert_eq!(plan_chunks(7, 0), vec![0..7]);
        assert_eq!(plan_chunks(7, -1), vec![0..7]);
    }

    #[test]
    fn chunk_sizes_sum_to_total_for_random_inputs() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let n = rng.gen_range(0..400);
            let m: i64 = rng.gen_range(1..50);
            let chunks = plan_chunks(n, m);
            assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), n);
            assert!(chunks.iter().all(|c| c.len() as i64 <= m && !c.is_empty()));
        }
    }

    #[test]
    fn worker_override_needs_sole_eligibility() {
        let worker = AdapterRecord::new("w", "n()").with_max_nodes(5);
        assert_eq!(effective_chunk_size(100, &worker, 1), 5);
        assert_eq!(effective_chunk_size(0, &worker, 1), 5);
        assert_eq!(effective_chunk_size(100, &worker, 2), 100);
        assert_eq!(effective_chunk_size(3, &worker, 1), 3);

        let plain = AdapterRecord::new("w", "n()");
        assert_eq!(effective_chunk_size(100, &plain, 1), 100);
    }
}
