//! Runs one worker instance against the coordinator
//!
//! The host registers the instance, keeps its heartbeat fresh, and consumes
//! the instance's own queue. That queue is dead-lettered, so a request that
//! keeps failing to be answered is eventually set aside.

use super::traits::{Worker, WorkerResult};
use crate::adapter::{AdapterRecord, AdapterRegistry};
use crate::coordinator::{
    pump, CancellationToken, CoordinatorContext, Disposition, MessageHandler, PartitionedPool,
};
use crate::job::{JobError, JobStatus};
use crate::message::{Payload, RESPONSE_PRIORITY};
use crate::store::Store;
use crate::transport::{publish_json, QueueOptions, Transport};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct WorkerHost {
    worker: Arc<dyn Worker>,
    record: AdapterRecord,
    store: Arc<dyn Store>,
    registry: AdapterRegistry,
    transport: Arc<dyn Transport>,
    engine_queue: String,
    heartbeat_interval: Duration,
    max_deliveries: u32,
}

impl WorkerHost {
    pub fn new(worker: Arc<dyn Worker>, ctx: &CoordinatorContext) -> Self {
        Self {
            record: worker.record(),
            worker,
            store: Arc::clone(&ctx.store),
            registry: ctx.registry.clone(),
            transport: Arc::clone(&ctx.transport),
            engine_queue: ctx.settings.engine_queue.clone(),
            heartbeat_interval: ctx.settings.heartbeat_interval(),
            max_deliveries: ctx.settings.worker_queue_max_deliveries,
        }
    }

    pub fn record(&self) -> &AdapterRecord {
        &self.record
    }

    pub fn queue(&self) -> String {
        self.record.queue_name()
    }

    /// Declare this instance's queue and announce it in the registry.
    pub async fn register(&self) -> WorkerResult<()> {
        self.transport
            .declare(&self.queue(), QueueOptions::dead_lettered(self.max_deliveries))
            .await?;
        self.registry.register(&self.record)?;
        info!(adapter = %self.record.name, adapter_id = %self.record.id, queue = %self.queue(), "worker registered");
        Ok(())
    }

    pub fn heartbeat(&self) -> WorkerResult<()> {
        if !self.registry.heartbeat(&self.record.id, Utc::now())? {
            warn!(adapter_id = %self.record.id, "heartbeat for unregistered worker");
        }
        Ok(())
    }

    /// Answer a single task request.
    ///
    /// Returns the response to send, or `None` when the job is stopped or gone.
    pub async fn process_one(&self, request: &Payload) -> WorkerResult<Option<Payload>> {
        match self.store.job_state(&request.job_id)? {
            None => {
                debug!(job_id = %request.job_id, "request for unknown job skipped");
                return Ok(None);
            }
            Some((JobStatus::Stopped, _)) => {
                debug!(job_id = %request.job_id, "request for stopped job skipped");
                return Ok(None);
            }
            Some(_) => {}
        }

        match self.worker.process(request).await {
            Ok(result) => Ok(Some(request.respond(result.nodes, result.edges))),
            Err(e) => {
                warn!(
                    job_id = %request.job_id,
                    task_id = ?request.task_id,
                    adapter = %self.record.name,
                    error = %e,
                    "task failed in worker"
                );
                if let Some(task_id) = request.task_id {
                    let error = JobError::new(e.to_string()).for_task(task_id, &self.record.name);
                    self.store.append_task_error(&task_id, &error)?;
                }
                Ok(Some(request.fail()))
            }
        }
    }

    /// Handle every request ready on this instance's queue.
    pub async fn pump(&self) -> WorkerResult<usize> {
        Ok(pump(self.transport.as_ref(), &self.queue(), self).await?)
    }

    /// Register, then serve requests and heartbeat until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> WorkerResult<()> {
        self.register().await?;
        let queue = self.queue();
        let pool = PartitionedPool::new("worker", queue, 1, Arc::clone(&self.transport), Arc::clone(&self));
        let serving = tokio::spawn(pool.run(cancel.clone()));

        let mut interval = tokio::time::interval(self.heartbeat_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.heartbeat() {
                        warn!(adapter_id = %self.record.id, error = %e, "heartbeat failed");
                    }
                }
            }
        }
        if let Err(e) = serving.await {
            warn!(adapter_id = %self.record.id, error = %e, "worker pool failed");
        }
        info!(adapter = %self.record.name, adapter_id = %self.record.id, "worker stopped");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for WorkerHost {
    type Message = Payload;

    async fn handle_message(&self, request: Payload) -> Disposition {
        let response = match self.process_one(&request).await {
            Ok(Some(response)) => response,
            Ok(None) => return Disposition::Ack,
            Err(e) => {
                warn!(job_id = %request.job_id, error = %e, "request not handled");
                return Disposition::Requeue;
            }
        };
        match publish_json(self.transport.as_ref(), &self.engine_queue, RESPONSE_PRIORITY, &response).await {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                warn!(job_id = %request.job_id, error = %e, "response not published");
                Disposition::Requeue
            }
        }
    }
}
