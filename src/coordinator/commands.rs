//! Command processor: job lifecycle commands

use super::lifecycle;
use super::pool::{Disposition, MessageHandler};
use super::CoordinatorContext;
use crate::error::{graph_error, CoordinatorError, CoordinatorResult};
use crate::job::{
    normalize_adapters, HistoryEntry, HistoryKind, Job, JobError, JobStatus, TaskId, TaskStatus,
    Transition,
};
use crate::message::{
    Command, CommandKind, InternalOp, Payload, Seed, COMMAND_PRIORITY, NEW_JOB_PRIORITY,
};
use crate::transport::publish_json;
use async_trait::async_trait;
use tracing::{debug, info, warn};

pub struct CommandProcessor {
    ctx: CoordinatorContext,
}

impl CommandProcessor {
    pub fn new(ctx: CoordinatorContext) -> Self {
        Self { ctx }
    }

    pub async fn handle(&self, command: Command) -> CoordinatorResult<()> {
        info!(job_id = %command.job_id, command = %command.kind, "command received");
        match command.kind {
            CommandKind::New => self.new_job(command).await,
            CommandKind::Add => self.add(command).await,
            CommandKind::Stop => {
                self.stop(&command);
                Ok(())
            }
            CommandKind::Reset => self.reset(command).await,
            CommandKind::ExecuteOnNodes => self.execute_on_nodes(command).await,
            CommandKind::Retry => self.retry(command).await,
        }
    }

    async fn forward(&self, payload: &Payload, priority: u8) -> CoordinatorResult<()> {
        publish_json(
            self.ctx.transport.as_ref(),
            &self.ctx.settings.engine_queue,
            priority,
            payload,
        )
        .await?;
        Ok(())
    }

    fn history(&self, job: &Job, message: String) -> CoordinatorResult<()> {
        self.ctx
            .store
            .append_history(&job.id, &HistoryEntry::new(HistoryKind::Command, message))?;
        Ok(())
    }

    async fn new_job(&self, command: Command) -> CoordinatorResult<()> {
        let store = &self.ctx.store;
        let existing = store.get_job(&command.job_id)?;
        if let Some(job) = &existing {
            if job.status != JobStatus::New {
                info!(job_id = %job.id, status = %job.status, "duplicate NEW ignored");
                return Ok(());
            }
        }

        let mut config = command.seed.config.clone();
        if command.ttl > 0 {
            config.ttl = command.ttl;
        }
        if !command.priority.is_empty() {
            config.priority = command.priority.clone();
        }

        let created = existing.is_none();
        let job = match existing {
            Some(mut job) => {
                job.approved_adapters = normalize_adapters(&command.adapters);
                job.config = config;
                job
            }
            None => Job::new(command.job_id.clone(), &command.adapters, config).with_default_schedule(
                self.ctx.settings.default_reset_days,
                self.ctx.settings.default_expire_days,
            ),
        };

        store.save_job(&job)?;
        if job.approved_adapters.is_empty() {
            warn!(job_id = %job.id, "job has no approved adapters");
            if lifecycle::reject_new_job(store.as_ref(), &job.id)? {
                store.append_error(&job.id, &JobError::new("no approved adapters"))?;
                store.append_history(
                    &job.id,
                    &HistoryEntry::new(HistoryKind::Created, "job rejected: no approved adapters"),
                )?;
            }
            return Ok(());
        }

        if created {
            store.append_history(&job.id, &HistoryEntry::new(HistoryKind::Created, "job created"))?;
        }

        let summary = format!(
            "NEW: {} seed nodes, {} seed edges, adapters {:?}",
            command.seed.nodes.len(),
            command.seed.edges.len(),
            job.approved_adapters
        );
        let seed = Seed {
            nodes: command.seed.nodes,
            edges: command.seed.edges,
            config: job.config.clone(),
        };
        self.forward(&Payload::seed(job.id.clone(), seed), NEW_JOB_PRIORITY)
            .await?;
        self.history(&job, summary)
    }

    async fn add(&self, command: Command) -> CoordinatorResult<()> {
        if command.adapters.is_empty() {
            return Err(CoordinatorError::rejected(&command.job_id, "ADD needs at least one adapter"));
        }
        let store = &self.ctx.store;
        let job = store
            .get_job(&command.job_id)?
            .ok_or_else(|| CoordinatorError::UnknownJob(command.job_id.clone()))?;

        lifecycle::set_status(store.as_ref(), &job.id, JobStatus::Processing)?;

        let mut adapters = job.approved_adapters.clone();
        adapters.extend(normalize_adapters(&command.adapters));
        store.set_adapters(&job.id, &adapters)?;

        let config = if command.seed.config.is_empty() {
            job.config.clone()
        } else {
            store.set_config(&job.id, &command.seed.config)?;
            command.seed.config.clone()
        };
        let summary = format!(
            "ADD: {} nodes, {} edges, adapters {:?}",
            command.seed.nodes.len(),
            command.seed.edges.len(),
            command.adapters
        );
        let seed = Seed {
            nodes: command.seed.nodes,
            edges: command.seed.edges,
            config,
        };
        self.forward(&Payload::seed(job.id.clone(), seed), NEW_JOB_PRIORITY)
            .await?;
        self.history(&job, summary)
    }

    /// Stop never fails; problems are only logged.
    fn stop(&self, command: &Command) {
        let store = self.ctx.store.as_ref();
        match lifecycle::set_status(store, &command.job_id, JobStatus::Stopped) {
            Ok(Transition::Changed) => {
                info!(job_id = %command.job_id, "job stopped");
                let entry = HistoryEntry::new(HistoryKind::Command, "STOP");
                if let Err(e) = store.append_history(&command.job_id, &entry) {
                    warn!(job_id = %command.job_id, error = %e, "could not record STOP");
                }
            }
            Ok(Transition::Unchanged) => debug!(job_id = %command.job_id, "job already stopped"),
            Err(e) => warn!(job_id = %command.job_id, error = %e, "STOP not applied"),
        }
    }

    async fn reset(&self, command: Command) -> CoordinatorResult<()> {
        let store = &self.ctx.store;
        let job = store
            .get_job(&command.job_id)?
            .ok_or_else(|| CoordinatorError::UnknownJob(command.job_id.clone()))?;

        if job.status == JobStatus::Reset && !command.overwrite {
            return Err(CoordinatorError::rejected(&job.id, "job is already reset"));
        }
        if !job.status.is_resettable() {
            return Err(CoordinatorError::rejected(
                &job.id,
                format!("cannot reset a {} job", job.status),
            ));
        }

        self.ctx
            .graph
            .delete_graph(&job.id)
            .await
            .map_err(|e| graph_error(&job.id, e))?;
        store.clear_node_cache(&job.id)?;
        lifecycle::set_status(store.as_ref(), &job.id, JobStatus::Reset)?;

        let reason = command.reason.unwrap_or_else(|| "RESET requested".to_string());
        store.set_reason(&job.id, &reason)?;
        self.history(&job, format!("RESET: {reason}"))?;
        info!(job_id = %job.id, reason = %reason, "job reset");
        Ok(())
    }

    async fn execute_on_nodes(&self, command: Command) -> CoordinatorResult<()> {
        let store = &self.ctx.store;
        let job = store
            .get_job(&command.job_id)?
            .ok_or_else(|| CoordinatorError::UnknownJob(command.job_id.clone()))?;
        if command.adapters.is_empty() || command.node_ids.is_empty() {
            return Err(CoordinatorError::rejected(
                &job.id,
                "EXECUTE_ON_NODES needs adapters and node ids",
            ));
        }

        lifecycle::set_status(store.as_ref(), &job.id, JobStatus::Processing)?;
        self.history(
            &job,
            format!(
                "EXECUTE_ON_NODES: {} nodes, adapters {:?}",
                command.node_ids.len(),
                command.adapters
            ),
        )?;

        let config = if command.seed.config.is_empty() {
            job.config.clone()
        } else {
            command.seed.config
        };
        let op = InternalOp::PostAction {
            node_ids: command.node_ids,
            adapters: command.adapters,
        };
        self.forward(&Payload::internal(job.id.clone(), op, config), COMMAND_PRIORITY)
            .await
    }

    async fn retry(&self, command: Command) -> CoordinatorResult<()> {
        let store = &self.ctx.store;
        let job = store
            .get_job(&command.job_id)?
            .ok_or_else(|| CoordinatorError::UnknownJob(command.job_id.clone()))?;
        if job.status == JobStatus::Processing {
            return Err(CoordinatorError::rejected(&job.id, "job is still processing"));
        }

        let failed: Vec<TaskId> = job
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .filter(|t| command.task_ids.is_empty() || command.task_ids.contains(&t.id))
            .map(|t| t.id)
            .collect();
        if failed.is_empty() {
            info!(job_id = %job.id, "no failed tasks to retry");
            return Ok(());
        }

        lifecycle::set_status(store.as_ref(), &job.id, JobStatus::Processing)?;
        self.history(&job, format!("RETRY: {} failed tasks", failed.len()))?;

        let op = InternalOp::Retry { task_ids: failed };
        self.forward(&Payload::internal(job.id.clone(), op, job.config.clone()), COMMAND_PRIORITY)
            .await
    }
}

#[async_trait]
impl MessageHandler for CommandProcessor {
    type Message = Command;

    async fn handle_message(&self, command: Command) -> Disposition {
        let job_id = command.job_id.clone();
        let kind = command.kind;
        match self.handle(command).await {
            Ok(()) => Disposition::Ack,
            Err(e) if e.is_retryable() => {
                warn!(job_id = %job_id, command = %kind, error = %e, "command will be redelivered");
                Disposition::Requeue
            }
            Err(e) => {
                warn!(job_id = %job_id, command = %kind, error = %e, "command rejected");
                Disposition::Ack
            }
        }
    }
}
