//! The job coordinator
//!
//! Commands arrive on the command queue and are handled by the
//! [`CommandProcessor`]; graph data arrives on the engine queue and drives the
//! [`DispatchEngine`]. Both are run by a [`PartitionedPool`] so that messages
//! of one job are never handled concurrently. The [`MaintenanceLoop`] runs
//! beside them on its own timer.

mod commands;
mod context;
mod dispatch;
mod lifecycle;
mod maintenance;
mod pool;
mod submit;

pub use commands::CommandProcessor;
pub use context::CoordinatorContext;
pub use dispatch::{effective_chunk_size, halt_reason, plan_chunks, CycleReport, DispatchEngine, Halt};
pub use lifecycle::{finish_job, reject_new_job, set_status};
pub use maintenance::{MaintenanceLoop, MaintenanceReport, RESET_DATE_REACHED};
pub use pool::{partition_for, pump, Disposition, MessageHandler, PartitionedPool};
pub use submit::{validate_seed, JobSubmitter};
pub use tokio_util::sync::CancellationToken;

use crate::transport::TransportResult;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Command processor, dispatch engine and maintenance loop sharing one context.
pub struct Coordinator {
    ctx: CoordinatorContext,
    commands: Arc<CommandProcessor>,
    engine: Arc<DispatchEngine>,
    maintenance: Arc<MaintenanceLoop>,
}

impl Coordinator {
    pub fn new(ctx: CoordinatorContext) -> Self {
        Self {
            commands: Arc::new(CommandProcessor::new(ctx.clone())),
            engine: Arc::new(DispatchEngine::new(ctx.clone())),
            maintenance: Arc::new(MaintenanceLoop::new(ctx.clone())),
            ctx,
        }
    }

    pub fn context(&self) -> &CoordinatorContext {
        &self.ctx
    }

    pub fn submitter(&self) -> JobSubmitter {
        JobSubmitter::new(self.ctx.clone())
    }

    pub fn commands(&self) -> &CommandProcessor {
        &self.commands
    }

    pub fn engine(&self) -> &DispatchEngine {
        &self.engine
    }

    pub fn maintenance(&self) -> &MaintenanceLoop {
        &self.maintenance
    }

    /// Declare the queues and start both pools and the maintenance loop.
    pub async fn start(&self) -> TransportResult<CoordinatorHandle> {
        self.ctx.declare_queues().await?;
        let settings = &self.ctx.settings;
        let cancel = CancellationToken::new();

        let command_pool = PartitionedPool::new(
            "commands",
            settings.command_queue.clone(),
            settings.command_partitions,
            Arc::clone(&self.ctx.transport),
            Arc::clone(&self.commands),
        );
        let dispatch_pool = PartitionedPool::new(
            "dispatch",
            settings.engine_queue.clone(),
            settings.dispatch_partitions,
            Arc::clone(&self.ctx.transport),
            Arc::clone(&self.engine),
        );
        let maintenance = Arc::clone(&self.maintenance);

        let tasks = vec![
            tokio::spawn(command_pool.run(cancel.clone())),
            tokio::spawn(dispatch_pool.run(cancel.clone())),
            tokio::spawn({
                let cancel = cancel.clone();
                async move { maintenance.run(cancel).await }
            }),
        ];
        info!(
            command_partitions = settings.command_partitions,
            dispatch_partitions = settings.dispatch_partitions,
            "coordinator started"
        );
        Ok(CoordinatorHandle { cancel, tasks })
    }

    /// Handle whatever is ready on the command and engine queues, in place.
    ///
    /// Returns how many messages were handled; zero means both queues were empty.
    pub async fn pump(&self) -> TransportResult<usize> {
        let transport = self.ctx.transport.as_ref();
        let commands = pump(transport, &self.ctx.settings.command_queue, self.commands.as_ref()).await?;
        let payloads = pump(transport, &self.ctx.settings.engine_queue, self.engine.as_ref()).await?;
        Ok(commands + payloads)
    }
}

/// Running coordinator tasks.
pub struct CoordinatorHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl CoordinatorHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every loop and wait for in-flight messages to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "coordinator task failed");
            }
        }
        info!("coordinator stopped");
    }
}
