//! Maintenance loop
//!
//! Runs on the heartbeat interval. Each tick may run the scheduled reset and
//! expire batches (at startup, then once per sweep period) and then scans
//! workers and processing jobs:
//!
//! - a worker whose heartbeat is older than the limit goes OFFLINE; one that
//!   heartbeats again comes back ONLINE
//! - a request dead-lettered on a worker queue is answered with a failure
//! - a processing job past its ttl is EXPIRED
//! - a processing job past the maximum run time is finished
//! - a processing job with no active task, idle past the limit, is finished
//!
//! The scan guard only keeps overlapping ticks from scanning twice. Every
//! status change a scan makes is a compare-and-set. A scheduled reset that
//! cannot be sent is retried on every tick until it goes out; nothing in the
//! sweep keeps the scans from running.

use super::lifecycle;
use super::CoordinatorContext;
use super::CancellationToken;
use crate::adapter::AdapterStatus;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::job::{HistoryEntry, HistoryKind, Job, JobId, JobStatus, TaskId, Transition};
use crate::message::{Command, CommandKind, Payload, RESPONSE_PRIORITY};
use crate::transport::{dead_letter_queue, publish_json, TransportError, TransportResult};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Reason attached to scheduled resets.
pub const RESET_DATE_REACHED: &str = "RESET date reached.";

/// Statuses the scheduled reset batch picks up.
const RESETTABLE_BY_SCHEDULE: [JobStatus; 3] = [
    JobStatus::Finished,
    JobStatus::FinishedWithErrors,
    JobStatus::Stopped,
];

/// What one tick changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    pub swept: bool,
    pub resets_sent: Vec<JobId>,
    /// Scheduled resets that could not be published; retried next tick
    pub resets_unsent: Vec<JobId>,
    pub purged: Vec<JobId>,
    pub offline: usize,
    pub online: usize,
    pub expired: Vec<JobId>,
    pub finished: Vec<(JobId, JobStatus)>,
    /// Tasks whose dead-lettered request was turned into a failure
    pub abandoned: Vec<TaskId>,
    /// The scan was skipped because another was running
    pub scan_skipped: bool,
}

/// Clears the scan flag when the scan ends, however it ends.
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MaintenanceLoop {
    ctx: CoordinatorContext,
    scanning: AtomicBool,
    last_sweep: Mutex<Option<DateTime<Utc>>>,
    unsent_resets: Mutex<Vec<JobId>>,
}

impl MaintenanceLoop {
    pub fn new(ctx: CoordinatorContext) -> Self {
        Self {
            ctx,
            scanning: AtomicBool::new(false),
            last_sweep: Mutex::new(None),
            unsent_resets: Mutex::new(Vec::new()),
        }
    }

    /// Tick on the heartbeat interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.ctx.settings.heartbeat_interval();
        info!(interval_secs = period.as_secs(), "maintenance loop started");
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("maintenance loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) => debug!(?report, "maintenance tick"),
                        Err(e) => warn!(error = %e, "maintenance tick failed"),
                    }
                }
            }
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> CoordinatorResult<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        if self.sweep_due(now) {
            self.sweep(now, &mut report).await;
            *self.last_sweep.lock().unwrap() = Some(now);
            report.swept = true;
        } else {
            self.send_resets(Vec::new(), &mut report).await;
        }

        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("scan already running, skipped");
            report.scan_skipped = true;
            return Ok(report);
        }
        let _guard = ScanGuard(&self.scanning);
        self.scan_adapters(now, &mut report)?;
        self.fail_dead_letters(&mut report).await;
        self.scan_jobs(now, &mut report)?;
        Ok(report)
    }

    fn sweep_due(&self, now: DateTime<Utc>) -> bool {
        match *self.last_sweep.lock().unwrap() {
            None => true,
            Some(last) => (now - last).num_seconds() >= self.ctx.settings.sweep_period_secs,
        }
    }

    // === Scheduled Batches ===

    async fn sweep(&self, now: DateTime<Utc>, report: &mut MaintenanceReport) {
        let store = &self.ctx.store;

        let due = store
            .jobs_due_for_reset(now, &RESETTABLE_BY_SCHEDULE)
            .unwrap_or_else(|e| {
                warn!(error = %e, "jobs due for reset not listed");
                Vec::new()
            });
        self.send_resets(due, report).await;

        let expired = store.jobs_due_for_expire(now).unwrap_or_else(|e| {
            warn!(error = %e, "jobs due for expiry not listed");
            Vec::new()
        });
        for job_id in expired {
            if let Err(e) = self.ctx.graph.delete_graph(&job_id).await {
                warn!(job_id = %job_id, error = %e, "graph not deleted, expiry postponed");
                continue;
            }
            if let Err(e) = store.delete_job(&job_id) {
                warn!(job_id = %job_id, error = %e, "expired job not purged");
                continue;
            }
            info!(job_id = %job_id, "expired job purged");
            report.purged.push(job_id);
        }
    }

    /// Publish `due` resets plus any left over from earlier ticks.
    async fn send_resets(&self, due: Vec<JobId>, report: &mut MaintenanceReport) {
        let mut pending = std::mem::take(&mut *self.unsent_resets.lock().unwrap());
        for job_id in due {
            if !pending.contains(&job_id) {
                pending.push(job_id);
            }
        }

        let mut unsent = Vec::new();
        for job_id in pending {
            match self.send_reset(&job_id).await {
                Ok(()) => {
                    info!(job_id = %job_id, "scheduled reset sent");
                    report.resets_sent.push(job_id);
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "scheduled reset not sent, will retry");
                    unsent.push(job_id);
                }
            }
        }
        report.resets_unsent = unsent.clone();
        self.unsent_resets.lock().unwrap().extend(unsent);
    }

    async fn send_reset(&self, job_id: &JobId) -> TransportResult<()> {
        let command =
            Command::new(CommandKind::Reset, job_id.clone()).with_reason(RESET_DATE_REACHED, false);
        publish_json(
            self.ctx.transport.as_ref(),
            &self.ctx.settings.command_queue,
            command.queue_priority(),
            &command,
        )
        .await
    }

    /// Answer every request a worker queue gave up on with a failure, so the
    /// engine closes its task instead of waiting on it forever.
    async fn fail_dead_letters(&self, report: &mut MaintenanceReport) {
        let records = match self.ctx.registry.all() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "adapters not listed, dead letters left");
                return;
            }
        };
        let transport = self.ctx.transport.as_ref();
        for record in records {
            let queue = dead_letter_queue(&record.queue_name());
            let ready = match transport.depth(&queue).await {
                Ok(ready) => ready,
                Err(TransportError::UnknownQueue(_)) => continue,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "dead-letter queue not read");
                    continue;
                }
            };
            for _ in 0..ready {
                let delivery = match transport.try_consume(&queue).await {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "dead-letter queue not read");
                        break;
                    }
                };
                let request: Payload = match delivery.decode() {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "undecodable dead letter discarded");
                        if let Err(e) = transport.ack(&delivery).await {
                            warn!(queue = %queue, error = %e, "ack failed");
                        }
                        continue;
                    }
                };
                let published = publish_json(
                    transport,
                    &self.ctx.settings.engine_queue,
                    RESPONSE_PRIORITY,
                    &request.fail(),
                )
                .await;
                let settled = match published {
                    Ok(()) => transport.ack(&delivery).await,
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "failure for dead letter not sent");
                        if let Err(e) = transport.nack(&delivery, true).await {
                            warn!(queue = %queue, error = %e, "nack failed");
                        }
                        break;
                    }
                };
                if let Err(e) = settled {
                    warn!(queue = %queue, error = %e, "ack failed");
                }
                warn!(
                    job_id = %request.job_id,
                    task_id = ?request.task_id,
                    adapter = %record.name,
                    "dead-lettered request failed"
                );
                if let Some(task_id) = request.task_id {
                    report.abandoned.push(task_id);
                }
            }
        }
    }

    // === Scans ===

    fn scan_adapters(&self, now: DateTime<Utc>, report: &mut MaintenanceReport) -> CoordinatorResult<()> {
        let max_age = self.ctx.settings.max_adapter_heartbeat_secs;
        for record in self.ctx.registry.all()? {
            let age = record.heartbeat_age(now);
            if age > max_age {
                if record.status != AdapterStatus::Offline {
                    warn!(adapter = %record.name, adapter_id = %record.id, age, "adapter offline");
                    self.ctx.registry.set_status(&record.id, AdapterStatus::Offline)?;
                    report.offline += 1;
                }
            } else if record.status != AdapterStatus::Online {
                info!(adapter = %record.name, adapter_id = %record.id, was = %record.status, "adapter online");
                self.ctx.registry.set_status(&record.id, AdapterStatus::Online)?;
                report.online += 1;
            }
        }
        Ok(())
    }

    fn scan_jobs(&self, now: DateTime<Utc>, report: &mut MaintenanceReport) -> CoordinatorResult<()> {
        let store = &self.ctx.store;
        for job_id in store.jobs_by_status(JobStatus::Processing)? {
            let Some(job) = store.get_job(&job_id)? else {
                continue;
            };
            match self.check_job(&job, now) {
                Ok(Some(JobStatus::Expired)) => report.expired.push(job_id),
                Ok(Some(status)) => report.finished.push((job_id, status)),
                Ok(None) => {}
                Err(CoordinatorError::InvalidTransition(e)) => {
                    debug!(job_id = %job_id, error = %e, "job changed during scan");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Apply the first limit a processing job has crossed.
    fn check_job(&self, job: &Job, now: DateTime<Utc>) -> CoordinatorResult<Option<JobStatus>> {
        let settings = &self.ctx.settings;
        let store = self.ctx.store.as_ref();
        let run_time = (now - job.start_time.unwrap_or(job.create_time)).num_seconds();

        if job.config.ttl > 0 && run_time > job.config.ttl as i64 {
            if lifecycle::set_status(store, &job.id, JobStatus::Expired)? == Transition::Changed {
                let message = format!("ttl of {}s reached after {run_time}s", job.config.ttl);
                info!(job_id = %job.id, run_time, "job expired");
                store.append_history(&job.id, &HistoryEntry::new(HistoryKind::Status, message))?;
                return Ok(Some(JobStatus::Expired));
            }
            return Ok(None);
        }

        if settings.max_job_run_time_secs > 0 && run_time > settings.max_job_run_time_secs {
            let why = format!("run time {run_time}s exceeds the maximum");
            return lifecycle::finish_job(store, &job.id, &why).map(Some);
        }

        if settings.max_job_idle_secs > 0 && store.active_task_count(&job.id)? == 0 {
            let idle = (now - job.last_activity()).num_seconds();
            if idle > settings.max_job_idle_secs {
                let why = format!("idle for {idle}s with no active tasks");
                return lifecycle::finish_job(store, &job.id, &why).map(Some);
            }
        }
        Ok(None)
    }
}
