//! Guarded job status changes
//!
//! Every status change goes through [`set_status`], which checks the
//! lifecycle table and applies the change as a compare-and-set so a
//! concurrent writer can never be overwritten with a stale status.
//! [`reject_new_job`] is the one change outside the table.

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::job::{HistoryEntry, HistoryKind, JobId, JobStatus, Transition};
use crate::store::Store;
use chrono::Utc;
use tracing::{debug, info, warn};

const CAS_ATTEMPTS: usize = 3;

/// Move a job to `target` if the lifecycle table allows it.
///
/// Same-state requests return `Transition::Unchanged`. A forbidden change
/// returns `CoordinatorError::InvalidTransition` and leaves the job as it was.
pub fn set_status(store: &dyn Store, id: &JobId, target: JobStatus) -> CoordinatorResult<Transition> {
    for _ in 0..CAS_ATTEMPTS {
        let (current, _) = store
            .job_state(id)?
            .ok_or_else(|| CoordinatorError::UnknownJob(id.clone()))?;
        if current.transition_to(target)? == Transition::Unchanged {
            return Ok(Transition::Unchanged);
        }
        if store.compare_and_set_status(id, current, target)? {
            debug!(job_id = %id, from = %current, to = %target, "job status changed");
            if target == JobStatus::Processing {
                store.mark_started(id, Utc::now())?;
            }
            return Ok(Transition::Changed);
        }
    }
    Err(CoordinatorError::rejected(id, "status changed concurrently"))
}

/// Finish a job: FINISHED_WITH_ERRORS if any task ever failed, FINISHED otherwise.
pub fn finish_job(store: &dyn Store, id: &JobId, why: &str) -> CoordinatorResult<JobStatus> {
    let job = store
        .get_job(id)?
        .ok_or_else(|| CoordinatorError::UnknownJob(id.clone()))?;
    let target = job.finish_status();
    if set_status(store, id, target)? == Transition::Changed {
        info!(job_id = %id, status = %target, why, "job finished");
        store.append_history(
            id,
            &HistoryEntry::new(HistoryKind::Status, format!("{target}: {why}")),
        )?;
    }
    Ok(target)
}

/// Move a job that never started from NEW straight to ERROR.
///
/// The lifecycle table has no NEW -> ERROR edge; a job submitted without
/// adapters takes it here. Returns false if the job already left NEW.
pub fn reject_new_job(store: &dyn Store, id: &JobId) -> CoordinatorResult<bool> {
    let rejected = store.compare_and_set_status(id, JobStatus::New, JobStatus::Error)?;
    if rejected {
        warn!(job_id = %id, "job rejected before it started");
    }
    Ok(rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterId;
    use crate::job::{Job, JobConfig, Task, TaskStatus, ALL_JOB_STATUSES};
    use crate::store::{JobStore, OpenStore, SqliteStore};

    fn store_with(status: JobStatus) -> (SqliteStore, JobId) {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut job = Job::new(JobId::new("j"), ["a"], JobConfig::new());
        job.status = status;
        store.save_job(&job).unwrap();
        (store, job.id)
    }

    #[test]
    fn stored_status_follows_the_table() {
        for from in ALL_JOB_STATUSES {
            for to in ALL_JOB_STATUSES {
                let (store, id) = store_with(from);
                let result = set_status(&store, &id, to);
                let stored = store.job_state(&id).unwrap().unwrap().0;
                match from.transition_to(to) {
                    Ok(_) => {
                        assert!(result.is_ok(), "{from} -> {to}");
                        assert_eq!(stored, to);
                    }
                    Err(_) => {
                        assert!(matches!(result, Err(CoordinatorError::InvalidTransition(_))));
                        assert_eq!(stored, from, "{from} -> {to} changed the job");
                    }
                }
            }
        }
    }

    #[test]
    fn processing_records_start_time_once() {
        let (store, id) = store_with(JobStatus::New);
        set_status(&store, &id, JobStatus::Processing).unwrap();
        let first = store.get_job(&id).unwrap().unwrap().start_time.unwrap();
        set_status(&store, &id, JobStatus::Finished).unwrap();
        set_status(&store, &id, JobStatus::Processing).unwrap();
        assert_eq!(store.get_job(&id).unwrap().unwrap().start_time.unwrap(), first);
    }

    #[test]
    fn unknown_job() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(
            set_status(&store, &JobId::new("x"), JobStatus::Stopped),
            Err(CoordinatorError::UnknownJob(_))
        ));
    }

    #[test]
    fn only_new_jobs_can_be_rejected() {
        let (store, id) = store_with(JobStatus::New);
        assert!(JobStatus::New.transition_to(JobStatus::Error).is_err());
        assert!(reject_new_job(&store, &id).unwrap());
        assert_eq!(store.job_state(&id).unwrap().unwrap().0, JobStatus::Error);
        assert!(!reject_new_job(&store, &id).unwrap());

        let (store, id) = store_with(JobStatus::Processing);
        assert!(!reject_new_job(&store, &id).unwrap());
        assert_eq!(store.job_state(&id).unwrap().unwrap().0, JobStatus::Processing);
    }

    #[test]
    fn finish_picks_status_from_failures() {
        let (store, id) = store_with(JobStatus::Processing);
        assert_eq!(finish_job(&store, &id, "idle").unwrap(), JobStatus::Finished);

        let (store, id) = store_with(JobStatus::Processing);
        let mut task = Task::new(id.clone(), AdapterId::new(), "a", 1);
        task.status = TaskStatus::Failed;
        store.insert_task(&task).unwrap();
        assert_eq!(
            finish_job(&store, &id, "idle").unwrap(),
            JobStatus::FinishedWithErrors
        );
        // a second finish is a same-state no-op
        assert_eq!(
            finish_job(&store, &id, "idle").unwrap(),
            JobStatus::FinishedWithErrors
        );
        let history = store.get_job(&id).unwrap().unwrap().history;
        assert_eq!(history.len(), 1);
    }
}
