//! The job record and its append-only logs

use super::{JobConfig, JobStatus, Task, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Job identifier, issued by the graph store when the job's graph is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a history entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Created,
    Command,
    Cycle,
    TaskFailed,
    Status,
}

impl HistoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryKind::Created => "created",
            HistoryKind::Command => "command",
            HistoryKind::Cycle => "cycle",
            HistoryKind::TaskFailed => "task_failed",
            HistoryKind::Status => "status",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            HistoryKind::Created,
            HistoryKind::Command,
            HistoryKind::Cycle,
            HistoryKind::TaskFailed,
            HistoryKind::Status,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
    }
}

/// One entry of a job's history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub kind: HistoryKind,
    pub message: String,
    pub task_id: Option<TaskId>,
    pub adapter: Option<String>,
    #[serde(default)]
    pub details: Value,
}

impl HistoryEntry {
    pub fn new(kind: HistoryKind, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            kind,
            message: message.into(),
            task_id: None,
            adapter: None,
            details: Value::Null,
        }
    }

    pub fn for_task(mut self, task_id: Option<TaskId>, adapter: Option<&str>) -> Self {
        self.task_id = task_id;
        self.adapter = adapter.map(str::to_string);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// One entry of a job's error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub at: DateTime<Utc>,
    pub task_id: Option<TaskId>,
    pub adapter: Option<String>,
    pub message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            task_id: None,
            adapter: None,
            message: message.into(),
        }
    }

    pub fn for_task(mut self, task_id: TaskId, adapter: impl Into<String>) -> Self {
        self.task_id = Some(task_id);
        self.adapter = Some(adapter.into());
        self
    }
}

/// A submitted unit of work and everything recorded about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// Lowercased names of the adapters this job may dispatch to
    pub approved_adapters: BTreeSet<String>,
    pub tasks: BTreeMap<TaskId, Task>,
    pub history: Vec<HistoryEntry>,
    pub errors: Vec<JobError>,
    pub config: JobConfig,
    /// Highest graph revision observed for this job
    pub graph_activity: u64,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_task_time: Option<DateTime<Utc>>,
    pub reset_time: Option<DateTime<Utc>>,
    pub expire_time: Option<DateTime<Utc>>,
    pub reason: String,
}

impl Job {
    pub fn new<I, S>(id: JobId, adapters: I, config: JobConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::New,
            approved_adapters: normalize_adapters(adapters),
            tasks: BTreeMap::new(),
            history: Vec::new(),
            errors: Vec::new(),
            reset_time: config.reset_date,
            expire_time: config.expire_date,
            config,
            graph_activity: 0,
            create_time: now,
            start_time: None,
            last_task_time: None,
            reason: String::new(),
        }
    }

    /// Fill in reset and expire times the config did not set explicitly.
    pub fn with_default_schedule(mut self, reset_days: i64, expire_days: i64) -> Self {
        if self.reset_time.is_none() {
            self.reset_time = Some(self.create_time + chrono::Duration::days(reset_days));
        }
        if self.expire_time.is_none() {
            self.expire_time = Some(self.create_time + chrono::Duration::days(expire_days));
        }
        self
    }

    /// Whether `adapter` is on the approved list, ignoring case.
    pub fn approves(&self, adapter: &str) -> bool {
        self.approved_adapters
            .contains(&adapter.trim().to_lowercase())
    }

    pub fn active_task_count(&self) -> usize {
        self.tasks.values().filter(|t| t.status.is_active()).count()
    }

    /// True once any task of this job has failed, even if it was later replayed.
    pub fn has_failures(&self) -> bool {
        self.tasks.values().any(|t| t.status == TaskStatus::Failed)
            || self.history.iter().any(|h| h.kind == HistoryKind::TaskFailed)
    }

    /// The terminal status this job finishes with.
    pub fn finish_status(&self) -> JobStatus {
        if self.has_failures() || self.status == JobStatus::Error {
            JobStatus::FinishedWithErrors
        } else {
            JobStatus::Finished
        }
    }

    /// Most recent moment this job did anything.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_task_time
            .or(self.start_time)
            .unwrap_or(self.create_time)
    }

    /// Compact JSON view for listings.
    pub fn summary(&self) -> Value {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status.as_str()).or_default() += 1;
        }
        json!({
            "job_id": self.id,
            "status": self.status,
            "reason": self.reason,
            "adapters": self.approved_adapters,
            "create_time": self.create_time,
            "start_time": self.start_time,
            "last_task_time": self.last_task_time,
            "graph_activity": self.graph_activity,
            "task_count": self.tasks.len(),
            "active_tasks": self.active_task_count(),
            "tasks_by_status": counts,
            "error_count": self.errors.len(),
            "description": self.config.description,
        })
    }
}

/// Lowercase and deduplicate adapter names.
pub fn normalize_adapters<I, S>(adapters: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    adapters
        .into_iter()
        .map(|a| a.as_ref().trim().to_lowercase())
        .filter(|a| !a.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterId;

    fn job() -> Job {
        Job::new(JobId::new("j1"), ["HelloWorld", "helloworld", " Other "], JobConfig::new())
    }

    #[test]
    fn adapters_are_normalized() {
        let job = job();
        let names: Vec<_> = job.approved_adapters.iter().cloned().collect();
        assert_eq!(names, vec!["helloworld", "other"]);
    }

    #[test]
    fn finishes_with_errors_after_a_failed_task() {
        let mut job = job();
        assert_eq!(job.finish_status(), JobStatus::Finished);

        let mut task = Task::new(job.id.clone(), AdapterId::new(), "helloworld", 1);
        task.status = TaskStatus::Failed;
        job.tasks.insert(task.id, task);
        assert_eq!(job.finish_status(), JobStatus::FinishedWithErrors);
    }

    #[test]
    fn replayed_failure_still_counts() {
        let mut job = job();
        job.history.push(HistoryEntry::new(HistoryKind::TaskFailed, "boom"));
        assert!(job.has_failures());
    }

    #[test]
    fn default_schedule_respects_explicit_dates() {
        let when = Utc::now() + chrono::Duration::days(30);
        let config = JobConfig {
            reset_date: Some(when),
            ..JobConfig::default()
        };
        let job = Job::new(JobId::new("j2"), ["a"], config).with_default_schedule(1, 7);
        assert_eq!(job.reset_time, Some(when));
        assert_eq!(
            job.expire_time,
            Some(job.create_time + chrono::Duration::days(7))
        );
    }

    #[test]
    fn summary_counts_tasks() {
        let mut job = job();
        let task = Task::new(job.id.clone(), AdapterId::new(), "helloworld", 3);
        job.tasks.insert(task.id, task);
        let summary = job.summary();
        assert_eq!(summary["active_tasks"], 1);
        assert_eq!(summary["tasks_by_status"]["PROCESSING"], 1);
        assert_eq!(summary["status"], "NEW");
    }
}
