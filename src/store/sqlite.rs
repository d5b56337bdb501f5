//! SQLite storage backend

use super::traits::{AdapterStore, CycleMark, JobStore, OpenStore, StorageError, StorageResult};
use crate::adapter::{AdapterId, AdapterRecord, AdapterStatus};
use crate::job::{
    HistoryEntry, HistoryKind, Job, JobConfig, JobError, JobId, JobStatus, RevisionWindow, Task,
    TaskId, TaskStatus,
};
use crate::message::NodeData;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// SQLite-backed job, task and adapter store
///
/// Uses a single SQLite database file. Thread-safe via internal mutex on the
/// connection. Timestamps are stored as fixed-width RFC 3339 strings in UTC
/// so range queries can compare them as text.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn fmt_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::DateParse(format!("{s}: {e}")))
}

fn parse_opt_time(s: Option<String>) -> StorageResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_time).transpose()
}

fn parse_value<T: std::str::FromStr>(s: &str) -> StorageResult<T>
where
    T::Err: std::fmt::Display,
{
    s.parse()
        .map_err(|e: T::Err| StorageError::InvalidValue(format!("{s}: {e}")))
}

/// Raw job columns, converted outside the row callback.
struct JobRow {
    id: String,
    status: String,
    adapters_json: String,
    config_json: String,
    graph_activity: i64,
    create_time: String,
    start_time: Option<String>,
    last_task_time: Option<String>,
    reset_time: Option<String>,
    expire_time: Option<String>,
    reason: String,
}

const JOB_COLUMNS: &str = "id, status, adapters_json, config_json, graph_activity, create_time, \
     start_time, last_task_time, reset_time, expire_time, reason";

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            adapters_json: row.get(2)?,
            config_json: row.get(3)?,
            graph_activity: row.get(4)?,
            create_time: row.get(5)?,
            start_time: row.get(6)?,
            last_task_time: row.get(7)?,
            reset_time: row.get(8)?,
            expire_time: row.get(9)?,
            reason: row.get(10)?,
        })
    }

    fn into_job(self) -> StorageResult<Job> {
        let adapters: BTreeSet<String> = serde_json::from_str(&self.adapters_json)?;
        let config: JobConfig = serde_json::from_str(&self.config_json)?;
        Ok(Job {
            id: JobId::new(self.id),
            status: parse_value(&self.status)?,
            approved_adapters: adapters,
            tasks: BTreeMap::new(),
            history: Vec::new(),
            errors: Vec::new(),
            config,
            graph_activity: self.graph_activity.max(0) as u64,
            create_time: parse_time(&self.create_time)?,
            start_time: parse_opt_time(self.start_time)?,
            last_task_time: parse_opt_time(self.last_task_time)?,
            reset_time: parse_opt_time(self.reset_time)?,
            expire_time: parse_opt_time(self.expire_time)?,
            reason: self.reason,
        })
    }
}

struct TaskRow {
    id: String,
    job_id: String,
    parent_id: Option<String>,
    adapter_id: String,
    adapter_name: String,
    node_count: i64,
    status: String,
    current_rev: i64,
    max_rev: i64,
    page: i64,
    create_time: String,
    end_time: Option<String>,
}

const TASK_COLUMNS: &str = "id, job_id, parent_id, adapter_id, adapter_name, node_count, status, \
     current_rev, max_rev, page, create_time, end_time";

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            parent_id: row.get(2)?,
            adapter_id: row.get(3)?,
            adapter_name: row.get(4)?,
            node_count: row.get(5)?,
            status: row.get(6)?,
            current_rev: row.get(7)?,
            max_rev: row.get(8)?,
            page: row.get(9)?,
            create_time: row.get(10)?,
            end_time: row.get(11)?,
        })
    }

    fn into_task(self) -> StorageResult<Task> {
        Ok(Task {
            id: parse_value(&self.id)?,
            job_id: JobId::new(self.job_id),
            parent_id: self.parent_id.as_deref().map(parse_value).transpose()?,
            adapter_id: parse_value(&self.adapter_id)?,
            adapter_name: self.adapter_name,
            node_count: self.node_count.max(0) as usize,
            status: parse_value(&self.status)?,
            current_graph_revision: self.current_rev.max(0) as u64,
            max_graph_revision: self.max_rev.max(0) as u64,
            node_page_index: self.page.max(0) as usize,
            create_time: parse_time(&self.create_time)?,
            end_time: parse_opt_time(self.end_time)?,
        })
    }
}

/// Shared shape of history, job error and task error rows.
struct LogRow {
    at: String,
    task_id: Option<String>,
    adapter: Option<String>,
    message: String,
    kind: Option<String>,
    details_json: Option<String>,
}

impl LogRow {
    fn into_error(self) -> StorageResult<JobError> {
        Ok(JobError {
            at: parse_time(&self.at)?,
            task_id: self.task_id.as_deref().map(parse_value).transpose()?,
            adapter: self.adapter,
            message: self.message,
        })
    }

    fn into_history(self) -> StorageResult<HistoryEntry> {
        let kind = self.kind.unwrap_or_default();
        Ok(HistoryEntry {
            at: parse_time(&self.at)?,
            kind: HistoryKind::parse(&kind)
                .ok_or_else(|| StorageError::InvalidValue(format!("history kind {kind}")))?,
            message: self.message,
            task_id: self.task_id.as_deref().map(parse_value).transpose()?,
            adapter: self.adapter,
            details: match self.details_json {
                Some(json) => serde_json::from_str(&json)?,
                None => serde_json::Value::Null,
            },
        })
    }
}

struct AdapterRow {
    id: String,
    name: String,
    required_keys_json: String,
    graph_query: String,
    default_depth: Option<i64>,
    max_nodes: i64,
    status: String,
    last_heartbeat: String,
    start_time: String,
    task_count: i64,
}

const ADAPTER_COLUMNS: &str = "id, name, required_keys_json, graph_query, default_depth, \
     max_nodes, status, last_heartbeat, start_time, task_count";

impl AdapterRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            required_keys_json: row.get(2)?,
            graph_query: row.get(3)?,
            default_depth: row.get(4)?,
            max_nodes: row.get(5)?,
            status: row.get(6)?,
            last_heartbeat: row.get(7)?,
            start_time: row.get(8)?,
            task_count: row.get(9)?,
        })
    }

    fn into_record(self) -> StorageResult<AdapterRecord> {
        Ok(AdapterRecord {
            id: parse_value(&self.id)?,
            name: self.name,
            required_keys: serde_json::from_str(&self.required_keys_json)?,
            graph_query: self.graph_query,
            default_depth: self.default_depth.map(|d| d.max(0) as u32),
            max_nodes_per_task: self.max_nodes,
            status: parse_value(&self.status)?,
            last_heartbeat: parse_time(&self.last_heartbeat)?,
            start_time: parse_time(&self.start_time)?,
            task_count: self.task_count.max(0) as u64,
        })
    }
}

impl SqliteStore {
    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                adapters_json TEXT NOT NULL,
                config_json TEXT NOT NULL,
                graph_activity INTEGER NOT NULL DEFAULT 0,
                create_time TEXT NOT NULL,
                start_time TEXT,
                last_task_time TEXT,
                reset_time TEXT,
                expire_time TEXT,
                reason TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_reset ON jobs(reset_time);
            CREATE INDEX IF NOT EXISTS idx_jobs_expire ON jobs(expire_time);
            CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(create_time);

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                parent_id TEXT,
                adapter_id TEXT NOT NULL,
                adapter_name TEXT NOT NULL,
                node_count INTEGER NOT NULL,
                status TEXT NOT NULL,
                current_rev INTEGER NOT NULL,
                max_rev INTEGER NOT NULL,
                page INTEGER NOT NULL,
                create_time TEXT NOT NULL,
                end_time TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_job ON tasks(job_id, status);

            CREATE TABLE IF NOT EXISTS job_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                at TEXT NOT NULL,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                task_id TEXT,
                adapter TEXT,
                details_json TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_history_job ON job_history(job_id);

            CREATE TABLE IF NOT EXISTS job_errors (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                at TEXT NOT NULL,
                task_id TEXT,
                adapter TEXT,
                message TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_errors_job ON job_errors(job_id);

            CREATE TABLE IF NOT EXISTS task_errors (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                at TEXT NOT NULL,
                adapter TEXT,
                message TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_task_errors_task ON task_errors(task_id);

            CREATE TABLE IF NOT EXISTS adapters (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                required_keys_json TEXT NOT NULL,
                graph_query TEXT NOT NULL,
                default_depth INTEGER,
                max_nodes INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL,
                start_time TEXT NOT NULL,
                task_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_adapters_name ON adapters(name);

            CREATE TABLE IF NOT EXISTS cycle_marks (
                message_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                window_start INTEGER,
                window_end INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_cycle_marks_job ON cycle_marks(job_id);

            CREATE TABLE IF NOT EXISTS node_cache (
                job_id TEXT NOT NULL,
                node_key TEXT NOT NULL,
                data_json TEXT NOT NULL,
                PRIMARY KEY (job_id, node_key)
            );

            -- Enable WAL mode for concurrent reads during writes
            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load_job(conn: &Connection, id: &JobId) -> StorageResult<Option<Job>> {
        let row = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.as_str()],
                JobRow::read,
            )
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut job = row.into_job()?;
        for task in Self::load_tasks(conn, id)? {
            job.tasks.insert(task.id, task);
        }

        let mut stmt = conn.prepare(
            "SELECT at, task_id, adapter, message, kind, details_json
             FROM job_history WHERE job_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![id.as_str()], |row| {
            Ok(LogRow {
                at: row.get(0)?,
                task_id: row.get(1)?,
                adapter: row.get(2)?,
                message: row.get(3)?,
                kind: row.get(4)?,
                details_json: row.get(5)?,
            })
        })?;
        for row in rows {
            job.history.push(row?.into_history()?);
        }

        job.errors = Self::load_errors(
            conn,
            "SELECT at, task_id, adapter, message FROM job_errors WHERE job_id = ?1 ORDER BY seq",
            id.as_str(),
        )?;
        Ok(Some(job))
    }

    fn load_tasks(conn: &Connection, job_id: &JobId) -> StorageResult<Vec<Task>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE job_id = ?1 ORDER BY create_time, id"
        ))?;
        let rows = stmt.query_map(params![job_id.as_str()], TaskRow::read)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?.into_task()?);
        }
        Ok(tasks)
    }

    fn load_errors(conn: &Connection, sql: &str, key: &str) -> StorageResult<Vec<JobError>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![key], |row| {
            Ok(LogRow {
                at: row.get(0)?,
                task_id: row.get(1)?,
                adapter: row.get(2)?,
                message: row.get(3)?,
                kind: None,
                details_json: None,
            })
        })?;
        let mut errors = Vec::new();
        for row in rows {
            errors.push(row?.into_error()?);
        }
        Ok(errors)
    }

    fn query_ids(
        conn: &Connection,
        sql: &str,
        values: Vec<String>,
    ) -> StorageResult<Vec<JobId>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(JobId::new(row?));
        }
        Ok(ids)
    }

    fn require_job(changed: usize, id: &JobId) -> StorageResult<()> {
        if changed == 0 {
            Err(StorageError::JobNotFound(id.clone()))
        } else {
            Ok(())
        }
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }
}

impl JobStore for SqliteStore {
    // === Job Operations ===

    fn save_job(&self, job: &Job) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO jobs ({JOB_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    adapters_json = excluded.adapters_json,
                    config_json = excluded.config_json,
                    graph_activity = MAX(jobs.graph_activity, excluded.graph_activity),
                    create_time = excluded.create_time,
                    start_time = excluded.start_time,
                    last_task_time = excluded.last_task_time,
                    reset_time = excluded.reset_time,
                    expire_time = excluded.expire_time,
                    reason = excluded.reason"
            ),
            params![
                job.id.as_str(),
                job.status.as_str(),
                serde_json::to_string(&job.approved_adapters)?,
                serde_json::to_string(&job.config)?,
                job.graph_activity as i64,
                fmt_time(job.create_time),
                job.start_time.map(fmt_time),
                job.last_task_time.map(fmt_time),
                job.reset_time.map(fmt_time),
                job.expire_time.map(fmt_time),
                job.reason,
            ],
        )?;
        Ok(())
    }

    fn get_job(&self, id: &JobId) -> StorageResult<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        Self::load_job(&conn, id)
    }

    fn job_state(&self, id: &JobId) -> StorageResult<Option<(JobStatus, u64)>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT status, graph_activity FROM jobs WHERE id = ?1",
                params![id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((status, activity)) => Ok(Some((parse_value(&status)?, activity.max(0) as u64))),
            None => Ok(None),
        }
    }

    fn delete_job(&self, id: &JobId) -> StorageResult<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM task_errors WHERE task_id IN (SELECT id FROM tasks WHERE job_id = ?1)",
            params![id.as_str()],
        )?;
        tx.execute("DELETE FROM tasks WHERE job_id = ?1", params![id.as_str()])?;
        tx.execute("DELETE FROM job_history WHERE job_id = ?1", params![id.as_str()])?;
        tx.execute("DELETE FROM job_errors WHERE job_id = ?1", params![id.as_str()])?;
        tx.execute("DELETE FROM cycle_marks WHERE job_id = ?1", params![id.as_str()])?;
        tx.execute("DELETE FROM node_cache WHERE job_id = ?1", params![id.as_str()])?;
        let deleted = tx.execute("DELETE FROM jobs WHERE id = ?1", params![id.as_str()])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    fn compare_and_set_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        status: JobStatus,
    ) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET status = ?3 WHERE id = ?1 AND status = ?2",
            params![id.as_str(), expected.as_str(), status.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn set_reason(&self, id: &JobId, reason: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET reason = ?2 WHERE id = ?1",
            params![id.as_str(), reason],
        )?;
        Self::require_job(changed, id)
    }

    fn set_config(&self, id: &JobId, config: &JobConfig) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET config_json = ?2 WHERE id = ?1",
            params![id.as_str(), serde_json::to_string(config)?],
        )?;
        Self::require_job(changed, id)
    }

    fn set_adapters(&self, id: &JobId, adapters: &BTreeSet<String>) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET adapters_json = ?2 WHERE id = ?1",
            params![id.as_str(), serde_json::to_string(adapters)?],
        )?;
        Self::require_job(changed, id)
    }

    fn mark_started(&self, id: &JobId, at: DateTime<Utc>) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET start_time = COALESCE(start_time, ?2) WHERE id = ?1",
            params![id.as_str(), fmt_time(at)],
        )?;
        Self::require_job(changed, id)
    }

    fn touch_last_task_time(&self, id: &JobId, at: DateTime<Utc>) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET last_task_time = ?2 WHERE id = ?1",
            params![id.as_str(), fmt_time(at)],
        )?;
        Self::require_job(changed, id)
    }

    fn raise_graph_activity(&self, id: &JobId, revision: u64) -> StorageResult<u64> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET graph_activity = MAX(graph_activity, ?2) WHERE id = ?1",
            params![id.as_str(), revision as i64],
        )?;
        Self::require_job(changed, id)?;
        let activity: i64 = conn.query_row(
            "SELECT graph_activity FROM jobs WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(activity.max(0) as u64)
    }

    fn append_history(&self, id: &JobId, entry: &HistoryEntry) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let details = if entry.details.is_null() {
            None
        } else {
            Some(serde_json::to_string(&entry.details)?)
        };
        conn.execute(
            "INSERT INTO job_history (job_id, at, kind, message, task_id, adapter, details_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.as_str(),
                fmt_time(entry.at),
                entry.kind.as_str(),
                entry.message,
                entry.task_id.map(|t| t.to_string()),
                entry.adapter,
                details,
            ],
        )?;
        Ok(())
    }

    fn append_error(&self, id: &JobId, error: &JobError) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_errors (job_id, at, task_id, adapter, message)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.as_str(),
                fmt_time(error.at),
                error.task_id.map(|t| t.to_string()),
                error.adapter,
                error.message,
            ],
        )?;
        Ok(())
    }

    fn remove_errors_for_task(&self, id: &JobId, task_id: &TaskId) -> StorageResult<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM job_errors WHERE job_id = ?1 AND task_id = ?2",
            params![id.as_str(), task_id.to_string()],
        )?;
        Ok(removed)
    }

    // === Range Queries ===

    fn list_jobs(&self) -> StorageResult<Vec<JobId>> {
        let conn = self.conn.lock().unwrap();
        Self::query_ids(&conn, "SELECT id FROM jobs ORDER BY create_time, id", Vec::new())
    }

    fn jobs_by_status(&self, status: JobStatus) -> StorageResult<Vec<JobId>> {
        let conn = self.conn.lock().unwrap();
        Self::query_ids(
            &conn,
            "SELECT id FROM jobs WHERE status = ?1 ORDER BY create_time, id",
            vec![status.as_str().to_string()],
        )
    }

    fn jobs_due_for_reset(
        &self,
        now: DateTime<Utc>,
        statuses: &[JobStatus],
    ) -> StorageResult<Vec<JobId>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (0..statuses.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "SELECT id FROM jobs WHERE reset_time IS NOT NULL AND reset_time <= ?1
             AND status IN ({}) ORDER BY reset_time, id",
            placeholders.join(", ")
        );
        let mut values = vec![fmt_time(now)];
        values.extend(statuses.iter().map(|s| s.as_str().to_string()));
        let conn = self.conn.lock().unwrap();
        Self::query_ids(&conn, &sql, values)
    }

    fn jobs_due_for_expire(&self, now: DateTime<Utc>) -> StorageResult<Vec<JobId>> {
        let conn = self.conn.lock().unwrap();
        Self::query_ids(
            &conn,
            "SELECT id FROM jobs WHERE expire_time IS NOT NULL AND expire_time <= ?1
             ORDER BY expire_time, id",
            vec![fmt_time(now)],
        )
    }

    fn jobs_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<JobId>> {
        let conn = self.conn.lock().unwrap();
        Self::query_ids(
            &conn,
            "SELECT id FROM jobs WHERE create_time >= ?1 AND create_time <= ?2
             ORDER BY create_time, id",
            vec![fmt_time(from), fmt_time(to)],
        )
    }

    // === Task Operations ===

    fn insert_task(&self, task: &Task) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO tasks ({TASK_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                task.id.to_string(),
                task.job_id.as_str(),
                task.parent_id.map(|p| p.to_string()),
                task.adapter_id.to_string(),
                task.adapter_name,
                task.node_count as i64,
                task.status.as_str(),
                task.current_graph_revision as i64,
                task.max_graph_revision as i64,
                task.node_page_index as i64,
                fmt_time(task.create_time),
                task.end_time.map(fmt_time),
            ],
        )?;
        Ok(())
    }

    fn get_task(&self, id: &TaskId) -> StorageResult<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
                TaskRow::read,
            )
            .optional()?;
        row.map(TaskRow::into_task).transpose()
    }

    fn tasks_for_job(&self, job_id: &JobId) -> StorageResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        Self::load_tasks(&conn, job_id)
    }

    fn active_task_count(&self, job_id: &JobId) -> StorageResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE job_id = ?1 AND status = ?2",
            params![job_id.as_str(), TaskStatus::Processing.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn transition_task(
        &self,
        id: &TaskId,
        expected: TaskStatus,
        status: TaskStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE tasks SET status = ?3, end_time = ?4 WHERE id = ?1 AND status = ?2",
            params![id.to_string(), expected.as_str(), status.as_str(), fmt_time(at)],
        )?;
        Ok(changed > 0)
    }

    // === Task Errors ===

    fn append_task_error(&self, task_id: &TaskId, error: &JobError) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO task_errors (task_id, at, adapter, message) VALUES (?1, ?2, ?3, ?4)",
            params![task_id.to_string(), fmt_time(error.at), error.adapter, error.message],
        )?;
        Ok(())
    }

    fn latest_task_error(&self, task_id: &TaskId) -> StorageResult<Option<JobError>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT at, task_id, adapter, message FROM task_errors
                 WHERE task_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![task_id.to_string()],
                |row| {
                    Ok(LogRow {
                        at: row.get(0)?,
                        task_id: row.get(1)?,
                        adapter: row.get(2)?,
                        message: row.get(3)?,
                        kind: None,
                        details_json: None,
                    })
                },
            )
            .optional()?;
        row.map(LogRow::into_error).transpose()
    }

    fn clear_task_errors(&self, task_id: &TaskId) -> StorageResult<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM task_errors WHERE task_id = ?1",
            params![task_id.to_string()],
        )?;
        Ok(removed)
    }

    // === Cycle Marks ===

    fn mark_cycle(
        &self,
        job_id: &JobId,
        message_id: &Uuid,
        window: Option<RevisionWindow>,
    ) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO cycle_marks (message_id, job_id, window_start, window_end)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                message_id.to_string(),
                job_id.as_str(),
                window.map(|w| w.start as i64),
                window.map(|w| w.end as i64),
            ],
        )?;
        Ok(())
    }

    fn cycle_mark(&self, message_id: &Uuid) -> StorageResult<Option<CycleMark>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, Option<i64>, Option<i64>)> = conn
            .query_row(
                "SELECT job_id, window_start, window_end FROM cycle_marks WHERE message_id = ?1",
                params![message_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(row.map(|(job_id, start, end)| CycleMark {
            job_id: JobId::new(job_id),
            window: start.zip(end).map(|(start, end)| RevisionWindow {
                start: start.max(0) as u64,
                end: end.max(0) as u64,
            }),
        }))
    }

    fn clear_cycle_mark(&self, message_id: &Uuid) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM cycle_marks WHERE message_id = ?1",
            params![message_id.to_string()],
        )?;
        Ok(())
    }

    // === Node Cache ===

    fn cached_node(&self, job_id: &JobId, key: &str) -> StorageResult<Option<NodeData>> {
        let conn = self.conn.lock().unwrap();
        let json: Option<String> = conn
            .query_row(
                "SELECT data_json FROM node_cache WHERE job_id = ?1 AND node_key = ?2",
                params![job_id.as_str(), key],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(StorageError::from))
            .transpose()
    }

    fn cache_node(&self, job_id: &JobId, key: &str, node: &NodeData) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO node_cache (job_id, node_key, data_json) VALUES (?1, ?2, ?3)",
            params![job_id.as_str(), key, serde_json::to_string(node)?],
        )?;
        Ok(())
    }

    fn clear_node_cache(&self, job_id: &JobId) -> StorageResult<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM node_cache WHERE job_id = ?1",
            params![job_id.as_str()],
        )?;
        Ok(removed)
    }
}

impl AdapterStore for SqliteStore {
    fn upsert_adapter(&self, record: &AdapterRecord) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO adapters ({ADAPTER_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    required_keys_json = excluded.required_keys_json,
                    graph_query = excluded.graph_query,
                    default_depth = excluded.default_depth,
                    max_nodes = excluded.max_nodes,
                    status = excluded.status,
                    last_heartbeat = excluded.last_heartbeat,
                    start_time = excluded.start_time,
                    task_count = excluded.task_count"
            ),
            params![
                record.id.to_string(),
                record.name,
                serde_json::to_string(&record.required_keys)?,
                record.graph_query,
                record.default_depth.map(i64::from),
                record.max_nodes_per_task,
                record.status.as_str(),
                fmt_time(record.last_heartbeat),
                fmt_time(record.start_time),
                record.task_count as i64,
            ],
        )?;
        Ok(())
    }

    fn get_adapter(&self, id: &AdapterId) -> StorageResult<Option<AdapterRecord>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("SELECT {ADAPTER_COLUMNS} FROM adapters WHERE id = ?1"),
                params![id.to_string()],
                AdapterRow::read,
            )
            .optional()?;
        row.map(AdapterRow::into_record).transpose()
    }

    fn adapters(&self) -> StorageResult<Vec<AdapterRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ADAPTER_COLUMNS} FROM adapters ORDER BY rowid"
        ))?;
        let rows = stmt.query_map([], AdapterRow::read)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    fn heartbeat(&self, id: &AdapterId, at: DateTime<Utc>) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE adapters SET last_heartbeat = ?2 WHERE id = ?1",
            params![id.to_string(), fmt_time(at)],
        )?;
        Ok(changed > 0)
    }

    fn set_adapter_status(&self, id: &AdapterId, status: AdapterStatus) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE adapters SET status = ?2 WHERE id = ?1",
            params![id.to_string(), status.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn increment_task_count(&self, id: &AdapterId) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE adapters SET task_count = task_count + 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    fn remove_adapter(&self, id: &AdapterId) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM adapters WHERE id = ?1", params![id.to_string()])?;
        Ok(removed > 0)
    }
}
