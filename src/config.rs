//! Coordinator settings
//!
//! Loaded from a YAML file. Every key is optional; missing keys take the
//! defaults below.
//!
//! ```yaml
//! max_graph_size: 50000
//! max_nodes_per_task: 100
//! heartbeat_interval_secs: 30
//! max_adapter_heartbeat_secs: 300
//! max_job_idle_secs: 30
//! graph_store_mode: graph
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// How the dispatch engine decides which workers see new data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphStoreMode {
    /// Run each approved worker's pattern query over the new revisions
    #[default]
    Graph,
    /// Diff each response node against the job's node cache and match the
    /// changed attributes against worker required keys
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Graph revisions a job may reach before it is stopped; 0 disables the limit
    pub max_graph_size: i64,
    /// Nodes per task; 0 sends every match in one task
    pub max_nodes_per_task: i64,
    pub graph_store_mode: GraphStoreMode,
    /// Maintenance tick and worker heartbeat period
    pub heartbeat_interval_secs: u64,
    /// Heartbeat age after which a worker is considered offline
    pub max_adapter_heartbeat_secs: i64,
    /// Idle seconds after which a job with no active tasks is finished; 0 disables
    pub max_job_idle_secs: i64,
    /// Run time after which a job is finished regardless; 0 disables
    pub max_job_run_time_secs: i64,
    /// Period of the scheduled reset and expire batches
    pub sweep_period_secs: i64,
    pub command_partitions: usize,
    pub dispatch_partitions: usize,
    /// Deliveries before a worker queue dead-letters a message
    pub worker_queue_max_deliveries: u32,
    pub default_reset_days: i64,
    pub default_expire_days: i64,
    pub command_queue: String,
    pub engine_queue: String,
    /// SQLite database path; the user data directory when unset
    pub database: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_graph_size: 0,
            max_nodes_per_task: 0,
            graph_store_mode: GraphStoreMode::Graph,
            heartbeat_interval_secs: 30,
            max_adapter_heartbeat_secs: 300,
            max_job_idle_secs: 30,
            max_job_run_time_secs: 0,
            sweep_period_secs: 86_400,
            command_partitions: 4,
            dispatch_partitions: 4,
            worker_queue_max_deliveries: 3,
            default_reset_days: 1,
            default_expire_days: 7,
            command_queue: "ripple.commands".into(),
            engine_queue: "ripple.engine".into(),
            database: None,
        }
    }
}

impl Settings {
    /// Load settings from a YAML file, falling back to defaults if it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_yaml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key, reason: &str| {
            Err(ConfigError::Invalid {
                key,
                reason: reason.to_string(),
            })
        };
        if self.heartbeat_interval_secs == 0 {
            return invalid("heartbeat_interval_secs", "must be positive");
        }
        if self.max_adapter_heartbeat_secs <= 0 {
            return invalid("max_adapter_heartbeat_secs", "must be positive");
        }
        if self.sweep_period_secs <= 0 {
            return invalid("sweep_period_secs", "must be positive");
        }
        if self.command_partitions == 0 {
            return invalid("command_partitions", "must be at least 1");
        }
        if self.dispatch_partitions == 0 {
            return invalid("dispatch_partitions", "must be at least 1");
        }
        if self.worker_queue_max_deliveries == 0 {
            return invalid("worker_queue_max_deliveries", "must be at least 1");
        }
        if self.max_job_idle_secs < 0 || self.max_job_run_time_secs < 0 {
            return invalid("max_job_idle_secs", "must not be negative");
        }
        if self.default_reset_days < 0 || self.default_expire_days < 0 {
            return invalid("default_expire_days", "must not be negative");
        }
        if self.command_queue.is_empty() || self.engine_queue.is_empty() {
            return invalid("command_queue", "queue names must not be empty");
        }
        if self.command_queue == self.engine_queue {
            return invalid("engine_queue", "must differ from command_queue");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Database path, defaulting to `<data dir>/ripple/ripple.db`.
    pub fn database_path(&self) -> PathBuf {
        self.database.clone().unwrap_or_else(|| {
            let data_dir = dirs::data_dir()
                .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
            data_dir.join("ripple").join("ripple.db")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.max_adapter_heartbeat_secs, 300);
        assert_eq!(settings.max_job_idle_secs, 30);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let settings = Settings::from_yaml("max_graph_size: 50000\nmax_nodes_per_task: 10\n").unwrap();
        assert_eq!(settings.max_graph_size, 50_000);
        assert_eq!(settings.max_nodes_per_task, 10);
        assert_eq!(settings.sweep_period_secs, 86_400);
        assert_eq!(settings.graph_store_mode, GraphStoreMode::Graph);
    }

    #[test]
    fn graph_store_mode_is_lowercase() {
        let settings = Settings::from_yaml("graph_store_mode: internal\n").unwrap();
        assert_eq!(settings.graph_store_mode, GraphStoreMode::Internal);
        assert!(Settings::from_yaml("graph_store_mode: mongo\n").is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Settings::from_yaml("command_partitions: 0\n").is_err());
        assert!(Settings::from_yaml("engine_queue: ripple.commands\n").is_err());
        assert!(Settings::from_yaml("heartbeat_interval_secs: nope\n").is_err());
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ripple.yaml");
        std::fs::write(&path, "max_job_idle_secs: 5\ndatabase: /tmp/r.db\n").unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.max_job_idle_secs, 5);
        assert_eq!(settings.database_path(), PathBuf::from("/tmp/r.db"));
    }
}
