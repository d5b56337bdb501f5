//! Adapter registration records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for one running worker instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AdapterId(Uuid);

impl AdapterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for AdapterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AdapterId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Health of a registered worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdapterStatus {
    New,
    Online,
    Degraded,
    Offline,
}

impl AdapterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AdapterStatus::New => "NEW",
            AdapterStatus::Online => "ONLINE",
            AdapterStatus::Degraded => "DEGRADED",
            AdapterStatus::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for AdapterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterStatus {
    type Err = crate::job::UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            AdapterStatus::New,
            AdapterStatus::Online,
            AdapterStatus::Degraded,
            AdapterStatus::Offline,
        ]
        .into_iter()
        .find(|status| status.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| crate::job::UnknownStatus(s.to_string()))
    }
}

/// What one worker instance told the registry about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterRecord {
    pub id: AdapterId,
    /// Logical worker type, stored lowercased
    pub name: String,
    /// Attribute name to regex a changed attribute must fully match
    pub required_keys: BTreeMap<String, String>,
    pub graph_query: String,
    pub default_depth: Option<u32>,
    /// Chunk size this worker prefers; 0 defers to the global setting
    pub max_nodes_per_task: i64,
    pub status: AdapterStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub task_count: u64,
}

impl AdapterRecord {
    pub fn new(name: impl AsRef<str>, graph_query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: AdapterId::new(),
            name: name.as_ref().trim().to_lowercase(),
            required_keys: BTreeMap::new(),
            graph_query: graph_query.into(),
            default_depth: None,
            max_nodes_per_task: 0,
            status: AdapterStatus::New,
            last_heartbeat: now,
            start_time: now,
            task_count: 0,
        }
    }

    pub fn with_required_key(mut self, key: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.required_keys.insert(key.into(), pattern.into());
        self
    }

    pub fn with_default_depth(mut self, depth: Option<u32>) -> Self {
        self.default_depth = depth;
        self
    }

    pub fn with_max_nodes(mut self, max_nodes: i64) -> Self {
        self.max_nodes_per_task = max_nodes;
        self
    }

    /// Name of this instance's dedicated task queue.
    pub fn queue_name(&self) -> String {
        format!("{}-{}", self.name, self.id)
    }

    /// Seconds since the last heartbeat; never negative.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_heartbeat).num_seconds().max(0)
    }
}
