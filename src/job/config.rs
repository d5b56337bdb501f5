//! Per-job configuration carried with every payload

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Per-adapter overrides inside a job configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

/// Job configuration.
///
/// Known keys are typed; anything else a submitter sends is kept in `extra`
/// and travels untouched to the workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Global depth bound for pattern queries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    /// Seconds a job may run before it expires; 0 is unbounded
    pub ttl: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub priority: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Overrides keyed by adapter name
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub adapters: BTreeMap<String, AdapterOverride>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub roles: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_date: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_adapter_depth(mut self, adapter: impl Into<String>, depth: u32) -> Self {
        self.adapters
            .entry(adapter.into().to_lowercase())
            .or_default()
            .depth = Some(depth);
        self
    }

    /// Depth override for one adapter, matched case-insensitively.
    pub fn adapter_depth(&self, adapter: &str) -> Option<u32> {
        self.adapters
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(adapter))
            .and_then(|(_, o)| o.depth)
    }

    pub fn is_empty(&self) -> bool {
        self == &JobConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_keys_survive_a_round_trip() {
        let raw = json!({
            "depth": 3,
            "ttl": 60,
            "adapters": {"HelloWorld": {"depth": 1}},
            "color": "blue"
        });
        let config: JobConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.depth, Some(3));
        assert_eq!(config.adapter_depth("helloworld"), Some(1));
        assert_eq!(config.extra.get("color"), Some(&json!("blue")));

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["color"], json!("blue"));
        assert!(back.get("reset_date").is_none());
    }

    #[test]
    fn empty_config_is_default() {
        assert!(JobConfig::new().is_empty());
        assert!(!JobConfig::new().with_ttl(5).is_empty());
    }
}
