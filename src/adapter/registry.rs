//! Adapter registry: capability records, instance resolution and query building
//!
//! Workers register one record per running instance. The registry resolves
//! a logical worker name to a live instance, builds that instance's pattern
//! query for a job, and matches required-key patterns against attribute
//! diffs.

use super::{AdapterId, AdapterRecord, AdapterStatus};
use crate::graph::GraphQuery;
use crate::job::JobConfig;
use crate::message::NodeData;
use crate::store::{AdapterStore, StorageResult};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolve the depth bound for one worker running one job.
///
/// Precedence: the job's per-adapter override, then the job's global depth,
/// then the worker's own default. `None` means the query is unbounded.
pub fn resolve_depth(record: &AdapterRecord, config: &JobConfig) -> Option<u32> {
    config
        .adapter_depth(&record.name)
        .or(config.depth)
        .or(record.default_depth)
}

/// Typed view over the adapter namespace of the store.
#[derive(Clone)]
pub struct AdapterRegistry {
    store: Arc<dyn AdapterStore>,
}

impl AdapterRegistry {
    pub fn new(store: Arc<dyn AdapterStore>) -> Self {
        Self { store }
    }

    /// Record a worker instance that just started.
    pub fn register(&self, record: &AdapterRecord) -> StorageResult<()> {
        debug!(adapter = %record.name, adapter_id = %record.id, "registering adapter");
        self.store.upsert_adapter(record)
    }

    pub fn heartbeat(&self, id: &AdapterId, at: DateTime<Utc>) -> StorageResult<bool> {
        self.store.heartbeat(id, at)
    }

    pub fn get(&self, id: &AdapterId) -> StorageResult<Option<AdapterRecord>> {
        self.store.get_adapter(id)
    }

    pub fn all(&self) -> StorageResult<Vec<AdapterRecord>> {
        self.store.adapters()
    }

    pub fn set_status(&self, id: &AdapterId, status: AdapterStatus) -> StorageResult<bool> {
        self.store.set_adapter_status(id, status)
    }

    /// Count one more task sent to this instance.
    pub fn record_task(&self, id: &AdapterId) -> StorageResult<()> {
        self.store.increment_task_count(id)
    }

    /// Usable instances of a logical worker type, in registration order.
    pub fn instances(&self, name: &str) -> StorageResult<Vec<AdapterRecord>> {
        Ok(self
            .store
            .adapters()?
            .into_iter()
            .filter(|r| r.name.eq_ignore_ascii_case(name) && r.status != AdapterStatus::Offline)
            .collect())
    }

    /// Pick one instance for a logical worker name.
    ///
    /// The first usable instance in registration order wins. Task counts
    /// and heartbeat freshness are tracked but not compared.
    pub fn resolve_instance(&self, name: &str) -> StorageResult<Option<AdapterRecord>> {
        let instances = self.instances(name)?;
        if instances.len() > 1 {
            debug!(adapter = name, candidates = instances.len(), "several instances, taking first");
        }
        Ok(instances.into_iter().next())
    }

    /// The query an instance should run for a job.
    pub fn build_query(&self, record: &AdapterRecord, config: &JobConfig) -> GraphQuery {
        GraphQuery::new(record.graph_query.clone()).with_depth(resolve_depth(record, config))
    }

    /// Instances whose required keys all fully match the diff.
    ///
    /// One instance per logical name; the first registered wins.
    pub fn candidates_for_diff(&self, diff: &NodeData) -> StorageResult<Vec<AdapterRecord>> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for record in self.store.adapters()? {
            if record.status == AdapterStatus::Offline || seen.contains(&record.name) {
                continue;
            }
            if required_keys_match(&record, diff) {
                seen.insert(record.name.clone());
                candidates.push(record);
            }
        }
        Ok(candidates)
    }
}

fn required_keys_match(record: &AdapterRecord, diff: &NodeData) -> bool {
    record.required_keys.iter().all(|(key, pattern)| {
        let Some(value) = diff.get(key) else {
            return false;
        };
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(re) => re.is_match(&text),
            Err(e) => {
                warn!(adapter = %record.name, key, error = %e, "invalid required-key pattern");
                false
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{OpenStore, SqliteStore};
    use serde_json::json;

    fn registry() -> AdapterRegistry {
        AdapterRegistry::new(Arc::new(SqliteStore::open_in_memory().unwrap()))
    }

    fn diff(v: Value) -> NodeData {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn depth_precedence() {
        let record = AdapterRecord::new("hello", "n(type=id)").with_default_depth(Some(5));
        let all = JobConfig::new().with_depth(3).with_adapter_depth("Hello", 1);
        assert_eq!(resolve_depth(&record, &all), Some(1));

        let global = JobConfig::new().with_depth(3);
        assert_eq!(resolve_depth(&record, &global), Some(3));

        assert_eq!(resolve_depth(&record, &JobConfig::new()), Some(5));

        let bare = AdapterRecord::new("hello", "n(type=id)");
        assert_eq!(resolve_depth(&bare, &JobConfig::new()), None);
        assert_eq!(
            registry().build_query(&bare, &JobConfig::new()).render(),
            "n(type=id)"
        );
    }

    #[test]
    fn resolution_is_case_insensitive_and_skips_offline() {
        let registry = registry();
        let offline = AdapterRecord::new("Hello", "n()");
        let online = AdapterRecord::new("hello", "n()");
        registry.register(&offline).unwrap();
        registry.register(&online).unwrap();
        registry.set_status(&offline.id, AdapterStatus::Offline).unwrap();

        let picked = registry.resolve_instance("HELLO").unwrap().unwrap();
        assert_eq!(picked.id, online.id);
        assert!(registry.resolve_instance("unknown").unwrap().is_none());
    }

    #[test]
    fn first_registered_instance_wins() {
        let registry = registry();
        let first = AdapterRecord::new("hello", "n()");
        let second = AdapterRecord::new("hello", "n()");
        registry.register(&first).unwrap();
        registry.register(&second).unwrap();
        for _ in 0..3 {
            registry.record_task(&first.id).unwrap();
        }
        assert_eq!(registry.resolve_instance("hello").unwrap().unwrap().id, first.id);
    }

    #[test]
    fn required_keys_must_all_match_fully() {
        let registry = registry();
        let ip = AdapterRecord::new("geo", "n()")
            .with_required_key("type", "ip")
            .with_required_key("value", r"\d+\.\d+\.\d+\.\d+");
        let ip_twin = AdapterRecord::new("geo", "n()").with_required_key("type", "ip");
        let domain = AdapterRecord::new("whois", "n()").with_required_key("type", "domain|host");
        registry.register(&ip).unwrap();
        registry.register(&ip_twin).unwrap();
        registry.register(&domain).unwrap();

        let hits = registry
            .candidates_for_diff(&diff(json!({"type": "ip", "value": "10.0.0.1"})))
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![ip.id]);

        // partial match of "ip" inside "zip" does not count
        let none = registry
            .candidates_for_diff(&diff(json!({"type": "zip", "value": "1.2.3.4"})))
            .unwrap();
        assert!(none.is_empty());

        let host = registry
            .candidates_for_diff(&diff(json!({"type": "host"})))
            .unwrap();
        assert_eq!(host.len(), 1);
        assert_eq!(host[0].name, "whois");
    }
}
