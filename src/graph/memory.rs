//! In-memory graph store

use super::{CompiledQuery, GraphError, GraphResult, GraphService, PatternMatches, PostResult};
use crate::adapter::AdapterId;
use crate::job::{JobConfig, JobId, RevisionWindow};
use crate::message::{Edge, NodeData, Payload};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredNode {
    data: NodeData,
    depth: u64,
    revision: u64,
}

#[derive(Debug, Clone)]
struct StoredEdge {
    attributes: NodeData,
    revision: u64,
}

/// One job's graph. Node ids are 1-based positions in `nodes`.
#[derive(Debug, Default)]
struct JobGraph {
    nodes: Vec<StoredNode>,
    index: HashMap<(String, String), usize>,
    edges: HashMap<(u64, u64, String), StoredEdge>,
    revision: u64,
}

fn node_key(data: &NodeData) -> Option<(String, String)> {
    let text = |v: &Value| match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    Some((text(data.get("type")?)?, text(data.get("value")?)?))
}

impl JobGraph {
    fn lookup(&self, data: &NodeData) -> Option<&StoredNode> {
        if let Some(key) = node_key(data) {
            return self.index.get(&key).map(|&i| &self.nodes[i]);
        }
        let id = data.get("ID")?.as_u64()?;
        self.nodes.get(usize::try_from(id).ok()?.checked_sub(1)?)
    }

    /// Insert or merge a node, returning its id.
    fn upsert_node(&mut self, data: &NodeData, depth: u64) -> GraphResult<u64> {
        let key = node_key(data)
            .ok_or_else(|| GraphError::InvalidData(format!("node without type/value: {data:?}")))?;

        if let Some(&i) = self.index.get(&key) {
            let node = &mut self.nodes[i];
            let mut changed = false;
            for (k, v) in data {
                if k == "ID" || k == "depth" {
                    continue;
                }
                if node.data.get(k) != Some(v) {
                    node.data.insert(k.clone(), v.clone());
                    changed = true;
                }
            }
            if changed {
                self.revision += 1;
                node.revision = self.revision;
            }
            return Ok(i as u64 + 1);
        }

        self.revision += 1;
        let id = self.nodes.len() as u64 + 1;
        let mut stored = data.clone();
        stored.insert("ID".into(), Value::from(id));
        stored.insert("depth".into(), Value::from(depth));
        self.index.insert(key, self.nodes.len());
        self.nodes.push(StoredNode {
            data: stored,
            depth,
            revision: self.revision,
        });
        Ok(id)
    }

    fn upsert_edge(&mut self, edge: &Edge, depth: u64) -> GraphResult<()> {
        let source = self.upsert_node(&edge.source, depth)?;
        let target = self.upsert_node(&edge.target, depth)?;
        let kind = edge
            .attributes
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("edge")
            .to_string();

        let key = (source, target, kind);
        match self.edges.get_mut(&key) {
            Some(existing) if existing.attributes == edge.attributes => {}
            Some(existing) => {
                self.revision += 1;
                existing.attributes = edge.attributes.clone();
                existing.revision = self.revision;
            }
            None => {
                self.revision += 1;
                self.edges.insert(
                    key,
                    StoredEdge {
                        attributes: edge.attributes.clone(),
                        revision: self.revision,
                    },
                );
            }
        }
        Ok(())
    }
}

/// Graph store kept in process memory.
///
/// Each job graph is a set of nodes keyed by `(type, value)`. Every change
/// bumps the graph's revision counter, and each node remembers the revision
/// of its last change so queries can be restricted to a revision window.
/// New nodes get a depth one greater than the deepest request node of the
/// payload that produced them; seed nodes get depth 0.
#[derive(Debug)]
pub struct MemoryGraph {
    graphs: DashMap<JobId, JobGraph>,
    available: AtomicBool,
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self {
            graphs: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    pub fn has_graph(&self, job_id: &JobId) -> bool {
        self.graphs.contains_key(job_id)
    }

    pub fn node_count(&self, job_id: &JobId) -> usize {
        self.graphs.get(job_id).map_or(0, |g| g.nodes.len())
    }

    pub fn edge_count(&self, job_id: &JobId) -> usize {
        self.graphs.get(job_id).map_or(0, |g| g.edges.len())
    }

    pub fn revision(&self, job_id: &JobId) -> u64 {
        self.graphs.get(job_id).map_or(0, |g| g.revision)
    }

    /// Snapshot of a job's nodes, in id order.
    pub fn nodes(&self, job_id: &JobId) -> Vec<NodeData> {
        self.graphs
            .get(job_id)
            .map(|g| g.nodes.iter().map(|n| n.data.clone()).collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> GraphResult<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(GraphError::Unavailable("memory graph is offline".into()))
        }
    }
}

#[async_trait]
impl GraphService for MemoryGraph {
    async fn create_graph(&self, _config: &JobConfig) -> GraphResult<JobId> {
        self.check_available()?;
        let id = JobId::new(Uuid::new_v4().to_string());
        self.graphs.insert(id.clone(), JobGraph::default());
        Ok(id)
    }

    async fn delete_graph(&self, job_id: &JobId) -> GraphResult<()> {
        self.check_available()?;
        self.graphs.remove(job_id);
        Ok(())
    }

    async fn post_to_graph(&self, job_id: &JobId, payload: &Payload) -> GraphResult<PostResult> {
        self.check_available()?;
        let mut graph = self
            .graphs
            .get_mut(job_id)
            .ok_or_else(|| GraphError::InvalidGraph(job_id.clone()))?;

        let depth = payload
            .request_nodes
            .iter()
            .filter_map(|n| graph.lookup(n).map(|stored| stored.depth))
            .max()
            .map_or(0, |d| d + 1);

        let before = graph.revision;
        for node in &payload.response_nodes {
            graph.upsert_node(node, depth)?;
        }
        for edge in &payload.response_edges {
            graph.upsert_edge(edge, depth)?;
        }

        Ok(PostResult {
            success: true,
            max_revision_id: graph.revision,
            update_count: graph.revision - before,
        })
    }

    async fn query_patterns(
        &self,
        job_id: &JobId,
        queries: &BTreeMap<AdapterId, String>,
        window: Option<RevisionWindow>,
    ) -> GraphResult<PatternMatches> {
        self.check_available()?;
        let graph = self
            .graphs
            .get(job_id)
            .ok_or_else(|| GraphError::InvalidGraph(job_id.clone()))?;

        let mut matches = PatternMatches::new();
        for pattern in queries.values() {
            if matches.contains_key(pattern) {
                continue;
            }
            let compiled = CompiledQuery::parse(pattern)?;
            let nodes = graph
                .nodes
                .iter()
                .filter(|n| window.map_or(true, |w| w.contains(n.revision)))
                .filter(|n| compiled.matches(&n.data))
                .map(|n| n.data.clone())
                .collect();
            matches.insert(pattern.clone(), nodes);
        }
        Ok(matches)
    }
}
