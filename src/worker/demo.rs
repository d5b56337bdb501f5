//! Built-in demonstration workers
//!
//! `hello` greets every `name` node; `reverse` mirrors every greeting. Seeding
//! a job with a `name` node therefore grows the graph by two levels and then
//! stops, since nothing matches a reversed greeting.

use super::traits::{WorkResult, Worker, WorkerError, WorkerResult};
use crate::message::{node, Edge, NodeData, Payload};
use async_trait::async_trait;
use serde_json::Value;

fn text<'a>(data: &'a NodeData, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

/// Greets each `name` node.
pub struct HelloWorker;

#[async_trait]
impl Worker for HelloWorker {
    fn name(&self) -> &str {
        "hello"
    }

    fn graph_query(&self) -> &str {
        "n(type=name)"
    }

    fn default_depth(&self) -> Option<u32> {
        Some(1)
    }

    async fn process(&self, request: &Payload) -> WorkerResult<WorkResult> {
        let mut result = WorkResult::new();
        for source in &request.request_nodes {
            let name = text(source, "value")
                .ok_or_else(|| WorkerError::InvalidInput("name node without a value".into()))?;
            let greeting = node("greeting", &format!("Hello, {name}!"));
            result = result
                .with_edge(Edge::new(source.clone(), greeting.clone(), "greets"))
                .with_node(greeting);
        }
        Ok(result)
    }
}

/// Reverses each greeting.
pub struct ReverseWorker;

#[async_trait]
impl Worker for ReverseWorker {
    fn name(&self) -> &str {
        "reverse"
    }

    fn graph_query(&self) -> &str {
        "n(type=greeting)"
    }

    fn max_nodes_per_task(&self) -> i64 {
        10
    }

    async fn process(&self, request: &Payload) -> WorkerResult<WorkResult> {
        let mut result = WorkResult::new();
        for source in &request.request_nodes {
            let Some(greeting) = text(source, "value") else {
                continue;
            };
            let reversed = node("reversed", &greeting.chars().rev().collect::<String>());
            result = result
                .with_edge(Edge::new(source.clone(), reversed.clone(), "reverses"))
                .with_node(reversed);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobConfig, JobId, TaskId};

    fn request(nodes: Vec<NodeData>) -> Payload {
        Payload::task_request(JobId::new("j"), TaskId::new(), nodes, JobConfig::new())
    }

    #[tokio::test]
    async fn hello_greets_each_name() {
        let result = HelloWorker
            .process(&request(vec![node("name", "Ada"), node("name", "Alan")]))
            .await
            .unwrap();
        assert_eq!(result.nodes, vec![node("greeting", "Hello, Ada!"), node("greeting", "Hello, Alan!")]);
        assert_eq!(result.edges.len(), 2);
    }

    #[tokio::test]
    async fn hello_rejects_nodes_without_value() {
        let mut bare = NodeData::new();
        bare.insert("type".into(), Value::String("name".into()));
        assert!(matches!(
            HelloWorker.process(&request(vec![bare])).await,
            Err(WorkerError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn reverse_mirrors_greetings() {
        let result = ReverseWorker
            .process(&request(vec![node("greeting", "abc")]))
            .await
            .unwrap();
        assert_eq!(result.nodes, vec![node("reversed", "cba")]);
    }

    #[test]
    fn records_carry_worker_settings() {
        let record = ReverseWorker.record();
        assert_eq!(record.name, "reverse");
        assert_eq!(record.max_nodes_per_task, 10);
        assert_eq!(HelloWorker.record().default_depth, Some(1));
    }
}
