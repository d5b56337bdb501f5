//! End-to-end job scenarios driven through the command and engine queues

mod common;

use chrono::Utc;
use common::{seed_of, FlakyWorker, FloodWorker, Harness, PatternWorker};
use ripple::message::{node, Command, CommandKind, Payload, RESPONSE_PRIORITY};
use ripple::transport::publish_json;
use ripple::worker::demo::{HelloWorker, ReverseWorker};
use ripple::{
    GraphService, GraphStoreMode, HistoryKind, Job, JobConfig, JobStatus, JobStore, Settings,
    TaskStatus, Transport, Worker,
};
use std::sync::Arc;

fn lookup() -> Arc<dyn Worker> {
    Arc::new(PatternWorker::new("lookup", "n(type=domain)", "ip"))
}

#[tokio::test]
async fn job_whose_pattern_never_matches_finishes_without_tasks() {
    let h = Harness::with_workers(
        Settings::default(),
        vec![Arc::new(PatternWorker::new("lookup", "n(type=never)", "x"))],
    )
    .await;
    let id = h
        .submit(&["lookup"], seed_of(vec![node("domain", "example.com")], JobConfig::new().with_depth(0)))
        .await;
    h.settle().await;

    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Finished);
    assert!(job.tasks.is_empty());
    assert!(job.start_time.is_some());
    assert!(job.history.iter().any(|e| e.kind == HistoryKind::Cycle));
}

#[tokio::test]
async fn demo_workers_cascade_then_finish() {
    let h = Harness::with_workers(
        Settings::default(),
        vec![Arc::new(HelloWorker), Arc::new(ReverseWorker)],
    )
    .await;
    let id = h
        .submit(&["hello", "reverse"], seed_of(vec![node("name", "Ada")], JobConfig::new()))
        .await;
    h.settle().await;

    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.tasks.len(), 2);
    assert!(job.tasks.values().all(|t| t.status == TaskStatus::Complete));

    let names: Vec<&str> = job.tasks.values().map(|t| t.adapter_name.as_str()).collect();
    assert!(names.contains(&"hello") && names.contains(&"reverse"));
    let reverse = job.tasks.values().find(|t| t.adapter_name == "reverse").unwrap();
    assert!(reverse.parent_id.is_some());

    let values: Vec<String> = h
        .graph
        .nodes(&id)
        .iter()
        .filter_map(|n| n.get("value").and_then(|v| v.as_str()).map(str::to_string))
        .collect();
    assert!(values.contains(&"!adA ,olleH".to_string()));
}

#[tokio::test]
async fn graph_over_the_size_limit_is_stopped_once() {
    let settings = Settings {
        max_graph_size: 50_000,
        ..Settings::default()
    };
    let h = Harness::with_workers(
        settings,
        vec![Arc::new(FloodWorker::new("n(type=item)", "item", 10_001))],
    )
    .await;
    let id = h
        .submit(&["flood"], seed_of(vec![node("item", "origin")], JobConfig::new()))
        .await;
    h.settle().await;

    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Stopped);
    assert!(job.graph_activity > 50_000);
    assert_eq!(job.errors.len(), 1);
    assert!(job.errors[0].message.contains("exceeds the limit"));
    let tasks_at_stop = job.tasks.len();

    // late responses for the stopped job change nothing
    let task_id = *job.tasks.keys().next().unwrap();
    let request = Payload::task_request(id.clone(), task_id, vec![node("item", "origin")], JobConfig::new());
    for _ in 0..3 {
        let late = request.respond(vec![node("item", "late")], Vec::new());
        publish_json(h.transport.as_ref(), "ripple.engine", RESPONSE_PRIORITY, &late)
            .await
            .unwrap();
    }
    h.settle().await;

    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Stopped);
    assert_eq!(job.tasks.len(), tasks_at_stop);
    assert_eq!(job.errors.len(), 1);
}

#[tokio::test]
async fn second_reset_without_overwrite_is_rejected() {
    let h = Harness::with_workers(
        Settings::default(),
        vec![Arc::new(PatternWorker::new("lookup", "n(type=never)", "x"))],
    )
    .await;
    let id = h
        .submit(&["lookup"], seed_of(vec![node("domain", "a.com")], JobConfig::new()))
        .await;
    h.settle().await;
    assert_eq!(h.status(&id), JobStatus::Finished);

    let submitter = h.coordinator.submitter();
    submitter.send_reset(&id, "first", false).await.unwrap();
    h.settle().await;
    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Reset);
    assert_eq!(job.reason, "first");
    assert!(!h.graph.has_graph(&id));

    submitter.send_reset(&id, "second", false).await.unwrap();
    h.settle().await;
    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Reset);
    assert_eq!(job.reason, "first");

    submitter.send_reset(&id, "third", true).await.unwrap();
    h.settle().await;
    assert_eq!(h.job(&id).reason, "third");
}

#[tokio::test]
async fn reset_of_a_processing_job_is_rejected() {
    let h = Harness::new(Settings::default()).await;
    let id = h.graph.create_graph(&JobConfig::new()).await.unwrap();
    let mut job = Job::new(id.clone(), ["lookup"], JobConfig::new());
    job.status = JobStatus::Processing;
    h.store.save_job(&job).unwrap();

    let reset = Command::new(CommandKind::Reset, id.clone()).with_reason("now", false);
    assert!(h.coordinator.commands().handle(reset).await.is_err());
    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.reason, "");
    assert!(h.graph.has_graph(&id));
}

#[tokio::test]
async fn new_job_without_adapters_lands_in_error() {
    let h = Harness::new(Settings::default()).await;
    let id = h.submit(&[], seed_of(vec![node("domain", "a.com")], JobConfig::new())).await;
    h.settle().await;

    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(h.graph.node_count(&id), 0);
    assert_eq!(job.errors.len(), 1);
    assert!(job.history.iter().any(|e| e.message.contains("no approved adapters")));
}

#[tokio::test]
async fn duplicate_new_command_is_ignored() {
    let h = Harness::with_workers(
        Settings::default(),
        vec![Arc::new(PatternWorker::new("lookup", "n(type=never)", "x"))],
    )
    .await;
    let id = h
        .submit(&["lookup"], seed_of(vec![node("domain", "a.com")], JobConfig::new()))
        .await;
    h.settle().await;
    let history = h.job(&id).history.len();

    let again = Command::new(CommandKind::New, id.clone()).with_adapters(["other"]);
    h.coordinator.commands().handle(again).await.unwrap();
    h.settle().await;

    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.history.len(), history);
    assert!(!job.approved_adapters.contains("other"));
}

#[tokio::test]
async fn add_merges_adapters_and_restarts_the_job() {
    let mut h = Harness::with_workers(
        Settings::default(),
        vec![Arc::new(PatternWorker::new("lookup", "n(type=never)", "x"))],
    )
    .await;
    h.add_worker(Arc::new(PatternWorker::new("resolver", "n(type=domain)", "ip")))
        .await;
    let id = h
        .submit(&["lookup"], seed_of(vec![node("domain", "a.com")], JobConfig::new()))
        .await;
    h.settle().await;
    assert!(h.job(&id).tasks.is_empty());

    h.coordinator
        .submitter()
        .send_add(&id, ["Resolver"], seed_of(vec![node("domain", "b.com")], JobConfig::new()))
        .await
        .unwrap();
    h.settle().await;

    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Finished);
    assert!(job.approved_adapters.contains("lookup"));
    assert!(job.approved_adapters.contains("resolver"));
    assert_eq!(job.tasks.len(), 1);
    assert_eq!(job.tasks.values().next().unwrap().node_count, 1);
}

#[tokio::test]
async fn failed_task_finishes_with_errors_and_can_be_retried() {
    let flaky = Arc::new(FlakyWorker::new(true));
    let h = Harness::with_workers(Settings::default(), vec![flaky.clone()]).await;
    let id = h
        .submit(&["flaky"], seed_of(vec![node("host", "db1")], JobConfig::new()))
        .await;
    h.settle().await;

    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::FinishedWithErrors);
    let failed = job.tasks.values().find(|t| t.status == TaskStatus::Failed).unwrap().id;
    assert_eq!(job.errors.len(), 1);
    assert!(job.errors[0].message.contains("upstream lookup timed out"));
    assert!(job.history.iter().any(|e| e.kind == HistoryKind::TaskFailed));

    flaky.set_failing(false);
    h.coordinator.submitter().send_retry(&id, Vec::new()).await.unwrap();
    h.settle().await;

    let job = h.job(&id);
    assert_eq!(job.tasks[&failed].status, TaskStatus::Replayed);
    assert!(job.errors.is_empty());
    let replay = job
        .tasks
        .values()
        .find(|t| t.id != failed && t.adapter_name == "flaky")
        .unwrap();
    assert_eq!(replay.status, TaskStatus::Complete);
    assert_eq!(replay.current_graph_revision, job.tasks[&failed].current_graph_revision);
    // the failure stays in the job's history
    assert_eq!(job.status, JobStatus::FinishedWithErrors);
}

#[tokio::test]
async fn execute_on_nodes_runs_one_time_adapters_over_given_ids() {
    let mut h = Harness::with_workers(
        Settings::default(),
        vec![Arc::new(PatternWorker::new("lookup", "n(type=never)", "x"))],
    )
    .await;
    h.add_worker(Arc::new(PatternWorker::new("tagger", "n()", "tag")))
        .await;
    let id = h
        .submit(
            &["lookup"],
            seed_of(vec![node("domain", "a.com"), node("domain", "b.com")], JobConfig::new()),
        )
        .await;
    h.settle().await;
    assert_eq!(h.status(&id), JobStatus::Finished);

    h.coordinator
        .submitter()
        .send_execute_on_nodes(&id, vec![2], ["tagger"])
        .await
        .unwrap();
    h.settle().await;

    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Finished);
    assert!(!job.approved_adapters.contains("tagger"));
    let task = job.tasks.values().find(|t| t.adapter_name == "tagger").unwrap();
    assert_eq!(task.node_count, 1);
    assert!(h
        .graph
        .nodes(&id)
        .iter()
        .any(|n| n.get("value").and_then(|v| v.as_str()) == Some("b.com>tagger")));
}

#[tokio::test]
async fn stop_halts_a_running_job() {
    let h = Harness::with_workers(
        Settings::default(),
        vec![Arc::new(PatternWorker::new("grow", "n(type=item)", "item"))],
    )
    .await;
    let id = h
        .submit(&["grow"], seed_of(vec![node("item", "x")], JobConfig::new()))
        .await;
    for _ in 0..4 {
        h.step().await;
    }
    h.coordinator.submitter().send_stop(&id).await.unwrap();
    h.settle().await;

    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Stopped);
    assert!(job.active_task_count() <= 1);
    assert!(job.history.iter().any(|e| e.message == "STOP"));
}

#[tokio::test]
async fn new_command_waits_out_a_transport_outage() {
    let h = Harness::with_workers(Settings::default(), vec![lookup()]).await;
    let id = h
        .submit(&["lookup"], seed_of(vec![node("domain", "a.com")], JobConfig::new()))
        .await;

    h.transport.set_offline(true);
    assert_eq!(h.pump_commands().await, 1);
    assert_eq!(h.status(&id), JobStatus::New);
    assert_eq!(h.transport.depth("ripple.commands").await.unwrap(), 1);
    assert!(!h.job(&id).history.iter().any(|e| e.message.starts_with("NEW:")));

    h.transport.set_offline(false);
    h.settle().await;
    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.history.iter().filter(|e| e.message.starts_with("NEW:")).count(), 1);
    assert_eq!(job.history.iter().filter(|e| e.kind == HistoryKind::Created).count(), 1);
    assert_eq!(job.tasks.len(), 1);
}

#[tokio::test]
async fn seed_cycle_redelivered_after_a_publish_outage_still_dispatches() {
    let h = Harness::with_workers(Settings::default(), vec![lookup()]).await;
    let id = h
        .submit(&["lookup"], seed_of(vec![node("domain", "a.com")], JobConfig::new()))
        .await;
    assert_eq!(h.pump_commands().await, 1);

    h.transport.set_offline(true);
    assert_eq!(h.pump_engine().await, 1);
    assert_eq!(h.status(&id), JobStatus::Processing);
    assert_eq!(h.transport.depth("ripple.engine").await.unwrap(), 1);
    let job = h.job(&id);
    assert!(job.tasks.values().all(|t| t.status == TaskStatus::Dropped));
    assert!(job.errors.is_empty());

    h.transport.set_offline(false);
    h.settle().await;
    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Finished);
    let done = job
        .tasks
        .values()
        .filter(|t| t.adapter_name == "lookup" && t.status == TaskStatus::Complete)
        .count();
    assert_eq!(done, 1);
    assert!(h
        .graph
        .nodes(&id)
        .iter()
        .any(|n| n.get("value").and_then(|v| v.as_str()) == Some("a.com>lookup")));
}

#[tokio::test]
async fn worker_response_redelivered_after_a_publish_outage_still_dispatches() {
    let h = Harness::with_workers(
        Settings::default(),
        vec![lookup(), Arc::new(PatternWorker::new("geo", "n(type=ip)", "country"))],
    )
    .await;
    let id = h
        .submit(&["lookup", "geo"], seed_of(vec![node("domain", "a.com")], JobConfig::new()))
        .await;
    h.pump_commands().await;
    h.pump_engine().await;
    assert_eq!(h.hosts[0].pump().await.unwrap(), 1);

    h.transport.set_offline(true);
    assert_eq!(h.pump_engine().await, 1);
    let job = h.job(&id);
    let origin = job.tasks.values().find(|t| t.adapter_name == "lookup").unwrap().id;
    assert_eq!(job.tasks[&origin].status, TaskStatus::Processing);
    assert_eq!(h.transport.depth("ripple.engine").await.unwrap(), 1);

    h.transport.set_offline(false);
    h.settle().await;
    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.tasks[&origin].status, TaskStatus::Complete);
    let geo: Vec<_> = job
        .tasks
        .values()
        .filter(|t| t.adapter_name == "geo" && t.status == TaskStatus::Complete)
        .collect();
    assert_eq!(geo.len(), 1);
    assert_eq!(geo[0].parent_id, Some(origin));
}

#[tokio::test]
async fn graph_outage_requeues_the_cycle_until_the_store_returns() {
    let h = Harness::with_workers(Settings::default(), vec![lookup()]).await;
    let id = h
        .submit(&["lookup"], seed_of(vec![node("domain", "a.com")], JobConfig::new()))
        .await;
    h.pump_commands().await;

    h.graph.set_available(false);
    for _ in 0..3 {
        assert_eq!(h.pump_engine().await, 1);
    }
    assert_eq!(h.status(&id), JobStatus::Processing);
    assert!(h.job(&id).tasks.is_empty());

    h.graph.set_available(true);
    h.settle().await;
    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.tasks.len(), 1);
    assert!(job.tasks.values().all(|t| t.status == TaskStatus::Complete));
}

#[tokio::test]
async fn retry_redelivered_after_a_publish_outage_replays_once() {
    let flaky = Arc::new(FlakyWorker::new(true));
    let h = Harness::with_workers(Settings::default(), vec![flaky.clone()]).await;
    let id = h
        .submit(&["flaky"], seed_of(vec![node("host", "db1")], JobConfig::new()))
        .await;
    h.settle().await;
    let failed = h
        .job(&id)
        .tasks
        .values()
        .find(|t| t.status == TaskStatus::Failed)
        .unwrap()
        .id;

    flaky.set_failing(false);
    h.coordinator.submitter().send_retry(&id, Vec::new()).await.unwrap();
    assert_eq!(h.pump_commands().await, 1);
    h.transport.set_offline(true);
    assert_eq!(h.pump_engine().await, 1);
    let job = h.job(&id);
    assert_eq!(job.tasks[&failed].status, TaskStatus::Failed);
    assert_eq!(job.errors.len(), 1);

    h.transport.set_offline(false);
    h.settle().await;
    let job = h.job(&id);
    assert_eq!(job.tasks[&failed].status, TaskStatus::Replayed);
    assert!(job.errors.is_empty());
    let replays = job
        .tasks
        .values()
        .filter(|t| t.id != failed && t.status == TaskStatus::Complete)
        .count();
    assert_eq!(replays, 1);
    assert_eq!(job.status, JobStatus::FinishedWithErrors);
}

#[tokio::test]
async fn dead_lettered_request_fails_its_task() {
    let h = Harness::with_workers(Settings::default(), vec![lookup()]).await;
    let id = h
        .submit(&["lookup"], seed_of(vec![node("domain", "a.com")], JobConfig::new()))
        .await;
    h.pump_commands().await;
    h.pump_engine().await;

    // the worker answers but cannot publish, until its queue gives up
    h.transport.set_offline(true);
    for _ in 0..3 {
        assert_eq!(h.hosts[0].pump().await.unwrap(), 1);
    }
    let dead = format!("{}.dead-letter", h.hosts[0].queue());
    assert_eq!(h.transport.depth(&dead).await.unwrap(), 1);

    h.transport.set_offline(false);
    h.settle().await;
    assert_eq!(h.status(&id), JobStatus::Processing);

    let report = h.coordinator.maintenance().tick(Utc::now()).await.unwrap();
    assert_eq!(report.abandoned.len(), 1);
    h.settle().await;

    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::FinishedWithErrors);
    assert!(job.tasks.values().all(|t| t.status == TaskStatus::Failed));
    assert_eq!(job.errors.len(), 1);
    assert!(job.errors[0].message.contains("failed to receive a response"));
}

#[tokio::test]
async fn internal_mode_routes_changed_nodes_by_required_keys() {
    let settings = Settings {
        graph_store_mode: GraphStoreMode::Internal,
        ..Settings::default()
    };
    let h = Harness::with_workers(
        settings,
        vec![
            Arc::new(PatternWorker::new("whois", "n()", "ip").with_required_key("type", "domain")),
            Arc::new(PatternWorker::new("geo", "n()", "country").with_required_key("type", "ip")),
            Arc::new(PatternWorker::new("spy", "n()", "secret").with_required_key("type", "domain")),
        ],
    )
    .await;
    let id = h
        .submit(&["whois", "geo"], seed_of(vec![node("domain", "a.com")], JobConfig::new()))
        .await;
    h.settle().await;

    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Finished);
    let mut names: Vec<&str> = job.tasks.values().map(|t| t.adapter_name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["geo", "whois"]);
    assert!(job
        .tasks
        .values()
        .all(|t| t.status == TaskStatus::Complete && t.node_count == 1));
    let whois = job.tasks.values().find(|t| t.adapter_name == "whois").unwrap();
    let geo = job.tasks.values().find(|t| t.adapter_name == "geo").unwrap();
    assert_eq!(geo.parent_id, Some(whois.id));

    // nothing about the node changed, so nobody sees it again
    h.coordinator
        .submitter()
        .send_add(&id, ["whois"], seed_of(vec![node("domain", "a.com")], JobConfig::new()))
        .await
        .unwrap();
    h.settle().await;
    let job = h.job(&id);
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.tasks.len(), 2);
}
