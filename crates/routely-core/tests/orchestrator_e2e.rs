//! End-to-end runs of the orchestrator against an in-memory upstream.

mod common;

use std::fs;

use common::{FakeUpstream, gateway_timeout, rid_for, test_config};
use routely_core::error::TransportError;
use routely_core::orchestrator::{Orchestrator, RunMode, aggregate, clean};
use routely_core::slice_writer::SliceWriter;
use routely_core::state_store::{SqliteStateStore, StateStore, TaskMetadata};
use routely_core::task::TaskStatus;

const TWO_WINDOWS: &[(&str, &str)] = &[("0600", "0659"), ("0700", "0759")];

#[tokio::test(start_paused = true)]
async fn full_run_produces_dataset_and_passes_qa() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), TWO_WINDOWS);
    let store = SqliteStateStore::open(&config.state_path()).unwrap();
    let orch = Orchestrator::new(config, FakeUpstream::new(), store).unwrap();

    let summary = orch.run(RunMode::Fresh).await.unwrap();
    assert!(summary.succeeded(), "{}", summary.render());
    assert_eq!(summary.status_counts[&TaskStatus::Ok], 2);
    // Four services per hour.
    assert_eq!(summary.report.aggregation.records.len(), 8);
    assert_eq!(summary.routes["PAD->BRI"].observations, 8);
    assert!((summary.avg_obs_per_slice - 4.0).abs() < f64::EPSILON);

    let csv = fs::read_to_string(dir.path().join("route_hour_p80_p90_p95.csv")).unwrap();
    assert_eq!(csv.lines().count(), 3);
    assert!(dir.path().join("delays_raw.jsonl").exists());
    assert!(summary.report.report_paths.0.exists());
    assert!(summary.report.report_paths.1.exists());
}

#[tokio::test(start_paused = true)]
async fn resume_does_not_touch_the_network_for_settled_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), TWO_WINDOWS);
    {
        let store = SqliteStateStore::open(&config.state_path()).unwrap();
        let orch = Orchestrator::new(config.clone(), FakeUpstream::new(), store).unwrap();
        orch.run(RunMode::Fresh).await.unwrap();
    }

    let store = SqliteStateStore::open(&config.state_path()).unwrap();
    let orch = Orchestrator::new(config, FakeUpstream::new(), store).unwrap();
    let summary = orch.run(RunMode::Resume).await.unwrap();

    assert_eq!(orch.api().transport().backend().metrics_calls(), 0);
    assert_eq!(orch.api().transport().backend().details_calls(), 0);
    assert_eq!(summary.resumed, 2);
    assert_eq!(summary.attempts, 0);
    // Aggregation still sees the slices written by the first run.
    assert_eq!(summary.report.aggregation.records.len(), 8);
}

#[tokio::test(start_paused = true)]
async fn resume_runs_only_unsettled_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), TWO_WINDOWS);
    let store = SqliteStateStore::open(&config.state_path()).unwrap();
    let tasks = routely_core::planner::plan_config(&config).unwrap();
    store
        .set(&tasks[0], TaskStatus::Ok, &TaskMetadata::default())
        .unwrap();

    let orch = Orchestrator::new(config, FakeUpstream::new(), store).unwrap();
    orch.run(RunMode::Resume).await.unwrap();
    assert_eq!(
        orch.api().transport().backend().metrics_windows(),
        vec![("0700".to_string(), "0759".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn timed_out_hour_is_bisected_into_half_hours() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &[("0600", "0659")]);
    config.bisection_on_timeout = true;
    config.adaptive.window_retries = 1;
    config.adaptive.max_bisect_depth = 1;
    config.adaptive.min_window_minutes = 15;

    let upstream = FakeUpstream::new().fail_metrics(2, gateway_timeout());
    let store = SqliteStateStore::open(&config.state_path()).unwrap();
    let orch = Orchestrator::new(config, upstream, store).unwrap();
    let summary = orch.run(RunMode::Fresh).await.unwrap();

    let store = orch.store();
    assert_eq!(
        store.get("2025-08-27_PAD_BRI_0600_0659").unwrap(),
        Some(TaskStatus::Bisected)
    );
    assert_eq!(
        store.get("2025-08-27_PAD_BRI_0600_0629").unwrap(),
        Some(TaskStatus::Ok)
    );
    assert_eq!(
        store.get("2025-08-27_PAD_BRI_0630_0659").unwrap(),
        Some(TaskStatus::Ok)
    );
    let windows = orch.api().transport().backend().metrics_windows();
    assert_eq!(
        windows,
        vec![
            ("0600".to_string(), "0659".to_string()),
            ("0600".to_string(), "0659".to_string()),
            ("0600".to_string(), "0629".to_string()),
            ("0630".to_string(), "0659".to_string()),
        ]
    );
    assert!(summary.succeeded(), "{}", summary.render());
    assert_eq!(summary.report.aggregation.records.len(), 4);

    let rids: Vec<&str> = summary
        .report
        .aggregation
        .records
        .iter()
        .map(|r| r.rid.as_str())
        .collect();
    assert!(rids.contains(&rid_for("2025-08-27", 6 * 60).as_str()));
}

#[tokio::test(start_paused = true)]
async fn timeout_bisection_stops_at_max_depth() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &[("0600", "0659")]);
    config.bisection_on_timeout = true;
    config.max_retry_passes = 0;
    config.adaptive.max_bisect_depth = 2;
    config.adaptive.min_window_minutes = 15;

    let upstream = FakeUpstream::new().fail_metrics(64, gateway_timeout());
    let store = SqliteStateStore::open(&config.state_path()).unwrap();
    let orch = Orchestrator::new(config, upstream, store).unwrap();
    let summary = orch.run(RunMode::Fresh).await.unwrap();

    let records = orch.store().list().unwrap();
    assert_eq!(records.len(), 7);
    for record in &records {
        assert!(record.task.depth <= 2, "{}", record.task.key());
        assert!(record.task.window.span_minutes() >= 15, "{}", record.task.key());
        let expected = if record.task.depth < 2 {
            TaskStatus::Bisected
        } else {
            TaskStatus::Timeout
        };
        assert_eq!(record.status, expected, "{}", record.task.key());
    }
    assert_eq!(orch.api().transport().backend().metrics_calls(), 7);
    assert_eq!(summary.unresolved.len(), 4);
    assert!(!summary.succeeded());
}

#[tokio::test(start_paused = true)]
async fn bisected_parent_resumes_through_its_children() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &[("0600", "0659")]);
    config.bisection_on_timeout = true;
    config.adaptive.max_bisect_depth = 1;
    let store = SqliteStateStore::open(&config.state_path()).unwrap();
    let tasks = routely_core::planner::plan_config(&config).unwrap();
    let (first, second) = tasks[0].bisect().unwrap();
    store
        .set(&tasks[0], TaskStatus::Bisected, &TaskMetadata::default())
        .unwrap();
    store
        .set(&first, TaskStatus::Ok, &TaskMetadata::default())
        .unwrap();
    store.ensure_pending(&second).unwrap();

    let orch = Orchestrator::new(config, FakeUpstream::new(), store).unwrap();
    orch.run(RunMode::Resume).await.unwrap();
    assert_eq!(
        orch.api().transport().backend().metrics_windows(),
        vec![("0630".to_string(), "0659".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn retry_passes_recover_transient_failures() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), TWO_WINDOWS);
    let bad_request = TransportError::Status {
        endpoint: "serviceMetrics".to_string(),
        status: 400,
        body: "bad request".to_string(),
    };
    let upstream = FakeUpstream::new().fail_metrics(3, bad_request);
    let store = SqliteStateStore::open(&config.state_path()).unwrap();
    let orch = Orchestrator::new(config, upstream, store).unwrap();

    let summary = orch.run(RunMode::Fresh).await.unwrap();
    // Pass 0: both fail. Pass 1: first fails again, second succeeds.
    // Pass 2: first succeeds.
    assert_eq!(summary.attempts, 5);
    assert_eq!(summary.errors.other, 3);
    assert!(summary.unresolved.is_empty());
    assert_eq!(summary.status_counts[&TaskStatus::Ok], 2);
    assert!(summary.succeeded());
}

#[tokio::test(start_paused = true)]
async fn clean_then_resume_retries_only_failures() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), TWO_WINDOWS);
    config.fail_fast = true;
    let bad_request = TransportError::Status {
        endpoint: "serviceMetrics".to_string(),
        status: 400,
        body: "bad request".to_string(),
    };
    {
        let upstream = FakeUpstream::new().fail_metrics(1, bad_request);
        let store = SqliteStateStore::open(&config.state_path()).unwrap();
        let orch = Orchestrator::new(config.clone(), upstream, store).unwrap();
        let summary = orch.run(RunMode::Fresh).await.unwrap();
        assert_eq!(summary.unresolved.len(), 1);
        assert!(!summary.succeeded());
    }

    let store = SqliteStateStore::open(&config.state_path()).unwrap();
    let report = clean(&store, &SliceWriter::from_config(&config), false).unwrap();
    assert_eq!(report.tasks_removed, 1);

    let orch = Orchestrator::new(config, FakeUpstream::new(), store).unwrap();
    let summary = orch.run(RunMode::Resume).await.unwrap();
    assert_eq!(summary.attempts, 1);
    assert_eq!(
        orch.api().transport().backend().metrics_windows(),
        vec![("0600".to_string(), "0659".to_string())]
    );
    assert!(summary.succeeded());
}

#[tokio::test(start_paused = true)]
async fn aggregate_only_rebuilds_outputs_from_slices() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), TWO_WINDOWS);
    let store = SqliteStateStore::open(&config.state_path()).unwrap();
    let orch = Orchestrator::new(config.clone(), FakeUpstream::new(), store).unwrap();
    orch.run(RunMode::Fresh).await.unwrap();

    let csv_path = config.percentiles_path();
    let before = fs::read_to_string(&csv_path).unwrap();
    fs::remove_file(&csv_path).unwrap();
    fs::remove_file(config.dataset_path()).unwrap();

    let report = aggregate(&config).unwrap();
    assert_eq!(fs::read_to_string(&csv_path).unwrap(), before);
    assert_eq!(report.aggregation.records.len(), 8);
    assert!(report.qa.verdict.passed());
}
