//! Task state machine driving one ingestion run.
//!
//! Tasks run one at a time in planning order. Each task resolves service
//! identifiers through the adaptive fetcher, narrows them with deterministic
//! sampling, fetches details through the worker pool and persists its slice.
//! The outcome is written to the [`StateStore`] before the next task starts:
//!
//! ```text
//! pending -> ok | skipped | failed | timeout | circuit_breaker | bisected
//! ```
//!
//! A `bisected` parent is replaced by two pending children queued right
//! after it. Failed tasks get up to `max_retry_passes` further passes unless
//! `fail_fast` is set. Per-task errors never abort the run; only state store
//! failures do.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{Instrument, error, info, warn};

use crate::aggregate::{Aggregation, Aggregator};
use crate::api::ServicePerformanceApi;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitRegistry, window_key};
use crate::config::Config;
use crate::detail_collector::DetailCollector;
use crate::error::{Error, Result};
use crate::planner::plan_config;
use crate::pool::{PeriodicPause, WorkerPool};
use crate::qa::{CoverageGrid, QaReport, validate};
use crate::sampling::select_rids;
use crate::slice_writer::{SliceLog, SliceWriter};
use crate::state_store::{StateStore, TaskMetadata};
use crate::task::{Task, TaskStatus};
use crate::transport::{Backend, RateLimitedTransport};
use crate::window_fetch::{AdaptiveWindowFetcher, WindowFetchConfig};

/// How a run treats existing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Skip tasks already settled in the state store.
    Resume,
    /// Wipe the state store first.
    Fresh,
}

/// Result of one task attempt.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub metadata: TaskMetadata,
    /// Present when the task was replaced by two narrower tasks.
    pub children: Option<(Task, Task)>,
}

enum Collected {
    Written,
    NoServices,
    DetailsFailed { hostile: bool },
}

/// Failed attempts by cause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorBreakdown {
    pub hostile: usize,
    pub timeouts: usize,
    pub other: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteSummary {
    pub observations: usize,
    pub errors: usize,
}

/// Merged outputs and QA verdict.
#[derive(Debug, Clone)]
pub struct AggregateReport {
    pub aggregation: Aggregation,
    pub qa: QaReport,
    pub report_paths: (PathBuf, PathBuf),
}

/// End-of-run summary.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub planned: usize,
    /// Task attempts executed by this run.
    pub attempts: usize,
    /// Tasks skipped because they were already settled.
    pub resumed: usize,
    pub status_counts: BTreeMap<TaskStatus, usize>,
    pub errors: ErrorBreakdown,
    pub routes: BTreeMap<String, RouteSummary>,
    /// Keys still failed after every retry pass.
    pub unresolved: Vec<String>,
    pub avg_obs_per_slice: f64,
    pub report: AggregateReport,
    pub elapsed_secs: f64,
}

impl RunSummary {
    /// QA passed and no task remains failed.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.report.qa.verdict.passed() && self.unresolved.is_empty()
    }

    #[must_use]
    pub fn render(&self) -> String {
        let count = |s: TaskStatus| self.status_counts.get(&s).copied().unwrap_or(0);
        let mut out = String::new();
        let _ = writeln!(out, "Run summary ({:.1}s)", self.elapsed_secs);
        let _ = writeln!(
            out,
            "  tasks: {} planned, {} attempts, {} already settled",
            self.planned, self.attempts, self.resumed
        );
        let _ = writeln!(
            out,
            "  ok {} | skipped {} | bisected {} | failed {} | timeout {} | circuit_breaker {} | pending {}",
            count(TaskStatus::Ok),
            count(TaskStatus::Skipped),
            count(TaskStatus::Bisected),
            count(TaskStatus::Failed),
            count(TaskStatus::Timeout),
            count(TaskStatus::CircuitBreaker),
            count(TaskStatus::Pending),
        );
        let _ = writeln!(
            out,
            "  errors: {} hostile (403/429), {} timeouts, {} other",
            self.errors.hostile, self.errors.timeouts, self.errors.other
        );
        for (route, summary) in &self.routes {
            let _ = writeln!(
                out,
                "  {route}: {} observations, {} errors",
                summary.observations, summary.errors
            );
        }
        let _ = writeln!(
            out,
            "  records: {} ({} duplicates removed), {} buckets, {:.1} observations per ok slice",
            self.report.aggregation.records.len(),
            self.report.aggregation.duplicates_removed,
            self.report.aggregation.buckets.len(),
            self.avg_obs_per_slice
        );
        let _ = writeln!(out, "  QA: {}", self.report.qa.verdict);
        for reason in &self.report.qa.reasons {
            let _ = writeln!(out, "    - {reason}");
        }
        if !self.unresolved.is_empty() {
            let _ = writeln!(out, "  unresolved tasks: {}", self.unresolved.len());
            for key in &self.unresolved {
                let _ = writeln!(out, "    - {key}");
            }
        }
        out
    }
}

/// Plan-only result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanReport {
    pub planned: usize,
    /// Tasks that had no state entry before.
    pub added: usize,
}

/// What a clean removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanReport {
    pub tasks_removed: usize,
    pub logs_removed: usize,
}

/// Persist every planned task as pending, plus plan metadata.
pub fn plan_only(config: &Config, store: &impl StateStore) -> Result<PlanReport> {
    let tasks = plan_config(config)?;
    let mut added = 0;
    for task in &tasks {
        if store.ensure_pending(task)? {
            added += 1;
        }
    }
    store.set_run_metadata("planned_tasks", &serde_json::json!(tasks.len()))?;
    store.set_run_metadata(
        "planned_at",
        &serde_json::json!(chrono::Utc::now().to_rfc3339()),
    )?;
    info!(planned = tasks.len(), added, "plan saved");
    Ok(PlanReport {
        planned: tasks.len(),
        added,
    })
}

/// Remove failure entries, or with `hard` wipe the store and slice logs.
pub fn clean(store: &impl StateStore, slices: &SliceWriter, hard: bool) -> Result<CleanReport> {
    if hard {
        let tasks_removed = store.list()?.len();
        store.clear()?;
        let logs_removed = slices.remove_logs()?;
        Ok(CleanReport {
            tasks_removed,
            logs_removed,
        })
    } else {
        Ok(CleanReport {
            tasks_removed: store.clear_failures()?,
            logs_removed: 0,
        })
    }
}

/// Rebuild the dataset and percentile table from slices, then run QA.
pub fn aggregate(config: &Config) -> Result<AggregateReport> {
    let slices = SliceWriter::from_config(config);
    let aggregator = Aggregator::new(
        slices.clone(),
        config.dataset_path(),
        config.percentiles_path(),
    );
    let aggregation = aggregator.run()?;
    let logs = slices.read_logs()?;
    let qa = validate(
        &aggregation.buckets,
        &CoverageGrid::from_config(config),
        config.qa_min_obs_per_cell,
        &logs,
    );
    let report_paths = qa.write(&config.reports_dir())?;
    Ok(AggregateReport {
        aggregation,
        qa,
        report_paths,
    })
}

fn classify(err: &Error) -> TaskStatus {
    if err.is_hostile() {
        TaskStatus::CircuitBreaker
    } else if err.is_timeout() {
        TaskStatus::Timeout
    } else {
        TaskStatus::Failed
    }
}

fn secs_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}

/// Drives planned tasks through the state machine.
#[derive(Debug)]
pub struct Orchestrator<B, S> {
    config: Config,
    api: Arc<ServicePerformanceApi<B>>,
    store: S,
    circuits: Arc<CircuitRegistry>,
    details: DetailCollector<B>,
    slices: SliceWriter,
}

impl<B: Backend + 'static, S: StateStore> Orchestrator<B, S> {
    /// Build an orchestrator. The configuration is validated here.
    pub fn new(config: Config, backend: B, store: S) -> Result<Self> {
        config.validate()?;
        let transport = RateLimitedTransport::from_config(backend, &config.transport);
        let api = Arc::new(ServicePerformanceApi::new(
            transport,
            config.metrics_timeout(),
            config.details_timeout(),
        ));
        let circuits = Arc::new(CircuitRegistry::new(CircuitBreakerConfig::from(
            &config.circuit,
        )));
        let details = DetailCollector::new(
            Arc::clone(&api),
            WorkerPool::new(config.workers),
            Arc::new(PeriodicPause::from_secs_f64(
                config.sleep_every,
                config.sleep_secs,
            )),
            Arc::clone(&circuits),
        );
        let slices = SliceWriter::from_config(&config);
        Ok(Self {
            config,
            api,
            store,
            circuits,
            details,
            slices,
        })
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn api(&self) -> &ServicePerformanceApi<B> {
        &self.api
    }

    #[must_use]
    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    /// Execute the plan, retry failures, aggregate and run QA.
    pub async fn run(&self, mode: RunMode) -> Result<RunSummary> {
        let started = Instant::now();
        let tasks = plan_config(&self.config)?;
        if mode == RunMode::Fresh {
            self.store.clear()?;
        }
        for task in &tasks {
            self.store.ensure_pending(task)?;
        }
        self.store
            .set_run_metadata("planned_tasks", &serde_json::json!(tasks.len()))?;
        info!(
            planned = tasks.len(),
            mode = ?mode,
            workers = self.config.workers,
            "run starting"
        );

        let mut tally = Tally::default();
        let mut failed = self.run_pass(tasks.iter().cloned().collect(), &mut tally).await?;

        let passes = if self.config.fail_fast {
            0
        } else {
            self.config.max_retry_passes
        };
        for pass in 1..=passes {
            if failed.is_empty() {
                break;
            }
            info!(pass, max_passes = passes, tasks = failed.len(), "retry pass");
            failed = self.run_pass(failed.into(), &mut tally).await?;
        }

        let unresolved: Vec<String> = failed.iter().map(Task::key).collect();
        if !unresolved.is_empty() {
            warn!(count = unresolved.len(), "tasks remain failed after retries");
        }

        let report = aggregate(&self.config)?;
        let mut routes = tally.routes;
        for record in &report.aggregation.records {
            routes
                .entry(format!("{}->{}", record.origin, record.dest))
                .or_default()
                .observations += 1;
        }

        let records = self.store.list()?;
        let ok: Vec<usize> = records
            .iter()
            .filter(|r| r.status == TaskStatus::Ok)
            .map(|r| r.metadata.rows_written)
            .collect();
        let avg_obs_per_slice = if ok.is_empty() {
            0.0
        } else {
            ok.iter().sum::<usize>() as f64 / ok.len() as f64
        };

        let summary = RunSummary {
            planned: tasks.len(),
            attempts: tally.attempts,
            resumed: tally.resumed,
            status_counts: self.store.counts()?,
            errors: tally.errors,
            routes,
            unresolved,
            avg_obs_per_slice,
            report,
            elapsed_secs: secs_since(started),
        };
        info!(
            attempts = summary.attempts,
            resumed = summary.resumed,
            unresolved = summary.unresolved.len(),
            qa = %summary.report.qa.verdict,
            circuit_trips = self.circuits.total_trips(),
            "run finished"
        );
        Ok(summary)
    }

    /// Process `queue` in order. Returns the tasks that ended in a failure
    /// status.
    async fn run_pass(&self, mut queue: VecDeque<Task>, tally: &mut Tally) -> Result<Vec<Task>> {
        let mut failed = Vec::new();
        while let Some(task) = queue.pop_front() {
            match self.store.get(&task.key())? {
                Some(TaskStatus::Bisected) => {
                    if let Some((first, second)) = task.bisect() {
                        queue.push_front(second);
                        queue.push_front(first);
                    }
                    continue;
                }
                Some(status) if status.is_settled() => {
                    tally.resumed += 1;
                    continue;
                }
                _ => {}
            }

            let outcome = self.execute(&task).await?;
            tally.record(&task, &outcome);
            if let Some((first, second)) = outcome.children {
                queue.push_front(second);
                queue.push_front(first);
            } else if outcome.status.is_failure() {
                failed.push(task);
            }
        }
        Ok(failed)
    }

    /// Run one attempt of `task` and persist its outcome.
    ///
    /// Only state store errors are returned; every other failure becomes a
    /// task status.
    pub async fn execute(&self, task: &Task) -> Result<TaskOutcome> {
        let key = task.key();
        let attempt = self.slices.next_attempt(&key);
        let span = crate::task_span!(
            "task",
            task_key = %key,
            route = %task.route,
            window = %task.window,
            attempt
        );
        self.execute_attempt(task, attempt).instrument(span).await
    }

    async fn execute_attempt(&self, task: &Task, attempt: u32) -> Result<TaskOutcome> {
        let hostile_before = self.api.transport().stats().hostile_responses();
        let mut metadata = TaskMetadata {
            attempt,
            ..TaskMetadata::default()
        };

        let mut status = match self.collect(task, &mut metadata).await {
            Ok(Collected::Written) => TaskStatus::Ok,
            Ok(Collected::NoServices) => TaskStatus::Skipped,
            Ok(Collected::DetailsFailed { hostile }) => {
                metadata.error = Some(format!(
                    "all {} detail lookups failed",
                    metadata.details_failed
                ));
                if hostile {
                    TaskStatus::CircuitBreaker
                } else {
                    TaskStatus::Failed
                }
            }
            Err(err) => {
                metadata.error = Some(err.to_string());
                classify(&err)
            }
        };
        metadata.hostile_responses =
            self.api.transport().stats().hostile_responses() - hostile_before;

        let mut children = None;
        if status == TaskStatus::Timeout {
            children = self.bisect_on_timeout(task)?;
            if let Some((first, second)) = &children {
                metadata.children = vec![first.key(), second.key()];
                status = TaskStatus::Bisected;
            }
        }

        if let Err(err) = self.slices.write_log(&SliceLog::new(task, status, &metadata)) {
            warn!(error = %err, "could not write slice log");
        }
        self.store.set(task, status, &metadata)?;

        match status {
            TaskStatus::Ok => info!(
                status = %status,
                rows = metadata.rows_written,
                services = metadata.services,
                "task complete"
            ),
            TaskStatus::Skipped | TaskStatus::Bisected => {
                info!(status = %status, children = ?metadata.children, "task settled");
            }
            _ => error!(
                status = %status,
                error = metadata.error.as_deref().unwrap_or_default(),
                "task failed"
            ),
        }
        Ok(TaskOutcome {
            status,
            metadata,
            children,
        })
    }

    fn bisect_on_timeout(&self, task: &Task) -> Result<Option<(Task, Task)>> {
        let adaptive = &self.config.adaptive;
        if !self.config.bisection_on_timeout
            || task.depth >= adaptive.max_bisect_depth
            || !task.window.can_bisect(adaptive.min_window_minutes)
        {
            return Ok(None);
        }
        let Some((first, second)) = task.bisect() else {
            return Ok(None);
        };
        self.store.ensure_pending(&first)?;
        self.store.ensure_pending(&second)?;
        info!(
            first = %first.window,
            second = %second.window,
            depth = first.depth,
            "bisecting timed-out task"
        );
        Ok(Some((first, second)))
    }

    async fn collect(&self, task: &Task, metadata: &mut TaskMetadata) -> Result<Collected> {
        let key = task.key();
        let metrics_start = Instant::now();
        let fetcher =
            AdaptiveWindowFetcher::new(&self.api, WindowFetchConfig::from(&self.config.adaptive));

        let filters: Vec<Option<&str>> = if self.config.toc_filters.is_empty() {
            vec![None]
        } else {
            self.config.toc_filters.iter().map(|t| Some(t.as_str())).collect()
        };

        let mut refs = Vec::new();
        for toc in filters {
            let circuit = window_key(&task.window, toc);
            self.circuits.wait_until_allowed(&circuit).await;
            match fetcher
                .fetch_all(&task.route, task.date, task.window, toc)
                .await
            {
                Ok((pages, stats)) => {
                    self.circuits.record_success(&circuit);
                    metadata.window_splits += stats.splits;
                    for page in pages {
                        metadata.services += page.response.services.len();
                        refs.extend(page.response.rid_refs());
                    }
                }
                Err(err) => {
                    if err.is_gateway_class() {
                        self.circuits.record_failure(&circuit);
                    }
                    metadata.metrics_secs = secs_since(metrics_start);
                    return Err(err);
                }
            }
        }
        metadata.metrics_secs = secs_since(metrics_start);

        let selection = select_rids(refs, self.config.rid_cap_per_slice, &key);
        metadata.rids_before_dedup = selection.before_dedup;
        metadata.rids_after_dedup = selection.after_dedup;
        metadata.rids_selected = selection.after_cap();
        if selection.rids.is_empty() {
            info!("no services in window");
            return Ok(Collected::NoServices);
        }

        let details_start = Instant::now();
        let outcome = self
            .details
            .fetch_details(&task.route, task.date, selection.rids)
            .await?;
        metadata.details_secs = secs_since(details_start);
        metadata.details_ok = outcome.ok;
        metadata.details_failed = outcome.failed;
        metadata.details_dropped = outcome.dropped;

        if outcome.failed > 0 && outcome.ok == 0 && outcome.dropped == 0 {
            return Ok(Collected::DetailsFailed {
                hostile: outcome.hostile > 0,
            });
        }

        metadata.rows_written = self.slices.write_records(&key, &outcome.records)?;
        Ok(Collected::Written)
    }
}

#[derive(Debug, Default)]
struct Tally {
    attempts: usize,
    resumed: usize,
    errors: ErrorBreakdown,
    routes: BTreeMap<String, RouteSummary>,
}

impl Tally {
    fn record(&mut self, task: &Task, outcome: &TaskOutcome) {
        self.attempts += 1;
        let route = self.routes.entry(task.route.to_string()).or_default();
        match outcome.status {
            TaskStatus::CircuitBreaker => self.errors.hostile += 1,
            TaskStatus::Timeout | TaskStatus::Bisected => self.errors.timeouts += 1,
            TaskStatus::Failed => self.errors.other += 1,
            _ => return,
        }
        route.errors += 1;
    }
}
