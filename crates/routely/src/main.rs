//! routely: collect, aggregate and certify rail delay percentiles.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};

use routely_core::config::{Config, LogFormat};
use routely_core::error::{ConfigError, Error};
use routely_core::logging::init_logging;
use routely_core::orchestrator::{self, Orchestrator, RunMode};
use routely_core::planner::plan_config;
use routely_core::slice_writer::SliceWriter;
use routely_core::state_store::{SqliteStateStore, StateStore};
use routely_core::task::{Route, TaskStatus};
use routely_core::transport::HttpBackend;
use routely_core::window::TimeWindow;

/// Run did not succeed (QA failed or tasks remain failed).
const EXIT_RUN_FAILED: u8 = 1;
/// Configuration or usage error; nothing was sent upstream.
const EXIT_USAGE: u8 = 2;

#[derive(Parser)]
#[command(
    name = "routely",
    author,
    version,
    about = "Resilient ingestion of historical rail service performance data"
)]
struct Cli {
    /// Config file (TOML, or YAML for .yaml/.yml)
    #[arg(long, short, global = true, env = "ROUTELY_CONFIG", default_value = "config/routely.toml")]
    config: PathBuf,

    /// Log level, overriding logging.level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format, overriding logging.format
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline: ingest, aggregate, QA
    Run {
        /// Continue from existing state, skipping settled tasks
        #[arg(long, conflicts_with = "fresh")]
        resume: bool,

        /// Discard existing state before starting
        #[arg(long)]
        fresh: bool,

        /// Do not retry failed tasks
        #[arg(long)]
        fail_fast: bool,

        #[command(flatten)]
        overrides: Overrides,
    },
    /// Persist the task plan as pending without running it
    Plan {
        /// Print every task key
        #[arg(long)]
        list: bool,

        #[command(flatten)]
        overrides: Overrides,
    },
    /// Show task counts per status
    Status,
    /// Remove failed entries so they run again, or wipe everything with --hard
    Clean {
        /// Wipe the state store and slice logs
        #[arg(long)]
        hard: bool,
    },
    /// Rebuild dataset, percentiles and QA report from existing slices
    Aggregate,
}

/// Config values replaceable from the command line.
#[derive(Args, Default)]
struct Overrides {
    /// Route as ORIGIN,DEST (repeatable)
    #[arg(long = "route")]
    routes: Vec<Route>,

    /// First date, YYYY-MM-DD
    #[arg(long)]
    date_start: Option<NaiveDate>,

    /// Last date, YYYY-MM-DD
    #[arg(long)]
    date_end: Option<NaiveDate>,

    /// Window as HHMM,HHMM (repeatable)
    #[arg(long = "window", value_parser = parse_window)]
    windows: Vec<TimeWindow>,
}

fn parse_window(raw: &str) -> Result<TimeWindow, String> {
    let (from, to) = raw
        .split_once(',')
        .ok_or_else(|| format!("window `{raw}` must be HHMM,HHMM"))?;
    TimeWindow::parse(
        &format!("{:0>4}", from.trim()),
        &format!("{:0>4}", to.trim()),
    )
    .map_err(|e| e.to_string())
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if !self.routes.is_empty() {
            config.routes = self.routes;
        }
        if let Some(date) = self.date_start {
            config.date_start = Some(date);
        }
        if let Some(date) = self.date_end {
            config.date_end = Some(date);
        }
        if !self.windows.is_empty() {
            config.time_windows = self.windows;
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let mut config = Config::load_from(&cli.config)?;
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    Ok(config)
}

fn report(err: &Error) {
    eprintln!("Error: {err}");
    if let Some(remediation) = err.remediation() {
        eprintln!("\n{}", remediation.render_plain());
    }
}

fn exit_for(err: &Error) -> ExitCode {
    report(err);
    match err {
        Error::Config(_) => ExitCode::from(EXIT_USAGE),
        _ => ExitCode::from(EXIT_RUN_FAILED),
    }
}

fn open_store(config: &Config) -> Result<SqliteStateStore, Error> {
    Ok(SqliteStateStore::open(&config.state_path())?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => return exit_for(&err.into()),
    };
    if let Err(err) = init_logging(&config.logging) {
        eprintln!("Warning: logging disabled: {err}");
    }
    debug!(config = %cli.config.display(), "configuration loaded");

    match cli.command {
        Command::Run {
            resume,
            fresh,
            fail_fast,
            overrides,
        } => {
            overrides.apply(&mut config);
            config.fail_fast |= fail_fast;
            run(config, resume, fresh).await
        }
        Command::Plan { list, overrides } => {
            overrides.apply(&mut config);
            plan(&config, list)
        }
        Command::Status => status(&config),
        Command::Clean { hard } => clean(&config, hard),
        Command::Aggregate => aggregate(&config),
    }
}

async fn run(config: Config, resume: bool, fresh: bool) -> ExitCode {
    if let Err(err) = config.validate() {
        return exit_for(&err.into());
    }
    let store = match open_store(&config) {
        Ok(store) => store,
        Err(err) => return exit_for(&err),
    };
    let mode = match (resume, fresh) {
        (true, _) => RunMode::Resume,
        (_, true) => RunMode::Fresh,
        (false, false) => match store.is_empty() {
            Ok(true) => RunMode::Fresh,
            Ok(false) => {
                eprintln!(
                    "Error: previous state found in {}. Pass --resume to continue it or --fresh to discard it.",
                    config.state_path().display()
                );
                return ExitCode::from(EXIT_USAGE);
            }
            Err(err) => return exit_for(&err.into()),
        },
    };
    let backend = match HttpBackend::from_env(&config.api) {
        Ok(backend) => backend,
        Err(err) => {
            report(&err.into());
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let summary = match Orchestrator::new(config, backend, store) {
        Ok(orch) => orch.run(mode).await,
        Err(err) => return exit_for(&err),
    };
    match summary {
        Ok(summary) => {
            println!("{}", summary.render());
            let (md, _) = &summary.report.report_paths;
            println!("QA report: {}", md.display());
            if summary.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_RUN_FAILED)
            }
        }
        Err(err) => exit_for(&err),
    }
}

fn plan(config: &Config, list: bool) -> ExitCode {
    let result = (|| -> Result<_, Error> {
        let store = open_store(config)?;
        let report = orchestrator::plan_only(config, &store)?;
        Ok((report, plan_config(config)?))
    })();
    match result {
        Ok((report, tasks)) => {
            println!(
                "Planned {} tasks ({} new) in {}",
                report.planned,
                report.added,
                config.state_path().display()
            );
            if list {
                for task in tasks {
                    println!("{}", task.key());
                }
            }
            ExitCode::SUCCESS
        }
        Err(err) => exit_for(&err),
    }
}

fn status(config: &Config) -> ExitCode {
    match status_lines(&config.state_path()) {
        Ok(lines) => {
            for line in lines {
                println!("{line}");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(EXIT_RUN_FAILED)
        }
    }
}

fn status_lines(state_path: &Path) -> anyhow::Result<Vec<String>> {
    if !state_path.exists() {
        return Ok(vec![format!("No state at {}", state_path.display())]);
    }
    let store = SqliteStateStore::open(state_path)
        .with_context(|| format!("opening {}", state_path.display()))?;
    let counts = store.counts().context("reading task counts")?;
    let total: usize = counts.values().sum();
    let mut lines = vec![format!("State: {} ({total} tasks)", state_path.display())];
    for status in TaskStatus::ALL {
        lines.push(format!(
            "  {:<16} {}",
            status.as_str(),
            counts.get(&status).copied().unwrap_or(0)
        ));
    }
    if let Some(planned) = store.run_metadata("planned_tasks").context("reading plan metadata")? {
        lines.push(format!("  planned_tasks    {planned}"));
    }
    Ok(lines)
}

fn clean(config: &Config, hard: bool) -> ExitCode {
    let result = open_store(config).and_then(|store| {
        orchestrator::clean(&store, &SliceWriter::from_config(config), hard)
    });
    match result {
        Ok(report) => {
            info!(hard, tasks = report.tasks_removed, logs = report.logs_removed, "state cleaned");
            if hard {
                println!(
                    "Wiped {} task entries and {} slice logs",
                    report.tasks_removed, report.logs_removed
                );
            } else {
                println!("Removed {} failed task entries", report.tasks_removed);
            }
            ExitCode::SUCCESS
        }
        Err(err) => exit_for(&err),
    }
}

fn aggregate(config: &Config) -> ExitCode {
    match orchestrator::aggregate(config) {
        Ok(report) => {
            println!(
                "{} records ({} duplicates removed), {} buckets",
                report.aggregation.records.len(),
                report.aggregation.duplicates_removed,
                report.aggregation.buckets.len()
            );
            println!("QA: {}", report.qa.verdict);
            for reason in &report.qa.reasons {
                println!("  - {reason}");
            }
            println!("QA report: {}", report.report_paths.0.display());
            if report.qa.verdict.passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_RUN_FAILED)
            }
        }
        Err(err) => exit_for(&err),
    }
}
