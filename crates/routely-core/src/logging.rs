//! Structured logging for routely
//!
//! Uses `tracing` with a pretty or JSON formatter on stderr and an optional
//! append-only log file.
//!
//! # Correlation Fields
//!
//! Use these field names consistently in spans and events:
//! - `task_key`: Composite task key
//! - `route`: `ORIGIN->DEST`
//! - `window`: `HHMM-HHMM`
//! - `endpoint`: Upstream endpoint name
//! - `attempt`: 1-based attempt counter
//!
//! Never log the API key or request headers.

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,

    pub format: LogFormat,

    /// Optional path to an append-only log file
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

enum Sink {
    Stderr,
    File(File),
}

/// Formatting layer for one destination. Only stderr gets ANSI colors.
fn output_layer(format: LogFormat, sink: Sink) -> BoxedLayer {
    match (format, sink) {
        (LogFormat::Pretty, Sink::Stderr) => fmt::layer()
            .with_writer(io::stderr)
            .with_target(true)
            .with_span_events(FmtSpan::NONE)
            .with_ansi(true)
            .boxed(),
        (LogFormat::Pretty, Sink::File(file)) => fmt::layer()
            .with_writer(Mutex::new(file))
            .with_target(true)
            .with_ansi(false)
            .boxed(),
        (LogFormat::Json, Sink::Stderr) => json_layer(io::stderr),
        (LogFormat::Json, Sink::File(file)) => json_layer(Mutex::new(file)),
    }
}

fn json_layer<W>(writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .json()
        .with_writer(writer)
        .with_timer(SystemTime)
        .with_current_span(true)
        .with_span_list(false)
        .flatten_event(true)
        .boxed()
}

/// Initialize the global logging subscriber.
///
/// Call once at startup; later calls return [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let level = config
        .level
        .parse::<LogLevel>()
        .map_err(|_| LogError::InvalidLevel(config.level.clone()))?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(level));

    let mut layers = vec![output_layer(config.format, Sink::Stderr)];
    if let Some(path) = &config.file {
        ensure_parent_dir(path)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        layers.push(output_layer(config.format, Sink::File(file)));
    }

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(layers).with(env_filter),
    )?;

    let _ = LOGGING_INITIALIZED.set(());

    tracing::debug!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );

    Ok(())
}

/// Filter used when `RUST_LOG` is unset or unparsable.
fn level_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::default().add_directive(LevelFilter::from_level(level.into()).into())
}

/// Check if logging has been initialized
pub fn is_logging_initialized() -> bool {
    LOGGING_INITIALIZED.get().is_some()
}

/// Span carrying the per-task correlation fields.
///
/// ```ignore
/// let span = routely_core::task_span!("run_task", task_key = %key, attempt = 1);
/// ```
#[macro_export]
macro_rules! task_span {
    ($name:expr $(, $($field:tt)+)?) => {
        tracing::info_span!($name $(, $($field)+)?)
    };
}

/// Log levels accepted by the `logging.level` setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: {s}. Expected one of: trace, debug, info, warn, error"
            )),
        }
    }
}
