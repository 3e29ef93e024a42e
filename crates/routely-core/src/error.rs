//! Error types for routely-core

use std::fmt::Write;
use thiserror::Error;

/// Maximum number of characters of an upstream response body kept for diagnosis.
pub const BODY_PREVIEW_CHARS: usize = 300;

/// Truncate a response body to [`BODY_PREVIEW_CHARS`] characters.
#[must_use]
pub fn truncate_body(body: &str) -> String {
    body.chars().take(BODY_PREVIEW_CHARS).collect()
}

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for routely-core
#[derive(Error, Debug)]
pub enum Error {
    /// Upstream transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A time window could not be served, even after splitting
    #[error("Window error: {0}")]
    Window(#[from] WindowError),

    /// State store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Upstream payload did not have the expected shape
    #[error("Malformed upstream payload: {0}")]
    Decode(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (join failures, closed semaphores, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// True for timeouts and gateway-class rejections that may succeed on a
    /// narrower window.
    #[must_use]
    pub fn is_gateway_class(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_gateway_class(),
            Self::Window(_) => true,
            _ => false,
        }
    }

    /// True for responses that indicate the upstream is actively blocking us.
    #[must_use]
    pub fn is_hostile(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_hostile(),
            Self::Window(e) => e.last_error_hostile(),
            _ => false,
        }
    }

    /// True when the failure is a timeout rather than an explicit rejection.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout(),
            Self::Window(e) => !e.last_error_hostile(),
            _ => false,
        }
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Transport(err) => Some(err.remediation()),
            Self::Window(err) => Some(err.remediation()),
            Self::Storage(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Decode(_) => Some(
                Remediation::new("The upstream API returned an unexpected payload shape.")
                    .alternative("Check whether the API version or base URL changed."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify output_root exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("A persisted JSON artifact could not be read or written.")
                    .command("Reset slice logs", "routely clean --hard"),
            ),
            Self::Runtime(_) => None,
        }
    }
}

/// Errors surfaced by the rate-limited transport after its own retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Upstream answered with a non-success HTTP status
    #[error("HTTP {status} from {endpoint}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The call did not complete within its timeout
    #[error("Request to {endpoint} timed out after {timeout_secs} seconds")]
    Timeout { endpoint: String, timeout_secs: u64 },

    /// Connection-level failure (DNS, TLS, reset)
    #[error("Request to {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },

    /// Response body was not valid JSON
    #[error("Invalid JSON from {endpoint}: {body}")]
    InvalidBody { endpoint: String, body: String },

    /// Transport could not be constructed (missing credentials, bad URL)
    #[error("Transport setup failed: {0}")]
    Setup(String),
}

impl TransportError {
    /// Statuses and failures worth retrying at the transport layer.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            Self::Timeout { .. } | Self::Connect { .. } => true,
            Self::InvalidBody { .. } | Self::Setup(_) => false,
        }
    }

    /// Failures that may be relieved by asking for a narrower window.
    #[must_use]
    pub fn is_gateway_class(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500 || matches!(status, 403 | 429),
            Self::Timeout { .. } => true,
            Self::Connect { .. } | Self::InvalidBody { .. } | Self::Setup(_) => false,
        }
    }

    /// Blocking responses that should feed the circuit breaker.
    #[must_use]
    pub fn is_hostile(&self) -> bool {
        matches!(self, Self::Status { status: 403 | 429, .. })
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Status { status: 504, .. })
    }

    /// HTTP status, when the upstream produced one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Status { status: 403, .. } | Self::Status { status: 429, .. } => {
                Remediation::new("The upstream gateway is rejecting requests. Slow down and resume later.")
                    .command("Resume", "routely run --resume")
                    .alternative("Raise transport.min_interval_ms or lower workers.")
            }
            Self::Status { .. } => {
                Remediation::new("The upstream API returned an error status. Retry the failed slices.")
                    .command("Clear failed slices", "routely clean")
                    .command("Resume", "routely run --resume")
            }
            Self::Timeout { .. } => Remediation::new(
                "The upstream API timed out. Narrow the time windows or enable bisection.",
            )
            .alternative("Set bisection_on_timeout = true.")
            .alternative("Raise metrics_timeout or details_timeout."),
            Self::Connect { .. } => Remediation::new("Check network connectivity and the API base URL.")
                .alternative("Verify api.base_url in the config file."),
            Self::InvalidBody { .. } => {
                Remediation::new("The upstream API returned a body that is not JSON.")
                    .alternative("Check whether the API is in maintenance.")
            }
            Self::Setup(_) => Remediation::new("Provide the API key in the configured environment variable.")
                .command("Export key", "export RDM_API_KEY=...")
                .alternative("Set api.key_env to the variable holding your key."),
        }
    }
}

/// Failure of the adaptive window fetcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    /// The smallest window we are allowed to ask for still failed
    #[error("Minimum window failed: {window} ({source})")]
    MinimumWindowFailed {
        window: String,
        #[source]
        source: TransportError,
    },

    /// A larger window exhausted its in-place retries
    #[error("Gateway timeout after {attempts} attempts: {window} ({source})")]
    WindowTimeout {
        window: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
}

impl WindowError {
    #[must_use]
    pub fn last_error(&self) -> &TransportError {
        match self {
            Self::MinimumWindowFailed { source, .. } | Self::WindowTimeout { source, .. } => source,
        }
    }

    #[must_use]
    pub fn last_error_hostile(&self) -> bool {
        self.last_error().is_hostile()
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::MinimumWindowFailed { window, .. } => Remediation::new(format!(
                "Window {window} could not be served even at minimum granularity."
            ))
            .command("Retry later", "routely run --resume")
            .alternative("Lower adaptive.min_window_minutes."),
            Self::WindowTimeout { window, .. } => Remediation::new(format!(
                "Window {window} timed out after in-place retries."
            ))
            .alternative("Raise adaptive.max_chunk_depth or enable bisection_on_timeout."),
        }
    }
}

/// State store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Unknown task status `{0}` in state store")]
    UnknownStatus(String),

    #[error("Database schema version ({current}) is newer than supported ({supported})")]
    SchemaTooNew { current: i32, supported: i32 },
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::from(err))
    }
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) => Remediation::new(
                "State store operation failed. Check output_root permissions and retry.",
            )
            .command("Show state", "routely status"),
            Self::UnknownStatus(_) => {
                Remediation::new("The state store contains a status this version does not know.")
                    .command("Reset state", "routely clean --hard")
            }
            Self::SchemaTooNew { current, supported } => Remediation::new(format!(
                "State schema version {current} is newer than supported ({supported}). Upgrade routely."
            ))
            .alternative("Run with a fresh output_root."),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\"")),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .alternative("YAML is used for .yaml/.yml files, TOML otherwise."),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Inspect plan", "routely plan")
            }
        }
    }
}
