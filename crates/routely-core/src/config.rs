//! Configuration management for routely
//!
//! Handles loading and validation of run configuration files. TOML is the
//! default format; files ending in `.yaml` or `.yml` are read as YAML.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::task::Route;
use crate::window::TimeWindow;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly colored output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// First calendar date to ingest (inclusive)
    #[serde(default)]
    pub date_start: Option<NaiveDate>,

    /// Last calendar date to ingest (inclusive)
    #[serde(default)]
    pub date_end: Option<NaiveDate>,

    /// Origin/destination pairs
    #[serde(default)]
    pub routes: Vec<Route>,

    /// HHMM windows queried per route and date
    #[serde(default)]
    pub time_windows: Vec<TimeWindow>,

    /// Maximum detail lookups per (origin, dest, hour) group; 0 disables the cap
    #[serde(default = "default_rid_cap")]
    pub rid_cap_per_slice: usize,

    /// Concurrent detail-fetch workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Metrics call timeout in seconds
    #[serde(default = "default_metrics_timeout")]
    pub metrics_timeout: u64,

    /// Details call timeout in seconds
    #[serde(default = "default_details_timeout")]
    pub details_timeout: u64,

    /// Split timed-out tasks into child tasks
    #[serde(default)]
    pub bisection_on_timeout: bool,

    /// Minimum observations per (route, hour, day-of-week) cell
    #[serde(default = "default_qa_min_obs")]
    pub qa_min_obs_per_cell: usize,

    /// Never retry failed tasks
    #[serde(default)]
    pub fail_fast: bool,

    /// Pause after this many detail requests
    #[serde(default = "default_sleep_every")]
    pub sleep_every: u64,

    /// Length of the periodic pause in seconds
    #[serde(default = "default_sleep_secs")]
    pub sleep_secs: f64,

    /// Root directory for state, slices, logs and reports
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,

    /// Operator filter codes; empty queries all operators
    #[serde(default)]
    pub toc_filters: Vec<String>,

    /// Retry passes over failed tasks
    #[serde(default = "default_retry_passes")]
    pub max_retry_passes: u32,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    #[serde(default)]
    pub circuit: CircuitConfig,

    #[serde(default)]
    pub logging: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            date_start: None,
            date_end: None,
            routes: Vec::new(),
            time_windows: Vec::new(),
            rid_cap_per_slice: default_rid_cap(),
            workers: default_workers(),
            metrics_timeout: default_metrics_timeout(),
            details_timeout: default_details_timeout(),
            bisection_on_timeout: false,
            qa_min_obs_per_cell: default_qa_min_obs(),
            fail_fast: false,
            sleep_every: default_sleep_every(),
            sleep_secs: default_sleep_secs(),
            output_root: default_output_root(),
            toc_filters: Vec::new(),
            max_retry_passes: default_retry_passes(),
            api: ApiConfig::default(),
            transport: TransportConfig::default(),
            adaptive: AdaptiveConfig::default(),
            circuit: CircuitConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

fn default_rid_cap() -> usize {
    150
}

fn default_workers() -> usize {
    12
}

fn default_metrics_timeout() -> u64 {
    120
}

fn default_details_timeout() -> u64 {
    30
}

fn default_qa_min_obs() -> usize {
    8
}

fn default_sleep_every() -> u64 {
    200
}

fn default_sleep_secs() -> f64 {
    0.05
}

fn default_output_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_retry_passes() -> u32 {
    2
}

/// Upstream API endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Environment variable holding the API key
    #[serde(default = "default_key_env")]
    pub key_env: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            key_env: default_key_env(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_base_url() -> String {
    "https://api1.raildata.org.uk/1010-historical-service-performance-_hsp_v1/api/v1".to_string()
}

fn default_key_env() -> String {
    "RDM_API_KEY".to_string()
}

fn default_user_agent() -> String {
    concat!("routely/", env!("CARGO_PKG_VERSION")).to_string()
}

/// Outbound call pacing and retry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Minimum interval between any two outbound calls
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            jitter_max_ms: default_jitter_max_ms(),
        }
    }
}

fn default_min_interval_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_jitter_max_ms() -> u64 {
    400
}

/// Window splitting under timeout pressure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Bisection depth inside a single metrics fetch
    #[serde(default = "default_chunk_depth")]
    pub max_chunk_depth: u32,

    /// Smallest window either layer may produce
    #[serde(default = "default_min_window")]
    pub min_window_minutes: u16,

    /// In-place retries of one window after a gateway failure
    #[serde(default = "default_window_retries")]
    pub window_retries: u32,

    /// Generations of child tasks the orchestrator may create
    #[serde(default = "default_bisect_depth")]
    pub max_bisect_depth: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            max_chunk_depth: default_chunk_depth(),
            min_window_minutes: default_min_window(),
            window_retries: default_window_retries(),
            max_bisect_depth: default_bisect_depth(),
        }
    }
}

fn default_chunk_depth() -> u32 {
    2
}

fn default_min_window() -> u16 {
    15
}

fn default_window_retries() -> u32 {
    3
}

fn default_bisect_depth() -> u32 {
    2
}

/// Cool-down policy for hostile responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    90
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
        if is_yaml {
            Self::from_yaml_str(&raw)
        } else {
            Self::from_toml_str(&raw)
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    /// Check every field a run depends on. Must pass before any network call.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        let (Some(start), Some(end)) = (self.date_start, self.date_end) else {
            return invalid("date_start and date_end are required".to_string());
        };
        if start > end {
            return invalid(format!("date_start {start} is after date_end {end}"));
        }
        if self.routes.is_empty() {
            return invalid("at least one route is required".to_string());
        }
        if let Some(route) = self
            .routes
            .iter()
            .find(|r| r.origin.is_empty() || r.dest.is_empty())
        {
            return invalid(format!("route `{route}` has an empty location code"));
        }
        if self.time_windows.is_empty() {
            return invalid("at least one time window is required".to_string());
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1".to_string());
        }
        if self.metrics_timeout == 0 || self.details_timeout == 0 {
            return invalid("metrics_timeout and details_timeout must be positive".to_string());
        }
        if !self.sleep_secs.is_finite() || self.sleep_secs < 0.0 {
            return invalid(format!("sleep_secs must be non-negative, got {}", self.sleep_secs));
        }
        if self.adaptive.min_window_minutes == 0 {
            return invalid("adaptive.min_window_minutes must be positive".to_string());
        }
        if self.circuit.failure_threshold == 0 {
            return invalid("circuit.failure_threshold must be positive".to_string());
        }
        if self.api.base_url.trim().is_empty() {
            return invalid("api.base_url must not be empty".to_string());
        }
        Ok(())
    }

    /// All dates in `[date_start, date_end]`. Empty if either bound is unset.
    #[must_use]
    pub fn dates(&self) -> Vec<NaiveDate> {
        match (self.date_start, self.date_end) {
            (Some(start), Some(end)) => start.iter_days().take_while(|d| *d <= end).collect(),
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub fn metrics_timeout(&self) -> Duration {
        Duration::from_secs(self.metrics_timeout)
    }

    #[must_use]
    pub fn details_timeout(&self) -> Duration {
        Duration::from_secs(self.details_timeout)
    }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.output_root.join("state").join("state.db")
    }

    #[must_use]
    pub fn raw_delays_dir(&self) -> PathBuf {
        self.output_root.join("raw_delays")
    }

    #[must_use]
    pub fn slice_logs_dir(&self) -> PathBuf {
        self.output_root.join("logs").join("slices")
    }

    #[must_use]
    pub fn reports_dir(&self) -> PathBuf {
        self.output_root.join("reports")
    }

    #[must_use]
    pub fn dataset_path(&self) -> PathBuf {
        self.output_root.join("delays_raw.jsonl")
    }

    #[must_use]
    pub fn percentiles_path(&self) -> PathBuf {
        self.output_root.join("route_hour_p80_p90_p95.csv")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TOML: &str = r#"
date_start = "2025-08-01"
date_end = "2025-08-03"
routes = [["PAD", "BRI"], ["vic", "gtw"]]
time_windows = [["0600", "0859"], ["0900", "1159"]]
workers = 4
bisection_on_timeout = true

[adaptive]
max_chunk_depth = 1
"#;

    #[test]
    fn default_config_fails_validation_without_plan() {
        let config = Config::default();
        assert_eq!(config.workers, 12);
        assert_eq!(config.circuit.cooldown_secs, 90);
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_config_loads_and_validates() {
        let config = Config::from_toml_str(SAMPLE_TOML).unwrap();
        config.validate().unwrap();
        assert_eq!(config.routes[1], Route::new("VIC", "GTW"));
        assert_eq!(config.time_windows[0].to_string(), "0600-0859");
        assert_eq!(config.adaptive.max_chunk_depth, 1);
        assert_eq!(config.adaptive.min_window_minutes, 15);
        assert_eq!(config.dates().len(), 3);
    }

    #[test]
    fn yaml_config_loads() {
        let yaml = r#"
date_start: 2025-08-01
date_end: 2025-08-01
routes:
  - [PAD, HXX]
time_windows:
  - ["0600", "0659"]
rid_cap_per_slice: 40
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.rid_cap_per_slice, 40);
    }

    #[test]
    fn malformed_window_is_a_parse_error() {
        let raw = SAMPLE_TOML.replace("0859", "0890");
        assert!(matches!(
            Config::from_toml_str(&raw),
            Err(ConfigError::ParseFailed(_))
        ));
    }

    #[test]
    fn reversed_dates_fail_validation() {
        let mut config = Config::from_toml_str(SAMPLE_TOML).unwrap();
        config.date_end = NaiveDate::from_ymd_opt(2025, 7, 1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn zero_workers_fail_validation() {
        let mut config = Config::from_toml_str(SAMPLE_TOML).unwrap();
        config.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Config::load_from(Path::new("/nonexistent/routely.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }
}
