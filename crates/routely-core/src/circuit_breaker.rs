//! Per-key circuit breakers for hostile upstream responses.
//!
//! A breaker opens after `failure_threshold` consecutive failures on its key.
//! While open, callers must sleep out the cooldown; once it has elapsed the
//! breaker closes again with its counter reset.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitConfig;

/// Threshold and cooldown shared by every breaker in a registry.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive hostile failures that open a breaker.
    pub failure_threshold: u32,
    /// Pause forced on the key once open.
    pub cooldown: Duration,
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(90),
        }
    }
}

impl From<&CircuitConfig> for CircuitBreakerConfig {
    fn from(config: &CircuitConfig) -> Self {
        Self::new(config.failure_threshold, Duration::from_secs(config.cooldown_secs))
    }
}

#[derive(Debug, Clone)]
enum Phase {
    Closed,
    Open { opened_at: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub state: BreakerState,
    pub failure_streak: u32,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub cooldown_remaining_ms: Option<u64>,
    /// Times this breaker has opened.
    pub trips: u32,
}

/// Failure streak and open/closed phase for one access key.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    phase: Phase,
    failure_streak: u32,
    trips: u32,
}

impl CircuitBreaker {
    #[must_use]
    pub fn with_name(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            phase: Phase::Closed,
            failure_streak: 0,
            trips: 0,
        }
    }

    /// Remaining cooldown, or `None` if an attempt may proceed now.
    ///
    /// An open breaker whose cooldown has elapsed closes with its counter reset.
    pub fn cooldown_remaining(&mut self) -> Option<Duration> {
        match self.phase {
            Phase::Closed => None,
            Phase::Open { opened_at } => {
                let elapsed = opened_at.elapsed();
                if elapsed >= self.config.cooldown {
                    self.phase = Phase::Closed;
                    self.failure_streak = 0;
                    info!(circuit = %self.name, "cooldown over, key admitted again");
                    None
                } else {
                    Some(self.config.cooldown - elapsed)
                }
            }
        }
    }

    /// True when an attempt on this key may go ahead now.
    pub fn allow(&mut self) -> bool {
        self.cooldown_remaining().is_none()
    }

    pub fn record_success(&mut self) {
        if matches!(self.phase, Phase::Closed) {
            self.failure_streak = 0;
        }
    }

    pub fn record_failure(&mut self) {
        match self.phase {
            Phase::Closed => {
                self.failure_streak = self.failure_streak.saturating_add(1);
                if self.failure_streak >= self.config.failure_threshold {
                    self.phase = Phase::Open {
                        opened_at: Instant::now(),
                    };
                    self.trips = self.trips.saturating_add(1);
                    warn!(
                        circuit = %self.name,
                        failures = self.failure_streak,
                        threshold = self.config.failure_threshold,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "hostile responses on key, breaker open"
                    );
                }
            }
            // Failures while open do not extend the cooldown.
            Phase::Open { .. } => {}
        }
    }

    #[must_use]
    pub fn status(&self) -> BreakerStatus {
        let (state, remaining) = match self.phase {
            Phase::Closed => (BreakerState::Closed, None),
            Phase::Open { opened_at } => (
                BreakerState::Open,
                Some(self.config.cooldown.saturating_sub(opened_at.elapsed())),
            ),
        };
        BreakerStatus {
            state,
            failure_streak: self.failure_streak,
            failure_threshold: self.config.failure_threshold,
            cooldown_ms: millis(self.config.cooldown),
            cooldown_remaining_ms: remaining.map(millis),
            trips: self.trips,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Circuit breaker key for a metrics window and operator filter.
#[must_use]
pub fn window_key(window: &crate::window::TimeWindow, toc_filter: Option<&str>) -> String {
    format!("{window}|{}", toc_filter.unwrap_or("*"))
}

/// Named [`BreakerStatus`], as listed by [`CircuitRegistry::snapshots`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub status: BreakerStatus,
}

/// Breakers keyed by access pattern, created on first use.
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<BTreeMap<String, CircuitBreaker>>,
}

impl CircuitRegistry {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(BTreeMap::new()),
        }
    }

    fn with_breaker<T>(&self, key: &str, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        let mut guard = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let breaker = guard
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::with_name(key, self.config.clone()));
        f(breaker)
    }

    pub fn cooldown_remaining(&self, key: &str) -> Option<Duration> {
        self.with_breaker(key, CircuitBreaker::cooldown_remaining)
    }

    pub fn record_success(&self, key: &str) {
        self.with_breaker(key, CircuitBreaker::record_success);
    }

    pub fn record_failure(&self, key: &str) {
        self.with_breaker(key, CircuitBreaker::record_failure);
    }

    /// Sleep until the breaker for `key` admits an attempt. Returns the time
    /// spent cooling down.
    pub async fn wait_until_allowed(&self, key: &str) -> Duration {
        let mut waited = Duration::ZERO;
        while let Some(remaining) = self.cooldown_remaining(key) {
            info!(
                circuit = %key,
                cooldown_ms = millis(remaining),
                "breaker open, waiting out cooldown"
            );
            tokio::time::sleep(remaining).await;
            waited += remaining;
        }
        waited
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let guard = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .iter()
            .map(|(name, breaker)| BreakerSnapshot {
                name: name.clone(),
                status: breaker.status(),
            })
            .collect()
    }

    /// Total number of times any breaker opened.
    #[must_use]
    pub fn total_trips(&self) -> u32 {
        self.snapshots().iter().map(|s| s.status.trips).sum()
    }
}
