//! Global minimum-interval limiter for outbound calls.
//!
//! Every caller shares one "time of last call". `acquire` holds the lock
//! while it sleeps out the remainder of the interval, so concurrent callers
//! are released one at a time, each at least `interval` after the previous.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct MinIntervalLimiter {
    interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl MinIntervalLimiter {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_call: Mutex::new(None),
        }
    }

    /// Limiter admitting at most `per_second` calls per second.
    #[must_use]
    pub fn per_second(per_second: u32) -> Self {
        Self::new(Duration::from_nanos(1_000_000_000 / u64::from(per_second.max(1))))
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until the interval since the previous call has elapsed, then
    /// claim the slot. Returns how long the caller waited.
    pub async fn acquire(&self) -> Duration {
        let mut last_call = self.last_call.lock().await;
        let mut waited = Duration::ZERO;
        if let Some(previous) = *last_call {
            let ready_at = previous + self.interval;
            let now = Instant::now();
            if now < ready_at {
                waited = ready_at - now;
                tracing::trace!(wait_ms = waited.as_millis() as u64, "throttling outbound call");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last_call = Some(Instant::now());
        waited
    }
}
