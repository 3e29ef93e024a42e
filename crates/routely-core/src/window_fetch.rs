//! Adaptive metrics fetch with in-place window splitting.
//!
//! A fetch starts with one window on a work stack. Each popped window is
//! either served (one page), split into two halves pushed back onto the
//! stack, retried in place after a backoff, or failed terminally. Pages are
//! produced lazily in time order through [`WindowCursor::next_page`].

use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::api::{MetricsResponse, ServicePerformanceApi};
use crate::config::AdaptiveConfig;
use crate::error::{Error, Result, WindowError};
use crate::retry::{RetryPolicy, uniform_jitter};
use crate::task::Route;
use crate::transport::Backend;
use crate::window::TimeWindow;

/// Windows up to this span back off gently instead of exponentially.
pub const GENTLE_BACKOFF_MAX_SPAN: u16 = 30;
const GENTLE_BACKOFF_MIN: Duration = Duration::from_secs(2);
const GENTLE_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WindowFetchConfig {
    /// Splits allowed below the requested window.
    pub max_depth: u32,
    /// Neither half of a split may be shorter than this.
    pub min_window_minutes: u16,
    /// In-place retries per window after a gateway-class failure.
    pub window_retries: u32,
}

impl Default for WindowFetchConfig {
    fn default() -> Self {
        Self::from(&AdaptiveConfig::default())
    }
}

impl From<&AdaptiveConfig> for WindowFetchConfig {
    fn from(config: &AdaptiveConfig) -> Self {
        Self {
            max_depth: config.max_chunk_depth,
            min_window_minutes: config.min_window_minutes.max(1),
            window_retries: config.window_retries,
        }
    }
}

/// One served window.
#[derive(Debug, Clone)]
pub struct MetricsPage {
    pub window: TimeWindow,
    pub response: MetricsResponse,
}

/// Counters for one fetch, reported in slice logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub pages: u32,
    pub splits: u32,
    pub retries: u32,
    pub gateway_failures: u32,
}

#[derive(Debug, Clone, Copy)]
struct PendingWindow {
    window: TimeWindow,
    depth_remaining: u32,
    /// Failed attempts so far.
    failures: u32,
}

/// Adaptive fetcher bound to an API client.
#[derive(Debug)]
pub struct AdaptiveWindowFetcher<'a, B> {
    api: &'a ServicePerformanceApi<B>,
    config: WindowFetchConfig,
    backoff: RetryPolicy,
}

impl<'a, B: Backend> AdaptiveWindowFetcher<'a, B> {
    #[must_use]
    pub fn new(api: &'a ServicePerformanceApi<B>, config: WindowFetchConfig) -> Self {
        let backoff = api.transport().retry_policy().clone();
        Self {
            api,
            config,
            backoff,
        }
    }

    /// Start a lazy fetch of `window` for `route` on `date`.
    #[must_use]
    pub fn fetch(
        &self,
        route: &Route,
        date: NaiveDate,
        window: TimeWindow,
        toc_filter: Option<&str>,
    ) -> WindowCursor<'_, 'a, B> {
        debug!(
            route = %route,
            window = %window,
            depth = self.config.max_depth,
            toc = toc_filter.unwrap_or("*"),
            "adaptive fetch"
        );
        WindowCursor {
            fetcher: self,
            route: route.clone(),
            date,
            toc_filter: toc_filter.map(str::to_string),
            stack: vec![PendingWindow {
                window,
                depth_remaining: self.config.max_depth,
                failures: 0,
            }],
            stats: FetchStats::default(),
        }
    }

    /// Fetch every page of `window`. Fails if any window ends terminally.
    pub async fn fetch_all(
        &self,
        route: &Route,
        date: NaiveDate,
        window: TimeWindow,
        toc_filter: Option<&str>,
    ) -> Result<(Vec<MetricsPage>, FetchStats)> {
        let mut cursor = self.fetch(route, date, window, toc_filter);
        let mut pages = Vec::new();
        while let Some(page) = cursor.next_page().await? {
            pages.push(page);
        }
        Ok((pages, cursor.stats()))
    }

    fn backoff_for(&self, window: TimeWindow, failures: u32) -> Duration {
        if window.span_minutes() <= GENTLE_BACKOFF_MAX_SPAN {
            uniform_jitter(GENTLE_BACKOFF_MIN, GENTLE_BACKOFF_MAX)
        } else {
            self.backoff.delay_for_attempt(failures.saturating_sub(1))
        }
    }
}

/// Lazy sequence of pages for one adaptive fetch.
#[derive(Debug)]
pub struct WindowCursor<'f, 'a, B> {
    fetcher: &'f AdaptiveWindowFetcher<'a, B>,
    route: Route,
    date: NaiveDate,
    toc_filter: Option<String>,
    stack: Vec<PendingWindow>,
    stats: FetchStats,
}

impl<B: Backend> WindowCursor<'_, '_, B> {
    #[must_use]
    pub fn stats(&self) -> FetchStats {
        self.stats
    }

    /// Next served page, `Ok(None)` when every window has been served.
    pub async fn next_page(&mut self) -> Result<Option<MetricsPage>> {
        let fetcher = self.fetcher;
        let config = &fetcher.config;
        while let Some(mut pending) = self.stack.pop() {
            let result = fetcher
                .api
                .service_metrics(&self.route, self.date, pending.window, self.toc_filter.as_deref())
                .await;

            let err = match result {
                Ok(response) => {
                    self.stats.pages += 1;
                    debug!(
                        route = %self.route,
                        window = %pending.window,
                        services = response.services.len(),
                        "window served"
                    );
                    return Ok(Some(MetricsPage {
                        window: pending.window,
                        response,
                    }));
                }
                Err(Error::Transport(err)) if err.is_gateway_class() => err,
                Err(other) => return Err(other),
            };

            self.stats.gateway_failures += 1;
            pending.failures += 1;
            warn!(
                route = %self.route,
                window = %pending.window,
                attempt = pending.failures,
                status = ?err.status(),
                "gateway-class failure on window"
            );

            if pending.depth_remaining > 0 && pending.window.can_bisect(config.min_window_minutes) {
                if let Some((first, second)) = pending.window.bisect() {
                    self.stats.splits += 1;
                    info!(
                        route = %self.route,
                        window = %pending.window,
                        first = %first,
                        second = %second,
                        "splitting window"
                    );
                    let depth_remaining = pending.depth_remaining - 1;
                    for window in [second, first] {
                        self.stack.push(PendingWindow {
                            window,
                            depth_remaining,
                            failures: 0,
                        });
                    }
                    continue;
                }
            }

            if pending.failures <= config.window_retries {
                self.stats.retries += 1;
                let delay = fetcher.backoff_for(pending.window, pending.failures);
                debug!(
                    window = %pending.window,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "backing off before retrying window"
                );
                tokio::time::sleep(delay).await;
                self.stack.push(pending);
                continue;
            }

            let window = pending.window.to_string();
            let failure = if pending.window.can_bisect(config.min_window_minutes) {
                WindowError::WindowTimeout {
                    window,
                    attempts: pending.failures,
                    source: err,
                }
            } else {
                WindowError::MinimumWindowFailed { window, source: err }
            };
            warn!(route = %self.route, error = %failure, "window failed terminally");
            self.stack.clear();
            return Err(failure.into());
        }
        Ok(None)
    }
}
