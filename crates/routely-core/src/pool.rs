//! Bounded worker pool and periodic politeness pause.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Runs a closure over a batch of items with at most `limit` in flight.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    limit: usize,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Apply `work` to every item. Results arrive in completion order.
    pub async fn run<I, T, F, Fut>(&self, items: I, work: F) -> Result<Vec<T>>
    where
        I: IntoIterator,
        I::Item: Send + 'static,
        F: Fn(I::Item) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let work = Arc::new(work);
        let mut join_set = JoinSet::new();
        let mut results = Vec::new();

        for item in items {
            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|e| Error::Runtime(format!("worker pool closed: {e}")))?;
            let work = Arc::clone(&work);
            join_set.spawn(async move {
                let _permit = permit;
                work(item).await
            });

            // Collect whatever already finished so the set stays small.
            while let Some(done) = join_set.try_join_next() {
                results.push(done.map_err(|e| Error::Runtime(format!("worker failed: {e}")))?);
            }
        }

        while let Some(done) = join_set.join_next().await {
            results.push(done.map_err(|e| Error::Runtime(format!("worker failed: {e}")))?);
        }
        debug!(completed = results.len(), limit = self.limit, "worker pool drained");
        Ok(results)
    }
}

/// Shared request counter that pauses every `every` requests.
#[derive(Debug)]
pub struct PeriodicPause {
    every: u64,
    pause: Duration,
    count: AtomicU64,
}

impl PeriodicPause {
    /// `every == 0` disables the pause.
    #[must_use]
    pub fn new(every: u64, pause: Duration) -> Self {
        Self {
            every,
            pause,
            count: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn from_secs_f64(every: u64, pause_secs: f64) -> Self {
        Self::new(every, Duration::try_from_secs_f64(pause_secs).unwrap_or_default())
    }

    /// Count one request, sleeping when the count hits a multiple of `every`.
    pub async fn tick(&self) {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if self.every > 0 && n % self.every == 0 && !self.pause.is_zero() {
            trace!(requests = n, pause_ms = self.pause.as_millis() as u64, "politeness pause");
            tokio::time::sleep(self.pause).await;
        }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
