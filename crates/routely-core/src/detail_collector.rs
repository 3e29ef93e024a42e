//! Concurrent per-service detail lookups.

use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::api::{RidRef, ServicePerformanceApi};
use crate::circuit_breaker::CircuitRegistry;
use crate::error::Result;
use crate::pool::{PeriodicPause, WorkerPool};
use crate::record::DelayRecord;
use crate::task::Route;
use crate::transport::Backend;

/// Circuit breaker key shared by every detail lookup.
pub const DETAILS_CIRCUIT: &str = "details";

/// Result of a detail phase.
#[derive(Debug, Clone, Default)]
pub struct DetailOutcome {
    /// Records in completion order.
    pub records: Vec<DelayRecord>,
    /// Lookups that produced a record.
    pub ok: usize,
    /// Lookups whose request failed.
    pub failed: usize,
    /// Lookups answered without a usable arrival at the destination.
    pub dropped: usize,
    /// Failed lookups rejected with 403/429.
    pub hostile: usize,
}

enum Lookup {
    Record(DelayRecord),
    Dropped,
    Failed { hostile: bool },
}

/// Fetches details for a batch of identifiers through a bounded pool.
#[derive(Debug)]
pub struct DetailCollector<B> {
    api: Arc<ServicePerformanceApi<B>>,
    pool: WorkerPool,
    pause: Arc<PeriodicPause>,
    circuits: Arc<CircuitRegistry>,
}

impl<B: Backend + 'static> DetailCollector<B> {
    #[must_use]
    pub fn new(
        api: Arc<ServicePerformanceApi<B>>,
        pool: WorkerPool,
        pause: Arc<PeriodicPause>,
        circuits: Arc<CircuitRegistry>,
    ) -> Self {
        Self {
            api,
            pool,
            pause,
            circuits,
        }
    }

    /// Look up every identifier in `rids` for `route` on `date`.
    ///
    /// Identifiers are expected to be deduplicated already. Individual
    /// lookup failures are counted, never returned as errors.
    pub async fn fetch_details(
        &self,
        route: &Route,
        date: NaiveDate,
        rids: Vec<RidRef>,
    ) -> Result<DetailOutcome> {
        let api = Arc::clone(&self.api);
        let pause = Arc::clone(&self.pause);
        let circuits = Arc::clone(&self.circuits);
        let route = route.clone();

        let lookups = self
            .pool
            .run(rids, move |rid_ref: RidRef| {
                let api = Arc::clone(&api);
                let pause = Arc::clone(&pause);
                let circuits = Arc::clone(&circuits);
                let route = route.clone();
                async move {
                    circuits.wait_until_allowed(DETAILS_CIRCUIT).await;
                    let result = api.service_details(&rid_ref.rid).await;
                    pause.tick().await;
                    match result {
                        Ok(details) => {
                            circuits.record_success(DETAILS_CIRCUIT);
                            match details.delay_record(&route, &rid_ref.rid, date) {
                                Some(record) => Lookup::Record(record),
                                None => Lookup::Dropped,
                            }
                        }
                        Err(err) => {
                            let hostile = err.is_hostile();
                            if hostile {
                                circuits.record_failure(DETAILS_CIRCUIT);
                            }
                            debug!(rid = %rid_ref.rid, error = %err, "detail lookup failed");
                            Lookup::Failed { hostile }
                        }
                    }
                }
            })
            .await?;

        let mut outcome = DetailOutcome::default();
        for lookup in lookups {
            match lookup {
                Lookup::Record(record) => {
                    outcome.ok += 1;
                    outcome.records.push(record);
                }
                Lookup::Dropped => outcome.dropped += 1,
                Lookup::Failed { hostile } => {
                    outcome.failed += 1;
                    if hostile {
                        outcome.hostile += 1;
                    }
                }
            }
        }
        if outcome.failed > 0 {
            warn!(
                ok = outcome.ok,
                failed = outcome.failed,
                hostile = outcome.hostile,
                "detail phase finished with failures"
            );
        }
        Ok(outcome)
    }
}
