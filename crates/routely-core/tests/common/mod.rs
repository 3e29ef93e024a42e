//! Shared fixtures for end-to-end orchestrator tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::NaiveDate;
use serde_json::{Value, json};

use routely_core::config::Config;
use routely_core::error::TransportError;
use routely_core::task::Route;
use routely_core::transport::{Backend, Endpoint, Request};
use routely_core::window::{TimeWindow, format_hhmm, parse_hhmm};

/// Minutes between scheduled services in the fake timetable.
pub const HEADWAY: u16 = 15;

/// In-memory upstream with a deterministic timetable.
///
/// Every window holds one service per [`HEADWAY`] minutes, with identifiers
/// derived from the date and scheduled minute, so overlapping or split
/// windows report consistent identifiers. Scripted metrics failures are
/// served before the timetable.
#[derive(Default)]
pub struct FakeUpstream {
    metrics_failures: Mutex<VecDeque<TransportError>>,
    requests: Mutex<Vec<Request>>,
    metrics_calls: AtomicUsize,
    details_calls: AtomicUsize,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` metrics calls with `err`.
    pub fn fail_metrics(self, n: usize, err: TransportError) -> Self {
        {
            let mut failures = self.metrics_failures.lock().unwrap();
            failures.extend(std::iter::repeat_n(err, n));
        }
        self
    }

    pub fn metrics_calls(&self) -> usize {
        self.metrics_calls.load(Ordering::SeqCst)
    }

    pub fn details_calls(&self) -> usize {
        self.details_calls.load(Ordering::SeqCst)
    }

    /// `(from_time, to_time)` of every metrics request, in order.
    pub fn metrics_windows(&self) -> Vec<(String, String)> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.endpoint == Endpoint::ServiceMetrics)
            .map(|r| {
                (
                    r.payload["from_time"].as_str().unwrap_or_default().to_string(),
                    r.payload["to_time"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    fn metrics(&self, payload: &Value) -> Result<Value, TransportError> {
        if let Some(err) = self.metrics_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let text = |k: &str| payload[k].as_str().unwrap_or_default().to_string();
        let (origin, dest, date) = (text("from_loc"), text("to_loc"), text("from_date"));
        let start = parse_hhmm(&text("from_time")).unwrap();
        let end = parse_hhmm(&text("to_time")).unwrap();

        let services: Vec<Value> = (start..=end)
            .filter(|m| m % HEADWAY == 0)
            .map(|minute| {
                json!({"serviceAttributesMetrics": {
                    "origin_location": origin,
                    "destination_location": dest,
                    "gbtt_ptd": format_hhmm(minute.saturating_sub(30)),
                    "gbtt_pta": format_hhmm(minute),
                    "toc_code": "GW",
                    "rids": [rid_for(&date, minute)],
                }})
            })
            .collect();
        Ok(json!({ "Services": services }))
    }

    fn details(payload: &Value) -> Result<Value, TransportError> {
        let rid = payload["rid"].as_str().unwrap_or_default();
        let minute: u16 = rid[rid.len() - 4..].parse().unwrap_or(0);
        let late = minute % 7;
        Ok(json!({"serviceAttributesDetails": {"locations": [
            {"location": "PAD", "gbtt_ptd": format_hhmm(minute.saturating_sub(30))},
            {"location": "BRI", "gbtt_pta": format_hhmm(minute), "actual_ta": format_hhmm(minute + late)}
        ]}}))
    }
}

/// Identifier of the fake service scheduled at `minute` on `date`.
pub fn rid_for(date: &str, minute: u16) -> String {
    format!("{}{minute:04}", date.replace('-', ""))
}

impl Backend for FakeUpstream {
    async fn send(&self, request: &Request) -> Result<Value, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        match request.endpoint {
            Endpoint::ServiceMetrics => {
                self.metrics_calls.fetch_add(1, Ordering::SeqCst);
                self.metrics(&request.payload)
            }
            Endpoint::ServiceDetails => {
                self.details_calls.fetch_add(1, Ordering::SeqCst);
                Self::details(&request.payload)
            }
        }
    }
}

pub fn gateway_timeout() -> TransportError {
    TransportError::Status {
        endpoint: "serviceMetrics".to_string(),
        status: 504,
        body: "Gateway Time-out".to_string(),
    }
}

/// One route, one date, fast transport, no in-fetch splitting.
pub fn test_config(root: &Path, windows: &[(&str, &str)]) -> Config {
    let mut config = Config {
        date_start: NaiveDate::from_ymd_opt(2025, 8, 27),
        date_end: NaiveDate::from_ymd_opt(2025, 8, 27),
        routes: vec![Route::new("PAD", "BRI")],
        time_windows: windows
            .iter()
            .map(|(from, to)| TimeWindow::parse(from, to).unwrap())
            .collect(),
        output_root: root.to_path_buf(),
        qa_min_obs_per_cell: 1,
        workers: 4,
        ..Config::default()
    };
    config.transport.min_interval_ms = 0;
    config.transport.max_retries = 0;
    config.adaptive.max_chunk_depth = 0;
    config.adaptive.window_retries = 0;
    config
}
