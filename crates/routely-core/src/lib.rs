//! routely-core: Core library for Routely
//!
//! Collects historical service-performance records from a rate-limited,
//! unreliable upstream API, turns them into per-route/per-hour delay
//! percentiles and certifies the result against data-quality gates.
//!
//! # Architecture
//!
//! ```text
//! Planner → Orchestrator ⇄ StateStore (SQLite)
//!               ↓
//!   AdaptiveWindowFetcher → RateLimitedTransport → upstream
//!               ↓                 ↑
//!        DetailCollector ── CircuitRegistry
//!               ↓
//!   SliceWriter → Aggregator → QA
//! ```
//!
//! # Modules
//!
//! - `config`: Configuration loading and validation
//! - `error`: Error types with remediation hints
//! - `logging`: Structured logging setup
//! - `window`, `task`, `record`: Data model
//! - `transport`: Throttled, retrying upstream transport
//! - `rate_limit`, `retry`: Minimum-interval limiter and backoff policy
//! - `api`: Request payloads and response decoding
//! - `window_fetch`: Adaptive window splitting for metrics calls
//! - `circuit_breaker`: Per-key cooldown on hostile responses
//! - `sampling`: Deduplication and deterministic per-hour sampling
//! - `pool`: Bounded worker pool and politeness pause
//! - `detail_collector`: Concurrent detail lookups
//! - `planner`: Task expansion
//! - `state_store`: Durable task state
//! - `slice_writer`: Per-task records and execution logs
//! - `aggregate`, `qa`: Percentile table and quality gate
//! - `orchestrator`: Task state machine and run summary
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod aggregate;
pub mod api;
pub mod circuit_breaker;
pub mod config;
pub mod detail_collector;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod planner;
pub mod pool;
pub mod qa;
pub mod rate_limit;
pub mod record;
pub mod retry;
pub mod sampling;
pub mod slice_writer;
pub mod state_store;
pub mod task;
pub mod transport;
pub mod window;
pub mod window_fetch;

pub use error::{Error, Result};

/// Crate version, used in the default user agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
