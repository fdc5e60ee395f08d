#![forbid(unsafe_code)]
#![warn(unused, rust_2018_idioms)]

//! # Gamma-Data
//! Rate-limited option-chain ingestion for NSE/BSE underlyings, with an adaptive detector of
//! gamma-blast precursors.
//!
//! Two [`CadenceLoop`](scheduler::CadenceLoop)s poll an index set and an equity universe at
//! different cadences. Every fetched chain flows through
//! [`Fetcher::process_chain`](fetcher::Fetcher::process_chain):
//! * raw snapshot persisted through a [`SnapshotStore`](store::SnapshotStore)
//! * [`ChainMetrics`](chain::metrics::ChainMetrics) (GEX, zero-gamma, ATM, PCR, ITM ΔOI)
//! * time [`Derivatives`](derivative::Derivatives) against stored history
//! * [`BlastSignal`](signal::BlastSignal) from the tiered statistical [`detector`]
//! * weighted [`SentimentScore`](sentiment::SentimentScore) from bucketed PCR and leg build-up
//! * summary row upsert keyed by (time, symbol, expiry)

/// Market-hours predicate and expiry cache validity.
pub mod calendar;

/// Option chain records as served upstream, plus per-snapshot metrics.
pub mod chain;

/// Layered service configuration: defaults, TOML file, environment overrides.
pub mod config;

/// Bearer credential holder and refresh seam.
pub mod credential;

/// Duplicate-aware OI / IV / concentration time derivatives.
pub mod derivative;

/// Adaptive z-score / percentile / fallback precursor detector.
pub mod detector;

/// All [`Error`](std::error::Error)s generated in Gamma-Data.
pub mod error;

/// Nearest-expiry resolution with a per trading day cache.
pub mod expiry;

/// Batch-concurrent fetcher and the per-chain processing pipeline.
pub mod fetcher;

/// Process-wide operational counters.
pub mod health;

/// Symbols, their class, and the fast / slow universe split.
pub mod instrument;

/// Retry and backoff policy for upstream calls.
pub mod policy;

/// Dual-cadence market-hours gated loops and their failure budget.
pub mod scheduler;

/// Multi-factor market sentiment score.
pub mod sentiment;

/// Detector output.
pub mod signal;

/// Snapshot and summary persistence.
pub mod store;

/// Per (time, symbol, expiry) summary row.
pub mod summary;

/// Upstream market data API seam and the Upstox v2 client.
pub mod upstream;
