//! stablewatch - multi-source stablecoin market data aggregation
//!
//! Fetches stablecoin and tokenized-asset market data from several public
//! APIs, standardizes each source's records into a common shape, and merges
//! them into a single view with field-level provenance, confidence scoring,
//! conflict detection, and per-source health monitoring.

pub mod aggregator;
pub mod config;
pub mod health;
pub mod sources;
pub mod types;
pub mod view;

#[cfg(feature = "api")]
pub mod api;
