//! Source adapters (CoinMarketCap, Messari, CoinGecko, DeFiLlama)
//!
//! Each adapter fetches one upstream API and standardizes its payload into
//! `StandardizedAssetRecord`s. The fetch half may fail and is categorized
//! into `SourceError`; the transform half is pure and skips malformed
//! entries instead of failing.

mod cmc;
mod coingecko;
mod defillama;
mod messari;
mod registry;

pub use cmc::CmcSource;
pub use coingecko::CoinGeckoSource;
pub use defillama::DefiLlamaSource;
pub use messari::MessariSource;
pub use registry::SourceRegistry;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::types::{AssetCategory, SourceId, StandardizedAssetRecord};

/// Categorized failure from a source fetch
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("rate limited")]
    RateLimited,
    #[error("request timed out")]
    Timeout,
    #[error("server error (status {status})")]
    Server { status: u16 },
    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl SourceError {
    /// Stable label for health records and logs
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Network(_) => "network",
            SourceError::Auth(_) => "auth",
            SourceError::RateLimited => "rate_limit",
            SourceError::Timeout => "timeout",
            SourceError::Server { .. } => "server",
            SourceError::Parse(_) => "parse",
        }
    }

    /// Whether a retry in a later cycle can plausibly succeed without
    /// operator intervention
    pub fn retryable(&self) -> bool {
        !matches!(self, SourceError::Auth(_))
    }

    /// HTTP status carried by the error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SourceError::Auth(_) => Some(401),
            SourceError::RateLimited => Some(429),
            SourceError::Server { status } => Some(*status),
            _ => None,
        }
    }

    /// Categorize a reqwest transport error
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Timeout
        } else if err.is_decode() {
            SourceError::Parse(err.to_string())
        } else {
            SourceError::Network(err.to_string())
        }
    }

    /// Categorize a non-success HTTP status
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            401 | 403 => SourceError::Auth(format!("status {}", status.as_u16())),
            429 => SourceError::RateLimited,
            code if code >= 500 => SourceError::Server { status: code },
            code => SourceError::Network(format!("unexpected status {code}")),
        }
    }
}

/// What a source can contribute to the merge
#[derive(Debug, Clone, Serialize)]
pub struct SourceCapabilities {
    /// Merge priority ordinal; higher wins field selection. Overridable
    /// via per-source config.
    pub priority: u8,
    /// Whether the source reports chain-level supply breakdowns
    pub has_network_breakdown: bool,
    /// Data categories this source contributes
    pub data_types: Vec<&'static str>,
}

/// Advertised rate limit of the upstream API
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitInfo {
    pub requests_per_minute: u32,
    pub requires_api_key: bool,
}

/// The contract every data source plugs in through.
///
/// `fetch_stablecoins` performs the network call and may fail;
/// `transform_to_standard` is pure and total — malformed individual entries
/// are skipped, never fatal.
#[async_trait]
pub trait StablecoinSource: Send + Sync {
    fn source_id(&self) -> SourceId;

    fn source_name(&self) -> &'static str;

    /// Whether required configuration (API keys) is present
    fn is_configured(&self) -> bool;

    fn capabilities(&self) -> SourceCapabilities;

    fn rate_limit_info(&self) -> RateLimitInfo;

    /// Fetch the raw upstream payload
    async fn fetch_stablecoins(&self) -> Result<serde_json::Value, SourceError>;

    /// Standardize the raw payload. Pure: the same (payload, fetched_at)
    /// pair always yields identical output.
    fn transform_to_standard(
        &self,
        raw: &serde_json::Value,
        fetched_at: chrono::DateTime<chrono::Utc>,
    ) -> Vec<StandardizedAssetRecord>;
}

/// Sanity band for quoted stablecoin prices, guarding against mistagged
/// assets (a "stablecoin" quoted at $45 is not one).
#[derive(Debug, Clone, Copy)]
pub struct PriceBand {
    pub min: f64,
    pub max: f64,
}

impl PriceBand {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.min && price <= self.max
    }
}

/// Apply the price-band sanity filter, yielding cooperatively for large
/// payloads so filtering does not starve concurrent fetches.
///
/// Records with no quoted price pass through: absence of a quote is not
/// evidence of mistagging. Tokenized commodities also pass through; the
/// band only makes sense for unit-pegged coins.
pub async fn apply_price_band(
    records: Vec<StandardizedAssetRecord>,
    band: PriceBand,
    large_payload_threshold: usize,
    chunk_size: usize,
) -> Vec<StandardizedAssetRecord> {
    let chunked = records.len() > large_payload_threshold;
    let mut kept = Vec::with_capacity(records.len());
    let mut since_yield = 0usize;

    for record in records {
        let in_band = match (record.asset_category, record.market_data.price) {
            (AssetCategory::Stablecoin, Some(price)) => band.contains(price),
            _ => true,
        };
        if in_band {
            kept.push(record);
        } else {
            tracing::debug!(
                source = %record.source_id,
                symbol = %record.symbol,
                price = ?record.market_data.price,
                "Dropping asset quoted outside price band"
            );
        }

        since_yield += 1;
        if chunked && since_yield >= chunk_size.max(1) {
            since_yield = 0;
            tokio::task::yield_now().await;
        }
    }

    kept
}
