//! CoinGecko adapter
//!
//! Pulls `/api/v3/coins/markets` scoped to the stablecoins category. Works
//! without a key; a pro key raises the rate limit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::config::SourceSettings;
use crate::sources::{RateLimitInfo, SourceCapabilities, SourceError, StablecoinSource};
use crate::types::{
    finite_opt, AssetCategory, AssetMetadata, MarketData, SourceId, StandardizedAssetRecord,
    SupplyData,
};

const COINGECKO_BASE_URL: &str = "https://api.coingecko.com";

/// Static trust weight for CoinGecko data
const COINGECKO_TRUST: f64 = 0.80;

pub struct CoinGeckoSource {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl CoinGeckoSource {
    pub fn new(settings: &SourceSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key: settings.api_key(),
            base_url: COINGECKO_BASE_URL.trim_end_matches('/').to_string(),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: None,
            base_url: COINGECKO_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeckoMarket {
    id: Option<String>,
    symbol: Option<String>,
    name: Option<String>,
    image: Option<String>,
    current_price: Option<f64>,
    market_cap: Option<f64>,
    market_cap_rank: Option<u32>,
    total_volume: Option<f64>,
    price_change_percentage_24h: Option<f64>,
    circulating_supply: Option<f64>,
    total_supply: Option<f64>,
    max_supply: Option<f64>,
}

fn infer_peg(symbol: &str, name: &str) -> (String, AssetCategory) {
    let upper = symbol.to_uppercase();
    let name_lower = name.to_lowercase();
    if name_lower.contains("gold") || upper == "PAXG" || upper == "XAUT" {
        ("XAU".to_string(), AssetCategory::TokenizedAsset)
    } else if upper.contains("EUR") || name_lower.contains("euro") {
        ("EUR".to_string(), AssetCategory::Stablecoin)
    } else if upper.contains("GBP") {
        ("GBP".to_string(), AssetCategory::Stablecoin)
    } else {
        ("USD".to_string(), AssetCategory::Stablecoin)
    }
}

impl CoinGeckoSource {
    fn standardize(
        &self,
        market: GeckoMarket,
        now: DateTime<Utc>,
    ) -> Option<StandardizedAssetRecord> {
        let name = market.name?.trim().to_string();
        let symbol = market.symbol?.trim().to_uppercase();
        if name.is_empty() || symbol.is_empty() {
            return None;
        }

        let (pegged_asset, asset_category) = infer_peg(&symbol, &name);

        Some(StandardizedAssetRecord {
            source_id: SourceId::CoinGecko,
            slug: market.id.unwrap_or_else(|| symbol.to_lowercase()),
            asset_category,
            market_data: MarketData {
                price: finite_opt(market.current_price),
                market_cap: finite_opt(market.market_cap),
                volume_24h: finite_opt(market.total_volume),
                percent_change_24h: finite_opt(market.price_change_percentage_24h),
                rank: market.market_cap_rank,
            },
            supply_data: SupplyData {
                circulating: finite_opt(market.circulating_supply),
                total: finite_opt(market.total_supply),
                max: finite_opt(market.max_supply),
                network_breakdown: Vec::new(),
            },
            platforms: Vec::new(),
            metadata: AssetMetadata {
                tags: BTreeSet::from(["stablecoin".to_string()]),
                description: None,
                website: None,
                logo_url: market.image,
                date_added: None,
                pegged_asset: Some(pegged_asset),
            },
            confidence: COINGECKO_TRUST,
            timestamp: now,
            name,
            symbol,
        })
    }
}

#[async_trait]
impl StablecoinSource for CoinGeckoSource {
    fn source_id(&self) -> SourceId {
        SourceId::CoinGecko
    }

    fn source_name(&self) -> &'static str {
        "CoinGecko"
    }

    fn is_configured(&self) -> bool {
        // Public API, no key required
        true
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            priority: 6,
            has_network_breakdown: false,
            data_types: vec!["market", "supply", "metadata"],
        }
    }

    fn rate_limit_info(&self) -> RateLimitInfo {
        RateLimitInfo {
            requests_per_minute: if self.api_key.is_some() { 500 } else { 10 },
            requires_api_key: false,
        }
    }

    async fn fetch_stablecoins(&self) -> Result<serde_json::Value, SourceError> {
        let url = format!(
            "{}/api/v3/coins/markets?vs_currency=usd&category=stablecoins&order=market_cap_desc&per_page=250&page=1",
            self.base_url
        );

        let mut request = self.client.get(&url);
        if let Some(key) = self.api_key.as_deref() {
            request = request.header("x-cg-pro-api-key", key);
        }

        let response = request.send().await.map_err(SourceError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(SourceError::from_status(response.status()));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))
    }

    fn transform_to_standard(
        &self,
        raw: &serde_json::Value,
        fetched_at: DateTime<Utc>,
    ) -> Vec<StandardizedAssetRecord> {
        let parsed: Vec<GeckoMarket> = match serde_json::from_value(raw.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(source = "coingecko", error = %e, "Failed to parse markets payload");
                return Vec::new();
            }
        };

        parsed
            .into_iter()
            .filter_map(|market| self.standardize(market, fetched_at))
            .collect()
    }
}
