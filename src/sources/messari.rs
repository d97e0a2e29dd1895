//! Messari adapter
//!
//! Pulls `/api/v2/assets` with market-data, marketcap, and supply metric
//! fields and keeps assets in the Stablecoins sector. An API key is
//! optional but lifts the anonymous rate limit.

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

const MESSARI_BASE_URL: &str = "https://data.messari.io";
const MESSARI_PAGE_LIMIT: u32 = 500;

/// Static trust weight for Messari data
const MESSARI_TRUST: f64 = 0.85;

pub struct MessariSource {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl MessariSource {
    pub fn new(settings: &SourceSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key: settings.api_key(),
            base_url: MESSARI_BASE_URL.trim_end_matches('/').to_string(),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: None,
            base_url: MESSARI_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessariResponse {
    #[serde(default)]
    data: Vec<MessariAsset>,
}

#[derive(Debug, Deserialize)]
struct MessariAsset {
    name: Option<String>,
    symbol: Option<String>,
    slug: Option<String>,
    profile: Option<MessariProfile>,
    metrics: Option<MessariMetrics>,
}

#[derive(Debug, Deserialize)]
struct MessariProfile {
    general: Option<MessariGeneral>,
}

#[derive(Debug, Deserialize)]
struct MessariGeneral {
    overview: Option<MessariOverview>,
}

#[derive(Debug, Deserialize)]
struct MessariOverview {
    sector: Option<String>,
    tagline: Option<String>,
    project_details: Option<String>,
    #[serde(default)]
    official_links: Vec<MessariLink>,
}

#[derive(Debug, Deserialize)]
struct MessariLink {
    name: Option<String>,
    link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessariMetrics {
    market_data: Option<MessariMarketData>,
    marketcap: Option<MessariMarketcap>,
    supply: Option<MessariSupply>,
}

#[derive(Debug, Deserialize)]
struct MessariMarketData {
    price_usd: Option<f64>,
    volume_last_24_hours: Option<f64>,
    percent_change_usd_last_24_hours: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MessariMarketcap {
    rank: Option<u32>,
    current_marketcap_usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MessariSupply {
    circulating: Option<f64>,
    liquid: Option<f64>,
    y_2050: Option<f64>,
}

/// Gold-backed tokens Messari still files under Stablecoins
const GOLD_SYMBOLS: [&str; 3] = ["PAXG", "XAUT", "KAU"];

fn infer_peg(symbol: &str, name: &str) -> (String, AssetCategory) {
    let upper = symbol.to_uppercase();
    let name_lower = name.to_lowercase();
    if GOLD_SYMBOLS.contains(&upper.as_str()) || name_lower.contains("gold") {
        ("XAU".to_string(), AssetCategory::TokenizedAsset)
    } else if upper.contains("EUR") || name_lower.contains("euro") {
        ("EUR".to_string(), AssetCategory::Stablecoin)
    } else if upper.contains("GBP") {
        ("GBP".to_string(), AssetCategory::Stablecoin)
    } else {
        ("USD".to_string(), AssetCategory::Stablecoin)
    }
}

impl MessariSource {
    fn standardize(
        &self,
        asset: MessariAsset,
        now: DateTime<Utc>,
    ) -> Option<StandardizedAssetRecord> {
        let name = asset.name?.trim().to_string();
        let symbol = asset.symbol?.trim().to_uppercase();
        if name.is_empty() || symbol.is_empty() {
            return None;
        }

        let overview = asset
            .profile
            .and_then(|p| p.general)
            .and_then(|g| g.overview);

        let sector = overview
            .as_ref()
            .and_then(|o| o.sector.as_deref())
            .unwrap_or("");
        if !sector.eq_ignore_ascii_case("stablecoins") {
            return None;
        }

        let metrics = asset.metrics;
        let market = metrics.as_ref().and_then(|m| m.market_data.as_ref());
        let cap = metrics.as_ref().and_then(|m| m.marketcap.as_ref());
        let supply = metrics.as_ref().and_then(|m| m.supply.as_ref());

        let description = overview.as_ref().and_then(|o| {
            o.project_details
                .clone()
                .or_else(|| o.tagline.clone())
                .filter(|s| !s.trim().is_empty())
        });
        let website = overview.as_ref().and_then(|o| {
            o.official_links.iter().find_map(|l| {
                let is_website = l
                    .name
                    .as_deref()
                    .map(|n| n.eq_ignore_ascii_case("website"))
                    .unwrap_or(false);
                if is_website {
                    l.link.clone()
                } else {
                    None
                }
            })
        });

        let (pegged_asset, asset_category) = infer_peg(&symbol, &name);

        Some(StandardizedAssetRecord {
            source_id: SourceId::Messari,
            slug: asset.slug.unwrap_or_else(|| symbol.to_lowercase()),
            asset_category,
            market_data: MarketData {
                price: finite_opt(market.and_then(|m| m.price_usd)),
                market_cap: finite_opt(cap.and_then(|c| c.current_marketcap_usd)),
                volume_24h: finite_opt(market.and_then(|m| m.volume_last_24_hours)),
                percent_change_24h: finite_opt(
                    market.and_then(|m| m.percent_change_usd_last_24_hours),
                ),
                rank: cap.and_then(|c| c.rank),
            },
            supply_data: SupplyData {
                circulating: finite_opt(
                    supply.and_then(|s| s.circulating.or(s.liquid)),
                ),
                total: finite_opt(supply.and_then(|s| s.y_2050)),
                max: None,
                network_breakdown: Vec::new(),
            },
            platforms: Vec::new(),
            metadata: AssetMetadata {
                tags: BTreeSet::from(["stablecoin".to_string()]),
                description,
                website,
                logo_url: None,
                date_added: None,
                pegged_asset: Some(pegged_asset),
            },
            confidence: MESSARI_TRUST,
            timestamp: now,
            name,
            symbol,
        })
    }
}

#[async_trait]
impl StablecoinSource for MessariSource {
    fn source_id(&self) -> SourceId {
        SourceId::Messari
    }

    fn source_name(&self) -> &'static str {
        "Messari"
    }

    fn is_configured(&self) -> bool {
        // Anonymous access is allowed, just rate-limited harder
        true
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            priority: 8,
            has_network_breakdown: false,
            data_types: vec!["market", "supply", "metadata"],
        }
    }

    fn rate_limit_info(&self) -> RateLimitInfo {
        RateLimitInfo {
            requests_per_minute: if self.api_key.is_some() { 30 } else { 20 },
            requires_api_key: false,
        }
    }

    async fn fetch_stablecoins(&self) -> Result<serde_json::Value, SourceError> {
        let url = format!(
            "{}/api/v2/assets?limit={}&fields=name,symbol,slug,profile/general/overview,metrics/market_data,metrics/marketcap,metrics/supply",
            self.base_url, MESSARI_PAGE_LIMIT
        );

        let mut request = self.client.get(&url);
        if let Some(key) = self.api_key.as_deref() {
            request = request.header("x-messari-api-key", key);
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
        let parsed: MessariResponse = match serde_json::from_value(raw.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(source = "messari", error = %e, "Failed to parse assets payload");
                return Vec::new();
            }
        };

        parsed
            .data
            .into_iter()
            .filter_map(|asset| self.standardize(asset, fetched_at))
            .collect()
    }
}
