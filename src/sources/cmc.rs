//! CoinMarketCap adapter
//!
//! Pulls `/v1/cryptocurrency/listings/latest` and keeps tag-identified
//! stablecoins and tokenized assets. Requires an API key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::config::SourceSettings;
use crate::sources::{RateLimitInfo, SourceCapabilities, SourceError, StablecoinSource};
use crate::types::{
    finite_opt, AssetCategory, AssetMetadata, MarketData, PlatformEntry, SourceId,
    StandardizedAssetRecord, SupplyData,
};

const CMC_BASE_URL: &str = "https://pro-api.coinmarketcap.com";
const CMC_LISTING_LIMIT: u32 = 500;

/// Static trust weight for CoinMarketCap data
const CMC_TRUST: f64 = 0.90;

pub struct CmcSource {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl CmcSource {
    pub fn new(settings: &SourceSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key: settings.api_key(),
            base_url: CMC_BASE_URL.trim_end_matches('/').to_string(),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: Some("test-key".to_string()),
            base_url: CMC_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CmcListingResponse {
    #[serde(default)]
    data: Vec<CmcAsset>,
}

#[derive(Debug, Deserialize)]
struct CmcAsset {
    id: Option<u64>,
    name: Option<String>,
    symbol: Option<String>,
    slug: Option<String>,
    cmc_rank: Option<u32>,
    date_added: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: Vec<String>,
    platform: Option<CmcPlatform>,
    circulating_supply: Option<f64>,
    total_supply: Option<f64>,
    max_supply: Option<f64>,
    quote: Option<CmcQuote>,
}

#[derive(Debug, Deserialize)]
struct CmcPlatform {
    name: Option<String>,
    token_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CmcQuote {
    #[serde(rename = "USD")]
    usd: Option<CmcUsdQuote>,
}

#[derive(Debug, Deserialize)]
struct CmcUsdQuote {
    price: Option<f64>,
    volume_24h: Option<f64>,
    percent_change_24h: Option<f64>,
    market_cap: Option<f64>,
}

/// Infer what the asset is pegged to from CMC tags
fn peg_from_tags(tags: &BTreeSet<String>) -> Option<String> {
    if tags.contains("usd-stablecoin") {
        Some("USD".to_string())
    } else if tags.contains("eur-stablecoin") {
        Some("EUR".to_string())
    } else if tags.contains("gbp-stablecoin") {
        Some("GBP".to_string())
    } else if tags.contains("tokenized-gold") || tags.contains("gold") {
        Some("XAU".to_string())
    } else if tags.contains("stablecoin") {
        Some("USD".to_string())
    } else {
        None
    }
}

fn category_from_tags(tags: &BTreeSet<String>) -> AssetCategory {
    if tags.contains("tokenized-gold") || tags.contains("tokenized-assets") || tags.contains("gold")
    {
        AssetCategory::TokenizedAsset
    } else {
        AssetCategory::Stablecoin
    }
}

fn is_tracked(tags: &BTreeSet<String>) -> bool {
    tags.contains("stablecoin")
        || tags.contains("tokenized-gold")
        || tags.contains("tokenized-assets")
}

impl CmcSource {
    fn standardize(&self, asset: CmcAsset, now: DateTime<Utc>) -> Option<StandardizedAssetRecord> {
        let name = asset.name?.trim().to_string();
        let symbol = asset.symbol?.trim().to_uppercase();
        if name.is_empty() || symbol.is_empty() {
            return None;
        }

        let tags: BTreeSet<String> = asset.tags.iter().map(|t| t.to_lowercase()).collect();
        if !is_tracked(&tags) {
            return None;
        }

        let quote = asset.quote.and_then(|q| q.usd);
        let (price, volume, change, cap) = match quote {
            Some(q) => (
                finite_opt(q.price),
                finite_opt(q.volume_24h),
                finite_opt(q.percent_change_24h),
                finite_opt(q.market_cap),
            ),
            None => (None, None, None, None),
        };

        let platforms = asset
            .platform
            .and_then(|p| {
                let network = p.name?.trim().to_string();
                if network.is_empty() {
                    return None;
                }
                Some(PlatformEntry {
                    name: network.clone(),
                    network,
                    contract_address: p.token_address,
                    supply: None,
                    percentage: None,
                })
            })
            .into_iter()
            .collect();

        let logo_url = asset
            .id
            .map(|id| format!("https://s2.coinmarketcap.com/static/img/coins/64x64/{id}.png"));

        Some(StandardizedAssetRecord {
            source_id: SourceId::Cmc,
            slug: asset.slug.unwrap_or_else(|| symbol.to_lowercase()),
            asset_category: category_from_tags(&tags),
            market_data: MarketData {
                price,
                market_cap: cap,
                volume_24h: volume,
                percent_change_24h: change,
                rank: asset.cmc_rank,
            },
            supply_data: SupplyData {
                circulating: finite_opt(asset.circulating_supply),
                total: finite_opt(asset.total_supply),
                max: finite_opt(asset.max_supply),
                network_breakdown: Vec::new(),
            },
            platforms,
            metadata: AssetMetadata {
                pegged_asset: peg_from_tags(&tags),
                logo_url,
                date_added: asset.date_added,
                tags,
                description: None,
                website: None,
            },
            confidence: CMC_TRUST,
            timestamp: now,
            name,
            symbol,
        })
    }
}

#[async_trait]
impl StablecoinSource for CmcSource {
    fn source_id(&self) -> SourceId {
        SourceId::Cmc
    }

    fn source_name(&self) -> &'static str {
        "CoinMarketCap"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            priority: 10,
            has_network_breakdown: false,
            data_types: vec!["market", "supply", "metadata"],
        }
    }

    fn rate_limit_info(&self) -> RateLimitInfo {
        RateLimitInfo {
            requests_per_minute: 30,
            requires_api_key: true,
        }
    }

    async fn fetch_stablecoins(&self) -> Result<serde_json::Value, SourceError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| SourceError::Auth("CMC_API_KEY not configured".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            "X-CMC_PRO_API_KEY",
            HeaderValue::from_str(api_key)
                .map_err(|_| SourceError::Auth("invalid API key value".to_string()))?,
        );

        let url = format!(
            "{}/v1/cryptocurrency/listings/latest?limit={}&convert=USD",
            self.base_url, CMC_LISTING_LIMIT
        );

        let response = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(SourceError::from_reqwest)?;

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
        let parsed: CmcListingResponse = match serde_json::from_value(raw.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(source = "cmc", error = %e, "Failed to parse listing payload");
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_payload() -> serde_json::Value {
        json!({
            "data": [
                {
                    "id": 825,
                    "name": "Tether USDt",
                    "symbol": "USDT",
                    "slug": "tether",
                    "cmc_rank": 3,
                    "date_added": "2015-02-25T00:00:00.000Z",
                    "tags": ["stablecoin", "usd-stablecoin"],
                    "platform": {"name": "Ethereum", "token_address": "0xdac17f958d2ee523a2206206994597c13d831ec7"},
                    "circulating_supply": 83_000_000_000.0,
                    "total_supply": 85_000_000_000.0,
                    "max_supply": null,
                    "quote": {"USD": {"price": 1.0003, "volume_24h": 24_000_000_000.0, "percent_change_24h": 0.01, "market_cap": 83_000_000_000.0}}
                },
                {
                    "id": 1,
                    "name": "Bitcoin",
                    "symbol": "BTC",
                    "slug": "bitcoin",
                    "tags": ["mineable"],
                    "quote": {"USD": {"price": 64000.0}}
                },
                {
                    "id": 2,
                    "symbol": "NONAME",
                    "tags": ["stablecoin"]
                }
            ]
        })
    }

    #[test]
    fn test_transform_filters_untagged_and_malformed() {
        let source = CmcSource::for_tests();
        let records = source.transform_to_standard(&sample_payload(), Utc::now());

        assert_eq!(records.len(), 1);
        let usdt = &records[0];
        assert_eq!(usdt.symbol, "USDT");
        assert_eq!(usdt.slug, "tether");
        assert_eq!(usdt.market_data.price, Some(1.0003));
        assert_eq!(usdt.metadata.pegged_asset.as_deref(), Some("USD"));
        assert_eq!(usdt.asset_category, AssetCategory::Stablecoin);
        assert_eq!(usdt.platforms.len(), 1);
        assert_eq!(usdt.platforms[0].network, "Ethereum");
    }

    #[test]
    fn test_transform_is_idempotent() {
        let source = CmcSource::for_tests();
        let payload = sample_payload();
        let at = Utc::now();
        let first = source.transform_to_standard(&payload, at);
        let second = source.transform_to_standard(&payload, at);
        assert_eq!(first, second);
    }

    #[test]
    fn test_gold_tag_maps_to_tokenized_asset() {
        let source = CmcSource::for_tests();
        let payload = json!({
            "data": [{
                "id": 5176,
                "name": "PAX Gold",
                "symbol": "PAXG",
                "slug": "pax-gold",
                "tags": ["tokenized-gold", "stablecoin"],
                "quote": {"USD": {"price": 2350.0}}
            }]
        });
        let records = source.transform_to_standard(&payload, Utc::now());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].asset_category, AssetCategory::TokenizedAsset);
        assert_eq!(records[0].metadata.pegged_asset.as_deref(), Some("XAU"));
    }

    #[test]
    fn test_malformed_payload_yields_empty() {
        let source = CmcSource::for_tests();
        assert!(source
            .transform_to_standard(&json!({"data": "not-an-array"}), Utc::now())
            .is_empty());
        assert!(source
            .transform_to_standard(&json!(null), Utc::now())
            .is_empty());
    }
}
