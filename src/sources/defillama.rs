//! DeFiLlama stablecoins adapter
//!
//! Pulls `https://stablecoins.llama.fi/stablecoins?includePrices=true`. The
//! only source with chain-level circulating supply, which makes it the
//! default authoritative chain-data provider for the breakdown merge.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::config::SourceSettings;
use crate::sources::{RateLimitInfo, SourceCapabilities, SourceError, StablecoinSource};
use crate::types::{
    finite, finite_opt, AssetCategory, AssetMetadata, ChainSupply, MarketData, PlatformEntry,
    SourceId, StandardizedAssetRecord, SupplyData,
};

const LLAMA_BASE_URL: &str = "https://stablecoins.llama.fi";

/// Static trust weight for DeFiLlama data
const LLAMA_TRUST: f64 = 0.85;

pub struct DefiLlamaSource {
    client: reqwest::Client,
    base_url: String,
}

impl DefiLlamaSource {
    pub fn new(settings: &SourceSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: LLAMA_BASE_URL.trim_end_matches('/').to_string(),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: LLAMA_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LlamaResponse {
    #[serde(rename = "peggedAssets", default)]
    pegged_assets: Vec<LlamaAsset>,
}

#[derive(Debug, Deserialize)]
struct LlamaAsset {
    name: Option<String>,
    symbol: Option<String>,
    #[serde(rename = "gecko_id")]
    gecko_id: Option<String>,
    #[serde(rename = "pegType")]
    peg_type: Option<String>,
    #[serde(rename = "pegMechanism")]
    peg_mechanism: Option<String>,
    price: Option<f64>,
    /// Totals keyed by peg type, e.g. {"peggedUSD": 83e9}
    #[serde(default)]
    circulating: BTreeMap<String, f64>,
    #[serde(rename = "chainCirculating", default)]
    chain_circulating: BTreeMap<String, LlamaChainEntry>,
}

#[derive(Debug, Deserialize)]
struct LlamaChainEntry {
    #[serde(default)]
    current: BTreeMap<String, f64>,
}

/// Map a llama pegType ("peggedUSD") to the tracked currency/commodity
fn peg_from_type(peg_type: &str) -> Option<(String, AssetCategory)> {
    let stripped = peg_type.strip_prefix("pegged")?;
    match stripped {
        "USD" | "EUR" | "GBP" | "JPY" | "CHF" | "CNY" | "CAD" | "AUD" => {
            Some((stripped.to_string(), AssetCategory::Stablecoin))
        }
        "XAU" | "Gold" => Some(("XAU".to_string(), AssetCategory::TokenizedAsset)),
        // Variable-peg assets are not stable; exclude them
        "VAR" => None,
        other => Some((other.to_uppercase(), AssetCategory::Stablecoin)),
    }
}

fn peg_amount(map: &BTreeMap<String, f64>, peg_type: &str) -> Option<f64> {
    map.get(peg_type)
        .copied()
        .or_else(|| map.values().next().copied())
        .and_then(finite)
}

impl DefiLlamaSource {
    fn standardize(&self, asset: LlamaAsset, now: DateTime<Utc>) -> Option<StandardizedAssetRecord> {
        let name = asset.name?.trim().to_string();
        let symbol = asset.symbol?.trim().to_uppercase();
        if name.is_empty() || symbol.is_empty() {
            return None;
        }

        let peg_type = asset.peg_type.as_deref().unwrap_or("");
        let (pegged_asset, asset_category) = peg_from_type(peg_type)?;

        let price = finite_opt(asset.price);
        let circulating = peg_amount(&asset.circulating, peg_type);
        // Llama reports circulating in peg units; for USD pegs the dollar
        // market cap is circulating times price
        let market_cap = match (price, circulating) {
            (Some(p), Some(c)) => finite(p * c),
            _ => None,
        };

        let network_breakdown: Vec<ChainSupply> = asset
            .chain_circulating
            .iter()
            .filter_map(|(chain, entry)| {
                let amount = peg_amount(&entry.current, peg_type)?;
                Some(ChainSupply {
                    network: chain.clone(),
                    contract_address: None,
                    circulating: Some(amount),
                })
            })
            .collect();

        let platforms = network_breakdown
            .iter()
            .map(|chain| PlatformEntry {
                name: chain.network.clone(),
                network: chain.network.clone(),
                contract_address: None,
                supply: chain.circulating,
                percentage: match (chain.circulating, circulating) {
                    (Some(part), Some(total)) if total > 0.0 => finite(part / total * 100.0),
                    _ => None,
                },
            })
            .collect();

        let mut tags = BTreeSet::from(["stablecoin".to_string()]);
        if let Some(mechanism) = asset.peg_mechanism.as_deref() {
            if !mechanism.trim().is_empty() {
                tags.insert(mechanism.trim().to_lowercase());
            }
        }

        Some(StandardizedAssetRecord {
            source_id: SourceId::DefiLlama,
            slug: asset.gecko_id.unwrap_or_else(|| symbol.to_lowercase()),
            asset_category,
            market_data: MarketData {
                price,
                market_cap,
                volume_24h: None,
                percent_change_24h: None,
                rank: None,
            },
            supply_data: SupplyData {
                circulating,
                total: None,
                max: None,
                network_breakdown,
            },
            platforms,
            metadata: AssetMetadata {
                tags,
                description: None,
                website: None,
                logo_url: None,
                date_added: None,
                pegged_asset: Some(pegged_asset),
            },
            confidence: LLAMA_TRUST,
            timestamp: now,
            name,
            symbol,
        })
    }
}

#[async_trait]
impl StablecoinSource for DefiLlamaSource {
    fn source_id(&self) -> SourceId {
        SourceId::DefiLlama
    }

    fn source_name(&self) -> &'static str {
        "DeFiLlama"
    }

    fn is_configured(&self) -> bool {
        // Public API, no key required
        true
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            priority: 7,
            has_network_breakdown: true,
            data_types: vec!["market", "supply", "chains"],
        }
    }

    fn rate_limit_info(&self) -> RateLimitInfo {
        RateLimitInfo {
            requests_per_minute: 60,
            requires_api_key: false,
        }
    }

    async fn fetch_stablecoins(&self) -> Result<serde_json::Value, SourceError> {
        let url = format!("{}/stablecoins?includePrices=true", self.base_url);

        let response = self
            .client
            .get(&url)
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
        let parsed: LlamaResponse = match serde_json::from_value(raw.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(source = "defillama", error = %e, "Failed to parse stablecoins payload");
                return Vec::new();
            }
        };

        parsed
            .pegged_assets
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
            "peggedAssets": [
                {
                    "name": "Tether",
                    "symbol": "USDT",
                    "gecko_id": "tether",
                    "pegType": "peggedUSD",
                    "pegMechanism": "fiat-backed",
                    "price": 1.001,
                    "circulating": {"peggedUSD": 83_000_000_000.0},
                    "chainCirculating": {
                        "Ethereum": {"current": {"peggedUSD": 39_000_000_000.0}},
                        "Tron": {"current": {"peggedUSD": 44_000_000_000.0}}
                    }
                },
                {
                    "name": "Volatile Thing",
                    "symbol": "VOLT",
                    "pegType": "peggedVAR",
                    "price": 0.85,
                    "circulating": {"peggedVAR": 10_000_000.0}
                },
                {
                    "symbol": "NONAME",
                    "pegType": "peggedUSD"
                }
            ]
        })
    }

    #[test]
    fn test_transform_builds_chain_breakdown() {
        let source = DefiLlamaSource::for_tests();
        let records = source.transform_to_standard(&sample_payload(), Utc::now());

        assert_eq!(records.len(), 1);
        let usdt = &records[0];
        assert_eq!(usdt.symbol, "USDT");
        assert_eq!(usdt.supply_data.circulating, Some(83_000_000_000.0));
        assert_eq!(usdt.supply_data.network_breakdown.len(), 2);

        let eth = usdt
            .supply_data
            .network_breakdown
            .iter()
            .find(|c| c.network == "Ethereum")
            .unwrap();
        assert_eq!(eth.circulating, Some(39_000_000_000.0));

        // Market cap derived from price * circulating
        let cap = usdt.market_data.market_cap.unwrap();
        assert!((cap - 83_083_000_000.0).abs() < 1.0);

        // Platform percentages computed against the total
        let tron = usdt.platforms.iter().find(|p| p.network == "Tron").unwrap();
        assert!((tron.percentage.unwrap() - 53.01).abs() < 0.1);
    }

    #[test]
    fn test_variable_peg_excluded() {
        let source = DefiLlamaSource::for_tests();
        let records = source.transform_to_standard(&sample_payload(), Utc::now());
        assert!(!records.iter().any(|r| r.symbol == "VOLT"));
    }

    #[test]
    fn test_peg_type_mapping() {
        assert_eq!(
            peg_from_type("peggedEUR"),
            Some(("EUR".to_string(), AssetCategory::Stablecoin))
        );
        assert_eq!(peg_from_type("peggedVAR"), None);
        assert_eq!(peg_from_type("notapeg"), None);
    }
}
