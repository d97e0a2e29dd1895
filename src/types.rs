//! Core types used throughout stablewatch
//!
//! Defines the common per-source record shape every adapter produces and
//! the identity enums shared across the crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Supported upstream data sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Cmc,
    Messari,
    CoinGecko,
    DefiLlama,
}

impl SourceId {
    /// Stable lowercase identifier used in config, logs, and API output
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Cmc => "cmc",
            SourceId::Messari => "messari",
            SourceId::CoinGecko => "coingecko",
            SourceId::DefiLlama => "defillama",
        }
    }

    /// Parse from string (config values, route params)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cmc" | "coinmarketcap" => Some(SourceId::Cmc),
            "messari" => Some(SourceId::Messari),
            "coingecko" => Some(SourceId::CoinGecko),
            "defillama" | "llama" => Some(SourceId::DefiLlama),
            _ => None,
        }
    }

    /// All known source ids, in default priority order
    pub fn all() -> [SourceId; 4] {
        [
            SourceId::Cmc,
            SourceId::Messari,
            SourceId::DefiLlama,
            SourceId::CoinGecko,
        ]
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// High-level asset classification. Stablecoins rank before tokenized assets
/// in every sorted listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AssetCategory {
    Stablecoin,
    TokenizedAsset,
}

impl Default for AssetCategory {
    fn default() -> Self {
        AssetCategory::Stablecoin
    }
}

impl fmt::Display for AssetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetCategory::Stablecoin => write!(f, "Stablecoin"),
            AssetCategory::TokenizedAsset => write!(f, "Tokenized Asset"),
        }
    }
}

/// Sanitize a raw numeric into the finite-or-None invariant.
///
/// Every numeric that crosses an adapter boundary goes through here so the
/// merge engine never sees NaN or infinities; absence is always `None`.
pub fn finite(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

/// Sanitize an already-optional numeric
pub fn finite_opt(value: Option<f64>) -> Option<f64> {
    value.and_then(finite)
}

/// Per-chain circulating supply entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSupply {
    /// Network name as reported (e.g. "Ethereum", "Tron")
    pub network: String,
    /// Token contract address on that network, if known
    pub contract_address: Option<String>,
    /// Circulating supply on that network
    pub circulating: Option<f64>,
}

impl ChainSupply {
    /// Deduplication key: lowercase network + lowercase contract address
    pub fn dedup_key(&self) -> (String, String) {
        (
            self.network.to_lowercase(),
            self.contract_address
                .as_deref()
                .unwrap_or("")
                .to_lowercase(),
        )
    }
}

/// A blockchain/network the asset exists on, as reported by one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformEntry {
    pub name: String,
    pub network: String,
    pub contract_address: Option<String>,
    pub supply: Option<f64>,
    pub percentage: Option<f64>,
}

/// Market quote fields from one source. All nullable: `None` means the
/// source did not report the field, never "zero".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    pub price: Option<f64>,
    pub market_cap: Option<f64>,
    pub volume_24h: Option<f64>,
    pub percent_change_24h: Option<f64>,
    pub rank: Option<u32>,
}

/// Supply fields from one source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupplyData {
    pub circulating: Option<f64>,
    pub total: Option<f64>,
    pub max: Option<f64>,
    pub network_breakdown: Vec<ChainSupply>,
}

/// Descriptive metadata from one source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub tags: BTreeSet<String>,
    pub description: Option<String>,
    pub website: Option<String>,
    pub logo_url: Option<String>,
    pub date_added: Option<DateTime<Utc>>,
    /// What the coin claims to track ("USD", "EUR", "XAU", ...)
    pub pegged_asset: Option<String>,
}

/// The common shape every adapter standardizes into, one per source per
/// asset. This is the only shape the aggregation engine ever sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardizedAssetRecord {
    pub source_id: SourceId,
    pub name: String,
    pub symbol: String,
    pub slug: String,
    pub asset_category: AssetCategory,
    pub market_data: MarketData,
    pub supply_data: SupplyData,
    pub platforms: Vec<PlatformEntry>,
    pub metadata: AssetMetadata,
    /// Static per-source trust weight (0.8-0.9 range), independent of the
    /// per-asset confidence computed during merging
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl StandardizedAssetRecord {
    /// Merge key for this record: uppercase symbol, falling back to slug
    /// then name when the symbol is missing. `None` when no identity field
    /// is usable (the record is dropped from grouping).
    pub fn merge_key(&self) -> Option<String> {
        for candidate in [&self.symbol, &self.slug, &self.name] {
            let trimmed = candidate.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_uppercase());
            }
        }
        None
    }
}
