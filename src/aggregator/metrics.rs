//! Market-wide rollups computed from a merged snapshot

use serde::Serialize;
use std::collections::BTreeMap;

use crate::aggregator::merge::AggregatedAsset;
use crate::types::AssetCategory;

/// Totals for one asset segment
#[derive(Debug, Clone, Default, Serialize)]
pub struct MarketMetrics {
    pub total_market_cap: f64,
    pub total_volume_24h: f64,
    pub asset_count: usize,
    pub total_market_cap_display: String,
    pub total_volume_display: String,
}

impl MarketMetrics {
    fn from_assets<'a>(assets: impl Iterator<Item = &'a AggregatedAsset>) -> Self {
        let mut total_market_cap = 0.0;
        let mut total_volume_24h = 0.0;
        let mut asset_count = 0usize;

        for asset in assets {
            asset_count += 1;
            if let Some(cap) = asset.market_data.market_cap.value {
                total_market_cap += cap;
            }
            if let Some(volume) = asset.market_data.volume_24h.value {
                total_volume_24h += volume;
            }
        }

        Self {
            total_market_cap,
            total_volume_24h,
            asset_count,
            total_market_cap_display: format_usd(total_market_cap),
            total_volume_display: format_usd(total_volume_24h),
        }
    }
}

/// Totals split by category plus the combined view
#[derive(Debug, Clone, Default, Serialize)]
pub struct SegmentedMetrics {
    pub stablecoins: MarketMetrics,
    pub tokenized_assets: MarketMetrics,
    pub combined: MarketMetrics,
}

pub fn compute_metrics(assets: &[AggregatedAsset]) -> SegmentedMetrics {
    SegmentedMetrics {
        stablecoins: MarketMetrics::from_assets(
            assets
                .iter()
                .filter(|a| a.asset_category == AssetCategory::Stablecoin),
        ),
        tokenized_assets: MarketMetrics::from_assets(
            assets
                .iter()
                .filter(|a| a.asset_category == AssetCategory::TokenizedAsset),
        ),
        combined: MarketMetrics::from_assets(assets.iter()),
    }
}

/// Per-network totals across all assets' chain breakdowns
#[derive(Debug, Clone, Serialize)]
pub struct PlatformRollup {
    pub network: String,
    pub total_circulating: f64,
    pub coin_count: usize,
    /// Top symbols on this network by chain circulating, largest first
    pub top_coins: Vec<String>,
    pub total_circulating_display: String,
}

pub fn compute_platform_rollups(assets: &[AggregatedAsset]) -> Vec<PlatformRollup> {
    // Keyed by lowercase network so "Ethereum" and "ethereum" fold together;
    // the first-seen casing is kept for display
    let mut by_network: BTreeMap<String, (String, f64, Vec<(String, f64)>)> = BTreeMap::new();

    for asset in assets {
        for chain in &asset.supply_data.network_breakdown {
            let amount = match chain.circulating {
                Some(amount) if amount > 0.0 => amount,
                _ => continue,
            };
            let key = chain.network.to_lowercase();
            let entry = by_network
                .entry(key)
                .or_insert_with(|| (chain.network.clone(), 0.0, Vec::new()));
            entry.1 += amount;
            entry.2.push((asset.symbol.clone(), amount));
        }
    }

    let mut rollups: Vec<PlatformRollup> = by_network
        .into_values()
        .map(|(network, total, mut coins)| {
            coins.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            let coin_count = coins.len();
            let top_coins = coins.into_iter().take(5).map(|(symbol, _)| symbol).collect();
            PlatformRollup {
                network,
                total_circulating: total,
                coin_count,
                top_coins,
                total_circulating_display: format_usd(total),
            }
        })
        .collect();

    rollups.sort_by(|a, b| {
        b.total_circulating
            .partial_cmp(&a.total_circulating)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.network.cmp(&b.network))
    });
    rollups
}

/// Human-readable dollar amount: $1.23T / $83.00B / $5.40M / $950.00K / $12.34
pub fn format_usd(value: f64) -> String {
    let abs = value.abs();
    if abs >= 1e12 {
        format!("${:.2}T", value / 1e12)
    } else if abs >= 1e9 {
        format!("${:.2}B", value / 1e9)
    } else if abs >= 1e6 {
        format!("${:.2}M", value / 1e6)
    } else if abs >= 1e3 {
        format!("${:.2}K", value / 1e3)
    } else {
        format!("${value:.2}")
    }
}
