//! Presentation views
//!
//! Flattens merged assets into display-oriented shapes with formatted
//! amounts, peg deviation, and a letter confidence grade. Serialized as
//! camelCase for API consumers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregator::merge::AggregatedAsset;
use crate::aggregator::metrics::format_usd;
use crate::types::{AssetCategory, SourceId};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainView {
    pub network: String,
    pub circulating: Option<f64>,
    /// Share of the asset's total circulating supply, when computable
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetView {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub slug: String,
    pub image_url: Option<String>,
    pub category: AssetCategory,
    pub pegged_asset: Option<String>,
    pub price: Option<f64>,
    pub price_display: String,
    /// Signed deviation from a 1.0 peg, in basis points. Only meaningful
    /// for unit-pegged assets; omitted for commodity tokens.
    pub peg_deviation_bps: Option<f64>,
    pub market_cap: Option<f64>,
    pub market_cap_display: String,
    pub volume_24h: Option<f64>,
    pub volume_display: String,
    pub percent_change_24h: Option<f64>,
    pub circulating_supply: Option<f64>,
    pub network_count: usize,
    pub chains: Vec<ChainView>,
    pub tags: Vec<String>,
    pub confidence: f64,
    pub confidence_grade: char,
    pub consensus: f64,
    pub sources: Vec<SourceId>,
    pub has_conflicts: bool,
    pub warnings: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

/// Map an overall confidence score onto a coarse letter grade
pub fn confidence_grade(score: f64) -> char {
    if score >= 0.8 {
        'A'
    } else if score >= 0.6 {
        'B'
    } else if score >= 0.4 {
        'C'
    } else {
        'D'
    }
}

fn price_display(price: Option<f64>) -> String {
    match price {
        Some(p) => format!("${p:.4}"),
        None => "-".to_string(),
    }
}

pub fn asset_view(asset: &AggregatedAsset) -> AssetView {
    let price = asset.market_data.price.value;
    let market_cap = asset.market_data.market_cap.value;
    let volume = asset.market_data.volume_24h.value;
    let circulating = asset.supply_data.circulating.value;

    // Basis points off the unit peg, for fiat-pegged coins only
    let peg_deviation_bps = match (price, asset.asset_category) {
        (Some(p), AssetCategory::Stablecoin) => Some((p - 1.0) * 10_000.0),
        _ => None,
    };

    let chains: Vec<ChainView> = asset
        .supply_data
        .network_breakdown
        .iter()
        .map(|chain| ChainView {
            network: chain.network.clone(),
            circulating: chain.circulating,
            percentage: match (chain.circulating, circulating) {
                (Some(part), Some(total)) if total > 0.0 => Some(part / total * 100.0),
                _ => None,
            },
        })
        .collect();

    AssetView {
        id: asset.id.clone(),
        name: asset.name.clone(),
        symbol: asset.symbol.clone(),
        slug: asset.slug.clone(),
        image_url: asset.image_url.clone(),
        category: asset.asset_category,
        pegged_asset: asset.metadata.pegged_asset.value.clone(),
        price,
        price_display: price_display(price),
        peg_deviation_bps,
        market_cap,
        market_cap_display: market_cap.map(format_usd).unwrap_or_else(|| "-".to_string()),
        volume_24h: volume,
        volume_display: volume.map(format_usd).unwrap_or_else(|| "-".to_string()),
        percent_change_24h: asset.market_data.percent_change_24h.value,
        circulating_supply: circulating,
        network_count: chains.len(),
        chains,
        tags: asset.metadata.tags.iter().cloned().collect(),
        confidence: asset.confidence.overall,
        confidence_grade: confidence_grade(asset.confidence.overall),
        consensus: asset.confidence.consensus,
        sources: asset.data_sources.clone(),
        has_conflicts: !asset.metadata.conflicts.is_empty(),
        warnings: asset.quality.warnings.clone(),
        last_updated: asset.last_updated,
    }
}

pub fn asset_views(assets: &[AggregatedAsset]) -> Vec<AssetView> {
    assets.iter().map(asset_view).collect()
}
