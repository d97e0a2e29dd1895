//! Symbol-keyed merge algorithm
//!
//! Groups standardized records by symbol, resolves each field by source
//! priority with provenance, computes consensus/confidence scores, merges
//! network breakdowns, and detects cross-source conflicts. All iteration
//! is over ordered collections so the merge is a pure, deterministic
//! function of (records, settings).

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{
    AssetCategory, ChainSupply, SourceId, StandardizedAssetRecord,
};

/// A chosen value plus the source it was chosen from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourcedValue<T> {
    pub value: Option<T>,
    pub source: Option<SourceId>,
}

impl<T> SourcedValue<T> {
    pub fn none() -> Self {
        Self {
            value: None,
            source: None,
        }
    }

    pub fn chosen(value: T, source: SourceId) -> Self {
        Self {
            value: Some(value),
            source: Some(source),
        }
    }

    pub fn is_some(&self) -> bool {
        self.value.is_some()
    }
}

impl<T> Default for SourcedValue<T> {
    fn default() -> Self {
        Self::none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatedMarketData {
    pub price: SourcedValue<f64>,
    pub market_cap: SourcedValue<f64>,
    pub volume_24h: SourcedValue<f64>,
    pub percent_change_24h: SourcedValue<f64>,
    pub rank: SourcedValue<u32>,
    /// Every source's reported price, for transparency/debugging
    pub source_prices: BTreeMap<SourceId, f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatedSupplyData {
    pub circulating: SourcedValue<f64>,
    pub total: SourcedValue<f64>,
    pub max: SourcedValue<f64>,
    /// De-duplicated union of per-chain supply entries
    pub network_breakdown: Vec<ChainSupply>,
}

/// Structured record of a field where sources disagreed
#[derive(Debug, Clone, Serialize)]
pub struct FieldConflict {
    pub field: String,
    pub values_by_source: BTreeMap<SourceId, String>,
    /// Sorted distinct normalized values
    pub normalized: Vec<String>,
    pub conflict_count: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatedMetadata {
    /// Union of tags across all sources
    pub tags: BTreeSet<String>,
    pub description: SourcedValue<String>,
    pub website: SourcedValue<String>,
    pub date_added: SourcedValue<DateTime<Utc>>,
    pub pegged_asset: SourcedValue<String>,
    pub conflicts: Vec<FieldConflict>,
}

/// Confidence sub-scores, all in [0, 1]
#[derive(Debug, Clone, Serialize)]
pub struct ConfidenceScores {
    pub overall: f64,
    pub market_data: f64,
    pub supply_data: f64,
    pub platform_data: f64,
    pub consensus: f64,
    pub source_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityFlags {
    pub has_recent_data: bool,
    pub has_multiple_sources: bool,
    pub has_market_data: bool,
    pub has_supply_data: bool,
    pub warnings: Vec<String>,
    pub missing_fields: Vec<String>,
}

/// One merged entity per symbol, with field-level provenance
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedAsset {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub slug: String,
    pub image_url: Option<String>,
    pub asset_category: AssetCategory,
    pub market_data: AggregatedMarketData,
    pub supply_data: AggregatedSupplyData,
    pub metadata: AggregatedMetadata,
    pub confidence: ConfidenceScores,
    /// Deduplicated contributing sources, sorted
    pub data_sources: Vec<SourceId>,
    pub quality: QualityFlags,
    pub last_updated: DateTime<Utc>,
}

/// Everything the merge needs besides the records themselves
#[derive(Debug, Clone)]
pub struct MergeSettings {
    /// Effective priority per source: capability-declared unless overridden
    pub priorities: BTreeMap<SourceId, u8>,
    /// Source whose chain breakdown is used exclusively when populated
    pub chain_data_source: Option<SourceId>,
    /// Relative deviation from the median at which consensus reaches 0
    pub consensus_max_deviation: f64,
    /// Records older than this fail the has_recent_data quality check
    pub stale_after: Duration,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            priorities: BTreeMap::new(),
            chain_data_source: Some(SourceId::DefiLlama),
            consensus_max_deviation: 0.05,
            stale_after: Duration::minutes(15),
        }
    }
}

impl MergeSettings {
    pub fn effective_priority(&self, id: SourceId) -> u8 {
        self.priorities.get(&id).copied().unwrap_or(0)
    }
}

/// Merge output plus the cycle's conflict tallies for the health monitor
#[derive(Debug, Clone)]
pub struct MergeOutput {
    pub assets: Vec<AggregatedAsset>,
    pub conflicts_by_field: BTreeMap<String, u64>,
    pub conflicted_assets: usize,
}

/// Group records by normalized merge key (uppercase symbol, slug/name
/// fallback). Records with no usable identity are dropped.
pub fn group_by_symbol(
    records: Vec<StandardizedAssetRecord>,
) -> BTreeMap<String, Vec<StandardizedAssetRecord>> {
    let mut groups: BTreeMap<String, Vec<StandardizedAssetRecord>> = BTreeMap::new();
    for record in records {
        match record.merge_key() {
            Some(key) => groups.entry(key).or_default().push(record),
            None => {
                tracing::debug!(source = %record.source_id, "Dropping record with no identity fields");
            }
        }
    }
    groups
}

/// Consensus score for a set of independent numeric reports: median-based
/// maximum relative deviation mapped linearly onto [0, 1]. A single report
/// is neither confirmed nor contradicted (0.5).
pub fn consensus_score(values: &[f64], max_deviation: f64) -> f64 {
    if values.len() <= 1 {
        return 0.5;
    }
    let median = median(values);
    if median.abs() < f64::EPSILON {
        let all_zero = values.iter().all(|v| v.abs() < f64::EPSILON);
        return if all_zero { 1.0 } else { 0.0 };
    }
    let max_dev = values
        .iter()
        .map(|v| ((v - median) / median).abs())
        .fold(0.0, f64::max);
    if max_deviation <= 0.0 {
        return if max_dev == 0.0 { 1.0 } else { 0.0 };
    }
    (1.0 - max_dev / max_deviation).clamp(0.0, 1.0)
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Pick a field value from the highest-priority source providing one.
/// Candidates must already be in effective-priority order.
fn pick<T, F>(ordered: &[&StandardizedAssetRecord], extract: F) -> SourcedValue<T>
where
    F: Fn(&StandardizedAssetRecord) -> Option<T>,
{
    for record in ordered {
        if let Some(value) = extract(record) {
            return SourcedValue::chosen(value, record.source_id);
        }
    }
    SourcedValue::none()
}

/// Detect materially-significant disagreements across sources. Values are
/// compared case-insensitively; a case-only difference is not a conflict.
fn detect_conflicts(
    ordered: &[&StandardizedAssetRecord],
    now: DateTime<Utc>,
) -> Vec<FieldConflict> {
    let mut conflicts = Vec::new();

    let checks: [(&str, Box<dyn Fn(&StandardizedAssetRecord) -> Option<String>>); 2] = [
        (
            "pegged_asset",
            Box::new(|r| r.metadata.pegged_asset.clone()),
        ),
        (
            "asset_category",
            Box::new(|r| Some(r.asset_category.to_string())),
        ),
    ];

    for (field, extract) in checks {
        let mut values_by_source: BTreeMap<SourceId, String> = BTreeMap::new();
        let mut normalized: BTreeSet<String> = BTreeSet::new();
        for record in ordered {
            if let Some(value) = extract(record) {
                let trimmed = value.trim().to_string();
                if trimmed.is_empty() {
                    continue;
                }
                normalized.insert(trimmed.to_uppercase());
                values_by_source.insert(record.source_id, trimmed);
            }
        }
        if normalized.len() >= 2 {
            conflicts.push(FieldConflict {
                field: field.to_string(),
                conflict_count: normalized.len(),
                normalized: normalized.into_iter().collect(),
                values_by_source,
                timestamp: now,
            });
        }
    }

    conflicts
}

/// Merge the per-chain supply view. When the designated chain-data source
/// reports a populated breakdown it is used exclusively; otherwise all
/// sources' breakdowns and platform lists are unioned, de-duplicated by
/// (network, contract address) case-insensitively.
fn merge_network_breakdown(
    ordered: &[&StandardizedAssetRecord],
    chain_data_source: Option<SourceId>,
) -> Vec<ChainSupply> {
    if let Some(authoritative) = chain_data_source {
        if let Some(record) = ordered.iter().find(|r| r.source_id == authoritative) {
            if !record.supply_data.network_breakdown.is_empty() {
                let mut breakdown = record.supply_data.network_breakdown.clone();
                breakdown.sort_by(|a, b| a.dedup_key().cmp(&b.dedup_key()));
                return breakdown;
            }
        }
    }

    let mut merged: BTreeMap<(String, String), ChainSupply> = BTreeMap::new();
    for record in ordered {
        let from_breakdown = record.supply_data.network_breakdown.iter().cloned();
        let from_platforms = record.platforms.iter().map(|p| ChainSupply {
            network: p.network.clone(),
            contract_address: p.contract_address.clone(),
            circulating: p.supply,
        });
        for entry in from_breakdown.chain(from_platforms) {
            if entry.network.trim().is_empty() {
                continue;
            }
            // Higher-priority sources come first; keep their entry
            merged.entry(entry.dedup_key()).or_insert(entry);
        }
    }
    merged.into_values().collect()
}

fn confidence_scores(
    ordered: &[&StandardizedAssetRecord],
    consensus: f64,
) -> ConfidenceScores {
    let has_price = ordered.iter().any(|r| r.market_data.price.is_some());
    let has_cap = ordered.iter().any(|r| r.market_data.market_cap.is_some());
    let market =
        0.5 * (has_price as u8 as f64) + 0.3 * (has_cap as u8 as f64) + 0.2 * consensus;

    let supply_sources = ordered
        .iter()
        .filter(|r| r.supply_data.circulating.is_some())
        .count();
    let supply = 0.8 * ((supply_sources >= 1) as u8 as f64)
        + 0.2 * ((supply_sources >= 2) as u8 as f64);

    // Fixed baseline until per-source breakdown coverage is modeled
    let platform = 0.5;

    let datapoints: usize = ordered
        .iter()
        .map(|r| {
            [
                r.market_data.price.is_some(),
                r.market_data.market_cap.is_some(),
                r.market_data.volume_24h.is_some(),
                r.supply_data.circulating.is_some(),
                r.supply_data.total.is_some(),
                r.metadata.pegged_asset.is_some(),
            ]
            .iter()
            .filter(|b| **b)
            .count()
        })
        .sum();
    let completeness = 0.8 + 0.2 * (datapoints as f64 / 6.0).min(1.0);

    let overall = (0.4 * market + 0.4 * supply + 0.2 * platform) * completeness;

    ConfidenceScores {
        overall: overall.clamp(0.0, 1.0),
        market_data: market.clamp(0.0, 1.0),
        supply_data: supply.clamp(0.0, 1.0),
        platform_data: platform,
        consensus,
        source_count: ordered.len(),
    }
}

fn quality_flags(
    ordered: &[&StandardizedAssetRecord],
    market: &AggregatedMarketData,
    supply: &AggregatedSupplyData,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> QualityFlags {
    let newest = ordered.iter().map(|r| r.timestamp).max();
    let has_recent_data = newest.map(|t| now - t <= stale_after).unwrap_or(false);
    let has_multiple_sources = ordered.len() >= 2;
    let has_market_data = market.price.is_some() || market.market_cap.is_some();
    let has_supply_data = supply.circulating.is_some();

    let mut missing_fields = Vec::new();
    if !market.price.is_some() {
        missing_fields.push("price".to_string());
    }
    if !market.market_cap.is_some() {
        missing_fields.push("market_cap".to_string());
    }
    if !market.volume_24h.is_some() {
        missing_fields.push("volume_24h".to_string());
    }
    if !supply.circulating.is_some() {
        missing_fields.push("circulating_supply".to_string());
    }

    let mut warnings = Vec::new();
    if !has_recent_data {
        warnings.push("data may be stale".to_string());
    }
    if !has_multiple_sources {
        warnings.push("single source only".to_string());
    }
    if !has_market_data {
        warnings.push("no market data".to_string());
    }

    QualityFlags {
        has_recent_data,
        has_multiple_sources,
        has_market_data,
        has_supply_data,
        warnings,
        missing_fields,
    }
}

/// Merge one symbol's records into a single aggregated asset.
///
/// `records` need not be ordered; they are sorted by effective priority
/// descending, ties broken by lexicographic source id ascending. Output
/// never depends on registration or fetch-completion order.
pub fn merge_symbol(
    symbol_key: &str,
    records: &[StandardizedAssetRecord],
    settings: &MergeSettings,
    now: DateTime<Utc>,
) -> Option<AggregatedAsset> {
    if records.is_empty() {
        return None;
    }

    let mut ordered: Vec<&StandardizedAssetRecord> = records.iter().collect();
    ordered.sort_by(|a, b| {
        settings
            .effective_priority(b.source_id)
            .cmp(&settings.effective_priority(a.source_id))
            .then_with(|| a.source_id.as_str().cmp(b.source_id.as_str()))
    });

    let name = pick(&ordered, |r| {
        (!r.name.trim().is_empty()).then(|| r.name.clone())
    });
    let slug = pick(&ordered, |r| {
        (!r.slug.trim().is_empty()).then(|| r.slug.to_lowercase())
    });
    let symbol = pick(&ordered, |r| {
        (!r.symbol.trim().is_empty()).then(|| r.symbol.to_uppercase())
    });
    let image_url = pick(&ordered, |r| r.metadata.logo_url.clone());
    let asset_category = pick(&ordered, |r| Some(r.asset_category))
        .value
        .unwrap_or_default();

    let source_prices: BTreeMap<SourceId, f64> = ordered
        .iter()
        .filter_map(|r| r.market_data.price.map(|p| (r.source_id, p)))
        .collect();
    let price_values: Vec<f64> = source_prices.values().copied().collect();
    let consensus = consensus_score(&price_values, settings.consensus_max_deviation);

    let market_data = AggregatedMarketData {
        price: pick(&ordered, |r| r.market_data.price),
        market_cap: pick(&ordered, |r| r.market_data.market_cap),
        volume_24h: pick(&ordered, |r| r.market_data.volume_24h),
        percent_change_24h: pick(&ordered, |r| r.market_data.percent_change_24h),
        rank: pick(&ordered, |r| r.market_data.rank),
        source_prices,
    };

    let supply_data = AggregatedSupplyData {
        circulating: pick(&ordered, |r| r.supply_data.circulating),
        total: pick(&ordered, |r| r.supply_data.total),
        max: pick(&ordered, |r| r.supply_data.max),
        network_breakdown: merge_network_breakdown(&ordered, settings.chain_data_source),
    };

    let tags: BTreeSet<String> = ordered
        .iter()
        .flat_map(|r| r.metadata.tags.iter().cloned())
        .collect();

    let metadata = AggregatedMetadata {
        tags,
        description: pick(&ordered, |r| r.metadata.description.clone()),
        website: pick(&ordered, |r| r.metadata.website.clone()),
        date_added: pick(&ordered, |r| r.metadata.date_added),
        pegged_asset: pick(&ordered, |r| r.metadata.pegged_asset.clone()),
        conflicts: detect_conflicts(&ordered, now),
    };

    let confidence = confidence_scores(&ordered, consensus);
    let quality = quality_flags(&ordered, &market_data, &supply_data, now, settings.stale_after);

    let mut data_sources: Vec<SourceId> = ordered.iter().map(|r| r.source_id).collect();
    data_sources.sort();
    data_sources.dedup();

    let slug = slug.value.unwrap_or_else(|| symbol_key.to_lowercase());

    Some(AggregatedAsset {
        id: slug.clone(),
        name: name.value.unwrap_or_else(|| symbol_key.to_string()),
        symbol: symbol.value.unwrap_or_else(|| symbol_key.to_string()),
        slug,
        image_url: image_url.value,
        asset_category,
        market_data,
        supply_data,
        metadata,
        confidence,
        data_sources,
        quality,
        last_updated: now,
    })
}

/// Merge every symbol group and sort the result: stablecoins before
/// tokenized assets, then descending market cap (missing caps sort as 0).
pub fn merge_all(
    records: Vec<StandardizedAssetRecord>,
    settings: &MergeSettings,
    now: DateTime<Utc>,
) -> MergeOutput {
    let groups = group_by_symbol(records);
    let mut assets = Vec::with_capacity(groups.len());
    let mut conflicts_by_field: BTreeMap<String, u64> = BTreeMap::new();
    let mut conflicted_assets = 0usize;

    for (key, group) in &groups {
        match merge_symbol(key, group, settings, now) {
            Some(asset) => {
                if !asset.metadata.conflicts.is_empty() {
                    conflicted_assets += 1;
                    for conflict in &asset.metadata.conflicts {
                        *conflicts_by_field.entry(conflict.field.clone()).or_insert(0) += 1;
                    }
                }
                assets.push(asset);
            }
            None => {
                tracing::warn!(symbol = %key, "Symbol group produced no merged asset");
            }
        }
    }

    assets.sort_by(|a, b| {
        a.asset_category.cmp(&b.asset_category).then_with(|| {
            let cap_a = a.market_data.market_cap.value.unwrap_or(0.0);
            let cap_b = b.market_data.market_cap.value.unwrap_or(0.0);
            cap_b
                .partial_cmp(&cap_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.symbol.cmp(&b.symbol))
        })
    });

    MergeOutput {
        assets,
        conflicts_by_field,
        conflicted_assets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetMetadata, MarketData, PlatformEntry, SupplyData};

    fn record(source: SourceId, symbol: &str, price: Option<f64>) -> StandardizedAssetRecord {
        StandardizedAssetRecord {
            source_id: source,
            name: format!("{symbol} Coin"),
            symbol: symbol.to_string(),
            slug: symbol.to_lowercase(),
            asset_category: AssetCategory::Stablecoin,
            market_data: MarketData {
                price,
                ..MarketData::default()
            },
            supply_data: SupplyData::default(),
            platforms: Vec::new(),
            metadata: AssetMetadata {
                pegged_asset: Some("USD".to_string()),
                ..AssetMetadata::default()
            },
            confidence: 0.9,
            timestamp: Utc::now(),
        }
    }

    fn settings() -> MergeSettings {
        let mut priorities = BTreeMap::new();
        priorities.insert(SourceId::Cmc, 10);
        priorities.insert(SourceId::Messari, 8);
        priorities.insert(SourceId::DefiLlama, 7);
        priorities.insert(SourceId::CoinGecko, 6);
        MergeSettings {
            priorities,
            ..MergeSettings::default()
        }
    }

    #[test]
    fn test_priority_pick_with_provenance() {
        let records = vec![
            record(SourceId::Messari, "USDT", Some(0.999)),
            record(SourceId::Cmc, "USDT", Some(1.001)),
        ];
        let asset = merge_symbol("USDT", &records, &settings(), Utc::now()).unwrap();
        assert_eq!(asset.market_data.price.value, Some(1.001));
        assert_eq!(asset.market_data.price.source, Some(SourceId::Cmc));
        assert_eq!(asset.market_data.source_prices.len(), 2);
    }

    #[test]
    fn test_lower_priority_fills_gaps() {
        let mut cmc = record(SourceId::Cmc, "USDT", None);
        cmc.market_data.market_cap = Some(83e9);
        let mut gecko = record(SourceId::CoinGecko, "USDT", Some(0.998));
        gecko.supply_data.circulating = Some(82e9);

        let asset = merge_symbol("USDT", &[cmc, gecko], &settings(), Utc::now()).unwrap();
        // CMC reported no price, so the pick falls through to CoinGecko
        assert_eq!(asset.market_data.price.value, Some(0.998));
        assert_eq!(asset.market_data.price.source, Some(SourceId::CoinGecko));
        assert_eq!(asset.market_data.market_cap.source, Some(SourceId::Cmc));
        assert_eq!(
            asset.supply_data.circulating.source,
            Some(SourceId::CoinGecko)
        );
    }

    #[test]
    fn test_priority_tie_breaks_by_source_id() {
        // Equal priorities: coingecko < messari lexicographically wins
        let mut s = MergeSettings::default();
        s.priorities.insert(SourceId::Messari, 5);
        s.priorities.insert(SourceId::CoinGecko, 5);
        let records = vec![
            record(SourceId::Messari, "DAI", Some(1.0)),
            record(SourceId::CoinGecko, "DAI", Some(0.999)),
        ];
        let asset = merge_symbol("DAI", &records, &s, Utc::now()).unwrap();
        assert_eq!(asset.market_data.price.source, Some(SourceId::CoinGecko));
    }

    #[test]
    fn test_consensus_exact_agreement() {
        assert_eq!(consensus_score(&[1.0, 1.0, 1.0], 0.05), 1.0);
    }

    #[test]
    fn test_consensus_ten_percent_outlier_clamps_to_zero() {
        // Median of [1.0, 1.0, 1.1] is 1.0; the outlier deviates 10%
        assert_eq!(consensus_score(&[1.0, 1.0, 1.1], 0.05), 0.0);
    }

    #[test]
    fn test_consensus_single_source_is_half() {
        assert_eq!(consensus_score(&[1.0], 0.05), 0.5);
        assert_eq!(consensus_score(&[], 0.05), 0.5);
    }

    #[test]
    fn test_consensus_linear_between_bounds() {
        // Two values: median 1.0, each deviates 2.5% -> score 0.5
        let score = consensus_score(&[0.975, 1.025], 0.05);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_conflict_case_insensitive_no_conflict() {
        let mut a = record(SourceId::Cmc, "USDT", Some(1.0));
        a.metadata.pegged_asset = Some("USD".to_string());
        let mut b = record(SourceId::Messari, "USDT", Some(1.0));
        b.metadata.pegged_asset = Some("usd".to_string());

        let asset = merge_symbol("USDT", &[a, b], &settings(), Utc::now()).unwrap();
        assert!(asset.metadata.conflicts.is_empty());
    }

    #[test]
    fn test_conflict_detected_with_attribution() {
        let mut a = record(SourceId::Cmc, "XSGD", Some(1.0));
        a.metadata.pegged_asset = Some("USD".to_string());
        let mut b = record(SourceId::Messari, "XSGD", Some(1.0));
        b.metadata.pegged_asset = Some("EUR".to_string());

        let asset = merge_symbol("XSGD", &[a, b], &settings(), Utc::now()).unwrap();
        let conflict = asset
            .metadata
            .conflicts
            .iter()
            .find(|c| c.field == "pegged_asset")
            .expect("conflict expected");
        assert_eq!(conflict.conflict_count, 2);
        assert_eq!(conflict.normalized, vec!["EUR", "USD"]);
        assert_eq!(
            conflict.values_by_source.get(&SourceId::Cmc).unwrap(),
            "USD"
        );
        assert_eq!(
            conflict.values_by_source.get(&SourceId::Messari).unwrap(),
            "EUR"
        );
    }

    #[test]
    fn test_network_breakdown_dedup_case_insensitive() {
        let mut a = record(SourceId::Cmc, "USDT", Some(1.0));
        a.platforms.push(PlatformEntry {
            name: "Ethereum".to_string(),
            network: "Ethereum".to_string(),
            contract_address: Some("0xDAC17F958D2EE523A2206206994597C13D831EC7".to_string()),
            supply: Some(39e9),
            percentage: None,
        });
        let mut b = record(SourceId::Messari, "USDT", Some(1.0));
        b.supply_data.network_breakdown.push(ChainSupply {
            network: "ethereum".to_string(),
            contract_address: Some("0xdac17f958d2ee523a2206206994597c13d831ec7".to_string()),
            circulating: Some(39.5e9),
        });

        // No DeFiLlama breakdown present, so the generic union runs
        let asset = merge_symbol("USDT", &[a, b], &settings(), Utc::now()).unwrap();
        assert_eq!(asset.supply_data.network_breakdown.len(), 1);
        // Higher-priority CMC entry wins the slot
        assert_eq!(
            asset.supply_data.network_breakdown[0].circulating,
            Some(39e9)
        );
    }

    #[test]
    fn test_authoritative_chain_source_used_exclusively() {
        let mut llama = record(SourceId::DefiLlama, "USDT", Some(1.0));
        llama.supply_data.network_breakdown = vec![
            ChainSupply {
                network: "Ethereum".to_string(),
                contract_address: None,
                circulating: Some(39e9),
            },
            ChainSupply {
                network: "Tron".to_string(),
                contract_address: None,
                circulating: Some(44e9),
            },
        ];
        let mut cmc = record(SourceId::Cmc, "USDT", Some(1.0));
        cmc.platforms.push(PlatformEntry {
            name: "Solana".to_string(),
            network: "Solana".to_string(),
            contract_address: None,
            supply: Some(1e9),
            percentage: None,
        });

        let asset = merge_symbol("USDT", &[llama, cmc], &settings(), Utc::now()).unwrap();
        let networks: Vec<&str> = asset
            .supply_data
            .network_breakdown
            .iter()
            .map(|c| c.network.as_str())
            .collect();
        // Solana from CMC is ignored: the authoritative view wins outright
        assert_eq!(networks, vec!["Ethereum", "Tron"]);
    }

    #[test]
    fn test_merge_determinism() {
        let records = vec![
            record(SourceId::CoinGecko, "USDC", Some(0.9998)),
            record(SourceId::Cmc, "USDC", Some(1.0001)),
            record(SourceId::Messari, "USDC", Some(0.9999)),
        ];
        let now = Utc::now();
        let s = settings();
        let first = merge_all(records.clone(), &s, now);
        let second = merge_all(records, &s, now);
        let a = serde_json::to_string(&first.assets).unwrap();
        let b = serde_json::to_string(&second.assets).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sort_category_then_market_cap() {
        let mut gold = record(SourceId::Cmc, "PAXG", Some(2350.0));
        gold.asset_category = AssetCategory::TokenizedAsset;
        gold.market_data.market_cap = Some(900e6);
        let mut usdt = record(SourceId::Cmc, "USDT", Some(1.0));
        usdt.market_data.market_cap = Some(83e9);
        let mut dai = record(SourceId::Cmc, "DAI", Some(1.0));
        dai.market_data.market_cap = Some(5e9);
        let nocap = record(SourceId::Cmc, "NEWCOIN", Some(1.0));

        let output = merge_all(vec![gold, nocap, usdt, dai], &settings(), Utc::now());
        let symbols: Vec<&str> = output.assets.iter().map(|a| a.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["USDT", "DAI", "NEWCOIN", "PAXG"]);
    }

    #[test]
    fn test_confidence_weights() {
        let mut a = record(SourceId::Cmc, "USDT", Some(1.0));
        a.market_data.market_cap = Some(83e9);
        a.supply_data.circulating = Some(83e9);
        let mut b = record(SourceId::Messari, "USDT", Some(1.0));
        b.supply_data.circulating = Some(82.9e9);

        let asset = merge_symbol("USDT", &[a, b], &settings(), Utc::now()).unwrap();
        let c = &asset.confidence;
        // Exact price agreement: consensus 1.0
        assert_eq!(c.consensus, 1.0);
        // market = 0.5 + 0.3 + 0.2*1.0 = 1.0; supply = 0.8 + 0.2 = 1.0
        assert!((c.market_data - 1.0).abs() < 1e-9);
        assert!((c.supply_data - 1.0).abs() < 1e-9);
        assert_eq!(c.platform_data, 0.5);
        assert_eq!(c.source_count, 2);
        // datapoints: a has price+cap+circ+peg=4, b has price+circ+peg=3 -> 7, capped
        // overall = (0.4 + 0.4 + 0.1) * 1.0 = 0.9
        assert!((c.overall - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_conflict_tallies_feed_output() {
        let mut a = record(SourceId::Cmc, "XAUT", Some(1.0));
        a.metadata.pegged_asset = Some("XAU".to_string());
        a.asset_category = AssetCategory::TokenizedAsset;
        let mut b = record(SourceId::Messari, "XAUT", Some(1.0));
        b.metadata.pegged_asset = Some("USD".to_string());
        b.asset_category = AssetCategory::Stablecoin;

        let output = merge_all(vec![a, b], &settings(), Utc::now());
        assert_eq!(output.conflicted_assets, 1);
        assert_eq!(output.conflicts_by_field.get("pegged_asset"), Some(&1));
        assert_eq!(output.conflicts_by_field.get("asset_category"), Some(&1));
    }

    #[test]
    fn test_quality_flags_missing_fields() {
        let asset = merge_symbol(
            "LONE",
            &[record(SourceId::CoinGecko, "LONE", None)],
            &settings(),
            Utc::now(),
        )
        .unwrap();
        assert!(!asset.quality.has_multiple_sources);
        assert!(!asset.quality.has_market_data);
        assert!(asset.quality.missing_fields.contains(&"price".to_string()));
        assert!(asset
            .quality
            .warnings
            .contains(&"single source only".to_string()));
        assert!(asset.quality.has_recent_data);
    }
}
