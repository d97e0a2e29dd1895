//! End-to-end aggregation engine tests against scripted in-memory sources

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use stablewatch::aggregator::AggregationEngine;
use stablewatch::config::{
    AggregationConfig, AppConfig, HealthConfig, ServiceConfig, SourceSettings, SourcesConfig,
};
use stablewatch::health::{CircuitState, HealthMonitor};
use stablewatch::sources::{
    RateLimitInfo, SourceCapabilities, SourceError, SourceRegistry, StablecoinSource,
};
use stablewatch::types::{
    AssetCategory, AssetMetadata, ChainSupply, MarketData, SourceId, StandardizedAssetRecord,
    SupplyData,
};

/// Scripted source: serves a fixed record set, or fails on demand
struct MockSource {
    id: SourceId,
    priority: u8,
    records: Vec<StandardizedAssetRecord>,
    failing: AtomicBool,
}

impl MockSource {
    fn new(id: SourceId, priority: u8, records: Vec<StandardizedAssetRecord>) -> Self {
        Self {
            id,
            priority,
            records,
            failing: AtomicBool::new(false),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl StablecoinSource for MockSource {
    fn source_id(&self) -> SourceId {
        self.id
    }

    fn source_name(&self) -> &'static str {
        "Mock"
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            priority: self.priority,
            has_network_breakdown: self.id == SourceId::DefiLlama,
            data_types: vec!["market", "supply"],
        }
    }

    fn rate_limit_info(&self) -> RateLimitInfo {
        RateLimitInfo {
            requests_per_minute: 1_000,
            requires_api_key: false,
        }
    }

    async fn fetch_stablecoins(&self) -> Result<serde_json::Value, SourceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::Network("connection refused".to_string()));
        }
        serde_json::to_value(&self.records).map_err(|e| SourceError::Parse(e.to_string()))
    }

    fn transform_to_standard(
        &self,
        raw: &serde_json::Value,
        fetched_at: DateTime<Utc>,
    ) -> Vec<StandardizedAssetRecord> {
        let mut records: Vec<StandardizedAssetRecord> =
            serde_json::from_value(raw.clone()).unwrap_or_default();
        for record in &mut records {
            record.timestamp = fetched_at;
        }
        records
    }
}

fn record(
    source: SourceId,
    symbol: &str,
    price: f64,
    market_cap: f64,
) -> StandardizedAssetRecord {
    StandardizedAssetRecord {
        source_id: source,
        name: format!("{symbol} Coin"),
        symbol: symbol.to_string(),
        slug: symbol.to_lowercase(),
        asset_category: AssetCategory::Stablecoin,
        market_data: MarketData {
            price: Some(price),
            market_cap: Some(market_cap),
            volume_24h: Some(market_cap / 3.0),
            ..MarketData::default()
        },
        supply_data: SupplyData {
            circulating: Some(market_cap),
            ..SupplyData::default()
        },
        platforms: Vec::new(),
        metadata: AssetMetadata {
            tags: BTreeSet::from(["stablecoin".to_string()]),
            pegged_asset: Some("USD".to_string()),
            ..AssetMetadata::default()
        },
        confidence: 0.9,
        timestamp: Utc::now(),
    }
}

fn settings() -> SourceSettings {
    SourceSettings {
        api_key_env: None,
        timeout_ms: 5_000,
        priority: None,
        price_band_min: 0.50,
        price_band_max: 2.00,
    }
}

fn test_config() -> AppConfig {
    AppConfig {
        service: ServiceConfig {
            refresh_interval_secs: 60,
            stale_after_secs: 900,
            api_bind: "127.0.0.1:0".to_string(),
        },
        sources: SourcesConfig {
            enabled: vec![
                "cmc".to_string(),
                "messari".to_string(),
                "defillama".to_string(),
            ],
            cmc: settings(),
            messari: settings(),
            coingecko: settings(),
            defillama: settings(),
        },
        health: HealthConfig {
            failure_threshold: 3,
            cooldown_secs: 60,
            half_open_max_calls: 3,
            half_open_successes_to_close: 2,
            sample_window: 50,
            error_rate_alert: 0.5,
            response_time_threshold_ms: 5_000,
            min_healthy_sources: 2,
            degraded_error_rate: 0.5,
            degraded_avg_response_ms: 8_000,
            conflict_window_mins: 60,
            conflict_penalty_per_hour: 2.0,
        },
        aggregation: AggregationConfig {
            chain_data_source: "defillama".to_string(),
            consensus_max_deviation: 0.05,
            large_payload_threshold: 1_000,
            filter_chunk_size: 250,
        },
    }
}

fn build_engine(sources: Vec<Arc<MockSource>>) -> Arc<AggregationEngine> {
    let mut registry = SourceRegistry::new();
    for source in sources {
        registry.register(source);
    }
    let config = test_config();
    let monitor = Arc::new(HealthMonitor::new(config.health.clone()));
    Arc::new(AggregationEngine::new(
        Arc::new(registry),
        monitor,
        config,
    ))
}

#[tokio::test]
async fn test_refresh_merges_multiple_sources_with_provenance() {
    let cmc = Arc::new(MockSource::new(
        SourceId::Cmc,
        10,
        vec![record(SourceId::Cmc, "USDT", 1.001, 83e9)],
    ));
    let messari = Arc::new(MockSource::new(
        SourceId::Messari,
        8,
        vec![record(SourceId::Messari, "USDT", 0.999, 82.5e9)],
    ));
    let engine = build_engine(vec![cmc, messari]);

    let outcome = engine.refresh().await;
    assert!(outcome.success);
    assert_eq!(outcome.stablecoins_updated, 1);
    assert_eq!(outcome.source_results.len(), 2);
    assert!(outcome.source_results.iter().all(|r| r.success));

    let usdt = engine.stablecoin("USDT").expect("merged asset");
    // Higher-priority source supplies the price, with attribution
    assert_eq!(usdt.market_data.price.value, Some(1.001));
    assert_eq!(usdt.market_data.price.source, Some(SourceId::Cmc));
    assert_eq!(usdt.data_sources, vec![SourceId::Cmc, SourceId::Messari]);
    // Close agreement between the two prices scores a high consensus
    assert!(usdt.confidence.consensus > 0.9);
    assert_eq!(usdt.confidence.source_count, 2);
}

#[tokio::test]
async fn test_asset_lookup_is_case_insensitive() {
    let cmc = Arc::new(MockSource::new(
        SourceId::Cmc,
        10,
        vec![record(SourceId::Cmc, "USDC", 1.0, 25e9)],
    ));
    let engine = build_engine(vec![cmc]);
    engine.refresh().await;

    assert!(engine.stablecoin("usdc").is_some());
    assert!(engine.stablecoin("USDC").is_some());
    assert!(engine.stablecoin("UsDc").is_some());
    assert!(engine.stablecoin("unknown").is_none());
    assert!(engine.stablecoin("  ").is_none());
}

#[tokio::test]
async fn test_failed_cycle_keeps_previous_snapshot() {
    let cmc = Arc::new(MockSource::new(
        SourceId::Cmc,
        10,
        vec![record(SourceId::Cmc, "USDT", 1.0, 83e9)],
    ));
    let engine = build_engine(vec![cmc.clone()]);

    let first = engine.refresh().await;
    assert!(first.success);
    let cycle_before = engine.data_freshness().cycle;

    cmc.set_failing(true);
    let second = engine.refresh().await;
    assert!(!second.success);
    assert!(!second.errors.is_empty());

    // The good snapshot is still served and the cycle counter is unchanged
    assert_eq!(engine.stablecoins().len(), 1);
    assert_eq!(engine.data_freshness().cycle, cycle_before);
}

#[tokio::test]
async fn test_circuit_opens_and_skips_source() {
    let good = Arc::new(MockSource::new(
        SourceId::Cmc,
        10,
        vec![record(SourceId::Cmc, "USDT", 1.0, 83e9)],
    ));
    let bad = Arc::new(MockSource::new(SourceId::Messari, 8, Vec::new()));
    bad.set_failing(true);
    let engine = build_engine(vec![good, bad]);

    // failure_threshold = 3: three failing cycles trip the circuit
    for _ in 0..3 {
        let outcome = engine.refresh().await;
        assert!(outcome.success); // the good source still carries the cycle
    }
    let report = engine
        .health_monitor()
        .source_health(SourceId::Messari)
        .unwrap();
    assert_eq!(report.circuit_state, CircuitState::Open);
    assert_eq!(report.health_score, 0.0);

    // Next cycle skips the tripped source without calling it
    let outcome = engine.refresh().await;
    let messari = outcome
        .source_results
        .iter()
        .find(|r| r.source == SourceId::Messari)
        .unwrap();
    assert!(messari.skipped_by_circuit);
    assert!(!messari.success);
}

#[tokio::test]
async fn test_price_band_filters_depegged_records() {
    // 0.30 is outside the 0.50-2.00 sanity band and must be dropped
    let cmc = Arc::new(MockSource::new(
        SourceId::Cmc,
        10,
        vec![
            record(SourceId::Cmc, "USDT", 1.0, 83e9),
            record(SourceId::Cmc, "DEAD", 0.30, 1e6),
        ],
    ));
    let engine = build_engine(vec![cmc]);
    let outcome = engine.refresh().await;

    assert!(outcome.success);
    assert_eq!(outcome.stablecoins_updated, 1);
    assert!(engine.stablecoin("DEAD").is_none());
}

#[tokio::test]
async fn test_segmented_metrics_from_snapshot() {
    let mut gold = record(SourceId::Cmc, "PAXG", 2350.0, 900e6);
    gold.asset_category = AssetCategory::TokenizedAsset;
    let cmc = Arc::new(MockSource::new(
        SourceId::Cmc,
        10,
        vec![
            record(SourceId::Cmc, "USDT", 1.0, 83e9),
            record(SourceId::Cmc, "USDC", 1.0, 25e9),
            gold,
        ],
    ));
    let engine = build_engine(vec![cmc]);
    engine.refresh().await;

    let metrics = engine.market_metrics();
    assert_eq!(metrics.stablecoins.asset_count, 2);
    assert_eq!(metrics.tokenized_assets.asset_count, 1);
    assert!((metrics.stablecoins.total_market_cap - 108e9).abs() < 1.0);
    assert!(
        (metrics.combined.total_market_cap
            - metrics.stablecoins.total_market_cap
            - metrics.tokenized_assets.total_market_cap)
            .abs()
            < 1e-6
    );
    assert_eq!(metrics.stablecoins.total_market_cap_display, "$108.00B");

    // Stablecoins sort ahead of tokenized assets in the listing
    let symbols: Vec<String> = engine.stablecoins().iter().map(|a| a.symbol.clone()).collect();
    assert_eq!(symbols, vec!["USDT", "USDC", "PAXG"]);
}

#[tokio::test]
async fn test_authoritative_chain_breakdown_and_rollups() {
    let mut llama_usdt = record(SourceId::DefiLlama, "USDT", 1.0, 83e9);
    llama_usdt.supply_data.network_breakdown = vec![
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
    let llama = Arc::new(MockSource::new(SourceId::DefiLlama, 7, vec![llama_usdt]));
    let cmc = Arc::new(MockSource::new(
        SourceId::Cmc,
        10,
        vec![record(SourceId::Cmc, "USDT", 1.001, 83.1e9)],
    ));
    let engine = build_engine(vec![llama, cmc]);
    engine.refresh().await;

    let usdt = engine.stablecoin("usdt").unwrap();
    // Chain data comes exclusively from the designated source
    assert_eq!(usdt.supply_data.network_breakdown.len(), 2);
    // Market data still follows priority: CMC wins the price
    assert_eq!(usdt.market_data.price.source, Some(SourceId::Cmc));

    let rollups = engine.platform_data();
    assert_eq!(rollups.len(), 2);
    assert_eq!(rollups[0].network, "Tron");
    assert!((rollups[0].total_circulating - 44e9).abs() < 1.0);
    assert_eq!(rollups[0].top_coins, vec!["USDT"]);
}

#[tokio::test]
async fn test_conflicts_degrade_system_health() {
    let mut cmc_rec = record(SourceId::Cmc, "XSGD", 0.74, 500e6);
    cmc_rec.metadata.pegged_asset = Some("SGD".to_string());
    let mut messari_rec = record(SourceId::Messari, "XSGD", 0.74, 500e6);
    messari_rec.metadata.pegged_asset = Some("USD".to_string());

    let cmc = Arc::new(MockSource::new(SourceId::Cmc, 10, vec![cmc_rec]));
    let messari = Arc::new(MockSource::new(SourceId::Messari, 8, vec![messari_rec]));
    let engine = build_engine(vec![cmc, messari]);
    engine.refresh().await;

    let xsgd = engine.stablecoin("XSGD").unwrap();
    assert_eq!(xsgd.metadata.conflicts.len(), 1);
    // Winner still follows priority
    assert_eq!(xsgd.metadata.pegged_asset.value.as_deref(), Some("SGD"));

    let system = engine.health_status();
    assert!(system.conflict_rate_per_hour > 0.0);
    assert!(system.conflict_penalty > 0.0);
    assert!(system.score < 100.0);
}

#[tokio::test]
async fn test_freshness_reporting() {
    let cmc = Arc::new(MockSource::new(
        SourceId::Cmc,
        10,
        vec![record(SourceId::Cmc, "USDT", 1.0, 83e9)],
    ));
    let engine = build_engine(vec![cmc]);

    // Before any refresh the snapshot is absent and reported stale
    let before = engine.data_freshness();
    assert!(before.stale);
    assert!(before.generated_at.is_none());
    assert_eq!(before.cycle, 0);

    engine.refresh().await;
    let after = engine.data_freshness();
    assert!(!after.stale);
    assert_eq!(after.cycle, 1);
    assert!(after.age_secs.unwrap() < 5);
    // Next update is one refresh interval after the snapshot
    let expected = after.generated_at.unwrap() + chrono::Duration::seconds(60);
    assert_eq!(after.next_update.unwrap(), expected);
}

#[tokio::test]
async fn test_no_active_sources_fails_cleanly() {
    let engine = build_engine(Vec::new());
    let outcome = engine.refresh().await;
    assert!(!outcome.success);
    assert_eq!(outcome.errors, vec!["no active sources".to_string()]);
    assert!(engine.stablecoins().is_empty());
}
