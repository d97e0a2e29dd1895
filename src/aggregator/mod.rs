//! Aggregation engine
//!
//! Orchestrates refresh cycles: fans out to all active sources
//! concurrently, gates each call through the health monitor's circuit
//! breakers, standardizes and sanity-filters records, merges them into a
//! snapshot, and publishes it atomically. Readers always see either the
//! previous complete snapshot or the new one, never a partial state.

pub mod merge;
pub mod metrics;

pub use merge::{
    AggregatedAsset, AggregatedMarketData, AggregatedSupplyData, ConfidenceScores,
    FieldConflict, MergeOutput, MergeSettings, QualityFlags, SourcedValue,
};
pub use metrics::{MarketMetrics, PlatformRollup, SegmentedMetrics};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::health::{FailureDetails, HealthMonitor, SuccessDetails, SystemHealthReport};
use crate::sources::{apply_price_band, PriceBand, SourceError, SourceRegistry, StablecoinSource};
use crate::types::{SourceId, StandardizedAssetRecord};

/// One complete, immutable aggregation result
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub assets: Vec<AggregatedAsset>,
    pub metrics: SegmentedMetrics,
    pub platforms: Vec<PlatformRollup>,
    pub generated_at: DateTime<Utc>,
    pub cycle: u64,
    pub sources_succeeded: Vec<SourceId>,
}

/// Per-source result of one refresh cycle
#[derive(Debug, Clone, Serialize)]
pub struct SourceRefreshResult {
    pub source: SourceId,
    pub success: bool,
    pub records: usize,
    pub duration_ms: u64,
    pub skipped_by_circuit: bool,
    pub error: Option<String>,
}

/// Summary of one refresh cycle
#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub success: bool,
    pub stablecoins_updated: usize,
    pub duration_ms: u64,
    pub source_results: Vec<SourceRefreshResult>,
    pub errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot age relative to the configured staleness threshold
#[derive(Debug, Clone, Serialize)]
pub struct DataFreshness {
    pub generated_at: Option<DateTime<Utc>>,
    pub age_secs: Option<i64>,
    pub stale: bool,
    /// When the scheduler is next expected to refresh
    pub next_update: Option<DateTime<Utc>>,
    pub refresh_in_progress: bool,
    pub cycle: u64,
}

pub struct AggregationEngine {
    registry: Arc<SourceRegistry>,
    monitor: Arc<HealthMonitor>,
    config: AppConfig,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    refreshing: AtomicBool,
    cycles: AtomicU64,
}

/// Clears the in-flight flag on every exit path of `refresh`
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl AggregationEngine {
    pub fn new(
        registry: Arc<SourceRegistry>,
        monitor: Arc<HealthMonitor>,
        config: AppConfig,
    ) -> Self {
        for source in registry.get_all() {
            monitor.initialize_source(source.source_id());
        }
        Self {
            registry,
            monitor,
            config,
            snapshot: RwLock::new(None),
            refreshing: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
        }
    }

    fn merge_settings(&self) -> MergeSettings {
        let mut priorities = BTreeMap::new();
        for source in self.registry.get_all() {
            let id = source.source_id();
            let priority = self
                .config
                .sources
                .priority_override(id)
                .unwrap_or(source.capabilities().priority);
            priorities.insert(id, priority);
        }
        MergeSettings {
            priorities,
            chain_data_source: self.config.aggregation.chain_data_source_id(),
            consensus_max_deviation: self.config.aggregation.consensus_max_deviation,
            stale_after: ChronoDuration::seconds(self.config.service.stale_after_secs as i64),
        }
    }

    /// Fetch, standardize, and filter one source's records
    async fn fetch_source(
        &self,
        source: Arc<dyn StablecoinSource>,
    ) -> (SourceRefreshResult, Vec<StandardizedAssetRecord>) {
        let id = source.source_id();

        if !self.monitor.allow_request(id) {
            return (
                SourceRefreshResult {
                    source: id,
                    success: false,
                    records: 0,
                    duration_ms: 0,
                    skipped_by_circuit: true,
                    error: Some("circuit open".to_string()),
                },
                Vec::new(),
            );
        }

        let settings = self.config.sources.settings(id);
        let timeout = Duration::from_millis(settings.timeout_ms);
        let band = PriceBand {
            min: settings.price_band_min,
            max: settings.price_band_max,
        };
        let started = Instant::now();

        let fetched = match tokio::time::timeout(timeout, source.fetch_stablecoins()).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match fetched {
            Ok(raw) => {
                let fetched_at = Utc::now();
                let records = source.transform_to_standard(&raw, fetched_at);
                let records = apply_price_band(
                    records,
                    band,
                    self.config.aggregation.large_payload_threshold,
                    self.config.aggregation.filter_chunk_size,
                )
                .await;

                self.monitor.record_success(
                    id,
                    SuccessDetails {
                        duration_ms,
                        record_count: records.len(),
                        operation: "fetch_stablecoins",
                    },
                );

                (
                    SourceRefreshResult {
                        source: id,
                        success: true,
                        records: records.len(),
                        duration_ms,
                        skipped_by_circuit: false,
                        error: None,
                    },
                    records,
                )
            }
            Err(err) => {
                self.monitor.record_failure(
                    id,
                    FailureDetails {
                        error_type: err.kind().to_string(),
                        message: err.to_string(),
                        status_code: err.status_code(),
                        retryable: err.retryable(),
                        operation: "fetch_stablecoins",
                    },
                );

                (
                    SourceRefreshResult {
                        source: id,
                        success: false,
                        records: 0,
                        duration_ms,
                        skipped_by_circuit: false,
                        error: Some(err.to_string()),
                    },
                    Vec::new(),
                )
            }
        }
    }

    /// Run one full refresh cycle. Concurrent calls coalesce: if a cycle is
    /// already in flight the call returns immediately without fetching.
    pub async fn refresh(&self) -> RefreshOutcome {
        let started = Instant::now();
        let timestamp = Utc::now();

        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Refresh already in progress; skipping");
            return RefreshOutcome {
                success: false,
                stablecoins_updated: 0,
                duration_ms: 0,
                source_results: Vec::new(),
                errors: vec!["refresh already in progress".to_string()],
                timestamp,
            };
        }
        let _guard = InFlightGuard(&self.refreshing);

        let active = self.registry.get_active();
        if active.is_empty() {
            tracing::error!("No active sources configured; nothing to refresh");
            return RefreshOutcome {
                success: false,
                stablecoins_updated: 0,
                duration_ms: started.elapsed().as_millis() as u64,
                source_results: Vec::new(),
                errors: vec!["no active sources".to_string()],
                timestamp,
            };
        }

        let fetches = active.into_iter().map(|source| self.fetch_source(source));
        let outcomes = join_all(fetches).await;

        let mut source_results = Vec::with_capacity(outcomes.len());
        let mut errors = Vec::new();
        let mut all_records = Vec::new();
        for (result, records) in outcomes {
            if let Some(error) = &result.error {
                errors.push(format!("{}: {error}", result.source));
            }
            source_results.push(result);
            all_records.extend(records);
        }

        if all_records.is_empty() {
            // Keep serving the previous snapshot rather than wiping it
            tracing::error!(
                errors = errors.len(),
                "Refresh produced no records; previous snapshot retained"
            );
            return RefreshOutcome {
                success: false,
                stablecoins_updated: 0,
                duration_ms: started.elapsed().as_millis() as u64,
                source_results,
                errors,
                timestamp,
            };
        }

        let output = merge::merge_all(all_records, &self.merge_settings(), Utc::now());
        self.monitor
            .record_conflict_metrics(&output.conflicts_by_field, output.assets.len());

        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(Snapshot {
            metrics: metrics::compute_metrics(&output.assets),
            platforms: metrics::compute_platform_rollups(&output.assets),
            generated_at: Utc::now(),
            cycle,
            sources_succeeded: source_results
                .iter()
                .filter(|r| r.success)
                .map(|r| r.source)
                .collect(),
            assets: output.assets,
        });
        let stablecoins_updated = snapshot.assets.len();

        {
            let mut slot = self.snapshot.write().expect("snapshot lock poisoned");
            *slot = Some(snapshot);
        }

        self.monitor.prune_stale_samples(ChronoDuration::hours(1));

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            cycle,
            assets = stablecoins_updated,
            conflicts = output.conflicted_assets,
            duration_ms,
            sources_ok = source_results.iter().filter(|r| r.success).count(),
            sources_failed = source_results.iter().filter(|r| !r.success).count(),
            "Refresh cycle complete"
        );

        RefreshOutcome {
            success: true,
            stablecoins_updated,
            duration_ms,
            source_results,
            errors,
            timestamp,
        }
    }

    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot
            .read()
            .expect("snapshot lock poisoned")
            .clone()
    }

    /// All merged assets from the current snapshot, in display order
    pub fn stablecoins(&self) -> Vec<AggregatedAsset> {
        self.snapshot()
            .map(|s| s.assets.clone())
            .unwrap_or_default()
    }

    /// Look up one asset by slug, symbol, or id, case-insensitively
    pub fn stablecoin(&self, identifier: &str) -> Option<AggregatedAsset> {
        let needle = identifier.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.snapshot()?.assets.iter().find_map(|a| {
            let matches = a.slug.to_lowercase() == needle
                || a.symbol.to_lowercase() == needle
                || a.id.to_lowercase() == needle;
            matches.then(|| a.clone())
        })
    }

    pub fn platform_data(&self) -> Vec<PlatformRollup> {
        self.snapshot()
            .map(|s| s.platforms.clone())
            .unwrap_or_default()
    }

    pub fn market_metrics(&self) -> SegmentedMetrics {
        self.snapshot()
            .map(|s| s.metrics.clone())
            .unwrap_or_default()
    }

    pub fn stablecoin_metrics(&self) -> MarketMetrics {
        self.market_metrics().stablecoins
    }

    pub fn tokenized_asset_metrics(&self) -> MarketMetrics {
        self.market_metrics().tokenized_assets
    }

    pub fn health_status(&self) -> SystemHealthReport {
        self.monitor.system_health()
    }

    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub fn data_freshness(&self) -> DataFreshness {
        let snapshot = self.snapshot();
        let now = Utc::now();
        let generated_at = snapshot.as_ref().map(|s| s.generated_at);
        let age_secs = generated_at.map(|t| (now - t).num_seconds());
        let stale = age_secs
            .map(|age| age > self.config.service.stale_after_secs as i64)
            .unwrap_or(true);
        let next_update = generated_at.map(|t| {
            t + ChronoDuration::seconds(self.config.service.refresh_interval_secs as i64)
        });
        DataFreshness {
            generated_at,
            age_secs,
            stale,
            next_update,
            refresh_in_progress: self.refreshing.load(Ordering::SeqCst),
            cycle: snapshot.map(|s| s.cycle).unwrap_or(0),
        }
    }
}
