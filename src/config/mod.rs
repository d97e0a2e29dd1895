//! Configuration management for stablewatch
//!
//! Loads from YAML files + environment variables via .env

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::types::SourceId;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub sources: SourcesConfig,
    pub health: HealthConfig,
    pub aggregation: AggregationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Seconds between scheduled refresh cycles
    pub refresh_interval_secs: u64,
    /// Snapshot age after which data is reported stale
    pub stale_after_secs: u64,
    /// Bind address for the optional HTTP API
    pub api_bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    /// Source ids to instantiate ("cmc", "messari", "coingecko", "defillama")
    pub enabled: Vec<String>,
    pub cmc: SourceSettings,
    pub messari: SourceSettings,
    pub coingecko: SourceSettings,
    pub defillama: SourceSettings,
}

/// Per-source tuning knobs
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSettings {
    /// Environment variable holding the API key, if the source needs one
    pub api_key_env: Option<String>,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
    /// Merge priority override; when set it beats the adapter's
    /// capability-declared priority
    pub priority: Option<u8>,
    /// Sanity band for quoted prices of tagged stablecoins. Assets quoted
    /// outside the band are treated as mistagged and dropped.
    pub price_band_min: f64,
    pub price_band_max: f64,
}

impl SourceSettings {
    /// Resolve the configured API key from the environment
    pub fn api_key(&self) -> Option<String> {
        let var = self.api_key_env.as_deref()?;
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => Some(value),
            _ => None,
        }
    }
}

impl SourcesConfig {
    pub fn settings(&self, id: SourceId) -> &SourceSettings {
        match id {
            SourceId::Cmc => &self.cmc,
            SourceId::Messari => &self.messari,
            SourceId::CoinGecko => &self.coingecko,
            SourceId::DefiLlama => &self.defillama,
        }
    }

    pub fn is_enabled(&self, id: SourceId) -> bool {
        self.enabled
            .iter()
            .any(|s| SourceId::parse(s) == Some(id))
    }

    /// Priority override for a source, if configured
    pub fn priority_override(&self, id: SourceId) -> Option<u8> {
        self.settings(id).priority
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures before a source's circuit opens
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before allowing trial calls
    pub cooldown_secs: u64,
    /// Trial calls admitted while half-open
    pub half_open_max_calls: u32,
    /// Consecutive trial successes required to close again
    pub half_open_successes_to_close: u32,
    /// Rolling samples kept per source
    pub sample_window: usize,
    /// Error rate (0-1) that raises a high-error-rate alert
    pub error_rate_alert: f64,
    /// Average response time (ms) above which health is penalized
    pub response_time_threshold_ms: u64,
    /// Minimum operational sources before degraded mode is recommended
    pub min_healthy_sources: usize,
    /// System-wide error rate (0-1) triggering degraded mode
    pub degraded_error_rate: f64,
    /// System-wide average response time (ms) triggering degraded mode
    pub degraded_avg_response_ms: u64,
    /// Sliding window for conflict-rate tracking, in minutes
    pub conflict_window_mins: i64,
    /// Health points deducted per conflict/hour, capped at 20
    pub conflict_penalty_per_hour: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Source whose chain-level supply breakdown is used exclusively when
    /// present (the most granular multi-chain view)
    pub chain_data_source: String,
    /// Relative deviation from the median at which consensus bottoms out
    pub consensus_max_deviation: f64,
    /// Payload size above which filtering yields cooperatively
    pub large_payload_threshold: usize,
    /// Entries filtered between yields
    pub filter_chunk_size: usize,
}

impl AggregationConfig {
    pub fn chain_data_source_id(&self) -> Option<SourceId> {
        SourceId::parse(&self.chain_data_source)
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Service defaults
            .set_default("service.refresh_interval_secs", 300)?
            .set_default("service.stale_after_secs", 900)?
            .set_default("service.api_bind", "127.0.0.1:8080")?
            // Source defaults
            .set_default(
                "sources.enabled",
                vec!["cmc", "messari", "coingecko", "defillama"],
            )?
            .set_default("sources.cmc.api_key_env", "CMC_API_KEY")?
            .set_default("sources.cmc.timeout_ms", 10_000)?
            .set_default("sources.cmc.price_band_min", 0.50)?
            .set_default("sources.cmc.price_band_max", 2.00)?
            .set_default("sources.messari.api_key_env", "MESSARI_API_KEY")?
            .set_default("sources.messari.timeout_ms", 10_000)?
            .set_default("sources.messari.price_band_min", 0.50)?
            .set_default("sources.messari.price_band_max", 2.00)?
            .set_default("sources.coingecko.timeout_ms", 10_000)?
            .set_default("sources.coingecko.price_band_min", 0.50)?
            .set_default("sources.coingecko.price_band_max", 2.00)?
            .set_default("sources.defillama.timeout_ms", 15_000)?
            .set_default("sources.defillama.price_band_min", 0.50)?
            .set_default("sources.defillama.price_band_max", 2.00)?
            // Health defaults
            .set_default("health.failure_threshold", 5)?
            .set_default("health.cooldown_secs", 60)?
            .set_default("health.half_open_max_calls", 3)?
            .set_default("health.half_open_successes_to_close", 2)?
            .set_default("health.sample_window", 100)?
            .set_default("health.error_rate_alert", 0.5)?
            .set_default("health.response_time_threshold_ms", 5_000)?
            .set_default("health.min_healthy_sources", 2)?
            .set_default("health.degraded_error_rate", 0.5)?
            .set_default("health.degraded_avg_response_ms", 8_000)?
            .set_default("health.conflict_window_mins", 60)?
            .set_default("health.conflict_penalty_per_hour", 2.0)?
            // Aggregation defaults
            .set_default("aggregation.chain_data_source", "defillama")?
            .set_default("aggregation.consensus_max_deviation", 0.05)?
            .set_default("aggregation.large_payload_threshold", 1_000)?
            .set_default("aggregation.filter_chunk_size", 250)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (STABLEWATCH_*)
            .add_source(Environment::with_prefix("STABLEWATCH").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "sources={:?} refresh={}s chain_source={} failure_threshold={}",
            self.sources.enabled,
            self.service.refresh_interval_secs,
            self.aggregation.chain_data_source,
            self.health.failure_threshold
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
