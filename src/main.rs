//! Service entrypoint
//!
//! Loads configuration, builds the source registry, health monitor, and
//! aggregation engine, runs an initial refresh, then refreshes on a fixed
//! interval until ctrl-c. With the `api` feature the HTTP surface serves
//! alongside the refresh loop.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stablewatch::aggregator::AggregationEngine;
use stablewatch::config::AppConfig;
use stablewatch::health::HealthMonitor;
use stablewatch::sources::SourceRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load()?;
    info!("Configuration loaded: {}", config.digest());

    let registry = Arc::new(SourceRegistry::create_default(&config.sources));
    if registry.is_empty() {
        anyhow::bail!("no data sources enabled; check sources.enabled in configuration");
    }
    let active = registry.get_active().len();
    info!(
        registered = registry.len(),
        active,
        "Source registry ready"
    );
    if active < registry.len() {
        warn!(
            unconfigured = registry.len() - active,
            "Some sources registered but missing API keys; they will be skipped"
        );
    }

    let monitor = Arc::new(HealthMonitor::new(config.health.clone()));
    let refresh_interval = Duration::from_secs(config.service.refresh_interval_secs);
    #[cfg(feature = "api")]
    let api_bind = config.service.api_bind.clone();
    let engine = Arc::new(AggregationEngine::new(registry, monitor, config));

    #[cfg(feature = "api")]
    {
        let router = stablewatch::api::create_router(engine.clone());
        let listener = tokio::net::TcpListener::bind(&api_bind).await?;
        info!(bind = %api_bind, "HTTP API listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!("API server error: {e}");
            }
        });
    }

    // Initial refresh so the service starts with data
    let outcome = engine.refresh().await;
    if outcome.success {
        info!(
            assets = outcome.stablecoins_updated,
            duration_ms = outcome.duration_ms,
            "Initial refresh complete"
        );
    } else {
        error!(errors = ?outcome.errors, "Initial refresh failed; will retry on schedule");
    }

    let mut interval = tokio::time::interval(refresh_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let outcome = engine.refresh().await;
                if !outcome.success {
                    warn!(errors = ?outcome.errors, "Refresh cycle failed");
                }
                let system = engine.health_status();
                if system.degraded.recommended {
                    warn!(
                        score = system.score,
                        reasons = ?system.degraded.reasons,
                        "System health degraded"
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}
