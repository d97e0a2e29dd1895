//! Source registry
//!
//! Holds the configured adapter set and exposes the active subset (enabled
//! in config and properly configured) to the aggregation engine. No
//! business logic beyond filtering and lookup.

use std::sync::Arc;

use crate::config::SourcesConfig;
use crate::sources::{
    CmcSource, CoinGeckoSource, DefiLlamaSource, MessariSource, StablecoinSource,
};
use crate::types::SourceId;

#[derive(Default)]
pub struct SourceRegistry {
    sources: Vec<Arc<dyn StablecoinSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// Build the registry from configuration, instantiating only adapters
    /// whose id appears in the enabled list
    pub fn create_default(config: &SourcesConfig) -> Self {
        let mut registry = Self::new();

        for id in SourceId::all() {
            if !config.is_enabled(id) {
                tracing::debug!(source = %id, "Source disabled by configuration");
                continue;
            }
            let settings = config.settings(id);
            let adapter: Arc<dyn StablecoinSource> = match id {
                SourceId::Cmc => Arc::new(CmcSource::new(settings)),
                SourceId::Messari => Arc::new(MessariSource::new(settings)),
                SourceId::CoinGecko => Arc::new(CoinGeckoSource::new(settings)),
                SourceId::DefiLlama => Arc::new(DefiLlamaSource::new(settings)),
            };
            registry.register(adapter);
        }

        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn StablecoinSource>) {
        if self.get(adapter.source_id()).is_some() {
            tracing::warn!(source = %adapter.source_id(), "Duplicate source registration ignored");
            return;
        }
        tracing::info!(
            source = %adapter.source_id(),
            name = adapter.source_name(),
            priority = adapter.capabilities().priority,
            "Registered data source"
        );
        self.sources.push(adapter);
    }

    pub fn get(&self, id: SourceId) -> Option<Arc<dyn StablecoinSource>> {
        self.sources
            .iter()
            .find(|s| s.source_id() == id)
            .cloned()
    }

    pub fn get_all(&self) -> Vec<Arc<dyn StablecoinSource>> {
        self.sources.clone()
    }

    /// Only adapters that are properly configured (keys present etc.)
    pub fn get_active(&self) -> Vec<Arc<dyn StablecoinSource>> {
        self.sources
            .iter()
            .filter(|s| s.is_configured())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
