use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::provider::{ModelInfo, ModelProvider};

/// Flat mapping of providers keyed by id. Registration order matters:
/// detection walks providers in the order they were registered.
///
/// Lifecycle is `reset → initialize → use → reset`; tests rely on `reset`.
pub struct ProviderRegistry {
    providers: RwLock<Vec<Arc<dyn ModelProvider>>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
        }
    }

    /// Register a provider. A provider with the same id is replaced in
    /// place, keeping its detection position.
    pub fn register(&self, provider: Arc<dyn ModelProvider>) {
        tracing::debug!(provider = provider.id(), "provider registered");
        let mut providers = self.providers.write();
        if let Some(existing) = providers.iter_mut().find(|p| p.id() == provider.id()) {
            *existing = provider;
        } else {
            providers.push(provider);
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ModelProvider>> {
        self.providers.read().iter().find(|p| p.id() == id).cloned()
    }

    /// First registered provider that owns the model id.
    pub fn detect_provider(&self, model_id: &str) -> Option<Arc<dyn ModelProvider>> {
        self.providers
            .read()
            .iter()
            .find(|p| p.owns_model(model_id))
            .cloned()
    }

    pub fn first(&self) -> Option<Arc<dyn ModelProvider>> {
        self.providers.read().first().cloned()
    }

    pub fn list(&self) -> Vec<Arc<dyn ModelProvider>> {
        self.providers.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }

    pub fn reset(&self) {
        self.providers.write().clear();
    }
}

/// Process-wide registry used by the daemon wiring.
pub fn global_registry() -> Arc<ProviderRegistry> {
    static REGISTRY: OnceLock<Arc<ProviderRegistry>> = OnceLock::new();
    REGISTRY
        .get_or_init(|| Arc::new(ProviderRegistry::new()))
        .clone()
}

/// Process-wide model list cache keyed by an arbitrary cache key.
pub struct ModelsCache {
    entries: RwLock<HashMap<String, Vec<ModelInfo>>>,
}

impl Default for ModelsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelsCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<ModelInfo>> {
        self.entries.read().get(key).cloned()
    }

    pub fn insert(&self, key: &str, models: Vec<ModelInfo>) {
        self.entries.write().insert(key.to_string(), models);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

pub fn models_cache() -> &'static ModelsCache {
    static CACHE: OnceLock<ModelsCache> = OnceLock::new();
    CACHE.get_or_init(ModelsCache::new)
}

/// Collect every registered provider's models, deduplicated by canonical id
/// (first provider wins). Served from the cache when warm.
pub fn collect_models(registry: &ProviderRegistry, cache: &ModelsCache) -> Vec<ModelInfo> {
    const CACHE_KEY: &str = "all";
    if let Some(cached) = cache.get(CACHE_KEY) {
        return cached;
    }

    let mut seen = std::collections::HashSet::new();
    let mut models = Vec::new();
    for provider in registry.list() {
        for model in provider.get_models() {
            if seen.insert(model.id.clone()) {
                models.push(model);
            }
        }
    }
    cache.insert(CACHE_KEY, models.clone());
    models
}

/// Whether any registered provider recognizes the model id.
pub fn is_known_model(registry: &ProviderRegistry, model_id: &str) -> bool {
    registry.detect_provider(model_id).is_some()
}
