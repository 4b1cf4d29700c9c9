//! Provider registry.
//!
//! Maps backend ids to providers. Entries registered with a factory are
//! constructed on first use; failover iterates [`ProviderRegistry::candidates`]
//! in priority order.

use dashmap::DashMap;
use gateway_core::{GatewayError, HealthStatus, Provider};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Builds a provider on first use
pub type ProviderFactory = Arc<dyn Fn() -> Result<Arc<dyn Provider>, GatewayError> + Send + Sync>;

/// A registered backend
pub struct ProviderEntry {
    id: String,
    priority: u32,
    models: Vec<String>,
    factory: ProviderFactory,
    instance: OnceCell<Arc<dyn Provider>>,
}

impl ProviderEntry {
    /// Backend id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lower values are tried first
    #[must_use]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Models this backend is configured for; empty means any
    #[must_use]
    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// Whether this entry is configured for `model`
    #[must_use]
    pub fn serves(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m.eq_ignore_ascii_case(model))
    }

    /// Whether the provider has been built
    #[must_use]
    pub fn is_constructed(&self) -> bool {
        self.instance.get().is_some()
    }

    /// The provider, building it if needed
    ///
    /// # Errors
    /// Returns the factory's error; construction is attempted again next time
    pub fn provider(&self) -> Result<Arc<dyn Provider>, GatewayError> {
        self.instance
            .get_or_try_init(|| {
                debug!(provider = %self.id, "Constructing provider");
                (self.factory)()
            })
            .map(Arc::clone)
    }
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("models", &self.models)
            .field("constructed", &self.is_constructed())
            .finish_non_exhaustive()
    }
}

/// Registry of backends
#[derive(Default)]
pub struct ProviderRegistry {
    entries: DashMap<String, Arc<ProviderEntry>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an already built provider
    pub fn register(&self, provider: Arc<dyn Provider>, priority: u32) {
        let id = provider.id().to_string();
        let instance = OnceCell::new();
        let _ = instance.set(Arc::clone(&provider));
        let factory: ProviderFactory = Arc::new(move || Ok(Arc::clone(&provider)));
        self.insert(ProviderEntry {
            id,
            priority,
            models: Vec::new(),
            factory,
            instance,
        });
    }

    /// Register a provider built lazily by `factory`
    pub fn register_factory<F>(
        &self,
        id: impl Into<String>,
        priority: u32,
        models: Vec<String>,
        factory: F,
    ) where
        F: Fn() -> Result<Arc<dyn Provider>, GatewayError> + Send + Sync + 'static,
    {
        self.insert(ProviderEntry {
            id: id.into(),
            priority,
            models,
            factory: Arc::new(factory),
            instance: OnceCell::new(),
        });
    }

    fn insert(&self, entry: ProviderEntry) {
        info!(provider = %entry.id, priority = entry.priority, "Registered provider");
        self.entries.insert(entry.id.clone(), Arc::new(entry));
    }

    /// Remove a backend
    pub fn remove(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Get a provider by id, building it if needed
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        let entry = self.entries.get(id).map(|e| Arc::clone(e.value()))?;
        match entry.provider() {
            Ok(provider) => Some(provider),
            Err(e) => {
                error!(provider = %id, error = %e, "Failed to construct provider");
                None
            }
        }
    }

    /// Entries configured for `model`, lowest priority value first
    #[must_use]
    pub fn candidates(&self, model: &str) -> Vec<Arc<ProviderEntry>> {
        let mut candidates: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.serves(model))
            .map(|e| Arc::clone(e.value()))
            .collect();
        candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        candidates
    }

    /// Registered ids, sorted
    #[must_use]
    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of registered backends
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no backend is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Probe every constructed backend
    pub async fn health_check_all(&self) -> Vec<(String, HealthStatus)> {
        let constructed: Vec<_> = self
            .entries
            .iter()
            .filter_map(|e| e.instance.get().map(Arc::clone))
            .collect();

        let mut results = Vec::with_capacity(constructed.len());
        for provider in constructed {
            let status = provider.health_check().await;
            results.push((provider.id().to_string(), status));
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.provider_ids())
            .finish()
    }
}
