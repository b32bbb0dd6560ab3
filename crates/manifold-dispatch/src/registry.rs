use std::sync::Arc;

use manifold_core::{InferenceRequest, ProviderCapabilities};
use manifold_providers::ProviderAdapter;
use tracing::info;

type AdapterCtor = Arc<dyn Fn() -> Arc<dyn ProviderAdapter> + Send + Sync>;

struct RegistryEntry {
    id: String,
    /// Un-initialized instance used for capability and supports queries.
    prototype: Arc<dyn ProviderAdapter>,
    ctor: AdapterCtor,
}

/// The set of provider kinds this deployment knows how to construct.
/// Registration happens once at startup; the runner factory mints fresh
/// adapter instances per (tenant, model, provider) from the constructors.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: Vec<RegistryEntry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, ctor: F)
    where
        F: Fn() -> Arc<dyn ProviderAdapter> + Send + Sync + 'static,
    {
        let prototype = ctor();
        let id = prototype.id().to_string();
        info!(provider = %id, "registered provider adapter");
        self.entries.push(RegistryEntry {
            id,
            prototype,
            ctor: Arc::new(ctor),
        });
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.entries.iter().any(|e| e.id == provider_id)
    }

    pub fn capabilities(&self, provider_id: &str) -> Option<ProviderCapabilities> {
        self.entries
            .iter()
            .find(|e| e.id == provider_id)
            .map(|e| e.prototype.capabilities())
    }

    pub fn supports(&self, provider_id: &str, model_id: &str, request: &InferenceRequest) -> bool {
        self.entries
            .iter()
            .find(|e| e.id == provider_id)
            .is_some_and(|e| e.prototype.supports(model_id, request))
    }

    /// Construct a fresh, un-initialized adapter instance.
    pub fn make(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.entries
            .iter()
            .find(|e| e.id == provider_id)
            .map(|e| (e.ctor)())
    }
}
