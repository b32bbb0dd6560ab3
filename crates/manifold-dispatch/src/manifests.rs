use async_trait::async_trait;
use dashmap::DashMap;
use manifold_core::{ModelManifest, TenantId};

/// Read access to the model registry. The persistent registry lives outside
/// the dispatch plane; this trait is its seam.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Look up a manifest by model and tenant. Tenant-owned manifests shadow
    /// community ones.
    async fn get(&self, model_id: &str, tenant: &TenantId) -> Option<ModelManifest>;

    /// Candidate provider ids for a model family. Empty means "no mapping":
    /// the router then considers every registered provider.
    async fn providers_for(&self, model_id: &str) -> Vec<String>;
}

/// Process-local manifest store for single-node deployments and tests.
#[derive(Default)]
pub struct InMemoryManifestStore {
    manifests: DashMap<(String, TenantId), ModelManifest>,
    model_providers: DashMap<String, Vec<String>>,
}

impl InMemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, manifest: ModelManifest) {
        self.manifests
            .insert((manifest.model_id.clone(), manifest.tenant_id.clone()), manifest);
    }

    /// Record the model → provider mapping used to gather candidates.
    pub fn map_model<I, S>(&self, model_id: impl Into<String>, providers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.model_providers
            .insert(model_id.into(), providers.into_iter().map(Into::into).collect());
    }
}

#[async_trait]
impl ManifestStore for InMemoryManifestStore {
    async fn get(&self, model_id: &str, tenant: &TenantId) -> Option<ModelManifest> {
        if let Some(found) = self
            .manifests
            .get(&(model_id.to_string(), tenant.clone()))
        {
            return Some(found.clone());
        }
        // shared community models are visible to every tenant
        self.manifests
            .get(&(model_id.to_string(), TenantId::community()))
            .map(|m| m.clone())
    }

    async fn providers_for(&self, model_id: &str) -> Vec<String> {
        self.model_providers
            .get(model_id)
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tenant_manifest_shadows_community() {
        let store = InMemoryManifestStore::new();
        let acme = TenantId::new("acme").unwrap();
        store.insert(ModelManifest::new("m", "shared", "1", TenantId::community()));
        store.insert(ModelManifest::new("m", "private", "2", acme.clone()));

        assert_eq!(store.get("m", &acme).await.unwrap().name, "private");
        let other = TenantId::new("globex").unwrap();
        assert_eq!(store.get("m", &other).await.unwrap().name, "shared");
        assert!(store.get("missing", &acme).await.is_none());
    }

    #[tokio::test]
    async fn model_provider_mapping() {
        let store = InMemoryManifestStore::new();
        store.map_model("m", ["openai", "anthropic"]);
        assert_eq!(store.providers_for("m").await, vec!["openai", "anthropic"]);
        assert!(store.providers_for("unmapped").await.is_empty());
    }
}
