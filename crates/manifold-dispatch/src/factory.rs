use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use manifold_config::{ProviderSettings, RunnerFactoryConfig};
use manifold_core::{
    ChatMessage, ErrorKind, GatewayError, InferenceRequest, ModelManifest, RequestContext, Result,
    RunnerCacheKey, TenantId,
};
use manifold_providers::{ProviderAdapter, ProviderConfig};
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use crate::registry::ProviderRegistry;
use crate::session::{SessionPool, SessionPools};

/// An initialized provider+model instance from the warm pool, bundled with
/// the session pool for its (model, tenant) pair.
pub struct Runner {
    pub key: RunnerCacheKey,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub sessions: Arc<SessionPool>,
    created_at: Instant,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("key", &self.key)
            .field("created_at", &self.created_at)
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

impl Runner {
    pub fn provider_id(&self) -> &str {
        &self.key.provider_id
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Release backend handles. Exactly one call reaches the adapter.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.adapter.shutdown().await;
    }

    /// Feed a one-token dummy prompt through the backend to warm its caches.
    pub async fn warm_up(&self) -> Result<()> {
        let mut request =
            InferenceRequest::new(&self.key.model_id, vec![ChatMessage::user("ping")]);
        request.parameters.max_tokens = Some(1);
        let ctx = RequestContext::new(self.key.tenant_id.clone(), &request.request_id);
        self.adapter.infer(&request, &ctx).await.map(|_| ())
    }
}

struct CacheSlot {
    cell: Arc<OnceCell<Arc<Runner>>>,
    last_used: Instant,
}

impl CacheSlot {
    fn new() -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            last_used: Instant::now(),
        }
    }
}

/// Warm cache of runners keyed by (tenant, model, provider).
///
/// Construction for a missing key is coalesced through a per-key `OnceCell`:
/// concurrent callers wait on one build. Failed initialization is never
/// cached. Eviction (LRU beyond `max_pool_size`, idle sweep, shutdown)
/// invokes `Runner::shutdown` exactly once per runner.
pub struct RunnerFactory {
    config: RunnerFactoryConfig,
    registry: Arc<ProviderRegistry>,
    pools: Arc<SessionPools>,
    provider_settings: HashMap<String, ProviderSettings>,
    entries: Mutex<HashMap<RunnerCacheKey, CacheSlot>>,
}

impl RunnerFactory {
    pub fn new(
        config: RunnerFactoryConfig,
        registry: Arc<ProviderRegistry>,
        pools: Arc<SessionPools>,
        provider_settings: HashMap<String, ProviderSettings>,
    ) -> Self {
        Self {
            config,
            registry,
            pools,
            provider_settings,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch or construct the runner for (tenant, model, provider).
    pub async fn get_runner(
        &self,
        manifest: &ModelManifest,
        provider_id: &str,
        tenant: &TenantId,
    ) -> Result<Arc<Runner>> {
        let key = RunnerCacheKey::new(tenant.clone(), &manifest.model_id, provider_id);

        let (cell, evicted) = {
            let mut entries = self.entries.lock().await;
            let slot = entries.entry(key.clone()).or_insert_with(CacheSlot::new);
            slot.last_used = Instant::now();
            let cell = Arc::clone(&slot.cell);
            let evicted = if entries.len() > self.config.max_pool_size {
                Self::evict_lru(&mut entries, &key)
            } else {
                None
            };
            (cell, evicted)
        };
        if let Some(victim) = evicted {
            info!(key = %victim.key, "evicting LRU runner");
            victim.shutdown().await;
        }

        let built = cell
            .get_or_try_init(|| self.build(manifest, provider_id, tenant, &key))
            .await;
        match built {
            Ok(runner) => Ok(Arc::clone(runner)),
            Err(e) => {
                // failed construction must not occupy a cache slot
                let mut entries = self.entries.lock().await;
                if let Some(slot) = entries.get(&key)
                    && slot.cell.get().is_none()
                {
                    entries.remove(&key);
                }
                Err(e)
            }
        }
    }

    async fn build(
        &self,
        manifest: &ModelManifest,
        provider_id: &str,
        tenant: &TenantId,
        key: &RunnerCacheKey,
    ) -> Result<Arc<Runner>> {
        let adapter = self.registry.make(provider_id).ok_or_else(|| {
            GatewayError::new(
                ErrorKind::InitFailed,
                format!("provider {provider_id} is not registered"),
            )
            .with_context("provider_id", provider_id)
        })?;
        let config = self.provider_config(manifest, provider_id);
        adapter.initialize(&config).await?;
        let sessions = self.pools.get_or_create(&manifest.model_id, tenant);
        info!(key = %key, "runner initialized");
        Ok(Arc::new(Runner {
            key: key.clone(),
            adapter,
            sessions,
            created_at: Instant::now(),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Deployment settings plus the artifact location the provider can load.
    fn provider_config(&self, manifest: &ModelManifest, provider_id: &str) -> ProviderConfig {
        let settings = self
            .provider_settings
            .get(provider_id)
            .cloned()
            .unwrap_or_default();
        let mut config = ProviderConfig {
            api_key: settings.api_key,
            base_url: settings.base_url,
            models: settings.models,
            extra: Default::default(),
        };
        if let Some(caps) = self.registry.capabilities(provider_id) {
            let artifact = manifest
                .artifacts
                .iter()
                .find(|(format, _)| caps.supported_formats.contains(format))
                .map(|(_, location)| location.clone());
            if let Some(artifact) = artifact {
                config
                    .extra
                    .insert("artifact".into(), serde_json::json!(artifact));
            }
        }
        config
    }

    fn evict_lru(
        entries: &mut HashMap<RunnerCacheKey, CacheSlot>,
        protect: &RunnerCacheKey,
    ) -> Option<Arc<Runner>> {
        let victim_key = entries
            .iter()
            .filter(|(key, slot)| *key != protect && slot.cell.get().is_some())
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(key, _)| key.clone())?;
        let slot = entries.remove(&victim_key)?;
        slot.cell.get().cloned()
    }

    /// Evict runners idle past the configured timeout. Called periodically.
    pub async fn evict_idle(&self) {
        let idle_timeout = self.config.idle_timeout();
        let victims: Vec<Arc<Runner>> = {
            let mut entries = self.entries.lock().await;
            let stale: Vec<RunnerCacheKey> = entries
                .iter()
                .filter(|(_, slot)| {
                    slot.cell.get().is_some() && slot.last_used.elapsed() > idle_timeout
                })
                .map(|(key, _)| key.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|key| entries.remove(&key).and_then(|s| s.cell.get().cloned()))
                .collect()
        };
        for runner in victims {
            info!(key = %runner.key, "evicting idle runner");
            runner.shutdown().await;
        }
    }

    /// Construct and warm runners ahead of traffic. Individual failures are
    /// logged, never fatal.
    pub async fn prewarm(
        &self,
        manifest: &ModelManifest,
        provider_ids: &[String],
        tenant: &TenantId,
    ) {
        let jobs = provider_ids.iter().map(|provider_id| async move {
            match self.get_runner(manifest, provider_id, tenant).await {
                Ok(runner) => {
                    if let Err(e) = runner.warm_up().await {
                        warn!(key = %runner.key, error = %e, "runner warm-up failed");
                    }
                }
                Err(e) => {
                    warn!(provider = %provider_id, model = %manifest.model_id, error = %e, "prewarm construction failed");
                }
            }
        });
        futures::future::join_all(jobs).await;
    }

    /// Shut down every cached runner. Idempotent.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Runner>> = {
            let mut entries = self.entries.lock().await;
            entries
                .drain()
                .filter_map(|(_, slot)| slot.cell.get().cloned())
                .collect()
        };
        for runner in drained {
            runner.shutdown().await;
        }
    }

    /// Every initialized runner currently in the cache; the health prober
    /// walks these, since only initialized adapters can answer probes.
    pub async fn active_runners(&self) -> Vec<Arc<Runner>> {
        self.entries
            .lock()
            .await
            .values()
            .filter_map(|slot| slot.cell.get().cloned())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_config::SessionConfig;
    use manifold_providers::{MockAdapter, OpenAiCompatAdapter};
    use parking_lot::Mutex as PlMutex;

    fn pools() -> Arc<SessionPools> {
        Arc::new(SessionPools::new(
            SessionConfig::default(),
            Arc::new(crate::session::SlotSessionFactory),
        ))
    }

    /// Registry whose ctor records every adapter instance it hands out.
    /// Index 0 is always the registration-time query prototype; runner
    /// instances start at index 1.
    fn recording_registry(id: &str) -> (Arc<ProviderRegistry>, Arc<PlMutex<Vec<Arc<MockAdapter>>>>) {
        let created: Arc<PlMutex<Vec<Arc<MockAdapter>>>> = Arc::new(PlMutex::new(Vec::new()));
        let mut registry = ProviderRegistry::new();
        let id = id.to_string();
        let created_in = Arc::clone(&created);
        registry.register(move || {
            let adapter = Arc::new(MockAdapter::new(id.clone()));
            created_in.lock().push(Arc::clone(&adapter));
            adapter
        });
        (Arc::new(registry), created)
    }

    fn manifest(model: &str) -> ModelManifest {
        ModelManifest::new(model, model, "1", TenantId::community())
    }

    fn factory_with(
        max_pool_size: usize,
        registry: Arc<ProviderRegistry>,
    ) -> RunnerFactory {
        RunnerFactory::new(
            RunnerFactoryConfig {
                max_pool_size,
                idle_timeout_secs: 900,
            },
            registry,
            pools(),
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn caches_runner_per_key() {
        let (registry, created) = recording_registry("mock");
        let factory = factory_with(10, registry);
        let tenant = TenantId::community();
        let m = manifest("m1");
        let a = factory.get_runner(&m, "mock", &tenant).await.unwrap();
        let b = factory.get_runner(&m, "mock", &tenant).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(created.lock().len(), 2); // prototype + one runner
        // different tenant → different runner
        let other = TenantId::new("acme").unwrap();
        let m_acme = ModelManifest::new("m1", "m1", "1", other.clone());
        factory.get_runner(&m_acme, "mock", &other).await.unwrap();
        assert_eq!(created.lock().len(), 3);
    }

    #[tokio::test]
    async fn concurrent_construction_is_coalesced() {
        let (registry, created) = recording_registry("mock");
        let factory = Arc::new(factory_with(10, registry));
        let tenant = TenantId::community();
        let m = manifest("m1");
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let factory = Arc::clone(&factory);
                let m = m.clone();
                let tenant = tenant.clone();
                tokio::spawn(async move { factory.get_runner(&m, "mock", &tenant).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(created.lock().len(), 2); // prototype + one coalesced build
    }

    #[tokio::test]
    async fn lru_eviction_shuts_down_victim_once() {
        let (registry, created) = recording_registry("mock");
        let factory = RunnerFactory::new(
            RunnerFactoryConfig {
                max_pool_size: 2,
                idle_timeout_secs: 900,
            },
            registry,
            pools(),
            HashMap::new(),
        );
        let tenant = TenantId::community();
        factory.get_runner(&manifest("k1"), "mock", &tenant).await.unwrap();
        factory.get_runner(&manifest("k2"), "mock", &tenant).await.unwrap();
        // touch k1 is oldest: creating k3 evicts it
        factory.get_runner(&manifest("k3"), "mock", &tenant).await.unwrap();
        assert_eq!(factory.len().await, 2);
        let adapters = created.lock();
        // adapters[0] is the prototype; k1's runner is adapters[1]
        assert_eq!(adapters[1].shutdown_count(), 1);
        assert_eq!(adapters[2].shutdown_count(), 0);
        assert_eq!(adapters[3].shutdown_count(), 0);
    }

    #[tokio::test]
    async fn failed_initialization_is_not_cached() {
        let mut registry = ProviderRegistry::new();
        // no api key configured: initialize fails
        registry.register(|| Arc::new(OpenAiCompatAdapter::openai()));
        let factory = factory_with(10, Arc::new(registry));
        let tenant = TenantId::community();
        let err = factory
            .get_runner(&manifest("gpt-4o"), "openai", &tenant)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InitFailed);
        assert!(factory.is_empty().await);
    }

    #[tokio::test]
    async fn idle_eviction_sweeps_stale_runners() {
        let (registry, created) = recording_registry("mock");
        let factory = RunnerFactory::new(
            RunnerFactoryConfig {
                max_pool_size: 10,
                idle_timeout_secs: 0,
            },
            registry,
            pools(),
            HashMap::new(),
        );
        let tenant = TenantId::community();
        factory.get_runner(&manifest("m1"), "mock", &tenant).await.unwrap();
        factory.evict_idle().await;
        assert!(factory.is_empty().await);
        assert_eq!(created.lock()[1].shutdown_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (registry, created) = recording_registry("mock");
        let factory = factory_with(10, registry);
        let tenant = TenantId::community();
        factory.get_runner(&manifest("m1"), "mock", &tenant).await.unwrap();
        factory.shutdown().await;
        factory.shutdown().await;
        assert!(factory.is_empty().await);
        assert_eq!(created.lock()[1].shutdown_count(), 1);
    }

    #[tokio::test]
    async fn prewarm_constructs_and_warms() {
        let created: Arc<PlMutex<Vec<Arc<MockAdapter>>>> = Arc::new(PlMutex::new(Vec::new()));
        let mut registry = ProviderRegistry::new();
        let created_in = Arc::clone(&created);
        registry.register(move || {
            let adapter = Arc::new(MockAdapter::new("mock").with_response("pong"));
            created_in.lock().push(Arc::clone(&adapter));
            adapter
        });
        let factory = factory_with(10, Arc::new(registry));
        let tenant = TenantId::community();
        factory
            .prewarm(&manifest("m1"), &["mock".to_string()], &tenant)
            .await;
        assert_eq!(factory.len().await, 1);
        // the warm-up prompt reached the runner's adapter, not the prototype
        assert_eq!(created.lock()[1].recorded_requests().lock().len(), 1);
        assert_eq!(created.lock()[0].recorded_requests().lock().len(), 0);
    }

    #[tokio::test]
    async fn unknown_provider_fails() {
        let (registry, _) = recording_registry("mock");
        let factory = factory_with(10, registry);
        let tenant = TenantId::community();
        let err = factory
            .get_runner(&manifest("m1"), "nope", &tenant)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InitFailed);
    }
}
