use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use manifold_config::{GatewayConfig, LoggingConfig};
use manifold_core::{
    ApiKey, GatewayError, InferenceRequest, InferenceResponse, Result, TenantId,
};
use manifold_providers::{
    AnthropicAdapter, GeminiAdapter, OllamaAdapter, OpenAiCompatAdapter, ProviderAdapter,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{StaticTenantResolver, TenantResolver};
use crate::breaker::BreakerRegistry;
use crate::factory::RunnerFactory;
use crate::jobs::{AsyncJob, AsyncJobManager};
use crate::manifests::{InMemoryManifestStore, ManifestStore};
use crate::metrics::MetricsSink;
use crate::policy::{HostProfile, SelectionPolicy};
use crate::quota::InMemoryQuota;
use crate::registry::ProviderRegistry;
use crate::router::Router;
use crate::session::{SessionFactory, SessionPools, SlotSessionFactory};
use crate::stream::ChunkStream;

const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
const QUOTA_CLEANUP_INTERVAL: Duration = Duration::from_secs(600);
const JOB_GC_INTERVAL: Duration = Duration::from_secs(60);
const JOB_RETENTION: Duration = Duration::from_secs(3600);
const JOB_WORKERS: usize = 4;

/// Install the tracing subscriber from config. Safe to call more than once;
/// later calls are no-ops.
pub fn init_tracing(config: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(&config.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    let _ = result;
}

/// Explicit constructor wiring for the dispatch plane.
///
/// Registers the built-in cloud adapters for every enabled `[providers.*]`
/// entry; native backends and custom adapters are added through
/// [`GatewayBuilder::register_adapter`].
pub struct GatewayBuilder {
    config: GatewayConfig,
    registry: ProviderRegistry,
    manifests: Option<Arc<dyn ManifestStore>>,
    resolver: Option<Arc<dyn TenantResolver>>,
    session_factory: Arc<dyn SessionFactory>,
    host: Option<HostProfile>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        let mut registry = ProviderRegistry::new();
        for (id, settings) in &config.providers {
            if !settings.enabled {
                continue;
            }
            let ctor: Option<Box<dyn Fn() -> Arc<dyn ProviderAdapter> + Send + Sync>> =
                match id.as_str() {
                    "openai" => Some(Box::new(|| Arc::new(OpenAiCompatAdapter::openai()))),
                    "cerebras" => Some(Box::new(|| Arc::new(OpenAiCompatAdapter::cerebras()))),
                    "mistral" => Some(Box::new(|| Arc::new(OpenAiCompatAdapter::mistral()))),
                    "anthropic" => Some(Box::new(|| Arc::new(AnthropicAdapter::new()))),
                    "gemini" => Some(Box::new(|| Arc::new(GeminiAdapter::new()))),
                    "ollama" => Some(Box::new(|| Arc::new(OllamaAdapter::new()))),
                    other => {
                        warn!(provider = %other, "no built-in adapter; register one explicitly");
                        None
                    }
                };
            if let Some(ctor) = ctor {
                registry.register(move || ctor());
            }
        }
        Self {
            config,
            registry,
            manifests: None,
            resolver: None,
            session_factory: Arc::new(SlotSessionFactory),
            host: None,
        }
    }

    /// Add an adapter constructor (native backends, tests).
    pub fn register_adapter<F>(mut self, ctor: F) -> Self
    where
        F: Fn() -> Arc<dyn ProviderAdapter> + Send + Sync + 'static,
    {
        self.registry.register(ctor);
        self
    }

    pub fn manifests(mut self, manifests: Arc<dyn ManifestStore>) -> Self {
        self.manifests = Some(manifests);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn TenantResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.session_factory = factory;
        self
    }

    pub fn host_profile(mut self, host: HostProfile) -> Self {
        self.host = Some(host);
        self
    }

    pub fn build(self) -> Arc<Gateway> {
        let config = self.config;
        let registry = Arc::new(self.registry);
        let manifests = self
            .manifests
            .unwrap_or_else(|| Arc::new(InMemoryManifestStore::new()));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(StaticTenantResolver::new()));
        let host = self.host.unwrap_or_else(HostProfile::detect);

        let metrics = Arc::new(MetricsSink::new(16));
        for (id, settings) in &config.providers {
            metrics.set_soft_capacity(id, settings.soft_capacity);
        }
        let breakers = Arc::new(BreakerRegistry::new(config.circuit_breaker.clone()));
        let quota = Arc::new(InMemoryQuota::new(config.quota.clone()));
        let pools = Arc::new(SessionPools::new(
            config.session.clone(),
            self.session_factory,
        ));
        let factory = Arc::new(RunnerFactory::new(
            config.runner_factory.clone(),
            Arc::clone(&registry),
            Arc::clone(&pools),
            config.providers.clone(),
        ));
        let policy = Arc::new(
            SelectionPolicy::new(
                config.routing.default_strategy,
                Arc::clone(&registry),
                metrics.clone() as Arc<dyn crate::metrics::MetricsView>,
                breakers.clone() as Arc<dyn crate::policy::BreakerView>,
                host,
            )
            .with_weights(
                config
                    .routing
                    .pools
                    .iter()
                    .flat_map(|p| p.weights.clone())
                    .collect(),
            ),
        );
        let router = Arc::new(Router::new(
            config.routing.clone(),
            Arc::clone(&registry),
            Arc::clone(&factory),
            policy,
            Arc::clone(&breakers),
            quota.clone(),
            Arc::clone(&metrics),
            Arc::clone(&manifests),
            Arc::clone(&resolver),
            config.session.acquire_timeout(),
        ));
        let jobs = AsyncJobManager::new(
            router.clone(),
            Arc::clone(&resolver),
            JOB_WORKERS,
            JOB_RETENTION,
        );

        let gateway = Arc::new(Gateway {
            router,
            jobs,
            registry,
            factory,
            pools,
            quota,
            metrics,
            breakers,
            manifests,
            shutdown_token: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        });
        gateway.spawn_maintenance();
        info!(providers = ?gateway.registry.provider_ids(), "gateway assembled");
        gateway
    }
}

/// The §6.1 surface consumed by the REST layer: infer, infer_stream,
/// submit_async, get_job, cancel_job, plus shutdown.
pub struct Gateway {
    router: Arc<Router>,
    jobs: AsyncJobManager,
    registry: Arc<ProviderRegistry>,
    factory: Arc<RunnerFactory>,
    pools: Arc<SessionPools>,
    quota: Arc<InMemoryQuota>,
    metrics: Arc<MetricsSink>,
    breakers: Arc<BreakerRegistry>,
    manifests: Arc<dyn ManifestStore>,
    shutdown_token: CancellationToken,
    shut_down: AtomicBool,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub async fn infer(
        &self,
        api_key: Option<&ApiKey>,
        request: InferenceRequest,
    ) -> Result<InferenceResponse> {
        self.ensure_running()?;
        self.router.infer(api_key, request).await
    }

    pub async fn infer_stream(
        &self,
        api_key: Option<&ApiKey>,
        request: InferenceRequest,
    ) -> Result<ChunkStream> {
        self.ensure_running()?;
        self.router.infer_stream(api_key, request).await
    }

    pub fn submit_async(
        &self,
        api_key: Option<ApiKey>,
        request: InferenceRequest,
    ) -> Result<Uuid> {
        self.ensure_running()?;
        self.jobs.submit(api_key, request)
    }

    pub fn get_job(&self, job_id: Uuid) -> Option<AsyncJob> {
        self.jobs.get(job_id)
    }

    pub fn cancel_job(&self, job_id: Uuid) -> Result<()> {
        self.jobs.cancel(job_id)
    }

    /// Construct and warm runners for a model ahead of traffic.
    pub async fn prewarm(
        &self,
        model_id: &str,
        provider_ids: &[String],
        tenant: &TenantId,
    ) -> Result<()> {
        let manifest = self
            .manifests
            .get(model_id, tenant)
            .await
            .ok_or_else(|| GatewayError::model_not_found(model_id))?;
        self.factory.prewarm(&manifest, provider_ids, tenant).await;
        Ok(())
    }

    pub fn metrics_text(&self) -> String {
        self.metrics.render_prometheus()
    }

    /// Direct router access for callers that manage their own cancellation
    /// tokens.
    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    pub fn breaker_snapshots(&self) -> Vec<crate::breaker::BreakerSnapshot> {
        self.breakers.snapshots()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(GatewayError::internal("gateway is shut down"));
        }
        Ok(())
    }

    /// Stop background maintenance and release every pooled resource.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("gateway shutting down");
        self.shutdown_token.cancel();
        self.factory.shutdown().await;
        self.pools.shutdown_all().await;
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        self.spawn_periodic(HEALTH_PROBE_INTERVAL, |gateway| async move {
            for runner in gateway.factory.active_runners().await {
                let health = runner.adapter.health().await;
                gateway.metrics.set_health(runner.provider_id(), health);
            }
        });
        self.spawn_periodic(IDLE_SWEEP_INTERVAL, |gateway| async move {
            gateway.factory.evict_idle().await;
        });
        self.spawn_periodic(SESSION_CLEANUP_INTERVAL, |gateway| async move {
            gateway.pools.cleanup_all().await;
        });
        self.spawn_periodic(QUOTA_CLEANUP_INTERVAL, |gateway| async move {
            gateway.quota.cleanup();
        });
        self.spawn_periodic(JOB_GC_INTERVAL, |gateway| async move {
            gateway.jobs.gc();
        });
    }

    fn spawn_periodic<F, Fut>(self: &Arc<Self>, period: Duration, tick: F)
    where
        F: Fn(Arc<Gateway>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let gateway = Arc::clone(self);
        let token = self.shutdown_token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tick(Arc::clone(&gateway)).await,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::ChatMessage;
    use manifold_providers::MockAdapter;

    fn manifests_with(model: &str) -> Arc<InMemoryManifestStore> {
        let store = Arc::new(InMemoryManifestStore::new());
        store.insert(manifold_core::ModelManifest::new(
            model,
            model,
            "1",
            TenantId::community(),
        ));
        store
    }

    #[tokio::test]
    async fn end_to_end_infer_through_gateway() {
        let gateway = Gateway::builder(GatewayConfig::default())
            .register_adapter(|| Arc::new(MockAdapter::new("mock").with_response("hello")))
            .manifests(manifests_with("test-model"))
            .host_profile(HostProfile::assume(u64::MAX, false))
            .build();

        let request = InferenceRequest::new("test-model", vec![ChatMessage::user("hi")]);
        let response = gateway.infer(None, request).await.unwrap();
        assert_eq!(response.content, "hello");
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_blocks_new_work() {
        let gateway = Gateway::builder(GatewayConfig::default())
            .register_adapter(|| Arc::new(MockAdapter::new("mock").with_response("hello")))
            .manifests(manifests_with("test-model"))
            .build();
        gateway.shutdown().await;
        gateway.shutdown().await;
        let request = InferenceRequest::new("test-model", vec![ChatMessage::user("hi")]);
        assert!(gateway.infer(None, request).await.is_err());
    }

    #[tokio::test]
    async fn async_job_round_trip() {
        let gateway = Gateway::builder(GatewayConfig::default())
            .register_adapter(|| Arc::new(MockAdapter::new("mock").with_response("done")))
            .manifests(manifests_with("test-model"))
            .host_profile(HostProfile::assume(u64::MAX, false))
            .build();

        let request = InferenceRequest::new("test-model", vec![ChatMessage::user("hi")]);
        let job_id = gateway.submit_async(None, request).unwrap();
        for _ in 0..200 {
            if gateway.get_job(job_id).unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let job = gateway.get_job(job_id).unwrap();
        assert_eq!(job.status, crate::jobs::JobStatus::Completed);
        assert!(gateway.get_job(Uuid::new_v4()).is_none());
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn metrics_text_renders() {
        let gateway = Gateway::builder(GatewayConfig::default())
            .register_adapter(|| Arc::new(MockAdapter::new("mock").with_response("hello")))
            .manifests(manifests_with("test-model"))
            .host_profile(HostProfile::assume(u64::MAX, false))
            .build();
        let request = InferenceRequest::new("test-model", vec![ChatMessage::user("hi")]);
        gateway.infer(None, request).await.unwrap();
        let text = gateway.metrics_text();
        assert!(text.contains(r#"manifold_requests_total{provider="mock"} 1"#));
        gateway.shutdown().await;
    }
}
