use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use manifold_config::RoutingConfig;
use manifold_core::{
    ApiKey, ErrorKind, GatewayError, InferenceRequest, InferenceResponse, ModelManifest,
    RequestContext, Result,
};
use manifold_providers::TokenEvent;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::TenantResolver;
use crate::breaker::BreakerRegistry;
use crate::factory::RunnerFactory;
use crate::jobs::JobExecutor;
use crate::manifests::ManifestStore;
use crate::metrics::MetricsSink;
use crate::policy::SelectionPolicy;
use crate::quota::{QuotaEnforcer, ResourceKind};
use crate::registry::ProviderRegistry;
use crate::stream::{self, ChunkStream, StreamConfig, StreamOutcome};

/// Orchestrates one inference end to end: tenant resolution, quota, candidate
/// ranking, breaker guard, runner lookup, session checkout, dispatch, and
/// failover across candidates on retryable errors.
pub struct Router {
    config: RoutingConfig,
    registry: Arc<ProviderRegistry>,
    factory: Arc<RunnerFactory>,
    policy: Arc<SelectionPolicy>,
    breakers: Arc<BreakerRegistry>,
    quota: Arc<dyn QuotaEnforcer>,
    metrics: Arc<MetricsSink>,
    manifests: Arc<dyn ManifestStore>,
    resolver: Arc<dyn TenantResolver>,
    session_acquire_timeout: Duration,
    stream_config: StreamConfig,
}

#[allow(clippy::too_many_arguments)]
impl Router {
    pub fn new(
        config: RoutingConfig,
        registry: Arc<ProviderRegistry>,
        factory: Arc<RunnerFactory>,
        policy: Arc<SelectionPolicy>,
        breakers: Arc<BreakerRegistry>,
        quota: Arc<dyn QuotaEnforcer>,
        metrics: Arc<MetricsSink>,
        manifests: Arc<dyn ManifestStore>,
        resolver: Arc<dyn TenantResolver>,
        session_acquire_timeout: Duration,
    ) -> Self {
        Self {
            config,
            registry,
            factory,
            policy,
            breakers,
            quota,
            metrics,
            manifests,
            resolver,
            session_acquire_timeout,
            stream_config: StreamConfig::default(),
        }
    }

    pub fn with_stream_config(mut self, stream_config: StreamConfig) -> Self {
        self.stream_config = stream_config;
        self
    }

    /// `provider/model` references set the preferred provider and strip the
    /// prefix before manifest lookup.
    fn resolve_model_reference(&self, request: &mut InferenceRequest) {
        if let Some((prefix, rest)) = request.model.split_once('/')
            && self.registry.contains(prefix)
        {
            request.preferred_provider = Some(prefix.to_string());
            request.model = rest.to_string();
        }
    }

    fn request_context(
        &self,
        request: &InferenceRequest,
        tenant: manifold_core::TenantId,
        cancel: CancellationToken,
    ) -> RequestContext {
        let timeout = request
            .timeout()
            .unwrap_or(Duration::from_secs(self.config.default_timeout_secs));
        RequestContext::new(tenant, &request.request_id)
            .with_deadline(timeout)
            .with_cancellation(cancel)
    }

    fn release_reservations(&self, ctx: &RequestContext) {
        self.quota
            .release(&ctx.tenant_id, ResourceKind::Requests, &ctx.request_id);
        self.quota
            .release(&ctx.tenant_id, ResourceKind::Concurrent, &ctx.request_id);
    }

    fn reserve_admission(&self, ctx: &RequestContext) -> Result<()> {
        self.quota
            .reserve(&ctx.tenant_id, ResourceKind::Requests, 1, &ctx.request_id)?;
        if let Err(e) =
            self.quota
                .reserve(&ctx.tenant_id, ResourceKind::Concurrent, 1, &ctx.request_id)
        {
            self.quota
                .release(&ctx.tenant_id, ResourceKind::Requests, &ctx.request_id);
            return Err(e);
        }
        Ok(())
    }

    /// Manifest lookup plus candidate ranking. Candidates come from the
    /// model→provider mapping, falling back to every registered provider.
    async fn prepare(
        &self,
        request: &InferenceRequest,
        ctx: &RequestContext,
    ) -> Result<(ModelManifest, Vec<String>)> {
        let manifest = self
            .manifests
            .get(&request.model, &ctx.tenant_id)
            .await
            .ok_or_else(|| {
                GatewayError::model_not_found(&request.model)
                    .with_context("tenant_id", ctx.tenant_id.as_str())
            })?;

        let mut candidates = self.manifests.providers_for(&request.model).await;
        if candidates.is_empty() {
            candidates = self.registry.provider_ids();
        }
        let ranked = self.policy.rank(&manifest, request, &candidates);
        if ranked.is_empty() {
            return Err(GatewayError::no_compatible_provider(&request.model)
                .with_context("tenant_id", ctx.tenant_id.as_str()));
        }
        Ok((manifest, ranked.into_iter().map(|(id, _)| id).collect()))
    }

    // ── Synchronous path ───────────────────────────────────────

    pub async fn infer(
        &self,
        api_key: Option<&ApiKey>,
        request: InferenceRequest,
    ) -> Result<InferenceResponse> {
        self.infer_with_cancellation(api_key, request, CancellationToken::new())
            .await
    }

    pub async fn infer_with_cancellation(
        &self,
        api_key: Option<&ApiKey>,
        mut request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<InferenceResponse> {
        request.validate()?;
        let tenant = self.resolver.resolve(api_key)?;
        self.resolve_model_reference(&mut request);
        let ctx = self.request_context(&request, tenant, cancel);

        self.reserve_admission(&ctx)?;
        let result = self.dispatch(&request, &ctx).await;
        self.release_reservations(&ctx);
        result
    }

    async fn dispatch(
        &self,
        request: &InferenceRequest,
        ctx: &RequestContext,
    ) -> Result<InferenceResponse> {
        let (manifest, candidates) = self.prepare(request, ctx).await?;
        let mut last_err: Option<GatewayError> = None;

        for (attempt, provider_id) in candidates
            .iter()
            .take(self.config.max_retries)
            .enumerate()
        {
            ctx.check()?;
            let breaker = self.breakers.get(provider_id);
            if !breaker.permit_call() {
                debug!(provider = %provider_id, "skipping provider with open circuit");
                last_err = Some(GatewayError::circuit_open(provider_id));
                continue;
            }

            match self.attempt(&manifest, provider_id, request, ctx, attempt).await {
                Ok(mut response) => {
                    breaker.record_success();
                    self.quota.on_complete(
                        &ctx.tenant_id,
                        ResourceKind::InputTokens,
                        response.input_tokens as u64,
                        &ctx.request_id,
                    );
                    self.quota.on_complete(
                        &ctx.tenant_id,
                        ResourceKind::OutputTokens,
                        response.output_tokens as u64,
                        &ctx.request_id,
                    );
                    response
                        .metadata
                        .insert("attempts".into(), serde_json::json!(attempt + 1));
                    info!(
                        request_id = %ctx.request_id,
                        provider = %provider_id,
                        attempts = attempt + 1,
                        "inference dispatched"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    breaker.record_failure(&e);
                    self.metrics.record_failure(provider_id);
                    let can_continue = e.retryable()
                        && self.config.auto_failover
                        && attempt + 1 < self.config.max_retries.min(candidates.len());
                    warn!(
                        request_id = %ctx.request_id,
                        provider = %provider_id,
                        error = %e,
                        failover = can_continue,
                        "provider attempt failed"
                    );
                    if e.retryable() && self.config.auto_failover {
                        last_err = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        let mut err = GatewayError::all_runners_failed(&request.model)
            .with_context("tenant_id", ctx.tenant_id.as_str());
        if let Some(last) = last_err {
            err = err
                .with_context("last_error", last.code())
                .with_source(last);
        }
        Err(err)
    }

    /// One attempt against one provider: runner lookup, session checkout,
    /// timed adapter call, session return.
    async fn attempt(
        &self,
        manifest: &ModelManifest,
        provider_id: &str,
        request: &InferenceRequest,
        ctx: &RequestContext,
        attempt: usize,
    ) -> Result<InferenceResponse> {
        let runner = self
            .factory
            .get_runner(manifest, provider_id, &ctx.tenant_id)
            .await?;
        let mut session = runner
            .sessions
            .acquire(self.session_acquire_timeout)
            .await?
            .ok_or_else(|| {
                GatewayError::new(ErrorKind::RuntimeTimeout, "no session available")
                    .with_context("provider_id", provider_id)
            })?;

        self.metrics.request_started(provider_id);
        let started = Instant::now();
        let outcome = match ctx.remaining() {
            Some(remaining) => {
                match tokio::time::timeout(remaining, runner.adapter.infer(request, ctx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(GatewayError::new(
                        ErrorKind::ProviderTimeout,
                        format!("{provider_id} timed out after {remaining:?}"),
                    )),
                }
            }
            None => runner.adapter.infer(request, ctx).await,
        };
        self.metrics.request_finished(provider_id);

        if let Err(e) = &outcome
            && e.kind == ErrorKind::DeviceOutOfMemory
        {
            session.mark_unhealthy();
        }
        runner.sessions.release(session).await;

        match outcome {
            Ok(mut response) => {
                let cost_usd = response
                    .metadata
                    .get("cost_usd")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                self.metrics.record_success(
                    provider_id,
                    &request.model,
                    started.elapsed(),
                    response.input_tokens,
                    response.output_tokens,
                    cost_usd,
                );
                response
                    .metadata
                    .insert("provider".into(), serde_json::json!(provider_id));
                response.duration_ms = started.elapsed().as_millis() as u64;
                Ok(response)
            }
            Err(e) => Err(e
                .with_context("provider_id", provider_id)
                .with_context("attempt", (attempt + 1).to_string())),
        }
    }

    // ── Streaming path ─────────────────────────────────────────

    pub async fn infer_stream(
        &self,
        api_key: Option<&ApiKey>,
        request: InferenceRequest,
    ) -> Result<ChunkStream> {
        self.infer_stream_with_cancellation(api_key, request, CancellationToken::new())
            .await
    }

    /// Identical to the sync path up to the first chunk: candidates are tried
    /// in order and pre-first-chunk failures fail over. Once a chunk has been
    /// observed the stream is committed — later failures terminate it.
    pub async fn infer_stream_with_cancellation(
        &self,
        api_key: Option<&ApiKey>,
        mut request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream> {
        request.validate()?;
        let tenant = self.resolver.resolve(api_key)?;
        self.resolve_model_reference(&mut request);
        let ctx = self.request_context(&request, tenant, cancel);

        self.reserve_admission(&ctx)?;
        let result = self.dispatch_stream(&request, &ctx).await;
        if result.is_err() {
            // the committed path hands the release duty to the stream's
            // completion callback
            self.release_reservations(&ctx);
        }
        result
    }

    async fn dispatch_stream(
        &self,
        request: &InferenceRequest,
        ctx: &RequestContext,
    ) -> Result<ChunkStream> {
        let (manifest, candidates) = self.prepare(request, ctx).await?;
        let mut last_err: Option<GatewayError> = None;

        for (attempt, provider_id) in candidates
            .iter()
            .take(self.config.max_retries)
            .enumerate()
        {
            ctx.check()?;
            let breaker = self.breakers.get(provider_id);
            if !breaker.permit_call() {
                last_err = Some(GatewayError::circuit_open(provider_id));
                continue;
            }

            let runner = match self
                .factory
                .get_runner(&manifest, provider_id, &ctx.tenant_id)
                .await
            {
                Ok(runner) => runner,
                Err(e) => {
                    breaker.record_failure(&e);
                    self.metrics.record_failure(provider_id);
                    if e.retryable() && self.config.auto_failover {
                        last_err = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            };
            let session = runner
                .sessions
                .acquire(self.session_acquire_timeout)
                .await?;
            let Some(session) = session else {
                last_err = Some(
                    GatewayError::new(ErrorKind::RuntimeTimeout, "no session available")
                        .with_context("provider_id", provider_id),
                );
                continue;
            };

            self.metrics.request_started(provider_id);
            let mut source = match runner.adapter.infer_stream(request, ctx).await {
                Ok(source) => source,
                Err(e) => {
                    self.metrics.request_finished(provider_id);
                    runner.sessions.release(session).await;
                    breaker.record_failure(&e);
                    self.metrics.record_failure(provider_id);
                    if e.retryable() && self.config.auto_failover {
                        last_err = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            };

            // Failover window: stays open until the first event arrives.
            let first = match ctx.remaining() {
                Some(remaining) => tokio::time::timeout(remaining, source.recv())
                    .await
                    .unwrap_or_else(|_| {
                        Some(TokenEvent::Error(GatewayError::new(
                            ErrorKind::ProviderTimeout,
                            format!("{provider_id} produced no chunk in time"),
                        )))
                    }),
                None => source.recv().await,
            };

            let failure = match &first {
                Some(TokenEvent::Error(e)) => {
                    Some(GatewayError::new(e.kind, e.message().to_string()))
                }
                None => Some(
                    GatewayError::from_kind(ErrorKind::StreamDisconnected)
                        .with_context("provider_id", provider_id),
                ),
                Some(_) => None,
            };
            if let Some(e) = failure {
                self.metrics.request_finished(provider_id);
                runner.sessions.release(session).await;
                breaker.record_failure(&e);
                self.metrics.record_failure(provider_id);
                if e.retryable() && self.config.auto_failover {
                    last_err = Some(e);
                    continue;
                }
                return Err(e);
            }

            info!(
                request_id = %ctx.request_id,
                provider = %provider_id,
                attempts = attempt + 1,
                "stream committed"
            );
            let on_complete = self.stream_completion(provider_id, request, ctx, runner, session);
            return Ok(stream::drive(
                ctx.request_id.clone(),
                first,
                source,
                ctx.cancellation().clone(),
                self.stream_config.clone(),
                Some(on_complete),
            ));
        }

        let mut err = GatewayError::all_runners_failed(&request.model)
            .with_context("tenant_id", ctx.tenant_id.as_str());
        if let Some(last) = last_err {
            err = err
                .with_context("last_error", last.code())
                .with_source(last);
        }
        Err(err)
    }

    /// Cleanup run when a committed stream ends: return the session, settle
    /// quota, and record the outcome in breaker + metrics.
    fn stream_completion(
        &self,
        provider_id: &str,
        request: &InferenceRequest,
        ctx: &RequestContext,
        runner: Arc<crate::factory::Runner>,
        session: crate::session::PooledSession,
    ) -> stream::CompletionFn {
        let provider_id = provider_id.to_string();
        let model = request.model.clone();
        let tenant = ctx.tenant_id.clone();
        let request_id = ctx.request_id.clone();
        let breaker = self.breakers.get(&provider_id);
        let metrics = Arc::clone(&self.metrics);
        let quota = Arc::clone(&self.quota);
        let started = Instant::now();

        Box::new(move |outcome: StreamOutcome| {
            tokio::spawn(async move {
                runner.sessions.release(session).await;
                metrics.request_finished(&provider_id);
                match outcome.error {
                    None if outcome.finish != manifold_core::FinishReason::Cancelled => {
                        breaker.record_success();
                        metrics.record_success(
                            &provider_id,
                            &model,
                            started.elapsed(),
                            outcome.input_tokens,
                            outcome.output_tokens,
                            manifold_providers::estimate_cost_usd(
                                &provider_id,
                                &model,
                                outcome.input_tokens,
                                outcome.output_tokens,
                            ),
                        );
                    }
                    None => {
                        // cancelled streams count as neither success nor failure
                    }
                    Some(kind) => {
                        breaker.record_failure(&GatewayError::from_kind(kind));
                        metrics.record_failure(&provider_id);
                    }
                }
                quota.on_complete(
                    &tenant,
                    ResourceKind::InputTokens,
                    outcome.input_tokens as u64,
                    &request_id,
                );
                quota.on_complete(
                    &tenant,
                    ResourceKind::OutputTokens,
                    outcome.output_tokens as u64,
                    &request_id,
                );
                quota.release(&tenant, ResourceKind::Requests, &request_id);
                quota.release(&tenant, ResourceKind::Concurrent, &request_id);
            });
        })
    }
}

#[async_trait]
impl JobExecutor for Router {
    async fn execute(
        &self,
        api_key: Option<ApiKey>,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<InferenceResponse> {
        self.infer_with_cancellation(api_key.as_ref(), request, cancel)
            .await
    }
}
