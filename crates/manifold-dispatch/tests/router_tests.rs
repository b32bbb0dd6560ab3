#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use manifold_config::{GatewayConfig, StrategyKind, TenantQuota};
    use manifold_core::{
        ApiKey, ChatMessage, ErrorKind, FinishReason, InferenceRequest, ModelFormat,
        ModelManifest, TenantId,
    };
    use manifold_dispatch::{
        Gateway, HostProfile, InMemoryManifestStore, StaticTenantResolver,
    };
    use manifold_providers::{
        MockAdapter, NativeAdapter, ProviderAdapter, ScriptedBackend,
    };
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Registry constructors run once for the query prototype and once per
    /// runner; recording every instance lets tests assert on whichever one
    /// actually served traffic.
    type Created = Arc<Mutex<Vec<Arc<MockAdapter>>>>;

    fn recording_ctor(
        make: impl Fn() -> MockAdapter + Send + Sync + 'static,
    ) -> (impl Fn() -> Arc<dyn ProviderAdapter> + Send + Sync + 'static, Created) {
        let created: Created = Arc::new(Mutex::new(Vec::new()));
        let created_in = Arc::clone(&created);
        let ctor = move || {
            let adapter = Arc::new(make());
            created_in.lock().push(Arc::clone(&adapter));
            adapter as Arc<dyn ProviderAdapter>
        };
        (ctor, created)
    }

    fn total_requests(created: &Created) -> usize {
        created
            .lock()
            .iter()
            .map(|a| a.recorded_requests().lock().len())
            .sum()
    }

    fn manifests_with(manifest: ModelManifest) -> Arc<InMemoryManifestStore> {
        let store = Arc::new(InMemoryManifestStore::new());
        store.insert(manifest);
        store
    }

    fn community_manifest(model: &str) -> ModelManifest {
        ModelManifest::new(model, model, "1", TenantId::community())
    }

    fn request(model: &str) -> InferenceRequest {
        InferenceRequest::new(model, vec![ChatMessage::user("Hi")])
    }

    // ── Happy path: local GGUF ─────────────────────────────────

    #[tokio::test]
    async fn local_gguf_happy_path() {
        let manifest = community_manifest("qwen-0.5")
            .with_artifact(ModelFormat::Gguf, "/models/qwen-0.5.gguf");
        let gateway = Gateway::builder(GatewayConfig::default())
            .register_adapter(|| {
                Arc::new(NativeAdapter::gguf(Arc::new(ScriptedBackend::new(
                    ModelFormat::Gguf,
                    &["Hello", " there", "!"],
                ))))
            })
            // a cloud-style provider that does not serve this model
            .register_adapter(|| Arc::new(MockAdapter::new("openai").with_models(["gpt-*"])))
            .manifests(manifests_with(manifest))
            .host_profile(HostProfile::assume(u64::MAX, false))
            .build();

        let response = gateway.infer(None, request("qwen-0.5")).await.unwrap();
        assert_eq!(response.content, "Hello there!");
        assert!(response.tokens_used > 0);
        assert_eq!(response.metadata["provider"], "gguf");
        gateway.shutdown().await;
    }

    // ── Failover on provider rate limit ────────────────────────

    #[tokio::test]
    async fn failover_on_rate_limit() {
        let mut config = GatewayConfig::default();
        config.routing.default_strategy = StrategyKind::Failover;

        let (openai_ctor, openai_created) = recording_ctor(|| {
            MockAdapter::new("openai")
                .with_error(ErrorKind::ProviderRateLimited, "HTTP 429: slow down")
        });
        let (anthropic_ctor, anthropic_created) =
            recording_ctor(|| MockAdapter::new("anthropic").with_response("recovered"));

        let store = manifests_with(community_manifest("m"));
        store.map_model("m", ["openai", "anthropic"]);

        let gateway = Gateway::builder(config)
            .register_adapter(openai_ctor)
            .register_adapter(anthropic_ctor)
            .manifests(store)
            .host_profile(HostProfile::assume(u64::MAX, false))
            .build();

        let response = gateway.infer(None, request("m")).await.unwrap();
        assert_eq!(response.content, "recovered");
        assert_eq!(response.metadata["provider"], "anthropic");
        assert_eq!(response.metadata["attempts"], 2);
        assert_eq!(total_requests(&openai_created), 1);
        assert_eq!(total_requests(&anthropic_created), 1);

        let snapshots = gateway.breaker_snapshots();
        let openai = snapshots.iter().find(|s| s.name == "openai").unwrap();
        assert_eq!(openai.failure_count, 1);
        let anthropic = snapshots.iter().find(|s| s.name == "anthropic").unwrap();
        assert_eq!(anthropic.success_count, 1);
        gateway.shutdown().await;
    }

    // ── Circuit opens and short-circuits later requests ────────

    #[tokio::test]
    async fn open_circuit_skips_provider() {
        let mut config = GatewayConfig::default();
        config.circuit_breaker.failure_threshold = 2;
        config.circuit_breaker.sliding_window_size = 2;
        config.routing.max_retries = 1;

        let (ctor, created) = recording_ctor(|| {
            MockAdapter::new("mock")
                .with_error(ErrorKind::ProviderUnavailable, "HTTP 503")
                .with_error(ErrorKind::ProviderUnavailable, "HTTP 503")
        });
        let gateway = Gateway::builder(config)
            .register_adapter(ctor)
            .manifests(manifests_with(community_manifest("m")))
            .host_profile(HostProfile::assume(u64::MAX, false))
            .build();

        for _ in 0..2 {
            let err = gateway.infer(None, request("m")).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::AllRunnersFailed);
        }
        // breaker is OPEN now: the provider is filtered out before ranking
        let err = gateway.infer(None, request("m")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RoutingNoCompatibleProvider);
        assert_eq!(total_requests(&created), 2);
        gateway.shutdown().await;
    }

    // ── Streaming: dense chunks, terminal, cancellation ────────

    #[tokio::test]
    async fn stream_delivers_dense_chunks_with_single_terminal() {
        let gateway = Gateway::builder(GatewayConfig::default())
            .register_adapter(|| {
                Arc::new(MockAdapter::new("mock").with_response("one two three four"))
            })
            .manifests(manifests_with(community_manifest("m")))
            .host_profile(HostProfile::assume(u64::MAX, false))
            .build();

        let mut request = request("m");
        request.streaming = true;
        let mut rx = gateway.infer_stream(None, request).await.unwrap();
        let mut chunks = vec![];
        while let Some(item) = rx.recv().await {
            chunks.push(item.unwrap());
        }
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence_number, i as u64);
        }
        assert_eq!(chunks.iter().filter(|c| c.is_complete).count(), 1);
        let terminal = chunks.last().unwrap();
        assert!(terminal.is_complete);
        assert_eq!(terminal.finish_reason, Some(FinishReason::Stop));
        assert_eq!(chunks.len(), 5); // 4 tokens + terminal
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn stream_cancellation_releases_resources() {
        let mut config = GatewayConfig::default();
        config.session.max_concurrent = 1;
        config.session.acquire_timeout_secs = 1;

        let gateway = Gateway::builder(config)
            .register_adapter(|| {
                Arc::new(
                    MockAdapter::new("mock")
                        .with_response("a b c d e f g h i j")
                        .with_response("follow-up")
                        .with_token_delay(Duration::from_millis(10)),
                )
            })
            .manifests(manifests_with(community_manifest("m")))
            .host_profile(HostProfile::assume(u64::MAX, false))
            .build();

        let cancel = CancellationToken::new();
        let mut streaming = request("m");
        streaming.streaming = true;
        let mut rx = gateway
            .router()
            .infer_stream_with_cancellation(None, streaming, cancel.clone())
            .await
            .unwrap();

        let mut chunks = vec![];
        while let Some(item) = rx.recv().await {
            let chunk = item.unwrap();
            let done = chunk.sequence_number >= 3 && !chunk.is_complete;
            chunks.push(chunk);
            if done {
                cancel.cancel();
            }
        }
        let terminal = chunks.last().unwrap();
        assert!(terminal.is_complete);
        assert_eq!(terminal.finish_reason, Some(FinishReason::Cancelled));

        // session returned and quota released: with max_concurrent = 1 the
        // next request would otherwise starve
        tokio::time::sleep(Duration::from_millis(50)).await;
        let response = gateway.infer(None, request("m")).await.unwrap();
        assert_eq!(response.content, "follow-up");
        gateway.shutdown().await;
    }

    // ── Quota exhaustion before dispatch ───────────────────────

    #[tokio::test]
    async fn quota_exhaustion_pre_dispatch() {
        let mut config = GatewayConfig::default();
        config.quota.tenants.insert("acme".into(), TenantQuota {
            requests_per_minute: 1,
            ..Default::default()
        });

        let (ctor, created) = recording_ctor(|| MockAdapter::new("mock").with_response("ok"));
        let resolver = Arc::new(StaticTenantResolver::new());
        resolver.insert(ApiKey::new("k-acme"), TenantId::new("acme").unwrap());

        let gateway = Gateway::builder(config)
            .register_adapter(ctor)
            .manifests(manifests_with(community_manifest("m")))
            .resolver(resolver)
            .host_profile(HostProfile::assume(u64::MAX, false))
            .build();

        let key = ApiKey::new("k-acme");
        gateway.infer(Some(&key), request("m")).await.unwrap();

        // budget is now exhausted for acme
        let err = gateway.infer(Some(&key), request("m")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::QuotaExceeded);
        assert_eq!(err.http_status(), 429);
        assert!(err.retry_after().unwrap() > Duration::ZERO);
        // no adapter call, no breaker movement
        assert_eq!(total_requests(&created), 1);
        let snapshots = gateway.breaker_snapshots();
        assert!(snapshots.iter().all(|s| s.failure_count == 0));
        gateway.shutdown().await;
    }

    // ── Routing edges ──────────────────────────────────────────

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let gateway = Gateway::builder(GatewayConfig::default())
            .register_adapter(|| Arc::new(MockAdapter::new("mock")))
            .manifests(Arc::new(InMemoryManifestStore::new()))
            .host_profile(HostProfile::assume(u64::MAX, false))
            .build();
        let err = gateway.infer(None, request("ghost")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ModelNotFound);
        assert_eq!(err.http_status(), 404);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn no_compatible_provider() {
        let gateway = Gateway::builder(GatewayConfig::default())
            .register_adapter(|| Arc::new(MockAdapter::new("openai").with_models(["gpt-*"])))
            .manifests(manifests_with(community_manifest("claude-x")))
            .host_profile(HostProfile::assume(u64::MAX, false))
            .build();
        let err = gateway.infer(None, request("claude-x")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RoutingNoCompatibleProvider);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn provider_prefix_selects_provider() {
        let store = manifests_with(community_manifest("shared-model"));
        store.map_model("shared-model", ["alpha", "beta"]);
        let gateway = Gateway::builder(GatewayConfig::default())
            .register_adapter(|| Arc::new(MockAdapter::new("alpha").with_response("from alpha")))
            .register_adapter(|| Arc::new(MockAdapter::new("beta").with_response("from beta")))
            .manifests(store)
            .host_profile(HostProfile::assume(u64::MAX, false))
            .build();

        let response = gateway
            .infer(None, request("beta/shared-model"))
            .await
            .unwrap();
        assert_eq!(response.metadata["provider"], "beta");
        assert_eq!(response.content, "from beta");
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn non_retryable_error_short_circuits() {
        let store = manifests_with(community_manifest("m"));
        store.map_model("m", ["bad", "good"]);
        let mut config = GatewayConfig::default();
        config.routing.default_strategy = StrategyKind::Failover;

        let (bad_ctor, _) = recording_ctor(|| {
            MockAdapter::new("bad")
                .with_error(ErrorKind::ProviderInvalidRequest, "HTTP 400: bad request")
        });
        let (good_ctor, good_created) =
            recording_ctor(|| MockAdapter::new("good").with_response("unused"));

        let gateway = Gateway::builder(config)
            .register_adapter(bad_ctor)
            .register_adapter(good_ctor)
            .manifests(store)
            .host_profile(HostProfile::assume(u64::MAX, false))
            .build();

        let err = gateway.infer(None, request("m")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderInvalidRequest);
        // no failover happened for a non-retryable error
        assert_eq!(total_requests(&good_created), 0);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn attempt_chain_never_repeats_a_provider() {
        let mut config = GatewayConfig::default();
        config.routing.default_strategy = StrategyKind::Failover;
        config.routing.max_retries = 5;

        let store = manifests_with(community_manifest("m"));
        store.map_model("m", ["only", "only", "only"]);

        let (ctor, created) = recording_ctor(|| {
            MockAdapter::new("only").with_error(ErrorKind::ProviderUnavailable, "HTTP 503")
        });
        let gateway = Gateway::builder(config)
            .register_adapter(ctor)
            .manifests(store)
            .host_profile(HostProfile::assume(u64::MAX, false))
            .build();

        let err = gateway.infer(None, request("m")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AllRunnersFailed);
        // duplicates in the candidate list collapse to one attempt
        assert_eq!(total_requests(&created), 1);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn stream_fails_over_before_first_chunk() {
        let mut config = GatewayConfig::default();
        config.routing.default_strategy = StrategyKind::Failover;
        let store = manifests_with(community_manifest("m"));
        store.map_model("m", ["flaky", "steady"]);

        let (flaky_ctor, _) = recording_ctor(|| {
            MockAdapter::new("flaky").with_error(ErrorKind::ProviderUnavailable, "HTTP 502")
        });
        let gateway = Gateway::builder(config)
            .register_adapter(flaky_ctor)
            .register_adapter(|| Arc::new(MockAdapter::new("steady").with_response("ok stream")))
            .manifests(store)
            .host_profile(HostProfile::assume(u64::MAX, false))
            .build();

        let mut streaming = request("m");
        streaming.streaming = true;
        let mut rx = gateway.infer_stream(None, streaming).await.unwrap();
        let mut text = String::new();
        let mut terminal = None;
        while let Some(item) = rx.recv().await {
            let chunk = item.unwrap();
            if chunk.is_complete {
                terminal = Some(chunk);
            } else {
                text.push_str(&chunk.token);
            }
        }
        assert_eq!(text.trim(), "ok stream");
        assert_eq!(terminal.unwrap().finish_reason, Some(FinishReason::Stop));
        gateway.shutdown().await;
    }
}
