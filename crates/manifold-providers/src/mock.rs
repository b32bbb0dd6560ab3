//! Deterministic test doubles: a scriptable provider adapter and a scripted
//! native backend. No HTTP, no FFI — outcomes are queued up front and every
//! request is recorded for assertions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use manifold_core::{
    ErrorKind, FinishReason, GatewayError, GenerationParams, InferenceRequest, InferenceResponse,
    ModelFormat, ProviderCapabilities, ProviderHealth, RequestContext, Result,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapter::{ProviderAdapter, ProviderConfig, TokenEvent};
use crate::native::NativeBackend;

/// One pre-configured outcome for the mock adapter.
#[derive(Debug, Clone)]
pub struct MockOutcome {
    pub text: String,
    /// When set, the call fails with this kind instead of succeeding.
    pub error: Option<ErrorKind>,
    pub error_message: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish: FinishReason,
}

impl Default for MockOutcome {
    fn default() -> Self {
        Self {
            text: String::new(),
            error: None,
            error_message: String::new(),
            input_tokens: 100,
            output_tokens: 50,
            finish: FinishReason::Stop,
        }
    }
}

impl MockOutcome {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn error(kind: ErrorKind, message: &str) -> Self {
        Self {
            error: Some(kind),
            error_message: message.to_string(),
            ..Default::default()
        }
    }
}

/// A scriptable [`ProviderAdapter`]. Outcomes are consumed in queue order;
/// when the queue runs dry the adapter echoes a canned reply.
pub struct MockAdapter {
    id: String,
    models: Vec<String>,
    outcomes: Mutex<VecDeque<MockOutcome>>,
    requests: Arc<Mutex<Vec<InferenceRequest>>>,
    init_count: AtomicU32,
    shutdown_count: AtomicU32,
    healthy: AtomicBool,
    token_delay: Option<Duration>,
}

impl MockAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            models: vec!["*".into()],
            outcomes: Mutex::new(VecDeque::new()),
            requests: Arc::new(Mutex::new(Vec::new())),
            init_count: AtomicU32::new(0),
            shutdown_count: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
            token_delay: None,
        }
    }

    /// Restrict the models this mock claims to serve (patterns, `*` suffix).
    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Queue a text response.
    pub fn with_response(self, text: &str) -> Self {
        self.outcomes.lock().push_back(MockOutcome::text(text));
        self
    }

    /// Queue a failure.
    pub fn with_error(self, kind: ErrorKind, message: &str) -> Self {
        self.outcomes.lock().push_back(MockOutcome::error(kind, message));
        self
    }

    pub fn with_outcome(self, outcome: MockOutcome) -> Self {
        self.outcomes.lock().push_back(outcome);
        self
    }

    /// Delay between streamed tokens — lets tests cancel mid-stream.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    pub fn with_healthy(self, healthy: bool) -> Self {
        self.healthy.store(healthy, Ordering::Release);
        self
    }

    /// Handle to every request this adapter has received.
    pub fn recorded_requests(&self) -> Arc<Mutex<Vec<InferenceRequest>>> {
        Arc::clone(&self.requests)
    }

    pub fn init_count(&self) -> u32 {
        self.init_count.load(Ordering::Acquire)
    }

    pub fn shutdown_count(&self) -> u32 {
        self.shutdown_count.load(Ordering::Acquire)
    }

    fn next_outcome(&self) -> MockOutcome {
        self.outcomes
            .lock()
            .pop_front()
            .unwrap_or_else(|| MockOutcome::text("(mock) no queued outcome"))
    }

    fn fail(&self, outcome: &MockOutcome, kind: ErrorKind) -> GatewayError {
        let mut err = GatewayError::new(kind, outcome.error_message.clone())
            .with_context("provider_id", &self.id);
        if kind == ErrorKind::ProviderRateLimited {
            err = err.with_retry_after(Duration::from_secs(30));
        }
        err
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::new()
            .with_streaming()
            .with_function_calling()
            .with_context_window(32_768, 8_192)
            .with_models(self.models.clone())
    }

    fn supports(&self, model_id: &str, _request: &InferenceRequest) -> bool {
        self.capabilities().supports_model(model_id)
    }

    async fn initialize(&self, _config: &ProviderConfig) -> Result<()> {
        self.init_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn infer(
        &self,
        request: &InferenceRequest,
        _ctx: &RequestContext,
    ) -> Result<InferenceResponse> {
        self.requests.lock().push(request.clone());
        let outcome = self.next_outcome();
        if let Some(kind) = outcome.error {
            return Err(self.fail(&outcome, kind));
        }
        Ok(
            InferenceResponse::new(&request.request_id, &request.model, outcome.text)
                .with_usage(outcome.input_tokens, outcome.output_tokens)
                .with_metadata("provider", serde_json::json!(self.id)),
        )
    }

    async fn infer_stream(
        &self,
        request: &InferenceRequest,
        ctx: &RequestContext,
    ) -> Result<mpsc::Receiver<TokenEvent>> {
        self.requests.lock().push(request.clone());
        let outcome = self.next_outcome();
        let (tx, rx) = mpsc::channel(64);

        if let Some(kind) = outcome.error {
            let err = self.fail(&outcome, kind);
            tokio::spawn(async move {
                let _ = tx.send(TokenEvent::Error(err)).await;
            });
            return Ok(rx);
        }

        let delay = self.token_delay;
        let cancel = ctx.cancellation().clone();
        tokio::spawn(async move {
            for word in outcome.text.split_whitespace() {
                if let Some(delay) = delay {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if tx.send(TokenEvent::Token(format!("{word} "))).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(TokenEvent::Usage {
                    input_tokens: outcome.input_tokens,
                    output_tokens: outcome.output_tokens,
                })
                .await;
            let _ = tx.send(TokenEvent::Done(outcome.finish)).await;
        });

        Ok(rx)
    }

    async fn health(&self) -> ProviderHealth {
        if self.healthy.load(Ordering::Acquire) {
            ProviderHealth::up()
        } else {
            ProviderHealth::down("mock marked unhealthy")
        }
    }

    async fn shutdown(&self) {
        self.shutdown_count.fetch_add(1, Ordering::AcqRel);
    }
}

// ── Scripted native backend ────────────────────────────────────

/// A [`NativeBackend`] that emits a fixed token script. Tracks load/unload
/// calls so lifecycle tests can assert on them.
pub struct ScriptedBackend {
    format: ModelFormat,
    tokens: Vec<String>,
    loaded: Mutex<Vec<String>>,
    unload_count: AtomicU32,
    token_delay: Option<Duration>,
}

impl ScriptedBackend {
    pub fn new(format: ModelFormat, tokens: &[&str]) -> Self {
        Self {
            format,
            tokens: tokens.iter().map(|s| s.to_string()).collect(),
            loaded: Mutex::new(Vec::new()),
            unload_count: AtomicU32::new(0),
            token_delay: None,
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    pub fn loaded_artifacts(&self) -> Vec<String> {
        self.loaded.lock().clone()
    }

    pub fn unload_count(&self) -> u32 {
        self.unload_count.load(Ordering::Acquire)
    }
}

#[async_trait]
impl NativeBackend for ScriptedBackend {
    fn format(&self) -> ModelFormat {
        self.format
    }

    async fn load(&self, artifact: &str) -> Result<()> {
        self.loaded.lock().push(artifact.to_string());
        Ok(())
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(u32, u32)> {
        let limit = params.max_tokens.unwrap_or(u32::MAX) as usize;
        let mut emitted = 0u32;
        for token in self.tokens.iter().take(limit) {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(delay) = self.token_delay {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if tx.send(token.clone()).await.is_err() {
                break;
            }
            emitted += 1;
        }
        let input_tokens = (prompt.len() / 4).max(1) as u32;
        Ok((input_tokens, emitted))
    }

    async fn unload(&self) {
        self.unload_count.fetch_add(1, Ordering::AcqRel);
    }
}
