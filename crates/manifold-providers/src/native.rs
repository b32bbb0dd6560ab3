use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use manifold_core::{
    ChatMessage, DeviceType, ErrorKind, FinishReason, GatewayError, GenerationParams,
    InferenceRequest, InferenceResponse, ModelFormat, ProviderCapabilities, ProviderHealth,
    RequestContext, Result, Role,
};
use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adapter::{ProviderAdapter, ProviderConfig, TokenEvent};

/// Opaque in-process inference backend (llama.cpp, LiteRT). The dispatch
/// plane never links natively; a loaded module or sidecar process implements
/// this contract and the adapter surfaces it as the uniform provider API.
#[async_trait]
pub trait NativeBackend: Send + Sync {
    fn format(&self) -> ModelFormat;

    /// Load a model artifact. Idempotent for the same artifact.
    async fn load(&self, artifact: &str) -> Result<()>;

    /// Generate tokens for a rendered prompt, pushing each onto `tx`.
    /// Stops early when `cancel` fires or the receiver is dropped.
    /// Returns `(input_tokens, output_tokens)`.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(u32, u32)>;

    /// Release the loaded model. Idempotent.
    async fn unload(&self);
}

#[derive(Debug)]
struct InitState {
    models: Vec<String>,
}

/// Adapter over a [`NativeBackend`]. Two stock configurations exist: `gguf`
/// (llama.cpp) and `litert` (TFLite).
pub struct NativeAdapter {
    id: String,
    format: ModelFormat,
    devices: Vec<DeviceType>,
    backend: Arc<dyn NativeBackend>,
    state: OnceCell<InitState>,
    shut_down: AtomicBool,
}

impl NativeAdapter {
    pub fn gguf(backend: Arc<dyn NativeBackend>) -> Self {
        Self::new(
            "gguf",
            ModelFormat::Gguf,
            vec![DeviceType::Cpu, DeviceType::Cuda, DeviceType::Metal],
            backend,
        )
    }

    pub fn litert(backend: Arc<dyn NativeBackend>) -> Self {
        Self::new(
            "litert",
            ModelFormat::Litert,
            vec![DeviceType::Cpu, DeviceType::Npu, DeviceType::Tpu],
            backend,
        )
    }

    pub fn new(
        id: impl Into<String>,
        format: ModelFormat,
        devices: Vec<DeviceType>,
        backend: Arc<dyn NativeBackend>,
    ) -> Self {
        Self {
            id: id.into(),
            format,
            devices,
            backend,
            state: OnceCell::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    fn model_patterns(&self) -> Vec<String> {
        match self.state.get() {
            Some(state) if !state.models.is_empty() => state.models.clone(),
            // Any artifact-backed model; the selection policy's format gate
            // narrows further.
            _ => vec!["*".into()],
        }
    }
}

/// Flatten a chat transcript into the plain prompt local backends expect.
fn render_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for msg in messages {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        prompt.push_str(role);
        prompt.push_str(": ");
        prompt.push_str(&msg.content);
        prompt.push('\n');
    }
    prompt.push_str("assistant: ");
    prompt
}

#[async_trait]
impl ProviderAdapter for NativeAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> ProviderCapabilities {
        let mut caps = ProviderCapabilities::new()
            .with_streaming()
            .with_context_window(32_768, 4_096)
            .with_models(self.model_patterns())
            .with_format(self.format);
        for device in &self.devices {
            caps = caps.with_device(*device);
        }
        caps
    }

    fn supports(&self, model_id: &str, _request: &InferenceRequest) -> bool {
        self.capabilities().supports_model(model_id)
    }

    async fn initialize(&self, config: &ProviderConfig) -> Result<()> {
        if self.state.get().is_some() {
            return Ok(());
        }
        let artifact = config
            .extra
            .get("artifact")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                GatewayError::new(
                    ErrorKind::InitFailed,
                    format!("{}: no artifact location supplied", self.id),
                )
            })?;
        debug!(provider = %self.id, artifact, "loading native model artifact");
        self.backend.load(artifact).await?;
        let _ = self.state.set(InitState {
            models: config.models.clone(),
        });
        Ok(())
    }

    async fn infer(
        &self,
        request: &InferenceRequest,
        ctx: &RequestContext,
    ) -> Result<InferenceResponse> {
        if self.state.get().is_none() {
            return Err(GatewayError::new(
                ErrorKind::InitFailed,
                format!("{} adapter not initialized", self.id),
            ));
        }
        let prompt = render_prompt(&request.messages);
        let (tx, mut rx) = mpsc::channel(256);
        let started = Instant::now();

        let generate = self
            .backend
            .generate(&prompt, &request.parameters, tx, ctx.cancellation().clone());
        let collect = async {
            let mut out = String::new();
            while let Some(token) = rx.recv().await {
                out.push_str(&token);
            }
            out
        };
        let (generated, content) = tokio::join!(generate, collect);
        let (input_tokens, output_tokens) = generated?;
        ctx.check()?;

        let mut response = InferenceResponse::new(&request.request_id, &request.model, content)
            .with_usage(input_tokens, output_tokens)
            .with_metadata("provider", serde_json::json!(self.id))
            .with_metadata("cost_usd", serde_json::json!(0.0));
        response.duration_ms = started.elapsed().as_millis() as u64;
        Ok(response)
    }

    async fn infer_stream(
        &self,
        request: &InferenceRequest,
        ctx: &RequestContext,
    ) -> Result<mpsc::Receiver<TokenEvent>> {
        if self.state.get().is_none() {
            return Err(GatewayError::new(
                ErrorKind::InitFailed,
                format!("{} adapter not initialized", self.id),
            ));
        }
        let prompt = render_prompt(&request.messages);
        let params = request.parameters.clone();
        let backend = Arc::clone(&self.backend);
        let cancel = ctx.cancellation().clone();
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            let (token_tx, mut token_rx) = mpsc::channel::<String>(256);
            let generate = backend.generate(&prompt, &params, token_tx, cancel.clone());
            let forward = async {
                while let Some(token) = token_rx.recv().await {
                    if tx.send(TokenEvent::Token(token)).await.is_err() {
                        break;
                    }
                }
            };
            let (generated, ()) = tokio::join!(generate, forward);
            match generated {
                Ok((input_tokens, output_tokens)) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let _ = tx
                        .send(TokenEvent::Usage {
                            input_tokens,
                            output_tokens,
                        })
                        .await;
                    let _ = tx.send(TokenEvent::Done(FinishReason::Stop)).await;
                }
                Err(e) => {
                    let _ = tx.send(TokenEvent::Error(e)).await;
                }
            }
        });

        Ok(rx)
    }

    async fn health(&self) -> ProviderHealth {
        if self.shut_down.load(Ordering::Acquire) {
            return ProviderHealth::down("shut down");
        }
        match self.state.get() {
            Some(_) => ProviderHealth::up(),
            None => ProviderHealth::down("not initialized"),
        }
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.backend.unload().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedBackend;

    #[test]
    fn prompt_rendering_keeps_roles() {
        let prompt = render_prompt(&[
            ChatMessage::system("be terse"),
            ChatMessage::user("hi"),
        ]);
        assert!(prompt.starts_with("system: be terse\n"));
        assert!(prompt.ends_with("assistant: "));
    }

    #[tokio::test]
    async fn initialize_requires_artifact() {
        let backend = Arc::new(ScriptedBackend::new(ModelFormat::Gguf, &["hi"]));
        let adapter = NativeAdapter::gguf(backend);
        assert!(adapter.initialize(&ProviderConfig::default()).await.is_err());

        let mut config = ProviderConfig::default();
        config
            .extra
            .insert("artifact".into(), serde_json::json!("/models/m.gguf"));
        adapter.initialize(&config).await.unwrap();
        // second call is a no-op
        adapter.initialize(&config).await.unwrap();
    }

    #[tokio::test]
    async fn infer_collects_generated_tokens() {
        let backend = Arc::new(ScriptedBackend::new(ModelFormat::Gguf, &["Hello", ", ", "world"]));
        let adapter = NativeAdapter::gguf(backend);
        let mut config = ProviderConfig::default();
        config
            .extra
            .insert("artifact".into(), serde_json::json!("/models/m.gguf"));
        adapter.initialize(&config).await.unwrap();

        let request = InferenceRequest::new("qwen-0.5", vec![ChatMessage::user("Hi")]);
        let ctx = RequestContext::new(manifold_core::TenantId::community(), &request.request_id);
        let resp = adapter.infer(&request, &ctx).await.unwrap();
        assert_eq!(resp.content, "Hello, world");
        assert!(resp.tokens_used > 0);
    }

    #[tokio::test]
    async fn shutdown_unloads_once() {
        let backend = Arc::new(ScriptedBackend::new(ModelFormat::Gguf, &["x"]));
        let adapter = NativeAdapter::gguf(Arc::clone(&backend) as Arc<dyn NativeBackend>);
        adapter.shutdown().await;
        adapter.shutdown().await;
        assert_eq!(backend.unload_count(), 1);
    }
}
