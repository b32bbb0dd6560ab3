use std::time::Duration;

use async_trait::async_trait;
use manifold_core::{
    ErrorKind, GatewayError, InferenceRequest, InferenceResponse, ProviderCapabilities,
    ProviderHealth, RequestContext, Result,
};
use tokio::sync::mpsc;

/// Runtime configuration handed to [`ProviderAdapter::initialize`]. Built by
/// the runner factory from deployment config plus tenant-specific overrides.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Models this instance may serve; empty keeps the adapter's defaults.
    pub models: Vec<String>,
    /// Adapter-specific extras (e.g. the artifact location for native backends).
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Raw event emitted by an adapter's streaming path. The stream driver turns
/// these into numbered [`manifold_core::StreamChunk`]s.
#[derive(Debug)]
pub enum TokenEvent {
    Token(String),
    Usage {
        input_tokens: u32,
        output_tokens: u32,
    },
    Done(manifold_core::FinishReason),
    Error(GatewayError),
}

/// Uniform contract over heterogeneous inference backends.
///
/// Adapters must not retain the request after returning, must honor the
/// context's cancellation token in streaming paths, and must surface remote
/// rate limits and 5xx responses as retryable errors from the taxonomy.
/// `initialize` and `shutdown` are both idempotent.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable identifier, e.g. "gguf", "ollama", "gemini".
    fn id(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Whether this adapter can serve the model; may inspect model name
    /// patterns and request features.
    fn supports(&self, model_id: &str, request: &InferenceRequest) -> bool;

    async fn initialize(&self, config: &ProviderConfig) -> Result<()>;

    async fn infer(
        &self,
        request: &InferenceRequest,
        ctx: &RequestContext,
    ) -> Result<InferenceResponse>;

    /// Streaming inference. Only valid when `capabilities().streaming`.
    async fn infer_stream(
        &self,
        request: &InferenceRequest,
        ctx: &RequestContext,
    ) -> Result<mpsc::Receiver<TokenEvent>>;

    async fn health(&self) -> ProviderHealth;

    /// Release all backend handles.
    async fn shutdown(&self);
}

// ── Shared HTTP error mapping ──────────────────────────────────

/// Map a non-success HTTP status from a remote provider into the taxonomy.
/// 429 and 5xx are retryable; other 4xx means the provider rejected the
/// request itself.
pub fn map_http_status(
    provider_id: &str,
    status: u16,
    body: &str,
    retry_after_secs: Option<u64>,
) -> GatewayError {
    let snippet: String = body.chars().take(200).collect();
    let err = match status {
        429 => GatewayError::new(
            ErrorKind::ProviderRateLimited,
            format!("{provider_id} rate limited: HTTP 429"),
        )
        .with_retry_after(Duration::from_secs(retry_after_secs.unwrap_or(30))),
        500..=599 => GatewayError::new(
            ErrorKind::ProviderUnavailable,
            format!("{provider_id} upstream error: HTTP {status}: {snippet}"),
        ),
        _ => GatewayError::new(
            ErrorKind::ProviderInvalidRequest,
            format!("{provider_id} rejected request: HTTP {status}: {snippet}"),
        ),
    };
    err.with_context("provider_id", provider_id)
}

/// Map a reqwest transport failure into the taxonomy.
pub fn map_transport_error(provider_id: &str, err: reqwest::Error) -> GatewayError {
    let kind = if err.is_timeout() {
        ErrorKind::NetworkTimeout
    } else {
        ErrorKind::ProviderUnavailable
    };
    GatewayError::new(kind, format!("{provider_id}: {err}"))
        .with_context("provider_id", provider_id)
        .with_source(err)
}

/// Pull a Retry-After header (seconds form) off a response.
pub fn retry_after_header(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

// ── Cost model ─────────────────────────────────────────────────

/// Estimate request cost in USD from a static $/Mtok table per provider
/// family. Local backends are free.
pub fn estimate_cost_usd(provider_id: &str, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
    let (input_per_m, output_per_m) = cost_per_mtok(provider_id, model);
    (input_tokens as f64 * input_per_m + output_tokens as f64 * output_per_m) / 1_000_000.0
}

/// ($ per 1M input tokens, $ per 1M output tokens).
pub fn cost_per_mtok(provider_id: &str, model: &str) -> (f64, f64) {
    match provider_id {
        "anthropic" => match model {
            m if m.contains("opus") => (15.00, 75.00),
            m if m.contains("haiku") => (0.80, 4.00),
            _ => (3.00, 15.00),
        },
        "openai" => match model {
            m if m.contains("mini") => (0.15, 0.60),
            _ => (2.50, 10.00),
        },
        "gemini" => match model {
            m if m.contains("flash") => (0.075, 0.30),
            _ => (1.25, 5.00),
        },
        "mistral" => (2.00, 6.00),
        "cerebras" => (0.10, 0.10),
        // gguf, litert, ollama and anything self-hosted
        _ => (0.0, 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_maps_retryable_with_hint() {
        let err = map_http_status("openai", 429, "slow down", Some(12));
        assert_eq!(err.kind, ErrorKind::ProviderRateLimited);
        assert!(err.retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn server_errors_are_retryable_client_errors_not() {
        assert!(map_http_status("x", 503, "", None).retryable());
        assert!(!map_http_status("x", 400, "bad", None).retryable());
        assert_eq!(
            map_http_status("x", 404, "", None).kind,
            ErrorKind::ProviderInvalidRequest
        );
    }

    #[test]
    fn local_backends_cost_nothing() {
        assert_eq!(estimate_cost_usd("gguf", "qwen-0.5", 1000, 1000), 0.0);
        assert!(estimate_cost_usd("anthropic", "claude-opus-4", 1000, 1000) > 0.0);
    }
}
