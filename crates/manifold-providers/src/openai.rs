use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use manifold_core::{
    ErrorKind, FinishReason, GatewayError, InferenceRequest, InferenceResponse,
    ProviderCapabilities, ProviderHealth, RequestContext, Result, Role,
};
use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tracing::debug;

use crate::adapter::{
    estimate_cost_usd, map_http_status, map_transport_error, retry_after_header, ProviderAdapter,
    ProviderConfig, TokenEvent,
};
use crate::sse::{SseParser, SSE_DONE};

#[derive(Debug)]
struct InitState {
    api_key: String,
    base_url: String,
    models: Vec<String>,
}

/// Adapter for any OpenAI-compatible `/chat/completions` backend. Serves the
/// `openai`, `cerebras`, and `mistral` provider ids, differing only in base
/// URL and default model patterns.
pub struct OpenAiCompatAdapter {
    id: String,
    client: reqwest::Client,
    default_base_url: String,
    default_models: Vec<String>,
    state: OnceCell<InitState>,
}

impl OpenAiCompatAdapter {
    pub fn new(
        id: impl Into<String>,
        default_base_url: impl Into<String>,
        default_models: &[&str],
    ) -> Self {
        Self {
            id: id.into(),
            client: reqwest::Client::new(),
            default_base_url: default_base_url.into(),
            default_models: default_models.iter().map(|s| s.to_string()).collect(),
            state: OnceCell::new(),
        }
    }

    pub fn openai() -> Self {
        Self::new(
            "openai",
            "https://api.openai.com/v1",
            &["gpt-*", "o1*", "o3*", "o4*", "chatgpt-*"],
        )
    }

    pub fn cerebras() -> Self {
        Self::new(
            "cerebras",
            "https://api.cerebras.ai/v1",
            &["llama-*", "qwen-*", "gpt-oss-*"],
        )
    }

    pub fn mistral() -> Self {
        Self::new(
            "mistral",
            "https://api.mistral.ai/v1",
            &["mistral-*", "magistral-*", "codestral-*", "ministral-*"],
        )
    }

    fn model_patterns(&self) -> Vec<String> {
        match self.state.get() {
            Some(state) if !state.models.is_empty() => state.models.clone(),
            _ => self.default_models.clone(),
        }
    }

    fn require_state(&self) -> Result<&InitState> {
        self.state.get().ok_or_else(|| {
            GatewayError::new(
                ErrorKind::InitFailed,
                format!("{} adapter not initialized", self.id),
            )
        })
    }

    fn build_body(&self, request: &InferenceRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                serde_json::json!({ "role": role, "content": msg.content })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "stream": stream,
        });
        let params = &request.parameters;
        if let Some(t) = params.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = params.max_tokens {
            body["max_tokens"] = serde_json::json!(m);
        }
        if let Some(p) = params.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        if let Some(s) = params.seed {
            body["seed"] = serde_json::json!(s);
        }
        if !params.stop.is_empty() {
            body["stop"] = serde_json::json!(params.stop);
        }
        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(tools);
        }
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::Length,
        "tool_calls" => FinishReason::ToolCall,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::new()
            .with_streaming()
            .with_function_calling()
            .with_context_window(128_000, 16_384)
            .with_models(self.model_patterns())
    }

    fn supports(&self, model_id: &str, _request: &InferenceRequest) -> bool {
        self.capabilities().supports_model(model_id)
    }

    async fn initialize(&self, config: &ProviderConfig) -> Result<()> {
        if self.state.get().is_some() {
            return Ok(());
        }
        let api_key = config.api_key.clone().ok_or_else(|| {
            GatewayError::new(
                ErrorKind::InitFailed,
                format!("{}: api_key not configured", self.id),
            )
        })?;
        let _ = self.state.set(InitState {
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| self.default_base_url.clone()),
            models: config.models.clone(),
        });
        Ok(())
    }

    async fn infer(
        &self,
        request: &InferenceRequest,
        ctx: &RequestContext,
    ) -> Result<InferenceResponse> {
        let state = self.require_state()?;
        let body = self.build_body(request, false);
        debug!(provider = %self.id, model = %request.model, "sending chat completion request");

        let mut http = self
            .client
            .post(format!("{}/chat/completions", state.base_url))
            .bearer_auth(&state.api_key)
            .json(&body);
        if let Some(remaining) = ctx.remaining().or_else(|| request.timeout()) {
            http = http.timeout(remaining);
        }

        let started = Instant::now();
        let resp = http
            .send()
            .await
            .map_err(|e| map_transport_error(&self.id, e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = retry_after_header(&resp);
            let text = resp.text().await.unwrap_or_default();
            return Err(map_http_status(&self.id, status, &text, retry_after));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| map_transport_error(&self.id, e))?;

        let message = &data["choices"][0]["message"];
        let content = message["content"].as_str().unwrap_or("").to_string();
        let input_tokens = data["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let output_tokens = data["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;

        let mut response = InferenceResponse::new(&request.request_id, &request.model, content)
            .with_usage(input_tokens, output_tokens)
            .with_metadata("provider", serde_json::json!(self.id))
            .with_metadata(
                "cost_usd",
                serde_json::json!(estimate_cost_usd(
                    &self.id,
                    &request.model,
                    input_tokens,
                    output_tokens
                )),
            );
        if !message["tool_calls"].is_null() {
            response = response.with_metadata("tool_calls", message["tool_calls"].clone());
        }
        response.duration_ms = started.elapsed().as_millis() as u64;
        Ok(response)
    }

    async fn infer_stream(
        &self,
        request: &InferenceRequest,
        ctx: &RequestContext,
    ) -> Result<mpsc::Receiver<TokenEvent>> {
        let state = self.require_state()?;
        let body = self.build_body(request, true);
        let (tx, rx) = mpsc::channel(256);

        let client = self.client.clone();
        let url = format!("{}/chat/completions", state.base_url);
        let api_key = state.api_key.clone();
        let provider_id = self.id.clone();
        let cancel = ctx.cancellation().clone();

        tokio::spawn(async move {
            let resp = client
                .post(&url)
                .bearer_auth(&api_key)
                .json(&body)
                .send()
                .await;

            let resp = match resp {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let retry_after = retry_after_header(&resp);
                    let text = resp.text().await.unwrap_or_default();
                    let _ = tx
                        .send(TokenEvent::Error(map_http_status(
                            &provider_id,
                            status,
                            &text,
                            retry_after,
                        )))
                        .await;
                    return;
                }
                Err(e) => {
                    let _ = tx
                        .send(TokenEvent::Error(map_transport_error(&provider_id, e)))
                        .await;
                    return;
                }
            };

            let mut stream = resp.bytes_stream();
            let mut parser = SseParser::new();
            let mut finish = FinishReason::Stop;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    chunk = stream.next() => match chunk {
                        Some(Ok(bytes)) => {
                            for payload in parser.push(&bytes) {
                                if payload == SSE_DONE {
                                    let _ = tx.send(TokenEvent::Done(finish)).await;
                                    return;
                                }
                                let Ok(event) = serde_json::from_str::<serde_json::Value>(&payload)
                                else {
                                    continue;
                                };
                                if let Some(text) = event["choices"][0]["delta"]["content"].as_str()
                                    && !text.is_empty()
                                {
                                    if tx.send(TokenEvent::Token(text.to_string())).await.is_err() {
                                        return;
                                    }
                                }
                                if let Some(reason) = event["choices"][0]["finish_reason"].as_str() {
                                    finish = map_finish_reason(reason);
                                }
                                if let Some(usage) = event["usage"].as_object() {
                                    let _ = tx
                                        .send(TokenEvent::Usage {
                                            input_tokens: usage
                                                .get("prompt_tokens")
                                                .and_then(|v| v.as_u64())
                                                .unwrap_or(0)
                                                as u32,
                                            output_tokens: usage
                                                .get("completion_tokens")
                                                .and_then(|v| v.as_u64())
                                                .unwrap_or(0)
                                                as u32,
                                        })
                                        .await;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx
                                .send(TokenEvent::Error(map_transport_error(&provider_id, e)))
                                .await;
                            return;
                        }
                        // Ended without [DONE]; the stream driver synthesizes
                        // the disconnect terminal.
                        None => return,
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn health(&self) -> ProviderHealth {
        let Some(state) = self.state.get() else {
            return ProviderHealth::down("not initialized");
        };
        let resp = self
            .client
            .get(format!("{}/models", state.base_url))
            .bearer_auth(&state.api_key)
            .send()
            .await;
        match resp {
            Ok(resp) if resp.status().is_success() => ProviderHealth::up(),
            Ok(resp) => ProviderHealth::degraded(format!("HTTP {}", resp.status())),
            Err(e) => ProviderHealth::down(e.to_string()),
        }
    }

    async fn shutdown(&self) {
        // Nothing held beyond the connection pool; dropped with the client.
    }
}
