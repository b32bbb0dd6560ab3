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
use crate::sse::SseParser;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug)]
struct InitState {
    api_key: String,
    base_url: String,
    models: Vec<String>,
}

/// Anthropic Messages API adapter.
pub struct AnthropicAdapter {
    client: reqwest::Client,
    state: OnceCell<InitState>,
}

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            state: OnceCell::new(),
        }
    }

    fn require_state(&self) -> Result<&InitState> {
        self.state.get().ok_or_else(|| {
            GatewayError::new(ErrorKind::InitFailed, "anthropic adapter not initialized")
        })
    }

    fn model_patterns(&self) -> Vec<String> {
        match self.state.get() {
            Some(state) if !state.models.is_empty() => state.models.clone(),
            _ => vec!["claude-*".into()],
        }
    }

    /// System messages move to the top-level `system` field; everything else
    /// becomes a user/assistant turn.
    fn build_body(&self, request: &InferenceRequest, stream: bool) -> serde_json::Value {
        let mut system = None;
        let mut messages = Vec::new();
        for msg in &request.messages {
            match msg.role {
                Role::System => system = Some(msg.content.clone()),
                Role::User | Role::Tool => {
                    messages.push(serde_json::json!({ "role": "user", "content": msg.content }));
                }
                Role::Assistant => {
                    messages
                        .push(serde_json::json!({ "role": "assistant", "content": msg.content }));
                }
            }
        }

        let params = &request.parameters;
        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": params.max_tokens.unwrap_or(4096),
            "messages": messages,
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = serde_json::json!(system);
        }
        if let Some(t) = params.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = params.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        if let Some(k) = params.top_k {
            body["top_k"] = serde_json::json!(k);
        }
        if !params.stop.is_empty() {
            body["stop_sequences"] = serde_json::json!(params.stop);
        }
        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(tools);
        }
        body
    }
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCall,
        _ => FinishReason::Stop,
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::new()
            .with_streaming()
            .with_function_calling()
            .with_context_window(200_000, 32_000)
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
            GatewayError::new(ErrorKind::InitFailed, "anthropic: api_key not configured")
        })?;
        let _ = self.state.set(InitState {
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com/v1".into()),
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
        debug!(model = %request.model, "sending Anthropic messages request");

        let mut http = self
            .client
            .post(format!("{}/messages", state.base_url))
            .header("x-api-key", &state.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if let Some(remaining) = ctx.remaining().or_else(|| request.timeout()) {
            http = http.timeout(remaining);
        }

        let started = Instant::now();
        let resp = http
            .send()
            .await
            .map_err(|e| map_transport_error("anthropic", e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = retry_after_header(&resp);
            let text = resp.text().await.unwrap_or_default();
            return Err(map_http_status("anthropic", status, &text, retry_after));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| map_transport_error("anthropic", e))?;

        let content = data["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| {
                        (b["type"] == "text").then(|| b["text"].as_str().unwrap_or("").to_string())
                    })
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let input_tokens = data["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
        let output_tokens = data["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;

        let mut response = InferenceResponse::new(&request.request_id, &request.model, content)
            .with_usage(input_tokens, output_tokens)
            .with_metadata("provider", serde_json::json!("anthropic"))
            .with_metadata(
                "cost_usd",
                serde_json::json!(estimate_cost_usd(
                    "anthropic",
                    &request.model,
                    input_tokens,
                    output_tokens
                )),
            );
        if let Some(reason) = data["stop_reason"].as_str() {
            response = response.with_metadata("stop_reason", serde_json::json!(reason));
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
        let url = format!("{}/messages", state.base_url);
        let api_key = state.api_key.clone();
        let cancel = ctx.cancellation().clone();

        tokio::spawn(async move {
            let resp = client
                .post(&url)
                .header("x-api-key", &api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
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
                            "anthropic",
                            status,
                            &text,
                            retry_after,
                        )))
                        .await;
                    return;
                }
                Err(e) => {
                    let _ = tx
                        .send(TokenEvent::Error(map_transport_error("anthropic", e)))
                        .await;
                    return;
                }
            };

            let mut stream = resp.bytes_stream();
            let mut parser = SseParser::new();
            let mut finish = FinishReason::Stop;
            let mut input_tokens = 0u32;
            let mut output_tokens = 0u32;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    chunk = stream.next() => match chunk {
                        Some(Ok(bytes)) => {
                            for payload in parser.push(&bytes) {
                                let Ok(event) = serde_json::from_str::<serde_json::Value>(&payload)
                                else {
                                    continue;
                                };
                                match event["type"].as_str() {
                                    Some("message_start") => {
                                        if let Some(it) = event["message"]["usage"]["input_tokens"]
                                            .as_u64()
                                        {
                                            input_tokens = it as u32;
                                        }
                                    }
                                    Some("content_block_delta") => {
                                        if event["delta"]["type"] == "text_delta"
                                            && let Some(text) = event["delta"]["text"].as_str()
                                        {
                                            if tx
                                                .send(TokenEvent::Token(text.to_string()))
                                                .await
                                                .is_err()
                                            {
                                                return;
                                            }
                                        }
                                    }
                                    Some("message_delta") => {
                                        if let Some(reason) = event["delta"]["stop_reason"].as_str()
                                        {
                                            finish = map_stop_reason(reason);
                                        }
                                        if let Some(ot) =
                                            event["usage"]["output_tokens"].as_u64()
                                        {
                                            output_tokens = ot as u32;
                                        }
                                    }
                                    Some("message_stop") => {
                                        let _ = tx
                                            .send(TokenEvent::Usage {
                                                input_tokens,
                                                output_tokens,
                                            })
                                            .await;
                                        let _ = tx.send(TokenEvent::Done(finish)).await;
                                        return;
                                    }
                                    Some("error") => {
                                        let msg = event["error"]["message"]
                                            .as_str()
                                            .unwrap_or("unknown stream error");
                                        let _ = tx
                                            .send(TokenEvent::Error(GatewayError::new(
                                                ErrorKind::ProviderUnavailable,
                                                format!("anthropic: {msg}"),
                                            )))
                                            .await;
                                        return;
                                    }
                                    _ => {}
                                }
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx
                                .send(TokenEvent::Error(map_transport_error("anthropic", e)))
                                .await;
                            return;
                        }
                        None => return,
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn health(&self) -> ProviderHealth {
        match self.state.get() {
            Some(state) if !state.api_key.is_empty() => ProviderHealth::up(),
            Some(_) => ProviderHealth::down("api_key is empty"),
            None => ProviderHealth::down("not initialized"),
        }
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::ChatMessage;

    #[test]
    fn system_message_moves_to_top_level() {
        let adapter = AnthropicAdapter::new();
        let request = InferenceRequest::new(
            "claude-sonnet-4",
            vec![
                ChatMessage::system("be terse"),
                ChatMessage::user("hi"),
            ],
        );
        let body = adapter.build_body(&request, false);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn supports_claude_models_by_default() {
        let adapter = AnthropicAdapter::new();
        let request = InferenceRequest::new("x", vec![ChatMessage::user("hi")]);
        assert!(adapter.supports("claude-opus-4", &request));
        assert!(!adapter.supports("gpt-4o", &request));
    }

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(map_stop_reason("end_turn"), FinishReason::Stop);
        assert_eq!(map_stop_reason("max_tokens"), FinishReason::Length);
        assert_eq!(map_stop_reason("tool_use"), FinishReason::ToolCall);
    }
}
