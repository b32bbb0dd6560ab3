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

#[derive(Debug)]
struct InitState {
    api_key: String,
    base_url: String,
    models: Vec<String>,
}

/// Google Gemini `generateContent` adapter.
pub struct GeminiAdapter {
    client: reqwest::Client,
    state: OnceCell<InitState>,
}

impl GeminiAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            state: OnceCell::new(),
        }
    }

    fn require_state(&self) -> Result<&InitState> {
        self.state.get().ok_or_else(|| {
            GatewayError::new(ErrorKind::InitFailed, "gemini adapter not initialized")
        })
    }

    fn model_patterns(&self) -> Vec<String> {
        match self.state.get() {
            Some(state) if !state.models.is_empty() => state.models.clone(),
            _ => vec!["gemini-*".into()],
        }
    }

    /// Gemini has no system role in `contents`; the system message becomes
    /// `systemInstruction` and assistant turns use the `model` role.
    fn build_body(&self, request: &InferenceRequest) -> serde_json::Value {
        let mut system = None;
        let mut contents = Vec::new();
        for msg in &request.messages {
            match msg.role {
                Role::System => system = Some(msg.content.clone()),
                Role::Assistant => contents.push(serde_json::json!({
                    "role": "model",
                    "parts": [{ "text": msg.content }],
                })),
                Role::User | Role::Tool => contents.push(serde_json::json!({
                    "role": "user",
                    "parts": [{ "text": msg.content }],
                })),
            }
        }

        let params = &request.parameters;
        let mut generation_config = serde_json::json!({});
        if let Some(t) = params.temperature {
            generation_config["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = params.max_tokens {
            generation_config["maxOutputTokens"] = serde_json::json!(m);
        }
        if let Some(p) = params.top_p {
            generation_config["topP"] = serde_json::json!(p);
        }
        if let Some(k) = params.top_k {
            generation_config["topK"] = serde_json::json!(k);
        }
        if !params.stop.is_empty() {
            generation_config["stopSequences"] = serde_json::json!(params.stop);
        }

        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        if let Some(system) = system {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
        }
        body
    }
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "PROHIBITED_CONTENT" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn extract_text(candidate: &serde_json::Value) -> String {
    candidate["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn id(&self) -> &str {
        "gemini"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        let mut caps = ProviderCapabilities::new()
            .with_streaming()
            .with_function_calling()
            .with_context_window(1_000_000, 65_536)
            .with_models(self.model_patterns());
        caps.multimodal = true;
        caps
    }

    fn supports(&self, model_id: &str, _request: &InferenceRequest) -> bool {
        self.capabilities().supports_model(model_id)
    }

    async fn initialize(&self, config: &ProviderConfig) -> Result<()> {
        if self.state.get().is_some() {
            return Ok(());
        }
        let api_key = config.api_key.clone().ok_or_else(|| {
            GatewayError::new(ErrorKind::InitFailed, "gemini: api_key not configured")
        })?;
        let _ = self.state.set(InitState {
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".into()),
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
        let body = self.build_body(request);
        debug!(model = %request.model, "sending Gemini generateContent request");

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            state.base_url, request.model, state.api_key
        );
        let mut http = self.client.post(&url).json(&body);
        if let Some(remaining) = ctx.remaining().or_else(|| request.timeout()) {
            http = http.timeout(remaining);
        }

        let started = Instant::now();
        let resp = http
            .send()
            .await
            .map_err(|e| map_transport_error("gemini", e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = retry_after_header(&resp);
            let text = resp.text().await.unwrap_or_default();
            return Err(map_http_status("gemini", status, &text, retry_after));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| map_transport_error("gemini", e))?;

        let candidate = &data["candidates"][0];
        let content = extract_text(candidate);
        let input_tokens = data["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0) as u32;
        let output_tokens =
            data["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0) as u32;

        let mut response = InferenceResponse::new(&request.request_id, &request.model, content)
            .with_usage(input_tokens, output_tokens)
            .with_metadata("provider", serde_json::json!("gemini"))
            .with_metadata(
                "cost_usd",
                serde_json::json!(estimate_cost_usd(
                    "gemini",
                    &request.model,
                    input_tokens,
                    output_tokens
                )),
            );
        response.duration_ms = started.elapsed().as_millis() as u64;
        Ok(response)
    }

    async fn infer_stream(
        &self,
        request: &InferenceRequest,
        ctx: &RequestContext,
    ) -> Result<mpsc::Receiver<TokenEvent>> {
        let state = self.require_state()?;
        let body = self.build_body(request);
        let (tx, rx) = mpsc::channel(256);

        let client = self.client.clone();
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            state.base_url, request.model, state.api_key
        );
        let cancel = ctx.cancellation().clone();

        tokio::spawn(async move {
            let resp = client.post(&url).json(&body).send().await;

            let resp = match resp {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let retry_after = retry_after_header(&resp);
                    let text = resp.text().await.unwrap_or_default();
                    let _ = tx
                        .send(TokenEvent::Error(map_http_status(
                            "gemini",
                            status,
                            &text,
                            retry_after,
                        )))
                        .await;
                    return;
                }
                Err(e) => {
                    let _ = tx
                        .send(TokenEvent::Error(map_transport_error("gemini", e)))
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
                                let candidate = &event["candidates"][0];
                                let text = extract_text(candidate);
                                if !text.is_empty()
                                    && tx.send(TokenEvent::Token(text)).await.is_err()
                                {
                                    return;
                                }
                                if let Some(reason) = candidate["finishReason"].as_str() {
                                    finish = map_finish_reason(reason);
                                }
                                if let Some(meta) = event["usageMetadata"].as_object() {
                                    if let Some(it) =
                                        meta.get("promptTokenCount").and_then(|v| v.as_u64())
                                    {
                                        input_tokens = it as u32;
                                    }
                                    if let Some(ot) =
                                        meta.get("candidatesTokenCount").and_then(|v| v.as_u64())
                                    {
                                        output_tokens = ot as u32;
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx
                                .send(TokenEvent::Error(map_transport_error("gemini", e)))
                                .await;
                            return;
                        }
                        None => {
                            // Gemini's SSE form has no [DONE]; the stream just
                            // ends after the final usage-bearing event.
                            let _ = tx
                                .send(TokenEvent::Usage { input_tokens, output_tokens })
                                .await;
                            let _ = tx.send(TokenEvent::Done(finish)).await;
                            return;
                        }
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
