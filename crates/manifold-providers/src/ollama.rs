use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use manifold_core::{
    FinishReason, InferenceRequest, InferenceResponse, ProviderCapabilities, ProviderHealth,
    RequestContext, Result, Role,
};
use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tracing::debug;

use crate::adapter::{
    map_http_status, map_transport_error, ProviderAdapter, ProviderConfig, TokenEvent,
};
use crate::sse::NdjsonParser;

#[derive(Debug)]
struct InitState {
    base_url: String,
    models: Vec<String>,
}

/// Ollama adapter — `POST /api/chat` with newline-delimited JSON streaming
/// terminated by `"done": true`.
pub struct OllamaAdapter {
    client: reqwest::Client,
    state: OnceCell<InitState>,
}

impl OllamaAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            state: OnceCell::new(),
        }
    }

    fn base_url(&self) -> String {
        self.state
            .get()
            .map(|s| s.base_url.clone())
            .unwrap_or_else(|| "http://127.0.0.1:11434".into())
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

        let params = &request.parameters;
        let mut options = serde_json::json!({});
        if let Some(t) = params.temperature {
            options["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = params.max_tokens {
            options["num_predict"] = serde_json::json!(m);
        }
        if let Some(p) = params.top_p {
            options["top_p"] = serde_json::json!(p);
        }
        if let Some(k) = params.top_k {
            options["top_k"] = serde_json::json!(k);
        }
        if let Some(s) = params.seed {
            options["seed"] = serde_json::json!(s);
        }
        if !params.stop.is_empty() {
            options["stop"] = serde_json::json!(params.stop);
        }

        serde_json::json!({
            "model": request.model,
            "messages": messages,
            "stream": stream,
            "options": options,
        })
    }
}

impl Default for OllamaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn id(&self) -> &str {
        "ollama"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        let models = match self.state.get() {
            // A local Ollama daemon serves whatever is pulled; an explicit
            // model list in config narrows it.
            Some(state) if !state.models.is_empty() => state.models.clone(),
            _ => vec!["*".into()],
        };
        ProviderCapabilities::new()
            .with_streaming()
            .with_context_window(32_768, 8_192)
            .with_models(models)
            .with_device(manifold_core::DeviceType::Cpu)
            .with_device(manifold_core::DeviceType::Cuda)
            .with_device(manifold_core::DeviceType::Metal)
    }

    fn supports(&self, model_id: &str, _request: &InferenceRequest) -> bool {
        self.capabilities().supports_model(model_id)
    }

    async fn initialize(&self, config: &ProviderConfig) -> Result<()> {
        let _ = self.state.set(InitState {
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://127.0.0.1:11434".into()),
            models: config.models.clone(),
        });
        Ok(())
    }

    async fn infer(
        &self,
        request: &InferenceRequest,
        ctx: &RequestContext,
    ) -> Result<InferenceResponse> {
        let body = self.build_body(request, false);
        debug!(model = %request.model, "sending Ollama chat request");

        let mut http = self
            .client
            .post(format!("{}/api/chat", self.base_url()))
            .json(&body);
        if let Some(remaining) = ctx.remaining().or_else(|| request.timeout()) {
            http = http.timeout(remaining);
        }

        let started = Instant::now();
        let resp = http
            .send()
            .await
            .map_err(|e| map_transport_error("ollama", e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(map_http_status("ollama", status, &text, None));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| map_transport_error("ollama", e))?;

        let content = data["message"]["content"].as_str().unwrap_or("").to_string();
        let input_tokens = data["prompt_eval_count"].as_u64().unwrap_or(0) as u32;
        let output_tokens = data["eval_count"].as_u64().unwrap_or(0) as u32;

        let mut response = InferenceResponse::new(&request.request_id, &request.model, content)
            .with_usage(input_tokens, output_tokens)
            .with_metadata("provider", serde_json::json!("ollama"))
            .with_metadata("cost_usd", serde_json::json!(0.0));
        response.duration_ms = started.elapsed().as_millis() as u64;
        Ok(response)
    }

    async fn infer_stream(
        &self,
        request: &InferenceRequest,
        ctx: &RequestContext,
    ) -> Result<mpsc::Receiver<TokenEvent>> {
        let body = self.build_body(request, true);
        let (tx, rx) = mpsc::channel(256);

        let client = self.client.clone();
        let url = format!("{}/api/chat", self.base_url());
        let cancel = ctx.cancellation().clone();

        tokio::spawn(async move {
            let resp = client.post(&url).json(&body).send().await;

            let resp = match resp {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let text = resp.text().await.unwrap_or_default();
                    let _ = tx
                        .send(TokenEvent::Error(map_http_status("ollama", status, &text, None)))
                        .await;
                    return;
                }
                Err(e) => {
                    let _ = tx
                        .send(TokenEvent::Error(map_transport_error("ollama", e)))
                        .await;
                    return;
                }
            };

            let mut stream = resp.bytes_stream();
            let mut parser = NdjsonParser::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    chunk = stream.next() => match chunk {
                        Some(Ok(bytes)) => {
                            for line in parser.push(&bytes) {
                                let Ok(event) = serde_json::from_str::<serde_json::Value>(&line)
                                else {
                                    continue;
                                };
                                if let Some(content) = event["message"]["content"].as_str()
                                    && !content.is_empty()
                                {
                                    if tx
                                        .send(TokenEvent::Token(content.to_string()))
                                        .await
                                        .is_err()
                                    {
                                        return;
                                    }
                                }
                                if event["done"].as_bool() == Some(true) {
                                    let _ = tx
                                        .send(TokenEvent::Usage {
                                            input_tokens: event["prompt_eval_count"]
                                                .as_u64()
                                                .unwrap_or(0)
                                                as u32,
                                            output_tokens: event["eval_count"]
                                                .as_u64()
                                                .unwrap_or(0)
                                                as u32,
                                        })
                                        .await;
                                    let _ = tx.send(TokenEvent::Done(FinishReason::Stop)).await;
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx
                                .send(TokenEvent::Error(map_transport_error("ollama", e)))
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
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url()))
            .send()
            .await;
        match resp {
            Ok(resp) if resp.status().is_success() => ProviderHealth::up(),
            Ok(resp) => ProviderHealth::degraded(format!("HTTP {}", resp.status())),
            Err(e) => ProviderHealth::down(format!("unreachable: {e}")),
        }
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::ChatMessage;

    #[test]
    fn body_maps_params_to_options() {
        let adapter = OllamaAdapter::new();
        let mut request = InferenceRequest::new("qwen2.5:0.5b", vec![ChatMessage::user("hi")]);
        request.parameters.temperature = Some(0.1);
        request.parameters.max_tokens = Some(32);
        request.parameters.seed = Some(7);
        let body = adapter.build_body(&request, true);
        assert_eq!(body["options"]["temperature"], 0.1);
        assert_eq!(body["options"]["num_predict"], 32);
        assert_eq!(body["options"]["seed"], 7);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn serves_any_model_unless_narrowed() {
        let adapter = OllamaAdapter::new();
        let request = InferenceRequest::new("x", vec![ChatMessage::user("hi")]);
        assert!(adapter.supports("anything-at-all", &request));
    }
}
