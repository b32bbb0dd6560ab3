use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::manifest::DeviceType;

/// Who produced a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of the conversation passed to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Description of a tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

/// How the model should treat the supplied tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Tool(String),
}

/// Sampling and generation knobs. All optional; providers fall back to their
/// own defaults for unset fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    /// Provider-specific extras passed through opaquely.
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A single inference request as it enters the dispatch plane. Immutable once
/// constructed; `request_id` is unique per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub request_id: String,
    /// Logical model reference. May carry a `provider/` prefix, which the
    /// router strips into `preferred_provider`.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub parameters: GenerationParams,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_device: Option<DeviceType>,
    /// Request-level timeout in milliseconds; deployment default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// 0 (lowest) to 10 (highest).
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub cost_sensitive: bool,
    #[serde(default)]
    pub cache_bypass: bool,
}

impl InferenceRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            model: model.into(),
            messages,
            parameters: GenerationParams::default(),
            tools: vec![],
            tool_choice: None,
            streaming: false,
            preferred_provider: None,
            preferred_device: None,
            timeout_ms: None,
            priority: 0,
            cost_sensitive: false,
            cache_bypass: false,
        }
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_parameters(mut self, parameters: GenerationParams) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_preferred_provider(mut self, provider: impl Into<String>) -> Self {
        self.preferred_provider = Some(provider.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Structural validation before the request enters routing.
    pub fn validate(&self) -> Result<()> {
        if self.request_id.is_empty() {
            return Err(GatewayError::invalid_request("request_id must be non-empty"));
        }
        if self.model.is_empty() {
            return Err(GatewayError::invalid_request("model must be non-empty"));
        }
        if self.messages.is_empty() {
            return Err(GatewayError::invalid_request("messages must be non-empty"));
        }
        if self.priority > 10 {
            return Err(GatewayError::invalid_request(format!(
                "priority {} out of range [0,10]",
                self.priority
            )));
        }
        if let Some(t) = self.parameters.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(GatewayError::invalid_request(format!(
                "temperature {t} out of range [0.0, 2.0]"
            )));
        }
        Ok(())
    }
}

/// A complete (non-streaming) inference result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub request_id: String,
    pub content: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub tokens_used: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub streaming: bool,
}

impl InferenceResponse {
    pub fn new(request_id: impl Into<String>, model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            content: content.into(),
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            tokens_used: 0,
            duration_ms: 0,
            metadata: Default::default(),
            timestamp: Utc::now(),
            streaming: false,
        }
    }

    pub fn with_usage(mut self, input_tokens: u32, output_tokens: u32) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self.tokens_used = input_tokens + output_tokens;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCall,
    ContentFilter,
    Error,
    Cancelled,
}

/// One element of a response stream. Sequence numbers are dense and start at
/// 0 within a request; exactly one chunk per stream has `is_complete = true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub request_id: String,
    pub sequence_number: u64,
    pub token: String,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    pub timestamp: DateTime<Utc>,
}

impl StreamChunk {
    pub fn token(request_id: impl Into<String>, sequence_number: u64, token: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            sequence_number,
            token: token.into(),
            is_complete: false,
            finish_reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn terminal(
        request_id: impl Into<String>,
        sequence_number: u64,
        finish_reason: FinishReason,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            sequence_number,
            token: String::new(),
            is_complete: true,
            finish_reason: Some(finish_reason),
            timestamp: Utc::now(),
        }
    }
}
