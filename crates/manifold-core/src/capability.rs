use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::{DeviceType, ModelFormat};
use crate::tenant::TenantId;

/// What a provider can do. Static per provider kind; used by the selection
/// policy's hard filter gates and scoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub streaming: bool,
    pub function_calling: bool,
    pub multimodal: bool,
    pub embeddings: bool,
    pub max_context_tokens: u32,
    pub max_output_tokens: u32,
    /// Exact names or `prefix-*` patterns.
    pub supported_models: BTreeSet<String>,
    pub supported_formats: BTreeSet<ModelFormat>,
    pub supported_devices: BTreeSet<DeviceType>,
    pub features: BTreeSet<String>,
}

impl ProviderCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn with_function_calling(mut self) -> Self {
        self.function_calling = true;
        self
    }

    pub fn with_context_window(mut self, max_context: u32, max_output: u32) -> Self {
        self.max_context_tokens = max_context;
        self.max_output_tokens = max_output;
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_models.extend(models.into_iter().map(Into::into));
        self
    }

    pub fn with_format(mut self, format: ModelFormat) -> Self {
        self.supported_formats.insert(format);
        self
    }

    pub fn with_device(mut self, device: DeviceType) -> Self {
        self.supported_devices.insert(device);
        self
    }

    /// Match a model name against the supported set. Entries ending in `*`
    /// match by prefix, everything else matches exactly. An empty set matches
    /// nothing.
    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_models.iter().any(|pattern| {
            if let Some(prefix) = pattern.strip_suffix('*') {
                model.starts_with(prefix)
            } else {
                pattern == model
            }
        })
    }
}

/// Coarse provider liveness as seen by the last probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Up,
    Degraded,
    Down,
    Initializing,
    Unknown,
}

/// Result of a provider health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub message: String,
    pub probed_at: DateTime<Utc>,
}

impl ProviderHealth {
    pub fn up() -> Self {
        Self {
            status: HealthStatus::Up,
            message: String::new(),
            probed_at: Utc::now(),
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: message.into(),
            probed_at: Utc::now(),
        }
    }

    pub fn down(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Down,
            message: message.into(),
            probed_at: Utc::now(),
        }
    }

    pub fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            message: String::new(),
            probed_at: Utc::now(),
        }
    }

    pub fn is_up(&self) -> bool {
        self.status == HealthStatus::Up
    }
}

/// Cache key for the runner warm pool: one runner at most per
/// (tenant, model, provider) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunnerCacheKey {
    pub tenant_id: TenantId,
    pub model_id: String,
    pub provider_id: String,
}

impl RunnerCacheKey {
    pub fn new(
        tenant_id: TenantId,
        model_id: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            model_id: model_id.into(),
            provider_id: provider_id.into(),
        }
    }
}

impl fmt::Display for RunnerCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.model_id, self.provider_id)
    }
}
