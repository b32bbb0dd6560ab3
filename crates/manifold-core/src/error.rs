use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error families. Every [`ErrorKind`] belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Model,
    Tensor,
    Device,
    Quota,
    Auth,
    Init,
    Runtime,
    Storage,
    Conversion,
    Validation,
    Circuit,
    Provider,
    Routing,
    Plugin,
    Config,
    Network,
    Stream,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Model => "MODEL",
            ErrorCategory::Tensor => "TENSOR",
            ErrorCategory::Device => "DEVICE",
            ErrorCategory::Quota => "QUOTA",
            ErrorCategory::Auth => "AUTH",
            ErrorCategory::Init => "INIT",
            ErrorCategory::Runtime => "RUNTIME",
            ErrorCategory::Storage => "STORAGE",
            ErrorCategory::Conversion => "CONVERSION",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::Circuit => "CIRCUIT",
            ErrorCategory::Provider => "PROVIDER",
            ErrorCategory::Routing => "ROUTING",
            ErrorCategory::Plugin => "PLUGIN",
            ErrorCategory::Config => "CONFIG",
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::Stream => "STREAM",
            ErrorCategory::Internal => "INTERNAL",
        }
    }
}

/// Every error the dispatch plane can surface, with its wire-level affinity.
///
/// Retryability is a property of the kind: the router advances to the next
/// candidate provider only for kinds where [`ErrorKind::retryable`] is true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    // ── Model ──────────────────────────────────────────────────
    ModelNotFound,

    // ── Device ─────────────────────────────────────────────────
    DeviceOutOfMemory,
    DeviceUnavailable,

    // ── Quota ──────────────────────────────────────────────────
    QuotaExceeded,

    // ── Auth ───────────────────────────────────────────────────
    AuthTenantNotFound,
    AuthForbidden,

    // ── Init ───────────────────────────────────────────────────
    InitFailed,

    // ── Runtime ────────────────────────────────────────────────
    RuntimeTimeout,
    RequestCancelled,
    JobNotFound,

    // ── Validation ─────────────────────────────────────────────
    ValidationInvalidRequest,

    // ── Circuit ────────────────────────────────────────────────
    CircuitBreakerOpen,

    // ── Provider ───────────────────────────────────────────────
    ProviderUnavailable,
    ProviderTimeout,
    ProviderRateLimited,
    ProviderInvalidRequest,

    // ── Routing ────────────────────────────────────────────────
    RoutingNoCompatibleProvider,
    AllRunnersFailed,

    // ── Config ─────────────────────────────────────────────────
    ConfigInvalid,

    // ── Network ────────────────────────────────────────────────
    NetworkTimeout,

    // ── Stream ─────────────────────────────────────────────────
    StreamDisconnected,
    StreamBufferOverflow,

    // ── Internal ───────────────────────────────────────────────
    Internal,
}

impl ErrorKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::ModelNotFound => ErrorCategory::Model,
            ErrorKind::DeviceOutOfMemory | ErrorKind::DeviceUnavailable => ErrorCategory::Device,
            ErrorKind::QuotaExceeded => ErrorCategory::Quota,
            ErrorKind::AuthTenantNotFound | ErrorKind::AuthForbidden => ErrorCategory::Auth,
            ErrorKind::InitFailed => ErrorCategory::Init,
            ErrorKind::RuntimeTimeout | ErrorKind::RequestCancelled | ErrorKind::JobNotFound => {
                ErrorCategory::Runtime
            }
            ErrorKind::ValidationInvalidRequest => ErrorCategory::Validation,
            ErrorKind::CircuitBreakerOpen => ErrorCategory::Circuit,
            ErrorKind::ProviderUnavailable
            | ErrorKind::ProviderTimeout
            | ErrorKind::ProviderRateLimited
            | ErrorKind::ProviderInvalidRequest => ErrorCategory::Provider,
            ErrorKind::RoutingNoCompatibleProvider | ErrorKind::AllRunnersFailed => {
                ErrorCategory::Routing
            }
            ErrorKind::ConfigInvalid => ErrorCategory::Config,
            ErrorKind::NetworkTimeout => ErrorCategory::Network,
            ErrorKind::StreamDisconnected | ErrorKind::StreamBufferOverflow => {
                ErrorCategory::Stream
            }
            ErrorKind::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `CATEGORY_NNN` code, part of the wire contract.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ModelNotFound => "MODEL_001",
            ErrorKind::DeviceOutOfMemory => "DEVICE_001",
            ErrorKind::DeviceUnavailable => "DEVICE_002",
            ErrorKind::QuotaExceeded => "QUOTA_001",
            ErrorKind::AuthTenantNotFound => "AUTH_001",
            ErrorKind::AuthForbidden => "AUTH_002",
            ErrorKind::InitFailed => "INIT_001",
            ErrorKind::RuntimeTimeout => "RUNTIME_001",
            ErrorKind::RequestCancelled => "RUNTIME_002",
            ErrorKind::JobNotFound => "RUNTIME_003",
            ErrorKind::ValidationInvalidRequest => "VALIDATION_001",
            ErrorKind::CircuitBreakerOpen => "CIRCUIT_001",
            ErrorKind::ProviderUnavailable => "PROVIDER_001",
            ErrorKind::ProviderTimeout => "PROVIDER_002",
            ErrorKind::ProviderRateLimited => "PROVIDER_003",
            ErrorKind::ProviderInvalidRequest => "PROVIDER_004",
            ErrorKind::RoutingNoCompatibleProvider => "ROUTING_001",
            ErrorKind::AllRunnersFailed => "ROUTING_002",
            ErrorKind::ConfigInvalid => "CONFIG_001",
            ErrorKind::NetworkTimeout => "NETWORK_001",
            ErrorKind::StreamDisconnected => "STREAM_001",
            ErrorKind::StreamBufferOverflow => "STREAM_002",
            ErrorKind::Internal => "INTERNAL_001",
        }
    }

    /// HTTP status the REST boundary should map this kind to.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::ModelNotFound | ErrorKind::JobNotFound => 404,
            ErrorKind::QuotaExceeded | ErrorKind::ProviderRateLimited => 429,
            ErrorKind::AuthTenantNotFound => 401,
            ErrorKind::AuthForbidden => 403,
            ErrorKind::ValidationInvalidRequest | ErrorKind::ProviderInvalidRequest => 400,
            ErrorKind::RuntimeTimeout | ErrorKind::ProviderTimeout | ErrorKind::NetworkTimeout => {
                504
            }
            ErrorKind::RequestCancelled => 499,
            ErrorKind::CircuitBreakerOpen
            | ErrorKind::ProviderUnavailable
            | ErrorKind::RoutingNoCompatibleProvider
            | ErrorKind::AllRunnersFailed
            | ErrorKind::DeviceOutOfMemory
            | ErrorKind::DeviceUnavailable => 503,
            ErrorKind::StreamDisconnected | ErrorKind::StreamBufferOverflow => 502,
            ErrorKind::InitFailed | ErrorKind::ConfigInvalid | ErrorKind::Internal => 500,
        }
    }

    /// Whether the router may recover by advancing to another provider.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::DeviceOutOfMemory
                | ErrorKind::RuntimeTimeout
                | ErrorKind::CircuitBreakerOpen
                | ErrorKind::AllRunnersFailed
                | ErrorKind::ProviderUnavailable
                | ErrorKind::ProviderTimeout
                | ErrorKind::ProviderRateLimited
                | ErrorKind::NetworkTimeout
                | ErrorKind::StreamDisconnected
        )
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorKind::ModelNotFound => "model not found",
            ErrorKind::DeviceOutOfMemory => "device out of memory",
            ErrorKind::DeviceUnavailable => "requested device unavailable",
            ErrorKind::QuotaExceeded => "quota exceeded",
            ErrorKind::AuthTenantNotFound => "tenant not found for API key",
            ErrorKind::AuthForbidden => "operation not permitted for tenant",
            ErrorKind::InitFailed => "provider initialization failed",
            ErrorKind::RuntimeTimeout => "operation timed out",
            ErrorKind::RequestCancelled => "request cancelled",
            ErrorKind::JobNotFound => "job not found",
            ErrorKind::ValidationInvalidRequest => "invalid request",
            ErrorKind::CircuitBreakerOpen => "circuit breaker open",
            ErrorKind::ProviderUnavailable => "provider unavailable",
            ErrorKind::ProviderTimeout => "provider timed out",
            ErrorKind::ProviderRateLimited => "provider rate limited",
            ErrorKind::ProviderInvalidRequest => "provider rejected request",
            ErrorKind::RoutingNoCompatibleProvider => "no compatible provider",
            ErrorKind::AllRunnersFailed => "all candidate runners failed",
            ErrorKind::ConfigInvalid => "invalid configuration",
            ErrorKind::NetworkTimeout => "network timeout",
            ErrorKind::StreamDisconnected => "stream disconnected before completion",
            ErrorKind::StreamBufferOverflow => "stream buffer overflow",
            ErrorKind::Internal => "internal error",
        }
    }
}

/// Unified error type for the dispatch plane.
///
/// Carries the taxonomy kind, a human message, a context map for debugging
/// (`model_id`, `tenant_id`, `provider_id`, `attempt`, …), an optional
/// retry-after hint, and an optional source error.
#[derive(Debug, Error)]
#[error("{}: {message}", .kind.code())]
pub struct GatewayError {
    pub kind: ErrorKind,
    message: String,
    context: BTreeMap<&'static str, String>,
    retry_after: Option<Duration>,
    #[source]
    source: Option<anyhow::Error>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
            retry_after: None,
            source: None,
        }
    }

    /// Construct with the kind's default message.
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self::new(kind, kind.default_message())
    }

    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.insert(key, value.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &BTreeMap<&'static str, String> {
        &self.context
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Default circuit-breaker failure predicate: retryable and upstream
    /// failures count; client-side validation, auth, and quota refusals do
    /// not trip a provider's breaker.
    pub fn counts_against_breaker(&self) -> bool {
        match self.kind {
            ErrorKind::ProviderInvalidRequest | ErrorKind::RequestCancelled => false,
            kind => !matches!(
                kind.category(),
                ErrorCategory::Validation
                    | ErrorCategory::Auth
                    | ErrorCategory::Quota
                    | ErrorCategory::Model
                    | ErrorCategory::Config
            ),
        }
    }

    // ── Common constructors ────────────────────────────────────

    pub fn model_not_found(model: impl Into<String>) -> Self {
        let model = model.into();
        Self::new(ErrorKind::ModelNotFound, format!("model not found: {model}"))
            .with_context("model_id", model)
    }

    pub fn quota_exceeded(retry_after: Duration) -> Self {
        Self::from_kind(ErrorKind::QuotaExceeded).with_retry_after(retry_after)
    }

    pub fn tenant_not_found() -> Self {
        Self::from_kind(ErrorKind::AuthTenantNotFound)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationInvalidRequest, message)
    }

    pub fn circuit_open(provider: impl Into<String>) -> Self {
        let provider = provider.into();
        Self::new(
            ErrorKind::CircuitBreakerOpen,
            format!("circuit breaker open for provider {provider}"),
        )
        .with_context("provider_id", provider)
    }

    pub fn no_compatible_provider(model: impl Into<String>) -> Self {
        let model = model.into();
        Self::new(
            ErrorKind::RoutingNoCompatibleProvider,
            format!("no compatible provider for model {model}"),
        )
        .with_context("model_id", model)
    }

    pub fn all_runners_failed(model: impl Into<String>) -> Self {
        let model = model.into();
        Self::new(
            ErrorKind::AllRunnersFailed,
            format!("all candidate runners failed for model {model}"),
        )
        .with_context("model_id", model)
    }

    pub fn cancelled() -> Self {
        Self::from_kind(ErrorKind::RequestCancelled)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::new(ErrorKind::Internal, err.to_string()).with_source(err)
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
