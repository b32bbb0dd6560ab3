//! # manifold-core
//!
//! Core types, the error taxonomy, and the request context for the Manifold
//! inference gateway. This crate defines the shared vocabulary used by every
//! other crate in the workspace.

pub mod capability;
pub mod context;
pub mod error;
pub mod manifest;
pub mod request;
pub mod tenant;

pub use capability::{HealthStatus, ProviderCapabilities, ProviderHealth, RunnerCacheKey};
pub use context::RequestContext;
pub use error::{ErrorCategory, ErrorKind, GatewayError, Result};
pub use manifest::{
    DeviceRequirement, DeviceType, ModelFormat, ModelManifest, ResourceRequirements,
};
pub use request::{
    ChatMessage, FinishReason, GenerationParams, InferenceRequest, InferenceResponse, Role,
    StreamChunk, ToolChoice, ToolSpec,
};
pub use tenant::{ApiKey, TenantId, COMMUNITY_TENANT};
