//! # manifold-providers
//!
//! The provider adapter contract and the concrete backend adapters: OpenAI
//! compatible HTTP APIs (OpenAI, Cerebras, Mistral), Anthropic, Gemini,
//! Ollama, native in-process backends (GGUF / LiteRT) behind an opaque
//! backend trait, and a scriptable mock for tests.

pub mod adapter;
pub mod anthropic;
pub mod gemini;
pub mod mock;
pub mod native;
pub mod ollama;
pub mod openai;
pub mod sse;

pub use adapter::{
    cost_per_mtok, estimate_cost_usd, map_http_status, map_transport_error, ProviderAdapter,
    ProviderConfig, TokenEvent,
};
pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use mock::{MockAdapter, MockOutcome, ScriptedBackend};
pub use native::{NativeAdapter, NativeBackend};
pub use ollama::OllamaAdapter;
pub use openai::OpenAiCompatAdapter;
