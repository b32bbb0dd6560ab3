//! # manifold-config
//!
//! Configuration schema (`manifold.toml`) and loader for the gateway.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    CircuitBreakerConfig, GatewayConfig, LoggingConfig, PoolConfig, PoolKind, ProviderSettings,
    QuotaConfig, RoutingConfig, RunnerFactoryConfig, SessionConfig, StrategyKind, TenantQuota,
};
