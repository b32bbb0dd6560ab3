use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration — maps to `manifold.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub routing: RoutingConfig,
    pub runner_factory: RunnerFactoryConfig,
    pub session: SessionConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub quota: QuotaConfig,
    pub providers: HashMap<String, ProviderSettings>,
    pub logging: LoggingConfig,
}

// ── Routing ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    Failover,
    Scored,
    RoundRobin,
    WeightedRandom,
    LeastLoaded,
    CostOptimized,
    LatencyOptimized,
    UserSelected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolKind {
    Cloud,
    Local,
}

/// A named provider pool with its own strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PoolKind,
    pub providers: Vec<String>,
    pub strategy: StrategyKind,
    /// Required by WEIGHTED_RANDOM; keyed by provider id.
    #[serde(default)]
    pub weights: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub default_strategy: StrategyKind,
    /// Maximum failover attempts per request.
    pub max_retries: usize,
    pub auto_failover: bool,
    pub pools: Vec<PoolConfig>,
    /// Applied when the request itself carries no timeout.
    pub default_timeout_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_strategy: StrategyKind::Scored,
            max_retries: 3,
            auto_failover: true,
            pools: vec![],
            default_timeout_secs: 120,
        }
    }
}

// ── Runner factory ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerFactoryConfig {
    pub max_pool_size: usize,
    pub idle_timeout_secs: u64,
}

impl Default for RunnerFactoryConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 10,
            idle_timeout_secs: 15 * 60,
        }
    }
}

impl RunnerFactoryConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

// ── Sessions ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_concurrent: usize,
    pub max_idle_secs: u64,
    pub max_age_secs: u64,
    pub reuse_enabled: bool,
    pub warm_pool_size: usize,
    /// How long `acquire` waits for a free session before giving up.
    pub acquire_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_idle_secs: 15 * 60,
            max_age_secs: 60 * 60,
            reuse_enabled: true,
            warm_pool_size: 2,
            acquire_timeout_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

// ── Circuit breaker ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// Fraction of failures within the sliding window, in (0, 1].
    pub failure_rate_threshold: f64,
    pub sliding_window_size: usize,
    pub open_duration_secs: u64,
    pub half_open_permits: u32,
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            sliding_window_size: 10,
            open_duration_secs: 60,
            half_open_permits: 3,
            half_open_success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_duration_secs)
    }
}

// ── Quota ──────────────────────────────────────────────────────

/// Per-tenant limits over a one-minute window, plus a concurrency cap.
/// Zero disables the corresponding limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantQuota {
    pub requests_per_minute: u64,
    pub input_tokens_per_minute: u64,
    pub output_tokens_per_minute: u64,
    pub max_concurrent: u64,
}

impl Default for TenantQuota {
    fn default() -> Self {
        Self {
            requests_per_minute: 600,
            input_tokens_per_minute: 1_000_000,
            output_tokens_per_minute: 250_000,
            max_concurrent: 32,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub default: TenantQuota,
    /// Overrides keyed by tenant id.
    pub tenants: HashMap<String, TenantQuota>,
}

impl QuotaConfig {
    pub fn for_tenant(&self, tenant_id: &str) -> &TenantQuota {
        self.tenants.get(tenant_id).unwrap_or(&self.default)
    }
}

// ── Providers ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub enabled: bool,
    /// Credential; env vars fill this when unset in the file.
    pub api_key: Option<String>,
    /// Endpoint override.
    pub base_url: Option<String>,
    /// Models this deployment allows on the provider. Entries ending in `*`
    /// match by prefix. Empty means the adapter's built-in defaults.
    pub models: Vec<String>,
    /// Soft capacity used for the load ratio in metrics.
    pub soft_capacity: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: None,
            models: vec![],
            soft_capacity: 16,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Tracing filter directive, e.g. "info" or "manifold=debug,info".
    pub level: String,
    /// "text" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

impl GatewayConfig {
    /// Validate the configuration. Returns warnings for suspect values;
    /// errors describe values the gateway cannot run with.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        let cb = &self.circuit_breaker;
        if !(0.0..=1.0).contains(&cb.failure_rate_threshold) || cb.failure_rate_threshold == 0.0 {
            return Err(format!(
                "circuit_breaker.failure_rate_threshold must be in (0, 1], got {}",
                cb.failure_rate_threshold
            ));
        }
        if cb.sliding_window_size < cb.failure_threshold as usize {
            return Err(format!(
                "circuit_breaker.sliding_window_size ({}) must be >= failure_threshold ({})",
                cb.sliding_window_size, cb.failure_threshold
            ));
        }
        if cb.half_open_success_threshold > cb.half_open_permits {
            return Err(format!(
                "circuit_breaker.half_open_success_threshold ({}) must be <= half_open_permits ({})",
                cb.half_open_success_threshold, cb.half_open_permits
            ));
        }

        if self.routing.max_retries == 0 {
            return Err("routing.max_retries must be >= 1".into());
        }
        if self.runner_factory.max_pool_size == 0 {
            return Err("runner_factory.max_pool_size must be >= 1".into());
        }
        if self.session.max_concurrent == 0 {
            return Err("session.max_concurrent must be >= 1".into());
        }
        if self.session.warm_pool_size > self.session.max_concurrent {
            warnings.push(format!(
                "session.warm_pool_size ({}) exceeds max_concurrent ({}); clamping at runtime",
                self.session.warm_pool_size, self.session.max_concurrent
            ));
        }

        for pool in &self.routing.pools {
            if pool.providers.is_empty() {
                return Err(format!("routing pool '{}' has no providers", pool.id));
            }
            if pool.strategy == StrategyKind::WeightedRandom {
                for p in &pool.providers {
                    if !pool.weights.contains_key(p) {
                        return Err(format!(
                            "routing pool '{}' uses WEIGHTED_RANDOM but has no weight for '{p}'",
                            pool.id
                        ));
                    }
                }
            }
        }

        for (id, settings) in &self.providers {
            if let Some(base_url) = &settings.base_url
                && url::Url::parse(base_url).is_err()
            {
                return Err(format!("providers.{id}.base_url is not a valid URL: {base_url}"));
            }
            if settings.enabled && settings.soft_capacity == 0 {
                warnings.push(format!("providers.{id}.soft_capacity is 0; load will read as saturated"));
            }
        }

        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::default();
        let warnings = config.validate().unwrap();
        assert!(warnings.is_empty());
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.runner_factory.max_pool_size, 10);
        assert_eq!(config.session.max_age_secs, 3600);
        assert_eq!(config.routing.max_retries, 3);
    }

    #[test]
    fn bad_failure_rate_rejected() {
        let mut config = GatewayConfig::default();
        config.circuit_breaker.failure_rate_threshold = 0.0;
        assert!(config.validate().is_err());
        config.circuit_breaker.failure_rate_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn window_must_cover_threshold() {
        let mut config = GatewayConfig::default();
        config.circuit_breaker.sliding_window_size = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn weighted_pool_requires_weights() {
        let mut config = GatewayConfig::default();
        config.routing.pools.push(PoolConfig {
            id: "cloud".into(),
            kind: PoolKind::Cloud,
            providers: vec!["openai".into(), "anthropic".into()],
            strategy: StrategyKind::WeightedRandom,
            weights: HashMap::from([("openai".into(), 2.0)]),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_base_url_rejected() {
        let mut config = GatewayConfig::default();
        config
            .providers
            .insert("ollama".into(), ProviderSettings {
                base_url: Some("not a url".into()),
                ..Default::default()
            });
        assert!(config.validate().is_err());
    }

    #[test]
    fn quota_lookup_falls_back_to_default() {
        let mut config = GatewayConfig::default();
        config.quota.tenants.insert("acme".into(), TenantQuota {
            requests_per_minute: 10,
            ..Default::default()
        });
        assert_eq!(config.quota.for_tenant("acme").requests_per_minute, 10);
        assert_eq!(
            config.quota.for_tenant("other").requests_per_minute,
            TenantQuota::default().requests_per_minute
        );
    }

    #[test]
    fn parses_minimal_toml() {
        let raw = r#"
            [routing]
            default_strategy = "FAILOVER"
            max_retries = 2

            [providers.openai]
            api_key = "sk-test"
            models = ["gpt-4o", "gpt-4o-mini"]

            [quota.tenants.acme]
            requests_per_minute = 60
        "#;
        let config: GatewayConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.routing.default_strategy, StrategyKind::Failover);
        assert_eq!(config.routing.max_retries, 2);
        assert_eq!(config.providers["openai"].models.len(), 2);
        assert_eq!(config.quota.for_tenant("acme").requests_per_minute, 60);
    }
}
