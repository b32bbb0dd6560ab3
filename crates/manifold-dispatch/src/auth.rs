use dashmap::DashMap;
use manifold_core::{ApiKey, GatewayError, Result, TenantId};

/// Resolves API keys to tenants. Client-supplied tenant fields are never
/// trusted; this is the only path to a [`TenantId`].
pub trait TenantResolver: Send + Sync {
    fn resolve(&self, api_key: Option<&ApiKey>) -> Result<TenantId>;
}

/// Key table for single-node deployments. Requests without a key resolve to
/// the community sentinel tenant; unknown keys are rejected.
#[derive(Default)]
pub struct StaticTenantResolver {
    keys: DashMap<String, TenantId>,
}

impl StaticTenantResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, api_key: ApiKey, tenant: TenantId) {
        self.keys.insert(api_key.as_str().to_string(), tenant);
    }
}

impl TenantResolver for StaticTenantResolver {
    fn resolve(&self, api_key: Option<&ApiKey>) -> Result<TenantId> {
        match api_key {
            None => Ok(TenantId::community()),
            Some(key) => self
                .keys
                .get(key.as_str())
                .map(|t| t.clone())
                .ok_or_else(GatewayError::tenant_not_found),
        }
    }
}
