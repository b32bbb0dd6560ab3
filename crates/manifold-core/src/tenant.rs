use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Sentinel tenant used when a request arrives without credentials.
pub const COMMUNITY_TENANT: &str = "community";

/// Tenant identifier — the isolation unit for quotas, manifests, and the
/// runner cache. Always resolved server-side from the API key; client-supplied
/// tenant fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Create a tenant id. Empty ids are invalid.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(GatewayError::invalid_request("tenant id must be non-empty"));
        }
        Ok(Self(id))
    }

    /// The unauthenticated "community" tenant.
    pub fn community() -> Self {
        Self(COMMUNITY_TENANT.to_string())
    }

    pub fn is_community(&self) -> bool {
        self.0 == COMMUNITY_TENANT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque API key. The server resolves it to a [`TenantId`]; it is never
/// logged or echoed, hence the redacting `Debug`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey(****)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tenant_rejected() {
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("acme").is_ok());
    }

    #[test]
    fn community_sentinel() {
        let t = TenantId::community();
        assert!(t.is_community());
        assert_eq!(t.as_str(), "community");
    }

    #[test]
    fn api_key_debug_redacts() {
        let key = ApiKey::new("sk-secret-value");
        assert_eq!(format!("{key:?}"), "ApiKey(****)");
    }
}
