use std::time::{Duration, Instant};

use dashmap::DashMap;
use manifold_config::QuotaConfig;
use manifold_core::{GatewayError, Result, TenantId};
use tracing::warn;

/// The resource dimensions quotas are enforced over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Requests,
    InputTokens,
    OutputTokens,
    Concurrent,
}

/// Per-tenant quota enforcement with reserve/release semantics.
///
/// The backing store is pluggable; [`InMemoryQuota`] serves single-node
/// deployments, clustered deployments implement this over a shared counter
/// service. All operations are atomic per `(tenant, kind)` key.
pub trait QuotaEnforcer: Send + Sync {
    /// Non-consuming admission check.
    fn check(&self, tenant: &TenantId, kind: ResourceKind, amount: u64) -> Result<()>;

    /// Atomically consume `amount`, remembering the reservation under
    /// `request_id`. Fails with `QUOTA_EXCEEDED` (and a retry-after hint)
    /// when the budget would be exceeded.
    fn reserve(
        &self,
        tenant: &TenantId,
        kind: ResourceKind,
        amount: u64,
        request_id: &str,
    ) -> Result<()>;

    /// Release the reservation made under `request_id`. Idempotent: the
    /// second and later calls for the same reservation are no-ops.
    /// Concurrency reservations refund capacity; windowed kinds stay
    /// consumed (the bucket refills over time).
    fn release(&self, tenant: &TenantId, kind: ResourceKind, request_id: &str);

    /// Reconcile reserved versus actual usage (e.g. actual output tokens).
    /// With a prior reservation the unused remainder is refunded; without
    /// one the actual amount is debited post-hoc.
    fn on_complete(&self, tenant: &TenantId, kind: ResourceKind, actual: u64, request_id: &str);
}

// ── In-memory token buckets ────────────────────────────────────

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(burst: u64) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, burst: u64, refill_per_sec: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(burst as f64);
        self.last_refill = now;
    }

    fn try_consume(&mut self, amount: u64) -> bool {
        if self.tokens >= amount as f64 {
            self.tokens -= amount as f64;
            true
        } else {
            false
        }
    }

    fn credit(&mut self, amount: u64, burst: u64) {
        self.tokens = (self.tokens + amount as f64).min(burst as f64);
    }

    fn debit_saturating(&mut self, amount: u64) {
        self.tokens = (self.tokens - amount as f64).max(0.0);
    }

    /// Seconds until `amount` tokens become available.
    fn retry_after(&self, amount: u64, refill_per_sec: f64) -> Duration {
        if refill_per_sec <= 0.0 {
            return Duration::from_secs(1);
        }
        let needed = (amount as f64 - self.tokens).max(0.0);
        Duration::from_secs((needed / refill_per_sec).ceil().max(1.0) as u64)
    }
}

#[derive(Debug)]
struct Reservation {
    amount: u64,
}

/// Token buckets keyed by `(tenant, kind)`, with a reservation ledger keyed
/// by `(request_id, kind)` that makes release idempotent. Dashmap entry
/// guards serialize reserve against release per key.
pub struct InMemoryQuota {
    config: QuotaConfig,
    buckets: DashMap<(TenantId, ResourceKind), Bucket>,
    ledger: DashMap<(String, ResourceKind), Reservation>,
}

impl InMemoryQuota {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            ledger: DashMap::new(),
        }
    }

    /// (burst, refill per second) for a tenant and kind; `None` = unlimited.
    fn limits(&self, tenant: &TenantId, kind: ResourceKind) -> Option<(u64, f64)> {
        let quota = self.config.for_tenant(tenant.as_str());
        let per_minute = match kind {
            ResourceKind::Requests => quota.requests_per_minute,
            ResourceKind::InputTokens => quota.input_tokens_per_minute,
            ResourceKind::OutputTokens => quota.output_tokens_per_minute,
            ResourceKind::Concurrent => {
                return (quota.max_concurrent > 0).then_some((quota.max_concurrent, 0.0));
            }
        };
        (per_minute > 0).then_some((per_minute, per_minute as f64 / 60.0))
    }

    /// Drop buckets idle for more than ten minutes.
    pub fn cleanup(&self) {
        let cutoff = Instant::now() - Duration::from_secs(600);
        self.buckets.retain(|_, bucket| bucket.last_refill > cutoff);
    }
}

impl QuotaEnforcer for InMemoryQuota {
    fn check(&self, tenant: &TenantId, kind: ResourceKind, amount: u64) -> Result<()> {
        let Some((burst, refill)) = self.limits(tenant, kind) else {
            return Ok(());
        };
        let mut bucket = self
            .buckets
            .entry((tenant.clone(), kind))
            .or_insert_with(|| Bucket::new(burst));
        bucket.refill(burst, refill);
        if bucket.tokens >= amount as f64 {
            Ok(())
        } else {
            Err(GatewayError::quota_exceeded(bucket.retry_after(amount, refill))
                .with_context("tenant_id", tenant.as_str()))
        }
    }

    fn reserve(
        &self,
        tenant: &TenantId,
        kind: ResourceKind,
        amount: u64,
        request_id: &str,
    ) -> Result<()> {
        let Some((burst, refill)) = self.limits(tenant, kind) else {
            return Ok(());
        };
        let mut bucket = self
            .buckets
            .entry((tenant.clone(), kind))
            .or_insert_with(|| Bucket::new(burst));
        bucket.refill(burst, refill);
        if bucket.try_consume(amount) {
            self.ledger
                .insert((request_id.to_string(), kind), Reservation { amount });
            Ok(())
        } else {
            let retry_after = bucket.retry_after(amount, refill);
            warn!(tenant = %tenant, ?kind, amount, "quota exceeded");
            Err(GatewayError::quota_exceeded(retry_after)
                .with_context("tenant_id", tenant.as_str())
                .with_context("request_id", request_id))
        }
    }

    fn release(&self, tenant: &TenantId, kind: ResourceKind, request_id: &str) {
        let Some((_, reservation)) = self.ledger.remove(&(request_id.to_string(), kind)) else {
            return; // already released
        };
        if kind == ResourceKind::Concurrent
            && let Some((burst, _)) = self.limits(tenant, kind)
            && let Some(mut bucket) = self.buckets.get_mut(&(tenant.clone(), kind))
        {
            bucket.credit(reservation.amount, burst);
        }
    }

    fn on_complete(&self, tenant: &TenantId, kind: ResourceKind, actual: u64, request_id: &str) {
        let Some((burst, _refill)) = self.limits(tenant, kind) else {
            return;
        };
        match self.ledger.remove(&(request_id.to_string(), kind)) {
            Some((_, reservation)) => {
                let unused = reservation.amount.saturating_sub(actual);
                if unused > 0
                    && let Some(mut bucket) = self.buckets.get_mut(&(tenant.clone(), kind))
                {
                    bucket.credit(unused, burst);
                }
            }
            None => {
                let mut bucket = self
                    .buckets
                    .entry((tenant.clone(), kind))
                    .or_insert_with(|| Bucket::new(burst));
                bucket.debit_saturating(actual);
            }
        }
    }
}
