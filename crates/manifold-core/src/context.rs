use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::tenant::TenantId;

/// Request-scoped context threaded through every call site instead of any
/// ambient global: tenant, ids for tracing, an optional deadline, and the
/// cancellation token the whole attempt chain observes.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tenant_id: TenantId,
    pub request_id: String,
    pub trace_id: Uuid,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(tenant_id: TenantId, request_id: impl Into<String>) -> Self {
        Self {
            tenant_id,
            request_id: request_id.into(),
            trace_id: Uuid::new_v4(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Attach an externally owned cancellation token (e.g. an async job's).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline; `None` when no deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail fast when the request is already cancelled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(GatewayError::cancelled().with_context("request_id", &self.request_id));
        }
        if self.is_expired() {
            return Err(GatewayError::from_kind(crate::error::ErrorKind::RuntimeTimeout)
                .with_context("request_id", &self.request_id));
        }
        Ok(())
    }
}
