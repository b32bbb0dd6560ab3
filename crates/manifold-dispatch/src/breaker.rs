use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use manifold_config::CircuitBreakerConfig;
use manifold_core::GatewayError;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Decides whether a failure counts toward tripping the breaker.
pub type FailurePredicate = Arc<dyn Fn(&GatewayError) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation — calls flow through.
    Closed,
    /// Provider is failing — calls are rejected until the open period lapses.
    Open,
    /// Recovery probing — a bounded number of calls are permitted.
    HalfOpen,
}

/// Observability snapshot of one breaker.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
    pub state_changed_at: Instant,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    opened_at: Option<Instant>,
    changed_at: Instant,
    /// Sliding outcome window, newest at the back; `true` = success.
    window: VecDeque<bool>,
    half_open_permits_used: u32,
    half_open_successes: u32,
}

/// Per-provider circuit breaker.
///
/// State transitions are serialized under the inner mutex; total counters are
/// atomics so snapshots never block a transition. The open→half-open edge is
/// evaluated lazily on [`CircuitBreaker::permit_call`].
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    predicate: FailurePredicate,
    inner: Mutex<BreakerInner>,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_predicate(name, config, Arc::new(|e| e.counts_against_breaker()))
    }

    pub fn with_predicate(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        predicate: FailurePredicate,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            predicate,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                opened_at: None,
                changed_at: Instant::now(),
                window: VecDeque::new(),
                half_open_permits_used: 0,
                half_open_successes: 0,
            }),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
        }
    }

    /// Whether a call may proceed right now. Performs the lazy OPEN →
    /// HALF_OPEN transition once the open period has lapsed.
    pub fn permit_call(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let lapsed = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.open_duration());
                if lapsed {
                    Self::transition(&self.name, &mut inner, CircuitState::HalfOpen);
                    inner.half_open_permits_used = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_permits_used < self.config.half_open_permits {
                    inner.half_open_permits_used += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        Self::push_outcome(&mut inner, true, self.config.sliding_window_size);
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.half_open_success_threshold {
                Self::transition(&self.name, &mut inner, CircuitState::Closed);
                inner.window.clear();
            }
        }
    }

    /// Record a failure. Failures rejected by the predicate (client
    /// validation errors and the like) are ignored entirely.
    pub fn record_failure(&self, err: &GatewayError) {
        if !(self.predicate)(err) {
            return;
        }
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        Self::push_outcome(&mut inner, false, self.config.sliding_window_size);
        match inner.state {
            CircuitState::HalfOpen => {
                Self::transition(&self.name, &mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                let failures = inner.window.iter().filter(|ok| !**ok).count();
                let rate = failures as f64 / inner.window.len() as f64;
                if failures >= self.config.failure_threshold as usize
                    && rate >= self.config.failure_rate_threshold
                {
                    warn!(
                        breaker = %self.name,
                        failures,
                        window = inner.window.len(),
                        "circuit breaker OPEN — provider disabled for {}s",
                        self.config.open_duration_secs
                    );
                    Self::transition(&self.name, &mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker back to CLOSED.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        Self::transition(&self.name, &mut inner, CircuitState::Closed);
        inner.window.clear();
    }

    /// Force the breaker OPEN (e.g. operator action).
    pub fn trip_open(&self) {
        let mut inner = self.inner.lock();
        Self::transition(&self.name, &mut inner, CircuitState::Open);
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// OPEN and still within the open period. A lapsed OPEN breaker reads as
    /// not-open so candidate ranking lets the half-open probe through.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|at| at.elapsed() < self.config.open_duration())
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: self.total_failures.load(Ordering::Relaxed),
            success_count: self.total_successes.load(Ordering::Relaxed),
            state_changed_at: inner.changed_at,
        }
    }

    /// Idempotent transition: re-entering the current state changes nothing.
    fn transition(name: &str, inner: &mut BreakerInner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        debug!(breaker = %name, from = ?inner.state, to = ?to, "circuit state transition");
        inner.state = to;
        inner.changed_at = Instant::now();
        match to {
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
            CircuitState::HalfOpen => {
                inner.half_open_permits_used = 0;
                inner.half_open_successes = 0;
            }
            CircuitState::Closed => inner.opened_at = None,
        }
    }

    fn push_outcome(inner: &mut BreakerInner, ok: bool, window_size: usize) {
        inner.window.push_back(ok);
        while inner.window.len() > window_size {
            inner.window.pop_front();
        }
    }
}

/// One breaker per provider, created on first use, never dropped for the
/// process lifetime.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn get(&self, provider_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(provider_id, self.config.clone())))
            .clone()
    }

    pub fn is_open(&self, provider_id: &str) -> bool {
        self.breakers
            .get(provider_id)
            .map(|b| b.is_open())
            .unwrap_or(false)
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.iter().map(|b| b.snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::ErrorKind;

    fn upstream_error() -> GatewayError {
        GatewayError::from_kind(ErrorKind::ProviderUnavailable)
    }

    fn config(open_duration_secs: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            sliding_window_size: 5,
            open_duration_secs,
            half_open_permits: 3,
            half_open_success_threshold: 2,
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("p", config(60));
        for _ in 0..4 {
            breaker.record_failure(&upstream_error());
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.record_failure(&upstream_error());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.permit_call());
    }

    #[test]
    fn open_lapses_into_half_open_probe() {
        let breaker = CircuitBreaker::new("p", config(0));
        for _ in 0..5 {
            breaker.record_failure(&upstream_error());
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        // zero open duration: the next permit flips to half-open
        assert!(breaker.permit_call());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new("p", config(0));
        for _ in 0..5 {
            breaker.record_failure(&upstream_error());
        }
        assert!(breaker.permit_call());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.permit_call());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("p", config(0));
        for _ in 0..5 {
            breaker.record_failure(&upstream_error());
        }
        assert!(breaker.permit_call());
        breaker.record_failure(&upstream_error());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_bounds_permits() {
        let breaker = CircuitBreaker::new("p", config(0));
        for _ in 0..5 {
            breaker.record_failure(&upstream_error());
        }
        assert!(breaker.permit_call()); // 1
        assert!(breaker.permit_call()); // 2
        assert!(breaker.permit_call()); // 3 = half_open_permits
        assert!(!breaker.permit_call());
    }

    #[test]
    fn failure_rate_below_threshold_stays_closed() {
        let mut cfg = config(60);
        cfg.failure_threshold = 2;
        cfg.sliding_window_size = 10;
        cfg.failure_rate_threshold = 0.9;
        let breaker = CircuitBreaker::new("p", cfg);
        for _ in 0..7 {
            breaker.record_success();
        }
        for _ in 0..3 {
            breaker.record_failure(&upstream_error());
        }
        // 3 failures >= threshold but rate 0.3 < 0.9
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn predicate_filters_client_errors() {
        let breaker = CircuitBreaker::new("p", config(60));
        for _ in 0..10 {
            breaker.record_failure(&GatewayError::invalid_request("bad"));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[test]
    fn reset_returns_to_closed_and_permits() {
        let breaker = CircuitBreaker::new("p", config(60));
        breaker.trip_open();
        assert!(!breaker.permit_call());
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.permit_call());
    }

    #[test]
    fn double_trip_is_idempotent() {
        let breaker = CircuitBreaker::new("p", config(60));
        breaker.trip_open();
        let first = breaker.snapshot().state_changed_at;
        breaker.trip_open();
        assert_eq!(breaker.snapshot().state_changed_at, first);
    }

    #[test]
    fn registry_returns_same_instance() {
        let registry = BreakerRegistry::new(config(60));
        let a = registry.get("openai");
        let b = registry.get("openai");
        a.trip_open();
        assert!(b.is_open());
        assert!(registry.is_open("openai"));
        assert!(!registry.is_open("anthropic"));
    }
}
