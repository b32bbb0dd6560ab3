use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use manifold_config::SessionConfig;
use manifold_core::{GatewayError, Result, TenantId};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

/// Opaque backend execution context (a KV cache for local backends, a
/// connection slot for remote ones).
#[async_trait]
pub trait SessionHandle: Send {
    /// Whether the backend context is still usable.
    fn is_healthy(&self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

/// Mints backend handles for a pool.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, model_id: &str, tenant: &TenantId) -> Result<Box<dyn SessionHandle>>;
}

/// Inert handle for providers without per-session backend state; the pool
/// still bounds per-(model, tenant) concurrency.
pub struct SlotHandle;

#[async_trait]
impl SessionHandle for SlotHandle {}

pub struct SlotSessionFactory;

#[async_trait]
impl SessionFactory for SlotSessionFactory {
    async fn create(&self, _model_id: &str, _tenant: &TenantId) -> Result<Box<dyn SessionHandle>> {
        Ok(Box::new(SlotHandle))
    }
}

/// A checked-out-or-idle session. Owned exclusively by either the pool
/// (available) or one caller (checked out), never both.
pub struct PooledSession {
    pub session_id: Uuid,
    pub model_id: String,
    pub tenant_id: TenantId,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub use_count: u64,
    poisoned: bool,
    handle: Box<dyn SessionHandle>,
}

impl PooledSession {
    fn new(model_id: String, tenant_id: TenantId, handle: Box<dyn SessionHandle>) -> Self {
        let now = Instant::now();
        Self {
            session_id: Uuid::new_v4(),
            model_id,
            tenant_id,
            created_at: now,
            last_used_at: now,
            use_count: 0,
            poisoned: false,
            handle,
        }
    }

    /// Mark the backend context unusable (e.g. after an out-of-memory
    /// failure mid-inference); the pool closes it instead of re-queuing.
    pub fn mark_unhealthy(&mut self) {
        self.poisoned = true;
    }

    async fn close(mut self) {
        self.handle.close().await;
    }
}

struct PoolState {
    available: VecDeque<PooledSession>,
    /// available + checked out; never exceeds `max_concurrent`.
    total: usize,
    shutdown: bool,
}

/// Bounded pool of reusable sessions for one (model, tenant) pair.
///
/// `acquire` prefers an idle session, constructs a new one below the cap,
/// and otherwise blocks (with timeout) for a release. Stale sessions are
/// closed on the way out of the queue and by the periodic cleanup.
pub struct SessionPool {
    model_id: String,
    tenant_id: TenantId,
    config: SessionConfig,
    factory: Arc<dyn SessionFactory>,
    state: Mutex<PoolState>,
    released: Notify,
}

impl SessionPool {
    pub fn new(
        model_id: impl Into<String>,
        tenant_id: TenantId,
        config: SessionConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            tenant_id,
            config,
            factory,
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                total: 0,
                shutdown: false,
            }),
            released: Notify::new(),
        }
    }

    fn should_close(&self, session: &PooledSession) -> bool {
        session.poisoned
            || session.last_used_at.elapsed() > self.config.max_idle()
            || session.created_at.elapsed() > self.config.max_age()
            || !session.handle.is_healthy()
    }

    /// Acquire a session, waiting up to `timeout` for capacity. `Ok(None)`
    /// means the pool stayed full for the whole timeout.
    pub async fn acquire(&self, timeout: Duration) -> Result<Option<PooledSession>> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut stale = Vec::new();
            let mut acquired = None;
            let mut construct = false;
            {
                let mut state = self.state.lock().await;
                if state.shutdown {
                    return Err(GatewayError::internal("session pool is shut down"));
                }
                while let Some(session) = state.available.pop_front() {
                    if self.should_close(&session) {
                        state.total -= 1;
                        stale.push(session);
                    } else {
                        acquired = Some(session);
                        break;
                    }
                }
                if acquired.is_none() && state.total < self.config.max_concurrent {
                    // reserve the slot before constructing outside the lock
                    state.total += 1;
                    construct = true;
                }
            }

            for session in stale {
                session.close().await;
                self.released.notify_one();
            }

            if let Some(mut session) = acquired {
                session.use_count += 1;
                session.last_used_at = Instant::now();
                return Ok(Some(session));
            }

            if construct {
                match self.factory.create(&self.model_id, &self.tenant_id).await {
                    Ok(handle) => {
                        let mut session = PooledSession::new(
                            self.model_id.clone(),
                            self.tenant_id.clone(),
                            handle,
                        );
                        session.use_count = 1;
                        return Ok(Some(session));
                    }
                    Err(e) => {
                        self.state.lock().await.total -= 1;
                        self.released.notify_one();
                        return Err(e);
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, self.released.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    /// Return a session. Stale or unhealthy sessions (and any release after
    /// shutdown or with reuse disabled) are closed instead of re-queued.
    pub async fn release(&self, mut session: PooledSession) {
        let mut to_close = None;
        {
            let mut state = self.state.lock().await;
            if state.shutdown || !self.config.reuse_enabled || self.should_close(&session) {
                state.total -= 1;
                to_close = Some(session);
            } else {
                session.last_used_at = Instant::now();
                state.available.push_back(session);
            }
        }
        if let Some(session) = to_close {
            session.close().await;
        }
        self.released.notify_one();
    }

    /// Close idle sessions past their idle or age limit. Called periodically.
    pub async fn cleanup(&self) {
        let stale = {
            let mut state = self.state.lock().await;
            let mut keep = VecDeque::new();
            let mut stale = Vec::new();
            while let Some(session) = state.available.pop_front() {
                if self.should_close(&session) {
                    state.total -= 1;
                    stale.push(session);
                } else {
                    keep.push_back(session);
                }
            }
            state.available = keep;
            stale
        };
        if !stale.is_empty() {
            debug!(
                model = %self.model_id,
                tenant = %self.tenant_id,
                closed = stale.len(),
                "session cleanup"
            );
        }
        for session in stale {
            session.close().await;
            self.released.notify_one();
        }
    }

    /// Pre-create idle sessions up to the warm pool size. Failures are
    /// logged, not fatal.
    pub async fn warm(&self) {
        let target = self.config.warm_pool_size.min(self.config.max_concurrent);
        loop {
            {
                let mut state = self.state.lock().await;
                if state.shutdown || state.total >= target {
                    return;
                }
                state.total += 1;
            }
            match self.factory.create(&self.model_id, &self.tenant_id).await {
                Ok(handle) => {
                    let session = PooledSession::new(
                        self.model_id.clone(),
                        self.tenant_id.clone(),
                        handle,
                    );
                    self.state.lock().await.available.push_back(session);
                }
                Err(e) => {
                    self.state.lock().await.total -= 1;
                    warn!(model = %self.model_id, error = %e, "session warm-up failed");
                    return;
                }
            }
        }
    }

    /// Close all idle sessions and refuse further acquires. Idempotent;
    /// checked-out sessions are closed as they are released.
    pub async fn shutdown(&self) {
        let drained = {
            let mut state = self.state.lock().await;
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.total -= state.available.len();
            std::mem::take(&mut state.available)
        };
        for session in drained {
            session.close().await;
        }
        self.released.notify_waiters();
    }

    /// (available, total) — for observability and the pool invariant.
    pub async fn counts(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.available.len(), state.total)
    }
}

/// One pool per (model, tenant), shared by every runner serving that pair.
pub struct SessionPools {
    pools: DashMap<(String, TenantId), Arc<SessionPool>>,
    config: SessionConfig,
    factory: Arc<dyn SessionFactory>,
}

impl SessionPools {
    pub fn new(config: SessionConfig, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            pools: DashMap::new(),
            config,
            factory,
        }
    }

    pub fn get_or_create(&self, model_id: &str, tenant: &TenantId) -> Arc<SessionPool> {
        self.pools
            .entry((model_id.to_string(), tenant.clone()))
            .or_insert_with(|| {
                Arc::new(SessionPool::new(
                    model_id,
                    tenant.clone(),
                    self.config.clone(),
                    Arc::clone(&self.factory),
                ))
            })
            .clone()
    }

    pub async fn cleanup_all(&self) {
        let pools: Vec<Arc<SessionPool>> = self.pools.iter().map(|p| Arc::clone(&p)).collect();
        for pool in pools {
            pool.cleanup().await;
        }
    }

    pub async fn shutdown_all(&self) {
        let pools: Vec<Arc<SessionPool>> = self.pools.iter().map(|p| Arc::clone(&p)).collect();
        for pool in pools {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct TrackingHandle {
        closes: Arc<AtomicU32>,
        healthy: bool,
    }

    #[async_trait]
    impl SessionHandle for TrackingHandle {
        fn is_healthy(&self) -> bool {
            self.healthy
        }
        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::AcqRel);
        }
    }

    struct TrackingFactory {
        closes: Arc<AtomicU32>,
        creates: Arc<AtomicU32>,
        healthy: bool,
    }

    impl TrackingFactory {
        fn new() -> Self {
            Self {
                closes: Arc::new(AtomicU32::new(0)),
                creates: Arc::new(AtomicU32::new(0)),
                healthy: true,
            }
        }
    }

    #[async_trait]
    impl SessionFactory for TrackingFactory {
        async fn create(
            &self,
            _model_id: &str,
            _tenant: &TenantId,
        ) -> Result<Box<dyn SessionHandle>> {
            self.creates.fetch_add(1, Ordering::AcqRel);
            Ok(Box::new(TrackingHandle {
                closes: Arc::clone(&self.closes),
                healthy: self.healthy,
            }))
        }
    }

    fn config(max_concurrent: usize) -> SessionConfig {
        SessionConfig {
            max_concurrent,
            ..Default::default()
        }
    }

    fn pool_with(config: SessionConfig) -> (SessionPool, Arc<AtomicU32>, Arc<AtomicU32>) {
        let factory = TrackingFactory::new();
        let closes = Arc::clone(&factory.closes);
        let creates = Arc::clone(&factory.creates);
        let pool = SessionPool::new(
            "m",
            TenantId::community(),
            config,
            Arc::new(factory),
        );
        (pool, closes, creates)
    }

    #[tokio::test]
    async fn acquire_constructs_then_reuses() {
        let (pool, _closes, creates) = pool_with(config(2));
        let s1 = pool.acquire(Duration::ZERO).await.unwrap().unwrap();
        let id = s1.session_id;
        assert_eq!(s1.use_count, 1);
        pool.release(s1).await;
        let s2 = pool.acquire(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(s2.session_id, id);
        assert_eq!(s2.use_count, 2);
        assert_eq!(creates.load(Ordering::Acquire), 1);
        pool.release(s2).await;
    }

    #[tokio::test]
    async fn full_pool_with_zero_timeout_returns_empty() {
        let (pool, _closes, _creates) = pool_with(config(1));
        let held = pool.acquire(Duration::ZERO).await.unwrap().unwrap();
        let second = pool.acquire(Duration::ZERO).await.unwrap();
        assert!(second.is_none());
        pool.release(held).await;
    }

    #[tokio::test]
    async fn release_wakes_waiter() {
        let (pool, _closes, _creates) = pool_with(config(1));
        let pool = Arc::new(pool);
        let held = pool.acquire(Duration::ZERO).await.unwrap().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        pool.release(held).await;
        let acquired = waiter.await.unwrap().unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test]
    async fn pool_invariant_holds() {
        let (pool, _closes, _creates) = pool_with(config(3));
        let a = pool.acquire(Duration::ZERO).await.unwrap().unwrap();
        let b = pool.acquire(Duration::ZERO).await.unwrap().unwrap();
        let (available, total) = pool.counts().await;
        assert_eq!(available, 0);
        assert_eq!(total, 2);
        pool.release(a).await;
        let (available, total) = pool.counts().await;
        // 1 available + 1 checked out = 2 total
        assert_eq!(available, 1);
        assert_eq!(total, 2);
        pool.release(b).await;
        let (available, total) = pool.counts().await;
        assert_eq!(available, 2);
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn expired_sessions_close_instead_of_requeue() {
        let cfg = SessionConfig {
            max_concurrent: 2,
            max_age_secs: 0,
            ..Default::default()
        };
        let (pool, closes, _creates) = pool_with(cfg);
        let s = pool.acquire(Duration::ZERO).await.unwrap().unwrap();
        pool.release(s).await;
        assert_eq!(closes.load(Ordering::Acquire), 1);
        let (available, total) = pool.counts().await;
        assert_eq!((available, total), (0, 0));
    }

    #[tokio::test]
    async fn reuse_disabled_always_closes() {
        let cfg = SessionConfig {
            max_concurrent: 2,
            reuse_enabled: false,
            ..Default::default()
        };
        let (pool, closes, creates) = pool_with(cfg);
        let s = pool.acquire(Duration::ZERO).await.unwrap().unwrap();
        pool.release(s).await;
        let s = pool.acquire(Duration::ZERO).await.unwrap().unwrap();
        pool.release(s).await;
        assert_eq!(creates.load(Ordering::Acquire), 2);
        assert_eq!(closes.load(Ordering::Acquire), 2);
    }

    #[tokio::test]
    async fn unhealthy_sessions_are_not_reused() {
        let mut factory = TrackingFactory::new();
        factory.healthy = false;
        let closes = Arc::clone(&factory.closes);
        let pool = SessionPool::new("m", TenantId::community(), config(2), Arc::new(factory));
        let s = pool.acquire(Duration::ZERO).await.unwrap().unwrap();
        pool.release(s).await;
        assert_eq!(closes.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn warm_fills_pool() {
        let cfg = SessionConfig {
            max_concurrent: 4,
            warm_pool_size: 2,
            ..Default::default()
        };
        let (pool, _closes, creates) = pool_with(cfg);
        pool.warm().await;
        assert_eq!(creates.load(Ordering::Acquire), 2);
        let (available, total) = pool.counts().await;
        assert_eq!((available, total), (2, 2));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_closes_idle() {
        let (pool, closes, _creates) = pool_with(config(2));
        let s = pool.acquire(Duration::ZERO).await.unwrap().unwrap();
        let idle = pool.acquire(Duration::ZERO).await.unwrap().unwrap();
        pool.release(idle).await;

        pool.shutdown().await;
        pool.shutdown().await;
        assert_eq!(closes.load(Ordering::Acquire), 1);
        // checked-out session closes on release
        pool.release(s).await;
        assert_eq!(closes.load(Ordering::Acquire), 2);
        assert!(pool.acquire(Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn cleanup_closes_stale_idle_sessions() {
        let cfg = SessionConfig {
            max_concurrent: 2,
            max_idle_secs: 0,
            ..Default::default()
        };
        let (pool, closes, _creates) = pool_with(cfg);
        let s = pool.acquire(Duration::ZERO).await.unwrap().unwrap();
        // bypass should_close-on-release by marking it freshly used
        {
            // release() would already close it with max_idle 0; exercise the
            // cleanup path directly instead
            let mut state = pool.state.lock().await;
            state.available.push_back(s);
        }
        pool.cleanup().await;
        assert_eq!(closes.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn pools_registry_shares_instances() {
        let pools = SessionPools::new(config(2), Arc::new(SlotSessionFactory));
        let tenant = TenantId::community();
        let a = pools.get_or_create("m", &tenant);
        let b = pools.get_or_create("m", &tenant);
        assert!(Arc::ptr_eq(&a, &b));
        let c = pools.get_or_create("other", &tenant);
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
