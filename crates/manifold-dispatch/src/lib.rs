//! # manifold-dispatch
//!
//! The core dispatch plane of the Manifold gateway: candidate selection and
//! scoring, per-provider circuit breaking, per-tenant quotas, the runner warm
//! pool, session pooling, the failover router, the stream driver, async jobs,
//! and the metrics sink — wired together by [`gateway::Gateway`].

pub mod auth;
pub mod breaker;
pub mod factory;
pub mod gateway;
pub mod jobs;
pub mod manifests;
pub mod metrics;
pub mod policy;
pub mod quota;
pub mod registry;
pub mod router;
pub mod session;
pub mod stream;

pub use auth::{StaticTenantResolver, TenantResolver};
pub use breaker::{BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use factory::{Runner, RunnerFactory};
pub use gateway::{init_tracing, Gateway, GatewayBuilder};
pub use jobs::{AsyncJob, AsyncJobManager, JobExecutor, JobStatus};
pub use manifests::{InMemoryManifestStore, ManifestStore};
pub use metrics::{MetricsSink, MetricsView};
pub use policy::{BreakerView, HostProfile, SelectionPolicy};
pub use quota::{InMemoryQuota, QuotaEnforcer, ResourceKind};
pub use registry::ProviderRegistry;
pub use router::Router;
pub use session::{
    PooledSession, SessionFactory, SessionHandle, SessionPool, SessionPools, SlotSessionFactory,
};
pub use stream::{BackpressurePolicy, ChunkStream, StreamConfig, StreamOutcome};
