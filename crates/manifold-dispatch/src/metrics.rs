use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use manifold_core::ProviderHealth;
use parking_lot::Mutex;

/// Latency samples kept per provider (and per provider+model) for the p95
/// estimate.
const LATENCY_RING_SIZE: usize = 256;

/// Read-side view the selection policy scores against. Implemented by
/// [`MetricsSink`]; small on purpose so the router → metrics → policy edges
/// stay acyclic.
pub trait MetricsView: Send + Sync {
    /// Active requests over soft capacity, clamped to [0, 1].
    fn current_load(&self, provider_id: &str) -> f64;

    fn p95_latency(&self, provider_id: &str, model_id: Option<&str>) -> Option<Duration>;

    /// Whether the last health probe reported UP.
    fn is_healthy(&self, provider_id: &str) -> bool;
}

#[derive(Debug)]
struct ProviderStats {
    active: AtomicU64,
    requests_total: AtomicU64,
    failures_total: AtomicU64,
    input_tokens_total: AtomicU64,
    output_tokens_total: AtomicU64,
    /// Estimated cost in micro-dollars (USD * 1_000_000).
    cost_microdollars_total: AtomicU64,
    soft_capacity: AtomicU64,
    latencies_ms: Mutex<VecDeque<u64>>,
    model_latencies_ms: DashMap<String, VecDeque<u64>>,
    health: Mutex<ProviderHealth>,
}

impl ProviderStats {
    fn new(soft_capacity: u64) -> Self {
        Self {
            active: AtomicU64::new(0),
            requests_total: AtomicU64::new(0),
            failures_total: AtomicU64::new(0),
            input_tokens_total: AtomicU64::new(0),
            output_tokens_total: AtomicU64::new(0),
            cost_microdollars_total: AtomicU64::new(0),
            soft_capacity: AtomicU64::new(soft_capacity),
            latencies_ms: Mutex::new(VecDeque::new()),
            model_latencies_ms: DashMap::new(),
            health: Mutex::new(ProviderHealth::unknown()),
        }
    }
}

/// In-process per-provider counters, latency histograms, and health cache.
/// Updated by the router on every outcome; read by the selection policy.
pub struct MetricsSink {
    providers: DashMap<String, Arc<ProviderStats>>,
    default_soft_capacity: u64,
}

impl MetricsSink {
    pub fn new(default_soft_capacity: u64) -> Self {
        Self {
            providers: DashMap::new(),
            default_soft_capacity: default_soft_capacity.max(1),
        }
    }

    fn stats(&self, provider_id: &str) -> Arc<ProviderStats> {
        self.providers
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(ProviderStats::new(self.default_soft_capacity)))
            .clone()
    }

    pub fn set_soft_capacity(&self, provider_id: &str, capacity: u64) {
        self.stats(provider_id)
            .soft_capacity
            .store(capacity.max(1), Ordering::Relaxed);
    }

    pub fn request_started(&self, provider_id: &str) {
        let stats = self.stats(provider_id);
        stats.active.fetch_add(1, Ordering::Relaxed);
        stats.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(&self, provider_id: &str) {
        let stats = self.stats(provider_id);
        let _ = stats
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn record_success(
        &self,
        provider_id: &str,
        model_id: &str,
        latency: Duration,
        input_tokens: u32,
        output_tokens: u32,
        cost_usd: f64,
    ) {
        let stats = self.stats(provider_id);
        stats
            .input_tokens_total
            .fetch_add(input_tokens as u64, Ordering::Relaxed);
        stats
            .output_tokens_total
            .fetch_add(output_tokens as u64, Ordering::Relaxed);
        stats
            .cost_microdollars_total
            .fetch_add((cost_usd * 1_000_000.0) as u64, Ordering::Relaxed);

        let latency_ms = latency.as_millis() as u64;
        {
            let mut ring = stats.latencies_ms.lock();
            push_sample(&mut ring, latency_ms);
        }
        let mut model_ring = stats
            .model_latencies_ms
            .entry(model_id.to_string())
            .or_default();
        push_sample(&mut model_ring, latency_ms);
    }

    pub fn record_failure(&self, provider_id: &str) {
        self.stats(provider_id)
            .failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_health(&self, provider_id: &str, health: ProviderHealth) {
        *self.stats(provider_id).health.lock() = health;
    }

    pub fn health(&self, provider_id: &str) -> ProviderHealth {
        self.providers
            .get(provider_id)
            .map(|s| s.health.lock().clone())
            .unwrap_or_else(ProviderHealth::unknown)
    }

    /// Render the counters in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::from(
            "# HELP manifold_requests_total Total requests dispatched per provider.\n\
             # TYPE manifold_requests_total counter\n",
        );
        let mut providers: Vec<_> = self
            .providers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        providers.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, stats) in &providers {
            out.push_str(&format!(
                "manifold_requests_total{{provider=\"{id}\"}} {}\n",
                stats.requests_total.load(Ordering::Relaxed)
            ));
        }
        out.push_str(
            "# HELP manifold_failures_total Total failed attempts per provider.\n\
             # TYPE manifold_failures_total counter\n",
        );
        for (id, stats) in &providers {
            out.push_str(&format!(
                "manifold_failures_total{{provider=\"{id}\"}} {}\n",
                stats.failures_total.load(Ordering::Relaxed)
            ));
        }
        out.push_str(
            "# HELP manifold_active_requests In-flight requests per provider.\n\
             # TYPE manifold_active_requests gauge\n",
        );
        for (id, stats) in &providers {
            out.push_str(&format!(
                "manifold_active_requests{{provider=\"{id}\"}} {}\n",
                stats.active.load(Ordering::Relaxed)
            ));
        }
        out.push_str(
            "# HELP manifold_tokens_total Tokens processed per provider and direction.\n\
             # TYPE manifold_tokens_total counter\n",
        );
        for (id, stats) in &providers {
            out.push_str(&format!(
                "manifold_tokens_total{{provider=\"{id}\",direction=\"input\"}} {}\n",
                stats.input_tokens_total.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "manifold_tokens_total{{provider=\"{id}\",direction=\"output\"}} {}\n",
                stats.output_tokens_total.load(Ordering::Relaxed)
            ));
        }
        out.push_str(
            "# HELP manifold_cost_usd_total Estimated spend per provider in USD.\n\
             # TYPE manifold_cost_usd_total counter\n",
        );
        for (id, stats) in &providers {
            out.push_str(&format!(
                "manifold_cost_usd_total{{provider=\"{id}\"}} {:.6}\n",
                stats.cost_microdollars_total.load(Ordering::Relaxed) as f64 / 1_000_000.0
            ));
        }
        out
    }
}

impl MetricsView for MetricsSink {
    fn current_load(&self, provider_id: &str) -> f64 {
        let Some(stats) = self.providers.get(provider_id) else {
            return 0.0;
        };
        let active = stats.active.load(Ordering::Relaxed) as f64;
        let capacity = stats.soft_capacity.load(Ordering::Relaxed).max(1) as f64;
        (active / capacity).clamp(0.0, 1.0)
    }

    fn p95_latency(&self, provider_id: &str, model_id: Option<&str>) -> Option<Duration> {
        let stats = self.providers.get(provider_id)?;
        let p95_ms = match model_id {
            Some(model) => percentile(&*stats.model_latencies_ms.get(model)?, 0.95)?,
            None => percentile(&stats.latencies_ms.lock(), 0.95)?,
        };
        Some(Duration::from_millis(p95_ms))
    }

    fn is_healthy(&self, provider_id: &str) -> bool {
        self.providers
            .get(provider_id)
            .map(|s| s.health.lock().is_up())
            .unwrap_or(false)
    }
}

fn push_sample(ring: &mut VecDeque<u64>, sample: u64) {
    ring.push_back(sample);
    while ring.len() > LATENCY_RING_SIZE {
        ring.pop_front();
    }
}

fn percentile(ring: &VecDeque<u64>, q: f64) -> Option<u64> {
    if ring.is_empty() {
        return None;
    }
    let mut sorted: Vec<u64> = ring.iter().copied().collect();
    sorted.sort_unstable();
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_tracks_active_over_capacity() {
        let sink = MetricsSink::new(4);
        assert_eq!(sink.current_load("p"), 0.0);
        sink.request_started("p");
        sink.request_started("p");
        assert!((sink.current_load("p") - 0.5).abs() < f64::EPSILON);
        sink.request_finished("p");
        assert!((sink.current_load("p") - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn finished_without_started_does_not_underflow() {
        let sink = MetricsSink::new(4);
        sink.request_finished("p");
        assert_eq!(sink.current_load("p"), 0.0);
    }

    #[test]
    fn p95_reflects_samples() {
        let sink = MetricsSink::new(4);
        for ms in [10, 20, 30, 40, 50, 60, 70, 80, 90, 1000] {
            sink.record_success("p", "m", Duration::from_millis(ms), 1, 1, 0.0);
        }
        let p95 = sink.p95_latency("p", None).unwrap();
        assert_eq!(p95, Duration::from_millis(1000));
        assert!(sink.p95_latency("p", Some("m")).is_some());
        assert!(sink.p95_latency("p", Some("other")).is_none());
        assert!(sink.p95_latency("absent", None).is_none());
    }

    #[test]
    fn health_defaults_to_not_healthy() {
        let sink = MetricsSink::new(4);
        assert!(!sink.is_healthy("p"));
        sink.set_health("p", ProviderHealth::up());
        assert!(sink.is_healthy("p"));
        sink.set_health("p", ProviderHealth::down("probe failed"));
        assert!(!sink.is_healthy("p"));
    }

    #[test]
    fn prometheus_rendering_includes_counters() {
        let sink = MetricsSink::new(4);
        sink.request_started("openai");
        sink.record_success("openai", "gpt-4o", Duration::from_millis(120), 100, 50, 0.001);
        sink.record_failure("anthropic");
        let text = sink.render_prometheus();
        assert!(text.contains(r#"manifold_requests_total{provider="openai"} 1"#));
        assert!(text.contains(r#"manifold_failures_total{provider="anthropic"} 1"#));
        assert!(text.contains(r#"manifold_tokens_total{provider="openai",direction="input"} 100"#));
    }
}
