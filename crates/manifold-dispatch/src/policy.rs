use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use manifold_config::StrategyKind;
use manifold_core::{DeviceType, InferenceRequest, ModelManifest};
use rand::RngExt;
use tracing::debug;

use crate::breaker::BreakerRegistry;
use crate::metrics::MetricsView;
use crate::registry::ProviderRegistry;

/// Read-side view of the breaker registry; candidates with an OPEN breaker
/// are excluded after filtering.
pub trait BreakerView: Send + Sync {
    fn is_open(&self, provider_id: &str) -> bool;
}

impl BreakerView for BreakerRegistry {
    fn is_open(&self, provider_id: &str) -> bool {
        BreakerRegistry::is_open(self, provider_id)
    }
}

/// Facts about the host the gateway runs on, consulted by the resource and
/// device filter gates. Injectable so tests control them.
#[derive(Debug, Clone)]
pub struct HostProfile {
    pub total_memory_bytes: u64,
    pub cuda_available: bool,
}

impl HostProfile {
    /// Probe the host. Falls back to "no constraint" when /proc is absent.
    pub fn detect() -> Self {
        Self {
            total_memory_bytes: detect_total_memory().unwrap_or(u64::MAX),
            cuda_available: std::path::Path::new("/dev/nvidia0").exists()
                || std::env::var("CUDA_VISIBLE_DEVICES").is_ok_and(|v| !v.is_empty()),
        }
    }

    pub fn assume(total_memory_bytes: u64, cuda_available: bool) -> Self {
        Self {
            total_memory_bytes,
            cuda_available,
        }
    }
}

fn detect_total_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

// Scoring weights for the SCORED strategy.
const WEIGHT_PREFERRED_PROVIDER: i64 = 100;
const WEIGHT_DEVICE_MATCH: i64 = 50;
const WEIGHT_NATIVE_FORMAT: i64 = 30;
const WEIGHT_FAST_P95: i64 = 25;
const WEIGHT_RESOURCES: i64 = 20;
const WEIGHT_HEALTHY: i64 = 15;
const WEIGHT_COST_CPU: i64 = 10;
const WEIGHT_LOW_LOAD: i64 = 15;
const PENALTY_HIGH_LOAD: i64 = -20;
const PENALTY_SATURATED: i64 = -50;

/// Ranks candidate providers for a request: hard filter gates first, then an
/// ordering per the configured strategy. Deterministic for equal inputs —
/// ties break on provider id.
pub struct SelectionPolicy {
    strategy: StrategyKind,
    /// Provider weights for WEIGHTED_RANDOM.
    weights: HashMap<String, f64>,
    registry: Arc<ProviderRegistry>,
    metrics: Arc<dyn MetricsView>,
    breakers: Arc<dyn BreakerView>,
    host: HostProfile,
    rr_counter: AtomicUsize,
}

impl SelectionPolicy {
    pub fn new(
        strategy: StrategyKind,
        registry: Arc<ProviderRegistry>,
        metrics: Arc<dyn MetricsView>,
        breakers: Arc<dyn BreakerView>,
        host: HostProfile,
    ) -> Self {
        Self {
            strategy,
            weights: HashMap::new(),
            registry,
            metrics,
            breakers,
            host,
            rr_counter: AtomicUsize::new(0),
        }
    }

    pub fn with_weights(mut self, weights: HashMap<String, f64>) -> Self {
        self.weights = weights;
        self
    }

    /// Rank the candidates, highest first. Empty output means no provider
    /// passed the gates.
    pub fn rank(
        &self,
        manifest: &ModelManifest,
        request: &InferenceRequest,
        candidates: &[String],
    ) -> Vec<(String, i64)> {
        let mut seen = HashSet::new();
        let filtered: Vec<String> = candidates
            .iter()
            .filter(|id| seen.insert((*id).clone()))
            .filter(|id| self.passes_gates(manifest, request, id))
            .filter(|id| !self.breakers.is_open(id))
            .cloned()
            .collect();

        if filtered.is_empty() {
            return vec![];
        }

        let ranked = match self.strategy {
            StrategyKind::Scored => self.rank_scored(manifest, request, filtered),
            StrategyKind::RoundRobin => self.rank_round_robin(filtered),
            StrategyKind::WeightedRandom => self.rank_weighted_random(filtered),
            StrategyKind::LeastLoaded => self.rank_least_loaded(filtered),
            StrategyKind::CostOptimized => self.rank_cost(request, filtered),
            StrategyKind::LatencyOptimized => self.rank_latency(request, filtered),
            StrategyKind::UserSelected => self.rank_user_selected(request, filtered),
            StrategyKind::Failover => self.rank_failover(filtered),
        };
        debug!(model = %manifest.model_id, strategy = ?self.strategy, candidates = ranked.len(), "ranked providers");
        ranked
    }

    /// Hard gates: supports, format intersection, device preference, host
    /// memory. A gate with nothing to check passes.
    fn passes_gates(&self, manifest: &ModelManifest, request: &InferenceRequest, id: &str) -> bool {
        if !self.registry.supports(id, &manifest.model_id, request) {
            return false;
        }
        let Some(caps) = self.registry.capabilities(id) else {
            return false;
        };
        // Format gate binds only artifact-backed providers: adapters that
        // declare no formats serve hosted models by name.
        if !manifest.artifacts.is_empty()
            && !caps.supported_formats.is_empty()
            && !manifest
                .artifacts
                .keys()
                .any(|f| caps.supported_formats.contains(f))
        {
            return false;
        }
        if let Some(device) = request.preferred_device {
            if !caps.supported_devices.is_empty() && !caps.supported_devices.contains(&device) {
                return false;
            }
            if device == DeviceType::Cuda && !self.host.cuda_available {
                return false;
            }
        }
        if manifest.resources.min_ram_bytes > self.host.total_memory_bytes {
            return false;
        }
        true
    }

    fn rank_scored(
        &self,
        manifest: &ModelManifest,
        request: &InferenceRequest,
        candidates: Vec<String>,
    ) -> Vec<(String, i64)> {
        let preferred = request.preferred_provider.as_deref();
        let mut scored: Vec<(String, i64)> = candidates
            .into_iter()
            .map(|id| {
                let score = self.score(manifest, request, &id, preferred);
                (id, score)
            })
            .collect();
        // preferred provider outranks everything it survived filtering with;
        // then score, then the deterministic id tie-break
        scored.sort_by(|a, b| {
            let a_pref = preferred == Some(a.0.as_str());
            let b_pref = preferred == Some(b.0.as_str());
            b_pref
                .cmp(&a_pref)
                .then(b.1.cmp(&a.1))
                .then(a.0.cmp(&b.0))
        });
        scored
    }

    fn score(
        &self,
        manifest: &ModelManifest,
        request: &InferenceRequest,
        id: &str,
        preferred: Option<&str>,
    ) -> i64 {
        let caps = self.registry.capabilities(id).unwrap_or_default();
        let mut score = 0i64;

        if preferred == Some(id) {
            score += WEIGHT_PREFERRED_PROVIDER;
        }
        if let Some(device) = request.preferred_device
            && caps.supported_devices.contains(&device)
        {
            score += WEIGHT_DEVICE_MATCH;
        }
        if let Some(format) = manifest.primary_format()
            && caps.supported_formats.contains(&format)
        {
            score += WEIGHT_NATIVE_FORMAT;
        }
        if let (Some(p95), Some(timeout)) = (
            self.metrics.p95_latency(id, Some(&manifest.model_id)),
            request.timeout(),
        ) && p95 < timeout
        {
            score += WEIGHT_FAST_P95;
        }
        if self.host.total_memory_bytes >= manifest.resources.min_ram_bytes {
            score += WEIGHT_RESOURCES;
        }
        if self.metrics.is_healthy(id) {
            score += WEIGHT_HEALTHY;
        }
        if request.cost_sensitive && caps.supported_devices.contains(&DeviceType::Cpu) {
            score += WEIGHT_COST_CPU;
        }
        let load = self.metrics.current_load(id);
        if load < 0.7 {
            score += WEIGHT_LOW_LOAD;
        } else if load >= 0.95 {
            score += PENALTY_SATURATED;
        } else if load >= 0.8 {
            score += PENALTY_HIGH_LOAD;
        }
        score
    }

    fn rank_round_robin(&self, candidates: Vec<String>) -> Vec<(String, i64)> {
        let mut candidates = candidates;
        candidates.sort();
        let len = candidates.len();
        let start = self.rr_counter.fetch_add(1, Ordering::Relaxed) % len;
        candidates.rotate_left(start);
        candidates.into_iter().map(|id| (id, 0)).collect()
    }

    fn rank_weighted_random(&self, candidates: Vec<String>) -> Vec<(String, i64)> {
        let mut remaining: Vec<String> = candidates;
        remaining.sort();
        let mut rng = rand::rng();
        let mut ordered = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let total: f64 = remaining
                .iter()
                .map(|id| self.weights.get(id).copied().unwrap_or(1.0).max(0.0))
                .sum();
            let pick = if total <= 0.0 {
                0
            } else {
                let mut roll = rng.random_range(0.0..total);
                let mut chosen = remaining.len() - 1;
                for (i, id) in remaining.iter().enumerate() {
                    let w = self.weights.get(id).copied().unwrap_or(1.0).max(0.0);
                    if roll < w {
                        chosen = i;
                        break;
                    }
                    roll -= w;
                }
                chosen
            };
            ordered.push((remaining.remove(pick), 0));
        }
        ordered
    }

    fn rank_least_loaded(&self, candidates: Vec<String>) -> Vec<(String, i64)> {
        let mut scored: Vec<(String, i64)> = candidates
            .into_iter()
            .map(|id| {
                let load = self.metrics.current_load(&id);
                let score = ((1.0 - load) * 100.0) as i64;
                (id, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        scored
    }

    fn rank_cost(&self, request: &InferenceRequest, candidates: Vec<String>) -> Vec<(String, i64)> {
        let mut scored: Vec<(String, i64)> = candidates
            .into_iter()
            .map(|id| {
                let (input_rate, output_rate) =
                    manifold_providers::cost_per_mtok(&id, &request.model);
                // cheaper = higher score; rates are dollars per Mtok
                let score = -((input_rate + output_rate) * 100.0) as i64;
                (id, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        scored
    }

    fn rank_latency(
        &self,
        request: &InferenceRequest,
        candidates: Vec<String>,
    ) -> Vec<(String, i64)> {
        let mut scored: Vec<(String, i64)> = candidates
            .into_iter()
            .map(|id| {
                let score = match self.metrics.p95_latency(&id, Some(&request.model)) {
                    Some(p95) => -(p95.as_millis() as i64),
                    // unmeasured providers rank behind measured ones
                    None => i64::MIN / 2,
                };
                (id, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        scored
    }

    fn rank_user_selected(
        &self,
        request: &InferenceRequest,
        candidates: Vec<String>,
    ) -> Vec<(String, i64)> {
        let Some(preferred) = request.preferred_provider.as_deref() else {
            return vec![];
        };
        candidates
            .into_iter()
            .filter(|id| id == preferred)
            .map(|id| (id, WEIGHT_PREFERRED_PROVIDER))
            .collect()
    }

    /// Configured order: primary first, fallbacks after, as the candidate
    /// list (pool order) dictates.
    fn rank_failover(&self, candidates: Vec<String>) -> Vec<(String, i64)> {
        let len = candidates.len() as i64;
        candidates
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, len - i as i64))
            .collect()
    }
}
