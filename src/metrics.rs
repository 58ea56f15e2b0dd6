use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BuildLabels {
    pub outcome: BuildOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum BuildOutcome {
    Ok,
    Timeout,
    Failed,
    Stale,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServiceLabels {
    pub service: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the facade.
pub struct Metrics {
    // -- cache --
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_evictions: Counter,
    pub cache_entries: Gauge,

    // -- factory --
    pub builds: Family<BuildLabels, Counter>,
    pub build_duration_seconds: Histogram,
    pub releases: Counter,
    pub release_failures: Counter,
    pub invalidations: Counter,

    // -- http --
    pub requests: Family<ServiceLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let cache_hits = Counter::default();
        registry.register(
            "packgate_cache_hits",
            "Resource lookups served from the cache",
            cache_hits.clone(),
        );

        let cache_misses = Counter::default();
        registry.register(
            "packgate_cache_misses",
            "Resource lookups not served from the cache",
            cache_misses.clone(),
        );

        let cache_evictions = Counter::default();
        registry.register(
            "packgate_cache_evictions",
            "Least-recently-used entries evicted to make room",
            cache_evictions.clone(),
        );

        let cache_entries: Gauge = Gauge::default();
        registry.register(
            "packgate_cache_entries",
            "Resources currently held in the cache",
            cache_entries.clone(),
        );

        let builds = Family::<BuildLabels, Counter>::default();
        registry.register(
            "packgate_builds",
            "Resource builds by outcome",
            builds.clone(),
        );

        let build_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 16));
        registry.register(
            "packgate_build_duration_seconds",
            "Resource build latency in seconds",
            build_duration_seconds.clone(),
        );

        let releases = Counter::default();
        registry.register(
            "packgate_releases",
            "Resources released after eviction, refresh or shutdown",
            releases.clone(),
        );

        let release_failures = Counter::default();
        registry.register(
            "packgate_release_failures",
            "Resource release hooks that returned an error",
            release_failures.clone(),
        );

        let invalidations = Counter::default();
        registry.register(
            "packgate_invalidations",
            "Cache invalidations triggered by context refresh",
            invalidations.clone(),
        );

        let requests = Family::<ServiceLabels, Counter>::default();
        registry.register(
            "packgate_requests",
            "Smart-HTTP requests by service",
            requests.clone(),
        );

        Self {
            cache_hits,
            cache_misses,
            cache_evictions,
            cache_entries,
            builds,
            build_duration_seconds,
            releases,
            release_failures,
            invalidations,
            requests,
        }
    }

    pub fn record_build(&self, outcome: BuildOutcome) {
        self.builds.get_or_create(&BuildLabels { outcome }).inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all facade metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        let registry = MetricsRegistry::new();
        registry.metrics.cache_hits.inc();
        registry.metrics.record_build(BuildOutcome::Timeout);

        let text = registry.encode().unwrap();
        assert!(text.contains("packgate_cache_hits_total 1"));
        assert!(text.contains("packgate_builds_total{outcome=\"Timeout\"} 1"));
        assert!(text.ends_with("# EOF\n"));
    }
}
