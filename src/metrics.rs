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
pub struct RequestLabels {
    pub cache_status: CacheStatus,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheStatus {
    /// Served from cache within the unconditional window.
    Hit,
    /// Upstream confirmed the cached copy unchanged (304).
    Revalidated,
    /// Fetched from upstream (cold miss or changed object).
    Miss,
    /// Upstream failed; the stale copy was served anyway.
    Degraded,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpstreamLabels {
    pub method: UpstreamMethod,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum UpstreamMethod {
    Head,
    Get,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    pub requests: Family<RequestLabels, Counter>,
    pub request_duration_seconds: Histogram,
    pub upstream_requests: Family<UpstreamLabels, Counter>,
    pub cache_used_bytes: Gauge,
    pub cache_objects: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests = Family::<RequestLabels, Counter>::default();
        registry.register(
            "cachistry_requests",
            "Proxy requests by cache status",
            requests.clone(),
        );

        let request_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 16));
        registry.register(
            "cachistry_request_duration_seconds",
            "Proxy request latency in seconds",
            request_duration_seconds.clone(),
        );

        let upstream_requests = Family::<UpstreamLabels, Counter>::default();
        registry.register(
            "cachistry_upstream_requests",
            "Requests issued against upstream registries by method",
            upstream_requests.clone(),
        );

        let cache_used_bytes: Gauge = Gauge::default();
        registry.register(
            "cachistry_cache_used_bytes",
            "Bytes currently accounted against the cache quota",
            cache_used_bytes.clone(),
        );

        let cache_objects: Gauge = Gauge::default();
        registry.register(
            "cachistry_cache_objects",
            "Number of objects currently in the cache",
            cache_objects.clone(),
        );

        Self {
            requests,
            request_duration_seconds,
            upstream_requests,
            cache_used_bytes,
            cache_objects,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
