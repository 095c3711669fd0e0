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

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum PipelineLabel {
    Playlist,
    Guide,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RequestOutcome {
    NotModified,
    Artifact,
    UpstreamError,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum FetchResult {
    Fresh,
    NotModified,
    Status,
    Transport,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PipelineLabels {
    pub pipeline: PipelineLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub pipeline: PipelineLabel,
    pub outcome: RequestOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FetchLabels {
    pub pipeline: PipelineLabel,
    pub result: FetchResult,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    pub requests_total: Family<RequestLabels, Counter>,
    pub upstream_fetches_total: Family<FetchLabels, Counter>,
    pub filter_failures_total: Family<PipelineLabels, Counter>,
    pub refresh_duration_seconds: Family<PipelineLabels, Histogram>,
    pub artifact_bytes: Family<PipelineLabels, Gauge>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "iptv_proxy_requests",
            "Client requests by pipeline and outcome",
            requests_total.clone(),
        );

        let upstream_fetches_total = Family::<FetchLabels, Counter>::default();
        registry.register(
            "iptv_proxy_upstream_fetches",
            "Upstream fetches by pipeline and result",
            upstream_fetches_total.clone(),
        );

        let filter_failures_total = Family::<PipelineLabels, Counter>::default();
        registry.register(
            "iptv_proxy_filter_failures",
            "Upstream bodies the content filter rejected",
            filter_failures_total.clone(),
        );

        let refresh_duration_seconds =
            Family::<PipelineLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 14))
            });
        registry.register(
            "iptv_proxy_refresh_duration_seconds",
            "Upstream fetch plus filter latency in seconds",
            refresh_duration_seconds.clone(),
        );

        let artifact_bytes = Family::<PipelineLabels, Gauge>::default();
        registry.register(
            "iptv_proxy_artifact_bytes",
            "Size of the currently published artifact in bytes",
            artifact_bytes.clone(),
        );

        Self {
            requests_total,
            upstream_fetches_total,
            filter_failures_total,
            refresh_duration_seconds,
            artifact_bytes,
        }
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

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
