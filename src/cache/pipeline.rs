//! Revalidation controller.
//!
//! One [`Pipeline`] per published resource.  `serve` decides whether a
//! client request can be answered from the cached artifact, needs an upstream
//! revalidation, or needs a full refetch + refilter.  All upstream traffic
//! for a pipeline happens inside its exclusive section, so concurrent
//! requests that find the cache stale produce a single upstream fetch and
//! share its result.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::state::{Artifact, RefreshGuard, ResourceCache, Snapshot};
use crate::filter::{ContentFilter, FilterError};
use crate::metrics::{
    FetchLabels, FetchResult, Metrics, PipelineLabel, PipelineLabels, RequestLabels,
    RequestOutcome,
};
use crate::upstream::{Upstream, UpstreamResponse};

// ---------------------------------------------------------------------------
// Kinds and policies
// ---------------------------------------------------------------------------

/// Which resource a pipeline publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Playlist,
    Guide,
}

impl PipelineKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Playlist => "playlist",
            Self::Guide => "guide",
        }
    }

    /// `Content-Type` of the published artifact.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Playlist => "application/vnd.apple.mpegurl",
            Self::Guide => "application/xml",
        }
    }

    /// Body of the 502 returned when no artifact can be produced.
    pub fn unavailable_message(&self) -> &'static str {
        match self {
            Self::Playlist => "Upstream M3U unavailable",
            Self::Guide => "Upstream EPG unavailable",
        }
    }

    fn metric_label(&self) -> PipelineLabel {
        match self {
            Self::Playlist => PipelineLabel::Playlist,
            Self::Guide => PipelineLabel::Guide,
        }
    }
}

/// When a cached artifact may be served without asking upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Revalidate with upstream on every request the client's own ETag
    /// cannot answer.
    Revalidate,
    /// Serve the cached artifact until this long after the last successful
    /// upstream interaction.
    Interval(Duration),
}

// ---------------------------------------------------------------------------
// Outcome / errors
// ---------------------------------------------------------------------------

/// Why a pipeline could not produce an artifact.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream content could not be parsed: {0}")]
    FilterParseFailure(#[from] FilterError),
}

/// Result of [`Pipeline::serve`], handed verbatim to the routing layer.
#[derive(Debug)]
pub enum Outcome {
    /// The client's copy is current.
    NotModified,
    /// Send this artifact.
    Artifact(Arc<Artifact>),
    /// Nothing can be served.
    UpstreamError(RefreshError),
}

impl Outcome {
    fn for_client(artifact: Arc<Artifact>, if_none_match: Option<&str>) -> Self {
        if artifact.matches(if_none_match) {
            Self::NotModified
        } else {
            Self::Artifact(artifact)
        }
    }

    fn metric_label(&self) -> RequestOutcome {
        match self {
            Self::NotModified => RequestOutcome::NotModified,
            Self::Artifact(_) => RequestOutcome::Artifact,
            Self::UpstreamError(_) => RequestOutcome::UpstreamError,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    kind: PipelineKind,
    policy: RefreshPolicy,
    upstream: Arc<dyn Upstream>,
    filter: Arc<dyn ContentFilter>,
    cache: ResourceCache,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(
        kind: PipelineKind,
        policy: RefreshPolicy,
        upstream: Arc<dyn Upstream>,
        filter: Arc<dyn ContentFilter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            kind,
            policy,
            upstream,
            filter,
            cache: ResourceCache::new(),
            metrics,
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    /// Currently published artifact, if any.
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.cache.snapshot()
    }

    /// Answer one client request carrying an optional `If-None-Match`.
    #[instrument(skip(self), fields(pipeline = self.kind.label()))]
    pub async fn serve(&self, if_none_match: Option<&str>) -> Outcome {
        let outcome = self.resolve(if_none_match).await;
        self.metrics
            .requests_total
            .get_or_create(&RequestLabels {
                pipeline: self.kind.metric_label(),
                outcome: outcome.metric_label(),
            })
            .inc();
        outcome
    }

    async fn resolve(&self, if_none_match: Option<&str>) -> Outcome {
        // Optimistic check outside the exclusive section.
        let observed = self.cache.snapshot();
        if let Some(snapshot) = &observed {
            if let Some(Outcome::NotModified) =
                self.from_cache(snapshot, Instant::now(), if_none_match)
            {
                debug!("client copy is current");
                return Outcome::NotModified;
            }
        }

        let mut guard = self.cache.lock().await;
        let now = Instant::now();

        if let Some(snapshot) = guard.snapshot() {
            // Someone else refreshed while we were queued: share their result.
            let generation = observed.as_ref().map(|s| s.generation);
            if generation != Some(snapshot.generation) {
                debug!(generation = snapshot.generation, "joined concurrent refresh");
                return Outcome::for_client(snapshot.artifact, if_none_match);
            }
            if let Some(outcome) = self.from_cache(&snapshot, now, if_none_match) {
                debug!("served from cache");
                return outcome;
            }
        }

        let started = std::time::Instant::now();
        let outcome = self.refresh(&mut guard, now, if_none_match).await;
        self.metrics
            .refresh_duration_seconds
            .get_or_create(&self.pipeline_labels())
            .observe(started.elapsed().as_secs_f64());
        outcome
    }

    /// What the cached artifact alone can answer, without upstream.
    fn from_cache(
        &self,
        snapshot: &Snapshot,
        now: Instant,
        if_none_match: Option<&str>,
    ) -> Option<Outcome> {
        match self.policy {
            RefreshPolicy::Revalidate => snapshot
                .artifact
                .matches(if_none_match)
                .then_some(Outcome::NotModified),
            RefreshPolicy::Interval(interval) => {
                let age = now.saturating_duration_since(snapshot.refreshed_at);
                (age < interval)
                    .then(|| Outcome::for_client(Arc::clone(&snapshot.artifact), if_none_match))
            }
        }
    }

    /// Conditional fetch, then either reuse, republish or fail.  Runs with
    /// the exclusive section held for its whole duration.
    async fn refresh(
        &self,
        guard: &mut RefreshGuard<'_>,
        now: Instant,
        if_none_match: Option<&str>,
    ) -> Outcome {
        let validator = guard.upstream_etag().map(str::to_owned);
        let mut response = match self.fetch(validator.as_deref()).await {
            Ok(response) => response,
            Err(err) => return Outcome::UpstreamError(err),
        };

        if matches!(response, UpstreamResponse::NotModified) {
            if let Some(snapshot) = guard.revalidated(now) {
                debug!("upstream unchanged");
                return Outcome::for_client(snapshot.artifact, if_none_match);
            }
            warn!("upstream answered 304 with nothing cached; refetching unconditionally");
            response = match self.fetch(None).await {
                Ok(response) => response,
                Err(err) => return Outcome::UpstreamError(err),
            };
        }

        match response {
            UpstreamResponse::Fresh { etag, body } => {
                self.republish(guard, etag, body, now, if_none_match)
            }
            UpstreamResponse::NotModified => Outcome::UpstreamError(
                RefreshError::UpstreamUnavailable(
                    "upstream answered 304 to an unconditional request".to_string(),
                ),
            ),
            UpstreamResponse::Failed(status) => Outcome::UpstreamError(
                RefreshError::UpstreamUnavailable(format!("upstream returned {status}")),
            ),
        }
    }

    fn republish(
        &self,
        guard: &mut RefreshGuard<'_>,
        upstream_etag: Option<String>,
        body: Bytes,
        now: Instant,
        if_none_match: Option<&str>,
    ) -> Outcome {
        match self.filter.apply(&body) {
            Ok(filtered) => {
                let artifact = guard.publish(filtered, upstream_etag, now);
                info!(
                    etag = artifact.etag(),
                    upstream_etag = guard.upstream_etag(),
                    raw_bytes = body.len(),
                    bytes = artifact.body().len(),
                    "published refreshed artifact"
                );
                self.metrics
                    .artifact_bytes
                    .get_or_create(&self.pipeline_labels())
                    .set(artifact.body().len() as i64);
                Outcome::for_client(artifact, if_none_match)
            }
            Err(err) => {
                self.metrics
                    .filter_failures_total
                    .get_or_create(&self.pipeline_labels())
                    .inc();
                match guard.snapshot() {
                    Some(snapshot) => {
                        error!(error = %err, "upstream content failed to parse; serving previous artifact");
                        Outcome::for_client(snapshot.artifact, if_none_match)
                    }
                    None => {
                        error!(error = %err, "upstream content failed to parse; nothing to fall back to");
                        Outcome::UpstreamError(RefreshError::FilterParseFailure(err))
                    }
                }
            }
        }
    }

    async fn fetch(&self, validator: Option<&str>) -> Result<UpstreamResponse, RefreshError> {
        let result = self.upstream.fetch(validator).await;
        let label = match &result {
            Ok(UpstreamResponse::Fresh { .. }) => FetchResult::Fresh,
            Ok(UpstreamResponse::NotModified) => FetchResult::NotModified,
            Ok(UpstreamResponse::Failed(status)) => {
                warn!(%status, "upstream returned an error status");
                FetchResult::Status
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "upstream fetch failed");
                FetchResult::Transport
            }
        };
        self.metrics
            .upstream_fetches_total
            .get_or_create(&FetchLabels {
                pipeline: self.kind.metric_label(),
                result: label,
            })
            .inc();
        result.map_err(|err| RefreshError::UpstreamUnavailable(format!("{err:#}")))
    }

    fn pipeline_labels(&self) -> PipelineLabels {
        PipelineLabels {
            pipeline: self.kind.metric_label(),
        }
    }
}
