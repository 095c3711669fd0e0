//! Per-pipeline resource cache.
//!
//! Two pieces of state live here:
//!
//! * the published [`Snapshot`] (filtered artifact + its ETag + the time of
//!   the last successful upstream interaction), swapped as one value so a
//!   reader can never see a body paired with another generation's ETag;
//! * the upstream validator used for conditional fetches, which is only
//!   reachable through the exclusive [`RefreshGuard`].
//!
//! The published snapshot may be read at any time through
//! [`ResourceCache::snapshot`] without entering the exclusive section; it is
//! only ever replaced while a [`RefreshGuard`] is held.

use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use super::fingerprint::etag_for;

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// A filtered document ready to be served, with its content-derived ETag.
#[derive(Debug, PartialEq, Eq)]
pub struct Artifact {
    body: Bytes,
    etag: String,
}

impl Artifact {
    pub fn new(body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let etag = etag_for(&body);
        Self { body, etag }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    /// Whether a client's `If-None-Match` value names this exact artifact.
    pub fn matches(&self, if_none_match: Option<&str>) -> bool {
        if_none_match == Some(self.etag.as_str())
    }
}

/// The currently published artifact and when upstream last vouched for it.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub artifact: Arc<Artifact>,
    pub refreshed_at: Instant,
    /// Bumped on every publish or revalidation.
    pub generation: u64,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct UpstreamValidator {
    etag: Option<String>,
}

/// State for one pipeline, created empty at startup and kept for the life
/// of the process.
#[derive(Debug, Default)]
pub struct ResourceCache {
    published: RwLock<Option<Snapshot>>,
    section: Mutex<UpstreamValidator>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the published snapshot without entering the exclusive section.
    pub fn snapshot(&self) -> Option<Snapshot> {
        read_published(&self.published)
    }

    /// Enter the exclusive section.  Callers queue in FIFO order.
    pub async fn lock(&self) -> RefreshGuard<'_> {
        RefreshGuard {
            validator: self.section.lock().await,
            published: &self.published,
        }
    }
}

fn read_published(cell: &RwLock<Option<Snapshot>>) -> Option<Snapshot> {
    cell.read().unwrap_or_else(PoisonError::into_inner).clone()
}

// ---------------------------------------------------------------------------
// Exclusive section
// ---------------------------------------------------------------------------

/// Exclusive access to a [`ResourceCache`]; the only way to mutate it.
pub struct RefreshGuard<'a> {
    validator: MutexGuard<'a, UpstreamValidator>,
    published: &'a RwLock<Option<Snapshot>>,
}

impl RefreshGuard<'_> {
    pub fn snapshot(&self) -> Option<Snapshot> {
        read_published(self.published)
    }

    /// ETag upstream returned with the body we last filtered.
    pub fn upstream_etag(&self) -> Option<&str> {
        self.validator.etag.as_deref()
    }

    /// Replace the published artifact with a freshly filtered body and
    /// remember the upstream validator it was derived from.
    pub fn publish(
        &mut self,
        body: impl Into<Bytes>,
        upstream_etag: Option<String>,
        now: Instant,
    ) -> Arc<Artifact> {
        let artifact = Arc::new(Artifact::new(body));
        self.validator.etag = upstream_etag;
        self.store(Arc::clone(&artifact), now);
        artifact
    }

    /// Upstream confirmed the current artifact is still current: restart its
    /// freshness window.  Returns `None` when nothing is published.
    pub fn revalidated(&mut self, now: Instant) -> Option<Snapshot> {
        let current = self.snapshot()?;
        Some(self.store(current.artifact, now))
    }

    fn store(&mut self, artifact: Arc<Artifact>, now: Instant) -> Snapshot {
        let mut published = self
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let generation = published.as_ref().map_or(0, |s| s.generation) + 1;
        let snapshot = Snapshot {
            artifact,
            refreshed_at: now,
            generation,
        };
        *published = Some(snapshot.clone());
        snapshot
    }
}
