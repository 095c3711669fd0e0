use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tokio::time::Instant;

use crate::cache::Pipeline;
use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pipelines: PipelineChecks,
}

#[derive(Debug, Serialize)]
pub struct PipelineChecks {
    pub playlist: PipelineCheck,
    pub guide: PipelineCheck,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct PipelineCheck {
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Seconds since upstream last confirmed or replaced the artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_seconds: Option<u64>,
}

impl PipelineCheck {
    fn observe(pipeline: &Pipeline, now: Instant) -> Self {
        match pipeline.snapshot() {
            Some(snapshot) => Self {
                cached: true,
                etag: Some(snapshot.artifact.etag().to_string()),
                age_seconds: Some(now.saturating_duration_since(snapshot.refreshed_at).as_secs()),
            },
            None => Self {
                cached: false,
                etag: None,
                age_seconds: None,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// Liveness plus a view of what each pipeline currently publishes.  Never
/// contacts upstream, so the answer is always 200.
pub fn health_report(state: &AppState) -> HealthResponse {
    let now = Instant::now();
    HealthResponse {
        status: "ok",
        pipelines: PipelineChecks {
            playlist: PipelineCheck::observe(&state.playlist, now),
            guide: PipelineCheck::observe(&state.guide, now),
        },
    }
}

/// `GET /health`
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(health_report(&state)))
}
