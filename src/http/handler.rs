//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `GET <playlist.path>` - filtered playlist (default `/lebanon.m3u`)
//! - `GET <guide.path>`    - filtered guide (default `/epg.xml`)
//! - `GET /health`         - health check
//! - `GET /metrics`        - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{error, instrument, warn};

use crate::cache::{Outcome, Pipeline, PipelineKind};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.playlist.path, get(handle_playlist))
        .route(&state.config.guide.path, get(handle_guide))
        .route("/health", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_playlist(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    serve_pipeline(&state.playlist, &headers).await
}

async fn handle_guide(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    serve_pipeline(&state.guide, &headers).await
}

#[instrument(skip_all, fields(pipeline = pipeline.kind().label()))]
async fn serve_pipeline(pipeline: &Pipeline, headers: &HeaderMap) -> Response {
    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match pipeline.serve(if_none_match).await {
        Outcome::NotModified => StatusCode::NOT_MODIFIED.into_response(),
        Outcome::Artifact(artifact) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, pipeline.kind().content_type()),
                (header::ETAG, artifact.etag()),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            artifact.body().clone(),
        )
            .into_response(),
        Outcome::UpstreamError(err) => {
            warn!(error = %err, "no artifact available");
            AppError::UpstreamUnavailable(pipeline.kind()).into_response()
        }
    }
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The pipeline has neither a fresh nor a cached artifact to send.
    UpstreamUnavailable(PipelineKind),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::UpstreamUnavailable(kind) => {
                (StatusCode::BAD_GATEWAY, kind.unavailable_message()).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::upstream::fake::FakeUpstream;
    use crate::upstream::UpstreamResponse;

    const PLAYLIST: &str = "#EXTM3U\n\
        #EXTINF:-1 tvg-id=\"mtv.lb\",MTV Lebanon HD\n\
        http://stream/mtv\n\
        #EXTINF:-1 tvg-id=\"other\",Other\n\
        http://stream/other\n";

    const GUIDE: &str = r#"<?xml version="1.0"?><tv><channel id="mtvlebanon.lb"><display-name>MTV</display-name></channel><programme channel="mtvlebanon.lb" start="1"><title>News</title></programme><programme channel="other" start="1"><title>Else</title></programme></tv>"#;

    struct Harness {
        router: Router,
        playlist: Arc<FakeUpstream>,
        guide: Arc<FakeUpstream>,
    }

    fn harness() -> Harness {
        let playlist = FakeUpstream::new(PLAYLIST, "\"p-1\"");
        let guide = FakeUpstream::new(GUIDE, "\"g-1\"");
        let state =
            AppState::with_upstreams(Arc::new(Config::default()), playlist.clone(), guide.clone())
                .unwrap();
        Harness {
            router: create_router(Arc::new(state)),
            playlist,
            guide,
        }
    }

    async fn get(router: &Router, uri: &str, if_none_match: Option<&str>) -> Response {
        let mut request = Request::builder().uri(uri);
        if let Some(etag) = if_none_match {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
        router
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn header_str<'a>(response: &'a Response, name: header::HeaderName) -> &'a str {
        response.headers().get(name).unwrap().to_str().unwrap()
    }

    #[tokio::test]
    async fn playlist_is_filtered_and_tagged() {
        let h = harness();
        let response = get(&h.router, "/lebanon.m3u", None).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            header_str(&response, header::CONTENT_TYPE),
            "application/vnd.apple.mpegurl"
        );
        assert_eq!(header_str(&response, header::CACHE_CONTROL), "no-cache");
        let etag = header_str(&response, header::ETAG).to_string();
        assert!(etag.starts_with('"') && etag.ends_with('"'));

        let body = body_text(response).await;
        assert!(body.starts_with("#EXTM3U\n"));
        assert!(body.contains("tvg-id=\"mtvlebanon.lb\""));
        assert!(body.contains("http://stream/mtv"));
        assert!(!body.contains("http://stream/other"));
        assert_eq!(crate::cache::fingerprint::etag_for(body.as_bytes()), etag);
    }

    #[tokio::test]
    async fn matching_etag_yields_empty_304() {
        let h = harness();
        let first = get(&h.router, "/lebanon.m3u", None).await;
        let etag = header_str(&first, header::ETAG).to_string();

        let second = get(&h.router, "/lebanon.m3u", Some(&etag)).await;
        assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
        assert!(body_text(second).await.is_empty());
        assert_eq!(h.playlist.calls().len(), 1);
    }

    #[tokio::test]
    async fn guide_is_filtered_and_tagged() {
        let h = harness();
        let response = get(&h.router, "/epg.xml", None).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, header::CONTENT_TYPE), "application/xml");
        assert!(response.headers().contains_key(header::ETAG));

        let body = body_text(response).await;
        assert!(body.contains("<title>News</title>"));
        assert!(!body.contains("Else"));
        assert_eq!(h.guide.calls().len(), 1);
        assert!(h.playlist.calls().is_empty());
    }

    #[tokio::test]
    async fn cold_upstream_failure_is_bad_gateway() {
        let h = harness();
        h.playlist
            .push(Ok(UpstreamResponse::Failed(StatusCode::SERVICE_UNAVAILABLE)));
        h.guide.push(Err("timed out".to_string()));

        let response = get(&h.router, "/lebanon.m3u", None).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_text(response).await, "Upstream M3U unavailable");

        let response = get(&h.router, "/epg.xml", None).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_text(response).await, "Upstream EPG unavailable");
    }

    #[tokio::test]
    async fn malformed_guide_on_cold_cache_is_bad_gateway() {
        let h = harness();
        h.guide.set_document("<tv><programme channel=", "\"g-2\"");
        let response = get(&h.router, "/epg.xml", None).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn health_and_metrics_are_exposed() {
        let h = harness();
        get(&h.router, "/lebanon.m3u", None).await;

        let response = get(&h.router, "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["pipelines"]["playlist"]["cached"], true);
        assert_eq!(json["pipelines"]["guide"]["cached"], false);

        let response = get(&h.router, "/metrics", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("iptv_proxy_requests_total"));
        assert!(text.contains("iptv_proxy_upstream_fetches_total"));
    }

    #[tokio::test]
    async fn internal_errors_become_500() {
        let response = AppError::from(anyhow::anyhow!("encoder broke")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.contains("encoder broke"));
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let h = harness();
        let response = get(&h.router, "/other.m3u", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(h.playlist.calls().is_empty());
    }
}
