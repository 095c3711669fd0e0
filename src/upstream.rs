//! Upstream document fetching.
//!
//! [`Upstream`] is the seam between the revalidation logic and the network:
//! the production implementation wraps a shared [`reqwest::Client`], tests
//! substitute scripted fakes.

use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use tracing::debug;

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// What upstream said about the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamResponse {
    /// `200 OK` with a full body.
    Fresh { etag: Option<String>, body: Bytes },
    /// `304 Not Modified` relative to the validator we sent.
    NotModified,
    /// Any other status.
    Failed(StatusCode),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait Upstream: Send + Sync {
    /// GET the document, conditionally when `if_none_match` is set.
    ///
    /// Transport failures and timeouts are returned as `Err`; HTTP-level
    /// failures are `Ok(UpstreamResponse::Failed(..))`.
    async fn fetch(&self, if_none_match: Option<&str>) -> Result<UpstreamResponse>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    url: String,
}

impl HttpUpstream {
    /// `client` is expected to carry the configured request timeout.
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait::async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, if_none_match: Option<&str>) -> Result<UpstreamResponse> {
        let mut request = self.client.get(&self.url);
        if let Some(etag) = if_none_match {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("failed to reach upstream {}", self.url))?;
        let status = resp.status();
        debug!(url = %self.url, %status, conditional = if_none_match.is_some(), "upstream responded");

        match status {
            StatusCode::OK => {
                let etag = resp
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                let body = resp
                    .bytes()
                    .await
                    .with_context(|| format!("failed to read upstream body from {}", self.url))?;
                Ok(UpstreamResponse::Fresh { etag, body })
            }
            StatusCode::NOT_MODIFIED => Ok(UpstreamResponse::NotModified),
            other => Ok(UpstreamResponse::Failed(other)),
        }
    }
}

/// Build the shared upstream client.
pub fn build_client(config: &crate::config::UpstreamConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .timeout(config.request_timeout()?)
        .build()
        .context("failed to build reqwest client")
}
