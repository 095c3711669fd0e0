mod cache;
mod config;
mod filter;
mod health;
mod http;
mod metrics;
mod upstream;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::{Pipeline, PipelineKind, RefreshPolicy};
use crate::config::Config;
use crate::filter::{GuideFilter, PlaylistFilter};
use crate::metrics::MetricsRegistry;
use crate::upstream::{HttpUpstream, Upstream};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "iptv-proxy",
    about = "Filtering, revalidating proxy for an IPTV playlist and its guide"
)]
struct Cli {
    /// Path to a YAML configuration file.  Built-in defaults and environment
    /// overrides apply when omitted.
    #[arg(short, long, env = "IPTV_PROXY_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy (the default).
    Serve,
    /// Probe a running proxy and exit non-zero unless it is healthy.
    Healthcheck {
        #[arg(long, default_value = "http://127.0.0.1:8080/health")]
        url: String,
    },
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub playlist: Arc<Pipeline>,
    pub guide: Arc<Pipeline>,
}

impl AppState {
    /// Wire both pipelines to the configured upstream URLs over one shared
    /// HTTP client.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let client = upstream::build_client(&config.upstream)?;
        let playlist = Arc::new(HttpUpstream::new(client.clone(), &config.playlist.url));
        let guide = Arc::new(HttpUpstream::new(client, &config.guide.url));
        Self::with_upstreams(config, playlist, guide)
    }

    pub fn with_upstreams(
        config: Arc<Config>,
        playlist_upstream: Arc<dyn Upstream>,
        guide_upstream: Arc<dyn Upstream>,
    ) -> Result<Self> {
        let metrics = MetricsRegistry::new();
        let channel = &config.channel;

        let playlist = Pipeline::new(
            PipelineKind::Playlist,
            RefreshPolicy::Revalidate,
            playlist_upstream,
            Arc::new(PlaylistFilter::new(
                channel.compile_pattern()?,
                &channel.tvg_id,
                &channel.tvg_name,
            )),
            Arc::clone(&metrics.metrics),
        );
        let guide = Pipeline::new(
            PipelineKind::Guide,
            RefreshPolicy::Interval(config.guide.refresh_interval()),
            guide_upstream,
            Arc::new(GuideFilter::new(&channel.tvg_id, &channel.tvg_name)),
            Arc::clone(&metrics.metrics),
        );

        Ok(Self {
            config,
            metrics,
            playlist: Arc::new(playlist),
            guide: Arc::new(guide),
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .proxy
        .listen
        .parse()
        .context("invalid listen address")?;

    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Health probe
// ---------------------------------------------------------------------------

const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// Exit status for container health probes: succeeds only on a 200 whose
/// body carries a `status` field.
async fn run_healthcheck(url: &str) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(HEALTHCHECK_TIMEOUT)
        .build()
        .context("failed to build reqwest client")?;

    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?;
    let status = resp.status();
    let body = resp.text().await.context("failed to read health response")?;

    anyhow::ensure!(
        status == reqwest::StatusCode::OK,
        "{url} returned {status}"
    );
    anyhow::ensure!(
        body.contains("status"),
        "{url} returned an unexpected body"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    if let Some(Command::Healthcheck { url }) = &cli.command {
        return run_healthcheck(url).await;
    }

    // ---- Config ----
    let config = config::load_config(cli.config.as_deref())?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        config_path = ?cli.config,
        playlist_url = %config.playlist.url,
        guide_url = %config.guide.url,
        channel_id = %config.channel.tvg_id,
        guide_refresh_seconds = config.guide.refresh_seconds,
        "starting iptv-proxy"
    );

    // ---- App state ----
    let state = AppState::new(Arc::clone(&config))?;

    // ---- Serve until shutdown ----
    run_http_server(state).await?;

    tracing::info!("iptv-proxy shut down cleanly");
    Ok(())
}
