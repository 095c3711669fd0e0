use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub playlist: PlaylistConfig,
    #[serde(default)]
    pub guide: GuideConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Upstream client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Per-request timeout applied to every upstream fetch, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: f64,
    /// `User-Agent` sent to both upstream feeds.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Result<Duration> {
        let secs = self.request_timeout_seconds;
        anyhow::ensure!(
            secs > 0.0,
            "upstream.request_timeout_seconds must be a positive number"
        );
        Duration::try_from_secs_f64(secs)
            .with_context(|| format!("upstream.request_timeout_seconds is out of range: {secs}"))
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_request_timeout() -> f64 {
    15.0
}

fn default_user_agent() -> String {
    concat!("iptv-proxy/", env!("CARGO_PKG_VERSION")).to_string()
}

// ---------------------------------------------------------------------------
// Playlist feed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistConfig {
    /// Upstream M3U document.
    #[serde(default = "default_playlist_url")]
    pub url: String,
    /// Route the filtered playlist is published on.
    #[serde(default = "default_playlist_path")]
    pub path: String,
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            url: default_playlist_url(),
            path: default_playlist_path(),
        }
    }
}

fn default_playlist_url() -> String {
    "https://iptv-org.github.io/iptv/countries/lb.m3u".to_string()
}

fn default_playlist_path() -> String {
    "/lebanon.m3u".to_string()
}

// ---------------------------------------------------------------------------
// Guide feed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GuideConfig {
    /// Upstream XMLTV document.
    #[serde(default = "default_guide_url")]
    pub url: String,
    /// Route the filtered guide is published on.
    #[serde(default = "default_guide_path")]
    pub path: String,
    /// Minimum number of seconds between two upstream guide fetches.
    #[serde(default = "default_guide_refresh")]
    pub refresh_seconds: u64,
}

impl GuideConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_seconds)
    }
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            url: default_guide_url(),
            path: default_guide_path(),
            refresh_seconds: default_guide_refresh(),
        }
    }
}

fn default_guide_url() -> String {
    "https://mdag9904.github.io/lebanon-epg/epg.xml".to_string()
}

fn default_guide_path() -> String {
    "/epg.xml".to_string()
}

fn default_guide_refresh() -> u64 {
    3600
}

// ---------------------------------------------------------------------------
// Published channel
// ---------------------------------------------------------------------------

/// The one channel both feeds are narrowed down to.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Regular expression matched against `tvg-id`, `tvg-name` and the
    /// entry title of every playlist entry.
    #[serde(default = "default_channel_pattern")]
    pub pattern: String,
    /// Compile `pattern` case-insensitively on top of any inline flags.
    #[serde(default)]
    pub case_insensitive: bool,
    /// Canonical channel identifier (`tvg-id` / XMLTV channel id).
    #[serde(default = "default_tvg_id")]
    pub tvg_id: String,
    /// Canonical display name.
    #[serde(default = "default_tvg_name")]
    pub tvg_name: String,
}

impl ChannelConfig {
    /// Compile the configured match pattern.
    pub fn compile_pattern(&self) -> Result<Regex> {
        RegexBuilder::new(&self.pattern)
            .case_insensitive(self.case_insensitive)
            .build()
            .with_context(|| format!("invalid channel pattern: {}", self.pattern))
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            pattern: default_channel_pattern(),
            case_insensitive: false,
            tvg_id: default_tvg_id(),
            tvg_name: default_tvg_name(),
        }
    }
}

fn default_channel_pattern() -> String {
    r"(?i)\bmtv\b.*\blebanon\b|mtv\s*lebanon|mtvlebanon".to_string()
}

fn default_tvg_id() -> String {
    "mtvlebanon.lb".to_string()
}

fn default_tvg_name() -> String {
    "MTV Lebanon".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a [`Config`] from an optional YAML file, apply environment
/// overrides and validate the result.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        }
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    validate_config(&config)?;
    Ok(config)
}

/// Overlay the deployment environment variables on top of `config`.
///
/// Blank values are ignored so an empty `FOO=` in a compose file falls back
/// to the file / built-in value.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| {
        lookup(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    if let Some(v) = get("LISTEN_ADDR") {
        config.proxy.listen = v;
    }
    if let Some(v) = get("M3U_URL") {
        config.playlist.url = v;
    }
    if let Some(v) = get("EPG_URL") {
        config.guide.url = v;
    }
    if let Some(v) = get("MTV_REGEX") {
        config.channel.pattern = v;
    }
    if let Some(v) = get("MTV_TVG_ID") {
        config.channel.tvg_id = v;
    }
    if let Some(v) = get("MTV_TVG_NAME") {
        config.channel.tvg_name = v;
    }
    if let Some(v) = get("EPG_REFRESH_SECONDS") {
        config.guide.refresh_seconds = v
            .parse()
            .with_context(|| format!("EPG_REFRESH_SECONDS is not an integer: {v}"))?;
    }
    if let Some(v) = get("REQUEST_TIMEOUT_SECONDS") {
        config.upstream.request_timeout_seconds = v
            .parse()
            .with_context(|| format!("REQUEST_TIMEOUT_SECONDS is not a number: {v}"))?;
    }
    Ok(())
}

/// Sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    config
        .proxy
        .listen
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid listen address: {}", config.proxy.listen))?;

    validate_upstream_url("playlist.url", &config.playlist.url)?;
    validate_upstream_url("guide.url", &config.guide.url)?;

    config.channel.compile_pattern()?;
    anyhow::ensure!(
        !config.channel.tvg_id.trim().is_empty(),
        "channel.tvg_id must not be empty"
    );
    anyhow::ensure!(
        !config.channel.tvg_name.trim().is_empty(),
        "channel.tvg_name must not be empty"
    );

    anyhow::ensure!(
        config.guide.refresh_seconds > 0,
        "guide.refresh_seconds must be greater than zero"
    );
    config.upstream.request_timeout()?;

    for (name, path) in [
        ("playlist.path", &config.playlist.path),
        ("guide.path", &config.guide.path),
    ] {
        anyhow::ensure!(path.starts_with('/'), "{name} must start with '/'");
        anyhow::ensure!(
            !matches!(path.as_str(), "/" | "/health" | "/metrics"),
            "{name} collides with a built-in route: {path}"
        );
    }
    anyhow::ensure!(
        config.playlist.path != config.guide.path,
        "playlist.path and guide.path must differ"
    );
    Ok(())
}

fn validate_upstream_url(name: &str, url: &str) -> Result<()> {
    anyhow::ensure!(!url.trim().is_empty(), "{name} is required");
    let parsed =
        reqwest::Url::parse(url).with_context(|| format!("{name} is not a valid URL: {url}"))?;
    anyhow::ensure!(
        matches!(parsed.scheme(), "http" | "https"),
        "{name} must be an http(s) URL: {url}"
    );
    Ok(())
}
