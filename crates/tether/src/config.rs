use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use url::Url;
use ws_proxy::{ProxyConfig, RetryPolicy, SessionSettings};

use crate::cli::Cli;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub instrumentation: InstrumentationConfig,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
    #[serde(default = "default_upstream")]
    pub upstream_url: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
            upstream_url: default_upstream(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_limit")]
    pub limit: u32,
    #[serde(default = "default_retry_delay")]
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: default_retry_limit(),
            delay_ms: default_retry_delay(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            journal_path: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InstrumentationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub interval_ms: u64,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_ms: default_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_listen() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_upstream() -> String {
    "ws://127.0.0.1:9000".to_string()
}

fn default_grace_period() -> u64 {
    5000
}

fn default_retry_limit() -> u32 {
    10
}

fn default_retry_delay() -> u64 {
    10
}

fn default_workers() -> usize {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    60_000
}

// ---------------------------------------------------------------------------
// Overrides and validation
// ---------------------------------------------------------------------------

impl Config {
    /// Apply command-line flags on top of the file values.
    pub fn merge_cli(&mut self, cli: &Cli) {
        if let Some(ref listen) = cli.listen {
            self.network.listen_addr = listen.clone();
        }
        if let Some(ref upstream) = cli.upstream {
            self.network.upstream_url = upstream.clone();
        }
        if let Some(workers) = cli.workers {
            self.runtime.workers = workers;
        }
        if let Some(grace) = cli.grace_period_ms {
            self.session.grace_period_ms = grace;
        }
        if let Some(limit) = cli.retry_limit {
            self.retry.limit = limit;
        }
        if let Some(delay) = cli.retry_delay_ms {
            self.retry.delay_ms = delay;
        }
    }

    /// Check the values that cannot be caught by deserialization and build
    /// the proxy configuration from them.
    pub fn proxy_config(&self) -> anyhow::Result<ProxyConfig> {
        if self.runtime.workers == 0 {
            anyhow::bail!("runtime.workers must be at least 1");
        }

        let listen_addr: SocketAddr = self.network.listen_addr.parse().map_err(|e| {
            anyhow::anyhow!("invalid listen address {}: {e}", self.network.listen_addr)
        })?;

        let upstream_url = Url::parse(&self.network.upstream_url).map_err(|e| {
            anyhow::anyhow!("invalid upstream url {}: {e}", self.network.upstream_url)
        })?;
        if upstream_url.scheme() != "ws" {
            anyhow::bail!(
                "upstream url {} must use the ws:// scheme",
                self.network.upstream_url
            );
        }

        Ok(ProxyConfig {
            listen_addr,
            session: SessionSettings {
                upstream_url,
                grace_period: Duration::from_millis(self.session.grace_period_ms),
                retry: RetryPolicy {
                    limit: self.retry.limit,
                    delay: Duration::from_millis(self.retry.delay_ms),
                },
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// If the file does not exist a default configuration is returned and a
/// warning is emitted, so tether starts with sensible defaults when no
/// config file has been written yet.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    parse(&contents).map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))
}

fn parse(contents: &str) -> Result<Config, serde_yml::Error> {
    serde_yml::from_str(contents)
}
