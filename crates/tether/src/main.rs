mod cli;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use session_journal::{JournalHandle, JournalSink};
use tracing::info;
use ws_proxy::{Proxy, ProxyConfig, ProxyStats};

use crate::cli::Cli;
use crate::config::Config;

fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let mut cfg = config::load(&cli.config)?;
    cfg.merge_cli(&cli);

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let proxy_config = cfg.proxy_config().context("invalid configuration")?;

    info!(
        config_file = %cli.config.display(),
        listen = %proxy_config.listen_addr,
        upstream = %proxy_config.session.upstream_url,
        workers = cfg.runtime.workers,
        grace_period_ms = cfg.session.grace_period_ms,
        retry_limit = cfg.retry.limit,
        retry_delay_ms = cfg.retry.delay_ms,
        "tether starting"
    );

    // 4. Size the runtime; the worker count replaces process clustering.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.runtime.workers)
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(serve(cfg, proxy_config))
}

async fn serve(cfg: Config, proxy_config: ProxyConfig) -> Result<()> {
    // 5. Start the session journal, if configured.
    let (journal, journal_handle): (JournalSink, Option<JournalHandle>) =
        match &cfg.logging.journal_path {
            Some(path) => {
                let (sink, handle) = JournalSink::start(path)
                    .await
                    .with_context(|| format!("failed to start session journal at {}", path.display()))?;
                info!(path = %path.display(), "session journal enabled");
                (sink, Some(handle))
            }
            None => (JournalSink::disabled(), None),
        };

    // 6. Build the proxy.
    let proxy = Proxy::new(proxy_config, journal);

    // 7. Periodic counter reporting.
    if cfg.instrumentation.enabled {
        let interval = Duration::from_millis(cfg.instrumentation.interval_ms.max(1));
        tokio::spawn(report_stats(proxy.stats(), interval));
    }

    // 8. Run until the proxy fails or a shutdown signal arrives.
    let result = tokio::select! {
        r = proxy.run() => {
            info!("WebSocket proxy exited");
            r.context("proxy stopped")
        }
        r = shutdown_signal() => r,
    };

    // 9. Log shutdown and flush the journal.
    info!(
        sessions = proxy.registry().len(),
        stats = ?proxy.stats().snapshot(),
        "tether shutting down"
    );
    if let Some(handle) = journal_handle {
        handle.shutdown().await;
    }

    result
}

/// Wait for ctrl-c or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to register SIGTERM handler")?;

        tokio::select! {
            r = ctrl_c => {
                r.context("failed to listen for ctrl-c")?;
                info!("received SIGINT (ctrl-c)");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("failed to listen for ctrl-c")?;
        info!("received SIGINT (ctrl-c)");
    }

    Ok(())
}

async fn report_stats(stats: Arc<ProxyStats>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let snapshot = stats.snapshot();
        match serde_json::to_value(snapshot) {
            Ok(counters) => info!(%counters, "proxy counters"),
            Err(err) => tracing::warn!(%err, "failed to serialize proxy counters"),
        }
    }
}
