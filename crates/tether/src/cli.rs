use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "tether",
    version,
    about = "WebSocket reverse proxy that keeps sessions alive across reconnects"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Listen address (overrides config file setting)
    #[arg(long)]
    pub listen: Option<String>,

    /// Upstream base URL, e.g. ws://127.0.0.1:9000 (overrides config file setting)
    #[arg(long)]
    pub upstream: Option<String>,

    /// Tokio worker threads (overrides config file setting)
    #[arg(long)]
    pub workers: Option<usize>,

    /// How long a dropped client may take to reconnect, in milliseconds
    #[arg(long)]
    pub grace_period_ms: Option<u64>,

    /// Upstream redial attempts after a service restart
    #[arg(long)]
    pub retry_limit: Option<u32>,

    /// Delay between upstream redial attempts, in milliseconds
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,
}
