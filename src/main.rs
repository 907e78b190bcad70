// ABOUTME: CLI entry point for cdc-relay
// ABOUTME: Parses flags, starts every configured source and stops them on ctrl-c

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use cdc_relay::config::{default_store_dir, RelaySettings, SourcesConfig};
use cdc_relay::mysql::MySqlConnector;
use cdc_relay::pipeline::PipelineConfig;
use cdc_relay::sink::http::DEFAULT_DEDUP_HEADER;
use cdc_relay::sink::HttpSinkConfig;
use cdc_relay::utils::{client_name, strip_password_from_url};
use cdc_relay::SourceManager;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Command-line interface definition for cdc-relay.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "cdc-relay",
    version,
    about = "Relays MySQL binlog changes to a message bus with resumable checkpoints.",
    long_about = None
)]
struct Cli {
    /// Sources document (.json or .toml).
    #[arg(long, value_name = "PATH", env = "CDC_RELAY_SOURCES")]
    sources: PathBuf,

    /// Directory holding one checkpoint database per source.
    #[arg(long = "store-dir", value_name = "PATH", env = "CDC_RELAY_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Run without checkpoints; every start begins at the current binlog tip.
    #[arg(long = "no-store", default_value_t = false)]
    no_store: bool,

    /// Base URL events are posted to as {url}/{event_name}.
    #[arg(long = "sink-url", value_name = "URL", env = "CDC_RELAY_SINK_URL")]
    sink_url: String,

    /// Header carrying each message's dedup key.
    #[arg(long = "dedup-header", default_value = DEFAULT_DEDUP_HEADER)]
    dedup_header: String,

    /// Publishes between ack verifications.
    #[arg(
        long = "publish-batch-size",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..=1_000_000)
    )]
    publish_batch_size: u64,

    /// Publishes per second per source; 0 disables limiting.
    #[arg(long = "rate-limit", default_value_t = 0.0)]
    rate_limit: f64,

    /// Token bucket burst; defaults to the rate rounded up.
    #[arg(long = "rate-burst")]
    rate_burst: Option<u32>,

    /// Events transformed together.
    #[arg(
        long = "chunk-size",
        default_value_t = 128,
        value_parser = clap::value_parser!(u64).range(1..=65_536)
    )]
    chunk_size: u64,

    /// Parallel transform workers per chunk.
    #[arg(
        long,
        default_value_t = 16,
        value_parser = clap::value_parser!(u64).range(1..=1024)
    )]
    workers: u64,

    /// Capacity of the pipeline input queue.
    #[arg(
        long = "buffer-size",
        default_value_t = 2048,
        value_parser = clap::value_parser!(u64).range(1..=1_048_576)
    )]
    buffer_size: u64,

    /// Seconds each publish is given to acknowledge during verification.
    #[arg(long = "ack-timeout-secs", default_value_t = 30)]
    ack_timeout_secs: u64,

    /// Seconds to wait for in-flight publishes at shutdown.
    #[arg(long = "shutdown-timeout-secs", default_value_t = 60)]
    shutdown_timeout_secs: u64,

    /// Delay before resubscribing after the stream drops.
    #[arg(
        long = "reconnect-interval-ms",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(10..=600_000)
    )]
    reconnect_interval_ms: u64,

    /// Replica server id of the first source; later sources count up from it.
    #[arg(long = "server-id", default_value_t = 1001)]
    server_id: u32,

    /// Tracing filter (info,warn,debug,trace). Can also be provided via CDC_RELAY_LOG.
    #[arg(
        long = "log-level",
        value_name = "FILTER",
        default_value = "info",
        env = "CDC_RELAY_LOG"
    )]
    log_filter: String,
}

#[derive(Debug, Clone)]
struct RelayConfig {
    sources_path: PathBuf,
    settings: RelaySettings,
    sink: HttpSinkConfig,
    server_id: u32,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: Cli) -> Result<Self> {
        if !args.rate_limit.is_finite() || args.rate_limit < 0.0 {
            bail!("--rate-limit must be a non-negative number");
        }
        if args.sink_url.trim().is_empty() {
            bail!("--sink-url must not be empty");
        }
        let store_dir = if args.no_store {
            None
        } else {
            match args.store_dir {
                Some(path) => Some(expand_home(path)?),
                None => Some(
                    default_store_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?,
                ),
            }
        };

        let settings = RelaySettings {
            pipeline: PipelineConfig {
                buffer_size: args.buffer_size as usize,
                chunk_size: args.chunk_size as usize,
                workers: args.workers as usize,
            },
            publish_batch_size: args.publish_batch_size as usize,
            rate_limit: args.rate_limit,
            rate_burst: args.rate_burst,
            ack_timeout: Duration::from_secs(args.ack_timeout_secs),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            reconnect_interval: Duration::from_millis(args.reconnect_interval_ms),
            store_dir,
            ..RelaySettings::default()
        };

        let mut sink = HttpSinkConfig::new(args.sink_url);
        sink.dedup_header = args.dedup_header;

        Ok(Self {
            sources_path: expand_home(args.sources)?,
            settings,
            sink,
            server_id: args.server_id,
        })
    }
}

fn expand_home(path: PathBuf) -> Result<PathBuf> {
    let as_str = path.to_string_lossy();
    if let Some(stripped) = as_str.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?;
        return Ok(home.join(stripped));
    }
    if as_str == "~" {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?;
        return Ok(home);
    }
    Ok(path)
}

fn init_tracing(filter: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(filter).or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to init tracing subscriber: {err}"))
}

fn display_store(dir: Option<&Path>) -> String {
    dir.map(|d| d.display().to_string())
        .unwrap_or_else(|| "disabled".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter)?;
    let config = RelayConfig::try_from(cli)?;
    let sources = SourcesConfig::load(&config.sources_path)?;

    tracing::info!(
        client = %client_name(),
        sources = %config.sources_path.display(),
        sink = %strip_password_from_url(&config.sink.base_url)?,
        store = %display_store(config.settings.store_dir.as_deref()),
        batch_size = config.settings.publish_batch_size,
        rate_limit = config.settings.rate_limit,
        "cdc-relay starting"
    );

    let connector = MySqlConnector::new(
        config.server_id,
        config.sink.clone(),
        config.settings.store_dir.clone(),
    );
    let mut manager = SourceManager::new(config.settings.clone(), Arc::new(connector));
    manager
        .start(&sources)
        .await
        .context("Failed to start sources")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");
    manager.shutdown().await;
    tracing::info!("cdc-relay stopped");
    Ok(())
}
