//! Command-line interface for Kestrel.
//!
//! Runs the ingest pipeline against the in-memory store, optionally fed by
//! the synthetic generator, until Ctrl-C.

use crate::core::{Config, ConfigBuilder, KestrelError, Result};
use crate::generator::Generator;
use crate::pipeline::IngestPipeline;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Streaming dispatch and merge-on-flush aggregation engine.
#[derive(Parser, Debug)]
#[command(name = "kestrel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (default: ~/.config/kestrel/config.yaml)
    #[arg(short, long, env = "KESTREL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, env = "KESTREL_DEBUG")]
    pub debug: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub check_config: bool,

    /// Number of ingest buffers
    #[arg(long, env = "KESTREL_CHANNELS")]
    pub channels: Option<usize>,

    /// Number of ingest consumer threads
    #[arg(long, env = "KESTREL_CONSUMER_THREADS")]
    pub consumer_threads: Option<usize>,

    /// Flush period in seconds
    #[arg(long, env = "KESTREL_FLUSH_INTERVAL")]
    pub flush_interval: Option<u64>,

    /// Disable the synthetic load generator
    #[arg(long, env = "KESTREL_NO_GENERATOR")]
    pub no_generator: bool,

    /// Seconds between statistics log lines
    #[arg(long, env = "KESTREL_STATS_INTERVAL", default_value_t = 10)]
    pub stats_interval: u64,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Load configuration with proper precedence:
    /// 1. CLI arguments (highest priority)
    /// 2. Environment variables
    /// 3. Config file
    /// 4. Defaults (lowest priority)
    pub async fn load_config(&self) -> Result<Config> {
        let mut builder = ConfigBuilder::new();

        let config_path = if let Some(path) = &self.config {
            path.clone()
        } else {
            let default_path = dirs::config_dir()
                .map(|d| d.join("kestrel").join("config.yaml"))
                .unwrap_or_else(|| PathBuf::from("~/.config/kestrel/config.yaml"));

            if default_path.exists() {
                default_path
            } else {
                return self.apply_overrides(builder);
            }
        };

        match tokio::fs::read_to_string(&config_path).await {
            Ok(content) => {
                builder = builder.from_yaml(&content)?;
                tracing::info!("Loaded configuration from: {:?}", config_path);
            },
            Err(e) if self.config.is_some() => {
                return Err(KestrelError::config(format!(
                    "Failed to read config file {:?}: {}",
                    config_path, e
                )));
            },
            Err(_) => {
                tracing::debug!("No config file found at {:?}, using defaults", config_path);
            },
        }

        self.apply_overrides(builder)
    }

    fn apply_overrides(&self, mut builder: ConfigBuilder) -> Result<Config> {
        if let Some(channels) = self.channels {
            builder = builder.channels(channels);
        }
        if let Some(threads) = self.consumer_threads {
            builder = builder.consumer_threads(threads);
        }
        if let Some(secs) = self.flush_interval {
            builder = builder.flush_interval(Duration::from_secs(secs));
        }
        if self.no_generator {
            builder = builder.generator(false);
        }

        builder.debug(self.debug).build()
    }

    /// Initialize logging based on configuration.
    pub fn init_logging(&self, config: &Config) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let env_log_level = std::env::var("KESTREL_LOG_LEVEL").unwrap_or_else(|_| config.logging.level.as_str().to_string());
        let log_level = if self.debug { "debug" } else { env_log_level.as_str() };

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

        let fmt_layer = if config.logging.structured {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .compact()
        } else {
            tracing_subscriber::fmt::layer().with_target(false).compact()
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| KestrelError::config(format!("Failed to initialize logging: {}", e)))?;

        Ok(())
    }
}

/// Execute the Kestrel application.
pub async fn execute(cli: Cli) -> Result<()> {
    let config = cli.load_config().await?;

    if cli.check_config {
        config.validate()?;
        println!("Configuration is valid!");
        println!("  Channels: {} x {} ({:?})", config.channels.count, config.channels.capacity, config.channels.strategy);
        println!("  Consumer threads: {}", config.consumers.threads);
        println!("  Persistence instances: {}", config.persistence.instances);
        println!("  Flush interval: {:?}", config.persistence.flush_interval);
        println!("  Down-sampling: {:?}", config.persistence.downsampling);
        println!("  Cluster peers: {}", config.cluster.peers.len().max(1));
        return Ok(());
    }

    cli.init_logging(&config)?;
    run(config, Duration::from_secs(cli.stats_interval.max(1))).await
}

async fn run(config: Config, stats_interval: Duration) -> Result<()> {
    let generator = config.generator.clone();
    let pipeline = Arc::new(IngestPipeline::builder(config).build()?);

    let load = if generator.enabled {
        let mut source = Generator::new(generator.services)?;
        let target = Arc::clone(&pipeline);
        // rate is per second, produced in ten slices
        let per_tick = (generator.rate / 10).max(1);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(100));
            loop {
                interval.tick().await;
                let now_ms = chrono::Utc::now().timestamp_millis();
                let batch = source.batch(per_tick, now_ms);
                tokio::task::block_in_place(|| {
                    for message in batch {
                        target.produce(message);
                    }
                });
            }
        }))
    } else {
        None
    };

    let reporter = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(stats_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let stats = pipeline.stats();
                tracing::info!(
                    produced = stats.produced,
                    rejected = stats.rejected,
                    dispatched = stats.dispatched,
                    written = stats.records_written,
                    lost = stats.records_lost,
                    ingest_rate = stats.ingest_rate,
                    health = stats.health().as_str(),
                    "Engine statistics"
                );
            }
        })
    };

    tracing::info!("Kestrel running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping...");

    if let Some(load) = load {
        load.abort();
    }
    reporter.abort();

    let report = tokio::task::spawn_blocking(move || pipeline.shutdown())
        .await
        .map_err(|e| KestrelError::handler(format!("shutdown task failed: {}", e)))??;
    tracing::info!(written = report.written, lost = report.lost, "Final flush complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["kestrel"]).unwrap();
        assert!(!cli.debug);
        assert!(!cli.no_generator);
        assert_eq!(cli.stats_interval, 10);
        assert!(cli.channels.is_none());
    }

    #[test]
    fn test_overrides_win_over_defaults() {
        let cli = Cli::try_parse_from([
            "kestrel",
            "--channels",
            "8",
            "--consumer-threads",
            "4",
            "--flush-interval",
            "5",
            "--no-generator",
        ])
        .unwrap();
        let config = cli.apply_overrides(ConfigBuilder::new()).unwrap();

        assert_eq!(config.channels.count, 8);
        assert_eq!(config.consumers.threads, 4);
        assert_eq!(config.persistence.flush_interval, Duration::from_secs(5));
        assert!(!config.generator.enabled);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let cli = Cli::try_parse_from(["kestrel", "--channels", "0"]).unwrap();
        assert!(cli.apply_overrides(ConfigBuilder::new()).is_err());
    }
}
