//! Configuration management for Kestrel.
//!
//! This module provides configuration handling with:
//! - YAML file support
//! - Environment variable and CLI overrides (see `cli`)
//! - Validation and defaults

use crate::channel::{BufferStrategy, Partitioner};
use crate::core::{Downsampling, KestrelError, Result};
use crate::worker::AckMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete configuration for Kestrel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ingest channel set
    pub channels: ChannelConfig,
    /// Ingest consumer pool
    pub consumers: ConsumerConfig,
    /// Merge-on-flush persistence workers
    pub persistence: PersistenceConfig,
    /// Cluster peer table
    pub cluster: ClusterConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Synthetic load generator
    pub generator: GeneratorConfig,
    /// Debug mode
    #[serde(skip)]
    pub debug: bool,
}

/// Bounded channel set configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Number of parallel buffers
    pub count: usize,
    /// Capacity of each buffer
    pub capacity: usize,
    /// Behaviour when a buffer is full
    pub strategy: OverflowStrategy,
    /// Maximum wait for the `timeout` strategy
    #[serde(with = "humantime_serde")]
    pub insert_timeout: Duration,
    /// Buffer selection policy
    pub partitioner: Partitioner,
}

/// Overflow strategy as written in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    Blocking,
    Drop,
    Timeout,
}

/// Consumer pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Number of consumer threads
    pub threads: usize,
    /// Maximum sleep between drains
    #[serde(with = "humantime_serde")]
    pub consume_interval: Duration,
    /// Buffer length that wakes the owning thread early
    pub batch_threshold: usize,
    /// Maximum items drained from one buffer per cycle
    pub max_batch: usize,
    /// Upper bound of the idle backoff
    #[serde(with = "humantime_serde")]
    pub idle_backoff_max: Duration,
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Worker instances per persistence role
    pub instances: usize,
    /// Queue capacity in front of each instance
    pub queue_capacity: usize,
    /// Flush period
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Re-read stored rows and merge before writing
    pub merge_with_storage: bool,
    /// Coarser granularities fed from the minute workers
    pub downsampling: Vec<Downsampling>,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Address identifying this process in `peers`
    pub self_address: String,
    /// All collector processes, including this one. Empty means standalone.
    pub peers: Vec<String>,
    /// Delivery mode for remote sends
    pub ack_mode: AckMode,
    /// Capacity of each per-peer client queue
    pub remote_queue_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Structured logging format
    pub structured: bool,
}

/// Synthetic load generator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Produce synthetic telemetry at startup
    pub enabled: bool,
    /// Messages per second
    pub rate: usize,
    /// Number of distinct services
    pub services: usize,
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            channels: ChannelConfig::default(),
            consumers: ConsumerConfig::default(),
            persistence: PersistenceConfig::default(),
            cluster: ClusterConfig::default(),
            logging: LoggingConfig::default(),
            generator: GeneratorConfig::default(),
            debug: false,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            count: 2,
            capacity: 10_000,
            strategy: OverflowStrategy::Blocking,
            insert_timeout: Duration::from_millis(100),
            partitioner: Partitioner::RoundRobin,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            threads: 2,
            consume_interval: Duration::from_millis(20),
            batch_threshold: 1_000,
            max_batch: 5_000,
            idle_backoff_max: Duration::from_millis(500),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            instances: 2,
            queue_capacity: 10_000,
            flush_interval: Duration::from_secs(25),
            merge_with_storage: true,
            downsampling: vec![Downsampling::Hour, Downsampling::Day, Downsampling::Month],
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            self_address: "127.0.0.1:11800".to_string(),
            peers: Vec::new(),
            ack_mode: AckMode::FireAndForget,
            remote_queue_capacity: 4_096,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            structured: false,
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            enabled: true,
            rate: 500,
            services: 6,
        }
    }
}

impl ChannelConfig {
    /// Runtime buffer strategy for this section
    pub fn buffer_strategy(&self) -> BufferStrategy {
        match self.strategy {
            OverflowStrategy::Blocking => BufferStrategy::Blocking,
            OverflowStrategy::Drop => BufferStrategy::Drop,
            OverflowStrategy::Timeout => BufferStrategy::Timeout(self.insert_timeout),
        }
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Result<Self> {
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a YAML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KestrelError::config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        ConfigBuilder::new().from_yaml(&content)?.build()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.channels.count == 0 {
            return Err(KestrelError::config("channels.count must be greater than 0"));
        }
        if self.channels.capacity == 0 {
            return Err(KestrelError::config("channels.capacity must be greater than 0"));
        }
        if self.channels.strategy == OverflowStrategy::Timeout
            && self.channels.insert_timeout.is_zero()
        {
            return Err(KestrelError::config(
                "channels.insert_timeout must be positive for the timeout strategy",
            ));
        }

        if self.consumers.threads == 0 {
            return Err(KestrelError::config("consumers.threads must be greater than 0"));
        }
        if self.consumers.consume_interval.is_zero() {
            return Err(KestrelError::config("consumers.consume_interval must be positive"));
        }
        if self.consumers.max_batch == 0 || self.consumers.batch_threshold == 0 {
            return Err(KestrelError::config(
                "consumers.max_batch and consumers.batch_threshold must be greater than 0",
            ));
        }

        if self.persistence.instances == 0 {
            return Err(KestrelError::config("persistence.instances must be greater than 0"));
        }
        if self.persistence.queue_capacity == 0 {
            return Err(KestrelError::config("persistence.queue_capacity must be greater than 0"));
        }
        if self.persistence.flush_interval.is_zero() {
            return Err(KestrelError::config("persistence.flush_interval must be positive"));
        }
        let mut levels = self.persistence.downsampling.clone();
        levels.sort();
        levels.dedup();
        if levels.len() != self.persistence.downsampling.len() {
            return Err(KestrelError::config("persistence.downsampling contains duplicates"));
        }
        if levels.contains(&Downsampling::Minute) {
            return Err(KestrelError::config(
                "persistence.downsampling lists coarser levels only; minute is always on",
            ));
        }

        if !self.cluster.peers.is_empty() && !self.cluster.peers.contains(&self.cluster.self_address)
        {
            return Err(KestrelError::config(format!(
                "cluster.self_address {} is not listed in cluster.peers",
                self.cluster.self_address
            )));
        }
        if self.cluster.remote_queue_capacity == 0 {
            return Err(KestrelError::config(
                "cluster.remote_queue_capacity must be greater than 0",
            ));
        }

        if self.generator.enabled && (self.generator.rate == 0 || self.generator.services == 0) {
            return Err(KestrelError::config(
                "generator.rate and generator.services must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl LogLevel {
    /// Convert to tracing filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Configuration builder for programmatic construction
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Load configuration from YAML string
    pub fn from_yaml(mut self, yaml: &str) -> Result<Self> {
        self.config = serde_yaml::from_str(yaml)
            .map_err(|e| KestrelError::config(format!("Failed to parse YAML config: {}", e)))?;
        Ok(self)
    }

    /// Set channel count
    pub fn channels(mut self, count: usize) -> Self {
        self.config.channels.count = count;
        self
    }

    /// Set per-channel capacity
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channels.capacity = capacity;
        self
    }

    /// Set overflow strategy
    pub fn strategy(mut self, strategy: OverflowStrategy) -> Self {
        self.config.channels.strategy = strategy;
        self
    }

    /// Set partitioner
    pub fn partitioner(mut self, partitioner: Partitioner) -> Self {
        self.config.channels.partitioner = partitioner;
        self
    }

    /// Set consumer thread count
    pub fn consumer_threads(mut self, threads: usize) -> Self {
        self.config.consumers.threads = threads;
        self
    }

    /// Set consume interval
    pub fn consume_interval(mut self, interval: Duration) -> Self {
        self.config.consumers.consume_interval = interval;
        self
    }

    /// Set flush interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.persistence.flush_interval = interval;
        self
    }

    /// Set persistence instance count
    pub fn persistence_instances(mut self, instances: usize) -> Self {
        self.config.persistence.instances = instances;
        self
    }

    /// Toggle merge-against-storage
    pub fn merge_with_storage(mut self, enable: bool) -> Self {
        self.config.persistence.merge_with_storage = enable;
        self
    }

    /// Set down-sampling levels
    pub fn downsampling(mut self, levels: Vec<Downsampling>) -> Self {
        self.config.persistence.downsampling = levels;
        self
    }

    /// Set cluster peers and the local address
    pub fn cluster(mut self, self_address: &str, peers: Vec<String>) -> Self {
        self.config.cluster.self_address = self_address.to_string();
        self.config.cluster.peers = peers;
        self
    }

    /// Set remote ack mode
    pub fn ack_mode(mut self, mode: AckMode) -> Self {
        self.config.cluster.ack_mode = mode;
        self
    }

    /// Enable synthetic load generation
    pub fn generator(mut self, enable: bool) -> Self {
        self.config.generator.enabled = enable;
        self
    }

    /// Set debug mode
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
