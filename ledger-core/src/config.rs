//! Configuration for the ledger

use crate::fees::FeeSchedule;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Metrics listen address
    pub metrics_listen_addr: String,

    /// Fee schedule
    pub fees: FeeSchedule,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Consumer pool configuration
    pub consumer: ConsumerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            service_name: "ledger-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            metrics_listen_addr: "0.0.0.0:9090".to_string(),
            fees: FeeSchedule::default(),
            rocksdb: RocksDBConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 256,
            max_write_buffer_number: 4,
            target_file_size_mb: 256,
            max_background_jobs: 4,
        }
    }
}

/// Consumer pool configuration
///
/// Explicit startup-time sizing, passed into the dispatcher constructor
/// rather than read from ambient state, so tests can run a
/// single-partition, single-worker instance deterministically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Number of event partitions (one in-order worker each)
    pub num_partitions: u32,

    /// Bounded per-partition channel capacity
    pub channel_capacity: usize,

    /// Initial redelivery delay (milliseconds)
    pub redelivery_initial_delay_ms: u64,

    /// Give up redelivering after this many seconds (None retries forever)
    pub redelivery_max_elapsed_secs: Option<u64>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            num_partitions: 16,
            channel_capacity: 1024,
            redelivery_initial_delay_ms: 50,
            redelivery_max_elapsed_secs: Some(30),
        }
    }
}

impl ConsumerConfig {
    /// Map to the dispatcher's own config type
    pub fn to_dispatcher_config(&self) -> event_stream::DispatcherConfig {
        event_stream::DispatcherConfig {
            num_partitions: self.num_partitions,
            channel_capacity: self.channel_capacity,
            redelivery_initial_delay_ms: self.redelivery_initial_delay_ms,
            redelivery_max_elapsed_secs: self.redelivery_max_elapsed_secs,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(addr) = std::env::var("LEDGER_METRICS_ADDR") {
            config.metrics_listen_addr = addr;
        }

        if let Ok(partitions) = std::env::var("LEDGER_CONSUMER_PARTITIONS") {
            config.consumer.num_partitions = partitions
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid partition count: {}", e)))?;
        }

        Ok(config)
    }
}
