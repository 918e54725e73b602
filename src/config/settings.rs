//! Tunable runtime settings
//!
//! These are the knobs of the node runtime itself, separate from the graph
//! being run. Every struct deserializes with defaults for missing fields so a
//! config file only needs to name what it changes.
//!
//! # Main Types
//!
//! - [`SchedulerSettings`] - Worker thread count and threaded/manual mode
//! - [`NodeSettings`] - Command queue depth, retry and backoff timings
//! - [`PoolSettings`] - One named resource pool and its capacity
//! - [`LoggingConfig`] - Log filter and optional rolling log file

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Thread-slot pool every node draws one unit from
pub const THREAD_POOL: &str = "Nvx.SW.ActiveThreads";

/// Audio processing engines
pub const AUDIO_PROCESSOR_POOL: &str = "Nvx.HW.AudioMediaProcessors";

/// Audio render channels
pub const AUDIO_RENDERER_POOL: &str = "Nvx.HW.AudioRenderers";

/// Image decode engines
pub const IMAGE_DECODER_POOL: &str = "Nvx.HW.ImageDecoders";

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Worker threads in threaded mode
    pub threads: usize,

    /// Run passes on worker threads; when false the owner pumps the graph
    pub multithreaded: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            threads: 2,
            multithreaded: true,
        }
    }
}

/// Per-node runtime settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Capacity of each node's command queue
    pub command_queue_depth: usize,

    /// How long a synchronous `set_config` waits for the worker
    pub set_config_timeout_ms: u64,

    /// Retries of `set_config_with_retry` while the config slot is busy
    pub set_config_retries: u32,

    /// Pause between those retries
    pub set_config_retry_interval_ms: u64,

    /// Delay before a not-ready command is retried
    pub not_ready_backoff_ms: u64,

    /// Delay before undeliverable buffers are offered again
    pub pending_retry_ms: u64,

    /// Unpopulated-port checks before an error event is raised
    pub unpopulated_warn_limit: u32,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            command_queue_depth: 64,
            set_config_timeout_ms: 2000,
            set_config_retries: 50,
            set_config_retry_interval_ms: 1,
            not_ready_backoff_ms: 100,
            pending_retry_ms: 1,
            unpopulated_warn_limit: 5,
        }
    }
}

impl NodeSettings {
    pub fn set_config_timeout(&self) -> Duration {
        Duration::from_millis(self.set_config_timeout_ms)
    }

    pub fn not_ready_backoff(&self) -> Duration {
        Duration::from_millis(self.not_ready_backoff_ms)
    }
}

/// A counting resource pool registered with the broker at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub name: String,
    pub capacity: usize,
}

impl PoolSettings {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
        }
    }

    /// The pools a stock runtime registers.
    pub fn defaults() -> Vec<PoolSettings> {
        vec![
            PoolSettings::new(THREAD_POOL, 256),
            PoolSettings::new(AUDIO_PROCESSOR_POOL, 32),
            PoolSettings::new(AUDIO_RENDERER_POOL, 32),
            PoolSettings::new(IMAGE_DECODER_POOL, 15),
        ]
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    pub filter: String,

    /// Directory for a daily rolling log file; stderr only when unset
    pub directory: Option<PathBuf>,

    /// File name prefix inside `directory`
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,mediaflow_rs=debug".to_string(),
            directory: None,
            file_prefix: "mediaflow.log".to_string(),
        }
    }
}
