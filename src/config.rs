//! Configuration loaded with figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. `config/frame_daq.toml` (or the file given with `--config`)
//! 2. Environment variables prefixed with `FRAME_DAQ_`, nested keys separated
//!    by `__` (e.g. `FRAME_DAQ_APPLICATION__LOG_LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use frame_daq::config::FrameDaqConfig;
//!
//! let config = FrameDaqConfig::load()?;
//! println!("Receiver binds {}", config.receiver.bind);
//! # Ok::<(), frame_daq::config::ConfigError>(())
//! ```

use daq_core::limits::{
    DEFAULT_BLOCK_POOL_HIGH_WATER, DEFAULT_MONITOR_INTERVAL, DEFAULT_READY_QUEUE_DEPTH,
    DEFAULT_STAGE_QUEUE_DEPTH,
};
use daq_core::{ParamMessage, Result as DaqResult};
use daq_receiver::{DecoderKind, CONFIG_PREFIX};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/frame_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "FRAME_DAQ_";

/// Configuration loading failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File or environment could not be parsed into [`FrameDaqConfig`].
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// Values parsed but are inconsistent.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameDaqConfig {
    /// Process settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Slot region for received frames
    #[serde(default)]
    pub shared_buffer: SharedBufferConfig,
    /// Pool for blocks produced by processing stages
    #[serde(default)]
    pub block_pool: BlockPoolConfig,
    /// Network input and decoder
    #[serde(default)]
    pub receiver: ReceiverConfig,
    /// Processing stages and their connections
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Name used for the receive thread and in logs
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Seconds between status log lines; 0 disables
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            status_interval_secs: default_status_interval(),
        }
    }
}

/// Slot region geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedBufferConfig {
    /// Backing file (e.g. under `/dev/shm`); anonymous memory when absent
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Bytes per slot; must hold one frame
    #[serde(default = "default_slot_size")]
    pub slot_size: usize,
    /// Number of slots
    #[serde(default = "default_slot_count")]
    pub slot_count: usize,
}

impl Default for SharedBufferConfig {
    fn default() -> Self {
        Self {
            path: None,
            slot_size: default_slot_size(),
            slot_count: default_slot_count(),
        }
    }
}

/// Block pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPoolConfig {
    /// Allocation ceiling in bytes
    #[serde(default = "default_high_water")]
    pub high_water_bytes: usize,
}

impl Default for BlockPoolConfig {
    fn default() -> Self {
        Self {
            high_water_bytes: default_high_water(),
        }
    }
}

/// Network input settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Decoder variant; selects UDP (packet) or TCP (stream)
    #[serde(default)]
    pub decoder: DecoderKind,
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Packets per frame for the packet decoder
    #[serde(default = "default_packets_per_frame")]
    pub packets_per_frame: u16,
    /// Timeout monitor cadence
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Completed frames buffered between decoder and pipeline
    #[serde(default = "default_ready_queue_depth")]
    pub ready_queue_depth: usize,
    /// Initial decoder settings (keys of `decoder_config`)
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            decoder: DecoderKind::default(),
            bind: default_bind(),
            packets_per_frame: default_packets_per_frame(),
            monitor_interval_ms: default_monitor_interval_ms(),
            ready_queue_depth: default_ready_queue_depth(),
            params: Map::new(),
        }
    }
}

impl ReceiverConfig {
    /// `params` nested under `decoder_config/`.
    pub fn decoder_params(&self) -> DaqResult<ParamMessage> {
        let mut root = Map::new();
        root.insert(CONFIG_PREFIX.to_string(), Value::Object(self.params.clone()));
        ParamMessage::from_value(Value::Object(root))
    }
}

/// One processing stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique stage name
    pub name: String,
    /// Registered plugin type
    pub plugin: String,
    /// Input queue capacity
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Plugin settings applied after construction
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl StageConfig {
    /// Plugin settings as a parameter message.
    pub fn plugin_params(&self) -> DaqResult<ParamMessage> {
        ParamMessage::from_value(Value::Object(self.params.clone()))
    }
}

/// Directed edge between two stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Upstream stage
    pub from: String,
    /// Downstream stage
    pub to: String,
}

/// Stage graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stages to create
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    /// Edges between stages
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
    /// Stages fed with frames from the receiver
    #[serde(default)]
    pub entry: Vec<String>,
}

fn default_name() -> String {
    "frame_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_status_interval() -> u64 {
    10
}

fn default_slot_size() -> usize {
    256 * 256 * 2
}

fn default_slot_count() -> usize {
    32
}

fn default_high_water() -> usize {
    DEFAULT_BLOCK_POOL_HIGH_WATER
}

fn default_bind() -> String {
    "0.0.0.0:8989".to_string()
}

fn default_packets_per_frame() -> u16 {
    16
}

fn default_monitor_interval_ms() -> u64 {
    DEFAULT_MONITOR_INTERVAL.as_millis() as u64
}

fn default_ready_queue_depth() -> usize {
    DEFAULT_READY_QUEUE_DEPTH
}

fn default_queue_depth() -> usize {
    DEFAULT_STAGE_QUEUE_DEPTH
}

impl FrameDaqConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that deserialisation alone cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.shared_buffer.slot_size == 0 || self.shared_buffer.slot_count == 0 {
            return invalid(format!(
                "shared_buffer needs non-zero slot_size and slot_count (got {} x {})",
                self.shared_buffer.slot_size, self.shared_buffer.slot_count
            ));
        }
        if self.receiver.packets_per_frame == 0 {
            return invalid("receiver.packets_per_frame must be at least 1".to_string());
        }
        if self.receiver.monitor_interval_ms == 0 || self.receiver.ready_queue_depth == 0 {
            return invalid(
                "receiver.monitor_interval_ms and receiver.ready_queue_depth must be non-zero"
                    .to_string(),
            );
        }

        let mut names = HashSet::new();
        for stage in &self.pipeline.stages {
            if !names.insert(stage.name.as_str()) {
                return invalid(format!("Duplicate stage name: {}", stage.name));
            }
            if stage.queue_depth == 0 {
                return invalid(format!("Stage '{}' needs a non-zero queue_depth", stage.name));
            }
        }
        for connection in &self.pipeline.connections {
            for end in [&connection.from, &connection.to] {
                if !names.contains(end.as_str()) {
                    return invalid(format!(
                        "Connection {} -> {} names unknown stage '{end}'",
                        connection.from, connection.to
                    ));
                }
            }
        }
        for entry in &self.pipeline.entry {
            if !names.contains(entry.as_str()) {
                return invalid(format!("Entry stage '{entry}' is not defined"));
            }
        }
        if self.pipeline.entry.is_empty() && !self.pipeline.stages.is_empty() {
            return invalid("pipeline.entry must name at least one stage".to_string());
        }
        Ok(())
    }
}
