//! Error type shared by the receiver and processor crates.
//!
//! `DaqError` consolidates the failures a controller can see when it drives
//! decoders, registries and pipelines. Pool errors are wrapped via `#[from]`,
//! so `?` works across the crate boundary.
//!
//! ## Error Categories
//!
//! 1. **Configuration** - `UnknownPluginName`, `DuplicatePluginName`,
//!    `MalformedParameter`, `MalformedMessage`, `UnknownStage`, `InvalidStageGraph`,
//!    and pool configuration errors. The component keeps its prior state.
//! 2. **Data** - `FrameSizeMismatch`, `Codec`. Frame-level and non-fatal.
//! 3. **Runtime** - `ChannelClosed`, `ConnectionLost`, `Io`, `Plugin`. A stage or transport failed;
//!    the caller decides whether to tear down.

use daq_pool::PoolError;
use thiserror::Error;

/// Convenience alias for results using [`DaqError`].
pub type Result<T> = std::result::Result<T, DaqError>;

/// Primary error type for frame handling.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Slot or block pool failure.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Registry lookup for a plugin type that was never registered.
    #[error("Unknown plugin name '{0}'")]
    UnknownPluginName(String),

    /// A factory was registered twice under the same name.
    #[error("Plugin name '{0}' is already registered")]
    DuplicatePluginName(String),

    /// A parameter had the wrong type or an out-of-range value.
    #[error("Malformed parameter '{key}': {reason}")]
    MalformedParameter {
        /// Full `/`-separated key path
        key: String,
        /// What was wrong with it
        reason: String,
    },

    /// A control message could not be parsed.
    #[error("Malformed control message: {0}")]
    MalformedMessage(String),

    /// Pipeline operation named a stage that does not exist.
    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    /// A stage with this name already exists.
    #[error("Stage '{0}' already exists")]
    DuplicateStage(String),

    /// Connecting two stages would break the acyclic graph.
    #[error("Invalid stage graph: {0}")]
    InvalidStageGraph(String),

    /// Frame dimensions and pixel type disagree with the data length.
    #[error(
        "Frame size mismatch: dimensions {dimensions:?} of {pixel_bytes}-byte pixels \
         need {expected} bytes, block holds {actual}"
    )]
    FrameSizeMismatch {
        /// Per-axis dimensions
        dimensions: Vec<usize>,
        /// Bytes per pixel
        pixel_bytes: usize,
        /// Bytes implied by the dimensions
        expected: usize,
        /// Bytes in the data block
        actual: usize,
    },

    /// Compression or decompression failed.
    #[error("Codec error: {0}")]
    Codec(String),

    /// A plugin failed while processing a frame.
    #[error("Plugin '{plugin}' failed: {message}")]
    Plugin {
        /// Stage or plugin instance name
        plugin: String,
        /// Failure description
        message: String,
    },

    /// The other end of a queue or command channel has gone away.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// A stream peer went away; any partially received frame is void.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A worker thread panicked and could not be joined cleanly.
    #[error("Worker thread '{0}' panicked")]
    WorkerPanicked(String),

    /// Socket or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure outside control messages.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DaqError {
    /// True for errors caused by bad configuration input.
    ///
    /// These are reported to the controller; the component that raised them
    /// keeps its prior valid state.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::Pool(err) => err.is_configuration(),
            Self::UnknownPluginName(_)
            | Self::DuplicatePluginName(_)
            | Self::MalformedParameter { .. }
            | Self::MalformedMessage(_)
            | Self::UnknownStage(_)
            | Self::DuplicateStage(_)
            | Self::InvalidStageGraph(_) => true,
            _ => false,
        }
    }

    /// True when the error signals resource pressure rather than failure.
    #[must_use]
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::Pool(err) if err.is_backpressure())
    }

    /// Shorthand for a [`DaqError::MalformedParameter`].
    pub fn malformed_parameter(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedParameter {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`DaqError::Plugin`].
    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}
