//! Frame processing: plugin registry, threaded stage pipeline and built-in plugins.
//!
//! A [`Pipeline`] is assembled by name from a [`PluginRegistry`]:
//!
//! ```no_run
//! use daq_pool::DataBlockPool;
//! use daq_processor::{plugins, Pipeline, PluginRegistry, ShutdownMode};
//! use std::sync::Arc;
//!
//! # fn main() -> daq_core::Result<()> {
//! let mut registry = PluginRegistry::new();
//! plugins::register_builtin_plugins(&mut registry, &DataBlockPool::unbounded())?;
//!
//! let mut pipeline = Pipeline::new(Arc::new(registry));
//! pipeline.add_stage("compress", "compression", 16)?;
//! pipeline.add_stage("writer", "file_writer", 16)?;
//! pipeline.connect("compress", "writer")?;
//! // pipeline.attach_source(ready_rx, &["compress"])?;
//! pipeline.shutdown(ShutdownMode::Drain)?;
//! # Ok(())
//! # }
//! ```

pub mod pipeline;
pub mod plugin;
pub mod plugins;
pub mod registry;
pub mod stage;

pub use pipeline::{Pipeline, ShutdownMode, StageSender};
pub use plugin::{FrameOutput, FramePlugin};
pub use registry::{PluginFactory, PluginRegistry};
pub use stage::{Stage, StageCounters, StageMessage, StageStats};
