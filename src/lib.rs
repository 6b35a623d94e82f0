//! # frame_daq
//!
//! Detector frame receiver: network messages are assembled into frames inside
//! a shared-memory slot region, handed to a graph of processing stages, and
//! written to disk or streamed to live viewers.
//!
//! The work is split across the workspace crates:
//!
//! - `daq-pool` - shared slot region and pooled heap blocks
//! - `daq-core` - frames, parameter messages and errors
//! - `daq-receiver` - frame decoders, transports and the receive thread
//! - `daq-processor` - plugin registry, stages and the pipeline
//!
//! This crate wires them together from a TOML configuration file. See
//! [`app::FrameDaqApp`] for the composition and [`config::FrameDaqConfig`] for
//! the file layout.

pub mod app;
pub mod config;
pub mod tracing_setup;

pub use app::FrameDaqApp;
pub use config::{ConfigError, FrameDaqConfig};
