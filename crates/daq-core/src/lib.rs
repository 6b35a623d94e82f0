//! `daq-core`
//!
//! Frame data model and control vocabulary shared by the receiver and the
//! processing pipeline.
//!
//! ## Key Types
//!
//! - [`Frame`]: metadata plus a reference-counted [`DataBlock`]; the unit
//!   passed from decoders through pipeline stages
//! - [`DataBlock`]: frame bytes backed by a shared-memory slot lease, a pooled
//!   block, or an owned vector
//! - [`ParamMessage`] / [`ControlMessage`]: `/`-keyed parameter trees and their
//!   JSON envelope on the control channel
//! - [`DaqError`]: error type with configuration/backpressure classification
//!
//! ## Example
//!
//! ```
//! use daq_core::{DataBlock, Frame, FrameMetadata, PixelType};
//!
//! let meta = FrameMetadata::new(0, "data", PixelType::Raw16, vec![2, 2]);
//! let frame = Frame::new(meta, DataBlock::from_vec(vec![0; 8])).unwrap();
//! assert_eq!(frame.data().len(), 8);
//! ```

/// Frame, data block and dataset types.
pub mod data;
pub mod error;
pub mod limits;
pub mod params;

pub use data::{CompressionType, DataBlock, DatasetDefinition, Frame, FrameMetadata, PixelType};
pub use error::{DaqError, Result};
pub use params::{join_key, verbs, ControlMessage, MessageType, ParamMessage};
