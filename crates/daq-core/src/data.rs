use crate::error::{DaqError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use daq_pool::{PooledBlock, SlotId, SlotLease};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Pixel encoding of frame data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    /// 8-bit unsigned
    Raw8,
    /// 16-bit unsigned, little endian
    #[default]
    Raw16,
    /// 32-bit IEEE float
    Float32,
    /// 64-bit unsigned, little endian
    Raw64,
}

impl PixelType {
    /// Bytes per pixel.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            Self::Raw8 => 1,
            Self::Raw16 => 2,
            Self::Float32 => 4,
            Self::Raw64 => 8,
        }
    }

    /// Parse the lowercase configuration name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "raw8" => Some(Self::Raw8),
            "raw16" => Some(Self::Raw16),
            "float32" => Some(Self::Float32),
            "raw64" => Some(Self::Raw64),
            _ => None,
        }
    }
}

/// Compression state of frame data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    /// Raw pixels
    #[default]
    None,
    /// LZ4 block container
    Lz4,
    /// Byte-shuffled, then LZ4 block container
    ShuffleLz4,
}

impl CompressionType {
    /// True for anything but raw pixels.
    #[must_use]
    pub fn is_compressed(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Description of a frame's contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Frame index within the acquisition
    pub frame_number: u64,
    /// Dataset the frame belongs to
    pub dataset_name: String,
    /// Pixel encoding
    pub pixel_type: PixelType,
    /// Per-axis dimensions, slowest first
    pub dimensions: Vec<usize>,
    /// Compression applied to the data block
    pub compression: CompressionType,
    /// Acquisition the frame was taken in
    pub acquisition_id: String,
    /// Packets the frame should consist of (0 if not packetised)
    pub packets_expected: u32,
    /// Packets that arrived
    pub packets_received: u32,
    /// Set when the frame timed out with packets missing
    pub incomplete: bool,
    /// Wall-clock time the frame was completed
    pub receive_time: DateTime<Utc>,
    /// Raw size before compression, for compressed frames
    pub uncompressed_size: Option<usize>,
}

impl FrameMetadata {
    /// Metadata for an uncompressed, complete frame.
    pub fn new(
        frame_number: u64,
        dataset_name: impl Into<String>,
        pixel_type: PixelType,
        dimensions: Vec<usize>,
    ) -> Self {
        Self {
            frame_number,
            dataset_name: dataset_name.into(),
            pixel_type,
            dimensions,
            compression: CompressionType::None,
            acquisition_id: String::new(),
            packets_expected: 0,
            packets_received: 0,
            incomplete: false,
            receive_time: Utc::now(),
            uncompressed_size: None,
        }
    }

    /// Bytes implied by dimensions and pixel type, or `None` on overflow.
    #[must_use]
    pub fn expected_size(&self) -> Option<usize> {
        self.dimensions
            .iter()
            .try_fold(self.pixel_type.size(), |acc, &d| acc.checked_mul(d))
    }
}

/// Where a [`DataBlock`]'s bytes live.
enum Backing {
    Slot(SlotLease),
    Pooled(PooledBlock),
    Owned(Vec<u8>),
}

/// Frame bytes: a leased shared-memory slot, a pooled block, or an owned vector.
///
/// Blocks are shared between frame copies through `Arc`. The backing is
/// released (slot id reported, block returned to its pool) when the last
/// reference goes away.
pub struct DataBlock {
    backing: Backing,
}

impl DataBlock {
    /// Wrap a filled shared-memory slot.
    #[must_use]
    pub fn from_slot(lease: SlotLease) -> Self {
        Self {
            backing: Backing::Slot(lease),
        }
    }

    /// Wrap a block from a `DataBlockPool`.
    #[must_use]
    pub fn from_pooled(block: PooledBlock) -> Self {
        Self {
            backing: Backing::Pooled(block),
        }
    }

    /// Wrap an owned vector.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            backing: Backing::Owned(data),
        }
    }

    /// The valid bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Slot(lease) => lease.as_slice(),
            Backing::Pooled(block) => block.as_slice(),
            Backing::Owned(data) => data,
        }
    }

    /// Number of valid bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// True if the block holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared-memory slot id, for slot-backed blocks.
    #[must_use]
    pub fn slot_id(&self) -> Option<SlotId> {
        match &self.backing {
            Backing::Slot(lease) => Some(lease.slot_id()),
            _ => None,
        }
    }

    /// Short name of the backing kind, for logs and status.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match &self.backing {
            Backing::Slot(_) => "slot",
            Backing::Pooled(_) => "pooled",
            Backing::Owned(_) => "owned",
        }
    }
}

impl AsRef<[u8]> for DataBlock {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBlock")
            .field("kind", &self.kind())
            .field("len", &self.len())
            .field("slot_id", &self.slot_id())
            .finish()
    }
}

/// Keeps a block alive for as long as a `Bytes` view of it exists.
struct SharedBlock(Arc<DataBlock>);

impl AsRef<[u8]> for SharedBlock {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// The unit passed from decoders through pipeline stages.
///
/// Cloning a frame clones its metadata and shares its data block.
#[derive(Debug, Clone)]
pub struct Frame {
    metadata: FrameMetadata,
    data: Arc<DataBlock>,
}

impl Frame {
    /// Build a frame, checking uncompressed data against the dimensions.
    pub fn new(metadata: FrameMetadata, block: DataBlock) -> Result<Self> {
        Self::from_shared(metadata, Arc::new(block))
    }

    /// Build a frame around a block already shared with other frames.
    pub fn from_shared(metadata: FrameMetadata, data: Arc<DataBlock>) -> Result<Self> {
        if !metadata.compression.is_compressed() {
            let expected = metadata.expected_size();
            if expected != Some(data.len()) {
                return Err(DaqError::FrameSizeMismatch {
                    dimensions: metadata.dimensions.clone(),
                    pixel_bytes: metadata.pixel_type.size(),
                    expected: expected.unwrap_or(usize::MAX),
                    actual: data.len(),
                });
            }
        }
        Ok(Self { metadata, data })
    }

    /// Frame description.
    #[must_use]
    pub fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    /// Mutable description. Data is not affected.
    pub fn metadata_mut(&mut self) -> &mut FrameMetadata {
        &mut self.metadata
    }

    /// Frame index.
    #[must_use]
    pub fn frame_number(&self) -> u64 {
        self.metadata.frame_number
    }

    /// Frame bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// The shared data block.
    #[must_use]
    pub fn block(&self) -> &Arc<DataBlock> {
        &self.data
    }

    /// Number of frames (and views) sharing this frame's data block.
    #[must_use]
    pub fn block_ref_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Zero-copy `Bytes` view. The block stays alive while the view does.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from_owner(SharedBlock(Arc::clone(&self.data)))
    }
}

/// Dataset descriptor handed opaquely to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDefinition {
    /// Dataset name
    pub name: String,
    /// Pixel encoding
    pub pixel_type: PixelType,
    /// Frames expected in one acquisition (0 = unbounded)
    pub num_frames: u64,
    /// Per-frame dimensions
    pub frame_dimensions: Vec<usize>,
    /// Chunking dimensions for the sink
    pub chunks: Vec<usize>,
    /// Compression of stored frames
    pub compression: CompressionType,
}

impl Default for DatasetDefinition {
    fn default() -> Self {
        Self {
            name: "data".to_string(),
            pixel_type: PixelType::Raw16,
            num_frames: 0,
            frame_dimensions: Vec::new(),
            chunks: Vec::new(),
            compression: CompressionType::None,
        }
    }
}
