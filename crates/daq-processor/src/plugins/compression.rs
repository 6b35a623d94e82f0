//! LZ4 compression stage with optional byte shuffle and block splitting.
//!
//! # Container format
//!
//! ```text
//! offset  size  field
//!      0     8  uncompressed_len (u64 LE)
//!      8     4  block_size (u32 LE, bytes of raw data per block)
//!     12     4  flags (u32 LE: bit 0 shuffled, bits 8..16 element size)
//!     16     …  per block: compressed_len (u32 LE) then LZ4 block payload
//! ```
//!
//! Settings follow a current/commanded split: `configure` only changes the
//! commanded settings, which become current when a frame from a new
//! acquisition arrives. Frames of one acquisition are always compressed alike.

use crate::plugin::{FrameOutput, FramePlugin};
use daq_core::{
    join_key, CompressionType, DaqError, DataBlock, Frame, ParamMessage, Result,
};
use daq_pool::DataBlockPool;
use serde::Serialize;
use std::any::Any;
use std::time::Duration;
use tracing::{debug, info};

/// Bytes before the first compressed block.
pub const CONTAINER_HEADER_SIZE: usize = 16;

const FLAG_SHUFFLE: u32 = 1;
const MAX_COMPRESSION_LEVEL: u64 = 9;
const MIN_BLOCK_SIZE: u64 = 16;
const BLOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

/// Compression parameters for one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompressionSettings {
    /// 0 disables compression; 1..=9 enable it
    pub compression_level: u32,
    /// Byte-shuffle multi-byte pixels before compressing
    pub shuffle: bool,
    /// Raw bytes per compressed block; 0 compresses the whole frame as one block
    pub block_size: usize,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            compression_level: 1,
            shuffle: true,
            block_size: 0,
        }
    }
}

impl CompressionSettings {
    fn updated(&self, params: &ParamMessage) -> Result<Self> {
        let mut next = *self;
        if let Some(level) = params.get_u64("compression_level")? {
            if level > MAX_COMPRESSION_LEVEL {
                return Err(DaqError::malformed_parameter(
                    "compression_level",
                    format!("{level} is above {MAX_COMPRESSION_LEVEL}"),
                ));
            }
            next.compression_level = level as u32;
        }
        if let Some(shuffle) = params.get_bool("shuffle")? {
            next.shuffle = shuffle;
        }
        if let Some(block_size) = params.get_u64("block_size")? {
            if block_size != 0 && !(MIN_BLOCK_SIZE..=u64::from(u32::MAX)).contains(&block_size) {
                return Err(DaqError::malformed_parameter(
                    "block_size",
                    format!("must be 0 or between {MIN_BLOCK_SIZE} and {}", u32::MAX),
                ));
            }
            next.block_size = usize::try_from(block_size)
                .map_err(|_| DaqError::malformed_parameter("block_size", "too large"))?;
        }
        Ok(next)
    }

    fn report(&self, prefix: &str, msg: &mut ParamMessage) {
        msg.set(&join_key(prefix, "compression_level"), self.compression_level);
        msg.set(&join_key(prefix, "shuffle"), self.shuffle);
        msg.set(&join_key(prefix, "block_size"), self.block_size);
    }
}

fn effective_block(len: usize, block_size: usize) -> usize {
    if block_size == 0 || block_size > len {
        len
    } else {
        block_size
    }
}

/// Largest container `len` raw bytes can produce.
#[must_use]
pub fn max_compressed_size(len: usize, block_size: usize) -> usize {
    let block = effective_block(len, block_size);
    if block == 0 {
        return CONTAINER_HEADER_SIZE;
    }
    let blocks = len.div_ceil(block);
    CONTAINER_HEADER_SIZE + blocks * (4 + lz4_flex::block::get_maximum_output_size(block))
}

fn shuffle_into(src: &[u8], typesize: usize, dst: &mut Vec<u8>) {
    dst.clear();
    dst.resize(src.len(), 0);
    let n = src.len() / typesize;
    for (i, element) in src.chunks_exact(typesize).enumerate() {
        for (j, byte) in element.iter().enumerate() {
            dst[j * n + i] = *byte;
        }
    }
    let tail = n * typesize;
    dst[tail..].copy_from_slice(&src[tail..]);
}

fn unshuffle(src: &[u8], typesize: usize) -> Vec<u8> {
    let mut dst = vec![0u8; src.len()];
    let n = src.len() / typesize;
    for i in 0..n {
        for j in 0..typesize {
            dst[i * typesize + j] = src[j * n + i];
        }
    }
    let tail = n * typesize;
    dst[tail..].copy_from_slice(&src[tail..]);
    dst
}

fn codec_err(context: &str, err: impl std::fmt::Display) -> DaqError {
    DaqError::Codec(format!("{context}: {err}"))
}

/// Write `input` as a container into `out`, returning the bytes written.
///
/// `out` must hold [`max_compressed_size`] bytes.
fn encode_container(
    input: &[u8],
    block_size: usize,
    typesize: usize,
    shuffled: bool,
    out: &mut [u8],
) -> Result<usize> {
    let block = effective_block(input.len(), block_size);
    let block_field =
        u32::try_from(block).map_err(|e| codec_err("block size exceeds container limit", e))?;
    let typesize_field = u32::try_from(typesize.min(0xFF)).unwrap_or(0xFF);
    let flags = if shuffled { FLAG_SHUFFLE } else { 0 } | (typesize_field << 8);

    out[0..8].copy_from_slice(&(input.len() as u64).to_le_bytes());
    out[8..12].copy_from_slice(&block_field.to_le_bytes());
    out[12..16].copy_from_slice(&flags.to_le_bytes());

    let mut pos = CONTAINER_HEADER_SIZE;
    for chunk in input.chunks(block.max(1)) {
        let written = lz4_flex::block::compress_into(chunk, &mut out[pos + 4..])
            .map_err(|e| codec_err("LZ4 compression failed", e))?;
        let size = u32::try_from(written).map_err(|e| codec_err("compressed block too large", e))?;
        out[pos..pos + 4].copy_from_slice(&size.to_le_bytes());
        pos += 4 + written;
    }
    Ok(pos)
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32> {
    data.get(pos..pos + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| DaqError::Codec(format!("container truncated at offset {pos}")))
}

/// Decode a container produced by the compression stage.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let len_bytes: [u8; 8] = data
        .get(0..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| DaqError::Codec("container shorter than its header".to_string()))?;
    let len = usize::try_from(u64::from_le_bytes(len_bytes))
        .map_err(|e| codec_err("uncompressed length", e))?;
    if len > daq_core::limits::MAX_FRAME_BYTES {
        return Err(DaqError::Codec(format!("uncompressed length {len} exceeds frame limit")));
    }
    let block = read_u32(data, 8)? as usize;
    let flags = read_u32(data, 12)?;
    if len > 0 && block == 0 {
        return Err(DaqError::Codec("zero block size".to_string()));
    }

    let mut raw = vec![0u8; len];
    let mut pos = CONTAINER_HEADER_SIZE;
    let mut offset = 0;
    while offset < len {
        let expected = block.min(len - offset);
        let size = read_u32(data, pos)? as usize;
        pos += 4;
        let payload = data
            .get(pos..pos + size)
            .ok_or_else(|| DaqError::Codec(format!("block at offset {pos} truncated")))?;
        let written = lz4_flex::block::decompress_into(payload, &mut raw[offset..offset + expected])
            .map_err(|e| codec_err("LZ4 decompression failed", e))?;
        if written != expected {
            return Err(DaqError::Codec(format!(
                "block decoded to {written} bytes, expected {expected}"
            )));
        }
        pos += size;
        offset += expected;
    }

    let typesize = ((flags >> 8) & 0xFF) as usize;
    if flags & FLAG_SHUFFLE != 0 && typesize > 1 {
        Ok(unshuffle(&raw, typesize))
    } else {
        Ok(raw)
    }
}

/// Compression stage. Output blocks come from a [`DataBlockPool`].
pub struct Compression {
    name: String,
    pool: DataBlockPool,
    current: CompressionSettings,
    commanded: CompressionSettings,
    current_acquisition: Option<String>,
    scratch: Vec<u8>,
    frames_compressed: u64,
    frames_passed: u64,
    bytes_in: u64,
    bytes_out: u64,
}

impl Compression {
    /// Plugin type name.
    pub const TYPE: &'static str = "compression";

    /// New stage drawing output blocks from `pool`.
    pub fn new(name: &str, pool: DataBlockPool) -> Self {
        Self {
            name: name.to_string(),
            pool,
            current: CompressionSettings::default(),
            commanded: CompressionSettings::default(),
            current_acquisition: None,
            scratch: Vec::new(),
            frames_compressed: 0,
            frames_passed: 0,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Settings applied to the running acquisition.
    #[must_use]
    pub fn current_settings(&self) -> CompressionSettings {
        self.current
    }

    /// Settings the next acquisition will use.
    #[must_use]
    pub fn commanded_settings(&self) -> CompressionSettings {
        self.commanded
    }

    fn update_settings(&mut self, acquisition_id: &str) {
        if self.current_acquisition.as_deref() == Some(acquisition_id) {
            return;
        }
        if self.current != self.commanded {
            info!(
                stage = %self.name,
                acquisition_id,
                settings = ?self.commanded,
                "New acquisition - applying commanded compression settings"
            );
        }
        self.current = self.commanded;
        self.current_acquisition = Some(acquisition_id.to_string());
    }

    /// Compress `frame` into a new frame backed by a pooled block.
    pub fn compress_frame(&mut self, frame: &Frame) -> Result<Frame> {
        let data = frame.data();
        let typesize = frame.metadata().pixel_type.size();
        let shuffled = self.current.shuffle && typesize > 1;
        let input: &[u8] = if shuffled {
            shuffle_into(data, typesize, &mut self.scratch);
            &self.scratch
        } else {
            data
        };

        let bound = max_compressed_size(input.len(), self.current.block_size);
        let mut block = self.pool.acquire_timeout(bound, BLOCK_ACQUIRE_TIMEOUT)?;
        let written = encode_container(
            input,
            self.current.block_size,
            typesize,
            shuffled,
            block.spare_mut(),
        )?;
        block.set_len(written)?;

        let mut metadata = frame.metadata().clone();
        metadata.compression = if shuffled {
            CompressionType::ShuffleLz4
        } else {
            CompressionType::Lz4
        };
        metadata.uncompressed_size = Some(data.len());
        Frame::new(metadata, DataBlock::from_pooled(block))
    }
}

impl FramePlugin for Compression {
    fn plugin_type(&self) -> &'static str {
        Self::TYPE
    }

    fn process_frame(&mut self, frame: Frame, out: &mut FrameOutput) -> Result<()> {
        let acquisition_id = frame.metadata().acquisition_id.clone();
        self.update_settings(&acquisition_id);

        if self.current.compression_level == 0 || frame.metadata().compression.is_compressed() {
            self.frames_passed += 1;
            out.push(frame);
            return Ok(());
        }

        let compressed = self.compress_frame(&frame)?;
        self.frames_compressed += 1;
        self.bytes_in += frame.data().len() as u64;
        self.bytes_out += compressed.data().len() as u64;
        debug!(
            stage = %self.name,
            frame_number = frame.frame_number(),
            raw = frame.data().len(),
            compressed = compressed.data().len(),
            "Frame compressed"
        );
        drop(frame);
        out.push(compressed);
        Ok(())
    }

    fn configure(&mut self, params: &ParamMessage) -> Result<()> {
        self.commanded = self.commanded.updated(params)?;
        Ok(())
    }

    fn request_configuration(&self, prefix: &str, msg: &mut ParamMessage) {
        self.commanded.report(prefix, msg);
    }

    fn status(&self, prefix: &str, msg: &mut ParamMessage) {
        self.current.report(&join_key(prefix, "current"), msg);
        if let Some(acquisition) = &self.current_acquisition {
            msg.set(&join_key(prefix, "acquisition_id"), acquisition.as_str());
        }
        msg.set(&join_key(prefix, "frames_compressed"), self.frames_compressed);
        msg.set(&join_key(prefix, "frames_passed"), self.frames_passed);
        msg.set(&join_key(prefix, "bytes_in"), self.bytes_in);
        msg.set(&join_key(prefix, "bytes_out"), self.bytes_out);
        msg.set(&join_key(prefix, "pool_allocated_bytes"), self.pool.allocated_bytes());
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
