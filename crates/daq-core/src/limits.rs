//! Shared defaults and hard limits.
//!
//! This module centralizes:
//! - Decoder timing defaults (frame timeout, empty-buffer wait, monitor cadence)
//! - Queue depths for stages and the decoder ready output
//! - Size limits that keep a malformed header from forcing huge allocations

use std::time::Duration;

// =============================================================================
// Decoder Timing
// =============================================================================

/// Default time an in-flight frame may wait for missing packets (1 second).
pub const DEFAULT_FRAME_TIMEOUT_MS: u64 = 1000;

/// Default bounded wait for a released slot when the empty queue is dry.
pub const DEFAULT_EMPTY_BUFFER_TIMEOUT_MS: u64 = 100;

/// Cadence of `monitor_buffers` in the receive thread.
///
/// Timed-out frames are detected at most one interval late.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(10);

/// Completed frame numbers remembered to classify late duplicates.
pub const COMPLETED_FRAME_HISTORY: usize = 256;

// =============================================================================
// Queue Depths
// =============================================================================

/// Default bounded input queue depth per pipeline stage.
pub const DEFAULT_STAGE_QUEUE_DEPTH: usize = 16;

/// Default depth of the decoder ready output feeding the pipeline.
pub const DEFAULT_READY_QUEUE_DEPTH: usize = 16;

/// Default depth of a live-view subscriber channel.
pub const DEFAULT_LIVE_VIEW_DEPTH: usize = 4;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum frame payload accepted from a stream header (default: 512MB).
pub const MAX_FRAME_BYTES: usize = 512 * 1024 * 1024;

/// Largest UDP datagram the packet receive path reads.
pub const MAX_DATAGRAM_BYTES: usize = 65_536;

/// Default high-water mark for the auxiliary block pool (default: 1GB).
pub const DEFAULT_BLOCK_POOL_HIGH_WATER: usize = 1024 * 1024 * 1024;
