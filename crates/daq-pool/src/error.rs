//! Error type for slot and block pools.

use thiserror::Error;

/// Errors raised by [`SharedBufferPool`](crate::SharedBufferPool) and
/// [`DataBlockPool`](crate::DataBlockPool).
///
/// Errors fall into three groups:
///
/// - **Configuration**: `InvalidSlotId`, `InvalidGeometry`, `LengthExceedsSlot`,
///   `LengthExceedsCapacity`, `BufferPoolBusy`. The pool keeps its prior state.
/// - **Backpressure**: `HighWaterExceeded`. The caller should wait for blocks
///   to be released rather than treat this as a failure.
/// - **Fatal setup**: `BadRegion`, `Io`. The region could not be mapped.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Slot id outside `0..slot_count`.
    #[error("Invalid slot id {id} (pool has {slot_count} slots)")]
    InvalidSlotId {
        /// Requested id
        id: usize,
        /// Slots in the current layout
        slot_count: usize,
    },

    /// Zero-sized slots, zero slots, or a layout that overflows `usize`.
    #[error("Invalid buffer pool geometry: {slot_count} slots of {slot_size} bytes")]
    InvalidGeometry {
        /// Requested slot size in bytes
        slot_size: usize,
        /// Requested slot count
        slot_count: usize,
    },

    /// A lease or write asked for more bytes than a slot holds.
    #[error("Length {len} exceeds slot size {slot_size}")]
    LengthExceedsSlot {
        /// Requested length
        len: usize,
        /// Slot size of the current layout
        slot_size: usize,
    },

    /// Re-carving was requested while frames still hold leased slots.
    #[error("Buffer pool busy: {outstanding} slot leases still held by frames")]
    BufferPoolBusy {
        /// Leases alive at the time of the request
        outstanding: usize,
    },

    /// Allocating another block would cross the configured high-water mark.
    #[error(
        "Block pool high-water mark exceeded: requested {requested} bytes with \
         {allocated} of {high_water} bytes allocated"
    )]
    HighWaterExceeded {
        /// Size class that was requested
        requested: usize,
        /// Bytes currently allocated by the pool
        allocated: usize,
        /// Configured ceiling
        high_water: usize,
    },

    /// A block length was set past its capacity.
    #[error("Length {len} exceeds block capacity {capacity}")]
    LengthExceedsCapacity {
        /// Requested length
        len: usize,
        /// Block capacity
        capacity: usize,
    },

    /// The mapped region is not a slot pool or is truncated.
    #[error("Shared region is not usable: {0}")]
    BadRegion(String),

    /// Creating, sizing or mapping the backing file failed.
    #[error("Shared region I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// True for errors caused by bad caller input; the pool is unchanged.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidSlotId { .. }
                | Self::InvalidGeometry { .. }
                | Self::LengthExceedsSlot { .. }
                | Self::LengthExceedsCapacity { .. }
                | Self::BufferPoolBusy { .. }
        )
    }

    /// True when the error signals resource pressure rather than failure.
    #[must_use]
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::HighWaterExceeded { .. })
    }
}
