//! Memory pools for high-rate detector frame handling.
//!
//! This crate provides the two allocation layers that frames live in:
//!
//! - [`SharedBufferPool`]: a memory-mapped region carved into fixed-size slots.
//!   The region can be backed by a file (typically under `/dev/shm`) so that a
//!   receiving process and a processing process see the same bytes. Slot ids
//!   are the only handle that crosses the process boundary.
//! - [`DataBlockPool`]: a size-classed reuse pool for auxiliary buffers that
//!   processing stages allocate (compression output, scratch space). Blocks
//!   return themselves to the pool when dropped.
//!
//! # Ownership Model
//!
//! The slot pool does not track who owns a slot. Ownership is a partition kept
//! by the frame decoder: a slot id is either in the decoder's empty queue, or
//! mapped to a frame being filled, or leased to a completed frame via
//! [`SlotLease`]. Dropping the last lease sends the slot id on the release
//! channel supplied at lease time, which is how the id finds its way back to
//! the empty queue.
//!
//! # Example
//!
//! ```
//! use daq_pool::{DataBlockPool, SharedBufferPool};
//!
//! let slots = SharedBufferPool::anonymous(4096, 8).unwrap();
//! assert_eq!(slots.slot_count(), 8);
//!
//! let blocks = DataBlockPool::new(1024 * 1024);
//! let block = blocks.acquire(1000).unwrap();
//! assert!(block.capacity() >= 1000);
//! ```

pub mod block_pool;
pub mod error;
pub mod shared_buffer;

pub use block_pool::{DataBlockPool, PooledBlock, MIN_BLOCK_SIZE};
pub use error::PoolError;
pub use shared_buffer::{SharedBufferPool, SlotId, SlotLease, SlotView, SlotViewMut, HEADER_SIZE};
