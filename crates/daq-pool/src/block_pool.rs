//! Size-classed reuse pool for auxiliary frame buffers.
//!
//! Processing stages that produce new data (compression output, reordered
//! pixels) need a buffer per frame. Allocating and freeing several megabytes
//! per frame at detector rates churns the allocator, so blocks are recycled
//! through this pool instead.
//!
//! # Design
//!
//! ```text
//! 1. acquire(size) rounds size up to a power-of-two class (>= 4 KiB)
//! 2. pops a free block of that class, or of the nearest larger class,
//!    from a lock-free queue, or
//! 3. allocates a new one if the high-water mark allows it
//! 4. the PooledBlock is filled and handed to a DataBlock
//! 5. dropping the PooledBlock pushes it back on its class queue
//! ```
//!
//! The pool never frees memory on its own: bytes allocated stay allocated for
//! the process lifetime, bounded by the high-water mark. Crossing the mark is
//! reported as [`PoolError::HighWaterExceeded`], a backpressure signal.

use crate::error::PoolError;
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Smallest size class in bytes.
pub const MIN_BLOCK_SIZE: usize = 4096;

/// One queue per power of two up to `usize::BITS`.
const NUM_CLASSES: usize = usize::BITS as usize;

fn class_size(size: usize) -> Option<usize> {
    size.max(MIN_BLOCK_SIZE).checked_next_power_of_two()
}

fn class_index(class_size: usize) -> usize {
    class_size.trailing_zeros() as usize
}

struct BlockPoolInner {
    /// Free blocks per size class
    free: Vec<SegQueue<Vec<u8>>>,
    /// Allocation ceiling in bytes
    high_water_bytes: usize,
    /// Bytes allocated so far (free + in use)
    allocated_bytes: AtomicUsize,
    /// Blocks currently sitting in free queues
    free_blocks: AtomicUsize,
    /// Metrics: fresh allocations
    total_allocations: AtomicU64,
    /// Metrics: successful acquires
    total_acquires: AtomicU64,
    /// Metrics: blocks returned
    total_returns: AtomicU64,
    /// Waiters in acquire_timeout park here
    wait_lock: Mutex<()>,
    released: Condvar,
}

impl BlockPoolInner {
    fn give_back(&self, buffer: Vec<u8>) {
        let class = buffer.len();
        self.free[class_index(class)].push(buffer);
        self.free_blocks.fetch_add(1, Ordering::Relaxed);
        self.total_returns.fetch_add(1, Ordering::Relaxed);

        let _guard = self.wait_lock.lock();
        self.released.notify_all();
    }
}

/// Reuse pool of variable-size blocks, keyed by power-of-two size class.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct DataBlockPool {
    inner: Arc<BlockPoolInner>,
}

impl std::fmt::Debug for DataBlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBlockPool")
            .field("high_water_bytes", &self.inner.high_water_bytes)
            .field("allocated_bytes", &self.allocated_bytes())
            .field("free_blocks", &self.free_blocks())
            .finish()
    }
}

impl DataBlockPool {
    /// Create a pool that will never hold more than `high_water_bytes`.
    #[must_use]
    pub fn new(high_water_bytes: usize) -> Self {
        Self {
            inner: Arc::new(BlockPoolInner {
                free: (0..NUM_CLASSES).map(|_| SegQueue::new()).collect(),
                high_water_bytes,
                allocated_bytes: AtomicUsize::new(0),
                free_blocks: AtomicUsize::new(0),
                total_allocations: AtomicU64::new(0),
                total_acquires: AtomicU64::new(0),
                total_returns: AtomicU64::new(0),
                wait_lock: Mutex::new(()),
                released: Condvar::new(),
            }),
        }
    }

    /// Create a pool without a ceiling.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Get a block of at least `size` bytes without waiting.
    ///
    /// Reuses a free block of the matching size class, or failing that the
    /// smallest free block of a larger class; otherwise allocates, unless that
    /// would cross the high-water mark. The returned block's length is `size`;
    /// its capacity is the size class of the block handed out.
    pub fn acquire(&self, size: usize) -> Result<PooledBlock, PoolError> {
        let class = class_size(size).ok_or(PoolError::HighWaterExceeded {
            requested: size,
            allocated: self.allocated_bytes(),
            high_water: self.inner.high_water_bytes,
        })?;

        if let Some(buffer) = self.pop_free(class) {
            self.inner.free_blocks.fetch_sub(1, Ordering::Relaxed);
            self.inner.total_acquires.fetch_add(1, Ordering::Relaxed);
            return Ok(PooledBlock {
                buffer,
                len: size,
                pool: Arc::clone(&self.inner),
            });
        }

        self.reserve(class)?;
        let buffer = vec![0u8; class];
        self.inner.total_allocations.fetch_add(1, Ordering::Relaxed);
        self.inner.total_acquires.fetch_add(1, Ordering::Relaxed);
        debug!(
            class,
            allocated_bytes = self.allocated_bytes(),
            "Block pool allocated new block"
        );

        Ok(PooledBlock {
            buffer,
            len: size,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Get a block, waiting up to `timeout` for one to be released when the
    /// pool is at its high-water mark.
    pub fn acquire_timeout(&self, size: usize, timeout: Duration) -> Result<PooledBlock, PoolError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.acquire(size) {
                Err(err) if err.is_backpressure() => {
                    let mut guard = self.inner.wait_lock.lock();
                    let block_free = class_size(size)
                        .map(|class| self.has_free(class))
                        .unwrap_or(false);
                    if block_free {
                        continue;
                    }
                    if self
                        .inner
                        .released
                        .wait_until(&mut guard, deadline)
                        .timed_out()
                    {
                        warn!(
                            size,
                            timeout_ms = timeout.as_millis(),
                            allocated_bytes = self.allocated_bytes(),
                            "Block pool acquire timed out - backpressure"
                        );
                        return Err(err);
                    }
                }
                other => return other,
            }
        }
    }

    /// Return a block to the pool. Equivalent to dropping it.
    pub fn release(&self, block: PooledBlock) {
        drop(block);
    }

    fn pop_free(&self, class: usize) -> Option<Vec<u8>> {
        self.inner.free[class_index(class)..]
            .iter()
            .find_map(SegQueue::pop)
    }

    fn has_free(&self, class: usize) -> bool {
        self.inner.free[class_index(class)..]
            .iter()
            .any(|queue| !queue.is_empty())
    }

    fn reserve(&self, class: usize) -> Result<(), PoolError> {
        let high_water = self.inner.high_water_bytes;
        let mut current = self.inner.allocated_bytes.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(class) {
                Some(next) if next <= high_water => next,
                _ => {
                    warn!(
                        requested = class,
                        allocated = current,
                        high_water,
                        "Block pool high-water mark reached - resource pressure"
                    );
                    return Err(PoolError::HighWaterExceeded {
                        requested: class,
                        allocated: current,
                        high_water,
                    });
                }
            };
            match self.inner.allocated_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Bytes allocated by the pool (free and in use).
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.inner.allocated_bytes.load(Ordering::Acquire)
    }

    /// Configured ceiling in bytes.
    #[must_use]
    pub fn high_water_bytes(&self) -> usize {
        self.inner.high_water_bytes
    }

    /// Blocks waiting in free queues.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.inner.free_blocks.load(Ordering::Relaxed)
    }

    /// Number of fresh allocations since creation.
    #[must_use]
    pub fn total_allocations(&self) -> u64 {
        self.inner.total_allocations.load(Ordering::Relaxed)
    }

    /// Number of successful acquires since creation.
    #[must_use]
    pub fn total_acquires(&self) -> u64 {
        self.inner.total_acquires.load(Ordering::Relaxed)
    }

    /// Number of blocks returned since creation.
    #[must_use]
    pub fn total_returns(&self) -> u64 {
        self.inner.total_returns.load(Ordering::Relaxed)
    }
}

/// A block on loan from a [`DataBlockPool`]. Returns itself on drop.
pub struct PooledBlock {
    /// Full class-sized allocation; `len` marks the valid prefix.
    buffer: Vec<u8>,
    len: usize,
    pool: Arc<BlockPoolInner>,
}

impl PooledBlock {
    /// Valid bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Valid bytes, mutable.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.len]
    }

    /// The whole allocation, for writers that learn the length afterwards.
    #[must_use]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Number of valid bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no bytes are valid.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size class of the allocation.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Set the number of valid bytes.
    pub fn set_len(&mut self, len: usize) -> Result<(), PoolError> {
        if len > self.capacity() {
            return Err(PoolError::LengthExceedsCapacity {
                len,
                capacity: self.capacity(),
            });
        }
        self.len = len;
        Ok(())
    }

    /// Address of the underlying allocation (identity checks in tests and metrics).
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.buffer.as_ptr()
    }
}

impl AsRef<[u8]> for PooledBlock {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for PooledBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBlock")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Drop for PooledBlock {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        if !buffer.is_empty() {
            self.pool.give_back(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_classes() {
        assert_eq!(class_size(1), Some(4096));
        assert_eq!(class_size(4096), Some(4096));
        assert_eq!(class_size(4097), Some(8192));
        assert_eq!(class_size(usize::MAX), None);
    }

    #[test]
    fn test_acquire_release_reuses_block() {
        let pool = DataBlockPool::unbounded();

        let block = pool.acquire(10_000).unwrap();
        let first_ptr = block.as_ptr();
        assert_eq!(block.len(), 10_000);
        assert_eq!(block.capacity(), 16384);
        pool.release(block);

        let block = pool.acquire(10_000).unwrap();
        assert_eq!(block.as_ptr(), first_ptr);
        assert_eq!(pool.total_allocations(), 1);
        assert_eq!(pool.total_acquires(), 2);
        assert_eq!(pool.total_returns(), 1);
    }

    #[test]
    fn test_smaller_request_reuses_same_class() {
        let pool = DataBlockPool::unbounded();
        let block = pool.acquire(9000).unwrap();
        let ptr = block.as_ptr();
        drop(block);

        let block = pool.acquire(16000).unwrap();
        assert_eq!(block.as_ptr(), ptr);
        assert_eq!(block.len(), 16000);
    }

    #[test]
    fn test_high_water_is_backpressure() {
        let pool = DataBlockPool::new(8192);
        let _a = pool.acquire(4096).unwrap();
        let _b = pool.acquire(4096).unwrap();
        let err = pool.acquire(4096).unwrap_err();
        assert!(err.is_backpressure());
        assert_eq!(pool.allocated_bytes(), 8192);
    }

    #[test]
    fn test_larger_free_block_reused_at_high_water() {
        let pool = DataBlockPool::new(8192);
        let block = pool.acquire(8000).unwrap();
        let ptr = block.as_ptr();
        drop(block);

        let block = pool.acquire(100).unwrap();
        assert_eq!(block.as_ptr(), ptr);
        assert_eq!(block.len(), 100);
        assert_eq!(block.capacity(), 8192);
        assert_eq!(pool.total_allocations(), 1);
        assert_eq!(pool.allocated_bytes(), 8192);
        drop(block);
        assert_eq!(pool.free_blocks(), 1);
    }

    #[test]
    fn test_matching_class_preferred_over_larger() {
        let pool = DataBlockPool::unbounded();
        let small = pool.acquire(4096).unwrap();
        let large = pool.acquire(10_000).unwrap();
        let small_ptr = small.as_ptr();
        drop(large);
        drop(small);

        let block = pool.acquire(100).unwrap();
        assert_eq!(block.as_ptr(), small_ptr);
        assert_eq!(block.capacity(), 4096);
    }

    #[test]
    fn test_acquire_timeout_wakes_for_larger_block() {
        let pool = DataBlockPool::new(16384);
        let held = pool.acquire(10_000).unwrap();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(held);
        });

        let block = pool
            .acquire_timeout(4096 + 1, Duration::from_secs(2))
            .unwrap();
        assert_eq!(block.capacity(), 16384);
        releaser.join().unwrap();
        assert_eq!(pool.total_allocations(), 1);
    }

    #[test]
    fn test_pool_never_shrinks() {
        let pool = DataBlockPool::new(1 << 20);
        let blocks: Vec<_> = (0..4).map(|_| pool.acquire(4096).unwrap()).collect();
        drop(blocks);
        assert_eq!(pool.allocated_bytes(), 4 * 4096);
        assert_eq!(pool.free_blocks(), 4);
    }

    #[test]
    fn test_acquire_timeout_waits_for_release() {
        let pool = DataBlockPool::new(4096);
        let held = pool.acquire(100).unwrap();

        let releaser = {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                drop(held);
            })
        };

        let block = pool
            .acquire_timeout(100, Duration::from_secs(2))
            .unwrap();
        assert_eq!(block.len(), 100);
        releaser.join().unwrap();
        assert_eq!(pool.total_allocations(), 1);
    }

    #[test]
    fn test_acquire_timeout_expires() {
        let pool = DataBlockPool::new(4096);
        let _held = pool.acquire(100).unwrap();
        let result = pool.acquire_timeout(100, Duration::from_millis(10));
        assert!(matches!(result, Err(PoolError::HighWaterExceeded { .. })));
    }

    #[test]
    fn test_set_len_bounds() {
        let pool = DataBlockPool::unbounded();
        let mut block = pool.acquire(10).unwrap();
        block.set_len(4096).unwrap();
        assert!(matches!(
            block.set_len(4097),
            Err(PoolError::LengthExceedsCapacity { .. })
        ));
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = DataBlockPool::new(8 * 4096);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut block = pool
                            .acquire_timeout(4096, Duration::from_secs(5))
                            .unwrap();
                        block.as_mut_slice()[0] = i as u8;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.allocated_bytes() <= 8 * 4096);
        assert_eq!(pool.total_acquires(), 800);
    }
}
