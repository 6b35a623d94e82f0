#![allow(unsafe_code)]
//! Memory-mapped slot pool shared between the receiving and processing sides.
//!
//! # Layout
//!
//! ```text
//! +-----------------------+  offset 0
//! | RegionHeader (64 B)   |  magic, slot_size, slot_count, generation
//! +-----------------------+  offset HEADER_SIZE
//! | slot 0                |
//! | slot 1                |
//! | ...                   |
//! | slot N-1              |
//! +-----------------------+  HEADER_SIZE + N * slot_size
//! ```
//!
//! The header uses `#[repr(C)]` so another process (or another language)
//! can attach with [`SharedBufferPool::open`] and find the slots.
//!
//! # Access Model
//!
//! - **Writers** (the frame decoder) fill a slot through
//!   [`SharedBufferPool::address_of_mut`]. Exclusivity comes from the
//!   decoder's empty-queue / frame-map partition, not from the pool.
//! - **Readers** (pipeline stages) access a completed slot through a
//!   [`SlotLease`], which is the only safe view. A lease keeps the mapping
//!   pinned: [`SharedBufferPool::configure`] refuses to re-carve while any
//!   lease is alive.
//! - Re-carving bumps the header generation so attached readers can notice
//!   that every previously issued slot id is void.

use crate::error::PoolError;
use crossbeam_channel::Sender;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::{RwLock, RwLockReadGuard};
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identifier of a slot inside the shared region.
pub type SlotId = usize;

/// Magic number for region header validation ("FDAQSLOT").
const MAGIC: u64 = 0x4644_4151_534C_4F54;

/// Size of the region header in bytes (one cache line).
pub const HEADER_SIZE: usize = 64;

/// Region header at offset 0 of the mapping.
///
/// Layout (64 bytes total):
/// - magic: u64 (8 bytes)
/// - slot_size: u64 (8 bytes)
/// - slot_count: u64 (8 bytes)
/// - generation: AtomicU64 (8 bytes)
/// - _padding: [u8; 32]
#[repr(C)]
struct RegionHeader {
    magic: u64,
    slot_size: u64,
    slot_count: u64,
    /// Incremented on every re-carve.
    generation: AtomicU64,
    _padding: [u8; 32],
}

const _: () = assert!(
    std::mem::size_of::<RegionHeader>() == HEADER_SIZE,
    "RegionHeader size must equal HEADER_SIZE (64 bytes)"
);

/// Where the mapping comes from.
enum Backing {
    File { path: PathBuf, file: File },
    Anonymous,
}

/// One carving of the region.
struct Mapping {
    #[expect(
        dead_code,
        reason = "mmap must be kept alive to maintain memory mapping validity"
    )]
    mmap: MmapMut,
    header: *mut RegionHeader,
    data_ptr: *mut u8,
    slot_size: usize,
    slot_count: usize,
}

// SAFETY: the raw pointers point into `mmap`, which is owned by the mapping and
// only replaced under the pool's write lock.
unsafe impl Send for Mapping {}
// SAFETY: shared access only reads the immutable geometry or goes through the
// documented slot ownership partition.
unsafe impl Sync for Mapping {}

impl Mapping {
    fn from_mmap(mut mmap: MmapMut) -> Result<Self, PoolError> {
        if mmap.len() < HEADER_SIZE {
            return Err(PoolError::BadRegion(format!(
                "mapping of {} bytes is smaller than the {} byte header",
                mmap.len(),
                HEADER_SIZE
            )));
        }
        let base = mmap.as_mut_ptr();
        let header = base as *mut RegionHeader;
        // SAFETY: mmap is at least HEADER_SIZE bytes and page aligned.
        let (magic, slot_size, slot_count) =
            unsafe { ((*header).magic, (*header).slot_size, (*header).slot_count) };
        if magic != MAGIC {
            return Err(PoolError::BadRegion(format!("bad magic {magic:#018x}")));
        }
        let slot_size = slot_size as usize;
        let slot_count = slot_count as usize;
        let needed = region_len(slot_size, slot_count)?;
        if mmap.len() < needed {
            return Err(PoolError::BadRegion(format!(
                "region is {} bytes but its header describes {} bytes",
                mmap.len(),
                needed
            )));
        }
        Ok(Self {
            mmap,
            header,
            // SAFETY: HEADER_SIZE is within the mapping (checked above).
            data_ptr: unsafe { base.add(HEADER_SIZE) },
            slot_size,
            slot_count,
        })
    }

    fn initialise(
        mut mmap: MmapMut,
        slot_size: usize,
        slot_count: usize,
        generation: u64,
    ) -> Result<Self, PoolError> {
        debug_assert!(mmap.len() >= HEADER_SIZE);
        let header = mmap.as_mut_ptr() as *mut RegionHeader;
        // SAFETY: the mapping was sized to hold the header plus all slots.
        unsafe {
            header.write(RegionHeader {
                magic: MAGIC,
                slot_size: slot_size as u64,
                slot_count: slot_count as u64,
                generation: AtomicU64::new(generation),
                _padding: [0; 32],
            });
        }
        Self::from_mmap(mmap)
    }

    fn generation(&self) -> u64 {
        // SAFETY: header points at the start of the live mapping.
        unsafe { (*self.header).generation.load(Ordering::Acquire) }
    }

    fn check_id(&self, id: SlotId) -> Result<(), PoolError> {
        if id >= self.slot_count {
            return Err(PoolError::InvalidSlotId {
                id,
                slot_count: self.slot_count,
            });
        }
        Ok(())
    }

    fn slot_ptr(&self, id: SlotId) -> *mut u8 {
        // SAFETY: callers check `id < slot_count`, so the offset is in bounds.
        unsafe { self.data_ptr.add(id * self.slot_size) }
    }
}

fn region_len(slot_size: usize, slot_count: usize) -> Result<usize, PoolError> {
    if slot_size == 0 || slot_count == 0 {
        return Err(PoolError::InvalidGeometry {
            slot_size,
            slot_count,
        });
    }
    slot_size
        .checked_mul(slot_count)
        .and_then(|bytes| bytes.checked_add(HEADER_SIZE))
        .ok_or(PoolError::InvalidGeometry {
            slot_size,
            slot_count,
        })
}

struct PoolInner {
    mapping: RwLock<Mapping>,
    backing: Backing,
    outstanding_leases: AtomicUsize,
    span: tracing::Span,
}

/// Shared memory region divided into fixed-size slots.
///
/// Cloning is cheap and yields another handle to the same region.
#[derive(Clone)]
pub struct SharedBufferPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for SharedBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mapping = self.inner.mapping.read();
        f.debug_struct("SharedBufferPool")
            .field("path", &self.path())
            .field("slot_size", &mapping.slot_size)
            .field("slot_count", &mapping.slot_count)
            .field("generation", &mapping.generation())
            .field("outstanding_leases", &self.outstanding_leases())
            .finish()
    }
}

impl SharedBufferPool {
    /// Create (or truncate) a file-backed region and carve it into slots.
    ///
    /// # Example
    /// ```no_run
    /// use daq_pool::SharedBufferPool;
    /// use std::path::Path;
    ///
    /// let pool = SharedBufferPool::create(Path::new("/dev/shm/frame_daq"), 8 << 20, 64).unwrap();
    /// assert_eq!(pool.slot_count(), 64);
    /// ```
    pub fn create(path: &Path, slot_size: usize, slot_count: usize) -> Result<Self, PoolError> {
        let total = region_len(slot_size, slot_count)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total as u64)?;

        // SAFETY: we own the freshly sized file; the mapping is kept with it.
        let mmap = unsafe { MmapOptions::new().len(total).map_mut(&file)? };
        let mapping = Mapping::initialise(mmap, slot_size, slot_count, 0)?;

        let span = tracing::info_span!("buffer_pool", path = %path.display());
        span.in_scope(|| {
            info!(
                slot_size,
                slot_count,
                total_mb = total as f64 / (1024.0 * 1024.0),
                "Shared buffer region created"
            );
        });

        Ok(Self::from_parts(
            mapping,
            Backing::File {
                path: path.to_path_buf(),
                file,
            },
            span,
        ))
    }

    /// Attach to a region created by another process.
    pub fn open(path: &Path) -> Result<Self, PoolError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // SAFETY: the file stays open for the lifetime of the mapping; the
        // header is validated before any slot is touched.
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let mapping = Mapping::from_mmap(mmap)?;

        let span = tracing::info_span!("buffer_pool", path = %path.display());
        span.in_scope(|| {
            info!(
                slot_size = mapping.slot_size,
                slot_count = mapping.slot_count,
                generation = mapping.generation(),
                "Attached to shared buffer region"
            );
        });

        Ok(Self::from_parts(
            mapping,
            Backing::File {
                path: path.to_path_buf(),
                file,
            },
            span,
        ))
    }

    /// Map an anonymous (process-private) region.
    ///
    /// Used when receiver and pipeline run in the same process, and in tests.
    pub fn anonymous(slot_size: usize, slot_count: usize) -> Result<Self, PoolError> {
        let total = region_len(slot_size, slot_count)?;
        let mmap = MmapOptions::new().len(total).map_anon()?;
        let mapping = Mapping::initialise(mmap, slot_size, slot_count, 0)?;
        let span = tracing::info_span!("buffer_pool", path = "anonymous");
        Ok(Self::from_parts(mapping, Backing::Anonymous, span))
    }

    fn from_parts(mapping: Mapping, backing: Backing, span: tracing::Span) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                mapping: RwLock::new(mapping),
                backing,
                outstanding_leases: AtomicUsize::new(0),
                span,
            }),
        }
    }

    /// Re-carve the region into `slot_count` slots of `slot_size` bytes.
    ///
    /// Every previously issued slot id becomes void; decoders using this pool
    /// must `drop_all_buffers` and be re-primed afterwards. Refused with
    /// [`PoolError::BufferPoolBusy`] while frames still hold slot leases. On
    /// any error the previous layout stays in place.
    pub fn configure(&self, slot_size: usize, slot_count: usize) -> Result<(), PoolError> {
        let _entered = self.inner.span.enter();
        let total = region_len(slot_size, slot_count)?;

        let mut mapping = self.inner.mapping.write();
        let outstanding = self.outstanding_leases();
        if outstanding > 0 {
            warn!(outstanding, "Refusing to re-carve buffer pool with live slot leases");
            return Err(PoolError::BufferPoolBusy { outstanding });
        }

        let generation = mapping.generation() + 1;
        let mmap = match &self.inner.backing {
            Backing::File { file, .. } => {
                file.set_len(total as u64)?;
                // SAFETY: the write lock excludes every reader and writer of the
                // old mapping, and no lease references it.
                unsafe { MmapOptions::new().len(total).map_mut(file)? }
            }
            Backing::Anonymous => MmapOptions::new().len(total).map_anon()?,
        };
        *mapping = Mapping::initialise(mmap, slot_size, slot_count, generation)?;

        info!(slot_size, slot_count, generation, "Buffer pool re-carved");
        Ok(())
    }

    /// Number of slots in the current layout.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.inner.mapping.read().slot_count
    }

    /// Size of each slot in bytes.
    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.inner.mapping.read().slot_size
    }

    /// Generation counter from the region header.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.mapping.read().generation()
    }

    /// Backing file path, `None` for anonymous regions.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.inner.backing {
            Backing::File { path, .. } => Some(path.as_path()),
            Backing::Anonymous => None,
        }
    }

    /// Number of slot leases currently held by frames.
    #[must_use]
    pub fn outstanding_leases(&self) -> usize {
        self.inner.outstanding_leases.load(Ordering::Acquire)
    }

    /// Read-only view of a whole slot.
    ///
    /// # Safety
    ///
    /// The caller must be the slot's current logical owner, or otherwise know
    /// that nobody writes the slot while the view is alive.
    pub unsafe fn address_of(&self, id: SlotId) -> Result<SlotView<'_>, PoolError> {
        let guard = self.inner.mapping.read();
        guard.check_id(id)?;
        let ptr = guard.slot_ptr(id);
        let len = guard.slot_size;
        Ok(SlotView {
            _guard: guard,
            ptr,
            len,
        })
    }

    /// Writable view of a whole slot.
    ///
    /// # Safety
    ///
    /// The caller must be the slot's only logical owner for the lifetime of
    /// the view (for a decoder: the id is mapped to the frame being filled and
    /// is in neither the empty queue nor any lease).
    pub unsafe fn address_of_mut(&self, id: SlotId) -> Result<SlotViewMut<'_>, PoolError> {
        let guard = self.inner.mapping.read();
        guard.check_id(id)?;
        let ptr = guard.slot_ptr(id);
        let len = guard.slot_size;
        Ok(SlotViewMut {
            _guard: guard,
            ptr,
            len,
        })
    }

    /// Hand the first `len` bytes of a filled slot to a frame.
    ///
    /// When the lease (and every clone of the frame holding it) is dropped, the
    /// slot id is sent on `release` so the owner of the empty queue can reuse it.
    pub fn lease(
        &self,
        id: SlotId,
        len: usize,
        release: Option<Sender<SlotId>>,
    ) -> Result<SlotLease, PoolError> {
        let guard = self.inner.mapping.read();
        guard.check_id(id)?;
        if len > guard.slot_size {
            return Err(PoolError::LengthExceedsSlot {
                len,
                slot_size: guard.slot_size,
            });
        }
        let ptr = guard.slot_ptr(id) as *const u8;
        let generation = guard.generation();
        // Counted while the read lock is held so configure() cannot slip in.
        self.inner.outstanding_leases.fetch_add(1, Ordering::AcqRel);
        drop(guard);

        Ok(SlotLease {
            pool: Arc::clone(&self.inner),
            id,
            ptr,
            len,
            generation,
            release,
        })
    }
}

/// Read-only view of one slot. Holds the layout read lock.
pub struct SlotView<'a> {
    _guard: RwLockReadGuard<'a, Mapping>,
    ptr: *mut u8,
    len: usize,
}

impl Deref for SlotView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr/len describe one slot of the mapping pinned by `_guard`.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// Writable view of one slot. Holds the layout read lock.
pub struct SlotViewMut<'a> {
    _guard: RwLockReadGuard<'a, Mapping>,
    ptr: *mut u8,
    len: usize,
}

impl Deref for SlotViewMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: see SlotView.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for SlotViewMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: exclusivity was promised by the caller of address_of_mut.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// A completed frame's claim on a slot.
///
/// Dropping the lease reports the slot id on its release channel.
pub struct SlotLease {
    pool: Arc<PoolInner>,
    id: SlotId,
    ptr: *const u8,
    len: usize,
    generation: u64,
    release: Option<Sender<SlotId>>,
}

// SAFETY: the lease is the slot's only owner; the mapping it points into cannot
// be replaced while `outstanding_leases` counts it.
unsafe impl Send for SlotLease {}
// SAFETY: the lease only hands out shared `&[u8]` views.
unsafe impl Sync for SlotLease {}

impl SlotLease {
    /// Slot id this lease holds.
    #[must_use]
    pub fn slot_id(&self) -> SlotId {
        self.id
    }

    /// Number of valid bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the lease covers no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Region generation at the time the lease was taken.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The leased bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len were bounds-checked at lease time and the mapping is
        // pinned until this lease is dropped.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl AsRef<[u8]> for SlotLease {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotLease")
            .field("slot_id", &self.id)
            .field("len", &self.len)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.pool.outstanding_leases.fetch_sub(1, Ordering::AcqRel);
        if let Some(release) = self.release.take() {
            if release.send(self.id).is_err() {
                let _entered = self.pool.span.enter();
                debug!(slot_id = self.id, "Release channel closed; slot not returned");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_geometry() {
        let pool = SharedBufferPool::anonymous(1024, 4).unwrap();
        assert_eq!(pool.slot_size(), 1024);
        assert_eq!(pool.slot_count(), 4);
        assert_eq!(pool.generation(), 0);
        assert!(pool.path().is_none());
    }

    #[test]
    fn test_invalid_geometry_rejected() {
        assert!(matches!(
            SharedBufferPool::anonymous(0, 4),
            Err(PoolError::InvalidGeometry { .. })
        ));
        assert!(matches!(
            SharedBufferPool::anonymous(usize::MAX, 2),
            Err(PoolError::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn test_address_of_out_of_range() {
        let pool = SharedBufferPool::anonymous(64, 2).unwrap();
        let result = unsafe { pool.address_of(2) };
        assert!(matches!(
            result,
            Err(PoolError::InvalidSlotId { id: 2, slot_count: 2 })
        ));
    }

    #[test]
    fn test_write_then_lease() {
        let pool = SharedBufferPool::anonymous(64, 2).unwrap();
        {
            let mut slot = unsafe { pool.address_of_mut(1).unwrap() };
            slot[..5].copy_from_slice(b"hello");
        }
        let lease = pool.lease(1, 5, None).unwrap();
        assert_eq!(lease.as_slice(), b"hello");
        assert_eq!(pool.outstanding_leases(), 1);
        drop(lease);
        assert_eq!(pool.outstanding_leases(), 0);
    }

    #[test]
    fn test_slots_do_not_overlap() {
        let pool = SharedBufferPool::anonymous(16, 3).unwrap();
        for id in 0..3 {
            let mut slot = unsafe { pool.address_of_mut(id).unwrap() };
            slot.fill(id as u8 + 1);
        }
        for id in 0..3 {
            let slot = unsafe { pool.address_of(id).unwrap() };
            assert!(slot.iter().all(|&b| b == id as u8 + 1));
        }
    }

    #[test]
    fn test_lease_length_checked() {
        let pool = SharedBufferPool::anonymous(16, 1).unwrap();
        assert!(matches!(
            pool.lease(0, 17, None),
            Err(PoolError::LengthExceedsSlot { len: 17, slot_size: 16 })
        ));
        assert_eq!(pool.outstanding_leases(), 0);
    }

    #[test]
    fn test_lease_drop_sends_release() {
        let pool = SharedBufferPool::anonymous(16, 4).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let lease = pool.lease(3, 8, Some(tx)).unwrap();
        assert!(rx.try_recv().is_err());
        drop(lease);
        assert_eq!(rx.try_recv().unwrap(), 3);
    }

    #[test]
    fn test_configure_refused_while_leased() {
        let pool = SharedBufferPool::anonymous(16, 4).unwrap();
        let lease = pool.lease(0, 4, None).unwrap();
        assert!(matches!(
            pool.configure(32, 2),
            Err(PoolError::BufferPoolBusy { outstanding: 1 })
        ));
        // Prior layout intact
        assert_eq!(pool.slot_size(), 16);
        assert_eq!(pool.slot_count(), 4);

        drop(lease);
        pool.configure(32, 2).unwrap();
        assert_eq!(pool.slot_size(), 32);
        assert_eq!(pool.slot_count(), 2);
        assert_eq!(pool.generation(), 1);
    }

    #[test]
    fn test_configure_invalid_keeps_layout() {
        let pool = SharedBufferPool::anonymous(16, 4).unwrap();
        assert!(pool.configure(0, 4).unwrap_err().is_configuration());
        assert_eq!(pool.slot_size(), 16);
        assert_eq!(pool.generation(), 0);
    }

    #[test]
    fn test_file_backed_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slots");

        let writer = SharedBufferPool::create(&path, 128, 4).unwrap();
        {
            let mut slot = unsafe { writer.address_of_mut(2).unwrap() };
            slot[..4].copy_from_slice(&[1, 2, 3, 4]);
        }

        let reader = SharedBufferPool::open(&path).unwrap();
        assert_eq!(reader.slot_size(), 128);
        assert_eq!(reader.slot_count(), 4);
        let lease = reader.lease(2, 4, None).unwrap();
        assert_eq!(lease.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_pool");
        std::fs::write(&path, vec![0xAB; 256]).unwrap();
        assert!(matches!(
            SharedBufferPool::open(&path),
            Err(PoolError::BadRegion(_))
        ));
    }
}
