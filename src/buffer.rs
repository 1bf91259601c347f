//! Buffer handles that return their region to the pool on drop.
//!
//! A [`PooledBuffer`] owns one region exclusively. Its bookkeeping lives in a
//! recycled object, so creating a buffer does not allocate once the recycler
//! is warm. A buffer can be frozen into a [`SharedBuffer`], a read-only handle
//! with an explicit reference count whose last release frees the region.

use std::fmt;
use std::io::{Error, ErrorKind, Result};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::arena::Allocation;
use crate::pool::AllocatorInner;
use crate::recycler::Recycled;
use crate::thread_cache::ThreadCache;

/// Recycled bookkeeping behind a [`PooledBuffer`].
#[derive(Default)]
pub(crate) struct BufferState {
    allocation: Option<Allocation>,
    cache: Option<Arc<ThreadCache>>,
    len: usize,
    max_capacity: usize,
    allocator: Option<Arc<AllocatorInner>>,
}

/// A uniquely owned region of pooled memory.
///
/// The visible length can change with [`set_capacity`](Self::set_capacity),
/// in place while it fits the backing region and by moving to a new region
/// otherwise. Dropping the buffer returns the region to the thread cache of
/// the thread that allocated it, or to its arena.
///
/// # Example
///
/// ```rust
/// use ruapc_bytepool::PooledAllocatorBuilder;
///
/// # fn main() -> std::io::Result<()> {
/// let allocator = PooledAllocatorBuilder::new().build();
/// let mut buffer = allocator.allocate(100, 1024)?;
/// assert_eq!(buffer.len(), 100);
/// assert_eq!(buffer.max_length(), 112);
///
/// buffer[0] = 42;
/// buffer.set_capacity(600)?;
/// assert_eq!(buffer[0], 42);
/// # Ok(())
/// # }
/// ```
pub struct PooledBuffer {
    state: Recycled<BufferState>,
}

impl PooledBuffer {
    pub(crate) fn new(
        mut state: Recycled<BufferState>,
        allocation: Allocation,
        cache: Option<Arc<ThreadCache>>,
        len: usize,
        max_capacity: usize,
        allocator: Arc<AllocatorInner>,
    ) -> Self {
        state.allocation = Some(allocation);
        state.cache = cache;
        state.len = len;
        state.max_capacity = max_capacity;
        state.allocator = Some(allocator);
        Self { state }
    }

    fn allocation(&self) -> &Allocation {
        match &self.state.allocation {
            Some(allocation) => allocation,
            None => unreachable!("buffer accessed after its region was released"),
        }
    }

    /// Byte offset of the region inside its chunk.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.allocation().offset()
    }

    /// Current length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.len
    }

    /// Returns `true` if the current length is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.len == 0
    }

    /// Length of the backing region; the buffer grows in place up to it.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.allocation().max_length()
    }

    /// Upper bound for [`set_capacity`](Self::set_capacity).
    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.state.max_capacity
    }

    /// Returns `false` for huge buffers backed by a dedicated block.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.allocation().is_pooled()
    }

    /// Returns the buffer as a byte slice.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the region is owned by this buffer and len <= max_length
        unsafe { std::slice::from_raw_parts(self.allocation().as_ptr().as_ptr(), self.state.len) }
    }

    /// Returns the buffer as a mutable byte slice.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.state.len;
        // SAFETY: the region is owned by this buffer, len <= max_length and
        // the exclusive borrow rules out other views
        unsafe { std::slice::from_raw_parts_mut(self.allocation().as_ptr().as_ptr(), len) }
    }

    /// Changes the length of the buffer, keeping the common prefix.
    ///
    /// Pooled buffers grow in place while `new_capacity` fits the backing
    /// region and shrink in place unless that would waste most of it.
    /// Anything else moves the contents to a new region.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `new_capacity` exceeds
    /// [`max_capacity`](Self::max_capacity), or the allocation error of the
    /// new region.
    pub fn set_capacity(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity > self.state.max_capacity {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "capacity {new_capacity} exceeds max capacity {}",
                    self.state.max_capacity
                ),
            ));
        }
        let len = self.state.len;
        if new_capacity == len {
            return Ok(());
        }
        if self.is_pooled() {
            let max_length = self.max_length();
            let in_place = if new_capacity > len {
                new_capacity <= max_length
            } else {
                new_capacity > max_length / 2 && (max_length > 512 || new_capacity > max_length - 16)
            };
            if in_place {
                self.state.len = new_capacity;
                return Ok(());
            }
        }
        self.reallocate(new_capacity)
    }

    /// Moves the contents to a fresh region of `new_capacity` bytes.
    pub(crate) fn reallocate(&mut self, new_capacity: usize) -> Result<()> {
        let cache = self
            .state
            .allocator
            .as_ref()
            .and_then(|allocator| allocator.thread_cache());
        let old = self.allocation();
        let new = old
            .arena()
            .reallocate(cache.as_deref(), old, self.state.len, new_capacity)?;
        log::trace!(
            "buffer moved from {} to {} bytes",
            old.max_length(),
            new.max_length()
        );

        let old_cache = std::mem::replace(&mut self.state.cache, cache);
        if let Some(old) = self.state.allocation.replace(new) {
            old.free(old_cache.as_deref());
        }
        self.state.len = new_capacity;
        Ok(())
    }

    /// Freezes the buffer into a reference-counted read-only handle.
    #[must_use]
    pub fn into_shared(mut self) -> SharedBuffer {
        let allocation = self.state.allocation.take();
        let ptr = allocation
            .as_ref()
            .map_or(NonNull::dangling(), Allocation::as_ptr);
        SharedBuffer {
            region: Arc::new(SharedRegion {
                ref_cnt: AtomicUsize::new(1),
                ptr,
                len: self.state.len,
                allocation: Mutex::new(allocation),
                cache: self.state.cache.take(),
            }),
            counted: true,
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let cache = self.state.cache.take();
        if let Some(allocation) = self.state.allocation.take() {
            allocation.free(cache.as_deref());
        }
        self.state.allocator = None;
        self.state.len = 0;
        self.state.max_capacity = 0;
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for PooledBuffer {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for PooledBuffer {
    #[inline]
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("offset", &self.offset())
            .field("len", &self.len())
            .field("max_length", &self.max_length())
            .field("max_capacity", &self.max_capacity())
            .finish_non_exhaustive()
    }
}

struct SharedRegion {
    ref_cnt: AtomicUsize,
    ptr: NonNull<u8>,
    len: usize,
    allocation: Mutex<Option<Allocation>>,
    cache: Option<Arc<ThreadCache>>,
}

// SAFETY: the region is only read while shared and is released once, after
// the last handle gave up its count.
unsafe impl Send for SharedRegion {}
// SAFETY: see above
unsafe impl Sync for SharedRegion {}

/// A read-only, reference-counted view of a pooled region.
///
/// Every handle holds one count. [`retain`](Self::retain) adds a handle and
/// dropping or [`release`](Self::release)-ing one gives its count back; the
/// region returns to the pool when the count reaches zero.
///
/// # Example
///
/// ```rust
/// use ruapc_bytepool::PooledAllocatorBuilder;
///
/// # fn main() -> std::io::Result<()> {
/// let allocator = PooledAllocatorBuilder::new().build();
/// let mut buffer = allocator.buffer(4)?;
/// buffer.copy_from_slice(b"ping");
///
/// let shared = buffer.into_shared();
/// let other = shared.retain()?;
/// assert_eq!(shared.ref_cnt(), 2);
/// assert!(!shared.release()?);
/// assert_eq!(&other[..], b"ping");
/// assert!(other.release()?);
/// # Ok(())
/// # }
/// ```
pub struct SharedBuffer {
    region: Arc<SharedRegion>,
    counted: bool,
}

impl SharedBuffer {
    /// Current reference count.
    #[must_use]
    pub fn ref_cnt(&self) -> usize {
        self.region.ref_cnt.load(Ordering::Acquire)
    }

    /// Adds a handle to the region.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if the count already reached zero or would
    /// overflow.
    pub fn retain(&self) -> Result<Self> {
        let ref_cnt = &self.region.ref_cnt;
        let mut current = ref_cnt.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return Err(Error::new(ErrorKind::InvalidData, "retained a released buffer"));
            }
            let next = current
                .checked_add(1)
                .ok_or_else(|| Error::new(ErrorKind::InvalidData, "reference count overflow"))?;
            match ref_cnt.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    return Ok(Self {
                        region: Arc::clone(&self.region),
                        counted: true,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Gives up this handle, returning `true` if it was the last one and the
    /// region went back to the pool.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if the count was already zero.
    pub fn release(mut self) -> Result<bool> {
        self.counted = false;
        self.release_ref()
    }

    fn release_ref(&self) -> Result<bool> {
        let ref_cnt = &self.region.ref_cnt;
        let mut current = ref_cnt.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return Err(Error::new(ErrorKind::InvalidData, "released a buffer twice"));
            }
            match ref_cnt.compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if current > 1 {
            return Ok(false);
        }
        if let Some(allocation) = self.region.allocation.lock().take() {
            allocation.free(self.region.cache.as_deref());
        }
        Ok(true)
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.region.len
    }

    /// Returns `true` if the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.region.len == 0
    }

    /// Returns the buffer as a byte slice.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: this handle holds a count, so the region is still allocated
        // and nobody writes to it while shared
        unsafe { std::slice::from_raw_parts(self.region.ptr.as_ptr(), self.region.len) }
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        if !self.counted {
            return;
        }
        if let Err(e) = self.release_ref() {
            log::error!("failed to release shared buffer: {e}");
        }
    }
}

impl Deref for SharedBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl AsRef<[u8]> for SharedBuffer {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len())
            .field("ref_cnt", &self.ref_cnt())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::{CHUNK_SIZE, PooledAllocator, PooledAllocatorBuilder};
    use std::io::ErrorKind;

    fn uncached() -> PooledAllocator {
        PooledAllocatorBuilder::new()
            .num_arenas(1)
            .use_cache_for_all_threads(false)
            .build()
    }

    #[test]
    fn test_buffer_basic_operations() {
        let allocator = uncached();
        let mut buffer = allocator.allocate(1000, 4096).unwrap();

        assert_eq!(buffer.len(), 1000);
        assert!(!buffer.is_empty());
        assert_eq!(buffer.max_length(), 1024);
        assert_eq!(buffer.max_capacity(), 4096);
        assert!(buffer.is_pooled());

        buffer[0] = 0xAB;
        buffer.as_mut_slice()[999] = 0xCD;
        assert_eq!(buffer.as_slice()[0], 0xAB);
        assert_eq!(buffer[999], 0xCD);
        assert!(format!("{buffer:?}").contains("PooledBuffer"));
    }

    #[test]
    fn test_grow_in_place_then_move() {
        let allocator = uncached();
        let mut buffer = allocator.allocate(100, 1 << 20).unwrap();
        for (i, byte) in buffer.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let offset = buffer.offset();

        buffer.set_capacity(112).unwrap();
        assert_eq!(buffer.offset(), offset);
        assert_eq!(buffer.len(), 112);

        buffer.set_capacity(20_000).unwrap();
        assert_eq!(buffer.len(), 20_000);
        assert_eq!(buffer.max_length(), 24 * 1024);
        assert!((0..100).all(|i| buffer[i] == i as u8));
    }

    #[test]
    fn test_shrink_rules() {
        let allocator = uncached();
        let mut buffer = allocator.allocate(1000, 4096).unwrap();
        let offset = buffer.offset();
        // More than half of a region above 512 bytes stays in place.
        buffer.set_capacity(600).unwrap();
        assert_eq!((buffer.offset(), buffer.max_length()), (offset, 1024));
        buffer.set_capacity(100).unwrap();
        assert_eq!(buffer.max_length(), 112);

        let mut small = allocator.allocate(64, 4096).unwrap();
        let offset = small.offset();
        small.set_capacity(50).unwrap();
        assert_eq!(small.offset(), offset);
        small.set_capacity(40).unwrap();
        assert_eq!(small.max_length(), 48);
    }

    #[test]
    fn test_capacity_limits() {
        let allocator = uncached();
        let err = allocator.allocate(100, 10).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let mut buffer = allocator.allocate(10, 100).unwrap();
        let err = buffer.set_capacity(101).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn test_huge_always_moves() {
        let allocator = uncached();
        let mut buffer = allocator.buffer(CHUNK_SIZE + 10).unwrap();
        assert!(!buffer.is_pooled());
        buffer[CHUNK_SIZE] = 9;
        buffer.set_capacity(CHUNK_SIZE + 1).unwrap();
        assert!(!buffer.is_pooled());
        assert_eq!(buffer[CHUNK_SIZE], 9);
        buffer.set_capacity(CHUNK_SIZE).unwrap();
        assert!(buffer.is_pooled());

        let metric = &allocator.metrics()[0];
        assert_eq!(metric.num_huge_allocations, 2);
        assert_eq!(metric.num_huge_deallocations, 2);
    }

    #[test]
    fn test_drop_returns_region() {
        let allocator = uncached();
        let buffer = allocator.buffer(PAGE).unwrap();
        let offset = buffer.offset();
        drop(buffer);
        assert_eq!(allocator.metrics()[0].num_normal_deallocations, 1);
        assert_eq!(allocator.buffer(PAGE).unwrap().offset(), offset);
    }

    const PAGE: usize = crate::PAGE_SIZE;

    #[test]
    fn test_shared_buffer_releases_once() {
        let allocator = uncached();
        let mut buffer = allocator.buffer(5).unwrap();
        buffer.copy_from_slice(b"hello");
        let shared = buffer.into_shared();
        assert_eq!(shared.ref_cnt(), 1);

        let clones: Vec<_> = (0..7).map(|_| shared.retain().unwrap()).collect();
        assert_eq!(shared.ref_cnt(), 8);
        std::thread::scope(|s| {
            for clone in clones {
                s.spawn(move || {
                    assert_eq!(&clone[..], b"hello");
                    drop(clone);
                });
            }
        });
        assert_eq!(shared.ref_cnt(), 1);
        assert_eq!(allocator.metrics()[0].num_small_deallocations, 0);

        assert!(shared.release().unwrap());
        assert_eq!(allocator.metrics()[0].num_small_deallocations, 1);
    }
}
