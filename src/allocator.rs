//! Backing memory for chunks.
//!
//! This module provides the [`Allocator`] trait that supplies the large blocks
//! carved up by the pool, [`DefaultAllocator`] which takes them from the
//! global heap, and [`ChunkMemory`], the owned block shared by a chunk and
//! every buffer pointing into it.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::fmt;
use std::io::{Error, ErrorKind, Result};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::size_classes::PAGE_SIZE;

/// Trait for backing memory providers.
///
/// A pooled chunk asks for [`CHUNK_SIZE`](crate::CHUNK_SIZE) bytes at a time,
/// a huge request asks for exactly its size. Memory handed out must be
/// zero-initialized.
///
/// # Safety
///
/// Implementations must ensure:
/// - `allocate` returns a pointer valid for reads and writes of `size` bytes
/// - the memory is zeroed
/// - `deallocate` is only called with pointers previously returned by `allocate`
///
/// # Example
///
/// ```rust
/// use ruapc_bytepool::{Allocator, DefaultAllocator};
/// use std::io::Result;
/// use std::ptr::NonNull;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// #[derive(Default)]
/// struct Counting {
///     inner: DefaultAllocator,
///     live: AtomicUsize,
/// }
///
/// impl Allocator for Counting {
///     fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
///         self.live.fetch_add(size, Ordering::Relaxed);
///         self.inner.allocate(size)
///     }
///
///     unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
///         self.live.fetch_sub(size, Ordering::Relaxed);
///         unsafe { self.inner.deallocate(ptr, size) }
///     }
/// }
/// ```
pub trait Allocator: Send + Sync {
    /// Allocates `size` zeroed bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero or unrepresentable size and
    /// `OutOfMemory` when the memory cannot be obtained.
    fn allocate(&self, size: usize) -> Result<NonNull<u8>>;

    /// Releases memory previously returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `ptr` was returned by `allocate` on this allocator
    /// - `size` matches the size passed to that call
    /// - the memory has not already been released
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize);
}

/// Allocator backed by the global heap.
///
/// Blocks are aligned to [`PAGE_SIZE`] so run offsets stay page aligned in
/// absolute terms as well.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAllocator;

impl DefaultAllocator {
    /// Creates a new default allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn layout(size: usize) -> Result<Layout> {
        Layout::from_size_align(size, PAGE_SIZE).map_err(|e| Error::new(ErrorKind::OutOfMemory, e))
    }
}

impl Allocator for DefaultAllocator {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "size must be > 0"));
        }
        let layout = Self::layout(size)?;

        // SAFETY: layout has a non-zero size and a power-of-two alignment
        let ptr = unsafe { alloc_zeroed(layout) };

        NonNull::new(ptr).ok_or_else(|| {
            Error::new(
                ErrorKind::OutOfMemory,
                format!("failed to allocate {size} bytes of backing memory"),
            )
        })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        if let Ok(layout) = Self::layout(size) {
            // SAFETY: ptr was allocated by allocate() with this same layout
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }
}

/// An owned block of backing memory.
///
/// A chunk holds one reference and every buffer carved from it holds another,
/// so the block outlives any handle that still points into it. The block is
/// returned to its [`Allocator`] when the last reference drops.
pub struct ChunkMemory {
    ptr: NonNull<u8>,
    len: usize,
    allocator: Arc<dyn Allocator>,
}

// SAFETY: ChunkMemory owns its block; concurrent access to disjoint regions is
// arbitrated by the pool, which never hands the same region to two owners.
unsafe impl Send for ChunkMemory {}
// SAFETY: see above
unsafe impl Sync for ChunkMemory {}

impl ChunkMemory {
    /// Allocates a block of `len` bytes from `allocator`.
    pub(crate) fn new(allocator: Arc<dyn Allocator>, len: usize) -> Result<Arc<Self>> {
        let ptr = allocator.allocate(len)?;
        Ok(Arc::new(Self {
            ptr,
            len,
            allocator,
        }))
    }

    /// Size of the block in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always `false`; zero-sized blocks are rejected on allocation.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to the byte at `offset`.
    ///
    /// # Safety
    ///
    /// `offset + len` must not exceed the block, and the caller must own the
    /// region for the lifetime of any reference built from the pointer.
    pub(crate) unsafe fn region(&self, offset: usize, len: usize) -> NonNull<u8> {
        debug_assert!(offset + len <= self.len, "region {offset}+{len} outside block of {}", self.len);
        // SAFETY: caller guarantees offset is within the block
        unsafe { self.ptr.add(offset) }
    }
}

impl Drop for ChunkMemory {
    fn drop(&mut self) {
        // SAFETY: ptr and len come from the matching allocate() call
        unsafe { self.allocator.deallocate(self.ptr, self.len) };
    }
}

impl fmt::Debug for ChunkMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkMemory")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Tracking {
        live: AtomicUsize,
    }

    impl Allocator for Tracking {
        fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
            self.live.fetch_add(size, Ordering::SeqCst);
            DefaultAllocator.allocate(size)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
            self.live.fetch_sub(size, Ordering::SeqCst);
            unsafe { DefaultAllocator.deallocate(ptr, size) };
        }
    }

    #[test]
    fn test_default_allocator_zeroed() {
        let allocator = DefaultAllocator::new();
        let size = 1024 * 1024;
        let ptr = allocator.allocate(size).unwrap();
        assert_eq!(ptr.as_ptr() as usize % PAGE_SIZE, 0);

        unsafe {
            let bytes = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            assert!(bytes.iter().all(|&b| b == 0));
            bytes[size - 1] = 0xAB;
            assert_eq!(bytes[size - 1], 0xAB);
            allocator.deallocate(ptr, size);
        }
    }

    #[test]
    fn test_default_allocator_zero_size() {
        let err = DefaultAllocator::new().allocate(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_default_allocator_unrepresentable_size() {
        let err = DefaultAllocator::new().allocate(usize::MAX - 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    }

    #[test]
    fn test_chunk_memory_released_with_last_reference() {
        let tracking = Arc::new(Tracking::default());
        let memory = ChunkMemory::new(tracking.clone(), 64 * 1024).unwrap();
        assert_eq!(tracking.live.load(Ordering::SeqCst), 64 * 1024);

        let buffer_ref = Arc::clone(&memory);
        drop(memory);
        assert_eq!(tracking.live.load(Ordering::SeqCst), 64 * 1024);
        assert_eq!(buffer_ref.len(), 64 * 1024);

        drop(buffer_ref);
        assert_eq!(tracking.live.load(Ordering::SeqCst), 0);
    }
}
