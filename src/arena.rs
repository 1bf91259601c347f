//! Allocation dispatch across chunks, subpages and huge blocks.
//!
//! An arena owns a chain of chunk lists behind one lock and one subpage ring
//! per small size class, each behind its own lock. The arena lock is always
//! taken before a ring lock, never after. Huge requests bypass both and get a
//! dedicated block that is released as soon as it is freed.

use std::fmt;
use std::io::{Error, ErrorKind, Result};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::allocator::{Allocator, ChunkMemory};
use crate::chunk::{Chunk, ChunkId};
use crate::chunk_list::{ChunkLists, ListId};
use crate::handle::Handle;
use crate::size_classes::{CHUNK_SIZE, PAGE_SHIFTS, SizeClass, SizeClasses, SizeKind};
use crate::subpage::{SubPage, SubpageRing};
use crate::thread_cache::ThreadCache;

/// The chunk an allocation was carved from.
#[derive(Clone)]
pub enum ChunkRef {
    /// A chunk managed by the arena's chunk lists.
    Pooled {
        /// Slot of the chunk in its arena.
        id: ChunkId,
        /// Backing memory of the chunk.
        memory: Arc<ChunkMemory>,
    },
    /// A dedicated block serving one huge allocation.
    Unpooled {
        /// Backing memory of the block.
        memory: Arc<ChunkMemory>,
    },
}

impl ChunkRef {
    /// Backing memory.
    #[must_use]
    pub const fn memory(&self) -> &Arc<ChunkMemory> {
        match self {
            Self::Pooled { memory, .. } | Self::Unpooled { memory } => memory,
        }
    }

    /// Returns `true` for chunks managed by chunk lists.
    #[must_use]
    pub const fn is_pooled(&self) -> bool {
        matches!(self, Self::Pooled { .. })
    }
}

impl fmt::Debug for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pooled { id, .. } => write!(f, "Pooled({id})"),
            Self::Unpooled { memory } => write!(f, "Unpooled({})", memory.len()),
        }
    }
}

/// A region handed out by an arena.
///
/// Dropping an `Allocation` without freeing it leaks the region inside its
/// chunk until the arena is dropped.
pub struct Allocation {
    arena: Arc<Arena>,
    chunk: ChunkRef,
    handle: Handle,
    class: SizeClass,
    offset: usize,
    max_length: usize,
}

impl Allocation {
    /// Arena that owns the region.
    pub(crate) const fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// Size class of the region.
    pub(crate) const fn class(&self) -> SizeClass {
        self.class
    }

    /// Run handle of the region inside its chunk.
    #[cfg(test)]
    pub(crate) const fn handle(&self) -> Handle {
        self.handle
    }

    /// Byte offset of the region inside its chunk.
    pub(crate) const fn offset(&self) -> usize {
        self.offset
    }

    /// Usable length of the region.
    pub(crate) const fn max_length(&self) -> usize {
        self.max_length
    }

    /// Returns `true` unless the region is a dedicated huge block.
    pub(crate) const fn is_pooled(&self) -> bool {
        self.chunk.is_pooled()
    }

    /// Start of the region.
    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        // SAFETY: offset and max_length were produced by the arena for this
        // chunk and lie inside its memory.
        unsafe { self.chunk.memory().region(self.offset, self.max_length) }
    }

    /// Returns the region through `cache`, or straight to the arena.
    pub(crate) fn free(self, cache: Option<&ThreadCache>) {
        let arena = Arc::clone(&self.arena);
        if self.class.is_huge() {
            arena.free_huge(self);
            return;
        }
        let allocation = match cache {
            Some(cache) => match cache.add(self) {
                Ok(()) => return,
                Err(allocation) => allocation,
            },
            None => self,
        };
        if let Err(e) = arena.free_run(&allocation.chunk, allocation.handle, allocation.class) {
            log::error!("arena {}: failed to free {:?}: {e}", arena.index, allocation);
        }
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("arena", &self.arena.index)
            .field("chunk", &self.chunk)
            .field("handle", &self.handle)
            .field("size", &self.class.size)
            .field("offset", &self.offset)
            .field("max_length", &self.max_length)
            .finish()
    }
}

/// Usage snapshot of one chunk list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkListMetric {
    /// Lower usage bound in percent.
    pub min_usage: i32,
    /// Upper usage bound in percent.
    pub max_usage: i32,
    /// Usage in percent of every chunk in the list, head first.
    pub chunk_usages: Vec<usize>,
}

/// Counters and usage snapshot of one arena.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaMetric {
    /// Thread caches bound to the arena.
    pub num_thread_caches: usize,
    /// Live pooled chunks.
    pub num_chunks: usize,
    /// Small allocations served by the arena, cache hits excluded.
    pub num_small_allocations: usize,
    /// Normal allocations served by the arena, cache hits excluded.
    pub num_normal_allocations: usize,
    /// Huge allocations.
    pub num_huge_allocations: usize,
    /// Small regions returned to the arena.
    pub num_small_deallocations: usize,
    /// Normal regions returned to the arena.
    pub num_normal_deallocations: usize,
    /// Huge regions released.
    pub num_huge_deallocations: usize,
    /// The six chunk lists, `qInit` first.
    pub chunk_lists: Vec<ChunkListMetric>,
}

#[derive(Default)]
struct Counters {
    small_allocations: AtomicUsize,
    normal_allocations: AtomicUsize,
    huge_allocations: AtomicUsize,
    small_deallocations: AtomicUsize,
    normal_deallocations: AtomicUsize,
    huge_deallocations: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// A pool of chunks shared by the threads bound to it.
pub struct Arena {
    index: usize,
    size_classes: Arc<SizeClasses>,
    allocator: Arc<dyn Allocator>,
    lists: Mutex<ChunkLists>,
    rings: Box<[Mutex<SubpageRing>]>,
    num_thread_caches: AtomicUsize,
    counters: Counters,
}

impl Arena {
    /// Creates an empty arena drawing chunks from `allocator`.
    pub fn new(index: usize, size_classes: Arc<SizeClasses>, allocator: Arc<dyn Allocator>) -> Self {
        let rings = (0..size_classes.n_small())
            .map(|idx| Mutex::new(SubpageRing::new(size_classes.size_of(idx).size)))
            .collect();
        Self {
            index,
            size_classes,
            allocator,
            lists: Mutex::new(ChunkLists::new()),
            rings,
            num_thread_caches: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    /// Position of the arena in its allocator.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Size-class table shared with the arena's chunks.
    #[must_use]
    pub const fn size_classes(&self) -> &Arc<SizeClasses> {
        &self.size_classes
    }

    /// Thread caches currently bound to the arena.
    #[must_use]
    pub fn num_thread_caches(&self) -> usize {
        self.num_thread_caches.load(Ordering::Relaxed)
    }

    pub(crate) fn bind_thread_cache(&self) {
        self.num_thread_caches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unbind_thread_cache(&self) {
        self.num_thread_caches.fetch_sub(1, Ordering::Relaxed);
    }

    /// Allocates a region of at least `req_capacity` bytes, trying `cache`
    /// first for small and normal sizes. A cache bound to another arena is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` when a new chunk or huge block cannot be
    /// obtained from the backing allocator.
    pub(crate) fn allocate(self: &Arc<Self>, cache: Option<&ThreadCache>, req_capacity: usize) -> Result<Allocation> {
        let class = self.size_classes.classify(req_capacity);
        let cache = cache.filter(|cache| Arc::ptr_eq(cache.arena(), self));
        if !class.is_huge() {
            if let Some(allocation) = cache.and_then(|cache| cache.allocate(class)) {
                return Ok(allocation);
            }
        }
        match class.kind {
            SizeKind::Small => self.allocate_small(class),
            SizeKind::Normal => self.allocate_normal(class),
            SizeKind::Huge => self.allocate_huge(class),
        }
    }

    /// Allocates a region for `new_capacity` bytes and copies the first
    /// `copy_len` bytes of `old` into it. `old` stays allocated.
    ///
    /// # Errors
    ///
    /// Propagates allocation failures; `old` is untouched on error.
    pub(crate) fn reallocate(
        self: &Arc<Self>,
        cache: Option<&ThreadCache>,
        old: &Allocation,
        copy_len: usize,
        new_capacity: usize,
    ) -> Result<Allocation> {
        let new = self.allocate(cache, new_capacity)?;
        let len = copy_len.min(new_capacity).min(old.max_length);
        // SAFETY: both regions are live, owned by the caller and distinct,
        // and `len` fits in each of them.
        unsafe {
            std::ptr::copy_nonoverlapping(old.as_ptr().as_ptr(), new.as_ptr().as_ptr(), len);
        }
        Ok(new)
    }

    fn allocate_small(self: &Arc<Self>, class: SizeClass) -> Result<Allocation> {
        let ring = &self.rings[class.index];
        let found = ring.lock().allocate();
        let slot = match found {
            Some(slot) => slot,
            None => {
                let mut lists = self.lists.lock();
                let mut ring = ring.lock();
                match ring.allocate() {
                    Some(slot) => slot,
                    None => {
                        let run_size = self.size_classes.run_size_for(class.size);
                        let (id, run) = self.allocate_run(&mut lists, run_size)?;
                        let memory = Self::chunk_memory(&lists, id)?;
                        ring.insert(SubPage::new(id, memory, run, class.size))
                            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "fresh subpage has no room"))?
                    }
                }
            }
        };
        bump(&self.counters.small_allocations);
        Ok(Allocation {
            arena: Arc::clone(self),
            chunk: ChunkRef::Pooled {
                id: slot.chunk,
                memory: slot.memory,
            },
            handle: slot.handle,
            class,
            offset: slot.offset,
            max_length: class.size,
        })
    }

    fn allocate_normal(self: &Arc<Self>, class: SizeClass) -> Result<Allocation> {
        let (id, handle, memory) = {
            let mut lists = self.lists.lock();
            let (id, handle) = self.allocate_run(&mut lists, class.size)?;
            (id, handle, Self::chunk_memory(&lists, id)?)
        };
        bump(&self.counters.normal_allocations);
        Ok(Allocation {
            arena: Arc::clone(self),
            chunk: ChunkRef::Pooled { id, memory },
            handle,
            class,
            offset: (handle.run_offset as usize) << PAGE_SHIFTS,
            max_length: (handle.pages as usize) << PAGE_SHIFTS,
        })
    }

    fn allocate_huge(self: &Arc<Self>, class: SizeClass) -> Result<Allocation> {
        let memory = ChunkMemory::new(Arc::clone(&self.allocator), class.size)?;
        bump(&self.counters.huge_allocations);
        log::debug!("arena {}: huge block of {} bytes created", self.index, class.size);
        Ok(Allocation {
            arena: Arc::clone(self),
            chunk: ChunkRef::Unpooled { memory },
            handle: Handle::used_run(0, 0),
            class,
            offset: 0,
            max_length: class.size,
        })
    }

    /// Finds a run in the chunk lists, creating a chunk when none has room.
    fn allocate_run(&self, lists: &mut ChunkLists, run_size: usize) -> Result<(ChunkId, Handle)> {
        if let Some(found) = lists.allocate(run_size) {
            return Ok(found);
        }
        let memory = ChunkMemory::new(Arc::clone(&self.allocator), CHUNK_SIZE)?;
        let chunk = Chunk::new(memory, Arc::clone(&self.size_classes));
        let (id, handle) = lists.allocate_new(chunk, run_size).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("run of {run_size} bytes does not fit in a chunk"),
            )
        })?;
        log::debug!(
            "arena {}: chunk {id} created, {} live",
            self.index,
            lists.num_chunks()
        );
        Ok((id, handle))
    }

    fn chunk_memory(lists: &ChunkLists, id: ChunkId) -> Result<Arc<ChunkMemory>> {
        lists
            .chunk(id)
            .map(|chunk| Arc::clone(chunk.memory()))
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, format!("chunk {id} is not live")))
    }

    fn free_huge(&self, allocation: Allocation) {
        bump(&self.counters.huge_deallocations);
        log::debug!(
            "arena {}: huge block of {} bytes destroyed",
            self.index,
            allocation.max_length
        );
        drop(allocation);
    }

    /// Returns a pooled run or slab slot to its chunk.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if the chunk is not one of this arena's live
    /// chunks or the handle is not allocated in it.
    pub(crate) fn free_run(&self, chunk: &ChunkRef, handle: Handle, class: SizeClass) -> Result<()> {
        let ChunkRef::Pooled { id, memory } = chunk else {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "unpooled block passed as a pooled run",
            ));
        };

        if handle.subpage {
            let ring = self.rings.get(class.index).ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidData,
                    format!("size class {} has no subpage ring", class.index),
                )
            })?;
            let released = ring.lock().free(*id, memory, handle)?;
            bump(&self.counters.small_deallocations);
            match released {
                Some(run) => self.free_in_chunk(*id, memory, run),
                None => Ok(()),
            }
        } else {
            self.free_in_chunk(*id, memory, handle)?;
            bump(&self.counters.normal_deallocations);
            Ok(())
        }
    }

    fn free_in_chunk(&self, id: ChunkId, memory: &Arc<ChunkMemory>, handle: Handle) -> Result<()> {
        let destroyed = {
            let mut lists = self.lists.lock();
            let live = lists
                .chunk(id)
                .is_some_and(|chunk| Arc::ptr_eq(chunk.memory(), memory));
            if !live {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("chunk {id} is not live in arena {}", self.index),
                ));
            }
            lists.free(id, handle)?
        };
        if let Some(chunk) = destroyed {
            log::debug!("arena {}: chunk {id} destroyed", self.index);
            drop(chunk);
        }
        Ok(())
    }

    /// Counters and chunk-list usage.
    #[must_use]
    pub fn metric(&self) -> ArenaMetric {
        let load = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        let lists = self.lists.lock();
        let chunk_lists = ListId::ALL
            .iter()
            .map(|&id| {
                let list = lists.list(id);
                ChunkListMetric {
                    min_usage: list.min_usage(),
                    max_usage: list.max_usage(),
                    chunk_usages: lists
                        .chunk_ids(id)
                        .into_iter()
                        .filter_map(|chunk| lists.chunk(chunk).map(Chunk::usage))
                        .collect(),
                }
            })
            .collect();
        ArenaMetric {
            num_thread_caches: self.num_thread_caches(),
            num_chunks: lists.num_chunks(),
            num_small_allocations: load(&self.counters.small_allocations),
            num_normal_allocations: load(&self.counters.normal_allocations),
            num_huge_allocations: load(&self.counters.huge_allocations),
            num_small_deallocations: load(&self.counters.small_deallocations),
            num_normal_deallocations: load(&self.counters.normal_deallocations),
            num_huge_deallocations: load(&self.counters.huge_deallocations),
            chunk_lists,
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let chunks = self.lists.get_mut().clear();
        if chunks > 0 {
            log::debug!("arena {}: dropped with {chunks} chunks", self.index);
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("index", &self.index)
            .field("num_thread_caches", &self.num_thread_caches())
            .finish_non_exhaustive()
    }
}
