//! Per-thread caches of recently freed regions.
//!
//! A thread cache keeps one bounded queue per small size class and per normal
//! size class up to a capacity limit. Frees land in the queue of their class
//! and the next allocation of that class pops them without touching the arena
//! locks. A buffer may be dropped on any thread and still return to the cache
//! of the thread that allocated it, so the queues are lock-free MPMC queues.
//!
//! Every `sweep_interval` allocations the cache trims each queue by the number
//! of entries it did not serve since the last trim.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::arena::{Allocation, Arena};
use crate::recycler::{Recycled, Recycler};
use crate::size_classes::{CHUNK_SIZE, SizeClass, SizeKind};

/// Default number of cached regions per small size class.
pub const DEFAULT_SMALL_CACHE_SIZE: usize = 256;
/// Default number of cached regions per normal size class.
pub const DEFAULT_NORMAL_CACHE_SIZE: usize = 32;
/// Default largest normal size class that is cached.
pub const DEFAULT_MAX_CACHED_BUFFER_CAPACITY: usize = 32 * 1024;
/// Default number of allocations between two trims.
pub const DEFAULT_CACHE_TRIM_INTERVAL: usize = 8192;

/// A cached region, recycled between uses.
#[derive(Default)]
pub(crate) struct CacheEntry {
    allocation: Option<Allocation>,
}

/// Recycler for cache entries, shared by every thread cache of an allocator.
pub(crate) type EntryRecycler = Recycler<CacheEntry>;

/// Creates the entry recycler.
pub(crate) fn entry_recycler(max_capacity_per_thread: usize, ratio: u32) -> Arc<EntryRecycler> {
    Arc::new(Recycler::with_limits(max_capacity_per_thread, ratio, CacheEntry::default))
}

/// Bounded queue of cached regions of one size class.
struct MemoryRegionCache {
    queue: ArrayQueue<Recycled<CacheEntry>>,
    size: usize,
    allocations: AtomicUsize,
}

impl MemoryRegionCache {
    fn new(size: usize) -> Self {
        let size = size.next_power_of_two();
        Self {
            queue: ArrayQueue::new(size),
            size,
            allocations: AtomicUsize::new(0),
        }
    }

    /// Queues a cached region. Hands the entry back when the queue is full.
    fn add(&self, entry: Recycled<CacheEntry>) -> Result<(), Recycled<CacheEntry>> {
        self.queue.push(entry)
    }

    /// Pops a cached region and counts the hit toward the next trim.
    fn allocate(&self) -> Option<Allocation> {
        let mut entry = self.queue.pop()?;
        let allocation = entry.allocation.take();
        self.allocations.fetch_add(1, Ordering::Relaxed);
        allocation
    }

    /// Returns up to `max` cached regions to their arena.
    fn free(&self, max: usize) -> usize {
        let mut freed = 0;
        while freed < max {
            let Some(mut entry) = self.queue.pop() else {
                break;
            };
            if let Some(allocation) = entry.allocation.take() {
                allocation.free(None);
            }
            freed += 1;
        }
        freed
    }

    /// Evicts the part of the queue that went unused since the last trim.
    ///
    /// A class that served `allocations` hits keeps at most that many
    /// entries: `size - allocations` are popped and returned to the arena,
    /// or all of them if the queue holds fewer. The hit count restarts from
    /// zero.
    fn trim(&self) -> usize {
        let allocations = self.allocations.swap(0, Ordering::Relaxed);
        self.free(self.size.saturating_sub(allocations))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// A thread's private front of one arena.
pub struct ThreadCache {
    arena: Arc<Arena>,
    small: Box<[MemoryRegionCache]>,
    normal: Box<[MemoryRegionCache]>,
    sweep_interval: usize,
    allocations: AtomicUsize,
    freed: AtomicBool,
    entries: Arc<EntryRecycler>,
}

impl ThreadCache {
    /// Creates a cache bound to `arena`.
    ///
    /// A zero cache size disables the corresponding tier. Normal classes
    /// larger than `max_cached_buffer_capacity` are never cached.
    pub(crate) fn new(
        arena: Arc<Arena>,
        small_cache_size: usize,
        normal_cache_size: usize,
        max_cached_buffer_capacity: usize,
        sweep_interval: usize,
        entries: Arc<EntryRecycler>,
    ) -> Self {
        let size_classes = Arc::clone(arena.size_classes());
        let n_small = size_classes.n_small();

        let small = if small_cache_size > 0 {
            (0..n_small).map(|_| MemoryRegionCache::new(small_cache_size)).collect()
        } else {
            Box::default()
        };

        let max = max_cached_buffer_capacity.min(CHUNK_SIZE);
        let normal = if normal_cache_size > 0 && max > 0 {
            (n_small..size_classes.len())
                .map(|idx| size_classes.size_of(idx))
                .take_while(|class| class.kind == SizeKind::Normal && class.size <= max)
                .map(|_| MemoryRegionCache::new(normal_cache_size))
                .collect()
        } else {
            Box::default()
        };

        arena.bind_thread_cache();
        log::debug!(
            "thread cache bound to arena {}: {} small and {} normal classes cached",
            arena.index(),
            small.len(),
            normal.len()
        );
        Self {
            arena,
            small,
            normal,
            sweep_interval: sweep_interval.max(1),
            allocations: AtomicUsize::new(0),
            freed: AtomicBool::new(false),
            entries,
        }
    }

    /// The arena this cache fronts.
    pub(crate) const fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    fn cache_for(&self, class: SizeClass) -> Option<&MemoryRegionCache> {
        match class.kind {
            SizeKind::Small => self.small.get(class.index),
            SizeKind::Normal => self.normal.get(class.index - self.arena.size_classes().n_small()),
            SizeKind::Huge => None,
        }
    }

    /// Pops a cached region of `class`.
    pub(crate) fn allocate(&self, class: SizeClass) -> Option<Allocation> {
        let cache = self.cache_for(class)?;
        let allocation = cache.allocate();
        if self.allocations.fetch_add(1, Ordering::Relaxed) + 1 >= self.sweep_interval {
            self.allocations.store(0, Ordering::Relaxed);
            self.trim();
        }
        if let Some(allocation) = &allocation {
            log::trace!("thread cache hit: {allocation:?}");
        }
        allocation
    }

    /// Offers a freed region to the cache, handing it back if the cache does
    /// not take it.
    pub(crate) fn add(&self, allocation: Allocation) -> Result<(), Allocation> {
        if self.freed.load(Ordering::Acquire) || !Arc::ptr_eq(allocation.arena(), &self.arena) {
            return Err(allocation);
        }
        let Some(cache) = self.cache_for(allocation.class()) else {
            return Err(allocation);
        };
        let mut entry = self.entries.get();
        entry.allocation = Some(allocation);
        match cache.add(entry) {
            Ok(()) => Ok(()),
            Err(mut entry) => entry.allocation.take().map_or(Ok(()), Err),
        }
    }

    /// Trims every queue, returning the number of regions released.
    pub(crate) fn trim(&self) -> usize {
        let released: usize = self
            .small
            .iter()
            .chain(self.normal.iter())
            .map(MemoryRegionCache::trim)
            .sum();
        if released > 0 {
            log::debug!(
                "thread cache of arena {} trimmed {released} regions",
                self.arena.index()
            );
        }
        released
    }

    /// Returns every cached region to the arena and unbinds from it.
    ///
    /// Only the first call has an effect; later frees bypass the cache.
    pub(crate) fn free(&self) -> usize {
        if self
            .freed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }
        let released = self.drain();
        self.arena.unbind_thread_cache();
        log::debug!(
            "thread cache of arena {} freed, {released} regions returned",
            self.arena.index()
        );
        released
    }

    fn drain(&self) -> usize {
        self.small
            .iter()
            .chain(self.normal.iter())
            .map(|cache| cache.free(usize::MAX))
            .sum()
    }

    /// Number of regions currently cached.
    #[cfg(test)]
    pub(crate) fn num_cached(&self) -> usize {
        self.small
            .iter()
            .chain(self.normal.iter())
            .map(MemoryRegionCache::len)
            .sum()
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        self.free();
        // Regions added by other threads while the cache was being freed.
        self.drain();
    }
}

impl fmt::Debug for ThreadCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadCache")
            .field("arena", &self.arena.index())
            .field("small", &self.small.len())
            .field("normal", &self.normal.len())
            .field("freed", &self.freed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::DefaultAllocator;
    use crate::recycler::{DEFAULT_MAX_CAPACITY_PER_THREAD, DEFAULT_RATIO};
    use crate::size_classes::{PAGE_SIZE, SizeClasses};
    use test_log::test;

    fn arena() -> Arc<Arena> {
        Arc::new(Arena::new(
            0,
            Arc::new(SizeClasses::new()),
            Arc::new(DefaultAllocator),
        ))
    }

    fn entries() -> Arc<EntryRecycler> {
        entry_recycler(DEFAULT_MAX_CAPACITY_PER_THREAD, DEFAULT_RATIO)
    }

    fn cache(arena: &Arc<Arena>, sweep_interval: usize) -> ThreadCache {
        ThreadCache::new(
            Arc::clone(arena),
            DEFAULT_SMALL_CACHE_SIZE,
            DEFAULT_NORMAL_CACHE_SIZE,
            DEFAULT_MAX_CACHED_BUFFER_CAPACITY,
            sweep_interval,
            entries(),
        )
    }

    #[test]
    fn test_cached_classes() {
        let arena = arena();
        let cache = cache(&arena, DEFAULT_CACHE_TRIM_INTERVAL);
        assert_eq!(cache.small.len(), 31);
        // 8K, 10K, 12K, 14K, 16K, 20K, 24K, 28K, 32K
        assert_eq!(cache.normal.len(), 9);
        assert_eq!(cache.small[0].size, 256);
        assert_eq!(arena.num_thread_caches(), 1);
        drop(cache);
        assert_eq!(arena.num_thread_caches(), 0);
    }

    #[test]
    fn test_cache_hit_skips_arena() {
        let arena = arena();
        let cache = cache(&arena, DEFAULT_CACHE_TRIM_INTERVAL);
        let first = arena.allocate(Some(&cache), 16 * 1024).unwrap();
        let offset = first.offset();
        first.free(Some(&cache));
        assert_eq!(cache.num_cached(), 1);
        assert_eq!(arena.metric().num_normal_deallocations, 0);

        let again = arena.allocate(Some(&cache), 15 * 1024).unwrap();
        assert_eq!(again.offset(), offset);
        assert_eq!(arena.metric().num_normal_allocations, 1);
        again.free(None);
        assert_eq!(arena.metric().num_normal_deallocations, 1);
    }

    #[test]
    fn test_large_normal_not_cached() {
        let arena = arena();
        let cache = cache(&arena, DEFAULT_CACHE_TRIM_INTERVAL);
        let big = arena.allocate(Some(&cache), 64 * 1024).unwrap();
        big.free(Some(&cache));
        assert_eq!(cache.num_cached(), 0);
        let huge = arena.allocate(Some(&cache), CHUNK_SIZE * 2).unwrap();
        huge.free(Some(&cache));
        assert_eq!(cache.num_cached(), 0);
        assert_eq!(arena.metric().num_huge_deallocations, 1);
    }

    #[test]
    fn test_full_queue_falls_back_to_arena() {
        let arena = arena();
        let cache = ThreadCache::new(Arc::clone(&arena), 2, 2, PAGE_SIZE, 1024, entries());
        let held: Vec<_> = (0..3).map(|_| arena.allocate(Some(&cache), PAGE_SIZE).unwrap()).collect();
        for allocation in held {
            allocation.free(Some(&cache));
        }
        assert_eq!(cache.num_cached(), 2);
        assert_eq!(arena.metric().num_normal_deallocations, 1);
    }

    #[test]
    fn test_foreign_arena_is_not_cached() {
        let a = arena();
        let b = arena();
        let cache = cache(&a, DEFAULT_CACHE_TRIM_INTERVAL);
        let allocation = b.allocate(None, 64).unwrap();
        allocation.free(Some(&cache));
        assert_eq!(cache.num_cached(), 0);
        assert_eq!(b.metric().num_small_deallocations, 1);
    }

    #[test]
    fn test_trim_evicts_unused_entries() {
        let arena = arena();
        let cache = ThreadCache::new(Arc::clone(&arena), 4, 4, PAGE_SIZE, 4, entries());
        let held: Vec<_> = (0..4).map(|_| arena.allocate(Some(&cache), 32).unwrap()).collect();
        for allocation in held {
            allocation.free(Some(&cache));
        }
        assert_eq!(cache.num_cached(), 4);

        // One hit, then three misses on another class reach the interval;
        // the 32-byte queue served one entry since the last trim and drops 3.
        let hit = arena.allocate(Some(&cache), 32).unwrap();
        for _ in 0..3 {
            arena.allocate(Some(&cache), 64).unwrap().free(None);
        }
        assert_eq!(cache.num_cached(), 0);
        hit.free(None);
    }

    #[test]
    fn test_free_flushes_once() {
        let arena = arena();
        let cache = cache(&arena, DEFAULT_CACHE_TRIM_INTERVAL);
        for size in [16, 512, PAGE_SIZE, 32 * 1024] {
            arena.allocate(Some(&cache), size).unwrap().free(Some(&cache));
        }
        assert_eq!(cache.num_cached(), 4);
        assert_eq!(cache.free(), 4);
        assert_eq!(cache.free(), 0);
        assert_eq!(arena.num_thread_caches(), 0);

        // A freed cache no longer absorbs regions.
        arena.allocate(None, 16).unwrap().free(Some(&cache));
        assert_eq!(cache.num_cached(), 0);
    }

    #[test]
    fn test_disabled_cache() {
        let arena = arena();
        let cache = ThreadCache::new(Arc::clone(&arena), 0, 0, 0, 1, entries());
        arena.allocate(Some(&cache), 16).unwrap().free(Some(&cache));
        assert_eq!(cache.num_cached(), 0);
        assert_eq!(arena.metric().num_small_deallocations, 1);
    }

    #[test]
    fn test_cross_thread_free_returns_to_owner_cache() {
        let arena = arena();
        let cache = cache(&arena, DEFAULT_CACHE_TRIM_INTERVAL);
        let allocation = arena.allocate(Some(&cache), 1024).unwrap();
        std::thread::scope(|s| {
            s.spawn(|| allocation.free(Some(&cache)));
        });
        assert_eq!(cache.num_cached(), 1);
    }
}
