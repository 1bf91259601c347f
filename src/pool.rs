//! Pooled allocator root and its builder.
//!
//! This module provides [`PooledAllocator`] and [`PooledAllocatorBuilder`].
//! The allocator owns a fixed set of arenas. Each thread is bound to the
//! least used arena on its first allocation and gets a thread cache in front
//! of it; the cache is flushed back to the arena when the thread exits.

use std::fmt;
use std::io::{Error, ErrorKind, Result};
use std::str::FromStr;
use std::sync::Arc;

use crate::allocator::{Allocator, DefaultAllocator};
use crate::arena::{Arena, ArenaMetric};
use crate::buffer::{BufferState, PooledBuffer};
use crate::fast_thread_local::FastThreadLocal;
use crate::recycler::{DEFAULT_MAX_CAPACITY_PER_THREAD, DEFAULT_RATIO, Recycler};
use crate::size_classes::{CHUNK_SIZE, SizeClasses};
use crate::thread_cache::{
    DEFAULT_CACHE_TRIM_INTERVAL, DEFAULT_MAX_CACHED_BUFFER_CAPACITY, DEFAULT_NORMAL_CACHE_SIZE,
    DEFAULT_SMALL_CACHE_SIZE, ThreadCache, entry_recycler,
};

/// Max capacity of buffers created by [`PooledAllocator::buffer`].
pub const DEFAULT_MAX_CAPACITY: usize = i32::MAX as usize;

/// Growth step above which [`PooledAllocator::calculate_new_capacity`] stops
/// doubling.
pub const CALCULATE_THRESHOLD: usize = CHUNK_SIZE;

const MIN_NEW_CAPACITY: usize = 64;

/// Builder for creating a [`PooledAllocator`] with custom configuration.
///
/// # Example
///
/// ```rust
/// use ruapc_bytepool::PooledAllocatorBuilder;
///
/// let allocator = PooledAllocatorBuilder::new()
///     .num_arenas(4)
///     .small_cache_size(128)
///     .build();
/// assert_eq!(allocator.num_arenas(), 4);
/// ```
pub struct PooledAllocatorBuilder {
    num_arenas: usize,
    small_cache_size: usize,
    normal_cache_size: usize,
    max_cached_buffer_capacity: usize,
    cache_trim_interval: usize,
    use_cache_for_all_threads: bool,
    max_recycled_per_thread: usize,
    recycle_ratio: u32,
    allocator: Box<dyn Allocator>,
}

impl Default for PooledAllocatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PooledAllocatorBuilder {
    /// Creates a new builder with default settings.
    ///
    /// Default settings:
    /// - Arenas: twice the available parallelism
    /// - Small cache size: 256 regions per class
    /// - Normal cache size: 32 regions per class, classes up to 32 KiB
    /// - Cache trim interval: 8192 allocations
    /// - Thread caches enabled for every thread
    /// - Recycler: 4096 objects per thread, one pooled object per 8 misses
    /// - Allocator: [`DefaultAllocator`]
    #[must_use]
    pub fn new() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            num_arenas: 2 * parallelism,
            small_cache_size: DEFAULT_SMALL_CACHE_SIZE,
            normal_cache_size: DEFAULT_NORMAL_CACHE_SIZE,
            max_cached_buffer_capacity: DEFAULT_MAX_CACHED_BUFFER_CAPACITY,
            cache_trim_interval: DEFAULT_CACHE_TRIM_INTERVAL,
            use_cache_for_all_threads: true,
            max_recycled_per_thread: DEFAULT_MAX_CAPACITY_PER_THREAD,
            recycle_ratio: DEFAULT_RATIO,
            allocator: Box::new(DefaultAllocator::new()),
        }
    }

    /// Creates a builder seeded from `RUAPC_BYTEPOOL_*` environment
    /// variables, falling back to the defaults for unset or unparsable ones.
    ///
    /// Recognized variables: `RUAPC_BYTEPOOL_NUM_ARENAS`,
    /// `RUAPC_BYTEPOOL_SMALL_CACHE_SIZE`, `RUAPC_BYTEPOOL_NORMAL_CACHE_SIZE`,
    /// `RUAPC_BYTEPOOL_MAX_CACHED_BUFFER_CAPACITY`,
    /// `RUAPC_BYTEPOOL_CACHE_TRIM_INTERVAL` and
    /// `RUAPC_BYTEPOOL_USE_CACHE_FOR_ALL_THREADS`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut builder = Self::new();
        env_override("RUAPC_BYTEPOOL_NUM_ARENAS", &mut builder.num_arenas);
        env_override("RUAPC_BYTEPOOL_SMALL_CACHE_SIZE", &mut builder.small_cache_size);
        env_override("RUAPC_BYTEPOOL_NORMAL_CACHE_SIZE", &mut builder.normal_cache_size);
        env_override(
            "RUAPC_BYTEPOOL_MAX_CACHED_BUFFER_CAPACITY",
            &mut builder.max_cached_buffer_capacity,
        );
        env_override("RUAPC_BYTEPOOL_CACHE_TRIM_INTERVAL", &mut builder.cache_trim_interval);
        env_override(
            "RUAPC_BYTEPOOL_USE_CACHE_FOR_ALL_THREADS",
            &mut builder.use_cache_for_all_threads,
        );
        builder
    }

    /// Sets the number of arenas. At least one arena is always created.
    #[must_use]
    pub const fn num_arenas(mut self, num_arenas: usize) -> Self {
        self.num_arenas = num_arenas;
        self
    }

    /// Sets the number of cached regions per small size class.
    #[must_use]
    pub const fn small_cache_size(mut self, size: usize) -> Self {
        self.small_cache_size = size;
        self
    }

    /// Sets the number of cached regions per normal size class.
    #[must_use]
    pub const fn normal_cache_size(mut self, size: usize) -> Self {
        self.normal_cache_size = size;
        self
    }

    /// Sets the largest normal size class kept in thread caches.
    #[must_use]
    pub const fn max_cached_buffer_capacity(mut self, capacity: usize) -> Self {
        self.max_cached_buffer_capacity = capacity;
        self
    }

    /// Sets the number of cache allocations between two trims.
    #[must_use]
    pub const fn cache_trim_interval(mut self, interval: usize) -> Self {
        self.cache_trim_interval = interval;
        self
    }

    /// Enables or disables thread caches. Disabled threads still bind to an
    /// arena but cache nothing.
    #[must_use]
    pub const fn use_cache_for_all_threads(mut self, enabled: bool) -> Self {
        self.use_cache_for_all_threads = enabled;
        self
    }

    /// Sets how many recycled objects each thread may keep.
    #[must_use]
    pub const fn max_recycled_per_thread(mut self, max: usize) -> Self {
        self.max_recycled_per_thread = max;
        self
    }

    /// Sets the recycler ratio: one pooled object per `ratio` misses.
    #[must_use]
    pub const fn recycle_ratio(mut self, ratio: u32) -> Self {
        self.recycle_ratio = ratio;
        self
    }

    /// Sets a custom allocator for the pool.
    ///
    /// The allocator provides the 4 MiB chunks and the dedicated blocks of
    /// huge buffers.
    #[must_use]
    pub fn allocator(mut self, allocator: Box<dyn Allocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Builds the allocator with the configured settings.
    #[must_use]
    pub fn build(self) -> PooledAllocator {
        let allocator: Arc<dyn Allocator> = Arc::from(self.allocator);
        let size_classes = Arc::new(SizeClasses::new());
        let arenas: Arc<[Arc<Arena>]> = (0..self.num_arenas.max(1))
            .map(|index| Arc::new(Arena::new(index, Arc::clone(&size_classes), Arc::clone(&allocator))))
            .collect();

        let (small, normal, max_cached) = if self.use_cache_for_all_threads {
            (
                self.small_cache_size,
                self.normal_cache_size,
                self.max_cached_buffer_capacity,
            )
        } else {
            (0, 0, 0)
        };
        let trim_interval = self.cache_trim_interval;
        let entries = entry_recycler(self.max_recycled_per_thread, self.recycle_ratio);

        let bound = Arc::clone(&arenas);
        let thread_cache = FastThreadLocal::with_removal(
            move || {
                Arc::new(ThreadCache::new(
                    least_used(&bound),
                    small,
                    normal,
                    max_cached,
                    trim_interval,
                    Arc::clone(&entries),
                ))
            },
            |cache: Arc<ThreadCache>| {
                cache.free();
            },
        );

        log::debug!(
            "pooled allocator built: {} arenas, thread caches {}",
            arenas.len(),
            if self.use_cache_for_all_threads { "enabled" } else { "disabled" }
        );
        PooledAllocator {
            inner: Arc::new(AllocatorInner {
                arenas,
                thread_cache,
                buffers: Recycler::with_limits(
                    self.max_recycled_per_thread,
                    self.recycle_ratio,
                    BufferState::default,
                ),
            }),
        }
    }
}

fn env_override<T: FromStr>(key: &str, slot: &mut T) {
    let Ok(value) = std::env::var(key) else {
        return;
    };
    match value.trim().parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => log::warn!("ignoring unparsable {key}={value:?}"),
    }
}

fn least_used(arenas: &[Arc<Arena>]) -> Arc<Arena> {
    // The builder always creates at least one arena.
    let arena = arenas.iter().min_by_key(|arena| arena.num_thread_caches());
    Arc::clone(arena.unwrap_or(&arenas[0]))
}

pub(crate) struct AllocatorInner {
    arenas: Arc<[Arc<Arena>]>,
    thread_cache: FastThreadLocal<Arc<ThreadCache>>,
    buffers: Recycler<BufferState>,
}

impl AllocatorInner {
    /// The current thread's cache, created on first use.
    pub(crate) fn thread_cache(&self) -> Option<Arc<ThreadCache>> {
        self.thread_cache.get()
    }
}

/// A pooled allocator of byte buffers.
///
/// Small requests (up to 7 KiB) are carved from slab pages,
/// normal requests up to 4 MiB from buddy runs inside 4 MiB chunks, and larger
/// requests get a dedicated block. Cloning the allocator is cheap and shares
/// the arenas.
///
/// # Example
///
/// ```rust
/// use ruapc_bytepool::PooledAllocatorBuilder;
///
/// # fn main() -> std::io::Result<()> {
/// let allocator = PooledAllocatorBuilder::new().num_arenas(1).build();
///
/// let mut buffer = allocator.buffer(32 * 1024)?;
/// buffer.fill(7);
/// assert_eq!(buffer.len(), 32 * 1024);
///
/// // Back to this thread's cache on drop.
/// drop(buffer);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PooledAllocator {
    inner: Arc<AllocatorInner>,
}

impl PooledAllocator {
    /// Creates an allocator with default settings.
    #[must_use]
    pub fn new() -> Self {
        PooledAllocatorBuilder::new().build()
    }

    /// Number of arenas.
    #[must_use]
    pub fn num_arenas(&self) -> usize {
        self.inner.arenas.len()
    }

    /// Allocates a buffer of `initial_capacity` bytes that may later grow up
    /// to `max_capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `initial_capacity > max_capacity`, or
    /// `OutOfMemory` if the backing allocator fails.
    pub fn allocate(&self, initial_capacity: usize, max_capacity: usize) -> Result<PooledBuffer> {
        if initial_capacity > max_capacity {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("initial capacity {initial_capacity} exceeds max capacity {max_capacity}"),
            ));
        }
        let cache = self.inner.thread_cache();
        let arena = match &cache {
            Some(cache) => Arc::clone(cache.arena()),
            None => least_used(&self.inner.arenas),
        };
        let allocation = arena.allocate(cache.as_deref(), initial_capacity)?;
        Ok(PooledBuffer::new(
            self.inner.buffers.get(),
            allocation,
            cache,
            initial_capacity,
            max_capacity,
            Arc::clone(&self.inner),
        ))
    }

    /// Allocates a buffer of `initial_capacity` bytes with
    /// [`DEFAULT_MAX_CAPACITY`].
    ///
    /// # Errors
    ///
    /// See [`allocate`](Self::allocate).
    pub fn buffer(&self, initial_capacity: usize) -> Result<PooledBuffer> {
        self.allocate(initial_capacity, DEFAULT_MAX_CAPACITY)
    }

    /// Moves `buffer` to a fresh region of `new_capacity` bytes, keeping the
    /// common prefix of its contents.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `new_capacity` exceeds the buffer's max
    /// capacity, or the allocation error of the new region. The buffer is
    /// dropped on error.
    pub fn reallocate(&self, mut buffer: PooledBuffer, new_capacity: usize) -> Result<PooledBuffer> {
        if new_capacity > buffer.max_capacity() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "capacity {new_capacity} exceeds max capacity {}",
                    buffer.max_capacity()
                ),
            ));
        }
        buffer.reallocate(new_capacity)?;
        Ok(buffer)
    }

    /// Computes the capacity to grow to so that at least `min_new_capacity`
    /// bytes fit.
    ///
    /// Below 4 MiB the capacity doubles from 64 bytes; above it grows in
    /// 4 MiB steps. The result never exceeds `max_capacity`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `min_new_capacity > max_capacity`.
    pub fn calculate_new_capacity(&self, min_new_capacity: usize, max_capacity: usize) -> Result<usize> {
        if min_new_capacity > max_capacity {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("min new capacity {min_new_capacity} exceeds max capacity {max_capacity}"),
            ));
        }
        let threshold = CALCULATE_THRESHOLD;
        if min_new_capacity == threshold {
            return Ok(threshold);
        }
        if min_new_capacity > threshold {
            let new_capacity = min_new_capacity / threshold * threshold;
            return Ok(if new_capacity > max_capacity.saturating_sub(threshold) {
                max_capacity
            } else {
                new_capacity + threshold
            });
        }
        let new_capacity = min_new_capacity.max(MIN_NEW_CAPACITY).next_power_of_two();
        Ok(new_capacity.min(max_capacity))
    }

    /// Trims the current thread's cache now instead of waiting for the trim
    /// interval. Returns `false` if the thread has no cache.
    pub fn trim_current_thread_cache(&self) -> bool {
        match self.inner.thread_cache.get_if_exists() {
            Some(cache) => {
                cache.trim();
                true
            }
            None => false,
        }
    }

    /// Per-arena counters and chunk-list usage.
    #[must_use]
    pub fn metrics(&self) -> Vec<ArenaMetric> {
        self.inner.arenas.iter().map(|arena| arena.metric()).collect()
    }
}

impl Default for PooledAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PooledAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledAllocator")
            .field("num_arenas", &self.num_arenas())
            .finish_non_exhaustive()
    }
}
