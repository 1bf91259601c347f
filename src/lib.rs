//! # ruapc-bytepool
//!
//! A pooled byte-buffer allocator with size classes, buddy-style page runs
//! inside 4 MiB chunks, slab subpages for small buffers and per-thread
//! caches. This crate is part of the [ruapc](https://github.com/SF-Zhou/ruapc) project.
//!
//! ## Features
//!
//! - **Size Classes**: slab classes from 16 bytes to 7 KiB, page runs from
//!   8 KiB to 4 MiB, dedicated blocks beyond that
//! - **Arenas**: Threads spread over several arenas, each with its own chunks
//! - **Thread Caches**: Freed regions are kept per thread and reused without
//!   touching the arena lock, even when freed from another thread
//! - **Object Recycling**: Buffer headers come from a per-thread [`Recycler`]
//! - **Shared Buffers**: Freeze a buffer into a reference-counted
//!   [`SharedBuffer`]
//! - **Custom Allocators**: Pluggable [`Allocator`] trait for the backing memory
//!
//! ## Example
//!
//! ```rust
//! use ruapc_bytepool::PooledAllocatorBuilder;
//!
//! # fn main() -> std::io::Result<()> {
//! let allocator = PooledAllocatorBuilder::new().num_arenas(2).build();
//!
//! // A 100-byte request is served from the 112-byte class.
//! let mut buffer = allocator.allocate(100, 4096)?;
//! assert_eq!(buffer.len(), 100);
//! assert_eq!(buffer.max_length(), 112);
//!
//! buffer[..5].copy_from_slice(b"hello");
//! buffer.set_capacity(2000)?;
//! assert_eq!(&buffer[..5], b"hello");
//!
//! // The region goes back to this thread's cache on drop.
//! drop(buffer);
//! # Ok(())
//! # }
//! ```
//!
//! ## Sharing Example
//!
//! ```rust
//! use ruapc_bytepool::PooledAllocator;
//!
//! # fn main() -> std::io::Result<()> {
//! let allocator = PooledAllocator::new();
//! let mut buffer = allocator.buffer(4)?;
//! buffer.copy_from_slice(b"ping");
//!
//! let shared = buffer.into_shared();
//! let other = shared.retain()?;
//! std::thread::spawn(move || assert_eq!(&other[..], b"ping"))
//!     .join()
//!     .unwrap();
//!
//! // The last release returns the region to the pool.
//! assert!(shared.release()?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(unsafe_op_in_unsafe_fn)]

mod allocator;
mod arena;
mod buffer;
mod chunk;
mod chunk_list;
mod fast_thread_local;
mod handle;
mod intrusive_list;
mod pool;
mod recycler;
mod size_classes;
mod subpage;
mod thread_cache;

pub use allocator::{Allocator, DefaultAllocator};
pub use arena::{ArenaMetric, ChunkListMetric};
pub use buffer::{PooledBuffer, SharedBuffer};
pub use fast_thread_local::FastThreadLocal;
pub use pool::{CALCULATE_THRESHOLD, DEFAULT_MAX_CAPACITY, PooledAllocator, PooledAllocatorBuilder};
pub use recycler::{Recycled, Recycler};
pub use size_classes::{
    CHUNK_SIZE, LOOKUP_MAX_SIZE, PAGE_SHIFTS, PAGE_SIZE, QUANTUM, SizeClass, SizeClasses, SizeKind,
};
pub use thread_cache::{
    DEFAULT_CACHE_TRIM_INTERVAL, DEFAULT_MAX_CACHED_BUFFER_CAPACITY, DEFAULT_NORMAL_CACHE_SIZE,
    DEFAULT_SMALL_CACHE_SIZE,
};
