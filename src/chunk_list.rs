//! Usage-bucketed chunk lists.
//!
//! An arena keeps its pooled chunks in six lists chained by usage band:
//!
//! ```text
//! qInit -> q000 (1-50%) <-> q025 (25-75%) <-> q050 (50-100%) <-> q075 (75-100%) <-> q100 (100%)
//! ```
//!
//! Bands overlap, so a chunk only moves once it crosses the far edge of its
//! current band. A chunk that drops out of the bottom of `q000` is completely
//! free and is handed back to be destroyed.

use std::io::Result;

use crate::chunk::{Chunk, ChunkId};
use crate::handle::Handle;
use crate::intrusive_list::{IntrusiveList, Linked, Slab};
use crate::size_classes::CHUNK_SIZE;

/// Identifies one of the six usage bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListId {
    /// Fresh chunks, below 25% usage. Chunks never move down out of it.
    QInit,
    /// 1% to 50%.
    Q000,
    /// 25% to 75%.
    Q025,
    /// 50% to 100%.
    Q050,
    /// 75% to 100%.
    Q075,
    /// Fully used.
    Q100,
}

impl ListId {
    /// All bands, bottom to top.
    pub const ALL: [Self; 6] = [
        Self::QInit,
        Self::Q000,
        Self::Q025,
        Self::Q050,
        Self::Q075,
        Self::Q100,
    ];

    /// Search order for normal allocations; moderately used chunks first.
    pub const ALLOCATION_ORDER: [Self; 5] = [Self::Q050, Self::Q025, Self::Q000, Self::QInit, Self::Q075];

    const fn slot(self) -> usize {
        self as usize
    }
}

/// One usage band.
#[derive(Debug)]
pub struct ChunkList {
    min_usage: i32,
    max_usage: i32,
    max_capacity: usize,
    free_min_threshold: i64,
    free_max_threshold: i64,
    next: Option<ListId>,
    prev: Option<ListId>,
    chunks: IntrusiveList,
}

impl ChunkList {
    fn new(min_usage: i32, max_usage: i32, next: Option<ListId>, prev: Option<ListId>) -> Self {
        Self {
            min_usage,
            max_usage,
            max_capacity: max_capacity(min_usage),
            free_min_threshold: if max_usage == 100 {
                0
            } else {
                free_threshold(max_usage)
            },
            free_max_threshold: if min_usage == 100 {
                0
            } else {
                free_threshold(min_usage)
            },
            next,
            prev,
            chunks: IntrusiveList::new(),
        }
    }

    /// Lower usage bound in percent.
    pub const fn min_usage(&self) -> i32 {
        self.min_usage
    }

    /// Upper usage bound in percent.
    pub const fn max_usage(&self) -> i32 {
        self.max_usage
    }

    /// Largest run a chunk in this band can still be asked for.
    #[cfg(test)]
    pub const fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Number of chunks in the band.
    #[cfg(test)]
    pub const fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns `true` if the band holds no chunk.
    #[cfg(test)]
    pub const fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

fn max_capacity(min_usage: i32) -> usize {
    let min_usage = min_usage.max(1);
    if min_usage >= 100 {
        return 0;
    }
    // min_usage is in 1..100 here
    CHUNK_SIZE * (100 - min_usage.unsigned_abs() as usize) / 100
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn free_threshold(usage: i32) -> i64 {
    (CHUNK_SIZE as f64 * (100.0 - f64::from(usage) + 0.999_999_99) / 100.0) as i64
}

/// The six chained bands of an arena together with the chunks they hold.
#[derive(Debug)]
pub struct ChunkLists {
    lists: [ChunkList; 6],
    chunks: Slab<Chunk>,
}

impl Default for ChunkLists {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkLists {
    /// Creates the empty chain.
    pub fn new() -> Self {
        use ListId::{Q000, Q025, Q050, Q075, Q100, QInit};
        Self {
            lists: [
                ChunkList::new(i32::MIN, 25, Some(Q000), Some(QInit)),
                ChunkList::new(1, 50, Some(Q025), None),
                ChunkList::new(25, 75, Some(Q050), Some(Q000)),
                ChunkList::new(50, 100, Some(Q075), Some(Q025)),
                ChunkList::new(75, 100, Some(Q100), Some(Q050)),
                ChunkList::new(100, i32::MAX, None, Some(Q075)),
            ],
            chunks: Slab::new(),
        }
    }

    /// The band `id`.
    pub fn list(&self, id: ListId) -> &ChunkList {
        &self.lists[id.slot()]
    }

    /// Chunk at `id`, if it is still alive.
    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(id)
    }

    /// Number of live chunks.
    pub const fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Chunk ids held by band `id`, head first.
    pub fn chunk_ids(&self, id: ListId) -> Vec<ChunkId> {
        self.lists[id.slot()].chunks.indices(&self.chunks)
    }

    /// Tries every band in allocation order.
    pub fn allocate(&mut self, run_size: usize) -> Option<(ChunkId, Handle)> {
        ListId::ALLOCATION_ORDER
            .iter()
            .find_map(|&id| self.allocate_in(id, run_size))
    }

    /// Allocates a run from the first chunk of band `id` that has room.
    ///
    /// A chunk whose free bytes fall to the band's lower threshold is moved up.
    pub fn allocate_in(&mut self, id: ListId, run_size: usize) -> Option<(ChunkId, Handle)> {
        let list = &self.lists[id.slot()];
        if run_size > list.max_capacity {
            return None;
        }
        let free_min = list.free_min_threshold;
        let next = list.next;

        let mut cursor = list.chunks.head();
        while let Some(chunk_id) = cursor {
            let chunk = self.chunks.get_mut(chunk_id)?;
            cursor = chunk.links().next();
            let Some(handle) = chunk.allocate_run(run_size) else {
                continue;
            };
            if free_bytes(chunk) <= free_min {
                if let Some(next) = next {
                    self.lists[id.slot()].chunks.remove(&mut self.chunks, chunk_id);
                    self.add(next, chunk_id);
                }
            }
            return Some((chunk_id, handle));
        }
        None
    }

    /// Allocates a run from a fresh chunk, then files the chunk.
    ///
    /// The chunk is filed by its usage after the allocation, so a run larger
    /// than `qInit` accepts still lands in the right band. Returns `None` and
    /// drops the chunk if the run does not fit at all.
    pub fn allocate_new(&mut self, mut chunk: Chunk, run_size: usize) -> Option<(ChunkId, Handle)> {
        let handle = chunk.allocate_run(run_size)?;
        Some((self.insert(chunk), handle))
    }

    /// Takes ownership of a fresh chunk and files it starting at `qInit`.
    pub fn insert(&mut self, chunk: Chunk) -> ChunkId {
        let id = self.chunks.insert(chunk);
        self.add(ListId::QInit, id);
        id
    }

    /// Frees `handle` in chunk `id` and re-buckets the chunk.
    ///
    /// Returns the chunk, already unlinked, when it has become completely free
    /// below the bottom band and must be destroyed.
    ///
    /// # Errors
    ///
    /// Propagates invariant violations from [`Chunk::free`]; returns
    /// `InvalidData` when `id` is not a live chunk.
    pub fn free(&mut self, id: ChunkId, handle: Handle) -> Result<Option<Chunk>> {
        let chunk = self.chunks.get_mut(id).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("chunk {id} is not live"))
        })?;
        chunk.free(handle)?;
        let free = free_bytes(chunk);
        let Some(parent) = chunk.parent() else {
            return Ok(None);
        };

        let list = &self.lists[parent.slot()];
        if free <= list.free_max_threshold {
            return Ok(None);
        }
        let prev = list.prev;
        self.lists[parent.slot()].chunks.remove(&mut self.chunks, id);
        if let Some(chunk) = self.chunks.get_mut(id) {
            chunk.set_parent(None);
        }
        if self.move_down(prev, id) {
            Ok(None)
        } else {
            Ok(self.chunks.remove(id))
        }
    }

    /// Moves chunk `id` down from a band starting at `target`.
    ///
    /// Returns `false` when it falls off the bottom of the chain.
    fn move_down(&mut self, mut target: Option<ListId>, id: ChunkId) -> bool {
        let Some(free) = self.chunks.get(id).map(free_bytes) else {
            return false;
        };
        while let Some(list_id) = target {
            let list = &self.lists[list_id.slot()];
            if free > list.free_max_threshold {
                target = list.prev;
                continue;
            }
            self.add0(list_id, id);
            return true;
        }
        false
    }

    /// Files chunk `id` in band `id` or, if it is already too full for it,
    /// in the first band above that accepts it.
    fn add(&mut self, mut list_id: ListId, id: ChunkId) {
        let Some(free) = self.chunks.get(id).map(free_bytes) else {
            return;
        };
        loop {
            let list = &self.lists[list_id.slot()];
            match list.next {
                Some(next) if free <= list.free_min_threshold => list_id = next,
                _ => break,
            }
        }
        self.add0(list_id, id);
    }

    fn add0(&mut self, list_id: ListId, id: ChunkId) {
        if let Some(chunk) = self.chunks.get_mut(id) {
            chunk.set_parent(Some(list_id));
        }
        self.lists[list_id.slot()].chunks.push_front(&mut self.chunks, id);
    }

    /// Drops every chunk.
    pub fn clear(&mut self) -> usize {
        for list in &mut self.lists {
            list.chunks = IntrusiveList::new();
        }
        self.chunks.drain().count()
    }
}

fn free_bytes(chunk: &Chunk) -> i64 {
    i64::try_from(chunk.free_bytes()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{ChunkMemory, DefaultAllocator};
    use crate::size_classes::{PAGE_SIZE, SizeClasses};
    use std::sync::Arc;

    fn new_chunk() -> Chunk {
        let memory = ChunkMemory::new(Arc::new(DefaultAllocator), CHUNK_SIZE).unwrap();
        Chunk::new(memory, Arc::new(SizeClasses::new()))
    }

    fn used_chunk(bytes: usize) -> Chunk {
        let mut chunk = new_chunk();
        chunk.allocate_run(bytes).unwrap();
        chunk
    }

    fn parent(lists: &ChunkLists, id: ChunkId) -> Option<ListId> {
        lists.chunk(id).and_then(Chunk::parent)
    }

    #[test]
    fn test_thresholds() {
        let lists = ChunkLists::new();
        let q000 = lists.list(ListId::Q000);
        assert_eq!(q000.max_capacity(), CHUNK_SIZE * 99 / 100);
        assert_eq!(q000.free_max_threshold, CHUNK_SIZE as i64 - 1);
        assert_eq!(lists.list(ListId::Q100).max_capacity(), 0);
        assert_eq!(lists.list(ListId::Q050).free_min_threshold, 0);
        assert!(lists.list(ListId::QInit).free_max_threshold > CHUNK_SIZE as i64);
        assert!(lists.list(ListId::Q100).free_min_threshold < 0);
        assert_eq!(lists.list(ListId::Q025).min_usage(), 25);
        assert_eq!(lists.list(ListId::Q025).max_usage(), 75);
    }

    #[test]
    fn test_new_chunk_lands_in_qinit() {
        let mut lists = ChunkLists::new();
        let id = lists.insert(new_chunk());
        assert_eq!(parent(&lists, id), Some(ListId::QInit));
        assert_eq!(lists.chunk_ids(ListId::QInit), vec![id]);
        assert_eq!(lists.num_chunks(), 1);
    }

    #[test]
    fn test_allocation_moves_chunk_up() {
        let mut lists = ChunkLists::new();
        let id = lists.insert(new_chunk());

        // 1 MiB brings usage to 25%: past qInit's far edge.
        let (got, _) = lists.allocate_in(ListId::QInit, 1024 * 1024).unwrap();
        assert_eq!(got, id);
        assert_eq!(parent(&lists, id), Some(ListId::Q000));

        lists.allocate_in(ListId::Q000, 1024 * 1024).unwrap();
        assert_eq!(parent(&lists, id), Some(ListId::Q025));
    }

    #[test]
    fn test_fresh_full_chunk_skips_bands() {
        let mut lists = ChunkLists::new();
        let mut chunk = new_chunk();
        chunk.allocate_run(CHUNK_SIZE).unwrap();
        let id = lists.insert(chunk);
        assert_eq!(parent(&lists, id), Some(ListId::Q100));
    }

    #[test]
    fn test_allocate_new_whole_chunk() {
        let mut lists = ChunkLists::new();
        assert!(lists.allocate(CHUNK_SIZE).is_none());
        let (id, handle) = lists.allocate_new(new_chunk(), CHUNK_SIZE).unwrap();
        assert_eq!(handle.pages, 512);
        assert_eq!(parent(&lists, id), Some(ListId::Q100));
        assert!(lists.allocate_new(new_chunk(), CHUNK_SIZE + PAGE_SIZE).is_none());
        assert_eq!(lists.num_chunks(), 1);
    }

    #[test]
    fn test_free_down_to_empty_destroys() {
        let mut lists = ChunkLists::new();
        let id = lists.insert(new_chunk());
        let (_, a) = lists.allocate_in(ListId::QInit, 2 * 1024 * 1024).unwrap();
        assert_eq!(parent(&lists, id), Some(ListId::Q025));
        let (_, b) = lists.allocate_in(ListId::Q025, PAGE_SIZE).unwrap();

        assert!(lists.free(id, a).unwrap().is_none());
        assert_eq!(parent(&lists, id), Some(ListId::Q000));

        let destroyed = lists.free(id, b).unwrap().unwrap();
        assert_eq!(destroyed.free_bytes(), CHUNK_SIZE);
        assert_eq!(lists.num_chunks(), 0);
        assert!(lists.list(ListId::Q000).is_empty());
    }

    #[test]
    fn test_qinit_chunk_never_destroyed() {
        let mut lists = ChunkLists::new();
        let id = lists.insert(new_chunk());
        let (_, h) = lists.allocate_in(ListId::QInit, PAGE_SIZE).unwrap();
        assert!(lists.free(id, h).unwrap().is_none());
        assert_eq!(parent(&lists, id), Some(ListId::QInit));
        assert_eq!(lists.num_chunks(), 1);
    }

    #[test]
    fn test_hysteresis_near_threshold() {
        let mut lists = ChunkLists::new();
        let id = lists.insert(new_chunk());
        let (_, big) = lists.allocate_in(ListId::QInit, 2 * 1024 * 1024).unwrap();
        assert_eq!(parent(&lists, id), Some(ListId::Q025));
        let (_, keep) = lists.allocate_in(ListId::Q025, PAGE_SIZE).unwrap();

        // Alternating small alloc/free around 50% stays in q025.
        for _ in 0..16 {
            let (_, h) = lists.allocate_in(ListId::Q025, 64 * 1024).unwrap();
            assert_eq!(parent(&lists, id), Some(ListId::Q025));
            lists.free(id, h).unwrap();
            assert_eq!(parent(&lists, id), Some(ListId::Q025));
        }
        lists.free(id, big).unwrap();
        assert_eq!(parent(&lists, id), Some(ListId::Q000));
        assert!(lists.free(id, keep).unwrap().is_some());
    }

    #[test]
    fn test_allocate_respects_max_capacity() {
        let mut lists = ChunkLists::new();
        let id = lists.insert(new_chunk());
        lists.allocate_in(ListId::QInit, 3 * 1024 * 1024).unwrap();
        assert_eq!(parent(&lists, id), Some(ListId::Q050));
        // q050 caps requests at half a chunk.
        assert!(lists.allocate_in(ListId::Q050, 3 * 1024 * 1024).is_none());
        assert!(lists.allocate(512 * 1024).is_some());
    }

    #[test]
    fn test_allocation_order() {
        let mib = 1024 * 1024;
        let mut lists = ChunkLists::new();
        let fresh = lists.insert(new_chunk());
        let quarter = lists.insert(used_chunk(mib));
        let half = lists.insert(used_chunk(2 * mib));
        let three_quarters = lists.insert(used_chunk(3 * mib));
        let mut chunk = used_chunk(7 * mib / 2);
        let tail = chunk.allocate_run(mib / 2).unwrap();
        let nearly_full = lists.insert(chunk);
        assert!(lists.free(nearly_full, tail).unwrap().is_none());

        assert_eq!(parent(&lists, fresh), Some(ListId::QInit));
        assert_eq!(parent(&lists, quarter), Some(ListId::Q000));
        assert_eq!(parent(&lists, half), Some(ListId::Q025));
        assert_eq!(parent(&lists, three_quarters), Some(ListId::Q050));
        assert_eq!(parent(&lists, nearly_full), Some(ListId::Q075));

        // Drain page by page and record which chunk served each run.
        let mut served = Vec::new();
        let mut pages = 0;
        while let Some((id, _)) = lists.allocate(PAGE_SIZE) {
            if served.last() != Some(&id) {
                served.push(id);
            }
            pages += 1;
        }
        assert_eq!(served, vec![three_quarters, half, quarter, fresh, nearly_full]);
        assert_eq!(pages, 128 + 256 + 384 + 512 + 64);
        assert_eq!(lists.chunk_ids(ListId::Q100).len(), 5);
    }

    #[test]
    fn test_free_unknown_chunk() {
        let mut lists = ChunkLists::new();
        let err = lists.free(3, Handle::used_run(0, 1)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_clear() {
        let mut lists = ChunkLists::new();
        lists.insert(new_chunk());
        lists.insert(new_chunk());
        assert_eq!(lists.clear(), 2);
        assert_eq!(lists.num_chunks(), 0);
        assert!(lists.list(ListId::QInit).is_empty());
    }
}
