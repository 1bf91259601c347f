//! Buddy-style run allocator over one chunk.
//!
//! A chunk is [`CHUNK_SIZE`] bytes split into pages. Free space is tracked as
//! runs of contiguous pages. Each free run is filed under the page class of
//! its length, rounded down, in a set ordered by packed handle so the lowest
//! offset comes first. An index keyed by the first and last page of every free
//! run lets a freed run find its neighbours in O(1) and merge with them.

use std::collections::{BTreeSet, HashMap};
use std::io::{Error, ErrorKind, Result};
use std::sync::Arc;

use crate::allocator::ChunkMemory;
use crate::chunk_list::ListId;
use crate::handle::Handle;
use crate::intrusive_list::{Linked, Links};
use crate::size_classes::{CHUNK_SIZE, PAGE_SHIFTS, SizeClasses, pages_for};

/// Index of a chunk in its arena.
pub type ChunkId = usize;

const TOTAL_PAGES: u32 = (CHUNK_SIZE >> PAGE_SHIFTS) as u32;

/// One pooled chunk and its free-run bookkeeping.
pub struct Chunk {
    memory: Arc<ChunkMemory>,
    size_classes: Arc<SizeClasses>,
    free_bytes: usize,
    runs_avail: Vec<BTreeSet<u64>>,
    runs_avail_map: HashMap<u32, Handle>,
    parent: Option<ListId>,
    links: Links,
}

impl Chunk {
    /// Wraps `memory`, which must be [`CHUNK_SIZE`] bytes, as one free run.
    pub fn new(memory: Arc<ChunkMemory>, size_classes: Arc<SizeClasses>) -> Self {
        debug_assert_eq!(memory.len(), CHUNK_SIZE);
        let runs_avail = vec![BTreeSet::new(); size_classes.n_page_classes()];
        let mut chunk = Self {
            memory,
            size_classes,
            free_bytes: CHUNK_SIZE,
            runs_avail,
            runs_avail_map: HashMap::new(),
            parent: None,
            links: Links::default(),
        };
        chunk.insert_avail_run(Handle::free_run(0, TOTAL_PAGES));
        chunk
    }

    /// Backing memory of the chunk.
    pub const fn memory(&self) -> &Arc<ChunkMemory> {
        &self.memory
    }

    /// Chunk list currently holding the chunk.
    pub const fn parent(&self) -> Option<ListId> {
        self.parent
    }

    pub(crate) fn set_parent(&mut self, parent: Option<ListId>) {
        self.parent = parent;
    }

    /// Bytes not covered by an allocated run.
    pub const fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Usage in percent, rounded so that any allocation reads at least 1.
    pub fn usage(&self) -> usize {
        if self.free_bytes == 0 {
            return 100;
        }
        let free_pct = self.free_bytes * 100 / CHUNK_SIZE;
        if free_pct == 0 { 99 } else { 100 - free_pct }
    }

    /// Allocates a run of at least `run_size` bytes.
    ///
    /// Returns `None` when no free run is large enough; the caller then tries
    /// another chunk.
    pub fn allocate_run(&mut self, run_size: usize) -> Option<Handle> {
        let pages = pages_for(run_size).max(1);
        let page_class = self.size_classes.pages_to_page_class(pages, false);
        if page_class >= self.runs_avail.len() {
            return None;
        }
        let pages = u32::try_from(pages).ok()?;
        let queue_idx = self.first_best_fit(page_class)?;

        let raw = self.runs_avail[queue_idx].pop_first()?;
        let run = Handle::unpack(raw);
        self.remove_avail_run_index(run);

        let allocated = self.split_large_run(run, pages);
        self.free_bytes -= (allocated.pages as usize) << PAGE_SHIFTS;
        log::trace!(
            "allocated run offset={} pages={} free_bytes={}",
            allocated.run_offset,
            allocated.pages,
            self.free_bytes
        );
        Some(allocated)
    }

    /// Returns a run to the chunk, merging it with free neighbours.
    ///
    /// Slab bits on `handle` are ignored; the whole run is freed. Returns the
    /// number of bytes released.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if the handle is outside the chunk, is not marked
    /// used, or overlaps a run that is already free.
    pub fn free(&mut self, handle: Handle) -> Result<usize> {
        let run = handle.run();
        if run.pages == 0 || run.end() > TOTAL_PAGES {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "run offset={} pages={} outside chunk of {TOTAL_PAGES} pages",
                    run.run_offset, run.pages
                ),
            ));
        }
        if !run.used {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("run at page {} is not in use", run.run_offset),
            ));
        }
        if self.runs_avail_map.contains_key(&run.run_offset)
            || self.runs_avail_map.contains_key(&run.last_page())
        {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("run at page {} is already free", run.run_offset),
            ));
        }

        let past = self.collapse_past(Handle::free_run(run.run_offset, run.pages));
        let merged = self.collapse_next(past);
        self.insert_avail_run(merged);

        let released = (run.pages as usize) << PAGE_SHIFTS;
        self.free_bytes += released;
        log::trace!(
            "freed run offset={} pages={} merged into offset={} pages={}",
            run.run_offset,
            run.pages,
            merged.run_offset,
            merged.pages
        );
        Ok(released)
    }

    /// First free-run queue at or above `page_class` that holds a run.
    ///
    /// An untouched chunk holds a single run spanning every page, filed in
    /// the last queue, so the scan is skipped.
    fn first_best_fit(&self, page_class: usize) -> Option<usize> {
        let n = self.runs_avail.len();
        if self.free_bytes == CHUNK_SIZE {
            return Some(n - 1);
        }
        (page_class..n).find(|&i| !self.runs_avail[i].is_empty())
    }

    /// Carves `need_pages` off the front of the free `run` and returns them
    /// as a used run. The tail, if any, is filed back as a free run.
    fn split_large_run(&mut self, run: Handle, need_pages: u32) -> Handle {
        let rem_pages = run.pages - need_pages;
        if rem_pages > 0 {
            self.insert_avail_run(Handle::free_run(run.run_offset + need_pages, rem_pages));
            Handle::used_run(run.run_offset, need_pages)
        } else {
            Handle::used_run(run.run_offset, run.pages)
        }
    }

    /// Merges `current` with the free runs ending right before it.
    ///
    /// The page before `current` is looked up in the boundary index; a hit
    /// is only a neighbor if that run ends exactly where `current` starts.
    /// Merged runs are unfiled; the caller files the result.
    fn collapse_past(&mut self, mut current: Handle) -> Handle {
        while current.run_offset > 0 {
            let Some(&past) = self.runs_avail_map.get(&(current.run_offset - 1)) else {
                break;
            };
            if past.end() != current.run_offset {
                break;
            }
            self.remove_avail_run(past);
            current = Handle::free_run(past.run_offset, past.pages + current.pages);
        }
        current
    }

    /// Merges `current` with the free runs starting right after it.
    fn collapse_next(&mut self, mut current: Handle) -> Handle {
        loop {
            let Some(&next) = self.runs_avail_map.get(&current.end()) else {
                break;
            };
            if next.run_offset != current.end() {
                break;
            }
            self.remove_avail_run(next);
            current = Handle::free_run(current.run_offset, current.pages + next.pages);
        }
        current
    }

    /// Free runs are filed by the largest page class they can fully serve.
    fn queue_of(&self, pages: u32) -> usize {
        self.size_classes.pages_to_page_class(pages as usize, true)
    }

    /// Files a free run in its queue and indexes both of its boundary pages.
    fn insert_avail_run(&mut self, run: Handle) {
        let queue = self.queue_of(run.pages);
        self.runs_avail[queue].insert(run.pack());
        self.runs_avail_map.insert(run.run_offset, run);
        if run.pages > 1 {
            self.runs_avail_map.insert(run.last_page(), run);
        }
    }

    fn remove_avail_run(&mut self, run: Handle) {
        let queue = self.queue_of(run.pages);
        self.runs_avail[queue].remove(&run.pack());
        self.remove_avail_run_index(run);
    }

    fn remove_avail_run_index(&mut self, run: Handle) {
        self.runs_avail_map.remove(&run.run_offset);
        if run.pages > 1 {
            self.runs_avail_map.remove(&run.last_page());
        }
    }

    /// Free runs ordered by offset.
    #[cfg(test)]
    pub(crate) fn free_runs(&self) -> Vec<Handle> {
        let mut runs: Vec<Handle> = self
            .runs_avail
            .iter()
            .flat_map(|q| q.iter().map(|&raw| Handle::unpack(raw)))
            .collect();
        runs.sort();
        runs
    }

    /// Verifies the free-run structures against the runs the caller holds.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self, allocated: &[Handle]) {
        let free = self.free_runs();
        for (queue, runs) in self.runs_avail.iter().enumerate() {
            for &raw in runs {
                let run = Handle::unpack(raw);
                assert!(!run.used, "free run marked used: {run:?}");
                assert_eq!(queue, self.queue_of(run.pages), "run filed in wrong class: {run:?}");
            }
        }

        let mut expected_index = HashMap::new();
        for &run in &free {
            expected_index.insert(run.run_offset, run);
            expected_index.insert(run.last_page(), run);
        }
        assert_eq!(self.runs_avail_map, expected_index, "offset index out of sync");

        let mut spans: Vec<(u32, u32)> = free
            .iter()
            .chain(allocated.iter())
            .map(|h| (h.run_offset, h.end()))
            .collect();
        spans.sort_unstable();
        let mut cursor = 0;
        for (start, end) in spans {
            assert_eq!(start, cursor, "gap or overlap at page {cursor}");
            cursor = end;
        }
        assert_eq!(cursor, TOTAL_PAGES);

        for pair in free.windows(2) {
            assert_ne!(pair[0].end(), pair[1].run_offset, "adjacent free runs not merged");
        }

        let used: usize = allocated.iter().map(|h| (h.pages as usize) << PAGE_SHIFTS).sum();
        assert_eq!(self.free_bytes, CHUNK_SIZE - used);
    }
}

impl Linked for Chunk {
    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("free_bytes", &self.free_bytes)
            .field("usage", &self.usage())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::DefaultAllocator;
    use crate::size_classes::PAGE_SIZE;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn new_chunk() -> Chunk {
        let memory = ChunkMemory::new(Arc::new(DefaultAllocator), CHUNK_SIZE).unwrap();
        Chunk::new(memory, Arc::new(SizeClasses::new()))
    }

    #[test]
    fn test_initial_state() {
        let chunk = new_chunk();
        assert_eq!(chunk.free_bytes(), CHUNK_SIZE);
        assert_eq!(chunk.usage(), 0);
        assert_eq!(chunk.free_runs(), vec![Handle::free_run(0, 512)]);
        chunk.check_invariants(&[]);
    }

    #[test]
    fn test_contiguous_runs() {
        let mut chunk = new_chunk();
        let a = chunk.allocate_run(32 * 1024).unwrap();
        let b = chunk.allocate_run(64 * 1024).unwrap();
        assert_eq!((a.run_offset, a.pages), (0, 4));
        assert_eq!((b.run_offset, b.pages), (4, 8));
        assert!(a.used && b.used);
        assert_eq!(chunk.free_bytes(), CHUNK_SIZE - 96 * 1024);
        chunk.check_invariants(&[a, b]);
    }

    #[test]
    fn test_non_page_multiple_rounds_up() {
        let mut chunk = new_chunk();
        let h = chunk.allocate_run(10 * 1024).unwrap();
        assert_eq!(h.pages, 2);
        chunk.check_invariants(&[h]);
    }

    #[test]
    fn test_free_coalesces_both_sides() {
        let mut chunk = new_chunk();
        let a = chunk.allocate_run(PAGE_SIZE).unwrap();
        let b = chunk.allocate_run(PAGE_SIZE).unwrap();
        let c = chunk.allocate_run(PAGE_SIZE).unwrap();
        chunk.free(a).unwrap();
        chunk.free(c).unwrap();
        chunk.check_invariants(&[b]);
        assert_eq!(chunk.free_runs().len(), 2);

        chunk.free(b).unwrap();
        assert_eq!(chunk.free_runs(), vec![Handle::free_run(0, 512)]);
        assert_eq!(chunk.free_bytes(), CHUNK_SIZE);
        chunk.check_invariants(&[]);
    }

    #[test]
    fn test_lowest_offset_preferred() {
        let mut chunk = new_chunk();
        let runs: Vec<_> = (0..6).map(|_| chunk.allocate_run(PAGE_SIZE).unwrap()).collect();
        chunk.free(runs[3]).unwrap();
        chunk.free(runs[1]).unwrap();
        let again = chunk.allocate_run(PAGE_SIZE).unwrap();
        assert_eq!(again.run_offset, 1);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut chunk = new_chunk();
        let whole = chunk.allocate_run(CHUNK_SIZE).unwrap();
        assert_eq!(whole.pages, 512);
        assert_eq!(chunk.usage(), 100);
        assert!(chunk.allocate_run(PAGE_SIZE).is_none());
        chunk.free(whole).unwrap();
        assert!(chunk.allocate_run(PAGE_SIZE).is_some());
    }

    #[test]
    fn test_free_rejects_bad_handles() {
        let mut chunk = new_chunk();
        let h = chunk.allocate_run(PAGE_SIZE).unwrap();

        let out_of_range = Handle::used_run(510, 8);
        assert_eq!(chunk.free(out_of_range).unwrap_err().kind(), ErrorKind::InvalidData);

        let unused = Handle::free_run(h.run_offset, h.pages);
        assert_eq!(chunk.free(unused).unwrap_err().kind(), ErrorKind::InvalidData);

        chunk.free(h).unwrap();
        assert_eq!(chunk.free(h).unwrap_err().kind(), ErrorKind::InvalidData);
        chunk.check_invariants(&[]);
    }

    #[test]
    fn test_usage_rounding() {
        let mut chunk = new_chunk();
        let h = chunk.allocate_run(PAGE_SIZE).unwrap();
        assert_eq!(chunk.usage(), 1);
        chunk.free(h).unwrap();
        let big = chunk.allocate_run(CHUNK_SIZE - PAGE_SIZE).unwrap();
        assert_eq!(chunk.usage(), 99);
        chunk.check_invariants(&[big]);
    }

    #[test]
    fn test_random_round_trip() {
        let sc = SizeClasses::new();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut chunk = new_chunk();
        let mut live = Vec::new();

        for step in 0..4000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let idx = rng.gen_range(31..60);
                let size = sc.size_of(idx).size;
                if let Some(h) = chunk.allocate_run(size) {
                    assert!(h.pages as usize * PAGE_SIZE >= size);
                    live.push(h);
                }
            } else {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                chunk.free(victim).unwrap();
            }
            if step % 97 == 0 {
                chunk.check_invariants(&live);
            }
        }

        for h in live.drain(..) {
            chunk.free(h).unwrap();
        }
        chunk.check_invariants(&[]);
        assert_eq!(chunk.free_bytes(), CHUNK_SIZE);
        assert_eq!(chunk.free_runs(), vec![Handle::free_run(0, 512)]);
    }
}
