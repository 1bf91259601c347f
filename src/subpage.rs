//! Bitmap slabs for small size classes.
//!
//! A [`SubPage`] splits one run of a chunk into equally sized elements and
//! tracks them with a bitmap. Subpages of the same element size are linked in
//! a [`SubpageRing`]; only subpages with a free element are linked, so the head
//! of the ring can always serve an allocation.

use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::sync::Arc;

use crate::allocator::ChunkMemory;
use crate::chunk::ChunkId;
use crate::handle::Handle;
use crate::intrusive_list::{IntrusiveList, Linked, Links, Slab};
use crate::size_classes::PAGE_SHIFTS;

/// One run carved into `elem_size` elements.
#[derive(Debug)]
pub struct SubPage {
    chunk: ChunkId,
    memory: Arc<ChunkMemory>,
    run: Handle,
    elem_size: usize,
    max_elements: usize,
    bitmap: Vec<u64>,
    num_avail: usize,
    next_avail: Option<u32>,
    links: Links,
}

impl SubPage {
    /// Creates a subpage over the used run `run` of chunk `chunk`.
    pub fn new(chunk: ChunkId, memory: Arc<ChunkMemory>, run: Handle, elem_size: usize) -> Self {
        let run_size = (run.pages as usize) << PAGE_SHIFTS;
        let max_elements = run_size / elem_size;
        Self {
            chunk,
            memory,
            run,
            elem_size,
            max_elements,
            bitmap: vec![0; max_elements.div_ceil(64)],
            num_avail: max_elements,
            next_avail: Some(0),
            links: Links::default(),
        }
    }

    /// Size of one element.
    #[cfg(test)]
    pub const fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Number of elements in the run.
    #[cfg(test)]
    pub const fn max_elements(&self) -> usize {
        self.max_elements
    }

    /// Number of free elements.
    #[cfg(test)]
    pub const fn num_avail(&self) -> usize {
        self.num_avail
    }

    /// The run backing this subpage.
    #[cfg(test)]
    pub const fn run(&self) -> Handle {
        self.run
    }

    /// Claims a free element and returns its index.
    pub fn allocate(&mut self) -> Option<u32> {
        if self.num_avail == 0 {
            return None;
        }
        let idx = match self.next_avail.take() {
            Some(idx) => idx,
            None => self.find_next_avail()?,
        };
        let (q, r) = (idx as usize >> 6, idx & 63);
        debug_assert_eq!(self.bitmap[q] & (1 << r), 0, "element {idx} already taken");
        self.bitmap[q] |= 1 << r;
        self.num_avail -= 1;
        Some(idx)
    }

    /// Releases element `idx`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if `idx` is out of range or not allocated.
    pub fn free(&mut self, idx: u32) -> Result<()> {
        if idx as usize >= self.max_elements {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("element {idx} outside subpage of {}", self.max_elements),
            ));
        }
        let (q, r) = (idx as usize >> 6, idx & 63);
        if self.bitmap[q] & (1 << r) == 0 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("element {idx} of {}-byte subpage is not allocated", self.elem_size),
            ));
        }
        self.bitmap[q] &= !(1 << r);
        self.next_avail = Some(idx);
        self.num_avail += 1;
        Ok(())
    }

    /// Byte offset of element `idx` inside the chunk.
    pub fn element_offset(&self, idx: u32) -> usize {
        ((self.run.run_offset as usize) << PAGE_SHIFTS) + idx as usize * self.elem_size
    }

    fn find_next_avail(&self) -> Option<u32> {
        self.bitmap.iter().enumerate().find_map(|(i, &bits)| {
            if bits == u64::MAX {
                return None;
            }
            let idx = (i << 6) + (!bits).trailing_zeros() as usize;
            if idx < self.max_elements {
                u32::try_from(idx).ok()
            } else {
                None
            }
        })
    }
}

impl Linked for SubPage {
    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

/// A slab slot handed out by a ring.
#[derive(Debug, Clone)]
pub struct SlabSlot {
    /// Chunk holding the run.
    pub chunk: ChunkId,
    /// Backing memory of that chunk.
    pub memory: Arc<ChunkMemory>,
    /// Handle with the slab bits set.
    pub handle: Handle,
    /// Byte offset of the element in the chunk.
    pub offset: usize,
}

/// All subpages of one element size.
#[derive(Debug)]
pub struct SubpageRing {
    elem_size: usize,
    subpages: Slab<SubPage>,
    by_run: HashMap<(ChunkId, u32), usize>,
    avail: IntrusiveList,
}

impl SubpageRing {
    /// Creates an empty ring for `elem_size` elements.
    pub fn new(elem_size: usize) -> Self {
        Self {
            elem_size,
            subpages: Slab::new(),
            by_run: HashMap::new(),
            avail: IntrusiveList::new(),
        }
    }

    /// Element size served by the ring.
    #[cfg(test)]
    pub const fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Number of live subpages, linked or full.
    #[cfg(test)]
    pub const fn len(&self) -> usize {
        self.subpages.len()
    }

    /// Returns `true` if the ring has no subpage.
    #[cfg(test)]
    pub const fn is_empty(&self) -> bool {
        self.subpages.is_empty()
    }

    /// Number of subpages with at least one free element.
    #[cfg(test)]
    pub const fn num_available(&self) -> usize {
        self.avail.len()
    }

    /// Allocates from the most recently linked subpage.
    pub fn allocate(&mut self) -> Option<SlabSlot> {
        let idx = self.avail.head()?;
        self.allocate_from(idx)
    }

    /// Links a fresh subpage and allocates its first element.
    pub fn insert(&mut self, subpage: SubPage) -> Option<SlabSlot> {
        debug_assert_eq!(subpage.elem_size, self.elem_size);
        let key = (subpage.chunk, subpage.run.run_offset);
        let idx = self.subpages.insert(subpage);
        self.by_run.insert(key, idx);
        self.avail.push_front(&mut self.subpages, idx);
        log::debug!(
            "subpage created: elem_size={} chunk={} run_offset={}",
            self.elem_size,
            key.0,
            key.1
        );
        self.allocate_from(idx)
    }

    fn allocate_from(&mut self, idx: usize) -> Option<SlabSlot> {
        let subpage = self.subpages.get_mut(idx)?;
        let bitmap_idx = subpage.allocate()?;
        let slot = SlabSlot {
            chunk: subpage.chunk,
            memory: Arc::clone(&subpage.memory),
            handle: Handle::slab_slot(subpage.run.run_offset, subpage.run.pages, bitmap_idx),
            offset: subpage.element_offset(bitmap_idx),
        };
        if subpage.num_avail == 0 {
            self.avail.remove(&mut self.subpages, idx);
        }
        Some(slot)
    }

    /// Releases a slab slot.
    ///
    /// Returns the run to give back to the chunk when the subpage became
    /// completely free and is not the only one left available in the ring.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if no subpage of this ring owns the handle, if
    /// `memory` is not the memory of that subpage's chunk, or if the element
    /// is not allocated.
    pub fn free(&mut self, chunk: ChunkId, memory: &Arc<ChunkMemory>, handle: Handle) -> Result<Option<Handle>> {
        let key = (chunk, handle.run_offset);
        let idx = *self.by_run.get(&key).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidData,
                format!("no {}-byte subpage at chunk {chunk} page {}", self.elem_size, handle.run_offset),
            )
        })?;
        let subpage = self
            .subpages
            .get_mut(idx)
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "subpage index is stale"))?;
        if !Arc::ptr_eq(&subpage.memory, memory) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("handle does not belong to chunk {chunk}"),
            ));
        }

        let was_full = subpage.num_avail == 0;
        subpage.free(handle.bitmap_idx)?;
        let (num_avail, max_elements, run) = (subpage.num_avail, subpage.max_elements, subpage.run);

        if was_full {
            self.avail.push_front(&mut self.subpages, idx);
            if max_elements > 1 {
                return Ok(None);
            }
        }
        if num_avail != max_elements || self.avail.len() == 1 {
            return Ok(None);
        }

        self.avail.remove(&mut self.subpages, idx);
        self.subpages.remove(idx);
        self.by_run.remove(&key);
        log::debug!(
            "subpage destroyed: elem_size={} chunk={chunk} run_offset={}",
            self.elem_size,
            run.run_offset
        );
        Ok(Some(run))
    }
}
