//! Run handles.
//!
//! A [`Handle`] describes one run of pages inside a chunk, or one slot of a
//! slab carved from such a run. It is plain metadata, never a pointer, and
//! packs into 64 bits:
//!
//! ```text
//!  63            49 48           34   33     32    31                0
//! +----------------+---------------+------+-------+-------------------+
//! | run offset (15)|  pages (15)   | used |subpage| bitmap index (32) |
//! +----------------+---------------+------+-------+-------------------+
//! ```
//!
//! Because the offset occupies the high bits, ordering packed values orders
//! runs by offset first.

const BITMAP_IDX_BITS: u32 = 32;
const FIELD_BITS: u32 = 15;
const FIELD_MASK: u64 = (1 << FIELD_BITS) - 1;

const IS_SUBPAGE_SHIFT: u32 = BITMAP_IDX_BITS;
const IS_USED_SHIFT: u32 = IS_SUBPAGE_SHIFT + 1;
const SIZE_SHIFT: u32 = IS_USED_SHIFT + 1;
const RUN_OFFSET_SHIFT: u32 = SIZE_SHIFT + FIELD_BITS;

/// Largest page offset or page count a handle can describe.
#[cfg(test)]
pub const MAX_RUN_PAGES: u32 = (1 << FIELD_BITS) - 1;

/// Typed view of a bit-packed run handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    /// First page of the run.
    pub run_offset: u32,
    /// Length of the run in pages.
    pub pages: u32,
    /// Whether the run is allocated.
    pub used: bool,
    /// Whether the handle addresses a slab slot inside the run.
    pub subpage: bool,
    /// Slab slot index; zero for plain runs.
    pub bitmap_idx: u32,
}

impl Handle {
    /// A free run.
    #[must_use]
    pub const fn free_run(run_offset: u32, pages: u32) -> Self {
        Self {
            run_offset,
            pages,
            used: false,
            subpage: false,
            bitmap_idx: 0,
        }
    }

    /// An allocated run.
    #[must_use]
    pub const fn used_run(run_offset: u32, pages: u32) -> Self {
        Self {
            run_offset,
            pages,
            used: true,
            subpage: false,
            bitmap_idx: 0,
        }
    }

    /// An allocated slab slot inside the run `run_offset..run_offset + pages`.
    #[must_use]
    pub const fn slab_slot(run_offset: u32, pages: u32, bitmap_idx: u32) -> Self {
        Self {
            run_offset,
            pages,
            used: true,
            subpage: true,
            bitmap_idx,
        }
    }

    /// The plain run this handle lives in, with the slab bits cleared.
    #[must_use]
    pub const fn run(self) -> Self {
        Self {
            subpage: false,
            bitmap_idx: 0,
            ..self
        }
    }

    /// Page one past the end of the run.
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.run_offset + self.pages
    }

    /// Last page of the run.
    #[must_use]
    pub const fn last_page(&self) -> u32 {
        self.run_offset + self.pages - 1
    }

    /// Encodes the handle.
    #[must_use]
    pub const fn pack(self) -> u64 {
        ((self.run_offset as u64 & FIELD_MASK) << RUN_OFFSET_SHIFT)
            | ((self.pages as u64 & FIELD_MASK) << SIZE_SHIFT)
            | ((self.used as u64) << IS_USED_SHIFT)
            | ((self.subpage as u64) << IS_SUBPAGE_SHIFT)
            | self.bitmap_idx as u64
    }

    /// Decodes a packed handle.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn unpack(raw: u64) -> Self {
        Self {
            run_offset: ((raw >> RUN_OFFSET_SHIFT) & FIELD_MASK) as u32,
            pages: ((raw >> SIZE_SHIFT) & FIELD_MASK) as u32,
            used: (raw >> IS_USED_SHIFT) & 1 == 1,
            subpage: (raw >> IS_SUBPAGE_SHIFT) & 1 == 1,
            bitmap_idx: raw as u32,
        }
    }
}

impl From<Handle> for u64 {
    fn from(handle: Handle) -> Self {
        handle.pack()
    }
}

impl From<u64> for Handle {
    fn from(raw: u64) -> Self {
        Self::unpack(raw)
    }
}
