//! Size-class table.
//!
//! Every request is rounded up to one of a fixed set of canonical sizes. The
//! table starts at [`QUANTUM`] and is organised in groups of four entries that
//! share a stride; the stride doubles from one group to the next, so small
//! sizes are finely grained and large sizes coarsely grained.
//!
//! With the fixed geometry ([`PAGE_SIZE`] = 8 KiB, [`CHUNK_SIZE`] = 4 MiB) the
//! table has 31 small classes (16 B to 7 KiB), 37 normal classes (8 KiB to
//! 4 MiB) and a final `Huge` marker for everything larger than a chunk.

/// Size of one page, the allocation unit of a chunk.
pub const PAGE_SIZE: usize = 8192;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFTS: u32 = 13;

/// Size of one pooled chunk.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Smallest size class and the stride of the first group.
pub const QUANTUM: usize = 16;

/// Requests up to this size are classified through a lookup table.
pub const LOOKUP_MAX_SIZE: usize = 4096;

const LOG2_QUANTUM: u32 = 4;
const LOG2_GROUP: u32 = 2;
const GROUP_MASK: usize = (1 << LOG2_GROUP) - 1;

/// Upper bound of elements carved out of one slab run.
const MAX_SUBPAGE_ELEMENTS: usize = 512;

/// Allocation strategy selected for a size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeKind {
    /// Served by a bitmap slab inside a run.
    Small,
    /// Served by a buddy run of whole pages.
    Normal,
    /// Served by a dedicated unpooled chunk.
    Huge,
}

/// One entry of the size-class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SizeClass {
    /// Canonical size in bytes. For `Huge` requests this is the requested size.
    pub size: usize,
    /// Allocation strategy.
    pub kind: SizeKind,
    /// Position in the table.
    pub index: usize,
}

impl SizeClass {
    /// Returns `true` for slab-backed classes.
    #[must_use]
    pub const fn is_small(&self) -> bool {
        matches!(self.kind, SizeKind::Small)
    }

    /// Returns `true` for requests that bypass the pooled chunks.
    #[must_use]
    pub const fn is_huge(&self) -> bool {
        matches!(self.kind, SizeKind::Huge)
    }
}

/// Immutable table mapping byte counts and page counts to size classes.
#[derive(Debug, Clone)]
pub struct SizeClasses {
    table: Vec<SizeClass>,
    lookup: Vec<u8>,
    page_classes: Vec<usize>,
    n_small: usize,
}

impl Default for SizeClasses {
    fn default() -> Self {
        Self::new()
    }
}

impl SizeClasses {
    /// Builds the table for the fixed page and chunk geometry.
    #[must_use]
    pub fn new() -> Self {
        let mut sizes = Vec::new();
        for k in 1..=4 {
            sizes.push(k * QUANTUM);
        }
        let mut log2_delta = LOG2_QUANTUM;
        loop {
            let base = 1usize << (log2_delta + LOG2_GROUP);
            if base >= CHUNK_SIZE {
                break;
            }
            for k in 1..=4 {
                sizes.push(base + (k << log2_delta));
            }
            log2_delta += 1;
        }

        let mut table: Vec<SizeClass> = sizes
            .iter()
            .enumerate()
            .map(|(index, &size)| SizeClass {
                size,
                kind: if size < PAGE_SIZE {
                    SizeKind::Small
                } else {
                    SizeKind::Normal
                },
                index,
            })
            .collect();
        let n_small = table.iter().filter(|c| c.is_small()).count();
        table.push(SizeClass {
            size: 0,
            kind: SizeKind::Huge,
            index: table.len(),
        });

        let mut lookup = Vec::with_capacity(LOOKUP_MAX_SIZE >> LOG2_QUANTUM);
        let mut idx = 0;
        for slot in 0..(LOOKUP_MAX_SIZE >> LOG2_QUANTUM) {
            let bytes = (slot + 1) << LOG2_QUANTUM;
            while sizes[idx] < bytes {
                idx += 1;
            }
            // The lookup range ends well below the first index that needs more than a byte.
            lookup.push(u8::try_from(idx).unwrap_or(u8::MAX));
        }

        let page_classes = sizes
            .iter()
            .copied()
            .filter(|&s| s >= PAGE_SIZE && s % PAGE_SIZE == 0)
            .collect();

        Self {
            table,
            lookup,
            page_classes,
            n_small,
        }
    }

    /// Returns the smallest size class that can hold `n` bytes.
    ///
    /// `0` maps to the first class. Sizes above [`CHUNK_SIZE`] map to the
    /// `Huge` marker carrying `n` itself as its size.
    #[must_use]
    pub fn classify(&self, n: usize) -> SizeClass {
        if n == 0 {
            return self.table[0];
        }
        if n > CHUNK_SIZE {
            let mut huge = self.table[self.table.len() - 1];
            huge.size = n;
            return huge;
        }
        if n <= LOOKUP_MAX_SIZE {
            return self.table[usize::from(self.lookup[(n - 1) >> LOG2_QUANTUM])];
        }

        let log2 = floor_log2((n << 1) - 1);
        let group_first = ((log2 - (LOG2_GROUP + LOG2_QUANTUM)) << LOG2_GROUP) as usize;
        let log2_delta = log2 - LOG2_GROUP - 1;
        let modulo = ((n - 1) >> log2_delta) & GROUP_MASK;
        self.table[group_first + modulo]
    }

    /// Rounds `n` up to its canonical size.
    #[must_use]
    pub fn normalize(&self, n: usize) -> usize {
        self.classify(n).size
    }

    /// Returns the table entry at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside the table.
    #[must_use]
    pub fn size_of(&self, index: usize) -> SizeClass {
        self.table[index]
    }

    /// Number of entries including the `Huge` marker.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Always `false`; the table is never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Number of small (slab) classes.
    #[must_use]
    pub const fn n_small(&self) -> usize {
        self.n_small
    }

    /// Number of page-size classes.
    #[must_use]
    pub fn n_page_classes(&self) -> usize {
        self.page_classes.len()
    }

    /// Size in bytes of the page class at `idx`.
    #[must_use]
    pub fn page_class_size(&self, idx: usize) -> usize {
        self.page_classes[idx]
    }

    /// Maps a page count to a page-size class.
    ///
    /// Rounds up unless `floor` is set, in which case the largest class not
    /// exceeding `pages` is returned. Page counts beyond a chunk map to
    /// [`n_page_classes`](Self::n_page_classes).
    #[must_use]
    pub fn pages_to_page_class(&self, pages: usize, floor: bool) -> usize {
        if pages == 0 {
            return 0;
        }
        if pages > CHUNK_SIZE >> PAGE_SHIFTS {
            return self.page_classes.len();
        }
        let size = pages << PAGE_SHIFTS;

        let log2 = floor_log2((size << 1) - 1);
        let group_shift = log2.saturating_sub(LOG2_GROUP + PAGE_SHIFTS);
        let group_first = (group_shift << LOG2_GROUP) as usize;
        let log2_delta = if log2 < LOG2_GROUP + PAGE_SHIFTS + 1 {
            PAGE_SHIFTS
        } else {
            log2 - LOG2_GROUP - 1
        };
        let delta_mask = !0usize << log2_delta;
        let modulo = (((size - 1) & delta_mask) >> log2_delta) & GROUP_MASK;
        let idx = group_first + modulo;

        if floor && self.page_classes[idx] > size {
            idx - 1
        } else {
            idx
        }
    }

    /// Run length used to carve a slab of `elem_size` elements.
    ///
    /// The smallest whole number of pages that divides evenly into elements,
    /// bounded by 512 elements per run.
    #[must_use]
    pub fn run_size_for(&self, elem_size: usize) -> usize {
        let mut run_size = 0;
        let mut elements;
        loop {
            run_size += PAGE_SIZE;
            elements = run_size / elem_size;
            if elements >= MAX_SUBPAGE_ELEMENTS || run_size == elements * elem_size {
                break;
            }
        }
        while elements > MAX_SUBPAGE_ELEMENTS {
            run_size -= PAGE_SIZE;
            elements = run_size / elem_size;
        }
        run_size
    }
}

/// Page count needed to hold `size` bytes.
#[must_use]
pub(crate) const fn pages_for(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

const fn floor_log2(v: usize) -> u32 {
    usize::BITS - 1 - v.leading_zeros()
}
