//! Address ranges, the frontier worklist, and the conservative scanning
//! primitive.
//!
//! [`scan_range_for_pointers`] is the only place in the crate that reads
//! arbitrary memory. Everything else hands it ranges that some root source
//! or tracked chunk vouches for.

use std::fmt;
use std::mem;
use std::ptr;

use crate::heap::{ChunkTag, TrackedHeap};

/// Size of a scanned word.
pub const WORD_SIZE: usize = mem::size_of::<usize>();

/// A half-open address range `[begin, end)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AddressRange {
    /// First address in the range.
    pub begin: usize,
    /// One past the last address.
    pub end: usize,
}

impl AddressRange {
    /// The empty range.
    pub const EMPTY: AddressRange = AddressRange { begin: 0, end: 0 };

    /// Create a range. An inverted range collapses to empty at `begin`.
    pub const fn new(begin: usize, end: usize) -> Self {
        if end < begin {
            Self { begin, end: begin }
        } else {
            Self { begin, end }
        }
    }

    /// Create a range from a base and a length, saturating at the top of
    /// the address space.
    pub const fn from_base_len(base: usize, len: usize) -> Self {
        Self {
            begin: base,
            end: base.saturating_add(len),
        }
    }

    /// Length in bytes.
    pub const fn len(&self) -> usize {
        self.end - self.begin
    }

    /// Whether the range covers no bytes.
    pub const fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    /// Whether `addr` lies in the range.
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.begin && addr < self.end
    }

    /// Whether the two ranges share at least one byte.
    pub const fn overlaps(&self, other: &AddressRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// The largest sub-range made of whole, naturally aligned words.
    pub fn aligned_words(&self) -> AddressRange {
        let begin = match self.begin.checked_add(WORD_SIZE - 1) {
            Some(b) => b & !(WORD_SIZE - 1),
            None => return AddressRange::EMPTY,
        };
        let end = self.end & !(WORD_SIZE - 1);
        AddressRange::new(begin, end)
    }

    /// The parts of `self` below and above `hole`.
    pub fn split_around(&self, hole: &AddressRange) -> (AddressRange, AddressRange) {
        if hole.is_empty() || !self.overlaps(hole) {
            return (*self, AddressRange::EMPTY);
        }
        (
            AddressRange::new(self.begin, hole.begin.max(self.begin)),
            AddressRange::new(hole.end.min(self.end), self.end),
        )
    }
}

impl fmt::Debug for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.begin, self.end)
    }
}

/// Worklist of chunk bodies still to be scanned.
///
/// Only bodies of chunks that were just tagged reachable are pushed. Root
/// ranges are scanned as they are enumerated and never queued. Capacity is
/// reserved before the world stops (one slot per tracked chunk, since each
/// chunk is pushed at most once), so pushing during an episode does not
/// allocate.
#[derive(Debug, Default)]
pub struct Frontier {
    ranges: Vec<AddressRange>,
}

impl Frontier {
    /// Create an empty frontier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a frontier that can hold `capacity` ranges without growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ranges: Vec::with_capacity(capacity),
        }
    }

    /// Queue a range. Empty ranges are dropped.
    pub fn push(&mut self, range: AddressRange) {
        if !range.is_empty() {
            self.ranges.push(range);
        }
    }

    /// Take the most recently queued range.
    pub fn pop(&mut self) -> Option<AddressRange> {
        self.ranges.pop()
    }

    /// Number of queued ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Ranges the frontier can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.ranges.capacity()
    }
}

/// Work done by one call to [`scan_range_for_pointers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanCount {
    /// Words read.
    pub words: usize,
    /// Chunks whose tag changed.
    pub marked: usize,
}

/// Conservatively scan `range` for words that point into tracked chunks.
///
/// Every naturally aligned, pointer-sized word is treated as a candidate.
/// A candidate inside a chunk that is neither reachable, ignored, nor
/// already tagged `tag` gets tagged `tag`; if a frontier is given, the
/// chunk's body is queued. A chunk starting at `owner` is skipped so a
/// chunk's self-references do not count.
///
/// # Safety
///
/// Every byte of `range` must be mapped and readable for the duration of
/// the call, and must not be unmapped concurrently.
pub unsafe fn scan_range_for_pointers<H: TrackedHeap + ?Sized>(
    range: AddressRange,
    heap: &mut H,
    mut frontier: Option<&mut Frontier>,
    tag: ChunkTag,
    owner: Option<usize>,
) -> ScanCount {
    let mut count = ScanCount::default();
    let words = range.aligned_words();
    let bounds = heap.address_bounds();
    if words.is_empty() || bounds.is_empty() {
        return count;
    }

    let mut addr = words.begin;
    while addr < words.end {
        // SAFETY: the caller guarantees the range is readable; `addr` is
        // word-aligned and at least one word below `words.end`.
        let candidate = unsafe { ptr::read_volatile(addr as *const usize) };
        addr += WORD_SIZE;
        count.words += 1;

        if !bounds.contains(candidate) {
            continue;
        }
        let Some(chunk) = heap.chunk_containing(candidate) else {
            continue;
        };
        if Some(chunk.base) == owner {
            continue;
        }
        match chunk.tag {
            ChunkTag::Reachable | ChunkTag::Ignored => continue,
            t if t == tag => continue,
            _ => {}
        }

        heap.set_tag(chunk.base, tag);
        count.marked += 1;
        if let Some(frontier) = frontier.as_deref_mut() {
            frontier.push(chunk.body());
        }
    }

    count
}
