//! # Tracked Heap
//!
//! The leak checker does not own allocation metadata. It consults an
//! allocator collaborator through [`TrackedHeap`]: "which tracked chunk
//! contains this address?", "tag this chunk", "visit every chunk".
//!
//! ## Chunk Tags
//!
//! Every chunk carries a [`ChunkTag`]. Marking moves chunks from
//! `Unreached` to `Reachable`; classification moves leaked chunks that are
//! referenced by other leaked chunks to `IndirectlyLeaked`. `Ignored`
//! chunks are never scanned and never reported.
//!
//! ## Reference Implementation
//!
//! [`ChunkTable`] keeps chunks in an ordered map keyed by base address so
//! interior-pointer lookups are a single `range(..=addr)` query and never
//! allocate. Embedders with their own allocator metadata implement
//! [`TrackedHeap`] directly.
//!
//! Implementors must keep lookups and tag updates allocation-free: both
//! run while every other thread is frozen.

use std::collections::BTreeMap;
use std::fmt;

use crate::frontier::AddressRange;

/// Identifier of an allocation-site stack trace in an external stack depot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StackId(pub u32);

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stack#{}", self.0)
    }
}

/// Reachability state of a tracked chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ChunkTag {
    /// Not (yet) reached from any root. Directly leaked after classification.
    #[default]
    Unreached = 0,
    /// Unreached, but referenced from another unreached chunk.
    IndirectlyLeaked = 1,
    /// Reached from a root.
    Reachable = 2,
    /// Excluded from scanning and reporting.
    Ignored = 3,
}

impl ChunkTag {
    /// Whether a chunk with this tag counts as a leak candidate.
    pub fn is_leaked(&self) -> bool {
        matches!(self, ChunkTag::Unreached | ChunkTag::IndirectlyLeaked)
    }
}

/// Snapshot of one tracked chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// First byte of the allocation.
    pub base: usize,
    /// Requested size in bytes.
    pub size: usize,
    /// Current tag.
    pub tag: ChunkTag,
    /// Allocation-site stack trace.
    pub stack_id: StackId,
}

impl ChunkInfo {
    /// The allocation's body as a scan range.
    pub fn body(&self) -> AddressRange {
        AddressRange::from_base_len(self.base, self.size)
    }

    /// Whether `addr` points into this chunk.
    ///
    /// Interior pointers count. A zero-sized chunk is referenced by its base.
    pub fn contains(&self, addr: usize) -> bool {
        addr == self.base || (addr > self.base && addr - self.base < self.size)
    }
}

/// Allocator collaborator interface.
pub trait TrackedHeap: Send {
    /// Number of chunks that can be marked (ignored chunks may be excluded).
    fn chunk_count(&self) -> usize;

    /// An address range covering every tracked chunk, used to reject most
    /// scanned words without a lookup. Empty when nothing is tracked.
    fn address_bounds(&self) -> AddressRange;

    /// The tracked chunk containing `addr`, if any.
    fn chunk_containing(&self, addr: usize) -> Option<ChunkInfo>;

    /// Set the tag of the chunk starting at `base`. Returns false if no
    /// such chunk is tracked.
    fn set_tag(&mut self, base: usize, tag: ChunkTag) -> bool;

    /// Reset every non-ignored chunk to [`ChunkTag::Unreached`].
    fn reset_tags(&mut self);

    /// Visit every tracked chunk.
    fn for_each_chunk(&self, visit: &mut dyn FnMut(&ChunkInfo));

    /// The calling thread's private allocator cache, if the allocator has one.
    fn cache_range_for_current_thread(&self) -> AddressRange {
        AddressRange::EMPTY
    }
}

/// Allocator-lock-protected state: the heap plus registered root regions.
#[derive(Debug, Default)]
pub struct HeapState<H> {
    pub(crate) heap: H,
    pub(crate) root_regions: Vec<AddressRange>,
}

impl<H> HeapState<H> {
    pub(crate) fn new(heap: H) -> Self {
        Self {
            heap,
            root_regions: Vec::new(),
        }
    }

    /// The tracked heap.
    pub fn heap(&self) -> &H {
        &self.heap
    }

    /// Mutable access to the tracked heap.
    pub fn heap_mut(&mut self) -> &mut H {
        &mut self.heap
    }

    /// Currently registered root regions.
    pub fn root_regions(&self) -> &[AddressRange] {
        &self.root_regions
    }
}

/// Outcome of [`crate::LeakContext::ignore_object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreOutcome {
    /// The chunk is now ignored.
    Ignored,
    /// The chunk was already ignored.
    AlreadyIgnored,
    /// The address is not inside any tracked chunk.
    NotFound,
}

#[derive(Debug, Clone, Copy)]
struct ChunkEntry {
    size: usize,
    tag: ChunkTag,
    stack_id: StackId,
}

/// Ordered-map implementation of [`TrackedHeap`].
#[derive(Default)]
pub struct ChunkTable {
    chunks: BTreeMap<usize, ChunkEntry>,
}

impl ChunkTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an allocation. Replaces any chunk already tracked at `base`.
    pub fn insert(&mut self, base: usize, size: usize, stack_id: StackId) -> Option<ChunkInfo> {
        self.insert_tagged(base, size, stack_id, ChunkTag::Unreached)
    }

    /// Track an allocation that must never be reported.
    pub fn insert_ignored(&mut self, base: usize, size: usize, stack_id: StackId) -> Option<ChunkInfo> {
        self.insert_tagged(base, size, stack_id, ChunkTag::Ignored)
    }

    fn insert_tagged(
        &mut self,
        base: usize,
        size: usize,
        stack_id: StackId,
        tag: ChunkTag,
    ) -> Option<ChunkInfo> {
        self.chunks
            .insert(base, ChunkEntry { size, tag, stack_id })
            .map(|old| info(base, &old))
    }

    /// Stop tracking the chunk at `base`.
    pub fn remove(&mut self, base: usize) -> Option<ChunkInfo> {
        self.chunks.remove(&base).map(|old| info(base, &old))
    }

    /// The chunk starting exactly at `base`.
    pub fn get(&self, base: usize) -> Option<ChunkInfo> {
        self.chunks.get(&base).map(|entry| info(base, entry))
    }

    /// Number of tracked chunks, ignored ones included.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Iterate over tracked chunks in address order.
    pub fn iter(&self) -> impl Iterator<Item = ChunkInfo> + '_ {
        self.chunks.iter().map(|(&base, entry)| info(base, entry))
    }
}

fn info(base: usize, entry: &ChunkEntry) -> ChunkInfo {
    ChunkInfo {
        base,
        size: entry.size,
        tag: entry.tag,
        stack_id: entry.stack_id,
    }
}

impl TrackedHeap for ChunkTable {
    fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn address_bounds(&self) -> AddressRange {
        match (self.chunks.first_key_value(), self.chunks.last_key_value()) {
            (Some((&lo, _)), Some((&hi, last))) => {
                AddressRange::new(lo, hi.saturating_add(last.size.max(1)))
            }
            _ => AddressRange::EMPTY,
        }
    }

    fn chunk_containing(&self, addr: usize) -> Option<ChunkInfo> {
        let (&base, entry) = self.chunks.range(..=addr).next_back()?;
        let chunk = info(base, entry);
        chunk.contains(addr).then_some(chunk)
    }

    fn set_tag(&mut self, base: usize, tag: ChunkTag) -> bool {
        match self.chunks.get_mut(&base) {
            Some(entry) => {
                entry.tag = tag;
                true
            }
            None => false,
        }
    }

    fn reset_tags(&mut self) {
        for entry in self.chunks.values_mut() {
            if entry.tag != ChunkTag::Ignored {
                entry.tag = ChunkTag::Unreached;
            }
        }
    }

    fn for_each_chunk(&self, visit: &mut dyn FnMut(&ChunkInfo)) {
        for (&base, entry) in &self.chunks {
            visit(&info(base, entry));
        }
    }
}

impl fmt::Debug for ChunkTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkTable")
            .field("num_chunks", &self.chunks.len())
            .field("bounds", &self.address_bounds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_contains_interior_and_zero_size() {
        let chunk = ChunkInfo {
            base: 0x1000,
            size: 0x20,
            tag: ChunkTag::Unreached,
            stack_id: StackId(1),
        };
        assert!(chunk.contains(0x1000));
        assert!(chunk.contains(0x101f));
        assert!(!chunk.contains(0x1020));
        assert!(!chunk.contains(0xfff));

        let empty = ChunkInfo { size: 0, ..chunk };
        assert!(empty.contains(0x1000));
        assert!(!empty.contains(0x1001));
    }

    #[test]
    fn test_chunk_table_lookup() {
        let mut table = ChunkTable::new();
        table.insert(0x1000, 0x100, StackId(1));
        table.insert(0x2000, 0x10, StackId(2));

        assert_eq!(table.chunk_containing(0x1080).map(|c| c.base), Some(0x1000));
        assert_eq!(table.chunk_containing(0x2000).map(|c| c.stack_id), Some(StackId(2)));
        assert!(table.chunk_containing(0x1100).is_none());
        assert!(table.chunk_containing(0x0fff).is_none());
        assert!(table.chunk_containing(0x2010).is_none());
    }

    #[test]
    fn test_chunk_table_bounds() {
        let mut table = ChunkTable::new();
        assert!(table.address_bounds().is_empty());

        table.insert(0x3000, 0x40, StackId(0));
        table.insert(0x1000, 0x10, StackId(0));
        assert_eq!(table.address_bounds(), AddressRange::new(0x1000, 0x3040));

        table.remove(0x3000);
        assert_eq!(table.address_bounds(), AddressRange::new(0x1000, 0x1010));
    }

    #[test]
    fn test_tags_and_reset() {
        let mut table = ChunkTable::new();
        table.insert(0x1000, 8, StackId(0));
        table.insert_ignored(0x2000, 8, StackId(0));

        assert!(table.set_tag(0x1000, ChunkTag::Reachable));
        assert!(!table.set_tag(0x5000, ChunkTag::Reachable));
        assert_eq!(table.get(0x1000).unwrap().tag, ChunkTag::Reachable);

        table.reset_tags();
        assert_eq!(table.get(0x1000).unwrap().tag, ChunkTag::Unreached);
        assert_eq!(table.get(0x2000).unwrap().tag, ChunkTag::Ignored);
    }

    #[test]
    fn test_for_each_chunk_in_order() {
        let mut table = ChunkTable::new();
        table.insert(0x3000, 8, StackId(3));
        table.insert(0x1000, 8, StackId(1));

        let mut seen = Vec::new();
        table.for_each_chunk(&mut |c| seen.push(c.base));
        assert_eq!(seen, vec![0x1000, 0x3000]);
    }

    #[test]
    fn test_leaked_tags() {
        assert!(ChunkTag::Unreached.is_leaked());
        assert!(ChunkTag::IndirectlyLeaked.is_leaked());
        assert!(!ChunkTag::Reachable.is_leaked());
        assert!(!ChunkTag::Ignored.is_leaked());
    }
}
