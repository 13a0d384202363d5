//! # Reachability
//!
//! Marking runs inside a stop-the-world episode:
//!
//! 1. Every non-ignored chunk is reset to `Unreached`.
//! 2. Roots are scanned: for each suspended thread its registers, its live
//!    stack, its static TLS (minus the allocator cache) and the cache; then
//!    module globals, registered root regions and platform roots.
//! 3. The frontier is drained. Each popped chunk body is scanned in turn,
//!    so the marked set is the transitive closure of the roots.
//!
//! Classification runs after the world resumes, with the allocator lock
//! still held: chunks that are still unreached are scanned for pointers to
//! other unreached chunks, which become indirect leaks. A chunk's pointers
//! to itself are ignored.
//!
//! Only aligned, pointer-sized words are considered. Any such word that
//! points into a chunk keeps it alive, so marking can report false
//! negatives (a stale integer that looks like a pointer) but never frees
//! anything.

use crate::config::ScanConfig;
use crate::frontier::{scan_range_for_pointers, AddressRange, Frontier};
use crate::globals;
use crate::heap::{ChunkInfo, ChunkTag, StackId, TrackedHeap};
use crate::platform::{Platform, SuspendedThreads};
use crate::registry::RegistryState;
use crate::stoptheworld::{EpisodeStats, FrozenWorld};

/// Bytes below the stack pointer that leaf functions may use without
/// moving it (System V x86-64 red zone).
#[cfg(all(target_arch = "x86_64", not(windows)))]
pub const STACK_RED_ZONE: usize = 128;
#[cfg(not(all(target_arch = "x86_64", not(windows))))]
pub const STACK_RED_ZONE: usize = 0;

/// Classification of a leaked chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeakKind {
    /// Not referenced from any root or other leaked chunk.
    Direct,
    /// Referenced only from other leaked chunks.
    Indirect,
}

/// One leaked allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leak {
    /// First byte of the chunk.
    pub base: usize,
    /// Chunk size in bytes.
    pub size: usize,
    /// Allocation-site stack trace.
    pub stack_id: StackId,
    /// Direct or indirect.
    pub kind: LeakKind,
}

/// Result of a leak check.
#[derive(Debug, Clone, Default)]
pub struct LeakReport {
    leaks: Vec<Leak>,
    stats: EpisodeStats,
}

impl LeakReport {
    /// All leaks, in chunk order.
    pub fn leaks(&self) -> &[Leak] {
        &self.leaks
    }

    /// Directly leaked chunks.
    pub fn direct(&self) -> impl Iterator<Item = &Leak> {
        self.leaks.iter().filter(|l| l.kind == LeakKind::Direct)
    }

    /// Indirectly leaked chunks.
    pub fn indirect(&self) -> impl Iterator<Item = &Leak> {
        self.leaks.iter().filter(|l| l.kind == LeakKind::Indirect)
    }

    /// Whether `base` was reported, and how.
    pub fn kind_of(&self, base: usize) -> Option<LeakKind> {
        self.leaks.iter().find(|l| l.base == base).map(|l| l.kind)
    }

    /// Whether nothing leaked.
    pub fn is_empty(&self) -> bool {
        self.leaks.is_empty()
    }

    /// Total leaked bytes.
    pub fn total_bytes(&self) -> usize {
        self.leaks.iter().map(|l| l.size).sum()
    }

    /// Counters from the episode that produced this report.
    pub fn stats(&self) -> &EpisodeStats {
        &self.stats
    }

    /// Whether some roots could not be scanned. A degraded report may
    /// contain false leaks.
    pub fn is_degraded(&self) -> bool {
        self.stats.is_degraded()
    }
}

/// Marking state over a borrowed heap and frontier.
pub struct ReachabilityEngine<'a, H: TrackedHeap + ?Sized> {
    heap: &'a mut H,
    frontier: &'a mut Frontier,
    words_scanned: usize,
    chunks_marked: usize,
    roots: usize,
}

impl<'a, H: TrackedHeap + ?Sized> ReachabilityEngine<'a, H> {
    /// Create an engine. Tags are not reset.
    pub fn new(heap: &'a mut H, frontier: &'a mut Frontier) -> Self {
        Self {
            heap,
            frontier,
            words_scanned: 0,
            chunks_marked: 0,
            roots: 0,
        }
    }

    /// Scan one root range, queueing newly reached chunks.
    ///
    /// # Safety
    ///
    /// `range` must be mapped and readable.
    pub unsafe fn scan_root(&mut self, range: AddressRange) {
        if range.is_empty() {
            return;
        }
        // SAFETY: forwarded from the caller.
        let count = unsafe {
            scan_range_for_pointers(range, &mut *self.heap, Some(&mut *self.frontier), ChunkTag::Reachable, None)
        };
        self.roots += 1;
        self.words_scanned += count.words;
        self.chunks_marked += count.marked;
    }

    /// Drain the frontier, scanning every reached chunk body.
    pub fn flood_fill(&mut self) {
        while let Some(body) = self.frontier.pop() {
            // SAFETY: bodies come from tracked chunks, which stay allocated
            // while the allocator lock is held.
            let count = unsafe {
                scan_range_for_pointers(body, &mut *self.heap, Some(&mut *self.frontier), ChunkTag::Reachable, None)
            };
            self.words_scanned += count.words;
            self.chunks_marked += count.marked;
        }
    }

    /// Words read so far.
    pub fn words_scanned(&self) -> usize {
        self.words_scanned
    }

    /// Chunks tagged reachable so far.
    pub fn chunks_marked(&self) -> usize {
        self.chunks_marked
    }

    fn record(&self, stats: &mut EpisodeStats) {
        stats.root_ranges += self.roots;
        stats.words_scanned += self.words_scanned;
        stats.chunks_marked += self.chunks_marked;
    }
}

/// The part of a stack that is in use, given the stack pointer.
///
/// `None` if the stack is unknown or the stack pointer lies outside it (a
/// thread running on an alternate signal stack, for instance).
pub fn live_stack(stack: AddressRange, sp: usize) -> Option<AddressRange> {
    if stack.is_empty() || !stack.contains(sp) {
        return None;
    }
    let begin = sp.saturating_sub(STACK_RED_ZONE).max(stack.begin);
    Some(AddressRange::new(begin, stack.end))
}

/// Mark every chunk reachable from the frozen process's roots.
pub fn mark_reachable<H: TrackedHeap, P: Platform>(world: &mut FrozenWorld<'_, H, P>) {
    let scan = world.config.scan;
    world.heap.heap.reset_tags();

    {
        let mut engine = ReachabilityEngine::new(&mut world.heap.heap, &mut *world.frontier);
        let suspended = world.suspended;
        for index in 0..suspended.thread_count() {
            scan_thread_roots(&mut engine, world.registry, suspended, index, &scan, world.stats);
        }

        if scan.use_root_regions {
            for &region in &world.heap.root_regions {
                // SAFETY: registration requires the region to stay mapped
                // until it is unregistered, under the same lock.
                unsafe { engine.scan_root(region) };
            }
        }

        world.platform.for_each_platform_root(&mut |range| {
            // SAFETY: the platform reports only mapped ranges.
            unsafe { engine.scan_root(range) };
        });

        engine.record(world.stats);
    }

    if scan.use_globals {
        globals::collect_global_roots(
            world.platform,
            &mut world.heap.heap,
            &mut *world.frontier,
            &mut *world.stats,
            world.config.fatal,
        );
    }

    let mut engine = ReachabilityEngine::new(&mut world.heap.heap, &mut *world.frontier);
    engine.flood_fill();
    engine.record(world.stats);
}

fn scan_thread_roots<H: TrackedHeap + ?Sized, S: SuspendedThreads>(
    engine: &mut ReachabilityEngine<'_, H>,
    registry: &RegistryState,
    suspended: &S,
    index: usize,
    scan: &ScanConfig,
    stats: &mut EpisodeStats,
) {
    let os_id = suspended.thread_id(index);
    let sp = match suspended.registers_and_sp(index) {
        Ok((registers, sp)) => {
            if scan.use_registers {
                // SAFETY: the register block lives in the suspended list.
                unsafe { engine.scan_root(registers.range()) };
            }
            Some(sp)
        }
        Err(_) => {
            stats.register_captures_failed += 1;
            None
        }
    };

    let Some(thread) = registry.find_context_by_os_id(os_id) else {
        stats.threads_without_context += 1;
        return;
    };

    if scan.use_stacks {
        match sp.and_then(|sp| live_stack(thread.stack(), sp)) {
            // SAFETY: the thread is suspended and its stack lies between
            // its stack pointer and the recorded top.
            Some(live) => unsafe { engine.scan_root(live) },
            None => stats.stacks_skipped += 1,
        }
    }

    let cache = thread.cache();
    if scan.use_tls {
        let (below, above) = thread.tls().split_around(&cache);
        // SAFETY: static TLS of a live thread stays mapped while it is
        // suspended.
        unsafe {
            engine.scan_root(below);
            engine.scan_root(above);
        }
    }
    if scan.use_allocator_cache {
        // SAFETY: the allocator reported this cache for a live thread.
        unsafe { engine.scan_root(cache) };
    }
}

/// Classify every unreached chunk as a direct or indirect leak.
///
/// Call after marking, once the world has resumed, with the allocator lock
/// still held.
pub fn classify_leaks<H: TrackedHeap + ?Sized>(heap: &mut H, stats: EpisodeStats) -> LeakReport {
    let mut leaked: Vec<ChunkInfo> = Vec::new();
    heap.for_each_chunk(&mut |chunk| {
        if chunk.tag.is_leaked() {
            leaked.push(*chunk);
        }
    });

    for chunk in &leaked {
        // SAFETY: tracked chunks stay allocated while the allocator lock
        // is held.
        unsafe {
            scan_range_for_pointers(chunk.body(), heap, None, ChunkTag::IndirectlyLeaked, Some(chunk.base));
        }
    }

    let leaks = leaked
        .iter()
        .filter_map(|chunk| {
            let tag = heap.chunk_containing(chunk.base)?.tag;
            let kind = match tag {
                ChunkTag::Unreached => LeakKind::Direct,
                ChunkTag::IndirectlyLeaked => LeakKind::Indirect,
                ChunkTag::Reachable | ChunkTag::Ignored => return None,
            };
            Some(Leak {
                base: chunk.base,
                size: chunk.size,
                stack_id: chunk.stack_id,
                kind,
            })
        })
        .collect();

    LeakReport { leaks, stats }
}
