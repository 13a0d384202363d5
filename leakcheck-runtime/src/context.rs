//! # Leak-Check Context
//!
//! [`LeakContext`] owns everything a leak checker needs: configuration, the
//! platform, the thread registry, the tracked heap with its root regions,
//! and per-thread disable counters. There is no process-global state; an
//! embedder creates one context and shares it.
//!
//! ## Locks
//!
//! | Lock | Guards | Order |
//! |------|--------|-------|
//! | registry | [`RegistryState`] | first |
//! | allocator | [`HeapState`] | second |
//!
//! Acquiring the registry lock while holding the allocator lock on the same
//! thread is a fatal lock-order violation. A stop-the-world episode holds
//! both, in order, for its whole duration, and releases them in reverse:
//! allocator first, then registry.
//!
//! ## Example
//!
//! ```rust,ignore
//! use leakcheck_runtime::{ChunkTable, LeakCheckConfig, LeakContext, StackId};
//!
//! let ctx = LeakContext::new(LeakCheckConfig::from_env(), ChunkTable::new())?;
//! ctx.initialize_main_thread()?;
//!
//! let block = Box::into_raw(Box::new([0u8; 64]));
//! ctx.track_allocation(block as usize, 64, StackId(1));
//!
//! let report = ctx.check_for_leaks();
//! for leak in report.direct() {
//!     eprintln!("leaked {} bytes at {:#x}", leak.size, leak.base);
//! }
//! ```

use std::cell::Cell;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};
use thread_local::ThreadLocal;

use crate::config::LeakCheckConfig;
use crate::disable::DisableCounters;
use crate::error::LeakError;
use crate::fatal::{self, FatalError};
use crate::frontier::AddressRange;
use crate::heap::{ChunkTable, ChunkTag, HeapState, IgnoreOutcome, StackId, TrackedHeap};
use crate::platform::{NativePlatform, OsThreadId, Platform};
use crate::reachability::{self, LeakReport};
use crate::registry::{RegistryError, RegistryState, ThreadStartInfo, Tid, MAIN_TID};
use crate::stoptheworld::{self, EpisodeStats, FrozenWorld};

const REGISTRY_HELD: u8 = 1 << 0;
const HEAP_HELD: u8 = 1 << 1;

/// Leak checker state for one process.
pub struct LeakContext<H: TrackedHeap, P: Platform = NativePlatform> {
    config: LeakCheckConfig,
    platform: P,
    registry: Mutex<RegistryState>,
    heap: Mutex<HeapState<H>>,
    disable: DisableCounters,
    current: ThreadLocal<Cell<Option<Tid>>>,
    held: ThreadLocal<Cell<u8>>,
}

impl<H: TrackedHeap> LeakContext<H, NativePlatform> {
    /// Create a context on the native platform.
    pub fn new(config: LeakCheckConfig, heap: H) -> Result<Self, LeakError> {
        config.validate()?;
        let platform = NativePlatform::new(&config.platform).map_err(LeakError::Platform)?;
        Self::with_platform(config, heap, platform)
    }
}

impl<H: TrackedHeap, P: Platform> LeakContext<H, P> {
    /// Create a context on a caller-supplied platform.
    pub fn with_platform(config: LeakCheckConfig, heap: H, platform: P) -> Result<Self, LeakError> {
        config.validate()?;
        tracing::debug!(
            frontier_reserve = config.frontier_reserve,
            fatal = config.fatal.as_str(),
            "leak-check context created"
        );
        Ok(Self {
            config,
            platform,
            registry: Mutex::new(RegistryState::new()),
            heap: Mutex::new(HeapState::new(heap)),
            disable: DisableCounters::new(),
            current: ThreadLocal::new(),
            held: ThreadLocal::new(),
        })
    }

    /// The validated configuration.
    pub fn config(&self) -> &LeakCheckConfig {
        &self.config
    }

    /// The platform layer.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    // ========================================================================
    // Locks
    // ========================================================================

    fn held(&self) -> &Cell<u8> {
        self.held.get_or(|| Cell::new(0))
    }

    /// Acquire the thread-registry lock.
    ///
    /// Dies if the calling thread holds the allocator lock.
    pub fn lock_registry(&self) -> RegistryGuard<'_> {
        let held = self.held();
        if held.get() & HEAP_HELD != 0 {
            fatal::die(self.config.fatal, FatalError::LockOrderViolation);
        }
        let guard = self.registry.lock();
        held.set(held.get() | REGISTRY_HELD);
        RegistryGuard { guard, held }
    }

    /// Acquire the allocator lock.
    pub fn lock_heap(&self) -> HeapGuard<'_, H> {
        let held = self.held();
        let guard = self.heap.lock();
        held.set(held.get() | HEAP_HELD);
        HeapGuard { guard, held }
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// Register the calling thread as the main thread.
    pub fn initialize_main_thread(&self) -> Result<Tid, RegistryError> {
        let tid = self.lock_registry().create_thread(None);
        self.on_thread_start(tid, self.platform.current_os_thread_id())?;
        Ok(tid)
    }

    /// Create a thread record. Call from the parent before the thread runs.
    pub fn thread_create(&self, parent: Option<Tid>) -> Tid {
        self.lock_registry().create_thread(parent)
    }

    /// Record the calling thread's bounds under `tid`. Call from the new
    /// thread itself.
    pub fn on_thread_start(&self, tid: Tid, os_id: OsThreadId) -> Result<(), RegistryError> {
        let bounds = self.platform.current_thread_bounds(tid == MAIN_TID);
        let cache = self.lock_heap().heap.cache_range_for_current_thread();
        self.lock_registry()
            .start_thread(tid, os_id, ThreadStartInfo { bounds, cache })?;
        self.current.get_or(|| Cell::new(None)).set(Some(tid));
        tracing::trace!(%tid, %os_id, stack = ?bounds.stack, tls = ?bounds.tls, "thread started");
        Ok(())
    }

    /// Mark `tid` finished.
    pub fn on_thread_finish(&self, tid: Tid) -> Result<(), RegistryError> {
        self.lock_registry().finish_thread(tid)?;
        if let Some(current) = self.current.get() {
            if current.get() == Some(tid) {
                current.set(None);
            }
        }
        tracing::trace!(%tid, "thread finished");
        Ok(())
    }

    /// Create and start a record for the calling thread, parented to the
    /// thread that is current on this thread, if any.
    pub fn register_current_thread(&self) -> Result<Tid, RegistryError> {
        let tid = self.thread_create(self.current_thread());
        self.on_thread_start(tid, self.platform.current_os_thread_id())?;
        Ok(tid)
    }

    /// Finish the calling thread's record.
    pub fn unregister_current_thread(&self) -> Result<(), RegistryError> {
        match self.current_thread() {
            Some(tid) => self.on_thread_finish(tid),
            None => Ok(()),
        }
    }

    /// The calling thread's registry id.
    pub fn current_thread(&self) -> Option<Tid> {
        self.current.get().and_then(Cell::get)
    }

    // ========================================================================
    // Disabling
    // ========================================================================

    /// Stop reporting allocations made by the calling thread. Nests.
    pub fn disable_in_this_thread(&self) {
        self.disable.disable();
    }

    /// Undo one [`disable_in_this_thread`](Self::disable_in_this_thread).
    ///
    /// Dies if the counter is already zero.
    pub fn enable_in_this_thread(&self) {
        if self.disable.enable().is_err() {
            fatal::die(self.config.fatal, FatalError::DisableCounterUnderflow);
        }
    }

    /// Whether allocations made by the calling thread are currently excluded.
    pub fn disabled_in_this_thread(&self) -> bool {
        self.disable.is_disabled()
    }

    /// Current disable nesting depth of the calling thread.
    pub fn disable_depth(&self) -> u32 {
        self.disable.depth()
    }

    /// Disable until the returned guard is dropped.
    pub fn scoped_disable(&self) -> ScopedDisable<'_, H, P> {
        self.disable_in_this_thread();
        ScopedDisable { ctx: self }
    }

    // ========================================================================
    // Objects and roots
    // ========================================================================

    /// Exclude the chunk containing `addr` from leak reports.
    pub fn ignore_object(&self, addr: usize) -> IgnoreOutcome {
        let mut heap = self.lock_heap();
        let Some(chunk) = heap.heap.chunk_containing(addr) else {
            tracing::warn!(addr = format_args!("{:#x}", addr), "ignore_object: not a tracked chunk");
            return IgnoreOutcome::NotFound;
        };
        if chunk.tag == ChunkTag::Ignored {
            return IgnoreOutcome::AlreadyIgnored;
        }
        heap.heap.set_tag(chunk.base, ChunkTag::Ignored);
        IgnoreOutcome::Ignored
    }

    /// Scan `[begin, begin + size)` as a root in every future check.
    ///
    /// # Safety
    ///
    /// The range must stay mapped and readable until it is unregistered.
    pub unsafe fn register_root_region(&self, begin: usize, size: usize) {
        let region = AddressRange::from_base_len(begin, size);
        self.lock_heap().root_regions.push(region);
        tracing::debug!(region = ?region, "root region registered");
    }

    /// Remove a region registered with the same bounds. Returns false if
    /// no such region exists.
    pub fn unregister_root_region(&self, begin: usize, size: usize) -> bool {
        let region = AddressRange::from_base_len(begin, size);
        let mut heap = self.lock_heap();
        match heap.root_regions.iter().rposition(|r| *r == region) {
            Some(index) => {
                heap.root_regions.swap_remove(index);
                true
            }
            None => {
                tracing::warn!(region = ?region, "unregister_root_region: region was not registered");
                false
            }
        }
    }

    // ========================================================================
    // Episodes
    // ========================================================================

    /// Run `callback` with every other thread suspended.
    ///
    /// Takes the registry lock and the allocator lock in order, stops the
    /// world on a tracer thread, runs `callback` there, and resumes every
    /// thread before returning. The callback must not allocate, log, or
    /// take locks other threads may hold.
    pub fn run_exclusive<R, F>(&self, callback: F) -> (R, EpisodeStats)
    where
        R: Send,
        F: FnOnce(&mut FrozenWorld<'_, H, P>) -> R + Send,
    {
        let registry = self.lock_registry();
        let mut heap = self.lock_heap();
        stoptheworld::stop_the_world_locked(&self.platform, &self.config, &registry, &mut heap, callback)
    }

    /// Run a full leak check.
    pub fn check_for_leaks(&self) -> LeakReport {
        let registry = self.lock_registry();
        let mut heap = self.lock_heap();
        let ((), stats) = stoptheworld::stop_the_world_locked(
            &self.platform,
            &self.config,
            &registry,
            &mut heap,
            reachability::mark_reachable::<H, P>,
        );
        let report = reachability::classify_leaks(&mut heap.heap, stats);
        drop(heap);
        drop(registry);

        if report.is_degraded() {
            tracing::warn!(
                threads_unsuspended = stats.threads_unsuspended,
                register_captures_failed = stats.register_captures_failed,
                stacks_skipped = stats.stacks_skipped,
                modules_skipped = stats.modules_skipped,
                "leak check was degraded; some reports may be false"
            );
        }
        tracing::info!(
            direct = report.direct().count(),
            indirect = report.indirect().count(),
            bytes = report.total_bytes(),
            "leak check complete"
        );
        report
    }
}

impl<P: Platform> LeakContext<ChunkTable, P> {
    /// Track a new allocation in the reference heap.
    ///
    /// Allocations made while the calling thread is disabled are tracked
    /// as ignored.
    pub fn track_allocation(&self, base: usize, size: usize, stack_id: StackId) {
        let disabled = self.disabled_in_this_thread();
        let mut heap = self.lock_heap();
        if disabled {
            heap.heap.insert_ignored(base, size, stack_id);
        } else {
            heap.heap.insert(base, size, stack_id);
        }
    }

    /// Stop tracking the allocation at `base`. Call before the memory is
    /// released.
    pub fn untrack_allocation(&self, base: usize) -> bool {
        self.lock_heap().heap.remove(base).is_some()
    }
}

/// Registry lock guard.
pub struct RegistryGuard<'a> {
    guard: MutexGuard<'a, RegistryState>,
    held: &'a Cell<u8>,
}

impl Deref for RegistryGuard<'_> {
    type Target = RegistryState;

    fn deref(&self) -> &RegistryState {
        &self.guard
    }
}

impl DerefMut for RegistryGuard<'_> {
    fn deref_mut(&mut self) -> &mut RegistryState {
        &mut self.guard
    }
}

impl Drop for RegistryGuard<'_> {
    fn drop(&mut self) {
        self.held.set(self.held.get() & !REGISTRY_HELD);
    }
}

/// Allocator lock guard.
pub struct HeapGuard<'a, H> {
    guard: MutexGuard<'a, HeapState<H>>,
    held: &'a Cell<u8>,
}

impl<H> Deref for HeapGuard<'_, H> {
    type Target = HeapState<H>;

    fn deref(&self) -> &HeapState<H> {
        &self.guard
    }
}

impl<H> DerefMut for HeapGuard<'_, H> {
    fn deref_mut(&mut self) -> &mut HeapState<H> {
        &mut self.guard
    }
}

impl<H> Drop for HeapGuard<'_, H> {
    fn drop(&mut self) {
        self.held.set(self.held.get() & !HEAP_HELD);
    }
}

/// Re-enables leak tracking for the calling thread when dropped.
pub struct ScopedDisable<'a, H: TrackedHeap, P: Platform> {
    ctx: &'a LeakContext<H, P>,
}

impl<H: TrackedHeap, P: Platform> Drop for ScopedDisable<'_, H, P> {
    fn drop(&mut self) {
        self.ctx.enable_in_this_thread();
    }
}
