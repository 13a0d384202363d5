//! # Stop-the-World Episodes
//!
//! An episode freezes every thread of the process except a dedicated
//! tracer thread, runs a callback with a consistent view of registers,
//! stacks, thread-local data and module globals, then resumes everything.
//!
//! ## Sequence
//!
//! 1. The caller holds the thread-registry lock and the allocator lock
//!    (in that order) for the whole episode.
//! 2. Frontier capacity is reserved up front.
//! 3. A tracer thread is spawned. Under the loader lock it suspends every
//!    other thread, the initiating thread included, and runs the callback.
//! 4. Dropping the suspended list resumes every thread before the tracer
//!    releases the loader lock.
//! 5. The initiator joins the tracer and gets the callback's result.
//!
//! ## Constraints While Frozen
//!
//! A suspended thread may hold any lock, including the system allocator's.
//! Between suspension and resumption the tracer does not allocate, does not
//! log, and does not take locks that other threads could hold. Statistics
//! are collected into [`EpisodeStats`] and logged after resumption.

use std::panic;
use std::thread;

use crate::config::{LeakCheckConfig, ScanConfig};
use crate::fatal::{self, FatalError};
use crate::frontier::{AddressRange, Frontier};
use crate::globals;
use crate::heap::{HeapState, TrackedHeap};
use crate::platform::{OsThreadId, Platform, SuspendedThreads};
use crate::registry::RegistryState;

/// Counters gathered during one episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EpisodeStats {
    /// Threads suspended by the platform.
    pub threads_suspended: usize,
    /// Live threads the platform could not suspend. They kept running and
    /// their roots were not scanned.
    pub threads_unsuspended: usize,
    /// Suspended threads whose register context could not be captured.
    pub register_captures_failed: usize,
    /// Suspended threads with no registry entry.
    pub threads_without_context: usize,
    /// Known threads whose stack was skipped (stack pointer unknown or
    /// outside the recorded stack).
    pub stacks_skipped: usize,
    /// Modules whose writable data was scanned.
    pub modules_scanned: usize,
    /// Modules skipped because their header could not be parsed.
    pub modules_skipped: usize,
    /// Root ranges scanned.
    pub root_ranges: usize,
    /// Words read during marking.
    pub words_scanned: usize,
    /// Chunks tagged reachable.
    pub chunks_marked: usize,
}

impl EpisodeStats {
    /// Whether some roots could not be scanned. A degraded episode may
    /// report false leaks.
    pub fn is_degraded(&self) -> bool {
        self.threads_unsuspended > 0
            || self.register_captures_failed > 0
            || self.stacks_skipped > 0
            || self.modules_skipped > 0
    }
}

/// View of the process handed to an episode callback.
///
/// Valid only inside the callback: every listed thread is suspended and
/// both locks are held.
pub struct FrozenWorld<'a, H: TrackedHeap, P: Platform> {
    pub(crate) suspended: &'a P::Suspended,
    pub(crate) suspender: OsThreadId,
    pub(crate) registry: &'a RegistryState,
    pub(crate) heap: &'a mut HeapState<H>,
    pub(crate) platform: &'a P,
    pub(crate) config: &'a LeakCheckConfig,
    pub(crate) frontier: &'a mut Frontier,
    pub(crate) stats: &'a mut EpisodeStats,
}

impl<'a, H: TrackedHeap, P: Platform> FrozenWorld<'a, H, P> {
    /// The frozen threads.
    pub fn suspended(&self) -> &P::Suspended {
        self.suspended
    }

    /// OS id of the tracer thread running the callback.
    pub fn suspender_os_id(&self) -> OsThreadId {
        self.suspender
    }

    /// The thread registry.
    pub fn registry(&self) -> &RegistryState {
        self.registry
    }

    /// The tracked heap.
    pub fn heap(&self) -> &H {
        &self.heap.heap
    }

    /// Mutable access to the tracked heap.
    pub fn heap_mut(&mut self) -> &mut H {
        &mut self.heap.heap
    }

    /// Registered root regions.
    pub fn root_regions(&self) -> &[AddressRange] {
        &self.heap.root_regions
    }

    /// The platform.
    pub fn platform(&self) -> &P {
        self.platform
    }

    /// Root classes enabled for this episode.
    pub fn scan_config(&self) -> &ScanConfig {
        &self.config.scan
    }

    /// The episode's pre-reserved frontier.
    pub fn frontier_mut(&mut self) -> &mut Frontier {
        self.frontier
    }

    /// Counters gathered so far.
    pub fn stats(&self) -> &EpisodeStats {
        self.stats
    }

    /// Scan the writable data of every loaded module into the frontier.
    pub fn collect_global_roots(&mut self) {
        globals::collect_global_roots(
            self.platform,
            &mut self.heap.heap,
            self.frontier,
            self.stats,
            self.config.fatal,
        );
    }
}

/// Run `callback` with every other thread suspended.
///
/// The caller must hold the registry lock and the allocator lock; both
/// guarded values are passed in.
pub(crate) fn stop_the_world_locked<H, P, R, F>(
    platform: &P,
    config: &LeakCheckConfig,
    registry: &RegistryState,
    heap: &mut HeapState<H>,
    callback: F,
) -> (R, EpisodeStats)
where
    H: TrackedHeap,
    P: Platform,
    R: Send,
    F: FnOnce(&mut FrozenWorld<'_, H, P>) -> R + Send,
{
    let fatal_policy = config.fatal;
    let mut frontier = Frontier::with_capacity(heap.heap.chunk_count() + config.frontier_reserve);

    let joined = thread::scope(|scope| {
        let tracer = thread::Builder::new()
            .name("leakcheck-tracer".into())
            .spawn_scoped(scope, || {
                let mut callback = Some(callback);
                let mut outcome = None;
                platform.with_loader_lock(&mut || {
                    let Some(callback) = callback.take() else {
                        return;
                    };
                    let suspender = platform.current_os_thread_id();
                    let suspended = match platform.suspend_all() {
                        Ok(suspended) => suspended,
                        Err(err) => fatal::die(fatal_policy, FatalError::ThreadEnumeration(err)),
                    };
                    let mut stats = EpisodeStats {
                        threads_suspended: suspended.thread_count(),
                        threads_unsuspended: suspended.threads_skipped(),
                        ..EpisodeStats::default()
                    };
                    let result = {
                        let mut world = FrozenWorld {
                            suspended: &suspended,
                            suspender,
                            registry,
                            heap: &mut *heap,
                            platform,
                            config,
                            frontier: &mut frontier,
                            stats: &mut stats,
                        };
                        callback(&mut world)
                    };
                    drop(suspended);
                    outcome = Some((result, stats));
                });
                outcome
            });
        match tracer {
            Ok(handle) => handle.join(),
            Err(err) => fatal::die(fatal_policy, FatalError::TracerSpawn(err)),
        }
    });

    let (result, stats) = match joined {
        Ok(Some(outcome)) => outcome,
        Ok(None) => fatal::die(fatal_policy, FatalError::WorldNotStopped),
        Err(payload) => panic::resume_unwind(payload),
    };

    tracing::debug!(
        threads = stats.threads_suspended,
        unsuspended = stats.threads_unsuspended,
        modules = stats.modules_scanned,
        words = stats.words_scanned,
        marked = stats.chunks_marked,
        degraded = stats.is_degraded(),
        "stop-the-world episode finished"
    );
    (result, stats)
}
