//! # Global Roots
//!
//! Writable data of every loaded module is a root: statics, `.data`,
//! `.bss` and their platform equivalents. The platform enumerates modules;
//! the header parsing that finds their writable ranges lives here.
//!
//! A module whose header cannot be parsed is skipped and counted as a
//! degraded scan, except for the process's own image, which is fatal.

#[cfg(target_os = "linux")]
pub(crate) mod elf;
#[cfg(any(windows, test))]
pub(crate) mod pe;

use crate::fatal::{self, FatalError, FatalPolicy};
use crate::frontier::{scan_range_for_pointers, Frontier};
use crate::heap::{ChunkTag, TrackedHeap};
use crate::platform::Platform;
use crate::stoptheworld::EpisodeStats;

/// Scan the writable data of every loaded module, marking the chunks it
/// references as reachable and queueing them on `frontier`.
///
/// Must only be called while the world is stopped or while module data is
/// otherwise known to be stable.
pub fn collect_global_roots<H, P>(
    platform: &P,
    heap: &mut H,
    frontier: &mut Frontier,
    stats: &mut EpisodeStats,
    fatal_policy: FatalPolicy,
) where
    H: TrackedHeap + ?Sized,
    P: Platform + ?Sized,
{
    platform.for_each_module(&mut |module, sections| match sections {
        Ok(sections) => {
            stats.modules_scanned += 1;
            for range in sections {
                // SAFETY: the platform reports only mapped, writable
                // segments of modules that cannot be unloaded while the
                // loader lock is held.
                let count = unsafe {
                    scan_range_for_pointers(range, heap, Some(&mut *frontier), ChunkTag::Reachable, None)
                };
                stats.root_ranges += 1;
                stats.words_scanned += count.words;
                stats.chunks_marked += count.marked;
            }
        }
        Err(err) if module.is_main_image => {
            fatal::die(fatal_policy, FatalError::MainImageHeader(err))
        }
        Err(_) => stats.modules_skipped += 1,
    });
}
