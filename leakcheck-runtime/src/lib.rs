//! # Leakcheck Runtime Library
//!
//! Conservative, stop-the-world leak detection for processes whose
//! allocator tracks its chunks:
//!
//! - **Stop the World**: Suspend every other thread, capture registers,
//!   resume reliably (`stoptheworld.rs`, `platform/`)
//! - **Root Enumeration**: Registers, live stacks, static TLS, allocator
//!   caches, module globals, registered root regions
//! - **Reachability**: Aligned-word scanning with a pre-reserved frontier
//!   and direct/indirect leak classification (`reachability.rs`)
//! - **Thread Registry**: Per-thread bounds keyed by OS thread id
//!   (`registry.rs`)
//! - **Disable Counters**: Per-thread "do not report" scopes (`disable.rs`)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         LeakContext                              │
//! │            (context.rs: locks, threads, roots, checks)           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Registry   │  │  TrackedHeap │  │   Disable    │          │
//! │  │(registry.rs) │  │  (heap.rs)   │  │ (disable.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                                     │
//! │  ┌──────────────────────────────────┐  ┌──────────────┐        │
//! │  │  Stop-the-world episode (tracer) │──│   Platform   │        │
//! │  │        (stoptheworld.rs)         │  │ (platform/)  │        │
//! │  └──────────────────────────────────┘  └──────────────┘        │
//! │                   │                                             │
//! │  ┌──────────────────────────────────┐  ┌──────────────┐        │
//! │  │ Marking + classification         │──│   Globals    │        │
//! │  │ (reachability.rs, frontier.rs)   │  │  (globals/)  │        │
//! │  └──────────────────────────────────┘  └──────────────┘        │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Logging
//!
//! Diagnostics are emitted through [`tracing`]. Nothing is logged while
//! the world is stopped; episode statistics are logged after resumption.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod context;
pub mod error;
pub mod fatal;
pub mod frontier;
pub mod globals;
pub mod heap;
pub mod platform;
pub mod reachability;
pub mod registry;
pub mod stoptheworld;

mod disable;

// Re-exports
pub use config::{ConfigError, LeakCheckConfig, LeakCheckConfigBuilder, PlatformConfig, ScanConfig};
pub use context::{HeapGuard, LeakContext, RegistryGuard, ScopedDisable};
pub use error::{LeakError, ModuleError, RegistersUnavailable, SuspendError};
pub use fatal::{FatalError, FatalPolicy};
pub use frontier::{scan_range_for_pointers, AddressRange, Frontier, ScanCount};
pub use globals::collect_global_roots;
pub use heap::{ChunkInfo, ChunkTable, ChunkTag, HeapState, IgnoreOutcome, StackId, TrackedHeap};
pub use platform::{
    LoadedModule, ModuleSections, NativePlatform, OsThreadId, Platform, RegisterBlock, SuspendedThreads,
    ThreadBounds,
};
pub use reachability::{classify_leaks, mark_reachable, Leak, LeakKind, LeakReport, ReachabilityEngine};
pub use registry::{RegistryError, RegistryState, ThreadContext, ThreadStatus, Tid, MAIN_TID};
pub use stoptheworld::{EpisodeStats, FrozenWorld};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_context_rejects_invalid_config() {
        let config = LeakCheckConfig::builder().suspend_signal(9).build_unchecked();
        let result = LeakContext::new(config, ChunkTable::new());
        assert!(matches!(result, Err(LeakError::Config(_))));
    }
}
