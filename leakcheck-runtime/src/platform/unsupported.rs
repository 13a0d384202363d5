//! Fallback for targets without a suspender. Every episode fails with
//! [`SuspendError::Unsupported`].

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{LoadedModule, ModuleSections, OsThreadId, Platform, RegisterBlock, SuspendedThreads, ThreadBounds};
use crate::config::PlatformConfig;
use crate::error::{RegistersUnavailable, SuspendError};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_ID.fetch_add(1, Ordering::Relaxed);
}

/// Platform layer for targets without a suspender.
#[derive(Debug, Default)]
pub struct UnsupportedPlatform {
    _private: (),
}

impl UnsupportedPlatform {
    /// Create the platform layer. Never fails.
    pub fn new(_config: &PlatformConfig) -> io::Result<Self> {
        Ok(Self::default())
    }
}

/// Never constructed.
pub enum NoThreads {}

impl SuspendedThreads for NoThreads {
    fn thread_count(&self) -> usize {
        match *self {}
    }

    fn thread_id(&self, _index: usize) -> OsThreadId {
        match *self {}
    }

    fn registers_and_sp(&self, _index: usize) -> Result<(&RegisterBlock, usize), RegistersUnavailable> {
        match *self {}
    }
}

impl Platform for UnsupportedPlatform {
    type Suspended = NoThreads;

    fn current_os_thread_id(&self) -> OsThreadId {
        OsThreadId(THREAD_ID.with(|id| *id))
    }

    fn current_thread_bounds(&self, _is_main_thread: bool) -> ThreadBounds {
        ThreadBounds::default()
    }

    fn suspend_all(&self) -> Result<NoThreads, SuspendError> {
        Err(SuspendError::Unsupported)
    }

    fn for_each_module(&self, _visit: &mut dyn FnMut(&LoadedModule<'_>, ModuleSections<'_>)) {}
}
