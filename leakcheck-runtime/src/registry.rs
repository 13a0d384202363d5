//! # Thread Registry
//!
//! Per-thread context records: the bounds a thread reported when it
//! started (stack, static TLS, allocator cache) and its OS id, so a
//! suspended thread can be matched back to its ranges.
//!
//! The registry is guarded by the registry lock in [`crate::LeakContext`].
//! Lookups by OS id walk the slot table and never allocate; they run while
//! the world is stopped.
//!
//! Thread ids are small integers. The main thread is [`MAIN_TID`]. Slots
//! of finished threads are reused, oldest first.

use std::collections::VecDeque;
use std::fmt;

use thiserror::Error;

use crate::frontier::AddressRange;
use crate::platform::{OsThreadId, ThreadBounds};

/// Registry-assigned thread id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Id of the first registered thread.
pub const MAIN_TID: Tid = Tid(0);

/// Lifecycle state of a registered thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created but not yet started.
    Created,
    /// Started; its ranges are recorded.
    Running,
    /// Finished; the slot is waiting to be reused.
    Finished,
}

/// Registry misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No thread with this id exists.
    #[error("unknown thread {0}")]
    UnknownThread(Tid),

    /// The requested transition is not valid from the current status.
    #[error("thread {tid} cannot transition from {from:?}")]
    InvalidTransition {
        /// The thread.
        tid: Tid,
        /// Its current status.
        from: ThreadStatus,
    },
}

/// What a thread reports about itself when it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadStartInfo {
    /// Stack and static TLS bounds.
    pub bounds: ThreadBounds,
    /// The allocator's private cache for this thread.
    pub cache: AddressRange,
}

/// One registered thread.
#[derive(Debug, Clone)]
pub struct ThreadContext {
    tid: Tid,
    parent: Option<Tid>,
    os_id: Option<OsThreadId>,
    status: ThreadStatus,
    stack: AddressRange,
    tls: AddressRange,
    cache: AddressRange,
}

impl ThreadContext {
    fn new(tid: Tid, parent: Option<Tid>) -> Self {
        Self {
            tid,
            parent,
            os_id: None,
            status: ThreadStatus::Created,
            stack: AddressRange::EMPTY,
            tls: AddressRange::EMPTY,
            cache: AddressRange::EMPTY,
        }
    }

    /// Registry id.
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// The creating thread, if any.
    pub fn parent(&self) -> Option<Tid> {
        self.parent
    }

    /// OS id, once started.
    pub fn os_id(&self) -> Option<OsThreadId> {
        self.os_id
    }

    /// Lifecycle state.
    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    /// The recorded stack mapping.
    pub fn stack(&self) -> AddressRange {
        self.stack
    }

    /// The recorded static TLS block.
    pub fn tls(&self) -> AddressRange {
        self.tls
    }

    /// The recorded allocator cache.
    pub fn cache(&self) -> AddressRange {
        self.cache
    }
}

/// The registry proper. Obtain it through [`crate::LeakContext::lock_registry`].
#[derive(Debug, Default)]
pub struct RegistryState {
    slots: Vec<ThreadContext>,
    reusable: VecDeque<u32>,
    running: usize,
}

impl RegistryState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Create a thread record in the `Created` state.
    pub fn create_thread(&mut self, parent: Option<Tid>) -> Tid {
        if let Some(index) = self.reusable.pop_front() {
            let tid = Tid(index);
            self.slots[index as usize] = ThreadContext::new(tid, parent);
            return tid;
        }
        let tid = Tid(self.slots.len() as u32);
        self.slots.push(ThreadContext::new(tid, parent));
        tid
    }

    /// Record a created thread's OS id and ranges and mark it running.
    pub fn start_thread(
        &mut self,
        tid: Tid,
        os_id: OsThreadId,
        info: ThreadStartInfo,
    ) -> Result<(), RegistryError> {
        let ctx = self.slot_mut(tid)?;
        if ctx.status != ThreadStatus::Created {
            return Err(RegistryError::InvalidTransition { tid, from: ctx.status });
        }
        ctx.os_id = Some(os_id);
        ctx.stack = info.bounds.stack;
        ctx.tls = info.bounds.tls;
        ctx.cache = info.cache;
        ctx.status = ThreadStatus::Running;
        self.running += 1;
        Ok(())
    }

    /// Mark a thread finished and queue its slot for reuse.
    pub fn finish_thread(&mut self, tid: Tid) -> Result<(), RegistryError> {
        let ctx = self.slot_mut(tid)?;
        let was_running = match ctx.status {
            ThreadStatus::Running => true,
            ThreadStatus::Created => false,
            ThreadStatus::Finished => {
                return Err(RegistryError::InvalidTransition { tid, from: ctx.status })
            }
        };
        ctx.status = ThreadStatus::Finished;
        if was_running {
            self.running -= 1;
        }
        self.reusable.push_back(tid.0);
        Ok(())
    }

    /// The record for `tid`, unless its slot has finished.
    pub fn get(&self, tid: Tid) -> Option<&ThreadContext> {
        self.slots
            .get(tid.0 as usize)
            .filter(|ctx| ctx.status != ThreadStatus::Finished)
    }

    /// The running thread with OS id `os_id`.
    pub fn find_context_by_os_id(&self, os_id: OsThreadId) -> Option<&ThreadContext> {
        self.slots
            .iter()
            .find(|ctx| ctx.status == ThreadStatus::Running && ctx.os_id == Some(os_id))
    }

    /// Visit every thread that has not finished.
    pub fn for_each_known_thread(&self, mut visit: impl FnMut(&ThreadContext)) {
        for ctx in self.slots.iter().filter(|ctx| ctx.status != ThreadStatus::Finished) {
            visit(ctx);
        }
    }

    /// Number of running threads.
    pub fn running_count(&self) -> usize {
        self.running
    }

    fn slot_mut(&mut self, tid: Tid) -> Result<&mut ThreadContext, RegistryError> {
        self.slots
            .get_mut(tid.0 as usize)
            .ok_or(RegistryError::UnknownThread(tid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(stack_begin: usize) -> ThreadStartInfo {
        ThreadStartInfo {
            bounds: ThreadBounds {
                stack: AddressRange::new(stack_begin, stack_begin + 0x1000),
                tls: AddressRange::EMPTY,
            },
            cache: AddressRange::EMPTY,
        }
    }

    #[test]
    fn test_main_thread_gets_tid_zero() {
        let mut registry = RegistryState::new();
        assert_eq!(registry.create_thread(None), MAIN_TID);
        assert_eq!(registry.create_thread(Some(MAIN_TID)), Tid(1));
    }

    #[test]
    fn test_lifecycle_and_lookup() {
        let mut registry = RegistryState::new();
        let tid = registry.create_thread(None);
        assert!(registry.find_context_by_os_id(OsThreadId(100)).is_none());

        registry.start_thread(tid, OsThreadId(100), info(0x10000)).unwrap();
        assert_eq!(registry.running_count(), 1);
        let ctx = registry.find_context_by_os_id(OsThreadId(100)).unwrap();
        assert_eq!(ctx.tid(), tid);
        assert_eq!(ctx.stack(), AddressRange::new(0x10000, 0x11000));

        registry.finish_thread(tid).unwrap();
        assert_eq!(registry.running_count(), 0);
        assert!(registry.find_context_by_os_id(OsThreadId(100)).is_none());
        assert!(registry.get(tid).is_none());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut registry = RegistryState::new();
        let tid = registry.create_thread(None);
        registry.start_thread(tid, OsThreadId(1), info(0)).unwrap();
        assert_eq!(
            registry.start_thread(tid, OsThreadId(1), info(0)),
            Err(RegistryError::InvalidTransition {
                tid,
                from: ThreadStatus::Running
            })
        );
        registry.finish_thread(tid).unwrap();
        assert!(registry.finish_thread(tid).is_err());
        assert_eq!(
            registry.finish_thread(Tid(99)),
            Err(RegistryError::UnknownThread(Tid(99)))
        );
    }

    #[test]
    fn test_finished_slots_are_reused() {
        let mut registry = RegistryState::new();
        let main = registry.create_thread(None);
        let a = registry.create_thread(Some(main));
        let b = registry.create_thread(Some(main));
        registry.finish_thread(a).unwrap();
        registry.finish_thread(b).unwrap();

        assert_eq!(registry.create_thread(Some(main)), a);
        assert_eq!(registry.create_thread(Some(main)), b);
        assert_eq!(registry.create_thread(Some(main)), Tid(3));
    }

    #[test]
    fn test_for_each_known_thread_skips_finished() {
        let mut registry = RegistryState::new();
        let main = registry.create_thread(None);
        let child = registry.create_thread(Some(main));
        registry.finish_thread(child).unwrap();

        let mut seen = Vec::new();
        registry.for_each_known_thread(|ctx| seen.push(ctx.tid()));
        assert_eq!(seen, vec![main]);
    }
}
