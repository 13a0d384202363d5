//! Per-thread disable counters.
//!
//! While a thread's counter is positive, allocations it makes are not
//! reported as leaks. The policy is applied by the allocator at allocation
//! time (see [`crate::LeakContext::track_allocation`]); this module only
//! keeps the counters.

use std::cell::Cell;

use thread_local::ThreadLocal;

/// `enable` was called with the counter already at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CounterUnderflow;

/// One disable counter per thread, owned by a leak-check context.
#[derive(Debug, Default)]
pub(crate) struct DisableCounters {
    counters: ThreadLocal<Cell<u32>>,
}

impl DisableCounters {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn counter(&self) -> &Cell<u32> {
        self.counters.get_or(|| Cell::new(0))
    }

    pub(crate) fn disable(&self) {
        let counter = self.counter();
        counter.set(counter.get().saturating_add(1));
    }

    pub(crate) fn enable(&self) -> Result<(), CounterUnderflow> {
        let counter = self.counter();
        match counter.get() {
            0 => Err(CounterUnderflow),
            n => {
                counter.set(n - 1);
                Ok(())
            }
        }
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.counters.get().is_some_and(|c| c.get() > 0)
    }

    pub(crate) fn depth(&self) -> u32 {
        self.counters.get().map_or(0, Cell::get)
    }
}
