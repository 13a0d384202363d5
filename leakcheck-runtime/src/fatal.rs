//! Fatal Error Handling
//!
//! Some conditions leave the leak checker unable to continue safely: the
//! thread snapshot cannot be taken, a disable counter underflows, the lock
//! order is violated, or the process's own image has no readable header.
//! These never surface as `Result`s. They are routed through [`die`].
//!
//! `die` may be reached while other threads are frozen, so the abort path
//! formats into a fixed stack buffer and writes it with a raw `write(2)`;
//! it never touches the heap.
//!
//! Embedders and tests that need to observe fatal paths can select
//! [`FatalPolicy::Panic`], which turns them into ordinary panics.

use std::fmt::{self, Write as _};

use thiserror::Error;

use crate::error::{ModuleError, SuspendError};

/// What to do when a fatal condition is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Print a message to stderr and abort the process (default).
    #[default]
    Abort,
    /// Panic with the error message.
    Panic,
}

impl FatalPolicy {
    /// Parse a policy from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "abort" | "die" => Some(FatalPolicy::Abort),
            "panic" => Some(FatalPolicy::Panic),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FatalPolicy::Abort => "abort",
            FatalPolicy::Panic => "panic",
        }
    }
}

/// A condition that makes continuing the leak check unsafe.
#[derive(Debug, Error)]
pub enum FatalError {
    /// The thread enumeration snapshot could not be obtained.
    #[error("cannot stop the world: {0}")]
    ThreadEnumeration(#[source] SuspendError),

    /// `enable_in_this_thread` was called more often than `disable_in_this_thread`.
    #[error("unmatched call to enable_in_this_thread (disable counter underflow)")]
    DisableCounterUnderflow,

    /// The allocator lock was held while acquiring the registry lock.
    #[error("lock order violation: registry lock requested while holding the allocator lock")]
    LockOrderViolation,

    /// The process's own image header could not be parsed.
    #[error("main executable header unreadable: {0}")]
    MainImageHeader(#[source] ModuleError),

    /// The platform never ran the episode body.
    #[error("platform returned without running the stop-the-world episode")]
    WorldNotStopped,

    /// The tracer thread could not be spawned.
    #[error("cannot spawn tracer thread: {0}")]
    TracerSpawn(#[source] std::io::Error),
}

/// Terminate according to `policy`.
pub fn die(policy: FatalPolicy, error: FatalError) -> ! {
    match policy {
        FatalPolicy::Panic => panic!("leakcheck fatal error: {}", error),
        FatalPolicy::Abort => {
            let mut buf = StackBuf::new();
            let _ = writeln!(buf, "==leakcheck== FATAL: {}", error);
            write_stderr(buf.as_bytes());
            std::process::abort()
        }
    }
}

/// Fixed-size formatting buffer; output past capacity is truncated.
struct StackBuf {
    bytes: [u8; 512],
    len: usize,
}

impl StackBuf {
    fn new() -> Self {
        Self {
            bytes: [0; 512],
            len: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl fmt::Write for StackBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.bytes.len() - self.len;
        let n = s.len().min(room);
        self.bytes[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

#[cfg(unix)]
fn write_stderr(bytes: &[u8]) {
    let mut rest = bytes;
    while !rest.is_empty() {
        let n = unsafe { libc::write(libc::STDERR_FILENO, rest.as_ptr().cast(), rest.len()) };
        if n <= 0 {
            return;
        }
        rest = &rest[n as usize..];
    }
}

#[cfg(not(unix))]
fn write_stderr(bytes: &[u8]) {
    use std::io::Write;
    let _ = std::io::stderr().write_all(bytes);
}
