//! Error Types
//!
//! Recoverable errors produced by the leak checker. Conditions that make an
//! episode meaningless are not represented here; they go through
//! [`crate::fatal`] instead.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Top-level error for context construction and embedding APIs.
#[derive(Debug, Error)]
pub enum LeakError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The platform layer could not be initialized.
    #[error("platform initialization failed: {0}")]
    Platform(#[source] io::Error),
}

/// Failure to produce a suspended-threads list.
#[derive(Debug, Error)]
pub enum SuspendError {
    /// The OS refused to hand out a thread enumeration snapshot.
    #[error("thread enumeration snapshot unavailable: {0}")]
    EnumerationUnavailable(#[source] io::Error),

    /// This target has no suspender implementation.
    #[error("stopping the world is not supported on this platform")]
    Unsupported,
}

/// The OS refused to hand back a register context for a suspended thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("register context unavailable for thread {os_id}")]
pub struct RegistersUnavailable {
    /// OS id of the thread whose context could not be captured.
    pub os_id: u64,
}

/// A module header that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    /// The loader reported no header for the module.
    #[error("module header missing")]
    MissingHeader,

    /// The header bytes are shorter than the structures they declare.
    #[error("module header truncated at offset {offset:#x}")]
    Truncated {
        /// Offset at which the header ran out.
        offset: usize,
    },

    /// A magic number or signature did not match.
    #[error("bad {what} signature")]
    BadSignature {
        /// Which signature failed.
        what: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegistersUnavailable { os_id: 42 };
        assert!(err.to_string().contains("42"));

        let err = ModuleError::Truncated { offset: 0x40 };
        assert!(err.to_string().contains("0x40"));

        let err = SuspendError::EnumerationUnavailable(io::Error::from(io::ErrorKind::NotFound));
        assert!(err.to_string().contains("snapshot unavailable"));
    }
}
