//! # Platform Layer
//!
//! Everything the leak checker needs from the operating system, behind one
//! trait so the reachability engine never sees an OS type.
//!
//! ## Responsibilities
//!
//! - Identify the calling thread and report its stack and static TLS bounds.
//! - Suspend every other thread of the process and capture its registers
//!   ([`Platform::suspend_all`]). Resumption happens when the returned
//!   [`SuspendedThreads`] value is dropped.
//! - Enumerate loaded modules and their writable data ranges.
//! - Optionally contribute extra root ranges the OS keeps for us.
//!
//! ## Implementations
//!
//! | Target | Type | Suspension |
//! |--------|------|------------|
//! | Linux | `LinuxPlatform` | signal-parked threads, registers copied from the signal frame |
//! | Windows | `WindowsPlatform` | `SuspendThread` + `GetThreadContext` |
//! | other | `UnsupportedPlatform` | always fails |
//!
//! [`NativePlatform`] names the implementation for the build target.

use std::fmt;

use crate::error::{ModuleError, RegistersUnavailable, SuspendError};
use crate::frontier::{AddressRange, WORD_SIZE};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::LinuxPlatform as NativePlatform;

#[cfg(windows)]
mod win32;
#[cfg(windows)]
pub use self::win32::WindowsPlatform as NativePlatform;

#[cfg(not(any(target_os = "linux", windows)))]
mod unsupported;
#[cfg(not(any(target_os = "linux", windows)))]
pub use self::unsupported::UnsupportedPlatform as NativePlatform;

/// Operating-system thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OsThreadId(pub u64);

impl fmt::Display for OsThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stack and static TLS bounds of a thread, as seen from that thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadBounds {
    /// The whole stack mapping. The live part starts at the stack pointer.
    pub stack: AddressRange,
    /// Static thread-local storage. Empty if unknown.
    pub tls: AddressRange,
}

/// Words in a [`RegisterBlock`]. Large enough for the general-purpose
/// register file of every supported architecture.
pub const REGISTER_BLOCK_WORDS: usize = 192;

/// A captured register file, stored as raw words for scanning.
#[derive(Clone)]
#[repr(C)]
pub struct RegisterBlock {
    words: [usize; REGISTER_BLOCK_WORDS],
    len: usize,
}

impl RegisterBlock {
    /// An empty block.
    pub const fn new() -> Self {
        Self {
            words: [0; REGISTER_BLOCK_WORDS],
            len: 0,
        }
    }

    /// Build a block from register values. Extra words are dropped.
    pub fn from_words(values: &[usize]) -> Self {
        let mut block = Self::new();
        let n = values.len().min(REGISTER_BLOCK_WORDS);
        block.words[..n].copy_from_slice(&values[..n]);
        block.len = n;
        block
    }

    /// Copy up to `bytes` bytes of a raw register context.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `bytes` bytes.
    #[cfg_attr(not(any(target_os = "linux", windows)), allow(dead_code))]
    pub(crate) unsafe fn fill_from_raw(&mut self, src: *const u8, bytes: usize) {
        let n = (bytes / WORD_SIZE).min(REGISTER_BLOCK_WORDS);
        // SAFETY: the caller vouches for `src`; the destination holds
        // REGISTER_BLOCK_WORDS words. Unaligned source reads are allowed.
        unsafe {
            std::ptr::copy_nonoverlapping(src, self.words.as_mut_ptr().cast::<u8>(), n * WORD_SIZE);
        }
        self.len = n;
    }

    /// The captured words.
    pub fn as_words(&self) -> &[usize] {
        &self.words[..self.len]
    }

    /// The captured words as a scannable range of this block's own memory.
    pub fn range(&self) -> AddressRange {
        let words = self.as_words();
        AddressRange::from_base_len(words.as_ptr() as usize, std::mem::size_of_val(words))
    }
}

impl Default for RegisterBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RegisterBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterBlock").field("len", &self.len).finish()
    }
}

/// The threads frozen by [`Platform::suspend_all`].
///
/// Listed threads stay suspended while this value lives and are resumed
/// when it is dropped. The list never contains the suspending thread and
/// never contains an id twice.
pub trait SuspendedThreads {
    /// Number of suspended threads.
    fn thread_count(&self) -> usize;

    /// OS id of the thread at `index`.
    fn thread_id(&self, index: usize) -> OsThreadId;

    /// Captured registers and stack pointer of the thread at `index`.
    fn registers_and_sp(&self, index: usize) -> Result<(&RegisterBlock, usize), RegistersUnavailable>;

    /// Live threads that could not be suspended and kept running. They are
    /// not in the list, and their roots are not scanned.
    fn threads_skipped(&self) -> usize {
        0
    }
}

/// A loaded module as reported by the OS loader.
#[derive(Debug, Clone, Copy)]
pub struct LoadedModule<'a> {
    /// Path or name, as the loader reports it. May be empty.
    pub name: &'a [u8],
    /// Load address.
    pub base: usize,
    /// Whether this is the process's own executable.
    pub is_main_image: bool,
}

/// Writable data ranges of a module, or why its header could not be read.
pub type ModuleSections<'a> = Result<&'a mut dyn Iterator<Item = AddressRange>, ModuleError>;

/// Operating-system services used by the leak checker.
pub trait Platform: Sync {
    /// The frozen-threads list produced by [`Platform::suspend_all`].
    type Suspended: SuspendedThreads;

    /// OS id of the calling thread.
    fn current_os_thread_id(&self) -> OsThreadId;

    /// Stack and TLS bounds of the calling thread.
    fn current_thread_bounds(&self, is_main_thread: bool) -> ThreadBounds;

    /// Run `body` exactly once, holding the dynamic loader's lock where the
    /// platform exposes one, so no module can be loaded or unloaded while
    /// the world is stopped.
    ///
    /// Platforms without an accessible loader lock run `body` directly.
    /// Their [`Platform::for_each_module`] must then work from a module list
    /// captured before the first thread is suspended.
    fn with_loader_lock(&self, body: &mut dyn FnMut()) {
        body()
    }

    /// Suspend every other thread of the process.
    fn suspend_all(&self) -> Result<Self::Suspended, SuspendError>;

    /// Visit every loaded module together with its writable data ranges.
    fn for_each_module(&self, visit: &mut dyn FnMut(&LoadedModule<'_>, ModuleSections<'_>));

    /// Visit extra root ranges kept by the OS on the process's behalf.
    fn for_each_platform_root(&self, _visit: &mut dyn FnMut(AddressRange)) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_block_from_words() {
        let block = RegisterBlock::from_words(&[1, 2, 3]);
        assert_eq!(block.as_words(), &[1, 2, 3]);
        assert_eq!(block.range().len(), 3 * WORD_SIZE);

        let many = vec![7usize; REGISTER_BLOCK_WORDS + 10];
        assert_eq!(RegisterBlock::from_words(&many).as_words().len(), REGISTER_BLOCK_WORDS);
    }

    #[test]
    fn test_register_block_fill_from_raw() {
        let raw: [u64; 3] = [0xaa, 0xbb, 0xcc];
        let mut block = RegisterBlock::new();
        unsafe { block.fill_from_raw(raw.as_ptr().cast(), std::mem::size_of_val(&raw)) };
        assert_eq!(block.as_words().len(), 24 / WORD_SIZE);
        assert_eq!(block.as_words()[0] as u64 & 0xff, 0xaa);
    }

    #[test]
    fn test_native_platform_reports_current_thread() {
        let config = crate::config::PlatformConfig::default();
        let Ok(platform) = NativePlatform::new(&config) else {
            return;
        };
        let a = platform.current_os_thread_id();
        let b = platform.current_os_thread_id();
        assert_eq!(a, b);

        let other = std::thread::spawn(move || {
            NativePlatform::new(&crate::config::PlatformConfig::default())
                .map(|p| p.current_os_thread_id())
                .ok()
        })
        .join()
        .unwrap();
        if let Some(other) = other {
            assert_ne!(a, other);
        }
    }

    #[cfg(any(target_os = "linux", windows))]
    #[test]
    fn test_native_stack_bounds_contain_local() {
        let platform = NativePlatform::new(&crate::config::PlatformConfig::default()).unwrap();
        let local = 0u64;
        let bounds = platform.current_thread_bounds(false);
        assert!(bounds.stack.contains(&local as *const u64 as usize));
    }
}
