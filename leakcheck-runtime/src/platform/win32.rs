//! Windows platform layer.
//!
//! ## Suspension
//!
//! A Toolhelp snapshot lists the process's threads. Each one other than
//! the caller is opened, suspended with `SuspendThread`, and its full
//! register context is captured right away with `GetThreadContext` (which
//! also waits for the suspension to take effect). Threads that exited
//! after the snapshot fail to open and are dropped; threads that open but
//! refuse `SuspendThread` are counted as skipped. Dropping the list resumes
//! and closes every handle.
//!
//! Episodes are serialized process-wide, so two tracers never suspend
//! each other. Nothing is allocated once the first thread is suspended: the
//! thread list, the module list, the per-thread slots and the context
//! buffer are all reserved up front.
//!
//! ## Modules
//!
//! The loader lock is not reachable from outside ntdll, and a module
//! snapshot both allocates and takes it. `suspend_all` therefore records
//! every module's base and size before the first thread is suspended, and
//! [`WindowsPlatform::for_each_module`] on the tracer replays that record.
//! Each image is checked with `VirtualQuery` before its PE headers are
//! parsed, so a module unloaded in between is skipped rather than read.
//! Outside an episode a fresh snapshot is taken.

use std::cell::Cell;
use std::ffi::c_void;
use std::io;
use std::mem;
use std::slice;

use parking_lot::{const_mutex, Mutex, MutexGuard};
use windows::Win32::Foundation::{CloseHandle, BOOL, HANDLE};
use windows::Win32::System::Diagnostics::Debug::{GetThreadContext, CONTEXT};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, Thread32First, Thread32Next, MODULEENTRY32W,
    TH32CS_SNAPMODULE, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows::Win32::System::Memory::{VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_IMAGE};
use windows::Win32::System::Threading::{
    GetCurrentProcessId, GetCurrentThreadId, GetCurrentThreadStackLimits, OpenThread, ResumeThread, SuspendThread,
    THREAD_GET_CONTEXT, THREAD_QUERY_INFORMATION, THREAD_SUSPEND_RESUME,
};

#[cfg(target_arch = "x86_64")]
use windows::Win32::System::Diagnostics::Debug::CONTEXT_ALL_AMD64 as CONTEXT_ALL;
#[cfg(target_arch = "aarch64")]
use windows::Win32::System::Diagnostics::Debug::CONTEXT_ALL_ARM64 as CONTEXT_ALL;

use super::{
    LoadedModule, ModuleSections, OsThreadId, Platform, RegisterBlock, SuspendedThreads, ThreadBounds,
};
use crate::config::PlatformConfig;
use crate::error::{ModuleError, RegistersUnavailable, SuspendError};
use crate::frontier::AddressRange;
use crate::globals::pe;

/// One episode at a time per process, across contexts.
static EPISODE_LOCK: Mutex<()> = const_mutex(());

/// Modules recorded for the running episode. Only locked by the thread
/// holding `EPISODE_LOCK`.
static FROZEN_MODULES: Mutex<Vec<ModuleRecord>> = const_mutex(Vec::new());

thread_local! {
    /// Set on the tracer while its threads are suspended.
    static IN_EPISODE: Cell<bool> = const { Cell::new(false) };
}

const MODULE_NAME_LEN: usize = 256;

/// A loaded module's name and mapped extent.
struct ModuleRecord {
    name: [u8; MODULE_NAME_LEN],
    name_len: usize,
    base: usize,
    size: usize,
}

impl ModuleRecord {
    fn name(&self) -> &[u8] {
        &self.name[..self.name_len]
    }
}

/// Windows implementation of [`Platform`].
#[derive(Debug, Default)]
pub struct WindowsPlatform {
    _private: (),
}

impl WindowsPlatform {
    /// Create the platform layer. Never fails.
    pub fn new(_config: &PlatformConfig) -> io::Result<Self> {
        Ok(Self::default())
    }
}

struct FrozenThread {
    os_id: u32,
    handle: HANDLE,
    captured: Option<(RegisterBlock, usize)>,
}

/// Threads suspended by [`WindowsPlatform::suspend_all`]. Dropping resumes them.
pub struct WindowsSuspendedThreads {
    threads: Vec<FrozenThread>,
    skipped: usize,
    _episode: MutexGuard<'static, ()>,
}

impl SuspendedThreads for WindowsSuspendedThreads {
    fn thread_count(&self) -> usize {
        self.threads.len()
    }

    fn thread_id(&self, index: usize) -> OsThreadId {
        OsThreadId(u64::from(self.threads[index].os_id))
    }

    fn registers_and_sp(&self, index: usize) -> Result<(&RegisterBlock, usize), RegistersUnavailable> {
        let thread = &self.threads[index];
        match &thread.captured {
            Some((registers, sp)) => Ok((registers, *sp)),
            None => Err(RegistersUnavailable {
                os_id: u64::from(thread.os_id),
            }),
        }
    }

    fn threads_skipped(&self) -> usize {
        self.skipped
    }
}

impl Drop for WindowsSuspendedThreads {
    fn drop(&mut self) {
        for thread in &self.threads {
            // SAFETY: the handle was opened with THREAD_SUSPEND_RESUME and
            // is owned by this list.
            unsafe {
                ResumeThread(thread.handle);
                let _ = CloseHandle(thread.handle);
            }
        }
        IN_EPISODE.with(|flag| flag.set(false));
    }
}

/// Closes a Toolhelp snapshot handle.
struct Snapshot(HANDLE);

impl Drop for Snapshot {
    fn drop(&mut self) {
        // SAFETY: the snapshot handle is owned.
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn process_thread_ids() -> io::Result<Vec<u32>> {
    // SAFETY: plain Win32 calls on an owned snapshot handle.
    unsafe {
        let snapshot = Snapshot(CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0)?);
        let pid = GetCurrentProcessId();
        let own = GetCurrentThreadId();

        let mut entry = THREADENTRY32 {
            dwSize: mem::size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };
        let mut ids = Vec::new();
        let mut more = Thread32First(snapshot.0, &mut entry).is_ok();
        while more {
            if entry.th32OwnerProcessID == pid && entry.th32ThreadID != own {
                ids.push(entry.th32ThreadID);
            }
            more = Thread32Next(snapshot.0, &mut entry).is_ok();
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}

/// Replace `records` with the process's loaded modules, main image first.
fn capture_modules(records: &mut Vec<ModuleRecord>) -> io::Result<()> {
    records.clear();
    // SAFETY: plain Win32 calls on an owned snapshot handle.
    unsafe {
        let snapshot = Snapshot(CreateToolhelp32Snapshot(TH32CS_SNAPMODULE, 0)?);
        let mut entry = MODULEENTRY32W {
            dwSize: mem::size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };
        let mut more = Module32FirstW(snapshot.0, &mut entry).is_ok();
        while more {
            let mut record = ModuleRecord {
                name: [0; MODULE_NAME_LEN],
                name_len: 0,
                base: entry.modBaseAddr as usize,
                size: entry.modBaseSize as usize,
            };
            record.name_len = narrow_name(&entry.szModule, &mut record.name).len();
            records.push(record);
            more = Module32NextW(snapshot.0, &mut entry).is_ok();
        }
    }
    Ok(())
}

/// Whether `base` still starts a mapped image.
fn image_mapped_at(base: usize) -> bool {
    let mut info = MEMORY_BASIC_INFORMATION::default();
    // SAFETY: VirtualQuery only writes the out-structure.
    let written = unsafe {
        VirtualQuery(
            Some(base as *const c_void),
            &mut info,
            mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    written != 0 && info.Type == MEM_IMAGE && info.AllocationBase as usize == base
}

fn visit_modules(records: &[ModuleRecord], visit: &mut dyn FnMut(&LoadedModule<'_>, ModuleSections<'_>)) {
    for (index, record) in records.iter().enumerate() {
        let module = LoadedModule {
            name: record.name(),
            base: record.base,
            is_main_image: index == 0,
        };
        if record.base == 0 || !image_mapped_at(record.base) {
            visit(&module, Err(ModuleError::MissingHeader));
            continue;
        }
        // SAFETY: the image is mapped at `base` for `size` bytes, and its
        // module cannot be unloaded while every other thread is suspended.
        let image = unsafe { slice::from_raw_parts(record.base as *const u8, record.size) };
        match pe::writable_data_sections(image, record.base) {
            Ok(mut sections) => {
                let sections: &mut dyn Iterator<Item = AddressRange> = &mut sections;
                visit(&module, Ok(sections))
            }
            Err(err) => visit(&module, Err(err)),
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn context_sp(context: &CONTEXT) -> usize {
    context.Rsp as usize
}

#[cfg(target_arch = "aarch64")]
fn context_sp(context: &CONTEXT) -> usize {
    context.Sp as usize
}

impl Platform for WindowsPlatform {
    type Suspended = WindowsSuspendedThreads;

    fn current_os_thread_id(&self) -> OsThreadId {
        // SAFETY: no preconditions.
        OsThreadId(u64::from(unsafe { GetCurrentThreadId() }))
    }

    fn current_thread_bounds(&self, _is_main_thread: bool) -> ThreadBounds {
        let (mut low, mut high) = (0usize, 0usize);
        // SAFETY: both out-pointers are valid.
        unsafe { GetCurrentThreadStackLimits(&mut low, &mut high) };
        ThreadBounds {
            stack: AddressRange::new(low, high),
            tls: AddressRange::EMPTY,
        }
    }

    fn suspend_all(&self) -> Result<WindowsSuspendedThreads, SuspendError> {
        let episode = EPISODE_LOCK.lock();
        if let Err(err) = capture_modules(&mut FROZEN_MODULES.lock()) {
            tracing::debug!(error = %err, "module snapshot failed; globals will not be scanned");
        }
        let ids = process_thread_ids().map_err(SuspendError::EnumerationUnavailable)?;
        let mut threads = Vec::with_capacity(ids.len());
        let mut skipped = 0;
        let mut context = Box::<CONTEXT>::default();

        for &os_id in &ids {
            // SAFETY: plain Win32 calls; the handle is owned by `threads`
            // once pushed, and closed here otherwise.
            unsafe {
                let Ok(handle) = OpenThread(
                    THREAD_SUSPEND_RESUME | THREAD_GET_CONTEXT | THREAD_QUERY_INFORMATION,
                    BOOL::from(false),
                    os_id,
                ) else {
                    continue;
                };
                if SuspendThread(handle) == u32::MAX {
                    let _ = CloseHandle(handle);
                    skipped += 1;
                    continue;
                }

                context.ContextFlags = CONTEXT_ALL;
                let captured = match GetThreadContext(handle, &mut *context) {
                    Ok(()) => {
                        let mut registers = RegisterBlock::new();
                        registers.fill_from_raw(
                            (&*context as *const CONTEXT).cast::<u8>(),
                            mem::size_of::<CONTEXT>(),
                        );
                        Some((registers, context_sp(&context)))
                    }
                    Err(_) => None,
                };
                threads.push(FrozenThread {
                    os_id,
                    handle,
                    captured,
                });
            }
        }

        IN_EPISODE.with(|flag| flag.set(true));
        Ok(WindowsSuspendedThreads {
            threads,
            skipped,
            _episode: episode,
        })
    }

    fn for_each_module(&self, visit: &mut dyn FnMut(&LoadedModule<'_>, ModuleSections<'_>)) {
        if IN_EPISODE.with(Cell::get) {
            visit_modules(&FROZEN_MODULES.lock(), visit);
            return;
        }
        let mut records = Vec::new();
        match capture_modules(&mut records) {
            Ok(()) => visit_modules(&records, visit),
            Err(err) => tracing::debug!(error = %err, "module snapshot failed"),
        }
    }
}

/// Lossy ASCII copy of a NUL-terminated UTF-16 module name.
fn narrow_name<'a>(wide: &[u16], buf: &'a mut [u8; MODULE_NAME_LEN]) -> &'a [u8] {
    let mut len = 0;
    for &unit in wide.iter().take_while(|&&u| u != 0).take(buf.len()) {
        buf[len] = if unit < 0x80 { unit as u8 } else { b'?' };
        len += 1;
    }
    &buf[..len]
}
