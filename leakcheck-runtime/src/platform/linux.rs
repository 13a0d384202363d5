//! Linux platform layer.
//!
//! ## Suspension
//!
//! Threads are listed from `/proc/self/task` and each one is sent the
//! configured suspend signal with `tgkill`. The handler claims its slot,
//! copies the interrupted `mcontext_t` and stack pointer into it, publishes
//! "parked" with a release store, and spins until the suspender publishes
//! "resume". Slots are allocated before any signal goes out.
//!
//! | Slot state | Meaning |
//! |------------|---------|
//! | pending | signalled, handler not yet run |
//! | capturing | handler is copying registers |
//! | parked | frozen until resume |
//! | gone | exited before parking |
//! | skipped | alive but never parked |
//! | resumed | handler returned after resume |
//!
//! A thread whose `SigBlk` mask (from `/proc/self/task/<tid>/status`)
//! contains the suspend signal is skipped without being signalled. A thread
//! that has not parked when the suspend timeout expires is skipped too; if
//! its handler runs later it finds the slot claimed and returns at once.
//! Skipped threads keep running, and the episode reports itself degraded.
//!
//! The handler touches only the pre-allocated session, atomics and
//! `sched_yield`, and preserves `errno`.
//!
//! ## Loader Lock
//!
//! glibc holds the loader lock for the duration of `dl_iterate_phdr`
//! callbacks. [`LinuxPlatform::with_loader_lock`] runs the episode inside
//! such a callback so `dlopen`/`dlclose` block until the world resumes.

use std::any::Any;
use std::cell::UnsafeCell;
use std::ffi::{c_int, c_void, CStr};
use std::fs;
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::{const_mutex, Mutex, MutexGuard};

use super::{
    LoadedModule, ModuleSections, OsThreadId, Platform, RegisterBlock, SuspendedThreads, ThreadBounds,
};
use crate::config::PlatformConfig;
use crate::error::{RegistersUnavailable, SuspendError};
use crate::frontier::AddressRange;
use crate::globals::elf::{self, ProgramHeader};

const PENDING: u8 = 0;
const CAPTURING: u8 = 1;
const PARKED: u8 = 2;
const GONE: u8 = 3;
const SKIPPED: u8 = 4;
const RESUMED: u8 = 5;

/// Serializes episodes across every context in the process.
static EPISODE_LOCK: Mutex<()> = const_mutex(());

/// The session parked threads report into. Null outside episodes.
static SESSION: AtomicPtr<Session> = AtomicPtr::new(ptr::null_mut());

/// Handlers currently between loading `SESSION` and returning.
static HANDLERS_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Bit `n` set once the handler is installed for signal `n`.
static INSTALLED: Mutex<u64> = const_mutex(0);

struct ThreadSlot {
    tid: libc::pid_t,
    state: AtomicU8,
    sp: AtomicUsize,
    registers: UnsafeCell<RegisterBlock>,
}

// SAFETY: `registers` is written only by the slot's own thread after it
// claims CAPTURING, and read only by the suspender after observing PARKED.
unsafe impl Sync for ThreadSlot {}

impl ThreadSlot {
    fn new(tid: libc::pid_t, blocks_signal: bool) -> Self {
        Self {
            tid,
            state: AtomicU8::new(if blocks_signal { SKIPPED } else { PENDING }),
            sp: AtomicUsize::new(0),
            registers: UnsafeCell::new(RegisterBlock::new()),
        }
    }
}

struct Session {
    slots: Box<[ThreadSlot]>,
    resume: AtomicBool,
}

/// Linux implementation of [`Platform`].
#[derive(Debug)]
pub struct LinuxPlatform {
    signal: Signal,
    timeout: Duration,
}

impl LinuxPlatform {
    /// Install the suspend handler for the configured signal.
    pub fn new(config: &PlatformConfig) -> io::Result<Self> {
        let signal = Signal::try_from(config.suspend_signal).map_err(io::Error::from)?;
        install_handler(signal)?;
        Ok(Self {
            signal,
            timeout: config.suspend_timeout,
        })
    }

    /// Signal every pending slot and wait until each one parks, exits, or
    /// runs out of time. The session is published before the first signal.
    fn park_threads(&self, slots: Box<[ThreadSlot]>, episode: MutexGuard<'static, ()>) -> LinuxSuspendedThreads {
        // SAFETY: getpid has no preconditions.
        let pid = unsafe { libc::getpid() };
        let mut parked = Vec::with_capacity(slots.len());
        let session = NonNull::from(Box::leak(Box::new(Session {
            slots,
            resume: AtomicBool::new(false),
        })));
        SESSION.store(session.as_ptr(), Ordering::SeqCst);

        // SAFETY: freed only by LinuxSuspendedThreads::drop.
        let shared = unsafe { session.as_ref() };
        for slot in shared.slots.iter() {
            if slot.state.load(Ordering::Acquire) == PENDING && !tgkill(pid, slot.tid, self.signal as c_int) {
                slot.state.store(GONE, Ordering::Release);
            }
        }

        let deadline = Instant::now().checked_add(self.timeout);
        let mut skipped = 0;
        for (index, slot) in shared.slots.iter().enumerate() {
            match await_parked(pid, slot, deadline) {
                PARKED => parked.push(index),
                SKIPPED => skipped += 1,
                _ => {}
            }
        }

        LinuxSuspendedThreads {
            session,
            parked,
            skipped,
            _episode: episode,
        }
    }
}

/// Spin until `slot` leaves PENDING/CAPTURING and return its final state.
/// A live thread still pending at `deadline` is marked SKIPPED.
fn await_parked(pid: libc::pid_t, slot: &ThreadSlot, deadline: Option<Instant>) -> u8 {
    loop {
        let next = match slot.state.load(Ordering::Acquire) {
            PENDING if !thread_alive(pid, slot.tid) => GONE,
            PENDING if deadline.is_some_and(|deadline| Instant::now() >= deadline) => SKIPPED,
            PENDING | CAPTURING => {
                // SAFETY: no preconditions.
                unsafe { libc::sched_yield() };
                continue;
            }
            state => return state,
        };
        // Lost races to the handler claiming the slot are retried.
        if slot
            .state
            .compare_exchange(PENDING, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return next;
        }
    }
}

fn install_handler(signal: Signal) -> io::Result<()> {
    let mut installed = INSTALLED.lock();
    let bit = 1u64 << (signal as i32);
    if *installed & bit != 0 {
        return Ok(());
    }
    let action = SigAction::new(
        SigHandler::SigAction(suspend_handler),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        SigSet::all(),
    );
    // SAFETY: the handler is async-signal-safe: it only touches atomics,
    // pre-allocated slots, errno and sched_yield.
    unsafe { signal::sigaction(signal, &action) }.map_err(io::Error::from)?;
    *installed |= bit;
    tracing::debug!(signal = signal.as_str(), "suspend handler installed");
    Ok(())
}

extern "C" fn suspend_handler(_signal: c_int, _info: *mut libc::siginfo_t, context: *mut c_void) {
    // SAFETY: __errno_location always returns this thread's errno slot.
    let saved_errno = unsafe { *libc::__errno_location() };
    HANDLERS_IN_FLIGHT.fetch_add(1, Ordering::SeqCst);

    let session = SESSION.load(Ordering::SeqCst);
    if !session.is_null() {
        // SAFETY: the suspender frees the session only after SESSION is
        // cleared and no handler is in flight.
        let session = unsafe { &*session };
        let tid = current_tid();
        if let Some(slot) = session.slots.iter().find(|slot| slot.tid == tid) {
            // SAFETY: the kernel passes a valid ucontext_t to SA_SIGINFO handlers.
            unsafe { park(session, slot, context.cast::<libc::ucontext_t>()) };
        }
    }

    HANDLERS_IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
    // SAFETY: as above.
    unsafe { *libc::__errno_location() = saved_errno };
}

unsafe fn park(session: &Session, slot: &ThreadSlot, context: *const libc::ucontext_t) {
    if slot
        .state
        .compare_exchange(PENDING, CAPTURING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    // SAFETY: only the thread that claimed CAPTURING writes the registers,
    // and only before PARKED is published.
    unsafe {
        let registers = &mut *slot.registers.get();
        registers.fill_from_raw(
            ptr::addr_of!((*context).uc_mcontext).cast::<u8>(),
            mem::size_of::<libc::mcontext_t>(),
        );
        slot.sp.store(stack_pointer(context), Ordering::Relaxed);
    }
    slot.state.store(PARKED, Ordering::Release);

    while !session.resume.load(Ordering::Acquire) {
        // SAFETY: sched_yield is async-signal-safe.
        unsafe { libc::sched_yield() };
    }
    slot.state.store(RESUMED, Ordering::Release);
}

#[cfg(target_arch = "x86_64")]
unsafe fn stack_pointer(context: *const libc::ucontext_t) -> usize {
    unsafe { (*context).uc_mcontext.gregs[libc::REG_RSP as usize] as usize }
}

#[cfg(target_arch = "aarch64")]
unsafe fn stack_pointer(context: *const libc::ucontext_t) -> usize {
    unsafe { (*context).uc_mcontext.sp as usize }
}

/// The handler frame sits below the interrupted frame, so its address
/// bounds the live stack.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn stack_pointer(_context: *const libc::ucontext_t) -> usize {
    let marker = 0usize;
    ptr::addr_of!(marker) as usize
}

fn current_tid() -> libc::pid_t {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

fn tgkill(pid: libc::pid_t, tid: libc::pid_t, signal: c_int) -> bool {
    // SAFETY: tgkill only reads its integer arguments.
    unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, signal) == 0 }
}

fn thread_alive(pid: libc::pid_t, tid: libc::pid_t) -> bool {
    tgkill(pid, tid, 0) || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Whether `tid` currently blocks `signal`. Unreadable status counts as
/// not blocked; a thread that exited is caught by `tgkill` instead.
fn signal_blocked(tid: libc::pid_t, signal: Signal) -> bool {
    fs::read_to_string(format!("/proc/self/task/{tid}/status"))
        .map(|status| status_blocks_signal(&status, signal as c_int))
        .unwrap_or(false)
}

/// Parse the `SigBlk:` hex mask of a `/proc/<pid>/task/<tid>/status` file.
fn status_blocks_signal(status: &str, signal: c_int) -> bool {
    if !(1..=64).contains(&signal) {
        return false;
    }
    status
        .lines()
        .find_map(|line| line.strip_prefix("SigBlk:"))
        .and_then(|mask| u64::from_str_radix(mask.trim(), 16).ok())
        .is_some_and(|mask| mask & (1u64 << (signal - 1)) != 0)
}

fn list_threads() -> io::Result<Vec<libc::pid_t>> {
    let mut tids = Vec::new();
    for entry in fs::read_dir("/proc/self/task")? {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|name| name.parse().ok()) {
            tids.push(tid);
        }
    }
    Ok(tids)
}

/// Threads parked by [`LinuxPlatform::suspend_all`]. Dropping resumes them.
pub struct LinuxSuspendedThreads {
    session: NonNull<Session>,
    parked: Vec<usize>,
    skipped: usize,
    _episode: MutexGuard<'static, ()>,
}

impl LinuxSuspendedThreads {
    fn session(&self) -> &Session {
        // SAFETY: the session is freed only in Drop.
        unsafe { self.session.as_ref() }
    }

    fn slot(&self, index: usize) -> &ThreadSlot {
        &self.session().slots[self.parked[index]]
    }
}

impl SuspendedThreads for LinuxSuspendedThreads {
    fn thread_count(&self) -> usize {
        self.parked.len()
    }

    fn thread_id(&self, index: usize) -> OsThreadId {
        OsThreadId(self.slot(index).tid as u64)
    }

    fn registers_and_sp(&self, index: usize) -> Result<(&RegisterBlock, usize), RegistersUnavailable> {
        let slot = self.slot(index);
        // SAFETY: the slot is parked; its owner no longer writes it.
        let registers = unsafe { &*slot.registers.get() };
        Ok((registers, slot.sp.load(Ordering::Relaxed)))
    }

    fn threads_skipped(&self) -> usize {
        self.skipped
    }
}

impl Drop for LinuxSuspendedThreads {
    fn drop(&mut self) {
        let session = self.session();
        session.resume.store(true, Ordering::Release);
        for &index in &self.parked {
            while session.slots[index].state.load(Ordering::Acquire) != RESUMED {
                // SAFETY: no preconditions.
                unsafe { libc::sched_yield() };
            }
        }

        SESSION.store(ptr::null_mut(), Ordering::SeqCst);
        while HANDLERS_IN_FLIGHT.load(Ordering::SeqCst) != 0 {
            // SAFETY: no preconditions.
            unsafe { libc::sched_yield() };
        }
        // SAFETY: created by Box::leak in suspend_all; no handler can
        // reach it any more.
        drop(unsafe { Box::from_raw(self.session.as_ptr()) });
    }
}

impl Platform for LinuxPlatform {
    type Suspended = LinuxSuspendedThreads;

    fn current_os_thread_id(&self) -> OsThreadId {
        OsThreadId(current_tid() as u64)
    }

    fn current_thread_bounds(&self, _is_main_thread: bool) -> ThreadBounds {
        ThreadBounds {
            stack: current_stack().unwrap_or(AddressRange::EMPTY),
            tls: current_static_tls(),
        }
    }

    fn with_loader_lock(&self, body: &mut dyn FnMut()) {
        struct Call<'a> {
            body: &'a mut dyn FnMut(),
            ran: bool,
            panic: Option<Box<dyn Any + Send>>,
        }

        unsafe extern "C" fn run_locked(
            _info: *mut libc::dl_phdr_info,
            _size: libc::size_t,
            data: *mut c_void,
        ) -> c_int {
            // SAFETY: `data` is the `Call` passed below.
            let call = unsafe { &mut *data.cast::<Call<'_>>() };
            if !call.ran {
                call.ran = true;
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (call.body)())) {
                    call.panic = Some(payload);
                }
            }
            1
        }

        let mut call = Call {
            body,
            ran: false,
            panic: None,
        };
        // SAFETY: the callback matches dl_iterate_phdr's contract and
        // `call` outlives the call.
        unsafe { libc::dl_iterate_phdr(Some(run_locked), ptr::addr_of_mut!(call).cast()) };
        if !call.ran {
            (call.body)();
        }
        if let Some(payload) = call.panic {
            panic::resume_unwind(payload);
        }
    }

    fn suspend_all(&self) -> Result<LinuxSuspendedThreads, SuspendError> {
        let episode = EPISODE_LOCK.lock();
        let own_tid = current_tid();

        let mut tids = list_threads().map_err(SuspendError::EnumerationUnavailable)?;
        tids.sort_unstable();
        tids.dedup();
        tids.retain(|&tid| tid != own_tid);

        let slots: Box<[ThreadSlot]> = tids
            .iter()
            .map(|&tid| ThreadSlot::new(tid, signal_blocked(tid, self.signal)))
            .collect();
        Ok(self.park_threads(slots, episode))
    }

    fn for_each_module(&self, visit: &mut dyn FnMut(&LoadedModule<'_>, ModuleSections<'_>)) {
        struct Walk<'a> {
            visit: &'a mut dyn FnMut(&LoadedModule<'_>, ModuleSections<'_>),
            index: usize,
            panic: Option<Box<dyn Any + Send>>,
        }

        unsafe extern "C" fn visit_module(
            info: *mut libc::dl_phdr_info,
            _size: libc::size_t,
            data: *mut c_void,
        ) -> c_int {
            // SAFETY: `data` is the `Walk` passed below; `info` is valid
            // for the duration of the callback.
            let (walk, info) = unsafe { (&mut *data.cast::<Walk<'_>>(), &*info) };
            let is_main_image = walk.index == 0;
            walk.index += 1;

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                // SAFETY: the loader keeps these alive during the callback.
                let (name, headers) = unsafe { (module_name(info), program_headers(info)) };
                let module = LoadedModule {
                    name,
                    base: info.dlpi_addr as usize,
                    is_main_image,
                };
                match elf::writable_segments(headers, info.dlpi_addr as usize) {
                    Ok(mut segments) => {
                        let segments: &mut dyn Iterator<Item = AddressRange> = &mut segments;
                        (walk.visit)(&module, Ok(segments))
                    }
                    Err(err) => (walk.visit)(&module, Err(err)),
                }
            }));
            match outcome {
                Ok(()) => 0,
                Err(payload) => {
                    walk.panic = Some(payload);
                    1
                }
            }
        }

        let mut walk = Walk {
            visit,
            index: 0,
            panic: None,
        };
        // SAFETY: the callback matches dl_iterate_phdr's contract and
        // `walk` outlives the call.
        unsafe { libc::dl_iterate_phdr(Some(visit_module), ptr::addr_of_mut!(walk).cast()) };
        if let Some(payload) = walk.panic {
            panic::resume_unwind(payload);
        }
    }
}

unsafe fn module_name<'a>(info: &'a libc::dl_phdr_info) -> &'a [u8] {
    if info.dlpi_name.is_null() {
        &[]
    } else {
        unsafe { CStr::from_ptr(info.dlpi_name).to_bytes() }
    }
}

unsafe fn program_headers<'a>(info: &'a libc::dl_phdr_info) -> &'a [ProgramHeader] {
    if info.dlpi_phdr.is_null() || info.dlpi_phnum == 0 {
        &[]
    } else {
        unsafe { slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) }
    }
}

fn current_stack() -> Option<AddressRange> {
    // SAFETY: the attr is initialized by pthread_getattr_np before use and
    // destroyed afterwards.
    unsafe {
        let mut attr: libc::pthread_attr_t = mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut c_void = ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        (rc == 0).then(|| AddressRange::from_base_len(addr as usize, size))
    }
}

/// The main executable's TLS block for the calling thread.
///
/// Blocks of shared objects live at offsets that depend on load order, and
/// dynamically loaded ones are not static at all, so only the executable's
/// block is reported.
fn current_static_tls() -> AddressRange {
    let size = main_image_tls_size();
    let tp = thread_pointer();
    if size == 0 || tp == 0 {
        return AddressRange::EMPTY;
    }
    static_tls_block(tp, size)
}

#[cfg(target_arch = "x86_64")]
fn static_tls_block(tp: usize, size: usize) -> AddressRange {
    AddressRange::new(tp.saturating_sub(size), tp)
}

#[cfg(target_arch = "aarch64")]
fn static_tls_block(tp: usize, size: usize) -> AddressRange {
    AddressRange::from_base_len(tp + 16, size)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn static_tls_block(_tp: usize, _size: usize) -> AddressRange {
    AddressRange::EMPTY
}

#[cfg(target_arch = "x86_64")]
fn thread_pointer() -> usize {
    let tp: usize;
    // SAFETY: fs:0 holds the thread control block's self pointer.
    unsafe {
        std::arch::asm!("mov {}, qword ptr fs:[0]", out(reg) tp, options(nostack, readonly, preserves_flags));
    }
    tp
}

#[cfg(target_arch = "aarch64")]
fn thread_pointer() -> usize {
    let tp: usize;
    // SAFETY: reading tpidr_el0 has no side effects.
    unsafe {
        std::arch::asm!("mrs {}, tpidr_el0", out(reg) tp, options(nomem, nostack, preserves_flags));
    }
    tp
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn thread_pointer() -> usize {
    0
}

fn main_image_tls_size() -> usize {
    unsafe extern "C" fn first_module(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        // SAFETY: `data` is the usize below; `info` is valid during the callback.
        unsafe { *data.cast::<usize>() = elf::tls_block_size(program_headers(&*info)) };
        1
    }

    let mut size = 0usize;
    // SAFETY: the callback matches dl_iterate_phdr's contract.
    unsafe { libc::dl_iterate_phdr(Some(first_module), ptr::addr_of_mut!(size).cast()) };
    size
}
