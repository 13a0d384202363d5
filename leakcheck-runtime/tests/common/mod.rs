//! Shared fixtures: a scripted platform and a heap with an allocator cache.

#![allow(dead_code)]

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use leakcheck_runtime::{
    AddressRange, ChunkInfo, ChunkTable, ChunkTag, FatalPolicy, LeakCheckConfig, LoadedModule, ModuleError,
    ModuleSections, OsThreadId, Platform, RegisterBlock, RegistersUnavailable, SuspendError, SuspendedThreads,
    ThreadBounds, TrackedHeap,
};
use parking_lot::Mutex;

/// A config whose fatal errors panic, so tests can observe them.
pub fn test_config() -> LeakCheckConfig {
    LeakCheckConfig::builder()
        .fatal(FatalPolicy::Panic)
        .build()
        .expect("valid config")
}

/// The address range covering `words`.
pub fn range_of(words: &[usize]) -> AddressRange {
    AddressRange::from_base_len(words.as_ptr() as usize, mem::size_of_val(words))
}

/// Address of the `index`th word of `words`.
pub fn word_addr(words: &[usize], index: usize) -> usize {
    words.as_ptr() as usize + index * mem::size_of::<usize>()
}

/// A thread the fake platform reports as suspended.
#[derive(Clone)]
pub struct FakeThread {
    pub os_id: OsThreadId,
    pub registers: Option<RegisterBlock>,
    pub sp: usize,
}

impl FakeThread {
    pub fn new(os_id: u64) -> Self {
        Self {
            os_id: OsThreadId(os_id),
            registers: Some(RegisterBlock::new()),
            sp: 0,
        }
    }

    pub fn registers(mut self, words: &[usize]) -> Self {
        self.registers = Some(RegisterBlock::from_words(words));
        self
    }

    pub fn without_registers(mut self) -> Self {
        self.registers = None;
        self
    }

    pub fn sp(mut self, sp: usize) -> Self {
        self.sp = sp;
        self
    }
}

/// A module the fake platform reports as loaded.
#[derive(Clone)]
pub struct FakeModule {
    pub name: &'static str,
    pub is_main_image: bool,
    pub sections: Result<Vec<AddressRange>, ModuleError>,
}

#[derive(Default)]
struct Counters {
    suspends: AtomicUsize,
    resumes: AtomicUsize,
}

/// A platform whose threads, modules and roots are scripted by the test.
#[derive(Default)]
pub struct FakePlatform {
    threads: Mutex<Vec<FakeThread>>,
    modules: Mutex<Vec<FakeModule>>,
    roots: Mutex<Vec<AddressRange>>,
    bounds: Mutex<ThreadBounds>,
    fail_suspend: Mutex<bool>,
    unsuspendable: Mutex<usize>,
    counters: Arc<Counters>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_thread(&self, thread: FakeThread) {
        self.threads.lock().push(thread);
    }

    pub fn add_module(&self, module: FakeModule) {
        self.modules.lock().push(module);
    }

    pub fn add_root(&self, range: AddressRange) {
        self.roots.lock().push(range);
    }

    /// Bounds reported to the next `on_thread_start`.
    pub fn set_current_bounds(&self, bounds: ThreadBounds) {
        *self.bounds.lock() = bounds;
    }

    pub fn fail_suspend(&self) {
        *self.fail_suspend.lock() = true;
    }

    /// Report `count` live threads that could not be suspended.
    pub fn set_unsuspendable(&self, count: usize) {
        *self.unsuspendable.lock() = count;
    }

    pub fn suspends(&self) -> usize {
        self.counters.suspends.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.counters.resumes.load(Ordering::SeqCst)
    }
}

pub struct FakeSuspended {
    threads: Vec<FakeThread>,
    skipped: usize,
    counters: Arc<Counters>,
}

impl SuspendedThreads for FakeSuspended {
    fn thread_count(&self) -> usize {
        self.threads.len()
    }

    fn thread_id(&self, index: usize) -> OsThreadId {
        self.threads[index].os_id
    }

    fn registers_and_sp(&self, index: usize) -> Result<(&RegisterBlock, usize), RegistersUnavailable> {
        let thread = &self.threads[index];
        match &thread.registers {
            Some(registers) => Ok((registers, thread.sp)),
            None => Err(RegistersUnavailable { os_id: thread.os_id.0 }),
        }
    }

    fn threads_skipped(&self) -> usize {
        self.skipped
    }
}

impl Drop for FakeSuspended {
    fn drop(&mut self) {
        self.counters.resumes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Platform for FakePlatform {
    type Suspended = FakeSuspended;

    fn current_os_thread_id(&self) -> OsThreadId {
        OsThreadId(u64::MAX)
    }

    fn current_thread_bounds(&self, _is_main_thread: bool) -> ThreadBounds {
        *self.bounds.lock()
    }

    fn suspend_all(&self) -> Result<FakeSuspended, SuspendError> {
        if *self.fail_suspend.lock() {
            return Err(SuspendError::Unsupported);
        }
        self.counters.suspends.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSuspended {
            threads: self.threads.lock().clone(),
            skipped: *self.unsuspendable.lock(),
            counters: Arc::clone(&self.counters),
        })
    }

    fn for_each_module(&self, visit: &mut dyn FnMut(&LoadedModule<'_>, ModuleSections<'_>)) {
        let modules = self.modules.lock().clone();
        for (index, module) in modules.iter().enumerate() {
            let loaded = LoadedModule {
                name: module.name.as_bytes(),
                base: index * 0x10000,
                is_main_image: module.is_main_image,
            };
            match &module.sections {
                Ok(sections) => {
                    let mut iter = sections.iter().copied();
                    let iter: &mut dyn Iterator<Item = AddressRange> = &mut iter;
                    visit(&loaded, Ok(iter));
                }
                Err(err) => visit(&loaded, Err(err.clone())),
            }
        }
    }

    fn for_each_platform_root(&self, visit: &mut dyn FnMut(AddressRange)) {
        for &range in self.roots.lock().iter() {
            visit(range);
        }
    }
}

/// A chunk table whose allocator reports a per-thread cache range.
#[derive(Debug, Default)]
pub struct CachedHeap {
    pub table: ChunkTable,
    pub cache: AddressRange,
}

impl TrackedHeap for CachedHeap {
    fn chunk_count(&self) -> usize {
        self.table.chunk_count()
    }

    fn address_bounds(&self) -> AddressRange {
        self.table.address_bounds()
    }

    fn chunk_containing(&self, addr: usize) -> Option<ChunkInfo> {
        self.table.chunk_containing(addr)
    }

    fn set_tag(&mut self, base: usize, tag: ChunkTag) -> bool {
        self.table.set_tag(base, tag)
    }

    fn reset_tags(&mut self) {
        self.table.reset_tags()
    }

    fn for_each_chunk(&self, visit: &mut dyn FnMut(&ChunkInfo)) {
        self.table.for_each_chunk(visit)
    }

    fn cache_range_for_current_thread(&self) -> AddressRange {
        self.cache
    }
}

/// Heap blocks owned by a test. Their addresses stay put until drop.
pub struct Blocks {
    blocks: Vec<Box<[usize]>>,
}

impl Blocks {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    /// Allocate a zeroed block of `words` words and return its address.
    pub fn alloc(&mut self, words: usize) -> usize {
        let block = vec![0usize; words].into_boxed_slice();
        let base = block.as_ptr() as usize;
        self.blocks.push(block);
        base
    }

    /// Store `value` in word `index` of the block at `base`.
    pub fn store(&mut self, base: usize, index: usize, value: usize) {
        let block = self
            .blocks
            .iter_mut()
            .find(|b| b.as_ptr() as usize == base)
            .expect("unknown block");
        block[index] = value;
    }

    pub fn size_of(words: usize) -> usize {
        words * mem::size_of::<usize>()
    }
}
