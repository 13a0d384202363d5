//! Marking and classification benchmarks using criterion.
//!
//! Run with: cargo bench --bench scan_bench

use std::mem;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use leakcheck_runtime::{
    classify_leaks, AddressRange, ChunkTable, EpisodeStats, Frontier, ReachabilityEngine, StackId, TrackedHeap,
};

const NODE_WORDS: usize = 4;

/// A singly linked chain of `len` tracked blocks.
struct Chain {
    blocks: Vec<Box<[usize; NODE_WORDS]>>,
    table: ChunkTable,
}

impl Chain {
    fn new(len: usize) -> Self {
        let mut blocks: Vec<Box<[usize; NODE_WORDS]>> = (0..len).map(|_| Box::new([0; NODE_WORDS])).collect();
        let bases: Vec<usize> = blocks.iter().map(|b| b.as_ptr() as usize).collect();
        for (block, &next) in blocks.iter_mut().zip(bases.iter().skip(1)) {
            block[0] = next;
        }

        let mut table = ChunkTable::new();
        for (i, &base) in bases.iter().enumerate() {
            table.insert(base, NODE_WORDS * mem::size_of::<usize>(), StackId(i as u32));
        }
        Self { blocks, table }
    }

    fn head(&self) -> usize {
        self.blocks[0].as_ptr() as usize
    }
}

fn range_of(words: &[usize]) -> AddressRange {
    AddressRange::from_base_len(words.as_ptr() as usize, mem::size_of_val(words))
}

fn bench_root_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("root_scan");

    for &words in &[1_024usize, 16_384, 131_072] {
        let mut chain = Chain::new(1_024);
        // Mostly non-pointers, as on a real stack.
        let root: Vec<usize> = (0..words).map(|i| i.wrapping_mul(0x9e37_79b9)).collect();
        let mut frontier = Frontier::with_capacity(chain.table.chunk_count());

        group.throughput(Throughput::Bytes((words * mem::size_of::<usize>()) as u64));
        group.bench_with_input(BenchmarkId::new("words", words), &root, |b, root| {
            b.iter(|| {
                chain.table.reset_tags();
                let mut engine = ReachabilityEngine::new(&mut chain.table, &mut frontier);
                unsafe { engine.scan_root(black_box(range_of(root))) };
                black_box(engine.words_scanned())
            });
        });
    }

    group.finish();
}

fn bench_flood_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("flood_fill");

    for &len in &[100usize, 1_000, 10_000] {
        let mut chain = Chain::new(len);
        let root = vec![chain.head()];
        let mut frontier = Frontier::with_capacity(len);

        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("chain", len), &len, |b, _| {
            b.iter(|| {
                chain.table.reset_tags();
                let mut engine = ReachabilityEngine::new(&mut chain.table, &mut frontier);
                unsafe { engine.scan_root(range_of(&root)) };
                engine.flood_fill();
                black_box(engine.chunks_marked())
            });
        });
    }

    group.finish();
}

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify_leaks");

    for &len in &[100usize, 1_000, 10_000] {
        let mut chain = Chain::new(len);

        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("leaked_chain", len), &len, |b, _| {
            b.iter(|| {
                chain.table.reset_tags();
                let report = classify_leaks(&mut chain.table, EpisodeStats::default());
                black_box(report.total_bytes())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_root_scan, bench_flood_fill, bench_classify);
criterion_main!(benches);
