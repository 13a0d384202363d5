//! Property-based tests for the leakcheck runtime.
//!
//! Uses proptest to generate random object graphs and verify that marking
//! and classification agree with a plain graph traversal.

use std::collections::VecDeque;
use std::mem;

use leakcheck_runtime::{
    classify_leaks, AddressRange, ChunkTable, EpisodeStats, Frontier, LeakKind, ReachabilityEngine, StackId,
};
use proptest::prelude::*;

const SLOTS: usize = 4;

/// A random object graph: per node, its outgoing edges and whether it is
/// ignored, plus the set of root nodes.
#[derive(Debug, Clone)]
struct Graph {
    edges: Vec<Vec<(usize, usize)>>,
    ignored: Vec<bool>,
    roots: Vec<usize>,
}

/// Strategy for graphs of up to `max_nodes` nodes. Each edge carries a
/// word offset into its target so interior pointers are exercised.
fn graph(max_nodes: usize) -> impl Strategy<Value = Graph> {
    (1..=max_nodes).prop_flat_map(|n| {
        let edge = (0..n, 0..SLOTS);
        (
            prop::collection::vec(prop::collection::vec(edge, 0..=SLOTS), n),
            prop::collection::vec(prop::bool::weighted(0.1), n),
            prop::collection::vec(0..n, 0..=3),
        )
            .prop_map(|(edges, ignored, roots)| Graph { edges, ignored, roots })
    })
}

/// Nodes reachable from the roots without passing through ignored nodes.
fn reference_reachable(graph: &Graph) -> Vec<bool> {
    let mut seen = vec![false; graph.edges.len()];
    let mut queue: VecDeque<usize> = VecDeque::new();
    for &root in &graph.roots {
        if !graph.ignored[root] && !seen[root] {
            seen[root] = true;
            queue.push_back(root);
        }
    }
    while let Some(node) = queue.pop_front() {
        for &(to, _) in &graph.edges[node] {
            if !graph.ignored[to] && !seen[to] {
                seen[to] = true;
                queue.push_back(to);
            }
        }
    }
    seen
}

/// The graph laid out in real memory and tracked by a chunk table.
struct Materialized {
    blocks: Vec<Box<[usize; SLOTS]>>,
    roots: Vec<usize>,
    table: ChunkTable,
}

impl Materialized {
    fn new(graph: &Graph) -> Self {
        let mut blocks: Vec<Box<[usize; SLOTS]>> = (0..graph.edges.len()).map(|_| Box::new([0; SLOTS])).collect();
        let bases: Vec<usize> = blocks.iter().map(|b| b.as_ptr() as usize).collect();

        for (from, edges) in graph.edges.iter().enumerate() {
            for (slot, &(to, offset)) in edges.iter().enumerate() {
                blocks[from][slot] = bases[to] + offset * mem::size_of::<usize>();
            }
        }

        let mut table = ChunkTable::new();
        for (node, &base) in bases.iter().enumerate() {
            let size = SLOTS * mem::size_of::<usize>();
            if graph.ignored[node] {
                table.insert_ignored(base, size, StackId(node as u32));
            } else {
                table.insert(base, size, StackId(node as u32));
            }
        }

        let roots = graph.roots.iter().map(|&r| bases[r]).collect();
        Self { blocks, roots, table }
    }

    fn base(&self, node: usize) -> usize {
        self.blocks[node].as_ptr() as usize
    }
}

proptest! {
    /// Marking reaches exactly the traversal closure of the roots
    #[test]
    fn marking_matches_traversal(graph in graph(24)) {
        let mut world = Materialized::new(&graph);
        let mut frontier = Frontier::with_capacity(graph.edges.len());
        {
            let mut engine = ReachabilityEngine::new(&mut world.table, &mut frontier);
            unsafe { engine.scan_root(AddressRange::from_base_len(
                world.roots.as_ptr() as usize,
                mem::size_of_val(world.roots.as_slice()),
            )) };
            engine.flood_fill();
        }
        prop_assert!(frontier.is_empty());

        let expected = reference_reachable(&graph);
        let report = classify_leaks(&mut world.table, EpisodeStats::default());
        for node in 0..graph.edges.len() {
            let reported = report.kind_of(world.base(node)).is_some();
            let leaked = !graph.ignored[node] && !expected[node];
            prop_assert_eq!(reported, leaked, "node {} reported={} leaked={}", node, reported, leaked);
        }
    }

    /// A leak is indirect exactly when another leaked chunk points into it
    #[test]
    fn indirect_leaks_have_a_leaked_referrer(graph in graph(16)) {
        let mut world = Materialized::new(&graph);
        let mut frontier = Frontier::with_capacity(graph.edges.len());
        {
            let mut engine = ReachabilityEngine::new(&mut world.table, &mut frontier);
            unsafe { engine.scan_root(AddressRange::from_base_len(
                world.roots.as_ptr() as usize,
                mem::size_of_val(world.roots.as_slice()),
            )) };
            engine.flood_fill();
        }

        let reachable = reference_reachable(&graph);
        let leaked = |n: usize| !graph.ignored[n] && !reachable[n];
        let report = classify_leaks(&mut world.table, EpisodeStats::default());

        for node in (0..graph.edges.len()).filter(|&n| leaked(n)) {
            let referred = (0..graph.edges.len())
                .filter(|&from| from != node && leaked(from))
                .any(|from| graph.edges[from].iter().any(|&(to, _)| to == node));
            let expected = if referred { LeakKind::Indirect } else { LeakKind::Direct };
            prop_assert_eq!(report.kind_of(world.base(node)), Some(expected), "node {}", node);
        }
    }

    /// The frontier never grows past one slot per chunk
    #[test]
    fn frontier_fits_chunk_count(graph in graph(32)) {
        let mut world = Materialized::new(&graph);
        let capacity = graph.edges.len();
        let mut frontier = Frontier::with_capacity(capacity);
        let reserved = frontier.capacity();
        let all: Vec<usize> = (0..capacity).map(|n| world.base(n)).collect();
        let mut engine = ReachabilityEngine::new(&mut world.table, &mut frontier);
        unsafe { engine.scan_root(AddressRange::from_base_len(
            all.as_ptr() as usize,
            mem::size_of_val(all.as_slice()),
        )) };
        engine.flood_fill();
        drop(engine);
        prop_assert_eq!(frontier.capacity(), reserved);
    }

    /// Splitting around a hole keeps exactly the bytes outside the hole
    #[test]
    fn split_around_excludes_hole(
        begin in 0usize..1024,
        len in 0usize..1024,
        hole_begin in 0usize..2048,
        hole_len in 0usize..512,
    ) {
        let range = AddressRange::from_base_len(begin, len);
        let hole = AddressRange::from_base_len(hole_begin, hole_len);
        let (below, above) = range.split_around(&hole);

        for addr in begin..begin + len {
            let kept = below.contains(addr) || above.contains(addr);
            prop_assert_eq!(kept, !hole.contains(addr), "addr {:#x}", addr);
        }
        prop_assert!(below.len() + above.len() <= range.len());
    }

    /// Aligned sub-ranges are word aligned and inside the original
    #[test]
    fn aligned_words_inside_range(begin in 0usize..4096, len in 0usize..256) {
        let range = AddressRange::from_base_len(begin, len);
        let aligned = range.aligned_words();
        if !aligned.is_empty() {
            prop_assert_eq!(aligned.begin % mem::size_of::<usize>(), 0);
            prop_assert_eq!(aligned.end % mem::size_of::<usize>(), 0);
            prop_assert!(aligned.begin >= range.begin && aligned.end <= range.end);
        }
        prop_assert!(range.len() - aligned.len() < 2 * mem::size_of::<usize>());
    }
}
