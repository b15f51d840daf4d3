//! Signature-based stratified refinement
//!
//! One call to [`refine_step`] turns the level-`k` partition into the
//! level-`k+1` partition. A vertex's *split signature* is the **set** of
//! `(label, cell-of-target)` pairs over its outgoing edges, evaluated against
//! the level-`k` map; members of a dirty block that disagree on their
//! signature part ways.
//!
//! Splitting runs in two passes. Dirty blocks of exactly two members are
//! handled first (when the support threshold allows them to split at all):
//! when such a block dissolves it leaves two singletons and a vacated slot,
//! and doing these first means the larger splits of the second pass can
//! recycle those slots instead of growing the table. The second pass groups
//! members by signature, frees the original slot, turns size-1 groups into
//! singletons (recording the `0` sentinel at most once per parent), and
//! places every size-≥2 group into a popped free slot before appending.
//!
//! Dirtying for the next level walks the reverse index: a block becomes a
//! split candidate when one of its members has an edge into a vertex that
//! changed cells. Singletons and blocks below the support threshold are
//! skipped — they can never split. Overapproximating this set is sound;
//! missing a block that would split is not.

use std::collections::{HashMap, HashSet};

use crate::graph::Graph;
use crate::partition::{
    Block, BlockOrSingleton, DirtyBlocks, LevelOutcome, PartitionError, RefineChild,
    RefinesMapping, VertexBlockMap,
};
use crate::{BlockIndex, EdgeLabel, NodeIndex};

/// The edge label the external preprocessor maps `rdf:type` to.
pub const RDF_TYPE_LABEL: EdgeLabel = 0;

/// Errors surfaced by refinement.
#[derive(Debug, thiserror::Error)]
pub enum RefineError {
    /// A partition invariant broke mid-split.
    #[error("partition invariant violated: {0}")]
    Partition(#[from] PartitionError),
    /// The trivial start needs at least two vertices.
    #[error("graph has {0} vertices; the universal level-0 block needs at least 2")]
    GraphTooSmall(u64),
}

/// Level-0 partition with a single universal block holding every vertex.
///
/// The universal block is the only split candidate. Graphs with fewer than
/// two vertices are rejected; they could only produce singletons, which the
/// universal encoding cannot represent.
pub fn trivial_partition(g: &Graph) -> Result<LevelOutcome, RefineError> {
    let n = g.size();
    if n < 2 {
        return Err(RefineError::GraphTooSmall(n));
    }
    let block: Block = (0..n).collect();
    let mut dirty = DirtyBlocks::new();
    dirty.set_dirty(0);
    Ok(LevelOutcome {
        blocks: vec![block],
        dirty,
        map: VertexBlockMap::all_to_zero(n),
        refines: RefinesMapping::new(),
        level: 0,
    })
}

/// Level-0 partition grouping vertices by their `rdf:type` target **set**.
///
/// Vertices with identical type sets share a block; a vertex with a unique
/// type set starts out as a singleton. Every ordinary block is a split
/// candidate.
pub fn typed_partition(g: &Graph) -> LevelOutcome {
    let n = g.size() as usize;

    // Group vertices by type set, keeping first-discovery order so block ids
    // are deterministic.
    let mut group_of: HashMap<Vec<NodeIndex>, usize> = HashMap::new();
    let mut groups: Vec<Block> = Vec::new();
    for v in 0..n as NodeIndex {
        let mut type_set: Vec<NodeIndex> = g
            .outgoing(v)
            .iter()
            .filter(|e| e.label == RDF_TYPE_LABEL)
            .map(|e| e.target)
            .collect();
        type_set.sort_unstable();
        type_set.dedup();
        let idx = *group_of.entry(type_set).or_insert_with(|| {
            groups.push(Block::new());
            groups.len() - 1
        });
        groups[idx].push(v);
    }

    let mut node_to_block = vec![BlockOrSingleton::Block(0); n];
    let mut blocks: Vec<Block> = Vec::new();
    let mut singletons = 0u64;
    let mut dirty = DirtyBlocks::new();
    for group in groups {
        if let [only] = group[..] {
            node_to_block[only as usize] = BlockOrSingleton::Singleton(only);
            singletons += 1;
        } else {
            let id = blocks.len() as BlockIndex;
            for &v in &group {
                node_to_block[v as usize] = BlockOrSingleton::Block(id);
            }
            blocks.push(group);
            dirty.set_dirty(id);
        }
    }

    LevelOutcome {
        blocks,
        dirty,
        map: VertexBlockMap::from_assignments(node_to_block, singletons),
        refines: RefinesMapping::new(),
        level: 0,
    }
}

/// Split signature of `v` against the previous level: sorted, deduplicated
/// `(label, target cell)` pairs. Sorting makes the set usable as a hash key
/// and keeps group discovery order deterministic.
fn signature(g: &Graph, prev: &VertexBlockMap, v: NodeIndex) -> Vec<(EdgeLabel, BlockOrSingleton)> {
    let mut sig: Vec<(EdgeLabel, BlockOrSingleton)> = g
        .outgoing(v)
        .iter()
        .map(|e| (e.label, prev.get(e.target)))
        .collect();
    sig.sort_unstable();
    sig.dedup();
    sig
}

/// Compute the next partition level from `prev`.
///
/// Blocks of size `< min_support` (and size-2 blocks when `min_support ≥ 2`)
/// are never split; `min_support = 1` is plain stratified bisimulation.
pub fn refine_step(
    g: &Graph,
    prev: &LevelOutcome,
    min_support: u64,
) -> Result<LevelOutcome, RefineError> {
    let mut blocks = prev.blocks.clone();
    let mut map = prev.map.clone();
    let mut refines = RefinesMapping::new();
    // Vertices that changed cells; the reverse sweep dirties their sources.
    let mut changed: HashSet<NodeIndex> = HashSet::new();

    // Pass A: two-member blocks either survive intact or dissolve into two
    // singletons, vacating their slot for pass B to reuse.
    if min_support < 2 {
        for b in prev.dirty.iter() {
            let members = &prev.blocks[b as usize];
            if members.len() != 2 {
                continue;
            }
            let (u, v) = (members[0], members[1]);
            if signature(g, &prev.map, u) == signature(g, &prev.map, v) {
                continue;
            }
            map.mark_singleton(u)?;
            map.mark_singleton(v)?;
            changed.insert(u);
            changed.insert(v);
            blocks[b as usize] = Block::new();
            map.push_free(b);
            refines.add_edge(b, vec![RefineChild::Singletons]);
        }
    }

    // Pass B: larger blocks group by signature; vacated slots are reused
    // before the table grows.
    for b in prev.dirty.iter() {
        let members = &prev.blocks[b as usize];
        let size = members.len() as u64;
        if size == 2 || size <= min_support {
            continue;
        }

        let mut group_of: HashMap<Vec<(EdgeLabel, BlockOrSingleton)>, usize> = HashMap::new();
        let mut groups: Vec<Block> = Vec::new();
        for &v in members {
            let sig = signature(g, &prev.map, v);
            let idx = *group_of.entry(sig).or_insert_with(|| {
                groups.push(Block::new());
                groups.len() - 1
            });
            groups[idx].push(v);
        }
        if groups.len() == 1 {
            continue;
        }

        changed.extend(members.iter().copied());
        map.push_free(b);
        blocks[b as usize] = Block::new();

        let mut children: Vec<RefineChild> = Vec::new();
        let mut found_singleton = false;
        for mut group in groups {
            if let [only] = group[..] {
                map.mark_singleton(only)?;
                if !found_singleton {
                    found_singleton = true;
                    children.push(RefineChild::Singletons);
                }
                continue;
            }
            group.shrink_to_fit();
            let slot = match map.pop_free() {
                Some(free) => {
                    blocks[free as usize] = group;
                    free
                }
                None => {
                    blocks.push(group);
                    (blocks.len() - 1) as BlockIndex
                }
            };
            children.push(RefineChild::Block(slot));
            if slot != b {
                for &v in &blocks[slot as usize] {
                    map.set_block(v, slot);
                }
            }
        }
        refines.add_edge(b, children);
    }

    // Reverse sweep: dirty every block that can still split and has an edge
    // into a changed vertex.
    let mut dirty = DirtyBlocks::new();
    for &target in &changed {
        for &source in g.reverse_neighbors(target) {
            match map.get(source) {
                BlockOrSingleton::Singleton(_) => continue,
                BlockOrSingleton::Block(s) => {
                    if (blocks[s as usize].len() as u64) < min_support {
                        continue;
                    }
                    dirty.set_dirty(s);
                }
            }
        }
    }

    Ok(LevelOutcome {
        blocks,
        dirty,
        map,
        refines,
        level: prev.level + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::RefineChild;

    fn graph(edges: &[(u64, u32, u64)], vertex_count: u64) -> Graph {
        let mut g = Graph::new();
        for &(s, p, o) in edges {
            g.add_edge(s, p, o);
        }
        g.resize(vertex_count);
        g.compute_reverse_index().unwrap();
        g
    }

    /// Partition as a canonical set of member lists, singletons included.
    fn cells(out: &LevelOutcome) -> Vec<Vec<NodeIndex>> {
        let mut cells: Vec<Vec<NodeIndex>> = Vec::new();
        for (i, b) in out.blocks.iter().enumerate() {
            if !b.is_empty() {
                let mut members = b.clone();
                members.sort_unstable();
                // Cross-check the map agrees with the block table.
                for &v in &members {
                    assert_eq!(out.map.get(v), BlockOrSingleton::Block(i as u64));
                }
                cells.push(members);
            }
        }
        for v in 0..out.map.len() as NodeIndex {
            if out.map.get(v).is_singleton() {
                cells.push(vec![v]);
            }
        }
        cells.sort();
        cells
    }

    #[test]
    fn minimal_split_scenario() {
        // V = {0,1,2}, edges 0→2 and 1→2 with label 1. Level 1 separates the
        // sink from the two sources; level 2 changes nothing.
        let g = graph(&[(0, 1, 2), (1, 1, 2)], 3);
        let l0 = trivial_partition(&g).unwrap();
        let l1 = refine_step(&g, &l0, 1).unwrap();

        assert_eq!(cells(&l1), vec![vec![0, 1], vec![2]]);
        assert_eq!(l1.total_cells(), 2);
        assert_eq!(l1.singleton_count(), 1);

        // The universal block 0 refines into the reused slot 0 plus the
        // singleton sentinel, in that discovery order.
        let edges: Vec<_> = l1.refines.iter().collect();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].0, 0);
        assert_eq!(
            edges[0].1,
            &[RefineChild::Block(0), RefineChild::Singletons]
        );

        let l2 = refine_step(&g, &l1, 1).unwrap();
        assert_eq!(l2.total_cells(), l1.total_cells());
        assert!(l2.refines.is_empty());
    }

    #[test]
    fn edgeless_graph_never_splits() {
        let g = graph(&[], 2);
        let l0 = trivial_partition(&g).unwrap();
        let l1 = refine_step(&g, &l0, 1).unwrap();
        assert_eq!(l1.total_cells(), 1);
        assert!(l1.refines.is_empty());
        assert!(l1.dirty.is_empty());
    }

    #[test]
    fn typed_start_isolates_unique_type_sets() {
        // rdf:type is label 0: vertices 0 and 2 share type {10}, vertex 1 has
        // the unique type {11} and starts as a singleton.
        let g = graph(&[(0, 0, 10), (1, 0, 11), (2, 0, 10)], 12);
        let l0 = typed_partition(&g);
        let non_singletons: Vec<_> = cells(&l0).into_iter().filter(|c| c.len() > 1).collect();
        assert!(non_singletons.contains(&vec![0, 2]));
        assert_eq!(l0.map.get(1), BlockOrSingleton::Singleton(1));
        // Target vertices 10/11 have the empty type set and share a block.
        assert_eq!(l0.map.get(10), l0.map.get(11));
    }

    #[test]
    fn dissolved_pair_slot_is_reused_by_a_later_split() {
        // Block {3,4} dissolves in pass A (3 has an edge, 4 is a sink) and
        // frees slot 1. Block {0,1,7,8} then splits into {0,1} and {7,8}:
        // the first group pops the parent's own slot 0 (no rewrites needed),
        // the second consumes the pass-A slot 1 instead of appending.
        let g = graph(&[(0, 1, 5), (1, 1, 5), (7, 2, 5), (8, 2, 5), (3, 2, 6)], 9);

        let mut node_to_block = vec![BlockOrSingleton::Block(2); 9];
        for v in [0u64, 1, 7, 8] {
            node_to_block[v as usize] = BlockOrSingleton::Block(0);
        }
        for v in [3u64, 4] {
            node_to_block[v as usize] = BlockOrSingleton::Block(1);
        }
        let mut dirty = DirtyBlocks::new();
        dirty.set_dirty(0);
        dirty.set_dirty(1);
        let prev = LevelOutcome {
            blocks: vec![vec![0, 1, 7, 8], vec![3, 4], vec![2, 5, 6]],
            dirty,
            map: VertexBlockMap::from_assignments(node_to_block, 0),
            refines: RefinesMapping::new(),
            level: 1,
        };

        let next = refine_step(&g, &prev, 1).unwrap();
        assert!(next.map.get(3).is_singleton());
        assert!(next.map.get(4).is_singleton());
        assert_eq!(next.blocks[0], vec![0, 1]);
        assert_eq!(next.blocks[1], vec![7, 8]);
        assert_eq!(next.map.get(7), BlockOrSingleton::Block(1));
        assert_eq!(next.map.get(8), BlockOrSingleton::Block(1));
        assert_eq!(next.blocks.len(), 3, "no slot was appended");
        assert_eq!(next.map.freeblock_count(), 0);

        let edges: Vec<_> = next.refines.iter().collect();
        assert_eq!(edges[0].0, 0);
        assert_eq!(edges[0].1, &[RefineChild::Block(0), RefineChild::Block(1)]);
        assert_eq!(edges[1].0, 1);
        assert_eq!(edges[1].1, &[RefineChild::Singletons]);
    }

    #[test]
    fn minimum_support_gates_both_passes() {
        let g = graph(&[(0, 1, 2), (1, 1, 2)], 3);
        let l0 = trivial_partition(&g).unwrap();

        // Support 2: the size-3 universal block still splits.
        let s2 = refine_step(&g, &l0, 2).unwrap();
        assert_eq!(cells(&s2), vec![vec![0, 1], vec![2]]);

        // Support 3: size 3 is not strictly above the threshold; no split.
        let s3 = refine_step(&g, &l0, 3).unwrap();
        assert_eq!(s3.total_cells(), 1);
        assert!(s3.refines.is_empty());

        // And the surviving pair {0,1} cannot split further under support 2
        // even if it were dirty (size-2 blocks need support < 2).
        let s2_next = refine_step(&g, &s2, 2).unwrap();
        assert_eq!(s2_next.total_cells(), s2.total_cells());
    }

    #[test]
    fn parallel_edges_collapse_in_signatures() {
        // 0 has two parallel edges to 2; 1 has one. Same signature set.
        let g = graph(&[(0, 1, 2), (0, 1, 2), (1, 1, 2)], 3);
        let l0 = trivial_partition(&g).unwrap();
        let l1 = refine_step(&g, &l0, 1).unwrap();
        assert_eq!(cells(&l1), vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn dirty_overapproximation_reaches_the_same_fixed_point() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        for seed in 0..8u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let n: u64 = rng.gen_range(4..24);
            let mut g = Graph::new();
            g.add_edge(0, 0, n - 1); // pin the vertex count
            let edge_count = rng.gen_range(0..3 * n);
            for _ in 0..edge_count {
                let s = rng.gen_range(0..n);
                let o = rng.gen_range(0..n);
                let p = rng.gen_range(0..3);
                g.add_edge(s, p, o);
            }
            g.compute_reverse_index().unwrap();

            let exact = run_to_fixed_point(&g, false);
            let sloppy = run_to_fixed_point(&g, true);
            assert_eq!(exact, sloppy, "seed {seed} diverged");
        }
    }

    /// Refine to the fixed point; with `overapproximate` every live block is
    /// re-flagged dirty each level regardless of the reverse sweep.
    fn run_to_fixed_point(g: &Graph, overapproximate: bool) -> Vec<Vec<NodeIndex>> {
        let mut current = trivial_partition(g).unwrap();
        let mut previous_total = 0;
        loop {
            if overapproximate {
                let mut all = DirtyBlocks::new();
                for (i, b) in current.blocks.iter().enumerate() {
                    if !b.is_empty() {
                        all.set_dirty(i as u64);
                    }
                }
                current.dirty = all;
            }
            let next = refine_step(g, &current, 1).unwrap();
            let total = next.total_cells();
            current = next;
            if total == previous_total {
                return cells(&current);
            }
            previous_total = total;
        }
    }
}
