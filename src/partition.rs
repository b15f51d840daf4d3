//! Blocks, the vertex-to-block map, dirty tracking, and refines edges
//!
//! A partition level owns four things: the block table (vacated slots stay in
//! the table as empty blocks and are tracked on a LIFO free stack), the total
//! vertex-to-block map, the set of blocks that may split at the next level,
//! and the refines-edges that connect this level to the previous one.

use std::collections::{BTreeMap, BTreeSet};

use crate::{BlockIndex, Level, NodeIndex};

/// A partition cell: the vertex ids it contains.
pub type Block = Vec<NodeIndex>;

/// Errors that indicate a partition invariant was broken. These are bugs, not
/// data problems; the pipeline aborts on them.
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    /// `mark_singleton` was called on a vertex that is already a singleton.
    #[error("vertex {0} is already a singleton")]
    AlreadySingleton(NodeIndex),
    /// A vertex id outside the map was referenced.
    #[error("vertex {0} is out of range (map covers {1} vertices)")]
    VertexOutOfRange(NodeIndex, usize),
}

/// Either an ordinary block or a singleton.
///
/// This is the in-memory form of the signed wire union: a positive id on the
/// wire is a block, `−(v+1)` is the singleton holding exactly vertex `v`.
/// Which id space `Block` carries (0-based refiner slot, 1-based file id, or
/// condensed global id) is up to the surrounding context; the tag is what this
/// type pins down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockOrSingleton {
    /// An ordinary block.
    Block(u64),
    /// The singleton whose unique member is this vertex.
    Singleton(NodeIndex),
}

impl BlockOrSingleton {
    /// True when this is a singleton.
    pub fn is_singleton(self) -> bool {
        matches!(self, BlockOrSingleton::Singleton(_))
    }

    /// Signed wire form: block ids pass through, singletons become `−(v+1)`.
    pub fn to_signed(self) -> i64 {
        match self {
            BlockOrSingleton::Block(b) => b as i64,
            BlockOrSingleton::Singleton(v) => -(v as i64) - 1,
        }
    }

    /// Decode the signed wire form. `0` has no decoding here — in child lists
    /// it is the singleton sentinel, which callers must branch on first.
    pub fn from_signed(value: i64) -> Option<Self> {
        match value {
            v if v > 0 => Some(BlockOrSingleton::Block(v as u64)),
            v if v < 0 => Some(BlockOrSingleton::Singleton((-v - 1) as u64)),
            _ => None,
        }
    }
}

/// Total map from vertices to their current cell, with the free-slot stack
/// and the singleton counter that belong to the same level.
#[derive(Debug, Clone)]
pub struct VertexBlockMap {
    node_to_block: Vec<BlockOrSingleton>,
    free_slots: Vec<BlockIndex>,
    singletons: u64,
}

impl VertexBlockMap {
    /// Map every vertex of a `vertex_count`-vertex graph to block 0.
    pub fn all_to_zero(vertex_count: NodeIndex) -> Self {
        Self {
            node_to_block: vec![BlockOrSingleton::Block(0); vertex_count as usize],
            free_slots: Vec::new(),
            singletons: 0,
        }
    }

    /// Build a map from explicit per-vertex assignments.
    ///
    /// `singletons` must equal the number of `Singleton` entries.
    pub fn from_assignments(node_to_block: Vec<BlockOrSingleton>, singletons: u64) -> Self {
        debug_assert_eq!(
            node_to_block.iter().filter(|b| b.is_singleton()).count() as u64,
            singletons
        );
        Self { node_to_block, free_slots: Vec::new(), singletons }
    }

    /// Cell of vertex `v`.
    pub fn get(&self, v: NodeIndex) -> BlockOrSingleton {
        self.node_to_block[v as usize]
    }

    /// Point `v` at block slot `b`.
    pub fn set_block(&mut self, v: NodeIndex, b: BlockIndex) {
        self.node_to_block[v as usize] = BlockOrSingleton::Block(b);
    }

    /// Turn `v` into a singleton. Marking a vertex twice is a programming
    /// error and is rejected.
    pub fn mark_singleton(&mut self, v: NodeIndex) -> Result<(), PartitionError> {
        let covered = self.node_to_block.len();
        let slot = self
            .node_to_block
            .get_mut(v as usize)
            .ok_or(PartitionError::VertexOutOfRange(v, covered))?;
        if slot.is_singleton() {
            return Err(PartitionError::AlreadySingleton(v));
        }
        *slot = BlockOrSingleton::Singleton(v);
        self.singletons += 1;
        Ok(())
    }

    /// Record that block slot `b` was vacated.
    pub fn push_free(&mut self, b: BlockIndex) {
        self.free_slots.push(b);
    }

    /// Reuse the most recently vacated slot, if any.
    pub fn pop_free(&mut self) -> Option<BlockIndex> {
        self.free_slots.pop()
    }

    /// Number of vacated slots currently available for reuse.
    pub fn freeblock_count(&self) -> usize {
        self.free_slots.len()
    }

    /// Number of singleton cells.
    pub fn singleton_count(&self) -> u64 {
        self.singletons
    }

    /// Number of vertices covered by the map.
    pub fn len(&self) -> usize {
        self.node_to_block.len()
    }

    /// True when the map covers no vertices.
    pub fn is_empty(&self) -> bool {
        self.node_to_block.is_empty()
    }
}

/// Blocks flagged as split candidates for the next refinement step.
///
/// Kept behind its own type so the representation can change (a bitset would
/// also work) without touching the refiner.
#[derive(Debug, Clone, Default)]
pub struct DirtyBlocks {
    blocks: BTreeSet<BlockIndex>,
}

impl DirtyBlocks {
    /// Empty dirty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag `b` as a split candidate.
    pub fn set_dirty(&mut self, b: BlockIndex) {
        self.blocks.insert(b);
    }

    /// Iterate flagged blocks in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = BlockIndex> + '_ {
        self.blocks.iter().copied()
    }

    /// Number of flagged blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True when nothing is flagged.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// One child of a split block in a refines edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineChild {
    /// One or more members became singletons (recorded at most once per
    /// parent; identities live in the updated map / singleton mapping).
    Singletons,
    /// An ordinary child block at the new level (0-based slot).
    Block(BlockIndex),
}

/// Parent-to-children relation for one level transition, keyed by the
/// parent's 0-based slot at the old level.
#[derive(Debug, Clone, Default)]
pub struct RefinesMapping {
    edges: BTreeMap<BlockIndex, Vec<RefineChild>>,
}

impl RefinesMapping {
    /// Empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `parent` split into `children`.
    pub fn add_edge(&mut self, parent: BlockIndex, children: Vec<RefineChild>) {
        self.edges.insert(parent, children);
    }

    /// Iterate refines edges in ascending parent order.
    pub fn iter(&self) -> impl Iterator<Item = (BlockIndex, &[RefineChild])> {
        self.edges.iter().map(|(p, c)| (*p, c.as_slice()))
    }

    /// True when no block changed over this transition.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Number of ordinary (non-singleton) children across all edges; this is
    /// what the accumulated-block statistic grows by.
    pub fn new_block_count(&self) -> u64 {
        self.edges
            .values()
            .flatten()
            .filter(|c| matches!(c, RefineChild::Block(_)))
            .count() as u64
    }

    /// Serialize as a `mapping-KKKKtoLLLL.bin` payload: parents and block
    /// children gain the 1-based file offset, singleton markers become `0`.
    pub fn write_to<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<()> {
        for (parent, children) in self.iter() {
            let infile: Vec<u64> = children
                .iter()
                .map(|c| match c {
                    RefineChild::Singletons => 0,
                    RefineChild::Block(b) => b + 1,
                })
                .collect();
            crate::wire::write_mapping_record(w, parent + 1, &infile)?;
        }
        Ok(())
    }
}

/// Everything one refinement level owns: the block table, the dirty set, the
/// vertex-to-block map, and the refines edges from the previous level (empty
/// at level 0).
#[derive(Debug)]
pub struct LevelOutcome {
    /// Block table; vacated slots hold empty blocks.
    pub blocks: Vec<Block>,
    /// Split candidates for the next level.
    pub dirty: DirtyBlocks,
    /// Total vertex-to-cell map.
    pub map: VertexBlockMap,
    /// Refines edges from the previous level into this one.
    pub refines: RefinesMapping,
    /// Depth of this outcome.
    pub level: Level,
}

impl LevelOutcome {
    /// Number of live (non-vacated) blocks.
    pub fn non_singleton_block_count(&self) -> u64 {
        self.blocks.len() as u64 - self.map.freeblock_count() as u64
    }

    /// Number of singleton cells.
    pub fn singleton_count(&self) -> u64 {
        self.map.singleton_count()
    }

    /// Total partition cells: live blocks plus singletons.
    pub fn total_cells(&self) -> u64 {
        self.non_singleton_block_count() + self.singleton_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_encoding_round_trips() {
        assert_eq!(BlockOrSingleton::Block(7).to_signed(), 7);
        assert_eq!(BlockOrSingleton::Singleton(0).to_signed(), -1);
        assert_eq!(BlockOrSingleton::Singleton(41).to_signed(), -42);
        assert_eq!(
            BlockOrSingleton::from_signed(-42),
            Some(BlockOrSingleton::Singleton(41))
        );
        assert_eq!(
            BlockOrSingleton::from_signed(7),
            Some(BlockOrSingleton::Block(7))
        );
        assert_eq!(BlockOrSingleton::from_signed(0), None);
    }

    #[test]
    fn singleton_marking_is_counted_and_idempotence_rejected() {
        let mut map = VertexBlockMap::all_to_zero(3);
        map.mark_singleton(1).unwrap();
        assert_eq!(map.singleton_count(), 1);
        assert_eq!(map.get(1), BlockOrSingleton::Singleton(1));
        assert!(matches!(
            map.mark_singleton(1),
            Err(PartitionError::AlreadySingleton(1))
        ));
        assert_eq!(map.singleton_count(), 1);
    }

    #[test]
    fn free_slots_are_lifo() {
        let mut map = VertexBlockMap::all_to_zero(1);
        map.push_free(3);
        map.push_free(8);
        assert_eq!(map.freeblock_count(), 2);
        assert_eq!(map.pop_free(), Some(8));
        assert_eq!(map.pop_free(), Some(3));
        assert_eq!(map.pop_free(), None);
    }

    #[test]
    fn clones_are_independent() {
        let mut map = VertexBlockMap::all_to_zero(2);
        let mut copy = map.clone();
        copy.mark_singleton(0).unwrap();
        copy.push_free(0);
        assert_eq!(map.singleton_count(), 0);
        assert_eq!(map.freeblock_count(), 0);
        assert_eq!(map.get(0), BlockOrSingleton::Block(0));
        map.set_block(1, 5);
        assert_eq!(copy.get(1), BlockOrSingleton::Block(0));
    }

    #[test]
    fn refines_mapping_offsets_on_the_wire() {
        let mut m = RefinesMapping::new();
        m.add_edge(0, vec![RefineChild::Block(0), RefineChild::Singletons]);
        m.add_edge(4, vec![RefineChild::Block(7)]);
        assert_eq!(m.new_block_count(), 2);

        let mut buf = Vec::new();
        m.write_to(&mut buf).unwrap();
        let mut rd = crate::wire::MappingReader::new(std::io::Cursor::new(buf));
        let first = rd.next_record().unwrap().unwrap();
        assert_eq!(first.parent, 1);
        assert_eq!(first.children, vec![1, 0]);
        let second = rd.next_record().unwrap().unwrap();
        assert_eq!(second.parent, 5);
        assert_eq!(second.children, vec![8]);
    }
}
