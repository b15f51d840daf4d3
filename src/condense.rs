//! Multi-level summary assembly
//!
//! The condenser re-reads everything the driver persisted and folds it into a
//! single graph whose nodes are `(block, lifetime-interval)` pairs. It never
//! touches the refiner's in-memory state: per-level outcomes, refines
//! mappings, and the raw triples are its only inputs.
//!
//! Three phases:
//!
//! 1. **Replay** the outcomes and mappings from the first persisted level up
//!    to the final depth. This rebuilds the terminal vertex-to-block view and,
//!    as a by-product, recovers which vertices became singletons at which
//!    transition under which parent (the singleton ledger — the driver never
//!    wrote that down explicitly).
//! 2. **Assign global ids and collect edges.** Local block ids are only
//!    unique within a level, so every `(level, local)` pair gets a dense
//!    global id in discovery order; singletons are globally unique already and
//!    pass through. Data edges enter at the terminal level, then each level
//!    transition is walked downward: blocks that die at the transition map to
//!    their merged parent, and the only edges that need revisiting are the
//!    incoming edges of just-dying blocks and the outgoing edges of the
//!    previous transition's casualties. That two-direction sweep adds each
//!    cross-level edge exactly once, at the shallowest level where both
//!    endpoints coexist.
//! 3. **Write** the summary graph, the interval table, the local-to-global
//!    map, and one singleton-mapping file per singleton-producing transition.
//!
//! Runs that stopped at depth 1 (trivial start) or 0 (typed start) collapse
//! to two levels and take a short-circuit path; a trivial start that left
//! more than one terminal node gets a synthetic universal block at level 0
//! with a freshly assigned global id.

#![allow(clippy::too_many_arguments)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::layout::{level_tag, ExperimentDir};
use crate::partition::BlockOrSingleton;
use crate::stats::{self, GraphStats, PhaseStats, StatsError, StepTimer, SummaryGraphStats};
use crate::wire::{self, WireError};
use crate::{EdgeLabel, Level, NodeIndex};

/// A condensed summary node: `Block` carries a *global* id outside the replay
/// phase (1-based local file ids inside it); singletons are their vertex.
pub type SummaryNode = BlockOrSingleton;

type Interval = (Level, Level);

/// Errors surfaced by the condenser.
#[derive(Debug, thiserror::Error)]
pub enum CondenseError {
    /// A required per-level artifact is missing or unreadable.
    #[error("missing or unreadable artifact {path:?}: {source}")]
    MissingArtifact {
        /// Path of the artifact.
        path: PathBuf,
        /// Underlying open error.
        source: std::io::Error,
    },
    /// Artifact decoding failed.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// Statistics I/O failed.
    #[error(transparent)]
    Stats(#[from] StatsError),
    /// Artifact I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A local block id was referenced before any outcome introduced it.
    #[error("local block {local} at level {level} has no outcome entry")]
    UnknownLocalBlock {
        /// Level the reference was made at.
        level: Level,
        /// In-file local block id.
        local: u64,
    },
    /// A `(level, local)` pair was assigned a global id twice.
    #[error("global id already assigned for local block {local} at level {level}")]
    DuplicateGlobalId {
        /// Level of the duplicate assignment.
        level: Level,
        /// In-file local block id.
        local: u64,
    },
    /// An edge referenced a summary node that was never added.
    #[error("summary node {0} referenced before being added")]
    UnknownSummaryNode(i64),
    /// A summary node was added twice.
    #[error("summary node {0} added twice")]
    DuplicateSummaryNode(i64),
    /// A node is about to be written with `start > end`.
    #[error("interval inversion on node {node}: [{start}, {end}]")]
    IntervalInversion {
        /// Signed node id.
        node: i64,
        /// Interval start.
        start: Level,
        /// Interval end.
        end: Level,
    },
    /// A summary node reached the writer without an interval.
    #[error("summary node {0} has no lifetime interval")]
    MissingInterval(i64),
}

fn open_artifact(path: &Path) -> Result<BufReader<File>, CondenseError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CondenseError::MissingArtifact { path: path.to_path_buf(), source })
}

// ============================================================================
// Working structures
// ============================================================================

/// The condensed graph under construction: forward adjacency (set semantics)
/// plus a reverse index so dying blocks can find their incoming edges.
#[derive(Debug, Default)]
struct SummaryGraph {
    nodes: BTreeMap<SummaryNode, BTreeSet<(EdgeLabel, SummaryNode)>>,
    reverse: HashMap<SummaryNode, HashSet<(EdgeLabel, SummaryNode)>>,
}

impl SummaryGraph {
    /// Add a node that must not exist yet.
    fn add_node(&mut self, node: SummaryNode) -> Result<(), CondenseError> {
        if self.nodes.insert(node, BTreeSet::new()).is_some() {
            return Err(CondenseError::DuplicateSummaryNode(node.to_signed()));
        }
        Ok(())
    }

    /// Add a node unless it already exists.
    fn ensure_node(&mut self, node: SummaryNode) {
        self.nodes.entry(node).or_default();
    }

    /// Record `(subject, predicate, object)`. The subject must already be a
    /// forward node; the reverse entry of the object is created on demand.
    fn add_edge(
        &mut self,
        subject: SummaryNode,
        predicate: EdgeLabel,
        object: SummaryNode,
    ) -> Result<(), CondenseError> {
        let pairs = self
            .nodes
            .get_mut(&subject)
            .ok_or(CondenseError::UnknownSummaryNode(subject.to_signed()))?;
        pairs.insert((predicate, object));
        self.reverse
            .entry(object)
            .or_default()
            .insert((predicate, subject));
        Ok(())
    }

    /// Cloned outgoing `(predicate, object)` pairs of `node`.
    fn outgoing(&self, node: SummaryNode) -> Vec<(EdgeLabel, SummaryNode)> {
        self.nodes
            .get(&node)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Cloned incoming `(predicate, subject)` pairs of `node`.
    fn incoming(&self, node: SummaryNode) -> Vec<(EdgeLabel, SummaryNode)> {
        self.reverse
            .get(&node)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Distinct nodes appearing as a subject or object, and the edge total.
    fn counts(&self) -> (u64, u64) {
        let mut seen: HashSet<SummaryNode> = HashSet::new();
        let mut edges = 0u64;
        for (subject, pairs) in &self.nodes {
            seen.insert(*subject);
            for (_, object) in pairs {
                seen.insert(*object);
                edges += 1;
            }
        }
        (seen.len() as u64, edges)
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<(), CondenseError> {
        for (subject, pairs) in &self.nodes {
            for (predicate, object) in pairs {
                wire::write_signed(w, subject.to_signed())?;
                wire::write_predicate(w, *predicate)?;
                wire::write_signed(w, object.to_signed())?;
            }
        }
        Ok(())
    }
}

/// Dense global ids for `(level, local-block)` pairs, assigned from 1 upward
/// in discovery order. Singletons pass through untouched.
#[derive(Debug)]
struct GlobalIds {
    map: BTreeMap<(Level, u64), u64>,
    next: u64,
}

impl GlobalIds {
    fn new() -> Self {
        Self { map: BTreeMap::new(), next: 1 }
    }

    /// Assign a fresh global id to `(level, local)`.
    fn assign(&mut self, level: Level, local: u64) -> Result<SummaryNode, CondenseError> {
        if self.map.contains_key(&(level, local)) {
            return Err(CondenseError::DuplicateGlobalId { level, local });
        }
        let global = self.next;
        self.next += 1;
        self.map.insert((level, local), global);
        Ok(SummaryNode::Block(global))
    }

    /// Map a node at `level` to its global form.
    fn resolve(&self, level: Level, node: SummaryNode) -> Result<SummaryNode, CondenseError> {
        match node {
            SummaryNode::Singleton(_) => Ok(node),
            SummaryNode::Block(local) => self
                .map
                .get(&(level, local))
                .map(|&g| SummaryNode::Block(g))
                .ok_or(CondenseError::UnknownLocalBlock { level, local }),
        }
    }

    /// Serialize as the local-to-global map file. The level field records the
    /// *birth* level of the global node, i.e. its interval start.
    fn write_to<W: Write>(
        &self,
        w: &mut W,
        intervals: &BTreeMap<SummaryNode, Interval>,
    ) -> Result<(), CondenseError> {
        for (&(_, local), &global) in &self.map {
            let node = SummaryNode::Block(global);
            let (start, _) = intervals
                .get(&node)
                .ok_or(CondenseError::MissingInterval(global as i64))?;
            wire::write_local_global_record(w, *start, local as i64, global as i64)?;
        }
        Ok(())
    }
}

/// Child-to-parent map of one level transition; unknown nodes map to
/// themselves (they did not change).
#[derive(Debug, Default)]
struct SplitToMerged {
    map: HashMap<SummaryNode, SummaryNode>,
}

impl SplitToMerged {
    fn insert(&mut self, child: SummaryNode, parent: SummaryNode) {
        self.map.insert(child, parent);
    }

    fn map_or_self(&self, node: SummaryNode) -> SummaryNode {
        self.map.get(&node).copied().unwrap_or(node)
    }
}

/// Which vertices left which parent as singletons at which transition;
/// reconstructed during replay and persisted for the quotient extractor.
#[derive(Debug, Default)]
struct SingletonLedger {
    levels: BTreeMap<Level, BTreeMap<u64, BTreeSet<NodeIndex>>>,
}

impl SingletonLedger {
    fn record(&mut self, level: Level, parent_local: u64, vertex: NodeIndex) {
        self.levels
            .entry(level)
            .or_default()
            .entry(parent_local)
            .or_default()
            .insert(vertex);
    }

    /// Singletons produced by `parent_local` at the transition into `level`.
    fn singletons_of(
        &self,
        level: Level,
        parent_local: u64,
    ) -> Result<&BTreeSet<NodeIndex>, CondenseError> {
        self.levels
            .get(&level)
            .and_then(|parents| parents.get(&parent_local))
            .ok_or(CondenseError::UnknownLocalBlock { level, local: parent_local })
    }

    /// Emit one `singleton_mapping-KKKKtoLLLL.bin` per recorded transition.
    fn write_all(&self, dir: &ExperimentDir) -> Result<(), CondenseError> {
        for (&level, parents) in &self.levels {
            let path = dir.singleton_mapping_file(level - 1);
            let mut w = BufWriter::new(File::create(path)?);
            for (&parent, vertices) in parents {
                let vertices: Vec<NodeIndex> = vertices.iter().copied().collect();
                wire::write_singleton_mapping_record(&mut w, parent, &vertices)?;
            }
            w.flush()?;
        }
        Ok(())
    }
}

// ============================================================================
// Phase 1: replay the persisted levels
// ============================================================================

/// Terminal vertex-to-block view plus the reconstructed singleton history.
struct TerminalPartition {
    /// Per-vertex cell; `Block` holds the 1-based in-file local id.
    node_to_block: Vec<SummaryNode>,
    /// Members of every local block mentioned by any outcome (empty once the
    /// block dissolved without ordinary children).
    blocks: BTreeMap<u64, BTreeSet<NodeIndex>>,
    singletons: SingletonLedger,
}

fn replay_outcomes(
    dir: &ExperimentDir,
    first_level: Level,
    final_depth: Level,
    vertex_count: u64,
) -> Result<TerminalPartition, CondenseError> {
    // Until an outcome record claims a vertex, it counts as a singleton.
    let mut node_to_block: Vec<SummaryNode> =
        (0..vertex_count).map(SummaryNode::Singleton).collect();
    let mut blocks: BTreeMap<u64, BTreeSet<NodeIndex>> = BTreeMap::new();
    let mut ledger = SingletonLedger::default();

    tracing::info!(level = first_level, "replaying first outcome");
    let mut rd = wire::OutcomeReader::new(open_artifact(&dir.outcome_file(first_level))?);
    while let Some(rec) = rd.next_record()? {
        let members = blocks.entry(rec.block).or_default();
        for v in rec.members {
            node_to_block[v as usize] = SummaryNode::Block(rec.block);
            members.insert(v);
        }
    }

    for level in first_level + 1..=final_depth {
        tracing::info!(level, "replaying transition");
        let mut parents: Vec<u64> = Vec::new();
        let mut new_blocks: HashSet<u64> = HashSet::new();
        let mut dissolved: Vec<u64> = Vec::new();
        let mut singletons_created = false;

        let mut rd = wire::MappingReader::new(open_artifact(&dir.mapping_file(level - 1))?);
        while let Some(rec) = rd.next_record()? {
            parents.push(rec.parent);
            for &child in &rec.children {
                if child == 0 {
                    singletons_created = true;
                    if rec.children.len() == 1 {
                        dissolved.push(rec.parent);
                    }
                } else {
                    new_blocks.insert(child);
                }
            }
        }

        // Vertices of every split parent; whoever is absent from every new
        // block afterwards must have become a singleton here.
        let mut orphan_candidates: BTreeSet<NodeIndex> = BTreeSet::new();
        if singletons_created {
            for parent in &parents {
                let members = blocks.get(parent).ok_or(CondenseError::UnknownLocalBlock {
                    level: level - 1,
                    local: *parent,
                })?;
                orphan_candidates.extend(members.iter().copied());
            }
            for parent in &dissolved {
                if let Some(members) = blocks.get_mut(parent) {
                    members.clear();
                }
            }
        }

        let mut rd = wire::OutcomeReader::new(open_artifact(&dir.outcome_file(level))?);
        while let Some(rec) = rd.next_record()? {
            let members = blocks.entry(rec.block).or_default();
            members.clear();
            for v in rec.members {
                node_to_block[v as usize] = SummaryNode::Block(rec.block);
                members.insert(v);
            }
        }

        if singletons_created {
            for new_block in &new_blocks {
                let members =
                    blocks.get(new_block).ok_or(CondenseError::UnknownLocalBlock {
                        level,
                        local: *new_block,
                    })?;
                for v in members {
                    orphan_candidates.remove(v);
                }
            }
            for v in orphan_candidates {
                match node_to_block[v as usize] {
                    SummaryNode::Block(parent) => {
                        ledger.record(level, parent, v);
                        node_to_block[v as usize] = SummaryNode::Singleton(v);
                    }
                    SummaryNode::Singleton(_) => {
                        return Err(CondenseError::UnknownSummaryNode(
                            SummaryNode::Singleton(v).to_signed(),
                        ));
                    }
                }
            }
        }
    }

    Ok(TerminalPartition { node_to_block, blocks, singletons: ledger })
}

// ============================================================================
// Phase 2: edges and intervals
// ============================================================================

/// Mark `node` as dying at transition `level`: its lifetime starts there. A
/// node never seen before gets the one-level interval `[level, level]`.
fn set_dying_interval(
    intervals: &mut BTreeMap<SummaryNode, Interval>,
    node: SummaryNode,
    level: Level,
) {
    intervals
        .entry(node)
        .and_modify(|iv| iv.0 = level)
        .or_insert((level, level));
}

/// Stream the raw triples once, lifting every edge to the summary: the
/// subject lands at its terminal-level node, the object additionally crosses
/// `object_map` down to the next level.
fn load_data_edges(
    dir: &ExperimentDir,
    node_to_block: &[SummaryNode],
    globals: &GlobalIds,
    object_map: &SplitToMerged,
    intervals: &mut BTreeMap<SummaryNode, Interval>,
    current_level: Level,
    first_level: Level,
    gs: &mut SummaryGraph,
) -> Result<(), CondenseError> {
    let mut r = open_artifact(&dir.triples_file())?;
    let mut count = 0u64;
    loop {
        let subject = match wire::read_entity_opt(&mut r)? {
            Some(s) => s,
            None => break,
        };
        let predicate = wire::read_predicate(&mut r)?;
        let object = wire::read_entity(&mut r)?;

        let subject_node = globals.resolve(current_level, node_to_block[subject as usize])?;
        gs.ensure_node(subject_node);
        intervals
            .entry(subject_node)
            .or_insert((first_level, current_level));

        let object_node =
            object_map.map_or_self(globals.resolve(current_level, node_to_block[object as usize])?);
        gs.add_edge(subject_node, predicate, object_node)?;

        count += 1;
        if count % 1_000_000 == 0 {
            tracing::info!(triples = count, "lifting data edges");
        }
    }
    Ok(())
}

/// Walk the refines mapping of the `level-1 → level` transition: assign
/// global ids to the freshly merged parents, route every dying child onto its
/// parent, and adjust intervals on both sides.
fn apply_transition_mapping(
    dir: &ExperimentDir,
    level: Level,
    first_level: Level,
    globals: &mut GlobalIds,
    local_to_global: &HashMap<u64, SummaryNode>,
    ledger: &SingletonLedger,
    gs: &mut SummaryGraph,
    intervals: &mut BTreeMap<SummaryNode, Interval>,
    split: &mut SplitToMerged,
    dying: &mut HashSet<SummaryNode>,
    spawning: &mut BTreeMap<SummaryNode, SummaryNode>,
) -> Result<(), CondenseError> {
    let mut rd = wire::MappingReader::new(open_artifact(&dir.mapping_file(level - 1))?);
    while let Some(rec) = rd.next_record()? {
        let parent = globals.assign(level - 1, rec.parent)?;
        spawning.insert(parent, SummaryNode::Block(rec.parent));
        gs.add_node(parent)?;
        intervals.insert(parent, (first_level, level - 1));

        for &child in &rec.children {
            if child == 0 {
                for &v in ledger.singletons_of(level, rec.parent)? {
                    let singleton = SummaryNode::Singleton(v);
                    split.insert(singleton, parent);
                    dying.insert(singleton);
                    set_dying_interval(intervals, singleton, level);
                }
            } else {
                let child_node = *local_to_global
                    .get(&child)
                    .ok_or(CondenseError::UnknownLocalBlock { level, local: child })?;
                split.insert(child_node, parent);
                dying.insert(child_node);
                set_dying_interval(intervals, child_node, level);
            }
        }
    }
    Ok(())
}

// ============================================================================
// Phase 3: artifacts
// ============================================================================

fn write_artifacts(
    dir: &ExperimentDir,
    gs: &SummaryGraph,
    intervals: &BTreeMap<SummaryNode, Interval>,
    globals: &GlobalIds,
    ledger: &SingletonLedger,
) -> Result<(), CondenseError> {
    let mut w = BufWriter::new(File::create(dir.summary_graph_file())?);
    gs.write_to(&mut w)?;
    w.flush()?;

    ledger.write_all(dir)?;

    let mut w = BufWriter::new(File::create(dir.intervals_file())?);
    for (&node, &(start, end)) in intervals {
        if start > end {
            return Err(CondenseError::IntervalInversion { node: node.to_signed(), start, end });
        }
        wire::write_interval_record(&mut w, node.to_signed(), start, end)?;
    }
    w.flush()?;

    let mut w = BufWriter::new(File::create(dir.local_global_file())?);
    globals.write_to(&mut w, intervals)?;
    w.flush()?;
    Ok(())
}

fn write_phase_stats(dir: &ExperimentDir, from: Level, to: Level, timer: &StepTimer) {
    if let Some(step) = timer.last() {
        let record = PhaseStats { time_ms: step.elapsed_ms(), memory_kb: step.memory_kb };
        if let Err(e) = stats::write_json(&dir.data_edges_stats_file(from, to), &record) {
            tracing::warn!(error = %e, "could not write phase statistics");
        }
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Condense the persisted levels under `dir` into the multi-level summary.
///
/// Returns the summary statistics that were also written to
/// `ad_hoc_results/summary_graph_stats.json`.
pub fn condense(dir: &ExperimentDir) -> Result<SummaryGraphStats, CondenseError> {
    let mut timer = StepTimer::new();

    let graph_stats: GraphStats = stats::read_json(&dir.graph_stats_file())?;
    let final_depth = graph_stats.final_depth;
    let fixed_point = graph_stats.fixed_point;
    let include_zero = dir.outcome_file(0).exists();
    let first_level: Level = if include_zero { 0 } else { 1 };
    tracing::info!(final_depth, fixed_point, include_zero, "condensing");

    timer.begin("replay outcomes")?;
    let term = replay_outcomes(dir, first_level, final_depth, graph_stats.vertex_count)?;
    timer.end()?;

    // Depth-0 (typed) and depth-1 (trivial) runs collapse to two levels.
    let mut current_level = final_depth;
    let immediate_stop = if include_zero {
        if current_level == 0 {
            current_level = 1;
            true
        } else {
            false
        }
    } else {
        current_level == 1
    };

    let mut globals = GlobalIds::new();
    let mut gs = SummaryGraph::default();
    let mut intervals: BTreeMap<SummaryNode, Interval> = BTreeMap::new();

    // Living nodes at the terminal level: every non-empty block plus every
    // singleton, keyed by global id with the local form as payload.
    let mut old_living: BTreeMap<SummaryNode, SummaryNode> = BTreeMap::new();
    for (&local, members) in &term.blocks {
        if members.is_empty() {
            continue;
        }
        let global = globals.assign(current_level, local)?;
        old_living.insert(global, SummaryNode::Block(local));
    }
    for cell in &term.node_to_block {
        if let SummaryNode::Singleton(v) = cell {
            old_living.insert(SummaryNode::Singleton(*v), SummaryNode::Singleton(*v));
        }
    }

    let mut new_living = old_living.clone();
    let mut local_to_global: HashMap<u64, SummaryNode> = HashMap::new();
    for (&global, &local) in &old_living {
        if let SummaryNode::Block(l) = local {
            local_to_global.insert(l, global);
        }
    }

    if immediate_stop {
        timer.begin("terminal data edges")?;
        let mut level_one_to_zero = SplitToMerged::default();
        if include_zero || old_living.len() == 1 {
            for &global in old_living.keys() {
                level_one_to_zero.insert(global, global);
            }
        } else {
            // Trivial start with several terminal nodes: invent the level-0
            // universal block every one of them refines into.
            let universal = globals.assign(0, 0)?;
            gs.add_node(universal)?;
            intervals.insert(universal, (0, 0));
            for &global in old_living.keys() {
                level_one_to_zero.insert(global, universal);
            }
        }

        if fixed_point {
            // Load the fixed-point edges first, then mirror every object one
            // level down so the 1 → 0 layer exists as well.
            let identity = {
                let mut m = SplitToMerged::default();
                for &global in old_living.keys() {
                    m.insert(global, global);
                }
                m
            };
            load_data_edges(
                dir,
                &term.node_to_block,
                &globals,
                &identity,
                &mut intervals,
                current_level,
                first_level,
                &mut gs,
            )?;
            for &global in old_living.keys() {
                intervals.entry(global).or_insert((first_level, current_level));
            }
            let edges: Vec<(SummaryNode, EdgeLabel, SummaryNode)> = gs
                .nodes
                .iter()
                .flat_map(|(s, pairs)| pairs.iter().map(|&(p, o)| (*s, p, o)))
                .collect();
            for (subject, predicate, object) in edges {
                gs.add_edge(subject, predicate, level_one_to_zero.map_or_self(object))?;
            }
        } else {
            load_data_edges(
                dir,
                &term.node_to_block,
                &globals,
                &level_one_to_zero,
                &mut intervals,
                current_level,
                first_level,
                &mut gs,
            )?;
            for &global in old_living.keys() {
                intervals.entry(global).or_insert((first_level, current_level));
            }
        }
        timer.end()?;
        write_phase_stats(dir, 1, 0, &timer);

        return finish(dir, &gs, &intervals, &globals, &term.singletons, &mut timer);
    }

    // General path. First the terminal edges: with a fixed point the last two
    // levels are identical, so objects stay at the terminal level; otherwise
    // the terminal transition is consumed here and objects land one level
    // down.
    let mut old_split = SplitToMerged::default();
    let mut old_dying: HashSet<SummaryNode> = HashSet::new();

    timer.begin("terminal data edges")?;
    if fixed_point {
        for &global in old_living.keys() {
            old_split.insert(global, global);
        }
        load_data_edges(
            dir,
            &term.node_to_block,
            &globals,
            &old_split,
            &mut intervals,
            current_level,
            first_level,
            &mut gs,
        )?;
    } else {
        let mut dying: HashSet<SummaryNode> = HashSet::new();
        let mut spawning: BTreeMap<SummaryNode, SummaryNode> = BTreeMap::new();
        apply_transition_mapping(
            dir,
            current_level,
            first_level,
            &mut globals,
            &local_to_global,
            &term.singletons,
            &mut gs,
            &mut intervals,
            &mut old_split,
            &mut dying,
            &mut spawning,
        )?;
        for d in &dying {
            new_living.remove(d);
        }
        new_living.extend(spawning);
        old_dying = dying;
        local_to_global.clear();
        for (&global, &local) in &new_living {
            if let SummaryNode::Block(l) = local {
                local_to_global.insert(l, global);
            }
        }
        load_data_edges(
            dir,
            &term.node_to_block,
            &globals,
            &old_split,
            &mut intervals,
            current_level,
            first_level,
            &mut gs,
        )?;
    }
    timer.end()?;
    write_phase_stats(
        dir,
        current_level,
        if fixed_point { current_level } else { current_level - 1 },
        &timer,
    );

    // Terminal nodes with no outgoing edges never became subjects; give the
    // ones still missing an interval their full lifetime.
    for &global in old_living.keys() {
        intervals.entry(global).or_insert((first_level, current_level));
    }

    let smallest_level: Level = if include_zero { 0 } else { 1 };
    let initial_level: Level = if fixed_point { current_level } else { current_level - 1 };

    for level in (smallest_level + 1..=initial_level).rev() {
        timer.begin(&format!(
            "data edges {} to {}",
            level_tag(level),
            level_tag(level - 1)
        ))?;

        let mut split = SplitToMerged::default();
        let mut dying: HashSet<SummaryNode> = HashSet::new();
        let mut spawning: BTreeMap<SummaryNode, SummaryNode> = BTreeMap::new();
        apply_transition_mapping(
            dir,
            level,
            first_level,
            &mut globals,
            &local_to_global,
            &term.singletons,
            &mut gs,
            &mut intervals,
            &mut split,
            &mut dying,
            &mut spawning,
        )?;

        // Incoming edges of the blocks dying at this transition, rewritten to
        // their merged parents.
        for &dying_node in &dying {
            let object = split.map_or_self(dying_node);
            for (predicate, subject) in gs.incoming(dying_node) {
                if !old_living.contains_key(&subject) {
                    continue;
                }
                let subject = old_split.map_or_self(subject);
                gs.add_edge(subject, predicate, object)?;
            }
        }
        // Outgoing edges of the previous transition's casualties, whose
        // objects have now found their new homes.
        for &old_dying_node in &old_dying {
            let subject = old_split.map_or_self(old_dying_node);
            for (predicate, object) in gs.outgoing(old_dying_node) {
                if !new_living.contains_key(&object) {
                    continue;
                }
                gs.add_edge(subject, predicate, split.map_or_self(object))?;
            }
        }

        old_living = new_living.clone();
        for d in &dying {
            new_living.remove(d);
        }
        new_living.extend(spawning);
        old_dying = dying;
        local_to_global.clear();
        for (&global, &local) in &new_living {
            if let SummaryNode::Block(l) = local {
                local_to_global.insert(l, global);
            }
        }
        old_split = split;

        timer.end()?;
        write_phase_stats(dir, level, level - 1, &timer);
    }

    if !include_zero {
        // No persisted level 0: the universal block and the 1 → 0 edges are
        // synthesized here.
        timer.begin("data edges 0001 to 0000")?;
        let universal = globals.assign(0, 0)?;
        gs.add_node(universal)?;
        intervals.insert(universal, (0, 0));
        let level_one: Vec<SummaryNode> = old_living.keys().copied().collect();
        for subject in level_one {
            gs.ensure_node(subject);
            let image = old_split.map_or_self(subject);
            for (predicate, _) in gs.outgoing(subject) {
                gs.add_edge(image, predicate, universal)?;
            }
        }
        timer.end()?;
        write_phase_stats(dir, 1, 0, &timer);
    }

    finish(dir, &gs, &intervals, &globals, &term.singletons, &mut timer)
}

fn finish(
    dir: &ExperimentDir,
    gs: &SummaryGraph,
    intervals: &BTreeMap<SummaryNode, Interval>,
    globals: &GlobalIds,
    ledger: &SingletonLedger,
    timer: &mut StepTimer,
) -> Result<SummaryGraphStats, CondenseError> {
    timer.begin("write artifacts")?;
    let (vertex_count, edge_count) = gs.counts();
    write_artifacts(dir, gs, intervals, globals, ledger)?;
    timer.end()?;

    let total_time_ms: u64 = timer.steps().iter().map(|s| s.elapsed_ms()).sum();
    let summary = SummaryGraphStats {
        vertex_count,
        edge_count,
        total_time_ms,
        max_memory_kb: timer.max_memory_kb(),
    };
    stats::write_json(&dir.summary_stats_file(), &summary)?;
    tracing::info!(vertex_count, edge_count, "summary graph written");
    Ok(summary)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RunConfig;
    use crate::testutil::run_in_tempdir;
    use crate::wire::{IntervalReader, LocalGlobalReader};

    fn read_summary_edges(dir: &ExperimentDir) -> BTreeSet<(i64, u32, i64)> {
        let mut r = open_artifact(&dir.summary_graph_file()).unwrap();
        let mut edges = BTreeSet::new();
        loop {
            let s = match wire::read_signed_opt(&mut r).unwrap() {
                Some(s) => s,
                None => break,
            };
            let p = wire::read_predicate(&mut r).unwrap();
            let o = wire::read_signed(&mut r).unwrap();
            edges.insert((s, p, o));
        }
        edges
    }

    fn read_intervals(dir: &ExperimentDir) -> BTreeMap<i64, (u16, u16)> {
        let mut rd = IntervalReader::new(open_artifact(&dir.intervals_file()).unwrap());
        let mut map = BTreeMap::new();
        while let Some(rec) = rd.next_record().unwrap() {
            map.insert(rec.node, (rec.start, rec.end));
        }
        map
    }

    fn read_local_global(dir: &ExperimentDir) -> Vec<(u16, i64, i64)> {
        let mut rd = LocalGlobalReader::new(open_artifact(&dir.local_global_file()).unwrap());
        let mut out = Vec::new();
        while let Some(rec) = rd.next_record().unwrap() {
            out.push((rec.level, rec.local, rec.global));
        }
        out
    }

    #[test]
    fn immediate_stop_trivial_with_universal_block() {
        // S1 stabilizes at depth 1: terminal nodes are the pair block (global
        // 1) and singleton 2; the synthetic universal block gets global 2.
        let (_tmp, dir, _) = run_in_tempdir(&[(0, 1, 2), (1, 1, 2)], &RunConfig::default());
        condense(&dir).unwrap();

        let edges = read_summary_edges(&dir);
        let expected: BTreeSet<(i64, u32, i64)> =
            [(1, 1, 2), (1, 1, -3)].into_iter().collect();
        assert_eq!(edges, expected);

        let intervals = read_intervals(&dir);
        assert_eq!(intervals[&1], (1, 1)); // pair block
        assert_eq!(intervals[&-3], (1, 1)); // singleton 2
        assert_eq!(intervals[&2], (0, 0)); // universal block

        // The universal block's global id is fresh, not a reused block id.
        let map = read_local_global(&dir);
        assert!(map.contains(&(1, 1, 1)));
        assert!(map.contains(&(0, 0, 2)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn immediate_stop_typed_start() {
        // S3 with a typed start stabilizes at depth 0: every terminal node is
        // its own level-0 parent and no universal block appears.
        let (_tmp, dir, stats) = run_in_tempdir(
            &[(0, 0, 10), (1, 0, 11), (2, 0, 10)],
            &RunConfig { typed_start: true, ..RunConfig::default() },
        );
        assert_eq!(stats.final_depth, 0);
        condense(&dir).unwrap();

        let intervals = read_intervals(&dir);
        let map = read_local_global(&dir);
        // No (level 0, local 0) universal entry.
        assert!(!map.iter().any(|&(_, local, _)| local == 0));
        // Typed terminal blocks live across the two collapsed levels.
        for &(_, _, global) in &map {
            assert_eq!(intervals[&global], (0, 1));
        }

        // The type edges survive: both members of {0,2} point at vertex 10's
        // cell with the type label, via the block's own id on both levels.
        let edges = read_summary_edges(&dir);
        assert!(!edges.is_empty());
        for &(_, p, _) in &edges {
            assert_eq!(p, 0);
        }
    }

    #[test]
    fn chain_lineage_intervals_and_edges() {
        // 0 → 1 → 2 → 3 under one label; depth 3 fixed point. The lineage
        // {0,1,2} (level 1) → {0,1} (level 2) → singletons (level 3) must
        // appear with tight intervals and one parent edge per transition.
        let (_tmp, dir, stats) =
            run_in_tempdir(&[(0, 1, 1), (1, 1, 2), (2, 1, 3)], &RunConfig::default());
        assert_eq!(stats.final_depth, 3);
        assert!(stats.fixed_point);
        condense(&dir).unwrap();

        // Discovery order: {0,1} at level 2 is global 1, {0,1,2} at level 1
        // is global 2, the universal block is global 3.
        let intervals = read_intervals(&dir);
        assert_eq!(intervals[&-1], (3, 3)); // singleton 0
        assert_eq!(intervals[&-2], (3, 3)); // singleton 1
        assert_eq!(intervals[&-3], (2, 3)); // singleton 2
        assert_eq!(intervals[&-4], (1, 3)); // singleton 3 (sink)
        assert_eq!(intervals[&1], (2, 2)); // {0,1}
        assert_eq!(intervals[&2], (1, 1)); // {0,1,2}
        assert_eq!(intervals[&3], (0, 0)); // universal

        let edges = read_summary_edges(&dir);
        let expected: BTreeSet<(i64, u32, i64)> = [
            (-1, 1, -2), // fixed-point layer: 0 → 1
            (-2, 1, -3), // 1 → 2
            (-3, 1, -4), // 2 → 3
            (-1, 1, 1),  // singleton 0 at level 3 into {0,1} at level 2
            (1, 1, 2),   // {0,1} at level 2 into {0,1,2} at level 1
            (2, 1, 3),   // {0,1,2} at level 1 into the universal block
        ]
        .into_iter()
        .collect();
        assert_eq!(edges, expected);

        // Singleton history was reconstructed for both transitions.
        assert!(dir.singleton_mapping_file(1).exists());
        assert!(dir.singleton_mapping_file(2).exists());
        let mut rd = wire::SingletonMappingReader::new(
            open_artifact(&dir.singleton_mapping_file(2)).unwrap(),
        );
        let rec = rd.next_record().unwrap().unwrap();
        assert_eq!(rec.parent, 1);
        assert_eq!(rec.singletons, vec![0, 1]);
    }

    #[test]
    fn sink_blocks_and_dissolutions_keep_consistent_intervals() {
        // The sink pair {2,3} never appears as an edge subject and the pair
        // {1,4} dissolves at the terminal transition; every written interval
        // must still satisfy start ≤ end.
        let records = [
            (0u64, 1u32, 1u64),
            (0, 2, 4),
            (1, 1, 4),
            (4, 1, 2),
            (4, 1, 3),
        ];
        let (_tmp, dir, stats) = run_in_tempdir(&records, &RunConfig::default());
        assert!(stats.final_depth >= 2, "needs a real multi-level run");
        condense(&dir).unwrap();

        let intervals = read_intervals(&dir);
        for (node, (start, end)) in intervals {
            assert!(start <= end, "inverted interval on {node}");
        }
    }

    #[test]
    fn summary_stats_record_is_written() {
        let (_tmp, dir, _) = run_in_tempdir(&[(0, 1, 2), (1, 1, 2)], &RunConfig::default());
        let summary = condense(&dir).unwrap();
        assert!(summary.vertex_count >= 3);
        let on_disk: SummaryGraphStats = stats::read_json(&dir.summary_stats_file()).unwrap();
        assert_eq!(on_disk.vertex_count, summary.vertex_count);
        assert_eq!(on_disk.edge_count, summary.edge_count);
    }

    #[test]
    fn missing_level_artifacts_are_fatal() {
        let (_tmp, dir, _) =
            run_in_tempdir(&[(0, 1, 1), (1, 1, 2), (2, 1, 3)], &RunConfig::default());
        std::fs::remove_file(dir.outcome_file(2)).unwrap();
        assert!(matches!(
            condense(&dir),
            Err(CondenseError::MissingArtifact { .. })
        ));
    }
}
