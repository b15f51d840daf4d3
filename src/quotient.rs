//! Quotient extraction from the condensed artifacts
//!
//! Given a target depth `L`, the extractor rebuilds that single level's
//! quotient graph without ever rerunning the refiner:
//!
//! 1. Replay the refines mappings forward from the first persisted level,
//!    keeping the set of blocks alive at exactly `L` (with their birth
//!    levels); vertices outside every first-outcome block are singletons born
//!    there, and later singletons come from the singleton-mapping files.
//! 2. Resolve every living block to its global id through the local-to-global
//!    map, matching on birth level since local ids are reused across levels.
//! 3. Project the condensed summary edges: a subject born at `L+1` is mapped
//!    backward over the `L → L+1` refines edges, and an edge survives iff
//!    both endpoints end up alive at `L`. At the fixed point no mapping
//!    exists — both endpoints must simply be alive.
//! 4. Emit three text files: block membership, edges, and the line-aligned
//!    edge labels. Vertices are rendered through the preprocessor's
//!    `entity2ID.txt` when present, as raw ids otherwise.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::condense::SummaryNode;
use crate::layout::ExperimentDir;
use crate::stats::{self, GraphStats, StatsError};
use crate::wire::{self, WireError};
use crate::{Level, NodeIndex};

/// Errors surfaced by quotient extraction.
#[derive(Debug, thiserror::Error)]
pub enum QuotientError {
    /// A required artifact is missing or unreadable.
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
    /// `-1` was requested but the run never reached a fixed point.
    #[error("level -1 means the fixed point, but this run has none; use an absolute level")]
    NoFixedPoint,
    /// The requested level was never computed.
    #[error("level {requested} goes beyond the final depth {final_depth}")]
    BeyondFinalDepth {
        /// Requested level.
        requested: i32,
        /// Deepest level on disk.
        final_depth: Level,
    },
    /// The deepest level of a bounded run is not extractable.
    #[error("level {0} is the last computed level but not the fixed point; compute one more level")]
    LastLevelNotFixedPoint(Level),
    /// A trivial start has no persisted level-0 partition.
    #[error("level 0 of a trivial start is the universal block and has no persisted outcome")]
    LevelZeroNotPersisted,
    /// A negative level other than `-1`.
    #[error("invalid level {0}")]
    InvalidLevel(i32),
    /// A living block never received a global id from the map file.
    #[error("no global id for local block {local} born at level {birth}")]
    UnresolvedGlobal {
        /// In-file local block id.
        local: u64,
        /// Level the block was born at.
        birth: Level,
    },
    /// A refines edge referenced a block outside the living or next sets.
    #[error("refines edge references unknown local block {0}")]
    UnknownRefinesBlock(u64),
}

fn open_artifact(path: &Path) -> Result<BufReader<File>, QuotientError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| QuotientError::MissingArtifact { path: path.to_path_buf(), source })
}

/// What one extraction produced.
#[derive(Debug, Clone, Copy)]
pub struct QuotientOutcome {
    /// The extracted level.
    pub level: Level,
    /// Cells alive at that level (blocks plus singletons).
    pub block_count: u64,
    /// Distinct quotient edges.
    pub edge_count: u64,
}

#[derive(Debug)]
struct LivingEntry {
    birth: Level,
    global: Option<SummaryNode>,
}

/// Optional vertex renderer backed by `entity2ID.txt` (`<name> <id>` lines).
struct EntityNames {
    names: HashMap<NodeIndex, String>,
}

impl EntityNames {
    fn load(dir: &ExperimentDir) -> Result<Self, QuotientError> {
        let mut names = HashMap::new();
        let path = dir.entity_map_file();
        if path.exists() {
            let reader = open_artifact(&path)?;
            for line in reader.lines() {
                let line = line?;
                if let Some((name, id)) = line.rsplit_once(' ') {
                    if let Ok(id) = id.trim().parse::<NodeIndex>() {
                        names.insert(id, name.to_string());
                    }
                }
            }
        }
        Ok(Self { names })
    }

    fn render(&self, v: NodeIndex) -> String {
        self.names
            .get(&v)
            .cloned()
            .unwrap_or_else(|| v.to_string())
    }
}

/// Extract the quotient at `requested_level` (`-1` = the fixed point) from
/// the condensed artifacts under `dir`.
pub fn extract_quotient(
    dir: &ExperimentDir,
    requested_level: i32,
) -> Result<QuotientOutcome, QuotientError> {
    let graph_stats: GraphStats = stats::read_json(&dir.graph_stats_file())?;
    let final_depth = graph_stats.final_depth;

    let level: Level = match requested_level {
        -1 => {
            if !graph_stats.fixed_point {
                return Err(QuotientError::NoFixedPoint);
            }
            final_depth
        }
        l if l < -1 => return Err(QuotientError::InvalidLevel(l)),
        l => {
            if l as i64 > final_depth as i64 {
                return Err(QuotientError::BeyondFinalDepth { requested: l, final_depth });
            }
            let l = l as Level;
            if l == final_depth && !graph_stats.fixed_point {
                return Err(QuotientError::LastLevelNotFixedPoint(l));
            }
            l
        }
    };

    let include_zero = dir.outcome_file(0).exists();
    let seed_level: Level = if include_zero { 0 } else { 1 };
    if level < seed_level {
        return Err(QuotientError::LevelZeroNotPersisted);
    }
    tracing::info!(level, final_depth, "extracting quotient");

    let names = EntityNames::load(dir)?;

    // ------------------------------------------------------------------
    // 1. Blocks alive at `level`, by replaying the refines mappings.
    // ------------------------------------------------------------------
    let mut living: HashMap<SummaryNode, LivingEntry> = HashMap::new();
    // Singleton membership lines, gathered as (signed id, vertex).
    let mut singleton_members: Vec<(i64, NodeIndex)> = Vec::new();

    let mut in_seed_block = vec![false; graph_stats.vertex_count as usize];
    let mut rd = wire::OutcomeReader::new(open_artifact(&dir.outcome_file(seed_level))?);
    while let Some(rec) = rd.next_record()? {
        living.insert(
            SummaryNode::Block(rec.block),
            LivingEntry { birth: seed_level, global: None },
        );
        for v in rec.members {
            in_seed_block[v as usize] = true;
        }
    }
    // Whoever the seed outcome does not claim was a singleton from the start.
    for v in 0..graph_stats.vertex_count {
        if !in_seed_block[v as usize] {
            let node = SummaryNode::Singleton(v);
            living.insert(node, LivingEntry { birth: seed_level, global: Some(node) });
            singleton_members.push((node.to_signed(), v));
        }
    }
    drop(in_seed_block);

    for transition in seed_level..level {
        let mut singletons_created = false;
        // Local ids can be vacated and reused within one transition; a parent
        // record must not evict a child that already claimed its id.
        let mut replaced: HashSet<u64> = HashSet::new();
        let mut rd = wire::MappingReader::new(open_artifact(&dir.mapping_file(transition))?);
        while let Some(rec) = rd.next_record()? {
            if !replaced.contains(&rec.parent) {
                living.remove(&SummaryNode::Block(rec.parent));
            }
            for &child in &rec.children {
                if child == 0 {
                    singletons_created = true;
                } else {
                    replaced.insert(child);
                    living.insert(
                        SummaryNode::Block(child),
                        LivingEntry { birth: transition + 1, global: None },
                    );
                }
            }
        }
        if singletons_created {
            let mut rd = wire::SingletonMappingReader::new(open_artifact(
                &dir.singleton_mapping_file(transition),
            )?);
            while let Some(rec) = rd.next_record()? {
                for v in rec.singletons {
                    let node = SummaryNode::Singleton(v);
                    living.insert(node, LivingEntry { birth: transition + 1, global: Some(node) });
                    singleton_members.push((node.to_signed(), v));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // 2. Global ids: living blocks match on birth level; blocks born at
    //    `level + 1` feed the backward mapping of edge subjects.
    // ------------------------------------------------------------------
    let mut next_blocks: HashMap<u64, SummaryNode> = HashMap::new();
    let mut rd = wire::LocalGlobalReader::new(open_artifact(&dir.local_global_file())?);
    while let Some(rec) = rd.next_record()? {
        if rec.local <= 0 {
            // Local 0 is the synthetic universal block; it is never alive at
            // an extractable level.
            continue;
        }
        let local = rec.local as u64;
        if rec.level == level + 1 {
            next_blocks.insert(local, SummaryNode::Block(rec.global as u64));
            continue;
        }
        if let Some(entry) = living.get_mut(&SummaryNode::Block(local)) {
            if entry.birth == rec.level {
                entry.global = Some(SummaryNode::Block(rec.global as u64));
            }
        }
    }

    let mut global_living: HashSet<SummaryNode> = HashSet::new();
    for (node, entry) in &living {
        match entry.global {
            Some(g) => {
                global_living.insert(g);
            }
            None => {
                if let SummaryNode::Block(local) = node {
                    return Err(QuotientError::UnresolvedGlobal {
                        local: *local,
                        birth: entry.birth,
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // 3. Memberships.
    // ------------------------------------------------------------------
    dir.ensure_quotient_dir()?;
    let mut contains = BufWriter::new(File::create(dir.quotient_contains_file(level))?);
    for &(signed, v) in &singleton_members {
        writeln!(contains, "{signed} {}", names.render(v))?;
    }
    for outcome_level in seed_level..=level {
        let mut rd = wire::OutcomeReader::new(open_artifact(&dir.outcome_file(outcome_level))?);
        while let Some(rec) = rd.next_record()? {
            let global = match living.get(&SummaryNode::Block(rec.block)) {
                Some(entry) if entry.birth == outcome_level => {
                    entry.global.expect("living blocks were resolved above")
                }
                _ => continue,
            };
            for v in rec.members {
                writeln!(contains, "{} {}", global.to_signed(), names.render(v))?;
            }
        }
    }
    contains.flush()?;

    // ------------------------------------------------------------------
    // 4. Edges.
    // ------------------------------------------------------------------
    // Backward refines edges (global child at level+1 → global parent at
    // level); empty at the fixed point, where every block is its own parent.
    let mut refines: HashMap<SummaryNode, SummaryNode> = HashMap::new();
    if level < final_depth {
        let mut singletons_created = false;
        let mut rd = wire::MappingReader::new(open_artifact(&dir.mapping_file(level))?);
        while let Some(rec) = rd.next_record()? {
            let parent = living
                .get(&SummaryNode::Block(rec.parent))
                .and_then(|e| e.global)
                .ok_or(QuotientError::UnknownRefinesBlock(rec.parent))?;
            for &child in &rec.children {
                if child == 0 {
                    singletons_created = true;
                    continue;
                }
                let child_global = *next_blocks
                    .get(&child)
                    .ok_or(QuotientError::UnknownRefinesBlock(child))?;
                refines.insert(child_global, parent);
            }
        }
        if singletons_created {
            let mut rd = wire::SingletonMappingReader::new(open_artifact(
                &dir.singleton_mapping_file(level),
            )?);
            while let Some(rec) = rd.next_record()? {
                let parent = living
                    .get(&SummaryNode::Block(rec.parent))
                    .and_then(|e| e.global)
                    .ok_or(QuotientError::UnknownRefinesBlock(rec.parent))?;
                for v in rec.singletons {
                    refines.insert(SummaryNode::Singleton(v), parent);
                }
            }
        }
    }

    let mut edges: BTreeSet<(i64, u32, i64)> = BTreeSet::new();
    let mut r = open_artifact(&dir.summary_graph_file())?;
    loop {
        let subject = match wire::read_signed_opt(&mut r)? {
            Some(s) => s,
            None => break,
        };
        let predicate = wire::read_predicate(&mut r)?;
        let object = wire::read_signed(&mut r)?;

        let subject_node = match SummaryNode::from_signed(subject) {
            Some(n) => n,
            None => continue,
        };
        let object_node = match SummaryNode::from_signed(object) {
            Some(n) => n,
            None => continue,
        };
        // Subjects born one level deeper cross the refines edge backward;
        // everything else must already be alive at the target level.
        if let Some(&parent) = refines.get(&subject_node) {
            if global_living.contains(&object_node) {
                edges.insert((parent.to_signed(), predicate, object));
            }
        } else if global_living.contains(&subject_node) && global_living.contains(&object_node) {
            edges.insert((subject, predicate, object));
        }
    }

    let mut edges_out = BufWriter::new(File::create(dir.quotient_edges_file(level))?);
    let mut types_out = BufWriter::new(File::create(dir.quotient_types_file(level))?);
    for &(s, p, o) in &edges {
        writeln!(edges_out, "{s} {o}")?;
        writeln!(types_out, "{p}")?;
    }
    edges_out.flush()?;
    types_out.flush()?;

    let outcome = QuotientOutcome {
        level,
        block_count: living.len() as u64,
        edge_count: edges.len() as u64,
    };
    tracing::info!(
        blocks = outcome.block_count,
        edges = outcome.edge_count,
        "quotient written"
    );
    Ok(outcome)
}

// ============================================================================
// Tests
// ============================================================================
