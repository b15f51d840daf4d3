//! Level driver: refine to a fixed point (or bound) and persist every level
//!
//! The driver owns the outer loop of the engine. It loads the graph, builds
//! the level-0 partition (universal block, or the `rdf:type` grouping), and
//! then refines level by level until the total cell count stops growing — the
//! fixed point — or an optional depth bound is hit.
//!
//! Each transition `k → k+1` persists three artifacts: the refines-edges file
//! (skipped for the trivial `0 → 1` transition, whose mapping is implied),
//! the level-`k+1` outcome holding the blocks that changed, and a per-level
//! statistics record. A typed start additionally writes the complete level-0
//! outcome, since level 0 is then a real partition rather than the universal
//! block.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use crate::graph::{Graph, GraphError};
use crate::layout::{level_tag, ExperimentDir};
use crate::partition::{LevelOutcome, RefineChild};
use crate::refine::{self, RefineError};
use crate::stats::{self, GraphStats, LevelStats, StatsError, StepTimer};
use crate::wire;
use crate::Level;

/// Errors surfaced by the driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Graph loading or indexing failed.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// Refinement failed (invariant violation).
    #[error(transparent)]
    Refine(#[from] RefineError),
    /// Statistics I/O failed.
    #[error(transparent)]
    Stats(#[from] StatsError),
    /// Artifact I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Options of one refinement run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Minimum block size for splitting; 1 is plain bisimulation.
    pub support: u64,
    /// Partition level 0 by `rdf:type` sets instead of the universal block.
    pub typed_start: bool,
    /// Stop after writing this level even without a fixed point.
    pub max_depth: Option<Level>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { support: 1, typed_start: false, max_depth: None }
    }
}

/// Write one level's outcome file: the blocks that came into existence at
/// this level, i.e. the non-singleton children of its refines edges.
fn write_outcome(path: &Path, outcome: &LevelOutcome) -> Result<(), DriverError> {
    let mut w = BufWriter::new(File::create(path)?);
    for (_, children) in outcome.refines.iter() {
        for child in children {
            if let RefineChild::Block(slot) = child {
                wire::write_outcome_record(&mut w, slot + 1, &outcome.blocks[*slot as usize])?;
            }
        }
    }
    w.flush()?;
    Ok(())
}

/// Write the complete level-0 outcome of a typed start (every live block).
fn write_full_outcome(path: &Path, outcome: &LevelOutcome) -> Result<(), DriverError> {
    let mut w = BufWriter::new(File::create(path)?);
    for (slot, members) in outcome.blocks.iter().enumerate() {
        if !members.is_empty() {
            wire::write_outcome_record(&mut w, slot as u64 + 1, members)?;
        }
    }
    w.flush()?;
    Ok(())
}

/// Run the stratified refinement and persist every level under `dir`.
///
/// Returns the whole-run statistics that were also written to
/// `ad_hoc_results/graph_stats.json`.
pub fn run_bisimulation(
    input: &Path,
    dir: &ExperimentDir,
    cfg: &RunConfig,
) -> Result<GraphStats, DriverError> {
    let mut timer = StepTimer::new();

    timer.begin("read graph")?;
    let mut reader = BufReader::new(File::open(input)?);
    let (mut graph, edge_count) = Graph::read_from(&mut reader)?;
    graph.compute_reverse_index()?;
    let read_step = timer.end()?;
    tracing::info!(
        ms = read_step.elapsed_ms(),
        memory_kb = read_step.memory_kb,
        "graph and reverse index ready"
    );

    let run_start = Instant::now();

    timer.begin("0000-bisimulation")?;
    let mut current = if cfg.typed_start {
        refine::typed_partition(&graph)
    } else {
        refine::trivial_partition(&graph)?
    };
    timer.end()?;

    let mut previous_total: u64 = 0;
    // Running count of blocks ever created; the universal block is block one.
    let mut pre_accumulated: u64 = 1;

    if cfg.typed_start {
        let step = timer.last().expect("level-0 step just finished");
        pre_accumulated = current.non_singleton_block_count();
        stats::write_json(
            &dir.level_stats_file(0),
            &LevelStats {
                block_count: current.total_cells(),
                singleton_count: current.singleton_count(),
                accumulated_block_count: pre_accumulated + current.singleton_count(),
                time_ms: step.elapsed_ms(),
                memory_kb: step.memory_kb,
            },
        )?;
        write_full_outcome(&dir.outcome_file(0), &current)?;
        previous_total = current.total_cells();
    }

    let final_depth: Level;
    let fixed_point: bool;
    let mut i: Level = 0;
    loop {
        timer.begin(&format!("{}-bisimulation", level_tag(i + 1)))?;
        let next = refine::refine_step(&graph, &current, cfg.support)?;
        let step = timer.end()?;
        let (step_ms, step_kb) = (step.elapsed_ms(), step.memory_kb);

        // The trivial 0 → 1 mapping is implied (one universal parent), so its
        // file is skipped and its children never join the accumulated count.
        let mut new_block_count = 0;
        if cfg.typed_start || i > 0 {
            let mut w = BufWriter::new(File::create(dir.mapping_file(i))?);
            next.refines.write_to(&mut w)?;
            w.flush()?;
            new_block_count = next.refines.new_block_count();
        }
        pre_accumulated += new_block_count;
        let accumulated = pre_accumulated + next.singleton_count();

        stats::write_json(
            &dir.level_stats_file(i + 1),
            &LevelStats {
                block_count: next.total_cells(),
                singleton_count: next.singleton_count(),
                accumulated_block_count: accumulated,
                time_ms: step_ms,
                memory_kb: step_kb,
            },
        )?;
        write_outcome(&dir.outcome_file(i + 1), &next)?;

        let total = next.total_cells();
        tracing::info!(
            level = i + 1,
            blocks = total,
            accumulated_blocks = accumulated,
            singletons = next.singleton_count(),
            ms = step_ms,
            memory_kb = step_kb,
            "level complete"
        );
        current = next;

        if total == previous_total {
            final_depth = i;
            fixed_point = true;
            break;
        }
        previous_total = total;
        if let Some(bound) = cfg.max_depth {
            if i + 1 >= bound {
                final_depth = i + 1;
                fixed_point = false;
                break;
            }
        }
        i += 1;
    }
    drop(current);

    let total_time_ms = run_start.elapsed().as_millis() as u64;
    let max_memory_kb = timer.max_memory_kb();
    tracing::info!(ms = total_time_ms, max_memory_kb, final_depth, fixed_point, "run finished");

    let graph_stats = GraphStats {
        vertex_count: graph.size(),
        edge_count,
        total_time_ms,
        max_memory_kb,
        final_depth,
        fixed_point,
    };
    stats::write_json(&dir.graph_stats_file(), &graph_stats)?;
    Ok(graph_stats)
}
