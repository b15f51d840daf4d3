//! Crate root: public surface, core aliases, and pipeline-wide invariants
//!
//! This crate computes a **k-bounded stratified bisimulation partition** of a
//! directed edge-labeled graph and assembles, level by level, a condensed
//! multi-level summary graph in which every quotient node carries the interval
//! of refinement depths over which it persists.
//!
//! ## Invariants (pipeline-wide)
//!
//! - **Signed block-or-singleton union.** A vertex either belongs to an
//!   ordinary block (positive id on the wire) or is a *singleton* tagged with
//!   its own vertex id (encoded as `−(v+1)` on the wire). In memory the union
//!   is the tagged variant [`BlockOrSingleton`]; the signed form exists only
//!   inside [`wire`]. Once a vertex becomes a singleton it stays one at every
//!   deeper level.
//!
//! - **Set-valued signatures.** The refiner splits on the **set** of
//!   `(label, target block)` pairs over a vertex's outgoing edges. Parallel
//!   edges with the same label and target block collapse; this is the
//!   semantics of forward bisimulation over the relation, not the
//!   multirelation.
//!
//! - **Free-slot reuse.** Block slots vacated by dissolved blocks are recycled
//!   (LIFO) before the block table grows, keeping local block ids dense and
//!   the `0`-is-singleton sentinel available in child lists.
//!
//! - **Fatal errors only.** Nothing in the pipeline is retried. File-format
//!   problems, I/O failures, and invariant violations all abort the run with a
//!   precise error; partial outputs of a failed run are undefined.
//!
//! The stratified engine runs single-threaded; level `k+1` is built from a
//! cloned vertex-to-block map while level `k` stays readable for target
//! lookups.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Experiment-directory layout (artifact paths, level tags).
pub mod layout;
/// Fixed-width little-endian primitives and binary record codecs.
pub mod wire;
/// In-memory graph and its deduplicated reverse index.
pub mod graph;
/// Blocks, the vertex-to-block map, dirty tracking, refines edges.
pub mod partition;
/// Signature-based partition refinement and the two level-0 constructors.
pub mod refine;
/// Step timing, resident-memory sampling, and on-disk statistics records.
pub mod stats;
/// Level driver: refine to a fixed point (or bound) and persist each level.
pub mod driver;
/// Condenser: assemble the multi-level summary graph from persisted levels.
pub mod condense;
/// Quotient extractor: project one level back out of the condensed artifacts.
pub mod quotient;

#[cfg(test)]
pub(crate) mod testutil;

// ============================================================================
// Canonical aliases and root-level re-exports
// ============================================================================

/// Dense vertex id, assigned by the external preprocessor.
pub type NodeIndex = u64;

/// Dense predicate (edge label) id. Label `0` is `rdf:type` by convention.
pub type EdgeLabel = u32;

/// Position of a block in the per-level block table (0-based in memory;
/// written as `id + 1` so that `0` stays the singleton sentinel on the wire).
pub type BlockIndex = u64;

/// Refinement depth. Level 0 is the initial partition.
pub type Level = u16;

pub use crate::driver::{run_bisimulation, RunConfig};
pub use crate::graph::Graph;
pub use crate::layout::ExperimentDir;
pub use crate::partition::BlockOrSingleton;
pub use crate::stats::GraphStats;
