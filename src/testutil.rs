//! Shared helpers for the crate's tests: scratch experiment directories and
//! hand-written binary triple files.

use std::path::Path;

use crate::driver::{run_bisimulation, RunConfig};
use crate::layout::ExperimentDir;
use crate::stats::GraphStats;
use crate::wire;

/// Write `records` as a binary triples file at `path`.
pub(crate) fn write_triples(path: &Path, records: &[(u64, u32, u64)]) {
    let mut buf = Vec::new();
    for &(s, p, o) in records {
        wire::write_entity(&mut buf, s).unwrap();
        wire::write_predicate(&mut buf, p).unwrap();
        wire::write_entity(&mut buf, o).unwrap();
    }
    std::fs::write(path, buf).unwrap();
}

/// Run the driver over `records` inside a fresh scratch directory.
pub(crate) fn run_in_tempdir(
    records: &[(u64, u32, u64)],
    cfg: &RunConfig,
) -> (tempfile::TempDir, ExperimentDir, GraphStats) {
    let tmp = tempfile::tempdir().unwrap();
    let dir = ExperimentDir::new(tmp.path());
    dir.ensure_layout().unwrap();
    let input = dir.triples_file();
    write_triples(&input, records);
    let stats = run_bisimulation(&input, &dir, cfg).unwrap();
    (tmp, dir, stats)
}
