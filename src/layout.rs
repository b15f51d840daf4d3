//! Experiment-directory layout
//!
//! All pipeline stages exchange files through one experiment directory:
//!
//! ```text
//! <root>/
//!   binary_encoding.bin                     input triples (preprocessor)
//!   entity2ID.txt                           optional id→name map (preprocessor)
//!   bisimulation/
//!     outcome_condensed-KKKK.bin
//!     mapping-KKKKtoLLLL.bin
//!     singleton_mapping-KKKKtoLLLL.bin
//!     condensed_multi_summary_graph.bin
//!     condensed_multi_summary_intervals.bin
//!     condensed_multi_summary_local_global_map.bin
//!   ad_hoc_results/
//!     graph_stats.json
//!     statistics_condensed-KKKK.json
//!     data_edges_statistics_condensed-XXXXtoYYYY.json
//!     summary_graph_stats.json
//!   quotient_graphs/
//!     quotient_graph_{contains,edges,types}-KKKK.txt
//! ```
//!
//! Level numbers in file names are zero-padded to four digits.

use std::path::{Path, PathBuf};

use crate::Level;

/// Zero-padded level tag as it appears in file names.
pub fn level_tag(level: Level) -> String {
    format!("{level:04}")
}

/// Path helper for one experiment directory.
#[derive(Debug, Clone)]
pub struct ExperimentDir {
    root: PathBuf,
}

impl ExperimentDir {
    /// Wrap an experiment root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The experiment root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the `bisimulation/` and `ad_hoc_results/` subdirectories.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.bisimulation_dir())?;
        std::fs::create_dir_all(self.ad_hoc_dir())
    }

    /// Create the `quotient_graphs/` subdirectory.
    pub fn ensure_quotient_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.quotient_dir())
    }

    /// `bisimulation/` subdirectory.
    pub fn bisimulation_dir(&self) -> PathBuf {
        self.root.join("bisimulation")
    }

    /// `ad_hoc_results/` subdirectory.
    pub fn ad_hoc_dir(&self) -> PathBuf {
        self.root.join("ad_hoc_results")
    }

    /// `quotient_graphs/` subdirectory.
    pub fn quotient_dir(&self) -> PathBuf {
        self.root.join("quotient_graphs")
    }

    /// Binary triples input written by the preprocessor.
    pub fn triples_file(&self) -> PathBuf {
        self.root.join("binary_encoding.bin")
    }

    /// Optional entity-name map written by the preprocessor.
    pub fn entity_map_file(&self) -> PathBuf {
        self.root.join("entity2ID.txt")
    }

    /// Per-level outcome file.
    pub fn outcome_file(&self, level: Level) -> PathBuf {
        self.bisimulation_dir()
            .join(format!("outcome_condensed-{}.bin", level_tag(level)))
    }

    /// Refines-mapping file for the `from → from+1` transition.
    pub fn mapping_file(&self, from: Level) -> PathBuf {
        self.bisimulation_dir().join(format!(
            "mapping-{}to{}.bin",
            level_tag(from),
            level_tag(from + 1)
        ))
    }

    /// Singleton-mapping file for the `from → from+1` transition.
    pub fn singleton_mapping_file(&self, from: Level) -> PathBuf {
        self.bisimulation_dir().join(format!(
            "singleton_mapping-{}to{}.bin",
            level_tag(from),
            level_tag(from + 1)
        ))
    }

    /// Condensed multi-level summary graph.
    pub fn summary_graph_file(&self) -> PathBuf {
        self.bisimulation_dir()
            .join("condensed_multi_summary_graph.bin")
    }

    /// Life intervals of the condensed summary nodes.
    pub fn intervals_file(&self) -> PathBuf {
        self.bisimulation_dir()
            .join("condensed_multi_summary_intervals.bin")
    }

    /// Local-to-global id map of the condensed summary.
    pub fn local_global_file(&self) -> PathBuf {
        self.bisimulation_dir()
            .join("condensed_multi_summary_local_global_map.bin")
    }

    /// Whole-run statistics record.
    pub fn graph_stats_file(&self) -> PathBuf {
        self.ad_hoc_dir().join("graph_stats.json")
    }

    /// Per-level statistics record.
    pub fn level_stats_file(&self, level: Level) -> PathBuf {
        self.ad_hoc_dir()
            .join(format!("statistics_condensed-{}.json", level_tag(level)))
    }

    /// Condenser per-phase statistics record for `from → to` data edges.
    pub fn data_edges_stats_file(&self, from: Level, to: Level) -> PathBuf {
        self.ad_hoc_dir().join(format!(
            "data_edges_statistics_condensed-{}to{}.json",
            level_tag(from),
            level_tag(to)
        ))
    }

    /// Condenser summary statistics record.
    pub fn summary_stats_file(&self) -> PathBuf {
        self.ad_hoc_dir().join("summary_graph_stats.json")
    }

    /// Quotient membership listing for `level`.
    pub fn quotient_contains_file(&self, level: Level) -> PathBuf {
        self.quotient_dir()
            .join(format!("quotient_graph_contains-{}.txt", level_tag(level)))
    }

    /// Quotient edge listing for `level`.
    pub fn quotient_edges_file(&self, level: Level) -> PathBuf {
        self.quotient_dir()
            .join(format!("quotient_graph_edges-{}.txt", level_tag(level)))
    }

    /// Quotient edge-type listing for `level` (line-aligned with the edges).
    pub fn quotient_types_file(&self, level: Level) -> PathBuf {
        self.quotient_dir()
            .join(format!("quotient_graph_types-{}.txt", level_tag(level)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_zero_padded() {
        let dir = ExperimentDir::new("/tmp/exp");
        assert!(dir
            .outcome_file(0)
            .ends_with("bisimulation/outcome_condensed-0000.bin"));
        assert!(dir
            .mapping_file(3)
            .ends_with("bisimulation/mapping-0003to0004.bin"));
        assert!(dir
            .singleton_mapping_file(12)
            .ends_with("bisimulation/singleton_mapping-0012to0013.bin"));
        assert!(dir
            .level_stats_file(1)
            .ends_with("ad_hoc_results/statistics_condensed-0001.json"));
        assert!(dir
            .data_edges_stats_file(2, 1)
            .ends_with("ad_hoc_results/data_edges_statistics_condensed-0002to0001.json"));
        assert!(dir
            .quotient_contains_file(7)
            .ends_with("quotient_graphs/quotient_graph_contains-0007.txt"));
    }
}
