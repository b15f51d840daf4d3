//! CLI condenser: build the multi-level summary from a finished experiment.
//!
//! ```text
//! condenser EXPERIMENT_DIRECTORY
//! ```

use std::env;

use anyhow::{anyhow, Context};
use kbisim::condense::condense;
use kbisim::ExperimentDir;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let experiment = env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("usage: condenser <experiment_directory>"))?;

    let dir = ExperimentDir::new(&experiment);
    let summary = condense(&dir).with_context(|| format!("condensing {experiment}"))?;
    eprintln!(
        "condensed summary: {} vertices, {} edges",
        summary.vertex_count, summary.edge_count
    );
    Ok(())
}
