//! CLI quotient extractor: project one level out of the condensed summary.
//!
//! ```text
//! quotient_extractor EXPERIMENT_DIRECTORY LEVEL    # -1 = the fixed point
//! ```

use std::env;

use anyhow::{anyhow, Context};
use kbisim::quotient::extract_quotient;
use kbisim::ExperimentDir;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = env::args().skip(1);
    let experiment = args
        .next()
        .ok_or_else(|| anyhow!("usage: quotient_extractor <experiment_directory> <level>"))?;
    let level: i32 = args
        .next()
        .ok_or_else(|| anyhow!("missing level argument (-1 means the fixed point)"))?
        .parse()
        .context("level must be an integer")?;

    let dir = ExperimentDir::new(&experiment);
    let outcome =
        extract_quotient(&dir, level).with_context(|| format!("extracting level {level}"))?;
    eprintln!(
        "quotient at level {}: {} blocks, {} edges",
        outcome.level, outcome.block_count, outcome.edge_count
    );
    Ok(())
}
