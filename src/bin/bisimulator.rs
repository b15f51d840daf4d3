//! CLI driver for the stratified refinement engine.
//!
//! ```text
//! bisimulator run_k_bisimulation_store_partition_condensed_timed INPUT \
//!     --output DIR [--support N] [--typed_start] [--max_depth K] \
//!     [--strings map_to_one_node]
//! ```

use std::env;
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use kbisim::{run_bisimulation, ExperimentDir, RunConfig};
use tracing_subscriber::EnvFilter;

const RUN_COMMAND: &str = "run_k_bisimulation_store_partition_condensed_timed";

/// Flags that consume the following token as their value.
const VALUE_FLAGS: &[&str] = &["--support", "--output", "-o", "--strings", "--max_depth"];

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn has_flag(args: &[String], key: &str) -> bool {
    args.iter().any(|a| a == key)
}

fn positionals(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if VALUE_FLAGS.contains(&a.as_str()) {
            it.next();
        } else if !a.starts_with('-') {
            out.push(a.clone());
        }
    }
    out
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let pos = positionals(&args);
    let command = pos
        .first()
        .ok_or_else(|| anyhow!("usage: bisimulator <command> <input_file> [options]"))?;
    if command != RUN_COMMAND {
        bail!("unrecognised command `{command}` (expected `{RUN_COMMAND}`)");
    }
    let input = pos
        .get(1)
        .ok_or_else(|| anyhow!("missing input file argument"))?;

    // The preprocessor currently collapses every string literal onto one
    // node; no other strategy is implemented.
    let strings = parse_flag(&args, "--strings").unwrap_or_else(|| "map_to_one_node".into());
    if strings != "map_to_one_node" {
        bail!("unsupported --strings strategy `{strings}` (only map_to_one_node)");
    }

    let support: u64 = match parse_flag(&args, "--support") {
        Some(s) => s
            .parse()
            .map_err(|_| anyhow!("--support must be a positive integer (got `{s}`)"))?,
        None => 1,
    };
    if support == 0 {
        bail!("--support must be at least 1");
    }
    let max_depth = match parse_flag(&args, "--max_depth") {
        Some(s) => Some(
            s.parse::<u16>()
                .map_err(|_| anyhow!("--max_depth must be a level number (got `{s}`)"))?,
        ),
        None => None,
    };
    let output = parse_flag(&args, "--output")
        .or_else(|| parse_flag(&args, "-o"))
        .ok_or_else(|| anyhow!("missing --output/-o directory"))?;

    let dir = ExperimentDir::new(&output);
    dir.ensure_layout()
        .with_context(|| format!("creating output layout under {output}"))?;

    let cfg = RunConfig {
        support,
        typed_start: has_flag(&args, "--typed_start"),
        max_depth,
    };
    let stats = run_bisimulation(Path::new(input), &dir, &cfg)
        .with_context(|| format!("refining {input}"))?;

    eprintln!(
        "done: {} vertices, {} edges, final depth {}, fixed point: {}",
        stats.vertex_count, stats.edge_count, stats.final_depth, stats.fixed_point
    );
    Ok(())
}
