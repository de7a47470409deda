// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ndarray::{Array2, ArrayD};
use tracing_subscriber::EnvFilter;

use eikonal_hfm::input::{HfmInput, InputValue};
use eikonal_hfm::interface::run_cpu;
use eikonal_hfm::io;

#[derive(Parser)]
#[command(name = "eikonal-hfm", about = "Anisotropic eikonal solver with block-iterative updates")]
struct Cli {
    /// Model family, e.g. Isotropic2, Diagonal3, Riemann2 or Rander2
    #[arg(short = 'm', long)]
    model: String,

    /// Grid size, comma-separated (e.g., 256,256 or 64,64,64)
    #[arg(short = 'd', long)]
    dims: String,

    /// Seed coordinates, comma-separated (repeatable for multiple seeds)
    #[arg(long, num_args = 1)]
    seed: Vec<String>,

    /// Grid spacing
    #[arg(long, default_value = "1.0")]
    grid_scale: f64,

    /// Cost field (.npy, same shape as the grid)
    #[arg(long)]
    cost_file: Option<PathBuf>,

    /// Constant metric parameters, comma-separated
    #[arg(long)]
    metric: Option<String>,

    /// Block scheduling: AGSI or global_iteration
    #[arg(long, default_value = "AGSI")]
    solver: String,

    /// Seed spreading radius in pixels
    #[arg(long, default_value = "0.0")]
    seed_radius: f64,

    /// Output file path for the values (.npy)
    #[arg(short = 'o', long, default_value = "values.npy")]
    output: PathBuf,

    /// Also write the geodesic flow to this .npy file
    #[arg(long)]
    export_flow: Option<PathBuf>,

    /// Number of Rayon worker threads
    #[arg(long)]
    threads: Option<usize>,

    /// Verbosity of the run (0 silent, 1 stages, 2 details)
    #[arg(short = 'v', long, default_value = "1")]
    verbosity: f64,
}

fn parse_list<T: std::str::FromStr>(s: &str, what: &str) -> Result<Vec<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    s.split(',')
        .map(|p| p.trim().parse::<T>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("invalid --{}: expected comma-separated numbers", what))
}

fn build_input(cli: &Cli) -> Result<HfmInput> {
    let dims: Vec<usize> = parse_list(&cli.dims, "dims")?;
    let ndim = dims.len();
    if cli.seed.is_empty() {
        bail!("at least one --seed must be specified");
    }
    let mut seeds = Vec::with_capacity(cli.seed.len() * ndim);
    for s in &cli.seed {
        let coords: Vec<f64> = parse_list(s, "seed")?;
        if coords.len() != ndim {
            bail!("--seed has {} components but --dims has {}", coords.len(), ndim);
        }
        seeds.extend(coords);
    }
    let seeds = Array2::from_shape_vec((cli.seed.len(), ndim), seeds)?.into_dyn();

    let mut input = HfmInput::new();
    input.insert("model".into(), cli.model.as_str().into());
    input.insert(
        "dims".into(),
        dims.iter().map(|&d| d as f64).collect::<Vec<_>>().into(),
    );
    input.insert("seeds".into(), InputValue::Array(seeds));
    input.insert("gridScale".into(), cli.grid_scale.into());
    input.insert("solver".into(), cli.solver.as_str().into());
    input.insert("seedRadius".into(), cli.seed_radius.into());
    input.insert("verbosity".into(), cli.verbosity.into());
    if let Some(path) = &cli.cost_file {
        let cost: ArrayD<f64> = io::load_npy(path, Some(&dims))
            .with_context(|| format!("loading cost from {}", path.display()))?;
        input.insert("cost".into(), InputValue::Array(cost));
    }
    if let Some(metric) = &cli.metric {
        input.insert("metric".into(), parse_list::<f64>(metric, "metric")?.into());
    }
    if cli.export_flow.is_some() {
        input.insert("exportGeodesicFlow".into(), true.into());
    }
    Ok(input)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Some(threads) = cli.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("configuring the worker threads")?;
    }

    let input = build_input(&cli)?;
    let report = run_cpu(&input)?;

    let Some(values) = report.value_field() else {
        bail!("the run did not export values");
    };
    io::save_npy(&cli.output, values)?;
    if let (Some(path), Some(flow)) = (&cli.export_flow, &report.flow) {
        io::save_npy(path, flow)?;
    }

    for stats in &report.kernel_stats {
        println!(
            "{}: {} iterations, {} block updates, {:.3}s{}",
            stats.kernel,
            stats.niter_o,
            stats.block_updates,
            stats.time.as_secs_f64(),
            if stats.converged { "" } else { " (not converged)" }
        );
    }
    Ok(())
}
