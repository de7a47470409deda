// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! Extraction of the upwind dependency graph of a converged solution.

use tracing::debug;

use crate::error::Result;
use crate::grid::{BlockGrid, Int};
use crate::kernel::{Iterate, Kernel};
use crate::metric::MetricField;
use crate::solver::{FrontPropagationSolver, SolveStats};

/// Per-node upwind neighbors and weights, block layout, node-major.
///
/// `weights` are normalized: they sum to 1 at updated nodes and to 0 at
/// seeds, walls, padding and unreached nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowGraph {
    /// Out-degree per node.
    pub nact: usize,
    /// Grid rank.
    pub ndim: usize,
    /// `nact` weights per node.
    pub weights: Vec<f64>,
    /// `nact` neighbor indices per node, `INVALID_INDEX` where the weight is 0.
    pub indices: Vec<Int>,
    /// `nact * ndim` offsets per node, pointing at the upwind neighbor.
    pub offsets: Vec<i32>,
    /// Weight sum per node.
    pub weightsum: Vec<f64>,
    /// Weighted mean offset per node, `ndim` components.
    pub vector: Vec<f64>,
    /// `∂u/∂r` per node, with `r = cost * h`.
    pub rhs_derivative: Vec<f64>,
    /// Whether the node holds a finite value.
    pub reached: Vec<bool>,
}

impl FlowGraph {
    /// Row-major `(dims.., ndim)` geodesic flow, `-vector * h`.
    pub fn geodesic_flow(&self, grid: &BlockGrid, h: f64) -> Vec<f64> {
        let ndim = self.ndim;
        let mut out = Vec::with_capacity(grid.num_nodes() * ndim);
        for flat in 0..grid.num_nodes() {
            let n_t = grid.flat_to_block(flat);
            out.extend(self.vector[n_t * ndim..(n_t + 1) * ndim].iter().map(|v| -v * h));
        }
        out
    }

    /// Rewrite flow vectors of a Rander model through the dual gradient map,
    /// `dual.gradient(m * v + w)`. Vanishing flows map to zero.
    pub fn correct_rander(&mut self, grid: &BlockGrid, metrics: &MetricField) -> Result<()> {
        let ndim = self.ndim;
        let mut corrected = 0usize;
        for flat in 0..grid.num_nodes() {
            let n_t = grid.flat_to_block(flat);
            let v = &mut self.vector[n_t * ndim..(n_t + 1) * ndim];
            let cost = metrics.cost_at(flat);
            if self.weightsum[n_t] == 0.0 || !cost.is_finite() || cost <= 0.0 {
                v.fill(0.0);
                continue;
            }
            let metric = metrics.metric_at(flat)?;
            let Some((m, w)) = metric.rander_parts() else {
                continue;
            };
            let eucl: Vec<f64> = (0..ndim)
                .map(|i| (0..ndim).map(|j| m[(i, j)] * v[j]).sum::<f64>() + w[i])
                .collect();
            let g = metric.dual()?.gradient(&eucl);
            for (vi, gi) in v.iter_mut().zip(g) {
                *vi = if gi.is_nan() { 0.0 } else { gi };
            }
            corrected += 1;
        }
        debug!(corrected, "rander flow correction");
        Ok(())
    }
}

/// Extract the flow graph of a converged eikonal iterate.
///
/// Runs one launch of `kernel` over every block with a tolerance that accepts
/// the current values as converged.
pub fn extract_flow(
    solver: &FrontPropagationSolver,
    kernel: &dyn Kernel,
    iterate: &Iterate,
) -> Result<(FlowGraph, SolveStats)> {
    let grid = kernel.grid();
    let ndim = grid.ndim();
    let size_i = grid.size_i();
    let size_tot = grid.size_tot();
    let (outputs, stats) = solver.extract(kernel, iterate)?;

    let nact = outputs
        .iter()
        .find_map(|o| o.flow.as_ref().map(|f| f.weights.len() / size_i))
        .unwrap_or(0);
    let mut graph = FlowGraph {
        nact,
        ndim,
        weights: vec![0.0; size_tot * nact],
        indices: vec![crate::grid::INVALID_INDEX; size_tot * nact],
        offsets: vec![0; size_tot * nact * ndim],
        weightsum: vec![0.0; size_tot],
        vector: vec![0.0; size_tot * ndim],
        rhs_derivative: vec![0.0; size_tot],
        reached: iterate.values.iter().map(|v| v.is_finite()).collect(),
    };
    for out in outputs {
        let Some(flow) = out.flow else {
            continue;
        };
        let base = out.block * size_i;
        graph.weights[base * nact..(base + size_i) * nact].copy_from_slice(&flow.weights);
        graph.indices[base * nact..(base + size_i) * nact].copy_from_slice(&flow.indices);
        graph.offsets[base * nact * ndim..(base + size_i) * nact * ndim]
            .copy_from_slice(&flow.offsets);
        graph.weightsum[base..base + size_i].copy_from_slice(&flow.weightsum);
        graph.vector[base * ndim..(base + size_i) * ndim].copy_from_slice(&flow.vector);
        graph.rhs_derivative[base..base + size_i].copy_from_slice(&flow.rhs_derivative);
    }
    Ok((graph, stats))
}
