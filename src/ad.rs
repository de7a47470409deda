// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! Forward and reverse differentiation of the converged value field.
//!
//! Linearizing the scheme around its solution gives, at every updated node,
//! `weightsum * du - Σ w_k du(j_k) = ∂u/∂r * dr`, with `dr = h * dcost`.
//! Boundary nodes (zero weight sum) carry their own tangent. Both the tangent
//! system and its transpose are relaxed with the linear block kernel.

use tracing::debug;

use crate::error::{EikonalError, Result};
use crate::flow::FlowGraph;
use crate::graph::graph_reverse;
use crate::grid::{BlockGrid, INVALID_INDEX};
use crate::kernel::{
    Iterate, KernelArgs, KernelBinding, KernelKind, KernelTraits, LinearArgs, Tolerance,
};
use crate::solver::{FrontPropagationSolver, SolveStats};

/// Default relative tolerance of the linear solves, in units of the floating
/// resolution.
pub const LINEAR_RTOL_FACTOR: f64 = 5.0;

/// A value with an optional first-order variation.
#[derive(Debug, Clone, PartialEq)]
pub enum Ad<T> {
    /// No variation.
    Plain(T),
    /// Value and tangent.
    WithTangent(T, T),
}

impl<T> Ad<T> {
    /// The value.
    pub fn value(&self) -> &T {
        match self {
            Ad::Plain(v) | Ad::WithTangent(v, _) => v,
        }
    }

    /// The tangent, if any.
    pub fn tangent(&self) -> Option<&T> {
        match self {
            Ad::Plain(_) => None,
            Ad::WithTangent(_, t) => Some(t),
        }
    }

    /// Whether a tangent is attached.
    pub fn has_tangent(&self) -> bool {
        matches!(self, Ad::WithTangent(..))
    }

    /// Attach a tangent, replacing any previous one.
    pub fn with_tangent(self, tangent: T) -> Self {
        match self {
            Ad::Plain(v) | Ad::WithTangent(v, _) => Ad::WithTangent(v, tangent),
        }
    }

    /// Split into value and tangent.
    pub fn into_parts(self) -> (T, Option<T>) {
        match self {
            Ad::Plain(v) => (v, None),
            Ad::WithTangent(v, t) => (v, Some(t)),
        }
    }
}

/// Tolerances of the linear solves. A missing absolute tolerance is derived
/// from the right-hand side of each solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearTolerance {
    /// Relative tolerance.
    pub rtol: f64,
    /// Absolute tolerance, or `None` for `rtol * mean(|finite rhs|)`.
    pub atol: Option<f64>,
}

impl LinearTolerance {
    /// Node change test of a solve with right-hand side `rhs`.
    pub fn resolve(&self, rhs: &[f64]) -> Tolerance {
        let atol = self
            .atol
            .unwrap_or_else(|| self.rtol * mean_finite_abs(rhs));
        Tolerance {
            atol,
            rtol: self.rtol,
        }
    }
}

/// Mean of `|x|` over the finite entries, 0 if there are none.
pub fn mean_finite_abs(xs: &[f64]) -> f64 {
    let (sum, count) = xs
        .iter()
        .filter(|x| x.is_finite())
        .fold((0.0, 0usize), |(s, c), x| (s + x.abs(), c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Builds and solves the tangent and adjoint systems of a flow graph.
pub struct DifferentiationEngine<'a> {
    binding: &'a dyn KernelBinding,
    solver: &'a FrontPropagationSolver,
    grid: &'a BlockGrid,
    flow: &'a FlowGraph,
    template: &'a KernelTraits,
    h: f64,
    tol: LinearTolerance,
    seed_cost: Vec<(usize, usize, f64)>,
}

impl<'a> DifferentiationEngine<'a> {
    /// Engine for `flow` on `grid`. Linear kernels inherit block shape,
    /// sweeps, precision and reach from `template`.
    pub fn new(
        binding: &'a dyn KernelBinding,
        solver: &'a FrontPropagationSolver,
        grid: &'a BlockGrid,
        flow: &'a FlowGraph,
        template: &'a KernelTraits,
        h: f64,
        tol: LinearTolerance,
    ) -> Self {
        DifferentiationEngine {
            binding,
            solver,
            grid,
            flow,
            template,
            h,
            tol,
            seed_cost: Vec::new(),
        }
    }

    /// Dependence of the seed values on the cost (builder method):
    /// `(seeded node, cost node, ∂rhs/∂cost)` triples, block layout.
    pub fn with_seed_cost_jacobian(mut self, entries: Vec<(usize, usize, f64)>) -> Self {
        self.seed_cost = entries;
        self
    }

    /// Diagonal of the linear system, the weight sum clamped to 1 at boundary nodes.
    fn diag(&self) -> Vec<f64> {
        self.flow
            .weightsum
            .iter()
            .map(|&w| if w == 0.0 { 1.0 } else { w })
            .collect()
    }

    fn check_len(&self, field: &[f64]) -> Result<()> {
        if field.len() != self.grid.size_tot() {
            return Err(EikonalError::ShapeMismatch {
                expected: self.grid.shape().to_vec(),
                got: vec![field.len()],
            });
        }
        Ok(())
    }

    /// Forward right-hand side of one direction, block layout.
    ///
    /// Boundary nodes take the seed tangent (0 when absent) plus the cost
    /// variation of spread seed values, updated nodes `∂u/∂r * h * dcost`,
    /// padding NaN.
    pub fn forward_rhs(&self, seed_tangent: Option<&[f64]>, cost_tangent: Option<&[f64]>) -> Result<Vec<f64>> {
        for field in seed_tangent.iter().chain(cost_tangent.iter()) {
            self.check_len(field)?;
        }
        let mut rhs: Vec<f64> = (0..self.grid.size_tot())
            .map(|n| {
                if !self.grid.in_domain(n) {
                    f64::NAN
                } else if self.flow.weightsum[n] == 0.0 {
                    seed_tangent.map_or(0.0, |t| t[n])
                } else {
                    cost_tangent.map_or(0.0, |c| self.flow.rhs_derivative[n] * self.h * c[n])
                }
            })
            .collect();
        if let Some(c) = cost_tangent {
            for &(n, m, d) in &self.seed_cost {
                if self.flow.weightsum[n] == 0.0 {
                    rhs[n] += d * c[m];
                }
            }
        }
        Ok(rhs)
    }

    /// Solve the tangent system for each direction.
    ///
    /// `seed_tangents` and `cost_tangents` hold one block-layout field per
    /// direction; either may be empty. Returns one tangent field per direction.
    pub fn forward(
        &self,
        seed_tangents: &[Vec<f64>],
        cost_tangents: &[Vec<f64>],
    ) -> Result<(Vec<Vec<f64>>, Vec<SolveStats>)> {
        let k = seed_tangents.len().max(cost_tangents.len());
        let mut tangents = Vec::with_capacity(k);
        let mut stats = Vec::with_capacity(k);
        for dir in 0..k {
            let rhs = self.forward_rhs(
                seed_tangents.get(dir).map(Vec::as_slice),
                cost_tangents.get(dir).map(Vec::as_slice),
            )?;
            let args = LinearArgs {
                grid: self.grid.clone(),
                rhs,
                diag: self.diag(),
                indices: self.flow.indices.clone(),
                weights: self.flow.weights.clone(),
                nact: self.flow.nact,
                domain: self.grid.pack_bits(&self.flow.reached),
            };
            let (x, s) = self.solve_linear("forwardAD", args)?;
            tangents.push(x);
            stats.push(s);
        }
        Ok((tangents, stats))
    }

    /// Solve the adjoint system for each sensitivity field (block layout).
    ///
    /// The flow graph is transposed once; its out-degree is the largest
    /// in-degree of the flow graph.
    pub fn reverse(&self, sensitivities: &[Vec<f64>]) -> Result<(Vec<Vec<f64>>, Vec<SolveStats>)> {
        let size_tot = self.grid.size_tot();
        let reversed = graph_reverse(
            &self.flow.indices,
            &self.flow.weights,
            size_tot,
            INVALID_INDEX,
            None,
        )?;
        debug!(capacity = reversed.capacity, "flow graph reversed");

        let mut adjoints = Vec::with_capacity(sensitivities.len());
        let mut stats = Vec::with_capacity(sensitivities.len());
        for sens in sensitivities {
            self.check_len(sens)?;
            let rhs = (0..size_tot)
                .map(|n| if self.grid.in_domain(n) { sens[n] } else { f64::NAN })
                .collect();
            let args = LinearArgs {
                grid: self.grid.clone(),
                rhs,
                diag: self.diag(),
                indices: reversed.indices.clone(),
                weights: reversed.weights.clone(),
                nact: reversed.capacity,
                domain: self.grid.pack_bits(&self.flow.reached),
            };
            let (y, s) = self.solve_linear("reverseAD", args)?;
            adjoints.push(y);
            stats.push(s);
        }
        Ok((adjoints, stats))
    }

    /// Sensitivity to the cost of an adjoint field: `y * ∂u/∂r * h` at
    /// updated nodes, plus the adjoint of spread seeds scattered through the
    /// seed cost jacobian.
    pub fn cost_sensitivity(&self, adjoint: &[f64], seed_tags: &[bool]) -> Vec<f64> {
        let mut out: Vec<f64> = (0..self.grid.size_tot())
            .map(|n| {
                if seed_tags[n] || !adjoint[n].is_finite() {
                    0.0
                } else {
                    adjoint[n] * self.flow.rhs_derivative[n] * self.h
                }
            })
            .collect();
        for &(n, m, d) in &self.seed_cost {
            if self.flow.weightsum[n] == 0.0 && adjoint[n].is_finite() {
                out[m] += adjoint[n] * d;
            }
        }
        out
    }

    fn solve_linear(&self, name: &str, args: LinearArgs) -> Result<(Vec<f64>, SolveStats)> {
        let tol = self.tol.resolve(&args.rhs);
        let traits = KernelTraits {
            kind: KernelKind::Linear,
            multip_step: None,
            ..self.template.clone()
        };
        let kernel = self.binding.compile(name, traits, KernelArgs::Linear(args))?;
        let mut iterate = Iterate::filled(self.grid.size_tot(), f64::INFINITY, false);
        let initial = kernel.trigger_blocks(&iterate);
        let stats = self.solver.solve(kernel.as_ref(), &mut iterate, tol, &initial)?;
        Ok((iterate.values, stats))
    }
}
