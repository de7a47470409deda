// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! Monotone local update scheme.
//!
//! Each node solves `Σ_k ρ_k max(0, u - v_k)^2 = r^2`, where for the symmetric
//! stencil offset `e_k` the upwind candidate is
//! `v_k = min(u(x - e_k) + s_k, u(x + e_k) - s_k)`. Offsets and weights come
//! from the metric (unit axes for isotropic and diagonal models, a Selling
//! decomposition for the 2-D Riemannian and Rander models), `s_k` is the
//! Rander drift shift and `r` is `cost * h`.

use std::fmt;

use nalgebra::DMatrix;

use crate::error::{EikonalError, Result};
use crate::grid::{BlockGrid, INVALID_INDEX, Int, MAX_NDIM};
use crate::metric::{Metric, MetricField};

/// Maximum number of symmetric stencil slots per node.
pub const MAX_SLOTS: usize = 4;

/// Curvature penalized families: recognized names whose schemes are not bundled.
const CURVATURE_MODELS: [&str; 4] = ["ReedsShepp2", "ReedsSheppForward2", "Elastica2", "Dubins2"];

/// Model family selecting the local update stencil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Model {
    /// Unit cost in every direction, `d` dimensions.
    Isotropic(usize),
    /// Axis aligned costs, `d` dimensions.
    Diagonal(usize),
    /// 2-D Riemannian metric.
    Riemann2,
    /// 2-D Rander metric (Riemannian plus drift).
    Rander2,
}

impl Model {
    /// Parse a family name. The suffix `Ext2` is rewritten to `2`.
    ///
    /// # Errors
    /// Returns `UnsupportedModel` for unknown names and for the curvature
    /// penalized families.
    pub fn parse(name: &str) -> Result<Self> {
        let normalized = match name.strip_suffix("Ext2") {
            Some(stem) => format!("{}2", stem),
            None => name.to_string(),
        };
        if CURVATURE_MODELS.contains(&normalized.as_str()) {
            return Err(EikonalError::UnsupportedModel(format!(
                "{} (curvature penalized schemes are not bundled)",
                normalized
            )));
        }
        let dimensioned = |prefix: &str| -> Option<usize> {
            let d: usize = normalized.strip_prefix(prefix)?.parse().ok()?;
            (1..=MAX_NDIM).contains(&d).then_some(d)
        };
        if let Some(d) = dimensioned("Isotropic") {
            return Ok(Model::Isotropic(d));
        }
        if let Some(d) = dimensioned("Diagonal") {
            return Ok(Model::Diagonal(d));
        }
        match normalized.as_str() {
            "Riemann2" => Ok(Model::Riemann2),
            "Rander2" => Ok(Model::Rander2),
            _ => Err(EikonalError::UnsupportedModel(name.to_string())),
        }
    }

    /// Canonical family name.
    pub fn name(&self) -> String {
        match self {
            Model::Isotropic(d) => format!("Isotropic{}", d),
            Model::Diagonal(d) => format!("Diagonal{}", d),
            Model::Riemann2 => "Riemann2".to_string(),
            Model::Rander2 => "Rander2".to_string(),
        }
    }

    /// Grid dimension the model lives in.
    pub fn ndim(&self) -> usize {
        match self {
            Model::Isotropic(d) | Model::Diagonal(d) => *d,
            Model::Riemann2 | Model::Rander2 => 2,
        }
    }

    /// Number of metric parameters per node.
    pub fn param_count(&self) -> usize {
        match self {
            Model::Isotropic(_) => 0,
            Model::Diagonal(d) => *d,
            Model::Riemann2 => 3,
            Model::Rander2 => 5,
        }
    }

    /// Parameters of the unit metric.
    pub fn default_params(&self) -> Vec<f64> {
        match self {
            Model::Isotropic(_) => Vec::new(),
            Model::Diagonal(d) => vec![1.0; *d],
            Model::Riemann2 => vec![1.0, 0.0, 1.0],
            Model::Rander2 => vec![1.0, 0.0, 1.0, 0.0, 0.0],
        }
    }

    /// Number of symmetric stencil slots.
    pub fn nslot(&self) -> usize {
        match self {
            Model::Isotropic(d) | Model::Diagonal(d) => *d,
            Model::Riemann2 | Model::Rander2 => 3,
        }
    }

    /// Whether the model carries an asymmetric drift.
    pub fn is_rander(&self) -> bool {
        matches!(self, Model::Rander2)
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Selling decomposition of a 2x2 symmetric positive definite matrix.
///
/// Returns weights `ρ_k >= 0` and integer offsets `e_k` with
/// `D = Σ_k ρ_k e_k e_kᵀ`.
pub fn selling_2d(d: &DMatrix<f64>) -> [(f64, [i32; 2]); 3] {
    let dot = |a: [i32; 2], b: [i32; 2]| -> f64 {
        let (a0, a1, b0, b1) = (a[0] as f64, a[1] as f64, b[0] as f64, b[1] as f64);
        a0 * (d[(0, 0)] * b0 + d[(0, 1)] * b1) + a1 * (d[(1, 0)] * b0 + d[(1, 1)] * b1)
    };
    let mut sb = [[1, 0], [0, 1], [-1, -1]];
    // Obtuse superbase reduction; terminates for positive definite input.
    for _ in 0..200 {
        let mut reduced = true;
        for (i, j, k) in [(0, 1, 2), (0, 2, 1), (1, 2, 0)] {
            if dot(sb[i], sb[j]) > 0.0 {
                let (bi, bj) = (sb[i], sb[j]);
                sb[i] = [-bi[0], -bi[1]];
                sb[k] = [bi[0] - bj[0], bi[1] - bj[1]];
                reduced = false;
                break;
            }
        }
        if reduced {
            break;
        }
    }
    [(1, 2, 0), (0, 2, 1), (0, 1, 2)].map(|(i, j, k)| {
        let rho = (-dot(sb[i], sb[j])).max(0.0);
        (rho, [-sb[k][1], sb[k][0]])
    })
}

/// Solve `Σ_k ρ_k max(0, u - v_k)^2 = r^2` for the candidates `(v_k, ρ_k)`.
///
/// Non-finite candidates and zero weights are ignored; the candidates are
/// reordered in place. Returns `+inf` when `r` is infinite or no candidate
/// contributes.
pub fn solve_local(candidates: &mut [(f64, f64)], r: f64) -> f64 {
    if !r.is_finite() || candidates.is_empty() {
        return f64::INFINITY;
    }
    candidates.sort_by(|x, y| x.0.total_cmp(&y.0));
    // Sums are taken relative to the smallest candidate, so that large
    // values do not cancel in the discriminant.
    let v0 = candidates[0].0;
    let (mut a, mut b, mut c) = (0.0, 0.0, 0.0);
    let mut u = f64::INFINITY;
    for &(v, rho) in candidates.iter() {
        if !v.is_finite() || v >= u {
            break;
        }
        if rho <= 0.0 {
            continue;
        }
        let w = v - v0;
        a += rho;
        b += rho * w;
        c += rho * w * w;
        let disc = (b * b - a * (c - r * r)).max(0.0);
        u = v0 + (b + disc.sqrt()) / a;
    }
    u
}

/// Upwind dependency of a single node, as recorded by flow extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeFlow {
    /// Normalized weights per slot, summing to 1 or 0.
    pub weights: [f64; MAX_SLOTS],
    /// Block-layout index of the upwind neighbor per slot.
    pub indices: [Int; MAX_SLOTS],
    /// Offset towards the upwind neighbor per slot.
    pub offsets: [[i32; MAX_NDIM]; MAX_SLOTS],
    /// Sum of the weights.
    pub weightsum: f64,
    /// `∂u/∂r` with the neighbors held fixed.
    pub rhs_derivative: f64,
}

impl NodeFlow {
    /// Flow of a node that depends on no neighbor (seed, wall, unreached).
    pub fn empty() -> Self {
        NodeFlow {
            weights: [0.0; MAX_SLOTS],
            indices: [INVALID_INDEX; MAX_SLOTS],
            offsets: [[0; MAX_NDIM]; MAX_SLOTS],
            weightsum: 0.0,
            rhs_derivative: 0.0,
        }
    }
}

#[derive(Clone, Copy)]
struct Upwind {
    value: f64,
    weight: f64,
    index: Option<usize>,
    sign: i32,
}

/// Per-node stencils of a model over a block grid, in block layout.
#[derive(Debug, Clone)]
pub struct Scheme {
    model: Model,
    ndim: usize,
    nslot: usize,
    offsets: Vec<i32>,
    weights: Vec<f64>,
    shifts: Vec<f64>,
    radius: Vec<f64>,
    reach: Vec<usize>,
}

impl Scheme {
    /// Build the stencil of every node.
    ///
    /// # Errors
    /// Returns an error if a metric is degenerate, or if an offset reaches
    /// further than one block along some axis.
    pub fn build(grid: &BlockGrid, metrics: &MetricField, h: f64) -> Result<Self> {
        let model = metrics.model();
        let ndim = grid.ndim();
        if model.ndim() != ndim {
            return Err(EikonalError::invalid(
                "dims",
                format!("model {} needs {} dimensions, got {}", model, model.ndim(), ndim),
            ));
        }
        let nslot = model.nslot();
        let size_tot = grid.size_tot();
        let mut offsets = vec![0i32; size_tot * nslot * ndim];
        let mut weights = vec![0.0; size_tot * nslot];
        let mut shifts = vec![0.0; size_tot * nslot];
        let mut radius = vec![f64::INFINITY; size_tot];
        let mut reach = vec![0usize; ndim];

        for n_t in 0..size_tot {
            let Some(flat) = grid.block_to_flat(n_t) else {
                continue;
            };
            let cost = metrics.cost_at(flat);
            let params = metrics.params_at(flat);
            let mut stencil: Vec<(f64, Vec<i32>, f64)> = Vec::with_capacity(nslot);
            match model {
                Model::Isotropic(_) | Model::Diagonal(_) => {
                    for k in 0..ndim {
                        let c = if params.is_empty() { 1.0 } else { params[k] };
                        let mut e = vec![0; ndim];
                        e[k] = 1;
                        stencil.push((1.0 / (c * c), e, 0.0));
                    }
                    radius[n_t] = cost * h;
                }
                Model::Riemann2 => {
                    let (d, _) = Metric::from_params(model, params, 1.0)?.drift_form(ndim)?;
                    for (rho, e) in selling_2d(&d) {
                        stencil.push((rho, e.to_vec(), 0.0));
                    }
                    radius[n_t] = cost * h;
                }
                Model::Rander2 => {
                    if cost.is_infinite() {
                        continue;
                    }
                    let folded = if cost > 0.0 { cost } else { 1.0 };
                    let (d, eta) = Metric::from_params(model, params, folded)?.drift_form(ndim)?;
                    for (rho, e) in selling_2d(&d) {
                        let shift = if cost > 0.0 {
                            h * (eta[0] * e[0] as f64 + eta[1] * e[1] as f64)
                        } else {
                            0.0
                        };
                        stencil.push((rho, e.to_vec(), shift));
                    }
                    radius[n_t] = if cost > 0.0 { h } else { 0.0 };
                }
            }
            for (k, (rho, e, shift)) in stencil.into_iter().enumerate() {
                let slot = n_t * nslot + k;
                weights[slot] = rho;
                shifts[slot] = shift;
                if rho > 0.0 {
                    for (axis, &ek) in e.iter().enumerate() {
                        reach[axis] = reach[axis].max(ek.unsigned_abs() as usize);
                    }
                }
                offsets[slot * ndim..(slot + 1) * ndim].copy_from_slice(&e);
            }
        }

        for (axis, (&r, &block)) in reach.iter().zip(grid.shape_i()).enumerate() {
            if r > block {
                return Err(EikonalError::StencilTooWide {
                    axis,
                    reach: r,
                    block,
                });
            }
        }

        Ok(Scheme {
            model,
            ndim,
            nslot,
            offsets,
            weights,
            shifts,
            radius,
            reach,
        })
    }

    /// The model of this scheme.
    pub fn model(&self) -> Model {
        self.model
    }

    /// Number of symmetric stencil slots per node.
    pub fn nslot(&self) -> usize {
        self.nslot
    }

    /// Largest offset component per axis.
    pub fn reach(&self) -> &[usize] {
        &self.reach
    }

    /// `r = cost * h` at a node; `+inf` for walls and padding.
    pub fn radius(&self, n_t: usize) -> f64 {
        self.radius[n_t]
    }

    /// Symmetric offset of slot `k` at node `n_t`.
    pub fn offset(&self, n_t: usize, k: usize) -> &[i32] {
        let slot = n_t * self.nslot + k;
        &self.offsets[slot * self.ndim..(slot + 1) * self.ndim]
    }

    fn upwind<F: Fn(usize) -> f64>(
        &self,
        grid: &BlockGrid,
        n_t: usize,
        x: &[isize],
        value_of: &F,
    ) -> [Upwind; MAX_SLOTS] {
        let mut out = [Upwind {
            value: f64::INFINITY,
            weight: 0.0,
            index: None,
            sign: 0,
        }; MAX_SLOTS];
        let mut y = [0isize; MAX_NDIM];
        for (k, up) in out.iter_mut().enumerate().take(self.nslot) {
            let slot = n_t * self.nslot + k;
            let weight = self.weights[slot];
            if weight <= 0.0 {
                continue;
            }
            let e = self.offset(n_t, k);
            let shift = self.shifts[slot];
            up.weight = weight;
            for sign in [-1i32, 1] {
                for axis in 0..self.ndim {
                    y[axis] = x[axis] + (sign * e[axis]) as isize;
                }
                let Some(m) = grid.index_tot(&y[..self.ndim]) else {
                    continue;
                };
                let v = value_of(m) - sign as f64 * shift;
                if v < up.value {
                    up.value = v;
                    up.index = Some(m);
                    up.sign = sign;
                }
            }
        }
        out
    }

    /// Updated value of node `n_t` at position `x`, reading neighbor values
    /// through `value_of`.
    pub fn update<F: Fn(usize) -> f64>(
        &self,
        grid: &BlockGrid,
        n_t: usize,
        x: &[isize],
        value_of: F,
    ) -> f64 {
        let r = self.radius[n_t];
        if !r.is_finite() {
            return f64::INFINITY;
        }
        let upwind = self.upwind(grid, n_t, x, &value_of);
        let mut cand = [(f64::INFINITY, 0.0); MAX_SLOTS];
        for (c, up) in cand.iter_mut().zip(&upwind) {
            *c = (up.value, up.weight);
        }
        solve_local(&mut cand[..self.nslot], r)
    }

    /// Upwind dependency of node `n_t` given its converged value `u`.
    pub fn flow<F: Fn(usize) -> f64>(
        &self,
        grid: &BlockGrid,
        n_t: usize,
        x: &[isize],
        u: f64,
        value_of: F,
    ) -> NodeFlow {
        let mut flow = NodeFlow::empty();
        let r = self.radius[n_t];
        if !u.is_finite() || !r.is_finite() {
            return flow;
        }
        let upwind = self.upwind(grid, n_t, x, &value_of);
        let mut raw = [0.0; MAX_SLOTS];
        for (k, up) in upwind.iter().enumerate().take(self.nslot) {
            if up.value.is_finite() && up.value < u {
                raw[k] = up.weight * (u - up.value);
            }
        }
        let total: f64 = raw.iter().sum();
        if total <= 0.0 {
            return flow;
        }
        for (k, up) in upwind.iter().enumerate().take(self.nslot) {
            if raw[k] <= 0.0 {
                continue;
            }
            let e = self.offset(n_t, k);
            flow.weights[k] = raw[k] / total;
            flow.indices[k] = up.index.map_or(INVALID_INDEX, |m| m as Int);
            for axis in 0..self.ndim {
                flow.offsets[k][axis] = up.sign * e[axis];
            }
        }
        flow.weightsum = flow.weights.iter().sum();
        flow.rhs_derivative = r / total;
        flow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Field;
    use approx::assert_relative_eq;

    #[test]
    fn parse_models() {
        assert_eq!(Model::parse("Isotropic2").unwrap(), Model::Isotropic(2));
        assert_eq!(Model::parse("Diagonal4").unwrap(), Model::Diagonal(4));
        assert_eq!(Model::parse("RiemannExt2").unwrap(), Model::Riemann2);
        assert_eq!(Model::parse("Rander2").unwrap(), Model::Rander2);
        assert!(matches!(
            Model::parse("ElasticaExt2"),
            Err(EikonalError::UnsupportedModel(m)) if m.starts_with("Elastica2")
        ));
        assert!(Model::parse("Isotropic7").is_err());
        assert!(Model::parse("Foo2").is_err());
    }

    #[test]
    fn solve_local_one_sided() {
        let mut cand = [(1.0, 1.0), (f64::INFINITY, 1.0)];
        assert_relative_eq!(solve_local(&mut cand, 0.5), 1.5);
    }

    #[test]
    fn solve_local_two_sided() {
        let mut cand = [(0.0, 1.0), (0.0, 1.0)];
        assert_relative_eq!(solve_local(&mut cand, 1.0), 0.5f64.sqrt());
    }

    #[test]
    fn solve_local_drops_far_candidate() {
        // The second candidate is above the one-sided solution.
        let mut cand = [(5.0, 1.0), (0.0, 1.0)];
        assert_relative_eq!(solve_local(&mut cand, 1.0), 1.0);
    }

    #[test]
    fn solve_local_weighted() {
        let mut cand = [(0.0, 4.0)];
        assert_relative_eq!(solve_local(&mut cand, 1.0), 0.5);
        let mut cand = [(0.0, 1.0)];
        assert_eq!(solve_local(&mut cand, f64::INFINITY), f64::INFINITY);
    }

    #[test]
    fn solve_local_large_values() {
        let mut cand = [(1e4, 1.0)];
        assert_relative_eq!(solve_local(&mut cand, 1e-3), 1e4 + 1e-3, epsilon = 1e-12);
        let mut cand = [(1e4, 1.0), (1e4, 1.0)];
        assert_relative_eq!(solve_local(&mut cand, 1.0), 1e4 + 0.5f64.sqrt(), epsilon = 1e-11);
        let mut cand = [(f64::INFINITY, 1.0), (1e4 + 0.5, 1.0), (1e4, 1.0)];
        // (u - 1e4)^2 + (u - 1e4 - 0.5)^2 = 1 gives u - 1e4 = (0.5 + sqrt(1.75)) / 2.
        assert_relative_eq!(
            solve_local(&mut cand, 1.0),
            1e4 + 0.25 + 0.5 * 1.75f64.sqrt(),
            epsilon = 1e-11
        );
    }

    fn reconstruct(decomp: &[(f64, [i32; 2]); 3]) -> [f64; 3] {
        let mut out = [0.0; 3];
        for (rho, e) in decomp {
            let (e0, e1) = (e[0] as f64, e[1] as f64);
            out[0] += rho * e0 * e0;
            out[1] += rho * e0 * e1;
            out[2] += rho * e1 * e1;
        }
        out
    }

    #[test]
    fn selling_identity() {
        let d = DMatrix::identity(2, 2);
        let decomp = selling_2d(&d);
        assert_eq!(reconstruct(&decomp), [1.0, 0.0, 1.0]);
        assert!(decomp.iter().all(|(rho, _)| *rho >= 0.0));
    }

    #[test]
    fn selling_anisotropic() {
        let d = DMatrix::from_row_slice(2, 2, &[5.0, 3.9, 3.9, 4.0]);
        let decomp = selling_2d(&d);
        let rec = reconstruct(&decomp);
        assert_relative_eq!(rec[0], 5.0, epsilon = 1e-12);
        assert_relative_eq!(rec[1], 3.9, epsilon = 1e-12);
        assert_relative_eq!(rec[2], 4.0, epsilon = 1e-12);
        assert!(decomp.iter().all(|(rho, _)| *rho >= 0.0));
    }

    fn isotropic_scheme(shape: &[usize], h: f64) -> (BlockGrid, Scheme) {
        let ndim = shape.len();
        let grid = BlockGrid::new(shape, &BlockGrid::default_shape_i(ndim)).unwrap();
        let periodic = vec![false; ndim];
        let metrics = MetricField::new(
            Model::Isotropic(ndim),
            shape,
            &periodic,
            Field::constant(vec![]),
            Field::constant(vec![1.0]),
        )
        .unwrap();
        let scheme = Scheme::build(&grid, &metrics, h).unwrap();
        (grid, scheme)
    }

    #[test]
    fn scheme_padding_is_wall() {
        let (grid, scheme) = isotropic_scheme(&[10, 10], 0.1);
        let padding = grid.size_tot() - 1;
        assert!(!grid.in_domain(padding));
        assert_eq!(scheme.radius(padding), f64::INFINITY);
        assert_relative_eq!(scheme.radius(0), 0.1);
        assert_eq!(scheme.reach(), &[1, 1]);
    }

    #[test]
    fn update_and_flow_next_to_seed() {
        let (grid, scheme) = isotropic_scheme(&[8, 8], 1.0);
        let seed = grid.block_index(&[3, 3]);
        let value_of = |m: usize| if m == seed { 0.0 } else { f64::INFINITY };
        let node = grid.block_index(&[4, 3]);
        let u = scheme.update(&grid, node, &[4, 3], value_of);
        assert_relative_eq!(u, 1.0);

        let flow = scheme.flow(&grid, node, &[4, 3], u, value_of);
        assert_relative_eq!(flow.weightsum, 1.0);
        assert_eq!(flow.indices[0], seed as Int);
        assert_eq!(flow.offsets[0][..2], [-1, 0]);
        assert_eq!(flow.indices[1], INVALID_INDEX);
        assert_relative_eq!(flow.rhs_derivative, 1.0);
    }

    #[test]
    fn diagonal_travel_time_matches_norm() {
        let shape = [8, 8];
        let grid = BlockGrid::new(&shape, &BlockGrid::default_shape_i(2)).unwrap();
        let metrics = MetricField::new(
            Model::Diagonal(2),
            &shape,
            &[false, false],
            Field::constant(vec![2.0, 0.5]),
            Field::constant(vec![1.0]),
        )
        .unwrap();
        let scheme = Scheme::build(&grid, &metrics, 0.5).unwrap();
        let metric = Metric::from_params(Model::Diagonal(2), &[2.0, 0.5], 1.0).unwrap();
        let seed = grid.block_index(&[3, 3]);
        let value_of = |m: usize| if m == seed { 0.0 } else { f64::INFINITY };
        for (x, d) in [([4usize, 3], [0.5, 0.0]), ([3, 4], [0.0, 0.5]), ([3, 2], [0.0, -0.5])] {
            let xi = x.map(|k| k as isize);
            let u = scheme.update(&grid, grid.block_index(&x), &xi, value_of);
            assert_relative_eq!(u, metric.norm(&d), epsilon = 1e-12);
        }
        assert_relative_eq!(metric.norm(&[0.5, 0.0]), 1.0);
        assert_relative_eq!(metric.norm(&[0.0, 0.5]), 0.25);
    }

    #[test]
    fn flow_of_diagonal_node_is_balanced() {
        let (grid, scheme) = isotropic_scheme(&[8, 8], 1.0);
        let a = grid.block_index(&[3, 4]);
        let b = grid.block_index(&[4, 3]);
        let value_of = |m: usize| if m == a || m == b { 1.0 } else { f64::INFINITY };
        let node = grid.block_index(&[4, 4]);
        let u = scheme.update(&grid, node, &[4, 4], value_of);
        assert_relative_eq!(u, 1.0 + 0.5f64.sqrt());
        let flow = scheme.flow(&grid, node, &[4, 4], u, value_of);
        assert_relative_eq!(flow.weights[0], 0.5);
        assert_relative_eq!(flow.weights[1], 0.5);
    }

    #[test]
    fn wide_stencil_rejected() {
        let shape = [16, 16];
        let grid = BlockGrid::new(&shape, &[8, 1]).unwrap();
        let metrics = MetricField::new(
            Model::Riemann2,
            &shape,
            &[false, false],
            // Selling offsets of M⁻¹ include (-1, 2).
            Field::constant(vec![4.0, 2.0, 1.25]),
            Field::constant(vec![1.0]),
        )
        .unwrap();
        assert!(matches!(
            Scheme::build(&grid, &metrics, 1.0),
            Err(EikonalError::StencilTooWide { axis: 1, .. })
        ));
    }
}
