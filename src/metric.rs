// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! Local metrics and the parameter fields they are built from.

use nalgebra::{DMatrix, DVector};

use crate::error::{EikonalError, Result};
use crate::grid::unravel;
use crate::scheme::Model;

/// A norm on displacement vectors, evaluated at a single point.
///
/// Costs are folded into the metric: a cost `c` multiplies every norm by `c`.
#[derive(Debug, Clone, PartialEq)]
pub enum Metric {
    /// `c·|v|`.
    Isotropic(f64),
    /// `sqrt(Σ (c_k v_k)^2)`.
    Diagonal(DVector<f64>),
    /// `sqrt(vᵀ M v)`.
    Riemann(DMatrix<f64>),
    /// `sqrt(vᵀ m v) + <w, v>`, with `<w, m⁻¹ w> < 1`.
    Rander {
        /// Symmetric positive definite part.
        m: DMatrix<f64>,
        /// Drift.
        w: DVector<f64>,
    },
}

impl Metric {
    /// Build the metric of `model` from its packed parameters, scaled by `cost`.
    ///
    /// Parameter packing: none for isotropic models, `d` per-axis costs for
    /// diagonal models, `(m00, m01, m11)` for `Riemann2` and
    /// `(m00, m01, m11, w0, w1)` for `Rander2`.
    pub fn from_params(model: Model, params: &[f64], cost: f64) -> Result<Self> {
        if params.len() != model.param_count() {
            return Err(EikonalError::invalid(
                "metric",
                format!(
                    "{} expects {} parameters per node, got {}",
                    model.name(),
                    model.param_count(),
                    params.len()
                ),
            ));
        }
        let metric = match model {
            Model::Isotropic(_) => Metric::Isotropic(1.0),
            Model::Diagonal(_) => Metric::Diagonal(DVector::from_column_slice(params)),
            Model::Riemann2 => Metric::Riemann(sym2(params)),
            Model::Rander2 => {
                let m = sym2(&params[..3]);
                let w = DVector::from_column_slice(&params[3..5]);
                let m_inv = m.clone().try_inverse().ok_or_else(|| {
                    EikonalError::invalid("metric", "Rander matrix is not invertible")
                })?;
                if w.dot(&(&m_inv * &w)) >= 1.0 {
                    return Err(EikonalError::invalid(
                        "metric",
                        "Rander drift is not dominated by the Riemannian part",
                    ));
                }
                Metric::Rander { m, w }
            }
        };
        Ok(metric.scaled(cost))
    }

    /// Multiply all norms by `cost`.
    pub fn scaled(self, cost: f64) -> Self {
        match self {
            Metric::Isotropic(c) => Metric::Isotropic(c * cost),
            Metric::Diagonal(c) => Metric::Diagonal(c * cost),
            Metric::Riemann(m) => Metric::Riemann(m * (cost * cost)),
            Metric::Rander { m, w } => Metric::Rander {
                m: m * (cost * cost),
                w: w * cost,
            },
        }
    }

    /// Norm of the displacement `v`.
    pub fn norm(&self, v: &[f64]) -> f64 {
        let v = DVector::from_column_slice(v);
        match self {
            Metric::Isotropic(c) => c * v.norm(),
            Metric::Diagonal(c) => c.component_mul(&v).norm(),
            Metric::Riemann(m) => v.dot(&(m * &v)).sqrt(),
            Metric::Rander { m, w } => v.dot(&(m * &v)).sqrt() + w.dot(&v),
        }
    }

    /// Dual norm `F*(p) = sup { <p, v> : F(v) <= 1 }`.
    pub fn dual(&self) -> Result<Metric> {
        let singular = || EikonalError::invalid("metric", "metric tensor is not invertible");
        Ok(match self {
            Metric::Isotropic(c) => Metric::Isotropic(1.0 / c),
            Metric::Diagonal(c) => Metric::Diagonal(c.map(|ck| 1.0 / ck)),
            Metric::Riemann(m) => Metric::Riemann(m.clone().try_inverse().ok_or_else(singular)?),
            Metric::Rander { m, w } => {
                let s = (m - w * w.transpose()).try_inverse().ok_or_else(singular)?;
                let omega = &s * w;
                Metric::Rander {
                    m: s * (1.0 + w.dot(&omega)),
                    w: -omega,
                }
            }
        })
    }

    /// Gradient of the norm at `v`. NaN entries when `v` vanishes.
    pub fn gradient(&self, v: &[f64]) -> Vec<f64> {
        let v = DVector::from_column_slice(v);
        let g = match self {
            Metric::Isotropic(c) => &v * (*c / v.norm()),
            Metric::Diagonal(c) => {
                let c2 = c.component_mul(c);
                c2.component_mul(&v) / c.component_mul(&v).norm()
            }
            Metric::Riemann(m) => {
                let mv = m * &v;
                let n = v.dot(&mv).sqrt();
                mv / n
            }
            Metric::Rander { m, w } => {
                let mv = m * &v;
                let n = v.dot(&mv).sqrt();
                mv / n + w
            }
        };
        g.iter().copied().collect()
    }

    /// Quadratic drift form of the eikonal equation `F*(∇u) = 1`.
    ///
    /// Returns `(D, η)` such that the equation reads `|∇u - η|_D = 1`, where
    /// `|p|_D = sqrt(pᵀ D p)`. Only Rander metrics have a nonzero drift.
    pub fn drift_form(&self, ndim: usize) -> Result<(DMatrix<f64>, DVector<f64>)> {
        let dual = self.dual()?;
        Ok(match dual {
            Metric::Isotropic(c) => (DMatrix::identity(ndim, ndim) * (c * c), DVector::zeros(ndim)),
            Metric::Diagonal(c) => (
                DMatrix::from_diagonal(&c.component_mul(&c)),
                DVector::zeros(ndim),
            ),
            Metric::Riemann(m) => (m, DVector::zeros(ndim)),
            Metric::Rander { m, w } => {
                // Dual drift ω* = -ω.
                let omega = -w;
                let a = m - &omega * omega.transpose();
                let a_inv = a.clone().try_inverse().ok_or_else(|| {
                    EikonalError::invalid("metric", "degenerate Rander drift form")
                })?;
                let eta = &a_inv * &omega;
                let scale = 1.0 + omega.dot(&eta);
                (a / scale, eta)
            }
        })
    }

    /// Riemannian part and drift of a Rander metric.
    pub fn rander_parts(&self) -> Option<(&DMatrix<f64>, &DVector<f64>)> {
        match self {
            Metric::Rander { m, w } => Some((m, w)),
            _ => None,
        }
    }
}

fn sym2(p: &[f64]) -> DMatrix<f64> {
    DMatrix::from_row_slice(2, 2, &[p[0], p[1], p[1], p[2]])
}

/// Per-node parameters: either one constant tuple or one tuple per grid node
/// (row-major nodes, components contiguous).
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    ncomp: usize,
    data: Vec<f64>,
    constant: bool,
}

impl Field {
    /// Same tuple at every node.
    pub fn constant(values: Vec<f64>) -> Self {
        Field {
            ncomp: values.len(),
            data: values,
            constant: true,
        }
    }

    /// One tuple of `ncomp` values per node.
    pub fn per_node(ncomp: usize, data: Vec<f64>) -> Self {
        Field {
            ncomp,
            data,
            constant: false,
        }
    }

    /// Number of components per node.
    pub fn ncomp(&self) -> usize {
        self.ncomp
    }

    /// Whether the field is the same at every node.
    pub fn is_constant(&self) -> bool {
        self.constant
    }

    /// Tuple at the row-major node `flat`.
    pub fn at(&self, flat: usize) -> &[f64] {
        if self.constant {
            &self.data
        } else {
            &self.data[flat * self.ncomp..(flat + 1) * self.ncomp]
        }
    }

    /// Multilinear interpolation at the index-space point `x`.
    ///
    /// Periodic axes wrap around; other axes clamp to the boundary nodes.
    pub fn interpolate(&self, x: &[f64], shape: &[usize], periodic: &[bool]) -> Vec<f64> {
        if self.constant {
            return self.data.clone();
        }
        let mut out = vec![0.0; self.ncomp];
        for (flat, weight) in interpolation_weights(x, shape, periodic) {
            for (o, v) in out.iter_mut().zip(self.at(flat)) {
                *o += weight * v;
            }
        }
        out
    }
}

/// Row-major nodes and weights of the multilinear interpolation at the
/// index-space point `x`. Zero weights are omitted.
///
/// Periodic axes wrap around; other axes clamp to the boundary nodes.
pub fn interpolation_weights(x: &[f64], shape: &[usize], periodic: &[bool]) -> Vec<(usize, f64)> {
    let ndim = shape.len();
    let mut base = vec![0isize; ndim];
    let mut frac = vec![0.0; ndim];
    for k in 0..ndim {
        let fl = x[k].floor();
        base[k] = fl as isize;
        frac[k] = x[k] - fl;
    }
    let mut out = Vec::with_capacity(1 << ndim);
    for corner in 0..(1usize << ndim) {
        let mut weight = 1.0;
        let mut flat = 0;
        for k in 0..ndim {
            let up = (corner >> k) & 1 == 1;
            weight *= if up { frac[k] } else { 1.0 - frac[k] };
            let s = shape[k] as isize;
            let mut i = base[k] + up as isize;
            i = if periodic[k] {
                i.rem_euclid(s)
            } else {
                i.clamp(0, s - 1)
            };
            flat = flat * shape[k] + i as usize;
        }
        if weight != 0.0 {
            out.push((flat, weight));
        }
    }
    out
}

/// Metric parameters and cost over a grid.
#[derive(Debug, Clone)]
pub struct MetricField {
    model: Model,
    shape: Vec<usize>,
    periodic: Vec<bool>,
    params: Field,
    cost: Field,
}

impl MetricField {
    /// Assemble a metric field.
    ///
    /// # Errors
    /// Returns an error if a per-node field does not match the grid node count
    /// or the parameter count of `model`.
    pub fn new(
        model: Model,
        shape: &[usize],
        periodic: &[bool],
        params: Field,
        cost: Field,
    ) -> Result<Self> {
        let nnodes: usize = shape.iter().product();
        for (key, field, ncomp) in [
            ("metric", &params, model.param_count()),
            ("cost", &cost, 1),
        ] {
            let expected = if field.constant { ncomp } else { nnodes * ncomp };
            if field.ncomp != ncomp || field.data.len() != expected {
                let mut want = shape.to_vec();
                if ncomp != 1 {
                    want.push(ncomp);
                }
                return Err(EikonalError::ShapeMismatch {
                    expected: want,
                    got: vec![field.data.len()],
                });
            }
            if key == "cost" && field.data.iter().any(|&c| c < 0.0 || c.is_nan()) {
                return Err(EikonalError::invalid("cost", "negative or NaN cost"));
            }
        }
        Ok(MetricField {
            model,
            shape: shape.to_vec(),
            periodic: periodic.to_vec(),
            params,
            cost,
        })
    }

    /// The model the parameters belong to.
    pub fn model(&self) -> Model {
        self.model
    }

    /// Cost at the row-major node `flat`.
    pub fn cost_at(&self, flat: usize) -> f64 {
        self.cost.at(flat)[0]
    }

    /// Unscaled metric parameters at the row-major node `flat`.
    pub fn params_at(&self, flat: usize) -> &[f64] {
        self.params.at(flat)
    }

    /// Metric with cost folded in, at the row-major node `flat`.
    pub fn metric_at(&self, flat: usize) -> Result<Metric> {
        Metric::from_params(self.model, self.params.at(flat), self.cost_at(flat))
    }

    /// Metric with cost folded in, interpolated at the index-space point `x`.
    pub fn metric_near(&self, x: &[f64]) -> Result<Metric> {
        let params = self.params.interpolate(x, &self.shape, &self.periodic);
        let cost = self.cost.interpolate(x, &self.shape, &self.periodic)[0];
        Metric::from_params(self.model, &params, cost)
    }

    /// Cost interpolated at the index-space point `x`.
    pub fn cost_near(&self, x: &[f64]) -> f64 {
        self.cost.interpolate(x, &self.shape, &self.periodic)[0]
    }

    /// Interpolation weights of the cost at the index-space point `x`.
    pub fn cost_weights(&self, x: &[f64]) -> Vec<(usize, f64)> {
        interpolation_weights(x, &self.shape, &self.periodic)
    }

    /// Metric without cost at the row-major node `flat`. The metric with
    /// cost is this one scaled by [`MetricField::cost_at`].
    pub fn unit_metric_at(&self, flat: usize) -> Result<Metric> {
        Metric::from_params(self.model, self.params.at(flat), 1.0)
    }

    /// Metric without cost, interpolated at the index-space point `x`.
    pub fn unit_metric_near(&self, x: &[f64]) -> Result<Metric> {
        let params = self.params.interpolate(x, &self.shape, &self.periodic);
        Metric::from_params(self.model, &params, 1.0)
    }

    /// Metric at a node given by its grid coordinates.
    pub fn metric_at_position(&self, x: &[usize]) -> Result<Metric> {
        self.metric_at(crate::grid::ravel(x, &self.shape))
    }

    /// Coordinates of the row-major node `flat`.
    pub fn position(&self, flat: usize) -> Vec<usize> {
        unravel(flat, &self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn rander() -> Metric {
        Metric::from_params(Model::Rander2, &[1.5, 0.2, 1.0, 0.3, -0.4], 1.0).unwrap()
    }

    #[test]
    fn isotropic_norm_scales_with_cost() {
        let m = Metric::from_params(Model::Isotropic(2), &[], 3.0).unwrap();
        assert_relative_eq!(m.norm(&[3.0, 4.0]), 15.0);
        assert_relative_eq!(m.dual().unwrap().norm(&[3.0, 4.0]), 5.0 / 3.0);
    }

    #[test]
    fn diagonal_norm() {
        // sqrt((2 * 1)^2 + (0.5 * 2)^2)
        let m = Metric::from_params(Model::Diagonal(2), &[2.0, 0.5], 1.0).unwrap();
        assert_relative_eq!(m.norm(&[1.0, 2.0]), 5.0f64.sqrt());
    }

    #[test]
    fn rander_dual_is_involutive() {
        let m = rander();
        let dd = m.dual().unwrap().dual().unwrap();
        for v in [[1.0, 0.0], [0.3, -2.0], [-1.0, 1.0]] {
            assert_relative_eq!(m.norm(&v), dd.norm(&v), epsilon = 1e-10);
        }
    }

    #[test]
    fn rander_dual_one_dimensional_reduction() {
        // Drift along axis 0 only: dual norm along that axis is 1/(1 ± a).
        let a = 0.4;
        let m = Metric::from_params(Model::Rander2, &[1.0, 0.0, 1.0, a, 0.0], 1.0).unwrap();
        let dual = m.dual().unwrap();
        assert_relative_eq!(dual.norm(&[1.0, 0.0]), 1.0 / (1.0 + a), epsilon = 1e-12);
        assert_relative_eq!(dual.norm(&[-1.0, 0.0]), 1.0 / (1.0 - a), epsilon = 1e-12);
    }

    #[test]
    fn gradient_has_unit_dual_norm() {
        let metrics = [
            Metric::from_params(Model::Isotropic(2), &[], 2.0).unwrap(),
            Metric::from_params(Model::Diagonal(2), &[2.0, 0.5], 1.0).unwrap(),
            Metric::from_params(Model::Riemann2, &[2.0, 0.5, 1.0], 1.0).unwrap(),
            rander(),
        ];
        for m in &metrics {
            let g = m.gradient(&[0.7, -1.3]);
            assert_relative_eq!(m.dual().unwrap().norm(&g), 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn zero_vector_gradient_is_nan() {
        assert!(rander().gradient(&[0.0, 0.0]).iter().any(|g| g.is_nan()));
    }

    #[test]
    fn drift_form_matches_dual_norm() {
        let m = rander();
        let dual = m.dual().unwrap();
        let (d, eta) = m.drift_form(2).unwrap();
        // Points p with |p - η|_D = 1 lie on the dual unit sphere.
        for theta in [0.0f64, 1.0, 2.5, 4.0] {
            let dir = DVector::from_column_slice(&[theta.cos(), theta.sin()]);
            let len = dir.dot(&(&d * &dir)).sqrt();
            let p = &eta + dir / len;
            assert_relative_eq!(dual.norm(p.as_slice()), 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn rejects_dominant_drift() {
        let result = Metric::from_params(Model::Rander2, &[1.0, 0.0, 1.0, 1.0, 0.5], 1.0);
        assert!(matches!(result, Err(EikonalError::InvalidValue { .. })));
    }

    #[test]
    fn field_interpolation() {
        let shape = [2, 3];
        let data: Vec<f64> = (0..6).map(|i| i as f64).collect();
        let field = Field::per_node(1, data);
        // Bilinear in a linear function is exact.
        let v = field.interpolate(&[0.5, 1.25], &shape, &[false, false]);
        assert_relative_eq!(v[0], 1.5 * 1.0 + 1.25);
        // Clamped outside the grid.
        let v = field.interpolate(&[-1.0, 0.0], &shape, &[false, false]);
        assert_relative_eq!(v[0], 0.0);
        // Wrapped on a periodic axis.
        let v = field.interpolate(&[0.0, 2.5], &shape, &[false, true]);
        assert_relative_eq!(v[0], 1.0);
    }

    #[test]
    fn interpolation_weights_sum_to_one() {
        let w = interpolation_weights(&[0.25, 2.5], &[4, 3], &[false, true]);
        assert_eq!(w.len(), 4);
        assert_relative_eq!(w.iter().map(|&(_, x)| x).sum::<f64>(), 1.0);
        // Axis 1 wraps from node 2 to node 0.
        assert!(w.iter().any(|&(n, x)| n == 0 && (x - 0.375).abs() < 1e-12));
        // Integer points carry a single node.
        assert_eq!(interpolation_weights(&[1.0, 1.0], &[4, 3], &[false, false]), vec![(4, 1.0)]);
    }

    #[test]
    fn unit_metric_scales_to_cost() {
        let field = MetricField::new(
            Model::Diagonal(2),
            &[2, 2],
            &[false, false],
            Field::constant(vec![2.0, 0.5]),
            Field::per_node(1, vec![1.0, 2.0, 3.0, 4.0]),
        )
        .unwrap();
        let v = [0.3, -1.1];
        for flat in 0..4 {
            assert_relative_eq!(
                field.metric_at(flat).unwrap().norm(&v),
                field.cost_at(flat) * field.unit_metric_at(flat).unwrap().norm(&v),
                epsilon = 1e-12
            );
        }
        assert_relative_eq!(field.cost_near(&[0.5, 0.5]), 2.5);
        assert_relative_eq!(
            field.metric_near(&[0.5, 0.5]).unwrap().norm(&v),
            2.5 * field.unit_metric_near(&[0.5, 0.5]).unwrap().norm(&v),
            epsilon = 1e-12
        );
    }

    #[test]
    fn metric_field_shape_checked() {
        let result = MetricField::new(
            Model::Riemann2,
            &[4, 4],
            &[false, false],
            Field::per_node(3, vec![1.0; 3 * 15]),
            Field::constant(vec![1.0]),
        );
        assert!(matches!(result, Err(EikonalError::ShapeMismatch { .. })));
    }
}
