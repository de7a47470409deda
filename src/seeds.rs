// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! Boundary data: seed values, seed tags and trigger dilation.

use std::collections::BTreeMap;

use tracing::debug;

use crate::ad::Ad;
use crate::error::{EikonalError, Result};
use crate::grid::{displacement, num_displacements, ravel, unravel, BlockGrid};
use crate::metric::MetricField;

/// Seed points in physical coordinates and their values.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedSet {
    /// One point of `ndim` coordinates per seed.
    pub points: Vec<Vec<f64>>,
    /// One value per seed; the tangent holds `k` directions per seed.
    pub values: Ad<Vec<f64>>,
}

impl SeedSet {
    /// Number of seeds.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether there are no seeds.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of tangent directions carried by the seed values.
    pub fn num_directions(&self) -> usize {
        match &self.values {
            Ad::WithTangent(_, t) if !self.points.is_empty() => t.len() / self.points.len(),
            _ => 0,
        }
    }
}

/// Which seed owns which grid node. Transposed to gather seed sensitivities.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SeedInterpolation {
    /// `(row-major node, seed)` pairs, one per seeded node.
    pub entries: Vec<(usize, usize)>,
}

impl SeedInterpolation {
    /// Sum of `field` over the nodes of each seed.
    pub fn gather(&self, field: &[f64], nseeds: usize) -> Vec<f64> {
        let mut out = vec![0.0; nseeds];
        for &(n, s) in &self.entries {
            out[s] += field[n];
        }
        out
    }
}

/// Right-hand side of the eikonal problem.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedData {
    /// Seed values, `+inf` elsewhere, block layout.
    pub rhs: Vec<f64>,
    /// Tangents of `rhs`, one block-layout field per direction, or `None`.
    pub rhs_tangent: Option<Vec<Vec<f64>>>,
    /// Seeds and padding, block layout.
    pub seed_tags: Vec<bool>,
    /// Seed ownership of the seeded nodes.
    pub interpolation: SeedInterpolation,
    /// `(seeded node, cost node, ∂rhs/∂cost)` triples, row-major nodes.
    /// Empty unless seeds are spread over a positive radius.
    pub cost_jacobian: Vec<(usize, usize, f64)>,
}

/// A seeded node proposed by one seed.
struct SpreadNode {
    flat: usize,
    offset: f64,
    /// `(cost node, ∂offset/∂cost)`.
    cost_jacobian: Vec<(usize, f64)>,
}

/// `cost * norm`, zero for a zero norm even where the cost is infinite.
fn scaled_norm(cost: f64, norm: f64) -> f64 {
    if norm == 0.0 {
        0.0
    } else {
        cost * norm
    }
}

/// Converts seed points into boundary values.
///
/// With a zero radius every seed occupies its nearest grid node, ties
/// rounding away from zero. With a positive radius every node closer than the
/// radius (in pixels) receives `value + (F_seed(d) + F_node(d)) / 2`, where `d`
/// is the physical displacement from the seed and `F` the local metric.
pub struct SeedBuilder<'a> {
    grid: &'a BlockGrid,
    metrics: &'a MetricField,
    origin: Vec<f64>,
    h: f64,
    radius: f64,
}

impl<'a> SeedBuilder<'a> {
    /// Seed builder on `grid` with spacing `h` and node 0 at the origin.
    pub fn new(grid: &'a BlockGrid, metrics: &'a MetricField, h: f64) -> Self {
        SeedBuilder {
            grid,
            metrics,
            origin: vec![0.0; grid.ndim()],
            h,
            radius: 0.0,
        }
    }

    /// Physical position of node 0 (builder method).
    pub fn with_origin(mut self, origin: &[f64]) -> Self {
        self.origin = origin.to_vec();
        self
    }

    /// Spreading radius in pixels (builder method).
    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = radius;
        self
    }

    fn index_coords(&self, point: &[f64]) -> Vec<f64> {
        point
            .iter()
            .zip(&self.origin)
            .map(|(x, o)| (x - o) / self.h)
            .collect()
    }

    /// Wrap periodic axes; `None` outside the domain.
    fn wrap(&self, y: &[isize]) -> Option<Vec<usize>> {
        let shape = self.grid.shape();
        let periodic = self.grid.periodic();
        y.iter()
            .enumerate()
            .map(|(k, &yk)| {
                let s = shape[k] as isize;
                if periodic[k] {
                    Some(yk.rem_euclid(s) as usize)
                } else if (0..s).contains(&yk) {
                    Some(yk as usize)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Seeded nodes of one seed, with their value offsets.
    ///
    /// The offset of a spread node is `(c_s N_s(d) + c_n N_n(d)) / 2`, where
    /// `N` are the cost-free norms at the seed and node, `c_s` the cost
    /// interpolated at the seed and `c_n` the cost at the node.
    fn spread(&self, c: &[f64]) -> Result<Vec<SpreadNode>> {
        let shape = self.grid.shape();
        let ndim = shape.len();
        if self.radius <= 0.0 {
            let y: Vec<isize> = c.iter().map(|ck| ck.round() as isize).collect();
            let x = self.wrap(&y).ok_or_else(|| EikonalError::InvalidSeed {
                coord: c.to_vec(),
                reason: format!("nearest node {:?} lies outside the grid {:?}", y, shape),
            })?;
            return Ok(vec![SpreadNode {
                flat: ravel(&x, shape),
                offset: 0.0,
                cost_jacobian: Vec::new(),
            }]);
        }

        let r = self.radius;
        let lo: Vec<isize> = c.iter().map(|ck| (ck - r).floor() as isize).collect();
        let extent: Vec<usize> = c
            .iter()
            .zip(&lo)
            .map(|(ck, &l)| ((ck + r).ceil() as isize - l + 1) as usize)
            .collect();
        let seed_metric = self.metrics.unit_metric_near(c)?;
        let seed_cost = self.metrics.cost_near(c);
        let seed_weights = self.metrics.cost_weights(c);
        let count: usize = extent.iter().product();
        let mut out = Vec::new();
        for local in 0..count {
            let offset = unravel(local, &extent);
            let y: Vec<isize> = lo.iter().zip(&offset).map(|(&l, &o)| l + o as isize).collect();
            let diff: Vec<f64> = y.iter().zip(c).map(|(&yk, ck)| yk as f64 - ck).collect();
            let dist = diff.iter().map(|d| d * d).sum::<f64>().sqrt();
            if dist >= r {
                continue;
            }
            let Some(x) = self.wrap(&y) else {
                continue;
            };
            let flat = ravel(&x, shape);
            let phys: Vec<f64> = diff.iter().map(|d| d * self.h).collect();
            let seed_norm = seed_metric.norm(&phys);
            let node_norm = self.metrics.unit_metric_at(flat)?.norm(&phys);
            let offset = 0.5
                * (scaled_norm(seed_cost, seed_norm)
                    + scaled_norm(self.metrics.cost_at(flat), node_norm));
            let mut cost_jacobian: Vec<(usize, f64)> = seed_weights
                .iter()
                .map(|&(m, w)| (m, 0.5 * seed_norm * w))
                .collect();
            cost_jacobian.push((flat, 0.5 * node_norm));
            cost_jacobian.retain(|&(_, d)| d != 0.0);
            out.push(SpreadNode {
                flat,
                offset,
                cost_jacobian,
            });
        }
        if out.is_empty() {
            return Err(EikonalError::InvalidSeed {
                coord: c.to_vec(),
                reason: format!("no grid node within radius {} in dimension {}", r, ndim),
            });
        }
        Ok(out)
    }

    /// Build the right-hand side and seed tags.
    ///
    /// Where several seeds reach the same node the smallest value wins.
    ///
    /// # Errors
    /// Returns `InvalidSeed` for seeds outside a non periodic grid, and
    /// `ShapeMismatch` for inconsistent seed arrays.
    pub fn build(&self, seeds: &SeedSet) -> Result<SeedData> {
        let ndim = self.grid.ndim();
        let nseeds = seeds.len();
        let (values, tangent) = match &seeds.values {
            Ad::Plain(v) => (v, None),
            Ad::WithTangent(v, t) => (v, Some(t)),
        };
        let k = seeds.num_directions();
        if values.len() != nseeds
            || seeds.points.iter().any(|p| p.len() != ndim)
            || tangent.is_some_and(|t| t.len() != nseeds * k)
        {
            return Err(EikonalError::ShapeMismatch {
                expected: vec![nseeds, ndim],
                got: vec![values.len()],
            });
        }

        let nnodes = self.grid.num_nodes();
        let mut rhs = vec![f64::INFINITY; nnodes];
        let mut owner: Vec<Option<usize>> = vec![None; nnodes];
        let mut jacobians: BTreeMap<usize, Vec<(usize, f64)>> = BTreeMap::new();
        for (s, point) in seeds.points.iter().enumerate() {
            let c = self.index_coords(point);
            for node in self.spread(&c)? {
                let flat = node.flat;
                let v = values[s] + node.offset;
                if owner[flat].is_none() || v < rhs[flat] {
                    rhs[flat] = v;
                    owner[flat] = Some(s);
                    jacobians.insert(flat, node.cost_jacobian);
                }
            }
        }
        let cost_jacobian: Vec<(usize, usize, f64)> = jacobians
            .into_iter()
            .flat_map(|(n, entries)| entries.into_iter().map(move |(m, d)| (n, m, d)))
            .collect();

        let entries: Vec<(usize, usize)> = owner
            .iter()
            .enumerate()
            .filter_map(|(n, o)| o.map(|s| (n, s)))
            .collect();
        debug!(seeds = nseeds, nodes = entries.len(), radius = self.radius, "seeds spread");

        let tags: Vec<bool> = owner.iter().map(Option::is_some).collect();
        let rhs_tangent = match tangent {
            Some(t) => {
                let mut dirs = Vec::with_capacity(k);
                for dir in 0..k {
                    let mut field = vec![0.0; nnodes];
                    for &(n, s) in &entries {
                        field[n] = t[s * k + dir];
                    }
                    dirs.push(self.grid.expand(&field, f64::NAN)?);
                }
                Some(dirs)
            }
            None => None,
        };

        Ok(SeedData {
            rhs: self.grid.expand(&rhs, f64::INFINITY)?,
            rhs_tangent,
            seed_tags: self.grid.expand(&tags, true)?,
            interpolation: SeedInterpolation { entries },
            cost_jacobian,
        })
    }
}

/// One layer dilation of a row-major mask with the full `3^d` neighborhood.
pub fn dilate(mask: &[bool], shape: &[usize], periodic: &[bool]) -> Vec<bool> {
    let ndim = shape.len();
    let mut out = mask.to_vec();
    for (flat, _) in mask.iter().enumerate().filter(|&(_, &m)| m) {
        let x = unravel(flat, shape);
        for code in 0..num_displacements(ndim) {
            let delta = displacement(code, ndim);
            let mut y = Vec::with_capacity(ndim);
            for k in 0..ndim {
                let s = shape[k] as isize;
                let yk = x[k] as isize + delta[k] as isize;
                if periodic[k] {
                    y.push(yk.rem_euclid(s) as usize);
                } else if (0..s).contains(&yk) {
                    y.push(yk as usize);
                } else {
                    break;
                }
            }
            if y.len() == ndim {
                out[ravel(&y, shape)] = true;
            }
        }
    }
    out
}
