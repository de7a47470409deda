// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! Block relaxation kernels and the binding that compiles them.
//!
//! A kernel relaxes one block per call. It reads out-of-block neighbors from
//! the immutable launch snapshot and runs `niter_i` Gauss-Seidel sweeps inside
//! the block, alternating the sweep direction. The caller writes the returned
//! block back only after the whole launch completed.

use std::sync::Arc;

use crate::error::{EikonalError, Result};
use crate::grid::{
    displacement, get_bool, num_displacements, unravel, BlockGrid, Int, INVALID_INDEX, MAX_NDIM,
};
use crate::scheme::{Model, Scheme, MAX_SLOTS};

/// Default multiprecision quantum, in units of `h * cost`.
pub const DEFAULT_MULTIP_STEP: f64 = 1.0 / 1024.0;

/// Storage type of primary values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// Values rounded to single precision after every update.
    F32,
    /// Double precision.
    F64,
}

impl Precision {
    /// Parse a `float_t` name.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "float32" => Ok(Precision::F32),
            "float64" => Ok(Precision::F64),
            other => Err(EikonalError::invalid(
                "float_t",
                format!("'{}', expected float32 or float64", other),
            )),
        }
    }

    /// Decimal resolution of the floating type.
    pub fn resolution(self) -> f64 {
        match self {
            Precision::F32 => 1e-6,
            Precision::F64 => 1e-15,
        }
    }

    /// Round a value to the storage type.
    #[inline]
    pub fn round(self, x: f64) -> f64 {
        match self {
            Precision::F32 => (x as f32) as f64,
            Precision::F64 => x,
        }
    }
}

/// Node change test: `|new - old| > atol + rtol * |new|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    /// Absolute tolerance.
    pub atol: f64,
    /// Relative tolerance.
    pub rtol: f64,
}

impl Tolerance {
    /// Tolerance that accepts any value as converged.
    pub fn accept_all() -> Self {
        Tolerance {
            atol: f64::INFINITY,
            rtol: 0.0,
        }
    }

    /// Whether a node moving from `old` to `new` counts as changed.
    ///
    /// Differences of infinities (NaN) count as no change.
    pub fn changed(&self, old: f64, new: f64) -> bool {
        if new.is_nan() || old.is_nan() {
            return false;
        }
        match (old.is_finite(), new.is_finite()) {
            (true, true) => (new - old).abs() > self.atol + self.rtol * new.abs(),
            (false, false) => false,
            _ => self.atol.is_finite(),
        }
    }
}

/// Which equation a kernel relaxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelKind {
    /// The nonlinear eikonal scheme of a model.
    Eikonal(Model),
    /// `diag * x - W x = rhs` on a fixed out-degree graph.
    Linear,
}

/// Compile-time configuration of a kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelTraits {
    /// Equation kind.
    pub kind: KernelKind,
    /// Inner block shape.
    pub shape_i: Vec<usize>,
    /// Gauss-Seidel sweeps per launch.
    pub niter_i: usize,
    /// Periodic axes.
    pub periodic: Vec<bool>,
    /// Primary value storage.
    pub precision: Precision,
    /// Multiprecision quantum, when values carry an integer residual.
    pub multip_step: Option<f64>,
    /// Largest stencil offset per axis.
    pub reach: Vec<usize>,
}

/// Arrays of the eikonal kernel.
#[derive(Debug, Clone)]
pub struct EikonalArgs {
    /// Block decomposition.
    pub grid: BlockGrid,
    /// Local stencils.
    pub scheme: Arc<Scheme>,
    /// Seed values, `+inf` away from seeds, block layout.
    pub rhs: Vec<f64>,
    /// Packed seed tags (seeds and padding), block layout.
    pub seed_tags: Vec<u8>,
}

/// Arrays of a linear kernel.
#[derive(Debug, Clone)]
pub struct LinearArgs {
    /// Block decomposition.
    pub grid: BlockGrid,
    /// Right-hand side, NaN on padding, block layout.
    pub rhs: Vec<f64>,
    /// Diagonal, block layout.
    pub diag: Vec<f64>,
    /// Neighbor indices, `nact` per node.
    pub indices: Vec<Int>,
    /// Neighbor weights, `nact` per node.
    pub weights: Vec<f64>,
    /// Out-degree.
    pub nact: usize,
    /// Packed mask of the nodes with a finite eikonal value, block layout.
    /// Other nodes keep their `+inf` start value.
    pub domain: Vec<u8>,
}

/// Arrays handed to [`KernelBinding::compile`].
#[derive(Debug, Clone)]
pub enum KernelArgs {
    /// Eikonal kernel arrays.
    Eikonal(EikonalArgs),
    /// Linear kernel arrays.
    Linear(LinearArgs),
}

/// Current iterate, block layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Iterate {
    /// Primary values.
    pub values: Vec<f64>,
    /// Integer residuals in units of the multiprecision step.
    pub residuals: Option<Vec<i64>>,
}

impl Iterate {
    /// Iterate with all primary values equal to `fill`.
    pub fn filled(size: usize, fill: f64, multiprecision: bool) -> Self {
        Iterate {
            values: vec![fill; size],
            residuals: multiprecision.then(|| vec![0; size]),
        }
    }

    /// Full value of node `n`, primary plus residual.
    #[inline]
    pub fn value(&self, n: usize, step: f64) -> f64 {
        match &self.residuals {
            Some(r) if r[n] != 0 => self.values[n] + r[n] as f64 * step,
            _ => self.values[n],
        }
    }

    /// All full values.
    pub fn merged(&self, step: f64) -> Vec<f64> {
        (0..self.values.len()).map(|n| self.value(n, step)).collect()
    }
}

/// Flow arrays of one block, node-major inside the block.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlockFlow {
    /// `nslot` weights per node.
    pub weights: Vec<f64>,
    /// `nslot` block-layout indices per node.
    pub indices: Vec<Int>,
    /// `nslot * ndim` offsets per node.
    pub offsets: Vec<i32>,
    /// Weight sum per node.
    pub weightsum: Vec<f64>,
    /// `ndim` components per node.
    pub vector: Vec<f64>,
    /// `∂u/∂r` per node.
    pub rhs_derivative: Vec<f64>,
}

/// Convergence summary of one relaxed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockReport {
    /// Whether any node changed by more than the tolerance.
    pub changed: bool,
    /// Base-3 displacement codes of the neighbor blocks a changed node can reach.
    pub activate: u128,
}

/// Result of relaxing one block.
#[derive(Debug, Clone)]
pub struct BlockOutput {
    /// Outer block index.
    pub block: usize,
    /// New primary values of the block.
    pub values: Vec<f64>,
    /// New residuals of the block.
    pub residuals: Option<Vec<i64>>,
    /// Convergence summary.
    pub report: BlockReport,
    /// Flow arrays, when extraction was requested.
    pub flow: Option<BlockFlow>,
}

/// A compiled block kernel.
pub trait Kernel: Send + Sync {
    /// Kernel name, used in statistics and errors.
    fn name(&self) -> &str;

    /// Block decomposition of the kernel arrays.
    fn grid(&self) -> &BlockGrid;

    /// Blocks holding a node that starts the front: seeds for the eikonal
    /// kernel, nodes without dependencies for linear kernels.
    fn trigger_blocks(&self, iterate: &Iterate) -> Vec<usize>;

    /// Relax one block against the launch snapshot `iterate`.
    fn relax_block(
        &self,
        block: usize,
        iterate: &Iterate,
        tol: Tolerance,
        extract_flow: bool,
    ) -> BlockOutput;
}

/// Compiles kernels from their traits and arrays.
pub trait KernelBinding: Sync {
    /// Compile the kernel `name`.
    ///
    /// # Errors
    /// Returns an error if the traits and arrays are inconsistent.
    fn compile(&self, name: &str, traits: KernelTraits, args: KernelArgs) -> Result<Box<dyn Kernel>>;
}

/// Multithreaded CPU kernels.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBinding;

impl KernelBinding for CpuBinding {
    fn compile(&self, name: &str, traits: KernelTraits, args: KernelArgs) -> Result<Box<dyn Kernel>> {
        let grid = match &args {
            KernelArgs::Eikonal(a) => &a.grid,
            KernelArgs::Linear(a) => &a.grid,
        };
        if traits.shape_i != grid.shape_i() {
            return Err(EikonalError::invalid(
                "shape_i",
                format!(
                    "kernel traits {:?} differ from the grid blocks {:?}",
                    traits.shape_i,
                    grid.shape_i()
                ),
            ));
        }
        if traits.niter_i == 0 {
            return Err(EikonalError::invalid("niter_i", "must be at least 1"));
        }
        if traits.reach.len() != grid.ndim() || traits.periodic.len() != grid.ndim() {
            return Err(EikonalError::invalid("dims", "kernel traits rank mismatch"));
        }
        for (axis, (&reach, &block)) in traits.reach.iter().zip(grid.shape_i()).enumerate() {
            if reach > block {
                return Err(EikonalError::StencilTooWide { axis, reach, block });
            }
        }
        let sweeps = BlockSweeps::new(grid, &traits.reach);

        match (traits.kind, args) {
            (KernelKind::Eikonal(model), KernelArgs::Eikonal(args)) => {
                if model != args.scheme.model() {
                    return Err(EikonalError::invalid(
                        "model",
                        format!("kernel traits {} differ from the scheme {}", model, args.scheme.model()),
                    ));
                }
                let size_tot = args.grid.size_tot();
                if args.rhs.len() != size_tot || args.seed_tags.len() != size_tot.div_ceil(8) {
                    return Err(EikonalError::ShapeMismatch {
                        expected: vec![size_tot],
                        got: vec![args.rhs.len()],
                    });
                }
                Ok(Box::new(EikonalKernel {
                    name: name.to_string(),
                    traits,
                    args,
                    sweeps,
                }))
            }
            (KernelKind::Linear, KernelArgs::Linear(args)) => {
                let size_tot = args.grid.size_tot();
                let nact = args.nact;
                if args.rhs.len() != size_tot
                    || args.diag.len() != size_tot
                    || args.indices.len() != size_tot * nact
                    || args.weights.len() != size_tot * nact
                    || args.domain.len() != size_tot.div_ceil(8)
                {
                    return Err(EikonalError::ShapeMismatch {
                        expected: vec![size_tot, nact],
                        got: vec![args.rhs.len(), args.indices.len()],
                    });
                }
                Ok(Box::new(LinearKernel {
                    name: name.to_string(),
                    traits,
                    args,
                    sweeps,
                }))
            }
            _ => Err(EikonalError::invalid(
                "kernel",
                format!("arrays of kernel {} do not match its kind", name),
            )),
        }
    }
}

/// Block geometry shared by all kernels: sweep orders and activation masks.
#[derive(Debug, Clone)]
struct BlockSweeps {
    grid: BlockGrid,
    reach: Vec<usize>,
    /// Inner node order for each of the `2^ndim` sweep directions.
    orders: Vec<Vec<usize>>,
    /// Inner coordinates of each inner node.
    inner: Vec<Vec<usize>>,
}

impl BlockSweeps {
    fn new(grid: &BlockGrid, reach: &[usize]) -> Self {
        let ndim = grid.ndim();
        let shape_i = grid.shape_i();
        let inner: Vec<Vec<usize>> = (0..grid.size_i()).map(|n| unravel(n, shape_i)).collect();
        let orders = (0..1usize << ndim)
            .map(|dir| {
                inner
                    .iter()
                    .map(|x| {
                        (0..ndim).fold(0, |n, k| {
                            let xk = if (dir >> k) & 1 == 1 {
                                shape_i[k] - 1 - x[k]
                            } else {
                                x[k]
                            };
                            n * shape_i[k] + xk
                        })
                    })
                    .collect()
            })
            .collect();
        BlockSweeps {
            grid: grid.clone(),
            reach: reach.to_vec(),
            orders,
            inner,
        }
    }

    fn order(&self, sweep: usize) -> &[usize] {
        &self.orders[sweep % self.orders.len()]
    }

    /// Full coordinates of every inner node of block `n_o`.
    fn positions(&self, n_o: usize) -> Vec<[isize; MAX_NDIM]> {
        let x_o = self.grid.block_position(n_o);
        let shape_i = self.grid.shape_i();
        self.inner
            .iter()
            .map(|x_i| {
                let mut x = [0isize; MAX_NDIM];
                for k in 0..x_i.len() {
                    x[k] = (x_o[k] * shape_i[k] + x_i[k]) as isize;
                }
                x
            })
            .collect()
    }

    /// Displacement codes of the blocks reachable from the changed nodes.
    fn activation(&self, n_o: usize, changed: &[bool]) -> u128 {
        let ndim = self.grid.ndim();
        let extent = self.grid.block_extent(n_o);
        // Per axis: bit 0 for the lower block, bit 1 for self, bit 2 for the upper block.
        let mut axis_masks: Vec<u8> = Vec::new();
        let mut seen: Vec<Vec<u8>> = Vec::new();
        for (n_i, _) in changed.iter().enumerate().filter(|&(_, &c)| c) {
            axis_masks.clear();
            for k in 0..ndim {
                let x = self.inner[n_i][k];
                let mut m = 0b010;
                if x < self.reach[k] {
                    m |= 0b001;
                }
                if x + self.reach[k] >= extent[k] {
                    m |= 0b100;
                }
                axis_masks.push(m);
            }
            if !seen.contains(&axis_masks) {
                seen.push(axis_masks.clone());
            }
        }
        let mut mask = 0u128;
        for code in 0..num_displacements(ndim) {
            let delta = displacement(code, ndim);
            let reachable = seen.iter().any(|masks| {
                delta
                    .iter()
                    .zip(masks)
                    .all(|(&d, &m)| (m >> (d + 1)) & 1 == 1)
            });
            if reachable {
                mask |= 1u128 << code;
            }
        }
        mask
    }
}

/// Largest residual magnitude, in steps. Residual products stay exact in f64.
pub const MAX_RESIDUAL: f64 = 9_007_199_254_740_992.0;

/// Split a full value into a stored primary value and residual.
///
/// Values beyond [`MAX_RESIDUAL`] steps are stored without residual.
#[inline]
fn quantize(x: f64, precision: Precision, step: Option<f64>) -> (f64, i64) {
    match step {
        Some(step) if x.is_finite() => {
            let q = (x / step).floor();
            if q.abs() > MAX_RESIDUAL {
                return (precision.round(x), 0);
            }
            let uq = q as i64;
            (precision.round(x - uq as f64 * step), uq)
        }
        _ => (precision.round(x), 0),
    }
}

struct EikonalKernel {
    name: String,
    traits: KernelTraits,
    args: EikonalArgs,
    sweeps: BlockSweeps,
}

impl EikonalKernel {
    fn extract_flow(&self, base: usize, local: &[f64], positions: &[[isize; MAX_NDIM]], iterate: &Iterate) -> BlockFlow {
        let grid = &self.args.grid;
        let scheme = &self.args.scheme;
        let ndim = grid.ndim();
        let nslot = scheme.nslot();
        let size_i = grid.size_i();
        let step = self.traits.multip_step.unwrap_or(0.0);
        let value_of = |m: usize| {
            if (base..base + size_i).contains(&m) {
                local[m - base]
            } else {
                iterate.value(m, step)
            }
        };

        let mut flow = BlockFlow {
            weights: vec![0.0; size_i * nslot],
            indices: vec![INVALID_INDEX; size_i * nslot],
            offsets: vec![0; size_i * nslot * ndim],
            weightsum: vec![0.0; size_i],
            vector: vec![0.0; size_i * ndim],
            rhs_derivative: vec![0.0; size_i],
        };
        for n_i in 0..size_i {
            let n_t = base + n_i;
            if get_bool(&self.args.seed_tags, n_t) {
                continue;
            }
            let node = scheme.flow(grid, n_t, &positions[n_i][..ndim], local[n_i], value_of);
            for k in 0..nslot.min(MAX_SLOTS) {
                let slot = n_i * nslot + k;
                flow.weights[slot] = node.weights[k];
                flow.indices[slot] = node.indices[k];
                for axis in 0..ndim {
                    let off = node.offsets[k][axis];
                    flow.offsets[slot * ndim + axis] = off;
                    flow.vector[n_i * ndim + axis] += node.weights[k] * off as f64;
                }
            }
            flow.weightsum[n_i] = node.weightsum;
            flow.rhs_derivative[n_i] = node.rhs_derivative;
        }
        flow
    }
}

impl Kernel for EikonalKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn grid(&self) -> &BlockGrid {
        &self.args.grid
    }

    fn trigger_blocks(&self, _iterate: &Iterate) -> Vec<usize> {
        let grid = &self.args.grid;
        let mut blocks: Vec<usize> = (0..grid.size_tot())
            .filter(|&n| self.args.rhs[n].is_finite() && get_bool(&self.args.seed_tags, n))
            .map(|n| grid.decompose(n).0)
            .collect();
        blocks.dedup();
        blocks
    }

    fn relax_block(
        &self,
        block: usize,
        iterate: &Iterate,
        tol: Tolerance,
        extract_flow: bool,
    ) -> BlockOutput {
        let grid = &self.args.grid;
        let ndim = grid.ndim();
        let size_i = grid.size_i();
        let base = block * size_i;
        let step = self.traits.multip_step;
        let stepv = step.unwrap_or(0.0);
        let positions = self.sweeps.positions(block);

        let initial: Vec<f64> = (base..base + size_i).map(|n| iterate.value(n, stepv)).collect();
        let mut values = iterate.values[base..base + size_i].to_vec();
        let mut residuals = iterate
            .residuals
            .as_ref()
            .map(|r| r[base..base + size_i].to_vec());
        let mut local = initial.clone();

        if extract_flow {
            let flow = self.extract_flow(base, &local, &positions, iterate);
            return BlockOutput {
                block,
                values,
                residuals,
                report: BlockReport::default(),
                flow: Some(flow),
            };
        }

        let fixed: Vec<bool> = (base..base + size_i)
            .map(|n| get_bool(&self.args.seed_tags, n))
            .collect();
        for n_i in 0..size_i {
            if fixed[n_i] {
                let (u, uq) = quantize(self.args.rhs[base + n_i], self.traits.precision, step);
                values[n_i] = u;
                if let Some(r) = residuals.as_mut() {
                    r[n_i] = uq;
                }
                local[n_i] = u + uq as f64 * stepv;
            }
        }

        for sweep in 0..self.traits.niter_i {
            let mut sweep_changed = false;
            for &n_i in self.sweeps.order(sweep) {
                if fixed[n_i] {
                    continue;
                }
                let n_t = base + n_i;
                let old = local[n_i];
                let new = {
                    let value_of = |m: usize| {
                        if (base..base + size_i).contains(&m) {
                            local[m - base]
                        } else {
                            iterate.value(m, stepv)
                        }
                    };
                    self.args
                        .scheme
                        .update(grid, n_t, &positions[n_i][..ndim], value_of)
                };
                let (u, uq) = quantize(new, self.traits.precision, step);
                let stored = u + uq as f64 * stepv;
                if tol.changed(old, stored) {
                    sweep_changed = true;
                }
                values[n_i] = u;
                if let Some(r) = residuals.as_mut() {
                    r[n_i] = uq;
                }
                local[n_i] = stored;
            }
            if !sweep_changed {
                break;
            }
        }

        let changed: Vec<bool> = initial
            .iter()
            .zip(&local)
            .map(|(&old, &new)| tol.changed(old, new))
            .collect();
        let any = changed.iter().any(|&c| c);
        BlockOutput {
            block,
            values,
            residuals,
            report: BlockReport {
                changed: any,
                activate: if any { self.sweeps.activation(block, &changed) } else { 0 },
            },
            flow: None,
        }
    }
}

struct LinearKernel {
    name: String,
    traits: KernelTraits,
    args: LinearArgs,
    sweeps: BlockSweeps,
}

impl Kernel for LinearKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn grid(&self) -> &BlockGrid {
        &self.args.grid
    }

    fn trigger_blocks(&self, _iterate: &Iterate) -> Vec<usize> {
        let nact = self.args.nact;
        let grid = &self.args.grid;
        let mut blocks: Vec<usize> = (0..grid.size_tot())
            .filter(|&n| {
                self.args.rhs[n].is_finite()
                    && get_bool(&self.args.domain, n)
                    && self.args.weights[n * nact..(n + 1) * nact]
                        .iter()
                        .all(|&w| w == 0.0)
            })
            .map(|n| grid.decompose(n).0)
            .collect();
        blocks.dedup();
        blocks
    }

    fn relax_block(
        &self,
        block: usize,
        iterate: &Iterate,
        tol: Tolerance,
        _extract_flow: bool,
    ) -> BlockOutput {
        let size_i = self.args.grid.size_i();
        let nact = self.args.nact;
        let base = block * size_i;
        let initial = iterate.values[base..base + size_i].to_vec();
        let mut local = initial.clone();

        for sweep in 0..self.traits.niter_i {
            let mut sweep_changed = false;
            for &n_i in self.sweeps.order(sweep) {
                let n = base + n_i;
                let rhs = self.args.rhs[n];
                if rhs.is_nan() || !get_bool(&self.args.domain, n) {
                    continue;
                }
                let mut acc = rhs;
                for slot in n * nact..(n + 1) * nact {
                    let w = self.args.weights[slot];
                    let j = self.args.indices[slot];
                    if w == 0.0 || j == INVALID_INDEX {
                        continue;
                    }
                    let j = j as usize;
                    let v = if (base..base + size_i).contains(&j) {
                        local[j - base]
                    } else {
                        iterate.values[j]
                    };
                    acc += w * v;
                }
                let new = self.traits.precision.round(acc / self.args.diag[n]);
                if tol.changed(local[n_i], new) {
                    sweep_changed = true;
                }
                local[n_i] = new;
            }
            if !sweep_changed {
                break;
            }
        }

        let changed: Vec<bool> = initial
            .iter()
            .zip(&local)
            .map(|(&old, &new)| tol.changed(old, new))
            .collect();
        let any = changed.iter().any(|&c| c);
        BlockOutput {
            block,
            values: local,
            residuals: None,
            report: BlockReport {
                changed: any,
                activate: if any { self.sweeps.activation(block, &changed) } else { 0 },
            },
            flow: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::displacement_code;
    use crate::metric::{Field, MetricField};
    use approx::assert_relative_eq;

    fn eikonal_kernel(shape: &[usize], shape_i: &[usize], seed: &[usize]) -> (Box<dyn Kernel>, Iterate) {
        let ndim = shape.len();
        let grid = BlockGrid::new(shape, shape_i).unwrap();
        let periodic = vec![false; ndim];
        let metrics = MetricField::new(
            Model::Isotropic(ndim),
            shape,
            &periodic,
            Field::constant(vec![]),
            Field::constant(vec![1.0]),
        )
        .unwrap();
        let scheme = Arc::new(Scheme::build(&grid, &metrics, 1.0).unwrap());
        let mut rhs = vec![f64::INFINITY; grid.size_tot()];
        let mut tags: Vec<bool> = (0..grid.size_tot()).map(|n| !grid.in_domain(n)).collect();
        let s = grid.block_index(seed);
        rhs[s] = 0.0;
        tags[s] = true;
        let traits = KernelTraits {
            kind: KernelKind::Eikonal(Model::Isotropic(ndim)),
            shape_i: shape_i.to_vec(),
            niter_i: 16,
            periodic,
            precision: Precision::F64,
            multip_step: None,
            reach: scheme.reach().to_vec(),
        };
        let args = KernelArgs::Eikonal(EikonalArgs {
            seed_tags: grid.pack_bits(&tags),
            grid: grid.clone(),
            scheme,
            rhs,
        });
        let kernel = CpuBinding.compile("eikonal", traits, args).unwrap();
        let iterate = Iterate::filled(grid.size_tot(), f64::INFINITY, false);
        (kernel, iterate)
    }

    #[test]
    fn tolerance_change_test() {
        let tol = Tolerance { atol: 1e-3, rtol: 0.0 };
        assert!(tol.changed(1.0, 1.01));
        assert!(!tol.changed(1.0, 1.0005));
        assert!(tol.changed(f64::INFINITY, 3.0));
        assert!(!tol.changed(f64::INFINITY, f64::INFINITY));
        assert!(!Tolerance::accept_all().changed(f64::INFINITY, 3.0));
    }

    #[test]
    fn quantize_multiprecision() {
        let step = 1.0 / 1024.0;
        let (u, uq) = quantize(1000.123456789, Precision::F32, Some(step));
        assert!(u >= 0.0 && u < step);
        assert_relative_eq!(u + uq as f64 * step, 1000.123456789, epsilon = 1e-9);
        let (u, uq) = quantize(f64::INFINITY, Precision::F32, Some(step));
        assert_eq!((u, uq), (f64::INFINITY, 0));
    }

    #[test]
    fn f32_rounding() {
        let x = 0.1f64;
        assert_eq!(Precision::F32.round(x), 0.1f32 as f64);
        assert_eq!(Precision::F64.round(x), x);
        assert!(Precision::parse("float16").is_err());
    }

    #[test]
    fn sweep_orders_are_permutations() {
        let grid = BlockGrid::new(&[8, 8], &[4, 2]).unwrap();
        let sweeps = BlockSweeps::new(&grid, &[1, 1]);
        assert_eq!(sweeps.orders.len(), 4);
        for order in &sweeps.orders {
            let mut sorted = order.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, (0..8).collect::<Vec<_>>());
        }
        assert_eq!(sweeps.order(3)[0], 7);
    }

    #[test]
    fn activation_reaches_faces_and_corners() {
        let grid = BlockGrid::new(&[16, 16], &[8, 8]).unwrap();
        let sweeps = BlockSweeps::new(&grid, &[1, 1]);
        // Corner node of block 0 changed.
        let mut changed = vec![false; 64];
        changed[63] = true;
        let mask = sweeps.activation(0, &changed);
        for delta in [[0, 0], [1, 0], [0, 1], [1, 1]] {
            assert!(mask & (1 << displacement_code(&delta)) != 0, "{:?}", delta);
        }
        assert_eq!(mask & (1 << displacement_code(&[-1, 0])), 0);
        // Interior node only keeps the block itself active.
        let mut changed = vec![false; 64];
        changed[3 * 8 + 3] = true;
        assert_eq!(sweeps.activation(0, &changed), 1 << displacement_code(&[0, 0]));
    }

    #[test]
    fn relax_single_block_converges() {
        let (kernel, iterate) = eikonal_kernel(&[8, 8], &[8, 8], &[0, 0]);
        assert_eq!(kernel.trigger_blocks(&iterate), vec![0]);
        let out = kernel.relax_block(0, &iterate, Tolerance { atol: 1e-12, rtol: 0.0 }, false);
        assert!(out.report.changed);
        let grid = kernel.grid();
        assert_eq!(out.values[grid.block_index(&[0, 0])], 0.0);
        assert_relative_eq!(out.values[grid.block_index(&[0, 5])], 5.0);
        assert_relative_eq!(out.values[grid.block_index(&[1, 1])], 1.0 + 0.5f64.sqrt());
    }

    #[test]
    fn flow_extraction_keeps_values() {
        let (kernel, iterate) = eikonal_kernel(&[8, 8], &[8, 8], &[0, 0]);
        let tol = Tolerance { atol: 1e-12, rtol: 0.0 };
        let out = kernel.relax_block(0, &iterate, tol, false);
        let solved = Iterate {
            values: out.values.clone(),
            residuals: None,
        };
        let flow_out = kernel.relax_block(0, &solved, Tolerance::accept_all(), true);
        assert_eq!(flow_out.values, out.values);
        assert!(!flow_out.report.changed);
        let flow = flow_out.flow.unwrap();
        let grid = kernel.grid();
        assert_eq!(flow.weightsum[grid.block_index(&[0, 0])], 0.0);
        let n = grid.block_index(&[0, 3]);
        assert_relative_eq!(flow.weightsum[n], 1.0);
        // Upwind neighbor is (0, 2), one step back along axis 1.
        assert_eq!(flow.vector[2 * n..2 * n + 2], [0.0, -1.0]);
    }

    #[test]
    fn compile_rejects_mismatched_arrays() {
        let grid = BlockGrid::new(&[8, 8], &[8, 8]).unwrap();
        let traits = KernelTraits {
            kind: KernelKind::Linear,
            shape_i: vec![8, 8],
            niter_i: 4,
            periodic: vec![false, false],
            precision: Precision::F64,
            multip_step: None,
            reach: vec![1, 1],
        };
        let args = KernelArgs::Linear(LinearArgs {
            grid: grid.clone(),
            rhs: vec![0.0; 64],
            diag: vec![1.0; 64],
            indices: vec![INVALID_INDEX; 10],
            weights: vec![0.0; 10],
            nact: 2,
            domain: grid.pack_bits(&[true; 64]),
        });
        assert!(matches!(
            CpuBinding.compile("forwardAD", traits, args),
            Err(EikonalError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn linear_chain_solves_in_one_block() {
        // x0 = 1, x_{n} = 1 + 0.5 x_{n-1} along a 1-D grid.
        let grid = BlockGrid::new(&[8], &[8]).unwrap();
        let mut indices = vec![INVALID_INDEX; 8];
        let mut weights = vec![0.0; 8];
        for n in 1..8 {
            indices[n] = (n - 1) as Int;
            weights[n] = 0.5;
        }
        let traits = KernelTraits {
            kind: KernelKind::Linear,
            shape_i: vec![8],
            niter_i: 16,
            periodic: vec![false],
            precision: Precision::F64,
            multip_step: None,
            reach: vec![1],
        };
        let args = KernelArgs::Linear(LinearArgs {
            domain: grid.pack_bits(&[true; 8]),
            grid,
            rhs: vec![1.0; 8],
            diag: vec![1.0; 8],
            indices,
            weights,
            nact: 1,
        });
        let kernel = CpuBinding.compile("forwardAD", traits, args).unwrap();
        let iterate = Iterate::filled(8, f64::INFINITY, false);
        assert_eq!(kernel.trigger_blocks(&iterate), vec![0]);
        let out = kernel.relax_block(0, &iterate, Tolerance { atol: 1e-14, rtol: 0.0 }, false);
        let mut expected = 1.0;
        for n in 0..8 {
            assert_relative_eq!(out.values[n], expected);
            expected = 1.0 + 0.5 * expected;
        }
    }

    #[test]
    fn linear_nodes_outside_domain_stay_infinite() {
        // Two independent nodes with finite rhs; only the first one was reached.
        let grid = BlockGrid::new(&[16], &[8]).unwrap();
        let mut domain = vec![false; 16];
        domain[..8].fill(true);
        let traits = KernelTraits {
            kind: KernelKind::Linear,
            shape_i: vec![8],
            niter_i: 4,
            periodic: vec![false],
            precision: Precision::F64,
            multip_step: None,
            reach: vec![1],
        };
        let args = KernelArgs::Linear(LinearArgs {
            domain: grid.pack_bits(&domain),
            grid,
            rhs: vec![2.0; 16],
            diag: vec![1.0; 16],
            indices: vec![INVALID_INDEX; 16],
            weights: vec![0.0; 16],
            nact: 1,
        });
        let kernel = CpuBinding.compile("forwardAD", traits, args).unwrap();
        let iterate = Iterate::filled(16, f64::INFINITY, false);
        assert_eq!(kernel.trigger_blocks(&iterate), vec![0]);
        let tol = Tolerance { atol: 1e-14, rtol: 0.0 };
        assert!(kernel.relax_block(0, &iterate, tol, false).values.iter().all(|&v| v == 2.0));
        let walls = kernel.relax_block(1, &iterate, tol, false);
        assert!(walls.values.iter().all(|v| v.is_infinite()));
        assert!(!walls.report.changed);
    }

    #[test]
    fn quantize_keeps_large_residuals() {
        let step = 1e-6;
        let x = 3.0e4 + 0.123456789;
        let (u, uq) = quantize(x, Precision::F32, Some(step));
        assert!(uq > i32::MAX as i64);
        assert_relative_eq!(u + uq as f64 * step, x, epsilon = 1e-10);
        // Beyond the exact residual range the value is stored without residual.
        let (u, uq) = quantize(1e300, Precision::F64, Some(step));
        assert_eq!((u, uq), (1e300, 0));
    }
}
