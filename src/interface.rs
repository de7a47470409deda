// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! End-to-end run: geometry, seeds, eikonal solve, flow and differentiation.

use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};
use tracing::info;

use crate::ad::{mean_finite_abs, Ad, DifferentiationEngine, LinearTolerance, LINEAR_RTOL_FACTOR};
use crate::error::{EikonalError, Result};
use crate::flow::{extract_flow, FlowGraph};
use crate::grid::BlockGrid;
use crate::input::{HfmInput, KeyReport, RunContext};
use crate::kernel::{
    CpuBinding, EikonalArgs, Iterate, Kernel, KernelArgs, KernelBinding, KernelKind, KernelTraits,
    Precision, Tolerance, DEFAULT_MULTIP_STEP,
};
use crate::metric::{Field, MetricField};
use crate::scheme::{Model, Scheme};
use crate::seeds::{dilate, SeedBuilder, SeedData, SeedInterpolation, SeedSet};
use crate::solver::{FrontPropagationSolver, Schedule, SolveStats, DEFAULT_NITERMAX_O};

/// Default eikonal tolerance, in units of the floating resolution times `h * cost`.
const TOL_FACTOR: f64 = 5.0;

/// Output of a run.
#[derive(Debug, Clone)]
pub struct Report {
    /// Value field, with its variation `(dims.., k)` when forward
    /// differentiation was requested.
    pub values: Option<Ad<ArrayD<f64>>>,
    /// Geodesic flow `(dims.., ndim)`.
    pub flow: Option<ArrayD<f64>>,
    /// Sensitivity to the cost, shaped like `sensitivity`.
    pub cost_sensitivity: Option<ArrayD<f64>>,
    /// Sensitivity to the seed values, `(n)` or `(n, k)`.
    pub seed_value_sensitivity: Option<ArrayD<f64>>,
    /// Statistics of every kernel run, in execution order.
    pub kernel_stats: Vec<SolveStats>,
    /// Key usage.
    pub keys: KeyReport,
    /// Warnings raised during the run.
    pub warnings: Vec<String>,
}

impl Report {
    /// The value field.
    pub fn value_field(&self) -> Option<&ArrayD<f64>> {
        self.values.as_ref().map(Ad::value)
    }

    /// First order variation of the values, `(dims.., k)`.
    pub fn value_variation(&self) -> Option<&ArrayD<f64>> {
        self.values.as_ref().and_then(Ad::tangent)
    }

    /// Statistics of the first run of `kernel`.
    pub fn stats(&self, kernel: &str) -> Option<&SolveStats> {
        self.kernel_stats.iter().find(|s| s.kernel == kernel)
    }
}

/// Run with the bundled CPU kernels.
pub fn run_cpu(input: &HfmInput) -> Result<Report> {
    run(input, &CpuBinding)
}

/// Solve the eikonal problem described by `input`.
///
/// # Errors
/// Configuration errors are raised before any kernel launch. A
/// `ConvergenceFailure` is raised when a kernel exhausts its budget and
/// `raiseOnNonConvergence` holds.
pub fn run(input: &HfmInput, binding: &dyn KernelBinding) -> Result<Report> {
    let mut ctx = RunContext::new(input)?;
    let ordering = ctx.str_or("arrayOrdering", "RowMajor")?;
    if ordering != "RowMajor" {
        return Err(EikonalError::UnsupportedOrdering(ordering));
    }
    let model = Model::parse(&ctx.str("model")?)?;

    let setup = Setup::read(&mut ctx, model)?;
    let problem = Problem::prepare(&mut ctx, &setup)?;

    let mut state = Run {
        setup,
        problem,
        kernel_stats: Vec::new(),
    };
    let values = state.solve_eikonal(&mut ctx, binding)?;
    let report = state.post_process(&mut ctx, binding, values)?;
    let (keys, warnings) = ctx.finish();
    Ok(Report {
        keys,
        warnings,
        ..report
    })
}

/// Grid, metric, stencil and kernel configuration.
struct Setup {
    model: Model,
    grid: BlockGrid,
    metrics: MetricField,
    scheme: Arc<Scheme>,
    h: f64,
    origin: Vec<f64>,
    traits: KernelTraits,
    solver: FrontPropagationSolver,
    cost_scale: f64,
}

impl Setup {
    fn read(ctx: &mut RunContext<'_>, model: Model) -> Result<Self> {
        let dims = ctx.array_required("dims")?;
        let shape = to_counts("dims", &dims)?;
        let ndim = shape.len();
        if ndim != model.ndim() {
            return Err(EikonalError::invalid(
                "dims",
                format!("{} dimensions for model {}", ndim, model),
            ));
        }

        // Kernel traits
        let precision = Precision::parse(&ctx.str_or("float_t", "float64")?)?;
        let schedule = Schedule::parse(&ctx.str_or("solver", "AGSI")?)?;
        let shape_i = match ctx.array("shape_i")? {
            Some(a) => to_counts("shape_i", &a)?,
            None => {
                let default = BlockGrid::default_shape_i(ndim);
                ctx.defaulted("shape_i", format!("{:?}", default));
                default
            }
        };
        let niter_default = 2 * shape_i.iter().copied().max().unwrap_or(1);
        let niter_i = ctx.count_or("niter_i", niter_default)?;
        let nitermax_o = ctx.count_or("nitermax_o", DEFAULT_NITERMAX_O)?;
        let raise = ctx.bool_or("raiseOnNonConvergence", true)?;
        let multiprecision = ctx.bool_or("multiprecision", false)?;

        // Geometry
        let h = ctx.float_or("gridScale", 1.0)?;
        if h <= 0.0 || !h.is_finite() {
            return Err(EikonalError::invalid("gridScale", format!("{} is not positive", h)));
        }
        let origin = match ctx.array("origin")? {
            Some(a) => vector_of("origin", &a, ndim)?,
            None => {
                ctx.defaulted("origin", format!("{:?}", vec![0.0; ndim]));
                vec![0.0; ndim]
            }
        };
        let periodic: Vec<bool> = match ctx.array("periodic")? {
            Some(a) => vector_of("periodic", &a, ndim)?.iter().map(|&p| p != 0.0).collect(),
            None => {
                ctx.defaulted("periodic", format!("{:?}", vec![false; ndim]));
                vec![false; ndim]
            }
        };
        let grid = BlockGrid::new(&shape, &shape_i)?.with_periodic(&periodic)?;

        let cost = read_cost(ctx, &shape)?;
        let params = match model.param_count() {
            0 => Field::constant(Vec::new()),
            p => match ctx.array("metric")? {
                Some(a) => field_of("metric", &a, &shape, p)?,
                None => {
                    ctx.defaulted("metric", format!("{:?}", model.default_params()));
                    Field::constant(model.default_params())
                }
            },
        };
        let cost_scale = mean_positive_finite(&cost, &shape);
        let metrics = MetricField::new(model, &shape, &periodic, params, cost)?;
        let scheme = Arc::new(Scheme::build(&grid, &metrics, h)?);

        let multip_step = if multiprecision {
            let step = ctx.float_or("multip_step", DEFAULT_MULTIP_STEP)?;
            if step <= 0.0 || !step.is_finite() {
                return Err(EikonalError::invalid("multip_step", "must be positive"));
            }
            Some(step * h * cost_scale)
        } else {
            None
        };

        let traits = KernelTraits {
            kind: KernelKind::Eikonal(model),
            shape_i,
            niter_i,
            periodic,
            precision,
            multip_step,
            reach: scheme.reach().to_vec(),
        };
        let solver = FrontPropagationSolver::new(schedule)
            .with_nitermax_o(nitermax_o)
            .with_raise_on_non_convergence(raise);

        Ok(Setup {
            model,
            grid,
            metrics,
            scheme,
            h,
            origin,
            traits,
            solver,
            cost_scale,
        })
    }
}

/// Boundary data and requested derivatives.
struct Problem {
    seeds: Option<SeedSet>,
    data: SeedData,
    /// Extra adaptive start blocks from the trigger mask.
    trigger_blocks: Vec<usize>,
    initial_values: Option<Vec<f64>>,
    cost_variation: Vec<Vec<f64>>,
    /// Row-major reverse right-hand sides, and whether a single field without
    /// a trailing axis was given.
    sensitivity: Option<(Vec<Vec<f64>>, bool)>,
}

impl Problem {
    fn prepare(ctx: &mut RunContext<'_>, setup: &Setup) -> Result<Self> {
        if ctx.verbosity() >= 1.0 {
            info!("Preparing the problem rhs");
        }
        let grid = &setup.grid;
        let shape = grid.shape().to_vec();
        let ndim = shape.len();
        let nnodes = grid.num_nodes();

        let initial_values = match ctx.array("values")? {
            Some(a) => {
                check_shape("values", &a, &shape)?;
                Some(grid.expand(&a.iter().copied().collect::<Vec<_>>(), f64::INFINITY)?)
            }
            None => None,
        };

        let seeds = match ctx.array("seeds")? {
            Some(points) => {
                let pts = rows_of("seeds", &points, ndim)?;
                let n = pts.len();
                let values = match ctx.array("seedValues")? {
                    Some(v) => vector_of("seedValues", &v, n)?,
                    None => {
                        ctx.defaulted("seedValues", "zeros");
                        vec![0.0; n]
                    }
                };
                let values = match ctx.array("seedValueVariation")? {
                    Some(var) => {
                        let k = var.len().checked_div(n).unwrap_or(0);
                        if var.shape().first() != Some(&n) || n * k != var.len() {
                            return Err(EikonalError::ShapeMismatch {
                                expected: vec![n, k],
                                got: var.shape().to_vec(),
                            });
                        }
                        Ad::WithTangent(values, var.iter().copied().collect())
                    }
                    None => Ad::Plain(values),
                };
                Some(SeedSet { points: pts, values })
            }
            None => None,
        };

        let data = match &seeds {
            Some(seeds) => {
                let radius = ctx.float_or("seedRadius", 0.0)?;
                SeedBuilder::new(grid, &setup.metrics, setup.h)
                    .with_origin(&setup.origin)
                    .with_radius(radius)
                    .build(seeds)?
            }
            None => SeedData {
                rhs: vec![f64::INFINITY; grid.size_tot()],
                rhs_tangent: None,
                seed_tags: grid.expand(&vec![false; nnodes], true)?,
                interpolation: SeedInterpolation::default(),
                cost_jacobian: Vec::new(),
            },
        };

        let trigger_blocks = match ctx.mask("trigger")? {
            Some(mask) => {
                if mask.shape() != shape.as_slice() {
                    return Err(EikonalError::ShapeMismatch {
                        expected: shape.clone(),
                        got: mask.shape().to_vec(),
                    });
                }
                let flat: Vec<bool> = mask.iter().copied().collect();
                let dilated = dilate(&flat, &shape, grid.periodic());
                let mut blocks: Vec<usize> = (0..nnodes)
                    .filter(|&n| dilated[n])
                    .map(|n| grid.decompose(grid.flat_to_block(n)).0)
                    .collect();
                blocks.sort_unstable();
                blocks.dedup();
                blocks
            }
            None if seeds.is_none() && setup.solver.schedule().is_adaptive() => {
                return Err(EikonalError::MissingKey("trigger".to_string()));
            }
            None => Vec::new(),
        };

        let cost_variation = match ctx.array("costVariation")? {
            Some(var) => {
                if setup.model.is_rander() {
                    return Err(EikonalError::invalid(
                        "costVariation",
                        "the cost of a Rander model is folded into its metric",
                    ));
                }
                split_directions("costVariation", &var, &shape)?
                    .iter()
                    .map(|d| grid.expand(d, f64::NAN))
                    .collect::<Result<Vec<_>>>()?
            }
            None => Vec::new(),
        };

        let sensitivity = match ctx.array("sensitivity")? {
            Some(sens) if sens.shape() == shape.as_slice() => {
                Some((vec![sens.iter().copied().collect()], true))
            }
            Some(sens) => Some((split_directions("sensitivity", &sens, &shape)?, false)),
            None => None,
        };
        Ok(Problem {
            seeds,
            data,
            trigger_blocks,
            initial_values,
            cost_variation,
            sensitivity,
        })
    }

    fn forward_ad(&self) -> bool {
        self.data.rhs_tangent.is_some() || !self.cost_variation.is_empty()
    }

    fn reverse_ad(&self) -> bool {
        self.sensitivity.is_some()
    }
}

struct Run {
    setup: Setup,
    problem: Problem,
    kernel_stats: Vec<SolveStats>,
}

impl Run {
    fn record(&mut self, ctx: &mut RunContext<'_>, stats: SolveStats) {
        if !stats.converged {
            ctx.warn(format!(
                "Solver {:?} for kernel {} did not reach convergence after {} iterations",
                self.setup.solver.schedule(),
                stats.kernel,
                stats.niter_o
            ));
        }
        self.kernel_stats.push(stats);
    }

    fn compile_eikonal(&self, binding: &dyn KernelBinding) -> Result<Box<dyn Kernel>> {
        let grid = &self.setup.grid;
        binding.compile(
            "eikonal",
            self.setup.traits.clone(),
            KernelArgs::Eikonal(EikonalArgs {
                grid: grid.clone(),
                scheme: Arc::clone(&self.setup.scheme),
                rhs: self.problem.data.rhs.clone(),
                seed_tags: grid.pack_bits(&self.problem.data.seed_tags),
            }),
        )
    }

    fn solve_eikonal(&mut self, ctx: &mut RunContext<'_>, binding: &dyn KernelBinding) -> Result<Iterate> {
        let precision = self.setup.traits.precision;
        let default_tol = TOL_FACTOR * precision.resolution() * self.setup.h * self.setup.cost_scale;
        let tol = Tolerance {
            atol: ctx.float_or("tol", default_tol)?,
            rtol: 0.0,
        };

        let kernel = self.compile_eikonal(binding)?;
        let grid = &self.setup.grid;
        let mut iterate = Iterate::filled(
            grid.size_tot(),
            f64::INFINITY,
            self.setup.traits.multip_step.is_some(),
        );
        if let Some(values) = &self.problem.initial_values {
            iterate.values.copy_from_slice(values);
        }
        let mut initial = kernel.trigger_blocks(&iterate);
        initial.extend_from_slice(&self.problem.trigger_blocks);

        let verb = ctx.verbosity() >= 1.0;
        if verb {
            info!("Running the eikonal kernel");
        }
        let stats = self.setup.solver.solve(kernel.as_ref(), &mut iterate, tol, &initial)?;
        if verb {
            info!(
                "Kernel eikonal ran for {:.3} seconds and {} iterations",
                stats.time.as_secs_f64(),
                stats.niter_o
            );
        }
        self.record(ctx, stats);
        Ok(iterate)
    }

    fn post_process(
        &mut self,
        ctx: &mut RunContext<'_>,
        binding: &dyn KernelBinding,
        iterate: Iterate,
    ) -> Result<Report> {
        if ctx.verbosity() >= 1.0 {
            info!("Post-Processing");
        }
        let grid = self.setup.grid.clone();
        let shape = grid.shape().to_vec();
        let ndim = shape.len();

        let values = match self.setup.traits.multip_step {
            Some(step) => {
                let merged = iterate.merged(step);
                if ctx.bool_or("values_float64", false)? {
                    merged
                } else {
                    let precision = self.setup.traits.precision;
                    merged.into_iter().map(|v| precision.round(v)).collect()
                }
            }
            None => iterate.values.clone(),
        };
        let values = to_array(&shape, grid.squeeze(&values)?)?;

        let export_values = ctx.bool_or("exportValues", true)?;
        let export_flow = ctx.bool_or("exportGeodesicFlow", false)?;
        let forward = self.problem.forward_ad();
        let reverse = self.problem.reverse_ad();

        let mut report = Report {
            values: None,
            flow: None,
            cost_sensitivity: None,
            seed_value_sensitivity: None,
            kernel_stats: Vec::new(),
            keys: KeyReport::default(),
            warnings: Vec::new(),
        };

        let mut flow_graph = None;
        if export_flow || forward || reverse {
            let kernel = self.compile_eikonal(binding)?;
            let (mut graph, stats) = extract_flow(&self.setup.solver, kernel.as_ref(), &iterate)?;
            self.kernel_stats.push(SolveStats {
                kernel: "flow".to_string(),
                ..stats
            });
            if self.setup.model.is_rander() {
                graph.correct_rander(&grid, &self.setup.metrics)?;
            }
            if export_flow {
                let mut flow_shape = shape.clone();
                flow_shape.push(ndim);
                report.flow = Some(to_array(&flow_shape, graph.geodesic_flow(&grid, self.setup.h))?);
            }
            flow_graph = Some(graph);
        }

        let mut value_field = Ad::Plain(values);
        if let Some(graph) = flow_graph.filter(|_| forward || reverse) {
            let precision = self.setup.traits.precision;
            let rtol = ctx.float_or("linear_rtol", LINEAR_RTOL_FACTOR * precision.resolution())?;
            let atol = ctx.float_opt("linear_atol")?;
            if atol.is_none() {
                ctx.defaulted("linear_atol", format!("{:e} * mean(|finite rhs|)", rtol));
            }
            let tol = LinearTolerance { rtol, atol };
            if forward {
                let variation = self.forward(ctx, binding, &graph, tol)?;
                value_field = value_field.with_tangent(variation);
            }
            if reverse {
                self.reverse(ctx, binding, &graph, tol, &mut report)?;
            }
        }

        if export_values {
            report.values = Some(value_field);
        }
        report.kernel_stats = std::mem::take(&mut self.kernel_stats);
        Ok(report)
    }

    fn engine<'a>(
        &'a self,
        binding: &'a dyn KernelBinding,
        graph: &'a FlowGraph,
        tol: LinearTolerance,
    ) -> DifferentiationEngine<'a> {
        DifferentiationEngine::new(
            binding,
            &self.setup.solver,
            &self.setup.grid,
            graph,
            &self.setup.traits,
            self.setup.h,
            tol,
        )
        .with_seed_cost_jacobian(self.seed_cost_jacobian())
    }

    /// Seed cost jacobian in block layout.
    fn seed_cost_jacobian(&self) -> Vec<(usize, usize, f64)> {
        let grid = &self.setup.grid;
        self.problem
            .data
            .cost_jacobian
            .iter()
            .map(|&(n, m, d)| (grid.flat_to_block(n), grid.flat_to_block(m), d))
            .collect()
    }

    fn forward(
        &mut self,
        ctx: &mut RunContext<'_>,
        binding: &dyn KernelBinding,
        graph: &FlowGraph,
        tol: LinearTolerance,
    ) -> Result<ArrayD<f64>> {
        let seed_tangents = self.problem.data.rhs_tangent.clone().unwrap_or_default();
        let cost_tangents = &self.problem.cost_variation;
        if !seed_tangents.is_empty() && !cost_tangents.is_empty() && seed_tangents.len() != cost_tangents.len() {
            return Err(EikonalError::ShapeMismatch {
                expected: vec![seed_tangents.len()],
                got: vec![cost_tangents.len()],
            });
        }
        if ctx.verbosity() >= 2.0 {
            info!("Running the forwardAD kernel");
        }
        let (tangents, stats) = self
            .engine(binding, graph, tol)
            .forward(&seed_tangents, cost_tangents)?;
        for s in stats {
            self.record(ctx, s);
        }
        let mut shape = self.setup.grid.shape().to_vec();
        shape.push(tangents.len());
        to_array(&shape, self.interleave(&tangents)?)
    }

    fn reverse(
        &mut self,
        ctx: &mut RunContext<'_>,
        binding: &dyn KernelBinding,
        graph: &FlowGraph,
        tol: LinearTolerance,
        report: &mut Report,
    ) -> Result<()> {
        let grid = &self.setup.grid;
        let shape = grid.shape().to_vec();
        let Some((directions, single)) = self.problem.sensitivity.as_ref() else {
            return Ok(());
        };
        let single = *single;
        let rhs: Vec<Vec<f64>> = directions
            .iter()
            .map(|d| grid.expand(d, 0.0))
            .collect::<Result<_>>()?;

        if ctx.verbosity() >= 2.0 {
            info!("Running the reverseAD kernel");
        }
        let engine = self.engine(binding, graph, tol);
        let (adjoints, stats) = engine.reverse(&rhs)?;
        let cost: Vec<Vec<f64>> = adjoints
            .iter()
            .map(|y| engine.cost_sensitivity(y, &self.problem.data.seed_tags))
            .collect();
        let k = adjoints.len();

        let seed_sens = match &self.problem.seeds {
            Some(seeds) => {
                let mut out = vec![0.0; seeds.len() * k];
                for (dir, y) in adjoints.iter().enumerate() {
                    let y = grid.squeeze(y)?;
                    let per_seed = self.problem.data.interpolation.gather(&y, seeds.len());
                    for (s, v) in per_seed.into_iter().enumerate() {
                        out[s * k + dir] = v;
                    }
                }
                let sens_shape = if single { vec![seeds.len()] } else { vec![seeds.len(), k] };
                Some(to_array(&sens_shape, out)?)
            }
            None => None,
        };

        let cost_sens = if self.setup.model.is_rander() {
            None
        } else {
            let data = self.interleave(&cost)?;
            let mut cost_shape = shape.clone();
            if !single {
                cost_shape.push(k);
            }
            Some(to_array(&cost_shape, data)?)
        };

        for s in stats {
            self.record(ctx, s);
        }
        report.cost_sensitivity = cost_sens;
        report.seed_value_sensitivity = seed_sens;
        Ok(())
    }

    /// Row-major `(dims.., k)` data from `k` block-layout fields.
    fn interleave(&self, fields: &[Vec<f64>]) -> Result<Vec<f64>> {
        let k = fields.len();
        let nnodes = self.setup.grid.num_nodes();
        let mut out = vec![0.0; nnodes * k];
        for (dir, field) in fields.iter().enumerate() {
            for (n, v) in self.setup.grid.squeeze(field)?.into_iter().enumerate() {
                out[n * k + dir] = v;
            }
        }
        Ok(out)
    }
}

fn to_array(shape: &[usize], data: Vec<f64>) -> Result<ArrayD<f64>> {
    let len = data.len();
    ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| EikonalError::ShapeMismatch {
        expected: shape.to_vec(),
        got: vec![len],
    })
}

fn check_shape(key: &str, arr: &ArrayD<f64>, shape: &[usize]) -> Result<()> {
    if arr.shape() != shape {
        return Err(EikonalError::invalid(
            key,
            format!("shape {:?} differs from the grid {:?}", arr.shape(), shape),
        ));
    }
    Ok(())
}

/// Positive integers of a 1-D array.
fn to_counts(key: &str, arr: &ArrayD<f64>) -> Result<Vec<usize>> {
    if arr.ndim() != 1 {
        return Err(EikonalError::invalid(key, "expected a 1-D array"));
    }
    arr.iter()
        .map(|&x| {
            if x >= 1.0 && x.fract() == 0.0 && x.is_finite() {
                Ok(x as usize)
            } else {
                Err(EikonalError::invalid(key, format!("{} is not a positive integer", x)))
            }
        })
        .collect()
}

/// Exactly `n` values.
fn vector_of(key: &str, arr: &ArrayD<f64>, n: usize) -> Result<Vec<f64>> {
    if arr.len() != n || arr.ndim() > 1 {
        return Err(EikonalError::invalid(
            key,
            format!("shape {:?}, expected ({})", arr.shape(), n),
        ));
    }
    Ok(arr.iter().copied().collect())
}

/// Rows of a `(n, d)` array; a single point may be given as a 1-D array.
fn rows_of(key: &str, arr: &ArrayD<f64>, d: usize) -> Result<Vec<Vec<f64>>> {
    let rows = match arr.shape() {
        [n] if *n == d => 1,
        [n, m] if *m == d => *n,
        other => {
            return Err(EikonalError::invalid(
                key,
                format!("shape {:?}, expected (n, {})", other, d),
            ))
        }
    };
    let flat: Vec<f64> = arr.iter().copied().collect();
    Ok((0..rows).map(|r| flat[r * d..(r + 1) * d].to_vec()).collect())
}

/// Per direction row-major fields of a `(dims.., k)` array.
fn split_directions(key: &str, arr: &ArrayD<f64>, shape: &[usize]) -> Result<Vec<Vec<f64>>> {
    let ndim = shape.len();
    if arr.ndim() != ndim + 1 || &arr.shape()[..ndim] != shape {
        return Err(EikonalError::invalid(
            key,
            format!("shape {:?} does not start with the grid {:?}", arr.shape(), shape),
        ));
    }
    let k = arr.shape()[ndim];
    let flat: Vec<f64> = arr.iter().copied().collect();
    let nnodes = flat.len() / k.max(1);
    Ok((0..k)
        .map(|dir| (0..nnodes).map(|n| flat[n * k + dir]).collect())
        .collect())
}

/// Constant tuple or per node tuples of `p` components.
fn field_of(key: &str, arr: &ArrayD<f64>, shape: &[usize], p: usize) -> Result<Field> {
    let data: Vec<f64> = arr.iter().copied().collect();
    if arr.ndim() <= 1 && data.len() == p {
        return Ok(Field::constant(data));
    }
    let mut expected = shape.to_vec();
    if p != 1 {
        expected.push(p);
    }
    if arr.shape() != expected.as_slice() {
        return Err(EikonalError::invalid(
            key,
            format!("shape {:?}, expected ({}) or {:?}", arr.shape(), p, expected),
        ));
    }
    Ok(Field::per_node(p, data))
}

/// `cost`, or the inverse of `speed`, defaulting to 1.
fn read_cost(ctx: &mut RunContext<'_>, shape: &[usize]) -> Result<Field> {
    if let Some(cost) = ctx.array("cost")? {
        return field_of("cost", &cost, shape, 1);
    }
    if let Some(speed) = ctx.array("speed")? {
        return field_of("speed", &speed.mapv(|s| 1.0 / s), shape, 1);
    }
    ctx.defaulted("cost", 1.0);
    Ok(Field::constant(vec![1.0]))
}

fn mean_positive_finite(cost: &Field, shape: &[usize]) -> f64 {
    let nnodes: usize = shape.iter().product();
    let samples: Vec<f64> = if cost.is_constant() {
        vec![cost.at(0)[0]]
    } else {
        (0..nnodes).map(|n| cost.at(n)[0]).collect()
    };
    let positive: Vec<f64> = samples.into_iter().filter(|c| *c > 0.0).collect();
    match mean_finite_abs(&positive) {
        m if m > 0.0 => m,
        _ => 1.0,
    }
}
