// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use rayon::prelude::*;
use tracing::debug;

use crate::error::{EikonalError, Result};
use crate::grid::{displacement, num_displacements};
use crate::kernel::{BlockOutput, Iterate, Kernel, Tolerance};

/// Default outer iteration budget.
pub const DEFAULT_NITERMAX_O: usize = 2000;

struct AtomicBitset {
    bits: Box<[AtomicU64]>,
}

impl AtomicBitset {
    fn new(num_bits: usize) -> Self {
        let num_words = num_bits.div_ceil(64);
        let bits: Box<[AtomicU64]> = (0..num_words)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        AtomicBitset { bits }
    }

    fn try_set(&self, id: usize) -> bool {
        let word = id / 64;
        let bit = 1u64 << (id % 64);
        let prev = self.bits[word].fetch_or(bit, Ordering::AcqRel);
        (prev & bit) == 0
    }

    fn clear(&self, id: usize) {
        let word = id / 64;
        let bit = 1u64 << (id % 64);
        self.bits[word].fetch_and(!bit, Ordering::Release);
    }
}

/// Blocks activated during a launch, deduplicated.
struct ActivationQueue {
    queue: SegQueue<usize>,
    bitset: AtomicBitset,
}

impl ActivationQueue {
    fn new(num_blocks: usize) -> Self {
        ActivationQueue {
            queue: SegQueue::new(),
            bitset: AtomicBitset::new(num_blocks),
        }
    }

    fn push_if_new(&self, block: usize) -> bool {
        if self.bitset.try_set(block) {
            self.queue.push(block);
            true
        } else {
            false
        }
    }

    /// Next update list, in increasing block order.
    fn drain(&self) -> Vec<usize> {
        let mut blocks = Vec::with_capacity(self.queue.len());
        while let Some(id) = self.queue.pop() {
            self.bitset.clear(id);
            blocks.push(id);
        }
        blocks.sort_unstable();
        blocks
    }
}

/// Block scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Update every block every outer iteration.
    GlobalIteration,
    /// Update only active blocks; reactivate neighbors of changed nodes.
    AdaptiveGaussSeidel,
}

impl Schedule {
    /// Parse a `solver` name.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "global_iteration" => Ok(Schedule::GlobalIteration),
            "AGSI" | "adaptive_gauss_siedel_iteration" => Ok(Schedule::AdaptiveGaussSeidel),
            other => Err(EikonalError::invalid(
                "solver",
                format!("unrecognized solver '{}'", other),
            )),
        }
    }

    /// Whether blocks are pruned between launches.
    pub fn is_adaptive(self) -> bool {
        self == Schedule::AdaptiveGaussSeidel
    }
}

/// Statistics of one kernel run.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveStats {
    /// Kernel name.
    pub kernel: String,
    /// Number of launches.
    pub niter_o: usize,
    /// Wall clock time.
    pub time: Duration,
    /// Total number of block relaxations.
    pub block_updates: u64,
    /// Whether the update list emptied within the budget.
    pub converged: bool,
}

/// Block-iterative solver for eikonal and linear kernels.
///
/// Each outer iteration is one launch: every block of the update list is
/// relaxed in parallel against the same snapshot, and the results are written
/// back afterwards. Results are therefore independent of the thread count.
#[derive(Debug, Clone)]
pub struct FrontPropagationSolver {
    schedule: Schedule,
    nitermax_o: usize,
    raise_on_non_convergence: bool,
    num_threads: Option<usize>,
}

impl FrontPropagationSolver {
    /// Create a solver with the given schedule and default budget.
    pub fn new(schedule: Schedule) -> Self {
        FrontPropagationSolver {
            schedule,
            nitermax_o: DEFAULT_NITERMAX_O,
            raise_on_non_convergence: true,
            num_threads: None,
        }
    }

    /// Set the outer iteration budget (builder method).
    pub fn with_nitermax_o(mut self, nitermax_o: usize) -> Self {
        self.nitermax_o = nitermax_o;
        self
    }

    /// Fail instead of warning when the budget is exhausted (builder method).
    /// Default is true.
    pub fn with_raise_on_non_convergence(mut self, raise: bool) -> Self {
        self.raise_on_non_convergence = raise;
        self
    }

    /// Set the number of worker threads (builder method).
    /// If not specified, the global rayon pool is used.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.num_threads = Some(threads);
        self
    }

    /// The scheduling policy.
    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    fn pool(&self) -> Result<Option<rayon::ThreadPool>> {
        self.num_threads
            .map(|n| {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| EikonalError::invalid("threads", e.to_string()))
            })
            .transpose()
    }

    /// Relax `kernel` until convergence, updating `iterate` in place.
    ///
    /// `initial` lists the blocks active at the start of an adaptive solve;
    /// the global schedule ignores it.
    ///
    /// # Errors
    /// Returns `ConvergenceFailure` if the budget is exhausted and the solver
    /// raises on non-convergence.
    pub fn solve(
        &self,
        kernel: &dyn Kernel,
        iterate: &mut Iterate,
        tol: Tolerance,
        initial: &[usize],
    ) -> Result<SolveStats> {
        let grid = kernel.grid();
        let size_o = grid.size_o();
        let ndim = grid.ndim();
        let adaptive = self.schedule.is_adaptive();
        let pool = self.pool()?;
        let queue = ActivationQueue::new(size_o);
        let start = Instant::now();

        let mut update_list: Vec<usize> = if adaptive {
            let mut blocks = initial.to_vec();
            blocks.sort_unstable();
            blocks.dedup();
            blocks
        } else {
            (0..size_o).collect()
        };
        let mut niter_o = 0;
        let mut block_updates = 0u64;

        while !update_list.is_empty() && niter_o < self.nitermax_o {
            let snapshot: &Iterate = iterate;
            let relax = |&block: &usize| -> BlockOutput {
                let out = kernel.relax_block(block, snapshot, tol, false);
                if adaptive && out.report.activate != 0 {
                    for code in 0..num_displacements(ndim) {
                        if out.report.activate & (1u128 << code) == 0 {
                            continue;
                        }
                        if let Some(nb) = grid.neighbor_block(block, &displacement(code, ndim)) {
                            queue.push_if_new(nb);
                        }
                    }
                }
                out
            };
            let outputs = launch(pool.as_ref(), &update_list, relax);
            niter_o += 1;
            block_updates += update_list.len() as u64;

            let any_changed = outputs.iter().any(|o| o.report.changed);
            write_back(iterate, outputs, grid.size_i());

            update_list = if adaptive {
                queue.drain()
            } else if any_changed {
                (0..size_o).collect()
            } else {
                Vec::new()
            };
            debug!(
                kernel = kernel.name(),
                niter_o,
                next_blocks = update_list.len(),
                "launch complete"
            );
        }

        let stats = SolveStats {
            kernel: kernel.name().to_string(),
            niter_o,
            time: start.elapsed(),
            block_updates,
            converged: update_list.is_empty(),
        };
        if !stats.converged {
            if self.raise_on_non_convergence {
                return Err(EikonalError::ConvergenceFailure {
                    kernel: stats.kernel,
                    niter_o,
                });
            }
            debug!(
                kernel = kernel.name(),
                niter_o, "outer iteration budget exhausted"
            );
        }
        Ok(stats)
    }

    /// Run a single launch over all blocks with flow extraction enabled.
    ///
    /// Values are left untouched. Returns the block outputs in block order.
    pub fn extract(&self, kernel: &dyn Kernel, iterate: &Iterate) -> Result<(Vec<BlockOutput>, SolveStats)> {
        let pool = self.pool()?;
        let start = Instant::now();
        let blocks: Vec<usize> = (0..kernel.grid().size_o()).collect();
        let outputs = launch(pool.as_ref(), &blocks, |&block: &usize| {
            kernel.relax_block(block, iterate, Tolerance::accept_all(), true)
        });
        let stats = SolveStats {
            kernel: kernel.name().to_string(),
            niter_o: 1,
            time: start.elapsed(),
            block_updates: blocks.len() as u64,
            converged: true,
        };
        Ok((outputs, stats))
    }
}

/// Relax the listed blocks in parallel; outputs keep the list order.
fn launch<F>(pool: Option<&rayon::ThreadPool>, blocks: &[usize], relax: F) -> Vec<BlockOutput>
where
    F: Fn(&usize) -> BlockOutput + Sync + Send,
{
    match pool {
        Some(pool) => pool.install(|| blocks.par_iter().map(&relax).collect()),
        None => blocks.par_iter().map(&relax).collect(),
    }
}

fn write_back(iterate: &mut Iterate, outputs: Vec<BlockOutput>, size_i: usize) {
    for out in outputs {
        let base = out.block * size_i;
        iterate.values[base..base + size_i].copy_from_slice(&out.values);
        if let (Some(dst), Some(src)) = (iterate.residuals.as_mut(), out.residuals.as_ref()) {
            dst[base..base + size_i].copy_from_slice(src);
        }
    }
}
