// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! A block-parallel anisotropic eikonal solver with automatic differentiation.
//!
//! This library computes arrival times of a front on n-dimensional Cartesian
//! grids for isotropic, diagonal, Riemannian and Rander metrics. The grid is
//! split into fixed-size blocks which are relaxed in parallel, either all of
//! them at every outer iteration or only the active ones. The upwind
//! dependency graph of the converged solution is then used to propagate
//! tangents (forward mode) or sensitivities (reverse mode) with respect to the
//! seed values and the cost.

#![warn(missing_docs)]

/// Tangents and adjoints of the value field.
pub mod ad;
/// Error types for the library.
pub mod error;
/// Upwind flow graph extraction.
pub mod flow;
/// Transposition of fixed out-degree graphs.
pub mod graph;
/// Block decomposition of the grid.
pub mod grid;
/// Input dictionary and key bookkeeping.
pub mod input;
/// End-to-end runs.
pub mod interface;
/// File I/O for loading and saving arrays.
pub mod io;
/// Block relaxation kernels.
pub mod kernel;
/// Metrics and metric fields.
pub mod metric;
/// Models and local update stencils.
pub mod scheme;
/// Seeds and boundary data.
pub mod seeds;
/// Block-iterative solver.
pub mod solver;

pub use crate::ad::Ad;
pub use crate::error::{EikonalError, Result};
pub use crate::grid::BlockGrid;
pub use crate::input::{HfmInput, InputValue};
pub use crate::interface::{run, run_cpu, Report};
pub use crate::kernel::{CpuBinding, Kernel, KernelBinding};
pub use crate::solver::{FrontPropagationSolver, Schedule, SolveStats};
