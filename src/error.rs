// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::fmt;

/// Errors that can occur while configuring, solving or differentiating an
/// eikonal problem.
#[derive(Debug)]
pub enum EikonalError {
    /// The input array ordering is not row major.
    UnsupportedOrdering(String),
    /// A required input key is absent and has no default.
    MissingKey(String),
    /// An input key holds a value of the wrong kind or out of range.
    InvalidValue {
        /// The offending key.
        key: String,
        /// Explanation of why it is rejected.
        reason: String,
    },
    /// The model family name is unknown or its scheme is not bundled.
    UnsupportedModel(String),
    /// The block extent does not match the parallel granularity.
    BlockShape {
        /// The requested inner block shape.
        shape_i: Vec<usize>,
        /// The granularity its product must be a multiple of.
        granularity: usize,
    },
    /// Array shape does not match expected shape.
    ShapeMismatch {
        /// The expected shape.
        expected: Vec<usize>,
        /// The actual shape encountered.
        got: Vec<usize>,
    },
    /// Seed location is invalid (outside domain or other constraint).
    InvalidSeed {
        /// The seed coordinates, in grid units.
        coord: Vec<f64>,
        /// Explanation of why it's invalid.
        reason: String,
    },
    /// A stencil offset reaches further than one block along some axis.
    StencilTooWide {
        /// The axis index.
        axis: usize,
        /// The stencil reach along that axis.
        reach: usize,
        /// The block extent along that axis.
        block: usize,
    },
    /// The outer iteration budget was exhausted before convergence.
    ConvergenceFailure {
        /// The kernel that failed to converge.
        kernel: String,
        /// The number of outer iterations performed.
        niter_o: usize,
    },
    /// A transposed graph node has more in-edges than the fixed capacity.
    GraphCapacity {
        /// The node whose in-degree overflowed.
        node: usize,
        /// Its in-degree.
        in_degree: usize,
        /// The fixed capacity.
        capacity: usize,
    },
    /// Error reading or writing a .npy array.
    Npy(String),
    /// I/O error occurred.
    IoError(std::io::Error),
}

impl EikonalError {
    /// Whether this error belongs to the configuration family, which is
    /// raised before any kernel is launched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EikonalError::UnsupportedOrdering(_)
                | EikonalError::MissingKey(_)
                | EikonalError::InvalidValue { .. }
                | EikonalError::UnsupportedModel(_)
                | EikonalError::BlockShape { .. }
                | EikonalError::ShapeMismatch { .. }
                | EikonalError::InvalidSeed { .. }
                | EikonalError::StencilTooWide { .. }
        )
    }

    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        EikonalError::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for EikonalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EikonalError::UnsupportedOrdering(ordering) => {
                write!(
                    f,
                    "unsupported array ordering '{}': only RowMajor is supported",
                    ordering
                )
            }
            EikonalError::MissingKey(key) => write!(f, "missing value for key {}", key),
            EikonalError::InvalidValue { key, reason } => {
                write!(f, "invalid value for key {}: {}", key, reason)
            }
            EikonalError::UnsupportedModel(model) => {
                write!(f, "unsupported model: {}", model)
            }
            EikonalError::BlockShape {
                shape_i,
                granularity,
            } => {
                write!(
                    f,
                    "invalid block shape {:?}: product must be a multiple of {}",
                    shape_i, granularity
                )
            }
            EikonalError::ShapeMismatch { expected, got } => {
                write!(f, "shape mismatch: expected {:?}, got {:?}", expected, got)
            }
            EikonalError::InvalidSeed { coord, reason } => {
                write!(f, "invalid seed at {:?}: {}", coord, reason)
            }
            EikonalError::StencilTooWide { axis, reach, block } => {
                write!(
                    f,
                    "stencil reach {} on axis {} exceeds block extent {}",
                    reach, axis, block
                )
            }
            EikonalError::ConvergenceFailure { kernel, niter_o } => {
                write!(
                    f,
                    "kernel {} did not reach convergence after {} outer iterations",
                    kernel, niter_o
                )
            }
            EikonalError::GraphCapacity {
                node,
                in_degree,
                capacity,
            } => {
                write!(
                    f,
                    "graph reverse: node {} has in-degree {} exceeding capacity {}",
                    node, in_degree, capacity
                )
            }
            EikonalError::Npy(msg) => write!(f, "npy error: {}", msg),
            EikonalError::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for EikonalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EikonalError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EikonalError {
    fn from(e: std::io::Error) -> Self {
        EikonalError::IoError(e)
    }
}

/// Convenience type alias for Results with EikonalError.
pub type Result<T> = std::result::Result<T, EikonalError>;
