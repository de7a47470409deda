// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::path::Path;

use ndarray::ArrayD;

use crate::error::{EikonalError, Result};

/// Load a float array from a .npy file, promoting `f32` data to `f64`.
///
/// The result is in standard (row-major) layout even when the file is stored
/// in Fortran order. When `expected_shape` is given the shapes must match.
pub fn load_npy(path: &Path, expected_shape: Option<&[usize]>) -> Result<ArrayD<f64>> {
    check_extension(path)?;
    // Try f64 first
    let arr: ArrayD<f64> = match ndarray_npy::read_npy(path) {
        Ok(a) => a,
        Err(_) => {
            let arr32: ArrayD<f32> = ndarray_npy::read_npy(path)
                .map_err(|e| EikonalError::Npy(format!("{}: {}", path.display(), e)))?;
            arr32.mapv(|v| v as f64)
        }
    };

    if let Some(expected) = expected_shape {
        if arr.shape() != expected {
            return Err(EikonalError::ShapeMismatch {
                expected: expected.to_vec(),
                got: arr.shape().to_vec(),
            });
        }
    }
    Ok(arr.as_standard_layout().into_owned())
}

/// Save a float array to a .npy file.
pub fn save_npy(path: &Path, arr: &ArrayD<f64>) -> Result<()> {
    check_extension(path)?;
    ndarray_npy::write_npy(path, arr)
        .map_err(|e| EikonalError::Npy(format!("{}: {}", path.display(), e)))
}

fn check_extension(path: &Path) -> Result<()> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("npy") => Ok(()),
        Some(ext) => Err(EikonalError::Npy(format!(
            "unsupported file extension '.{}' (expected .npy)",
            ext
        ))),
        None => Err(EikonalError::Npy(format!(
            "no file extension on '{}' (expected .npy)",
            path.display()
        ))),
    }
}
