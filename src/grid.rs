// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use crate::error::{EikonalError, Result};

/// The product of the inner block shape must be a multiple of this value.
pub const PARALLEL_GRANULARITY: usize = 8;

/// Largest supported number of dimensions. Neighbor blocks are addressed by a
/// base-3 displacement code, which must fit in a `u128` mask.
pub const MAX_NDIM: usize = 4;

/// Index type of block-layout node indices.
pub type Int = u32;

/// Sentinel for "no neighbor" in graph index arrays.
pub const INVALID_INDEX: Int = Int::MAX;

/// Partition of an n-dimensional grid into fixed-size inner blocks.
///
/// Arrays handed to kernels use the *block layout*: node `x` lives at
/// `n_o * size_i + n_i`, where `n_o` is the row-major index of its block in
/// `shape_o` and `n_i` the row-major index of its offset in `shape_i`.
/// Blocks overlapping the far end of an axis are padded.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockGrid {
    shape: Vec<usize>,
    shape_i: Vec<usize>,
    shape_o: Vec<usize>,
    periodic: Vec<bool>,
    size_i: usize,
    size_o: usize,
}

impl BlockGrid {
    /// Create a block decomposition of a grid of extent `shape`.
    ///
    /// # Errors
    /// Returns an error if the ranks differ, an extent is zero, the product of
    /// `shape_i` is not a multiple of [`PARALLEL_GRANULARITY`], or the padded
    /// grid does not fit the 32-bit index type.
    pub fn new(shape: &[usize], shape_i: &[usize]) -> Result<Self> {
        let ndim = shape.len();
        if ndim == 0 || ndim > MAX_NDIM {
            return Err(EikonalError::invalid(
                "dims",
                format!("{} dimensions, expected 1 to {}", ndim, MAX_NDIM),
            ));
        }
        if shape_i.len() != ndim {
            return Err(EikonalError::invalid(
                "shape_i",
                format!("rank {} differs from grid rank {}", shape_i.len(), ndim),
            ));
        }
        if let Some(axis) = shape.iter().position(|&s| s == 0) {
            return Err(EikonalError::invalid(
                "dims",
                format!("axis {} has zero extent", axis),
            ));
        }
        if shape_i.contains(&0) {
            return Err(EikonalError::invalid("shape_i", "zero block extent"));
        }
        let size_i: usize = shape_i.iter().product();
        if size_i % PARALLEL_GRANULARITY != 0 {
            return Err(EikonalError::BlockShape {
                shape_i: shape_i.to_vec(),
                granularity: PARALLEL_GRANULARITY,
            });
        }

        let shape_o: Vec<usize> = shape
            .iter()
            .zip(shape_i)
            .map(|(&s, &si)| s.div_ceil(si))
            .collect();
        let size_o: usize = shape_o.iter().product();
        if size_o.saturating_mul(size_i) >= INVALID_INDEX as usize {
            return Err(EikonalError::invalid(
                "dims",
                "grid too large for 32-bit node indices",
            ));
        }

        Ok(BlockGrid {
            shape: shape.to_vec(),
            shape_i: shape_i.to_vec(),
            shape_o,
            periodic: vec![false; ndim],
            size_i,
            size_o,
        })
    }

    /// Set the periodic axes (builder method).
    ///
    /// # Errors
    /// Returns an error if the number of flags differs from the grid rank.
    pub fn with_periodic(mut self, periodic: &[bool]) -> Result<Self> {
        if periodic.len() != self.ndim() {
            return Err(EikonalError::invalid(
                "periodic",
                format!("{} flags for a {}-dimensional grid", periodic.len(), self.ndim()),
            ));
        }
        self.periodic = periodic.to_vec();
        Ok(self)
    }

    /// Default inner block shape: 8 per axis up to 2-D, 4 per axis beyond.
    pub fn default_shape_i(ndim: usize) -> Vec<usize> {
        let side = if ndim <= 2 { 8 } else { 4 };
        vec![side; ndim]
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Grid extent per axis.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Inner block extent per axis.
    pub fn shape_i(&self) -> &[usize] {
        &self.shape_i
    }

    /// Number of blocks per axis.
    pub fn shape_o(&self) -> &[usize] {
        &self.shape_o
    }

    /// Periodicity flag per axis.
    pub fn periodic(&self) -> &[bool] {
        &self.periodic
    }

    /// Nodes per block.
    pub fn size_i(&self) -> usize {
        self.size_i
    }

    /// Number of blocks.
    pub fn size_o(&self) -> usize {
        self.size_o
    }

    /// Length of a block-layout array, padding included.
    pub fn size_tot(&self) -> usize {
        self.size_o * self.size_i
    }

    /// Number of grid nodes, padding excluded.
    pub fn num_nodes(&self) -> usize {
        self.shape.iter().product()
    }

    /// Block-layout index of an in-range position. No bounds check.
    pub fn block_index(&self, x: &[usize]) -> usize {
        let mut n_o = 0;
        let mut n_i = 0;
        for k in 0..self.ndim() {
            let si = self.shape_i[k];
            n_o = n_o * self.shape_o[k] + x[k] / si;
            n_i = n_i * si + x[k] % si;
        }
        n_o * self.size_i + n_i
    }

    /// Block-layout index of a possibly out-of-range position.
    ///
    /// Periodic axes wrap around; on other axes `None` is returned outside the
    /// domain. Padding cells are never returned.
    pub fn index_tot(&self, x: &[isize]) -> Option<usize> {
        let mut n_o = 0;
        let mut n_i = 0;
        for k in 0..self.ndim() {
            let s = self.shape[k] as isize;
            let mut xk = x[k];
            if self.periodic[k] {
                xk = xk.rem_euclid(s);
            } else if xk < 0 || xk >= s {
                return None;
            }
            let xk = xk as usize;
            let si = self.shape_i[k];
            n_o = n_o * self.shape_o[k] + xk / si;
            n_i = n_i * si + xk % si;
        }
        Some(n_o * self.size_i + n_i)
    }

    /// Split a block-layout index into `(outer block, inner offset)`.
    pub fn decompose(&self, n_t: usize) -> (usize, usize) {
        (n_t / self.size_i, n_t % self.size_i)
    }

    /// Row-major coordinates of a block index within `shape_o`.
    pub fn block_position(&self, n_o: usize) -> Vec<usize> {
        unravel(n_o, &self.shape_o)
    }

    /// Row-major coordinates of an inner offset within `shape_i`.
    pub fn inner_position(&self, n_i: usize) -> Vec<usize> {
        unravel(n_i, &self.shape_i)
    }

    /// Full (padded) coordinates of a block-layout index.
    pub fn position_tot(&self, n_t: usize) -> Vec<usize> {
        let (n_o, n_i) = self.decompose(n_t);
        let x_o = self.block_position(n_o);
        let x_i = self.inner_position(n_i);
        x_o.iter()
            .zip(&x_i)
            .zip(&self.shape_i)
            .map(|((&o, &i), &si)| o * si + i)
            .collect()
    }

    /// Whether a block-layout index is a real grid node (not padding).
    pub fn in_domain(&self, n_t: usize) -> bool {
        self.position_tot(n_t)
            .iter()
            .zip(&self.shape)
            .all(|(&x, &s)| x < s)
    }

    /// Block-layout index of a row-major flat index.
    pub fn flat_to_block(&self, flat: usize) -> usize {
        self.block_index(&unravel(flat, &self.shape))
    }

    /// Row-major flat index of a block-layout index, `None` for padding.
    pub fn block_to_flat(&self, n_t: usize) -> Option<usize> {
        let x = self.position_tot(n_t);
        if x.iter().zip(&self.shape).any(|(&xk, &s)| xk >= s) {
            return None;
        }
        Some(ravel(&x, &self.shape))
    }

    /// Number of real (non padding) nodes of block `n_o` along each axis.
    pub fn block_extent(&self, n_o: usize) -> Vec<usize> {
        let x_o = self.block_position(n_o);
        (0..self.ndim())
            .map(|k| {
                let start = x_o[k] * self.shape_i[k];
                self.shape_i[k].min(self.shape[k] - start)
            })
            .collect()
    }

    /// Neighbor of block `n_o` at displacement `delta` (entries in -1..=1),
    /// wrapping on periodic axes.
    pub fn neighbor_block(&self, n_o: usize, delta: &[i8]) -> Option<usize> {
        let x_o = self.block_position(n_o);
        let mut id = 0;
        for k in 0..self.ndim() {
            let so = self.shape_o[k] as isize;
            let mut y = x_o[k] as isize + delta[k] as isize;
            if self.periodic[k] {
                y = y.rem_euclid(so);
            } else if y < 0 || y >= so {
                return None;
            }
            id = id * self.shape_o[k] + y as usize;
        }
        Some(id)
    }

    /// Embed a row-major array into the padded block layout, filling padding
    /// cells with `fill`.
    ///
    /// # Errors
    /// Returns an error if the array length differs from the node count.
    pub fn expand<T: Copy>(&self, arr: &[T], fill: T) -> Result<Vec<T>> {
        if arr.len() != self.num_nodes() {
            return Err(EikonalError::ShapeMismatch {
                expected: self.shape.clone(),
                got: vec![arr.len()],
            });
        }
        let mut out = vec![fill; self.size_tot()];
        for (flat, &v) in arr.iter().enumerate() {
            out[self.flat_to_block(flat)] = v;
        }
        Ok(out)
    }

    /// Inverse of [`BlockGrid::expand`]: drop padding, restore row-major order.
    ///
    /// # Errors
    /// Returns an error if the array length differs from `size_tot`.
    pub fn squeeze<T: Copy>(&self, arr: &[T]) -> Result<Vec<T>> {
        if arr.len() != self.size_tot() {
            return Err(EikonalError::ShapeMismatch {
                expected: vec![self.size_tot()],
                got: vec![arr.len()],
            });
        }
        Ok((0..self.num_nodes())
            .map(|flat| arr[self.flat_to_block(flat)])
            .collect())
    }

    /// Pack block-layout boolean tags, eight per byte, little bit order.
    pub fn pack_bits(&self, tags: &[bool]) -> Vec<u8> {
        tags.chunks(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .fold(0u8, |acc, (bit, &t)| acc | ((t as u8) << bit))
            })
            .collect()
    }
}

/// Read one tag from an array packed by [`BlockGrid::pack_bits`].
#[inline]
pub fn get_bool(packed: &[u8], n: usize) -> bool {
    (packed[n / 8] >> (n % 8)) & 1 == 1
}

/// Row-major coordinates of a flat index.
pub fn unravel(mut n: usize, shape: &[usize]) -> Vec<usize> {
    let mut x = vec![0; shape.len()];
    for k in (0..shape.len()).rev() {
        x[k] = n % shape[k];
        n /= shape[k];
    }
    x
}

/// Row-major flat index of in-range coordinates.
pub fn ravel(x: &[usize], shape: &[usize]) -> usize {
    x.iter().zip(shape).fold(0, |n, (&xk, &s)| n * s + xk)
}

/// Number of displacement codes for a given rank, `3^ndim`.
pub fn num_displacements(ndim: usize) -> usize {
    3usize.pow(ndim as u32)
}

/// Decode a base-3 displacement code into per-axis offsets in -1..=1.
pub fn displacement(code: usize, ndim: usize) -> Vec<i8> {
    let mut delta = vec![0i8; ndim];
    let mut c = code;
    for d in delta.iter_mut() {
        *d = (c % 3) as i8 - 1;
        c /= 3;
    }
    delta
}

/// Encode per-axis offsets in -1..=1 as a base-3 displacement code.
pub fn displacement_code(delta: &[i8]) -> usize {
    delta
        .iter()
        .rev()
        .fold(0, |code, &d| code * 3 + (d + 1) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn flat_block_roundtrip_2d() {
        let grid = BlockGrid::new(&[12, 10], &[8, 8]).unwrap();
        assert_eq!(grid.shape_o(), &[2, 2]);
        for flat in 0..grid.num_nodes() {
            let n_t = grid.flat_to_block(flat);
            assert_eq!(grid.block_to_flat(n_t), Some(flat), "flat={}", flat);
        }
    }

    #[test]
    fn block_index_layout() {
        let grid = BlockGrid::new(&[16, 16], &[8, 8]).unwrap();
        // Second block along axis 1, first inner node.
        assert_eq!(grid.block_index(&[0, 8]), 64);
        // First block, inner offset (1, 0).
        assert_eq!(grid.block_index(&[1, 0]), 8);
        assert_eq!(grid.decompose(64 + 9), (1, 9));
        assert_eq!(grid.position_tot(64 + 9), vec![1, 9]);
    }

    #[test]
    fn padding_is_out_of_domain() {
        let grid = BlockGrid::new(&[10], &[8]).unwrap();
        assert_eq!(grid.size_tot(), 16);
        assert!(grid.in_domain(9));
        assert!(!grid.in_domain(10));
        assert_eq!(grid.block_to_flat(15), None);
        assert_eq!(grid.block_extent(1), vec![2]);
    }

    #[test]
    fn rejects_block_not_multiple_of_granularity() {
        let result = BlockGrid::new(&[16, 16], &[3, 3]);
        assert!(matches!(
            result,
            Err(EikonalError::BlockShape { granularity: 8, .. })
        ));
        assert!(result.unwrap_err().is_configuration());
    }

    #[test]
    fn rejects_rank_mismatch() {
        assert!(BlockGrid::new(&[16, 16], &[8]).is_err());
        assert!(BlockGrid::new(&[16, 0], &[8, 8]).is_err());
    }

    #[test]
    fn index_tot_periodic_wrap() {
        let grid = BlockGrid::new(&[10, 6], &[4, 2])
            .unwrap()
            .with_periodic(&[true, false])
            .unwrap();
        assert_eq!(grid.index_tot(&[-1, 0]), Some(grid.block_index(&[9, 0])));
        assert_eq!(grid.index_tot(&[10, 5]), Some(grid.block_index(&[0, 5])));
        assert_eq!(grid.index_tot(&[0, 6]), None);
        assert_eq!(grid.index_tot(&[0, -1]), None);
    }

    #[test]
    fn neighbor_block_wraps_on_periodic_axes() {
        let grid = BlockGrid::new(&[24, 24], &[8, 8])
            .unwrap()
            .with_periodic(&[true, false])
            .unwrap();
        // Block (0, 0) neighbors.
        assert_eq!(grid.neighbor_block(0, &[-1, 0]), Some(6));
        assert_eq!(grid.neighbor_block(0, &[0, -1]), None);
        assert_eq!(grid.neighbor_block(0, &[1, 1]), Some(4));
    }

    #[test]
    fn expand_fills_padding() {
        let grid = BlockGrid::new(&[3, 3], &[4, 2]).unwrap();
        let arr: Vec<f64> = (0..9).map(|i| i as f64).collect();
        let block = grid.expand(&arr, f64::INFINITY).unwrap();
        assert_eq!(block.len(), grid.size_tot());
        let padding = block.iter().filter(|v| v.is_infinite()).count();
        assert_eq!(padding, grid.size_tot() - 9);
        assert_eq!(block[grid.block_index(&[2, 1])], 7.0);
    }

    #[test]
    fn expand_shape_mismatch() {
        let grid = BlockGrid::new(&[4, 4], &[4, 2]).unwrap();
        assert!(matches!(
            grid.expand(&[0.0; 5], 0.0),
            Err(EikonalError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn pack_bits_little_order() {
        let grid = BlockGrid::new(&[8, 2], &[4, 2]).unwrap();
        let mut tags = vec![false; grid.size_tot()];
        tags[0] = true;
        tags[3] = true;
        tags[9] = true;
        let packed = grid.pack_bits(&tags);
        assert_eq!(packed.len(), 2);
        assert_eq!(packed[0], 0b0000_1001);
        for (n, &t) in tags.iter().enumerate() {
            assert_eq!(get_bool(&packed, n), t);
        }
    }

    #[test]
    fn displacement_code_roundtrip() {
        for ndim in 1..=MAX_NDIM {
            for code in 0..num_displacements(ndim) {
                assert_eq!(displacement_code(&displacement(code, ndim)), code);
            }
        }
        assert_eq!(displacement_code(&[0, 0]), 4);
    }

    fn arb_grid() -> impl Strategy<Value = (Vec<usize>, Vec<usize>)> {
        prop_oneof![
            (1usize..20).prop_map(|n| (vec![n], vec![8])),
            (1usize..20, 1usize..20).prop_map(|(a, b)| (vec![a, b], vec![4, 2])),
            (1usize..9, 1usize..9, 1usize..9)
                .prop_map(|(a, b, c)| (vec![a, b, c], vec![2, 2, 2])),
        ]
    }

    proptest! {
        #[test]
        fn squeeze_inverts_expand((shape, shape_i) in arb_grid(), seed in 0u64..1000) {
            let grid = BlockGrid::new(&shape, &shape_i).unwrap();
            let arr: Vec<f64> = (0..grid.num_nodes())
                .map(|i| ((i as u64 * 31 + seed) % 97) as f64)
                .collect();
            let expanded = grid.expand(&arr, f64::NAN).unwrap();
            prop_assert_eq!(grid.squeeze(&expanded).unwrap(), arr);
        }

        #[test]
        fn block_index_is_bijective((shape, shape_i) in arb_grid()) {
            let grid = BlockGrid::new(&shape, &shape_i).unwrap();
            let mut seen = vec![false; grid.size_tot()];
            for flat in 0..grid.num_nodes() {
                let n_t = grid.flat_to_block(flat);
                prop_assert!(!seen[n_t]);
                seen[n_t] = true;
                prop_assert!(grid.in_domain(n_t));
            }
        }
    }
}
