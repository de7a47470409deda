// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use crate::error::{EikonalError, Result};
use crate::grid::Int;

/// Transposed fixed out-degree graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Reversed {
    /// `capacity` source indices per node, `invalid` for unused slots.
    pub indices: Vec<Int>,
    /// `capacity` weights per node, 0 for unused slots.
    pub weights: Vec<f64>,
    /// Out-degree of the transposed graph.
    pub capacity: usize,
}

/// Transpose a fixed out-degree graph.
///
/// Node `i` has edges `(indices[i*nact + k], weights[i*nact + k])`. Edges
/// pointing to `invalid` or carrying a zero weight are dropped. Each edge
/// `i -> j` of weight `w` becomes an edge `j -> i` of weight `w`; the in-edges
/// of a node are listed by increasing source node, then slot, and padded with
/// `(invalid, 0.0)`.
///
/// With `capacity = None` the transposed out-degree is the maximum in-degree.
///
/// # Errors
/// Returns `GraphCapacity` when an explicit capacity is exceeded, and
/// `ShapeMismatch` when the arrays are inconsistent with `nnodes`.
pub fn graph_reverse(
    indices: &[Int],
    weights: &[f64],
    nnodes: usize,
    invalid: Int,
    capacity: Option<usize>,
) -> Result<Reversed> {
    if indices.len() != weights.len() || nnodes == 0 || indices.len() % nnodes != 0 {
        return Err(EikonalError::ShapeMismatch {
            expected: vec![nnodes],
            got: vec![indices.len(), weights.len()],
        });
    }
    let nact = indices.len() / nnodes;
    let is_edge = |slot: usize| indices[slot] != invalid && weights[slot] != 0.0;

    let mut in_degree = vec![0usize; nnodes];
    for slot in 0..indices.len() {
        if !is_edge(slot) {
            continue;
        }
        let j = indices[slot] as usize;
        if j >= nnodes {
            return Err(EikonalError::invalid(
                "flow_indices",
                format!("edge target {} outside of {} nodes", j, nnodes),
            ));
        }
        in_degree[j] += 1;
    }

    let max_in = in_degree.iter().copied().max().unwrap_or(0);
    let capacity = match capacity {
        Some(c) => {
            if let Some((node, &deg)) = in_degree.iter().enumerate().find(|&(_, &d)| d > c) {
                return Err(EikonalError::GraphCapacity {
                    node,
                    in_degree: deg,
                    capacity: c,
                });
            }
            c
        }
        None => max_in,
    };

    let mut out_indices = vec![invalid; nnodes * capacity];
    let mut out_weights = vec![0.0; nnodes * capacity];
    let mut fill = vec![0usize; nnodes];
    for i in 0..nnodes {
        for slot in i * nact..(i + 1) * nact {
            if !is_edge(slot) {
                continue;
            }
            let j = indices[slot] as usize;
            let dst = j * capacity + fill[j];
            out_indices[dst] = i as Int;
            out_weights[dst] = weights[slot];
            fill[j] += 1;
        }
    }

    Ok(Reversed {
        indices: out_indices,
        weights: out_weights,
        capacity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const INVALID: Int = Int::MAX;

    #[test]
    fn reverse_small_chain() {
        // 0 <- 1 <- 2, node 2 also depends on 0.
        let indices = [INVALID, INVALID, 0, INVALID, 0, 1];
        let weights = [0.0, 0.0, 1.0, 0.0, 0.25, 0.75];
        let r = graph_reverse(&indices, &weights, 3, INVALID, None).unwrap();
        assert_eq!(r.capacity, 2);
        assert_eq!(r.indices, vec![1, 2, 2, INVALID, INVALID, INVALID]);
        assert_eq!(r.weights, vec![1.0, 0.25, 0.75, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn zero_weight_edges_dropped() {
        let indices = [1, 0];
        let weights = [0.0, 1.0];
        let r = graph_reverse(&indices, &weights, 2, INVALID, Some(1)).unwrap();
        assert_eq!(r.indices, vec![1, INVALID]);
    }

    #[test]
    fn capacity_exceeded() {
        let indices = [INVALID, 0, 0];
        let weights = [0.0, 1.0, 1.0];
        let result = graph_reverse(&indices, &weights, 3, INVALID, Some(1));
        assert!(matches!(
            result,
            Err(EikonalError::GraphCapacity {
                node: 0,
                in_degree: 2,
                capacity: 1
            })
        ));
    }

    #[test]
    fn inconsistent_lengths() {
        assert!(graph_reverse(&[0, 1, 2], &[1.0, 1.0], 2, INVALID, None).is_err());
    }

    /// Random graph with each node's edges sorted by target, padding last.
    fn canonical_graph() -> impl Strategy<Value = (usize, usize, Vec<Int>, Vec<f64>)> {
        (1usize..12, 1usize..4).prop_flat_map(|(nnodes, nact)| {
            proptest::collection::vec(
                proptest::collection::vec((0..nnodes as Int, 1u32..100), 0..=nact),
                nnodes,
            )
            .prop_map(move |rows| {
                let mut indices = Vec::with_capacity(nnodes * nact);
                let mut weights = Vec::with_capacity(nnodes * nact);
                for mut row in rows {
                    row.sort_by_key(|&(j, _)| j);
                    for k in 0..nact {
                        match row.get(k) {
                            Some(&(j, w)) => {
                                indices.push(j);
                                weights.push(w as f64 / 100.0);
                            }
                            None => {
                                indices.push(INVALID);
                                weights.push(0.0);
                            }
                        }
                    }
                }
                (nnodes, nact, indices, weights)
            })
        })
    }

    proptest! {
        #[test]
        fn reverse_is_an_involution((nnodes, nact, indices, weights) in canonical_graph()) {
            let once = graph_reverse(&indices, &weights, nnodes, INVALID, None).unwrap();
            let twice = graph_reverse(&once.indices, &once.weights, nnodes, INVALID, Some(nact)).unwrap();
            prop_assert_eq!(twice.indices, indices);
            prop_assert_eq!(twice.weights, weights);
        }

        #[test]
        fn reverse_preserves_total_weight((nnodes, _nact, indices, weights) in canonical_graph()) {
            let once = graph_reverse(&indices, &weights, nnodes, INVALID, None).unwrap();
            let before: f64 = weights.iter().sum();
            let after: f64 = once.weights.iter().sum();
            prop_assert!((before - after).abs() < 1e-9);
        }
    }
}
