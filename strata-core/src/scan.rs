//! Generic associative prefix/suffix scans with a block decomposition.
//!
//! Given values `v_0 .. v_{T-1}`, an associative operator `⊕` and its
//! identity `e`, the left-scan produces the inclusive prefixes
//! `s_t = v_0 ⊕ … ⊕ v_t` and the right-scan the inclusive suffixes
//! `s_t = v_t ⊕ … ⊕ v_{T-1}`.
//!
//! The operator is called as `op(earlier, later)`: the first argument
//! aggregates positions before the second. Callers may encode any
//! associative combination this way, including reversed matrix products
//! (`op(x, y) = y · x` is associative whenever `·` is).
//!
//! The blocked variants decompose the input into contiguous blocks:
//! a local pass scans each block independently, the block edges are
//! reduced sequentially into per-block offsets, and a finalize pass
//! combines each local result with its block offset. The local and
//! finalize passes are data-parallel under the `parallel` feature; the
//! result equals the sequential scan for every associative operator.

use crate::{Result, StrataError};

/// Inclusive left-scan: `out[t] = v_0 ⊕ … ⊕ v_t`.
pub fn scan_left<T, F>(values: &[T], identity: &T, op: F) -> Vec<T>
where
    T: Clone,
    F: Fn(&T, &T) -> T,
{
    let mut out = Vec::with_capacity(values.len());
    let mut acc = identity.clone();
    for v in values {
        acc = op(&acc, v);
        out.push(acc.clone());
    }
    out
}

/// Inclusive right-scan: `out[t] = v_t ⊕ … ⊕ v_{T-1}`.
pub fn scan_right<T, F>(values: &[T], identity: &T, op: F) -> Vec<T>
where
    T: Clone,
    F: Fn(&T, &T) -> T,
{
    let mut out = vec![identity.clone(); values.len()];
    let mut acc = identity.clone();
    for (slot, v) in out.iter_mut().zip(values).rev() {
        acc = op(v, &acc);
        *slot = acc.clone();
    }
    out
}

/// Block-parallel inclusive left-scan.
///
/// Equivalent to [`scan_left`] for any associative `op` with unit
/// `identity`.
///
/// # Errors
///
/// Returns an error if `block_size` is zero.
pub fn scan_left_blocked<T, F>(
    values: &[T],
    block_size: usize,
    identity: &T,
    op: F,
) -> Result<Vec<T>>
where
    T: Clone + Send + Sync,
    F: Fn(&T, &T) -> T + Sync,
{
    if block_size == 0 {
        return Err(StrataError::InvalidConfig(
            "scan_left_blocked: block_size must be > 0".into(),
        ));
    }
    if values.is_empty() {
        return Ok(Vec::new());
    }

    // Local pass: in-block prefixes.
    let locals = local_pass(values, block_size, &|chunk: &[T]| {
        scan_left(chunk, identity, &op)
    });

    // Reduce: fold each block's last element into the next block's offset.
    let mut offsets = Vec::with_capacity(locals.len());
    let mut acc = identity.clone();
    for local in &locals {
        offsets.push(acc.clone());
        acc = op(&acc, local.last().expect("blocks are non-empty"));
    }

    // Finalize: premultiply every local prefix by its block offset.
    Ok(finalize_pass(locals, &offsets, &|offset, local| {
        op(offset, local)
    }))
}

/// Block-parallel inclusive right-scan.
///
/// Equivalent to [`scan_right`] for any associative `op` with unit
/// `identity`.
///
/// # Errors
///
/// Returns an error if `block_size` is zero.
pub fn scan_right_blocked<T, F>(
    values: &[T],
    block_size: usize,
    identity: &T,
    op: F,
) -> Result<Vec<T>>
where
    T: Clone + Send + Sync,
    F: Fn(&T, &T) -> T + Sync,
{
    if block_size == 0 {
        return Err(StrataError::InvalidConfig(
            "scan_right_blocked: block_size must be > 0".into(),
        ));
    }
    if values.is_empty() {
        return Ok(Vec::new());
    }

    // Local pass: in-block suffixes.
    let locals = local_pass(values, block_size, &|chunk: &[T]| {
        scan_right(chunk, identity, &op)
    });

    // Reduce: fold each block's first element into the previous block's
    // offset, walking right to left.
    let mut offsets = vec![identity.clone(); locals.len()];
    let mut acc = identity.clone();
    for (slot, local) in offsets.iter_mut().zip(&locals).rev() {
        *slot = acc.clone();
        acc = op(local.first().expect("blocks are non-empty"), &acc);
    }

    // Finalize: append the suffix offset to every local suffix.
    Ok(finalize_pass(locals, &offsets, &|offset, local| {
        op(local, offset)
    }))
}

fn local_pass<T, S>(values: &[T], block_size: usize, scan: &S) -> Vec<Vec<T>>
where
    T: Clone + Send + Sync,
    S: Fn(&[T]) -> Vec<T> + Sync,
{
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        values.par_chunks(block_size).map(scan).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        values.chunks(block_size).map(scan).collect()
    }
}

fn finalize_pass<T>(
    locals: Vec<Vec<T>>,
    offsets: &[T],
    combine: &(dyn Fn(&T, &T) -> T + Sync),
) -> Vec<T>
where
    T: Clone + Send + Sync,
{
    #[cfg(feature = "parallel")]
    let finalized: Vec<Vec<T>> = {
        use rayon::prelude::*;
        locals
            .into_par_iter()
            .zip(offsets.par_iter())
            .map(|(local, offset)| local.iter().map(|s| combine(offset, s)).collect())
            .collect()
    };
    #[cfg(not(feature = "parallel"))]
    let finalized: Vec<Vec<T>> = locals
        .into_iter()
        .zip(offsets)
        .map(|(local, offset)| local.iter().map(|s| combine(offset, s)).collect())
        .collect();

    finalized.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::SquareMatrix;
    use proptest::prelude::*;

    fn add(a: &i64, b: &i64) -> i64 {
        a + b
    }

    #[test]
    fn scan_left_running_sums() {
        let out = scan_left(&[1, 2, 3, 4, 5], &0, add);
        assert_eq!(out, vec![1, 3, 6, 10, 15]);
    }

    #[test]
    fn scan_right_running_sums() {
        let out = scan_right(&[1, 2, 3, 4, 5], &0, add);
        assert_eq!(out, vec![15, 14, 12, 9, 5]);
    }

    #[test]
    fn scan_of_empty_input_is_empty() {
        let out = scan_left(&[] as &[i64], &0, add);
        assert!(out.is_empty());
        let out = scan_left_blocked(&[] as &[i64], 4, &0, add).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn blocked_left_matches_sequential_all_block_sizes() {
        let values: Vec<i64> = (1..=23).collect();
        let expected = scan_left(&values, &0, add);
        for block_size in 1..=24 {
            let got = scan_left_blocked(&values, block_size, &0, add).unwrap();
            assert_eq!(got, expected, "block_size={block_size}");
        }
    }

    #[test]
    fn blocked_right_matches_sequential_all_block_sizes() {
        let values: Vec<i64> = (1..=23).collect();
        let expected = scan_right(&values, &0, add);
        for block_size in 1..=24 {
            let got = scan_right_blocked(&values, block_size, &0, add).unwrap();
            assert_eq!(got, expected, "block_size={block_size}");
        }
    }

    #[test]
    fn zero_block_size_is_rejected() {
        assert!(scan_left_blocked(&[1i64], 0, &0, add).is_err());
        assert!(scan_right_blocked(&[1i64], 0, &0, add).is_err());
    }

    // Deterministic pseudo-random 2x2 matrices for the product scans.
    fn random_matrices(count: usize, seed: u64) -> Vec<SquareMatrix> {
        let mut state = seed;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            (state >> 11) as f64 / (1u64 << 53) as f64
        };
        (0..count)
            .map(|_| {
                SquareMatrix::from_elements(2, vec![next(), next(), next(), next()]).unwrap()
            })
            .collect()
    }

    fn mul(a: &SquareMatrix, b: &SquareMatrix) -> SquareMatrix {
        let mut out = SquareMatrix::new(a.size());
        a.multiply_out(b, &mut out);
        out
    }

    #[test]
    fn blocked_matrix_prefix_products_match_sequential() {
        let mats = random_matrices(16, 42);
        let id = SquareMatrix::identity(2);
        let expected = scan_left(&mats, &id, mul);
        for block_size in [1, 3, 4, 7, 16] {
            let got = scan_left_blocked(&mats, block_size, &id, mul).unwrap();
            for (g, e) in got.iter().zip(&expected) {
                for (a, b) in g.elements().iter().zip(e.elements()) {
                    assert!((a - b).abs() < 1e-12, "block_size={block_size}");
                }
            }
        }
    }

    #[test]
    fn blocked_matrix_suffix_products_match_sequential() {
        let mats = random_matrices(11, 7);
        let id = SquareMatrix::identity(2);
        let expected = scan_right(&mats, &id, mul);
        let got = scan_right_blocked(&mats, 4, &id, mul).unwrap();
        for (g, e) in got.iter().zip(&expected) {
            for (a, b) in g.elements().iter().zip(e.elements()) {
                assert!((a - b).abs() < 1e-12);
            }
        }
    }

    // The reversed product op(x, y) = y · x is associative as well; the
    // forward HMM recurrence relies on it.
    #[test]
    fn reversed_product_scan_accumulates_on_the_left() {
        let mats = random_matrices(6, 3);
        let id = SquareMatrix::identity(2);
        let rev_mul = |x: &SquareMatrix, y: &SquareMatrix| mul(y, x);

        let got = scan_left_blocked(&mats, 2, &id, rev_mul).unwrap();

        // Explicit chain: s_t = v_t · v_{t-1} · … · v_0.
        let mut acc = SquareMatrix::identity(2);
        for (t, m) in mats.iter().enumerate() {
            acc = mul(m, &acc);
            for (a, b) in got[t].elements().iter().zip(acc.elements()) {
                assert!((a - b).abs() < 1e-12);
            }
        }
    }

    proptest! {
        #[test]
        fn blocked_left_equals_fold(values in prop::collection::vec(-1000i64..1000, 0..64),
                                    block_size in 1usize..16) {
            let expected = scan_left(&values, &0, add);
            let got = scan_left_blocked(&values, block_size, &0, add).unwrap();
            prop_assert_eq!(got, expected);
        }

        #[test]
        fn blocked_right_equals_fold(values in prop::collection::vec(-1000i64..1000, 0..64),
                                     block_size in 1usize..16) {
            let expected = scan_right(&values, &0, add);
            let got = scan_right_blocked(&values, block_size, &0, add).unwrap();
            prop_assert_eq!(got, expected);
        }
    }
}
