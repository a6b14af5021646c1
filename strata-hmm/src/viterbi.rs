//! Viterbi decoding: the most likely hidden-state path for a word stream.
//!
//! Both forms run the DP in log-space. The blocked form chunks the
//! sequence: the up-phase walks the blocks in order, carrying only the
//! boundary log-probability vector from block to block and persisting
//! each block's back-pointer array (O(T·N) total); the down-phase chases
//! the pointers from the global argmax back to the start, writing each
//! state at its own global index.

use strata_core::{Result, StrataError};

use crate::blocks::split_blocks;
use crate::model::Hmm;

const EPSILON: f64 = 1e-10;

/// Epsilon-guarded natural logarithm, so zero-probability transitions
/// become strong finite penalties rather than NaN fuel.
#[inline]
fn ln_eps(x: f64) -> f64 {
    (x + EPSILON).ln()
}

/// Decode the most likely state path.
///
/// Returns `(path, log_probability)` where `path[t]` is the most likely
/// state at time `t`.
///
/// # Errors
///
/// Returns an error for empty or invalid observation sequences.
pub fn decode(hmm: &Hmm, observations: &[usize]) -> Result<(Vec<usize>, f64)> {
    hmm.validate_observations(observations)?;

    let n = hmm.n_states();
    let t_len = observations.len();
    let mut delta = vec![f64::NEG_INFINITY; t_len * n];
    let mut psi = vec![0usize; t_len * n];

    let o0 = observations[0];
    for i in 0..n {
        delta[i] = ln_eps(hmm.pi()[i] * hmm.emission(i, o0));
    }

    for t in 1..t_len {
        let ot = observations[t];
        for i in 0..n {
            let mut best_value = f64::NEG_INFINITY;
            let mut best_state = 0;
            for j in 0..n {
                let value = delta[(t - 1) * n + j] + ln_eps(hmm.transition(j, i) * hmm.emission(i, ot));
                if value > best_value {
                    best_value = value;
                    best_state = j;
                }
            }
            delta[t * n + i] = best_value;
            psi[t * n + i] = best_state;
        }
    }

    let mut best_final = 0;
    let mut best_score = f64::NEG_INFINITY;
    for i in 0..n {
        if delta[(t_len - 1) * n + i] > best_score {
            best_score = delta[(t_len - 1) * n + i];
            best_final = i;
        }
    }

    let mut path = vec![0usize; t_len];
    path[t_len - 1] = best_final;
    for t in (0..t_len - 1).rev() {
        path[t] = psi[(t + 1) * n + path[t + 1]];
    }

    Ok((path, best_score))
}

/// Decode block by block.
///
/// Identical output to [`decode`] (the DP formula, scan order and
/// tie-breaking are the same); only the memory access pattern changes.
///
/// # Errors
///
/// Returns an error for invalid sequences or a zero block size.
pub fn decode_blocked(
    hmm: &Hmm,
    observations: &[usize],
    block_size: usize,
) -> Result<(Vec<usize>, f64)> {
    hmm.validate_observations(observations)?;

    let n = hmm.n_states();
    let t_len = observations.len();
    let blocks = split_blocks(observations, block_size, false)?;
    for block in &blocks {
        block.verify_span(t_len, false)?;
    }

    // Up-phase: sequential across blocks; only the boundary
    // log-probability vector crosses a block edge.
    let mut prev = vec![0.0; n];
    let mut cur = vec![0.0; n];
    let mut back_pointers: Vec<Vec<usize>> = Vec::with_capacity(blocks.len());
    for block in &blocks {
        let mut pointers = vec![0usize; block.len() * n];
        let mut first = 0;
        if block.id == 0 {
            let o0 = block.observations[0];
            for i in 0..n {
                prev[i] = ln_eps(hmm.pi()[i] * hmm.emission(i, o0));
            }
            first = 1;
        }
        for bt in first..block.len() {
            let ot = block.observations[bt];
            for i in 0..n {
                let mut best_value = f64::NEG_INFINITY;
                let mut best_state = 0;
                for j in 0..n {
                    let value = prev[j] + ln_eps(hmm.transition(j, i) * hmm.emission(i, ot));
                    if value > best_value {
                        best_value = value;
                        best_state = j;
                    }
                }
                cur[i] = best_value;
                pointers[bt * n + i] = best_state;
            }
            std::mem::swap(&mut prev, &mut cur);
        }
        back_pointers.push(pointers);
    }

    // Global argmax at T−1.
    let mut best_final = 0;
    let mut best_score = f64::NEG_INFINITY;
    for i in 0..n {
        if prev[i] > best_score {
            best_score = prev[i];
            best_final = i;
        }
    }

    // Down-phase: walk the pointers block by block in reverse, emitting
    // the state for global index t at t.
    let mut path = vec![0usize; t_len];
    path[t_len - 1] = best_final;
    for t in (1..t_len).rev() {
        let block_id = t / block_size;
        let bt = t % block_size;
        path[t - 1] = back_pointers[block_id][bt * n + path[t]];
    }

    Ok((path, best_score))
}

/// Log-probability of a specific state path, with the same ε-guarded
/// logs the decoders use. Re-scoring a decoded path reproduces the DP
/// value exactly.
///
/// # Errors
///
/// Returns an error for invalid sequences, a path length mismatch, or an
/// out-of-range state.
pub fn path_log_probability(hmm: &Hmm, path: &[usize], observations: &[usize]) -> Result<f64> {
    hmm.validate_observations(observations)?;
    if path.len() != observations.len() {
        return Err(StrataError::InvalidInput(format!(
            "path length {} != observation length {}",
            path.len(),
            observations.len()
        )));
    }
    for (t, &state) in path.iter().enumerate() {
        if state >= hmm.n_states() {
            return Err(StrataError::InvalidInput(format!(
                "path[{t}] = {state} out of range (n_states = {})",
                hmm.n_states()
            )));
        }
    }

    let mut score = ln_eps(hmm.pi()[path[0]] * hmm.emission(path[0], observations[0]));
    for t in 1..observations.len() {
        score += ln_eps(hmm.transition(path[t - 1], path[t]) * hmm.emission(path[t], observations[t]));
    }
    Ok(score)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn two_state_hmm() -> Hmm {
        Hmm::new(
            2,
            2,
            vec![0.6, 0.4],
            vec![0.7, 0.3, 0.2, 0.8],
            vec![0.9, 0.1, 0.1, 0.9],
        )
        .unwrap()
    }

    #[test]
    fn path_length_and_state_range() {
        let hmm = two_state_hmm();
        let observations = vec![0, 1, 0, 0, 1, 0, 1, 1, 0, 0];
        let (path, score) = decode(&hmm, &observations).unwrap();
        assert_eq!(path.len(), observations.len());
        assert!(score.is_finite());
        for &state in &path {
            assert!(state < hmm.n_states());
        }
    }

    #[test]
    fn separated_emissions_recover_the_regimes() {
        let hmm = two_state_hmm();
        let observations = vec![0, 0, 1, 1, 0, 1];
        let (path, score) = decode(&hmm, &observations).unwrap();

        // The strongly separated emissions pin the unambiguous positions.
        assert_eq!(&path[..4], &[0, 0, 1, 1]);
        assert_eq!(path[5], 1);

        // Re-scoring the decoded path reproduces the DP value.
        let rescored = path_log_probability(&hmm, &path, &observations).unwrap();
        assert!((rescored - score).abs() < 1e-12, "{rescored} vs {score}");
    }

    #[test]
    fn decoded_path_beats_other_paths() {
        let hmm = two_state_hmm();
        let observations = vec![0, 0, 1, 0, 1, 1];
        let (path, score) = decode(&hmm, &observations).unwrap();

        // Exhaustively check optimality on this small instance.
        let t_len = observations.len();
        for candidate in 0..(1usize << t_len) {
            let states: Vec<usize> = (0..t_len).map(|t| (candidate >> t) & 1).collect();
            let value = path_log_probability(&hmm, &states, &observations).unwrap();
            assert!(
                value <= score + 1e-12,
                "path {states:?} scores {value} > decoded {score}"
            );
        }
        let decoded_value = path_log_probability(&hmm, &path, &observations).unwrap();
        assert!((decoded_value - score).abs() < 1e-12);
    }

    #[test]
    fn blocked_decode_matches_sequential() {
        let hmm = two_state_hmm();
        let observations = hmm.generate(1000, 19);
        let (expected_path, expected_score) = decode(&hmm, &observations).unwrap();

        for block_size in [1, 7, 16, 1000, 4096] {
            let (path, score) = decode_blocked(&hmm, &observations, block_size).unwrap();
            assert_eq!(path, expected_path, "block_size={block_size}");
            assert!(
                (score - expected_score).abs() < 1e-12,
                "block_size={block_size}: {score} vs {expected_score}"
            );
        }
    }

    #[test]
    fn blocked_decode_handles_runs_spanning_blocks() {
        let hmm = two_state_hmm();
        // A state-1 run crossing a block edge at index 4.
        let observations = vec![0, 0, 0, 1, 1, 1, 1, 0, 0, 0];
        let (sequential, _) = decode(&hmm, &observations).unwrap();
        let (blocked, _) = decode_blocked(&hmm, &observations, 4).unwrap();
        assert_eq!(sequential, blocked);
    }

    #[test]
    fn single_observation_decodes() {
        let hmm = two_state_hmm();
        let (path, score) = decode(&hmm, &[1]).unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0], 1);
        assert!(score.is_finite());
        let (blocked_path, blocked_score) = decode_blocked(&hmm, &[1], 16).unwrap();
        assert_eq!(blocked_path, path);
        assert!((blocked_score - score).abs() < 1e-12);
    }

    #[test]
    fn error_cases() {
        let hmm = two_state_hmm();
        assert!(decode(&hmm, &[]).is_err());
        assert!(decode(&hmm, &[0, 5]).is_err());
        assert!(decode_blocked(&hmm, &[0, 1], 0).is_err());
        assert!(path_log_probability(&hmm, &[0], &[0, 1]).is_err());
        assert!(path_log_probability(&hmm, &[0, 9], &[0, 1]).is_err());
    }
}
