//! Baum-Welch re-estimation of π and A.
//!
//! Two equivalent paths share the scaled forward-backward math:
//!
//! - **Sequential** — the classical recurrences with per-step scaling
//!   constants c_t, preallocated α/β buffers and double-buffered
//!   parameter commits.
//! - **Block-parallel** — the recurrences rewritten as chained products
//!   of per-step transition operators: `α̂_t` falls out of the prefix
//!   products of the TA operators (`TA_t(i,j) = A[j][i]·B[i][o_t]`,
//!   diagonal `π_i·B[i][o_0]` at t = 0), `β̂_t` out of the suffix
//!   products of the TB operators
//!   (`TB_t(i,j) = A[i][j]·B[j][o_{t+1}]·c_t`, diagonal `c_{T−1}` at the
//!   end). Each block scans its operators locally through the core scan
//!   engine, the coordinator reduces the block edges, and the blocks
//!   finalize and accumulate their ξ contributions independently.
//!
//! B is never modified: the emission rows come from the EM theme fitter
//! and stay fixed. The emission matrix enters only through the operators.
//!
//! Training dispatches on problem size (`T·N²` against a threshold); the
//! two paths agree on the learned π and A to ~1e-9.

use strata_core::matrix::{l1_distance, normalize_in_place};
use strata_core::scan::{scan_left, scan_right};
use strata_core::{Executor, Result, RunControl, SquareMatrix, StrataError, Summarizable};
use tracing::{debug, warn};

use crate::blocks::{split_blocks, ObservationBlock};
use crate::model::Hmm;

/// Iterations with a non-positive normalization denominator tolerated
/// in a row before training is declared diverged.
const MAX_CONSECUTIVE_DEGENERACIES: usize = 3;

// ---------------------------------------------------------------------------
// Configuration and report
// ---------------------------------------------------------------------------

/// Configuration for Baum-Welch training.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BwConfig {
    /// Convergence threshold on ‖π* − π‖₁.
    pub pi_threshold: f64,
    /// Convergence threshold on ‖A* − A‖₁.
    pub a_threshold: f64,
    /// Iteration cap.
    pub max_iterations: usize,
    /// Observations per block in the block-parallel path.
    pub block_size: usize,
    /// Always use the sequential path, regardless of problem size.
    pub force_sequential: bool,
    /// Problems with `T·N²` below this run sequentially.
    pub sequential_cost_threshold: u64,
}

impl Default for BwConfig {
    fn default() -> Self {
        Self {
            pi_threshold: 1e-4,
            a_threshold: 1e-4,
            max_iterations: 100,
            block_size: 1 << 20,
            force_sequential: false,
            sequential_cost_threshold: 1_000_000_000,
        }
    }
}

impl BwConfig {
    /// Check parameter ranges.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::InvalidConfig`] on any out-of-range value.
    pub fn validate(&self) -> Result<()> {
        if !(self.pi_threshold > 0.0) {
            return Err(StrataError::InvalidConfig(format!(
                "pi_threshold must be > 0, got {}",
                self.pi_threshold
            )));
        }
        if !(self.a_threshold > 0.0) {
            return Err(StrataError::InvalidConfig(format!(
                "a_threshold must be > 0, got {}",
                self.a_threshold
            )));
        }
        if self.max_iterations == 0 {
            return Err(StrataError::InvalidConfig(
                "max_iterations must be >= 1".into(),
            ));
        }
        if self.block_size == 0 {
            return Err(StrataError::InvalidConfig("block_size must be >= 1".into()));
        }
        Ok(())
    }
}

/// Outcome of a training run.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrainReport {
    /// Iterations actually run.
    pub iterations: usize,
    /// Whether both L1 deltas dropped below their thresholds.
    pub converged: bool,
    /// ‖π* − π‖₁ of the last committed iteration.
    pub pi_delta: f64,
    /// ‖A* − A‖₁ of the last committed iteration.
    pub a_delta: f64,
    /// `−Σ_t ln c_t` of the last committed iteration (the likelihood of
    /// the pre-update parameters).
    pub log_likelihood: f64,
}

impl Summarizable for TrainReport {
    fn summary(&self) -> String {
        format!(
            "TrainReport: iterations={}, log_likelihood={:.6}, pi_delta={:.2e}, a_delta={:.2e}{}",
            self.iterations,
            self.log_likelihood,
            self.pi_delta,
            self.a_delta,
            if self.converged { " (converged)" } else { "" },
        )
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Train π and A on an observation sequence, dispatching between the
/// sequential and block-parallel paths on problem size.
///
/// # Errors
///
/// - [`StrataError::InvalidConfig`] / [`StrataError::InvalidInput`] for
///   bad parameters or sequences shorter than two observations
/// - [`StrataError::Diverged`] after three consecutive degenerate
///   iterations
/// - [`StrataError::Cancelled`] / [`StrataError::TimedOut`] from
///   `control`; parameters committed by completed iterations survive in
///   `hmm`
pub fn train<E: Executor>(
    hmm: &mut Hmm,
    observations: &[usize],
    config: &BwConfig,
    executor: &E,
    control: &RunControl,
) -> Result<TrainReport> {
    let n = hmm.n_states() as u64;
    let cost = (observations.len() as u64).saturating_mul(n * n);
    if config.force_sequential || cost < config.sequential_cost_threshold {
        train_sequential(hmm, observations, config, control)
    } else {
        train_blocked(hmm, observations, config, executor, control)
    }
}

fn validate_training_input(hmm: &Hmm, observations: &[usize], config: &BwConfig) -> Result<()> {
    config.validate()?;
    hmm.validate_observations(observations)?;
    if observations.len() < 2 {
        return Err(StrataError::InvalidInput(
            "training needs at least two observations".into(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Sequential path
// ---------------------------------------------------------------------------

struct SequentialBuffers {
    alphas: Vec<f64>,
    betas: Vec<f64>,
    scales: Vec<f64>,
    pi_star: Vec<f64>,
    a_star: Vec<f64>,
}

/// Train with the classical scaled forward-backward recurrences.
///
/// # Errors
///
/// See [`train`].
pub fn train_sequential(
    hmm: &mut Hmm,
    observations: &[usize],
    config: &BwConfig,
    control: &RunControl,
) -> Result<TrainReport> {
    validate_training_input(hmm, observations, config)?;

    let n = hmm.n_states();
    let t_len = observations.len();
    let sparse = hmm.has_background_self_loop();
    let mut buffers = SequentialBuffers {
        alphas: vec![0.0; n * t_len],
        betas: vec![0.0; n * t_len],
        scales: vec![0.0; t_len],
        pi_star: vec![0.0; n],
        a_star: vec![0.0; n * n],
    };

    let mut iterations = 0;
    let mut converged = false;
    let mut pi_delta = f64::INFINITY;
    let mut a_delta = f64::INFINITY;
    let mut log_likelihood = f64::NEG_INFINITY;
    let mut consecutive_degeneracies = 0;

    for step in 0..config.max_iterations {
        control.checkpoint()?;
        iterations = step + 1;
        match sequential_iteration(hmm, observations, sparse, &mut buffers) {
            Ok(ll) => {
                consecutive_degeneracies = 0;
                pi_delta = l1_distance(&hmm.pi, &buffers.pi_star);
                a_delta = l1_distance(&hmm.a, &buffers.a_star);
                std::mem::swap(&mut hmm.pi, &mut buffers.pi_star);
                std::mem::swap(&mut hmm.a, &mut buffers.a_star);
                log_likelihood = ll;
                debug!(step, pi_delta, a_delta, log_likelihood, "baum-welch iteration");
                if pi_delta < config.pi_threshold && a_delta < config.a_threshold {
                    converged = true;
                    break;
                }
            }
            Err(StrataError::Diverged(reason)) => {
                consecutive_degeneracies += 1;
                warn!(
                    step,
                    consecutive = consecutive_degeneracies,
                    %reason,
                    "degenerate baum-welch iteration, retaining previous parameters"
                );
                if consecutive_degeneracies >= MAX_CONSECUTIVE_DEGENERACIES {
                    return Err(StrataError::Diverged(format!(
                        "{consecutive_degeneracies} consecutive degenerate iterations: {reason}"
                    )));
                }
            }
            Err(other) => return Err(other),
        }
    }

    Ok(TrainReport {
        iterations,
        converged,
        pi_delta,
        a_delta,
        log_likelihood,
    })
}

/// One scaled forward-backward pass; writes π* and A* into the buffers
/// and returns the log-likelihood of the current parameters.
fn sequential_iteration(
    hmm: &Hmm,
    observations: &[usize],
    sparse: bool,
    buffers: &mut SequentialBuffers,
) -> Result<f64> {
    let n = hmm.n_states;
    let m = hmm.n_symbols;
    let t_len = observations.len();
    let (pi, a, b) = (&hmm.pi, &hmm.a, &hmm.b);
    let SequentialBuffers {
        alphas,
        betas,
        scales,
        pi_star,
        a_star,
    } = buffers;

    // Forward pass, rescaling every step.
    {
        let o0 = observations[0];
        let mut sum = 0.0;
        for i in 0..n {
            let value = pi[i] * b[i * m + o0];
            alphas[i] = value;
            sum += value;
        }
        if sum <= 0.0 {
            return Err(degeneracy_at(0));
        }
        let scale = 1.0 / sum;
        scales[0] = scale;
        for value in alphas[..n].iter_mut() {
            *value *= scale;
        }
    }
    for t in 1..t_len {
        let ot = observations[t];
        let mut sum = 0.0;
        for i in 0..n {
            let mut res = 0.0;
            if sparse && i != 0 {
                // Only the background and the self-loop can reach state i.
                res += alphas[(t - 1) * n] * a[i];
                res += alphas[(t - 1) * n + i] * a[i * n + i];
            } else {
                for j in 0..n {
                    res += alphas[(t - 1) * n + j] * a[j * n + i];
                }
            }
            let value = res * b[i * m + ot];
            alphas[t * n + i] = value;
            sum += value;
        }
        if sum <= 0.0 {
            return Err(degeneracy_at(t));
        }
        let scale = 1.0 / sum;
        scales[t] = scale;
        for value in alphas[t * n..(t + 1) * n].iter_mut() {
            *value *= scale;
        }
    }

    // Backward pass with the forward scales baked in.
    for value in betas[(t_len - 1) * n..].iter_mut() {
        *value = 1.0;
    }
    for t in (1..t_len).rev() {
        let ot = observations[t];
        for i in 0..n {
            let mut res = 0.0;
            if sparse && i != 0 {
                res += betas[t * n] * a[i * n] * b[ot] * scales[t - 1];
                res += betas[t * n + i] * a[i * n + i] * b[i * m + ot] * scales[t - 1];
            } else {
                for j in 0..n {
                    res += betas[t * n + j] * a[i * n + j] * b[j * m + ot] * scales[t - 1];
                }
            }
            betas[(t - 1) * n + i] = res;
        }
    }

    // π* from the state posteriors at t = 0.
    {
        let mut sum = 0.0;
        for i in 0..n {
            let value = alphas[i] * betas[i] / scales[0];
            pi_star[i] = value;
            sum += value;
        }
        if sum <= 0.0 {
            return Err(StrataError::Diverged(
                "initial distribution lost all mass".into(),
            ));
        }
        for value in pi_star.iter_mut() {
            *value /= sum;
        }
    }

    // ξ sums into A*. B is held fixed, so t = T−1 contributes nothing.
    a_star.fill(0.0);
    for t in 0..t_len - 1 {
        let ot1 = observations[t + 1];
        for i in 0..n {
            if sparse && i != 0 {
                a_star[i * n] += alphas[t * n + i] * a[i * n] * betas[(t + 1) * n] * b[ot1];
                a_star[i * n + i] +=
                    alphas[t * n + i] * a[i * n + i] * betas[(t + 1) * n + i] * b[i * m + ot1];
            } else {
                for j in 0..n {
                    a_star[i * n + j] += alphas[t * n + i]
                        * a[i * n + j]
                        * betas[(t + 1) * n + j]
                        * b[j * m + ot1];
                }
            }
        }
    }
    for i in 0..n {
        if normalize_in_place(&mut a_star[i * n..(i + 1) * n]) <= 0.0 {
            return Err(StrataError::Diverged(format!(
                "transition row {i} lost all mass"
            )));
        }
    }

    Ok(-scales.iter().map(|c| c.ln()).sum::<f64>())
}

fn degeneracy_at(t: usize) -> StrataError {
    StrataError::Diverged(format!("forward pass lost all probability mass at t={t}"))
}

// ---------------------------------------------------------------------------
// Block-parallel path
// ---------------------------------------------------------------------------

/// Per-block scratch carried through the phases of one iteration.
struct BlockState {
    /// TA prefix products (phases 1–2), then cleared.
    ta: Vec<SquareMatrix>,
    /// α̂ vectors, `len × N`.
    alphas: Vec<f64>,
    /// Scaling constants c_t for the block's span.
    scales: Vec<f64>,
    /// TB suffix products (phases 3–4), then cleared.
    tb: Vec<SquareMatrix>,
    /// β̂ vectors, `len × N`.
    betas: Vec<f64>,
}

struct BlockedEstimates {
    pi_star: Vec<f64>,
    a_star: Vec<f64>,
    log_likelihood: f64,
}

/// Train with the block-parallel scan reformulation.
///
/// # Errors
///
/// See [`train`].
pub fn train_blocked<E: Executor>(
    hmm: &mut Hmm,
    observations: &[usize],
    config: &BwConfig,
    executor: &E,
    control: &RunControl,
) -> Result<TrainReport> {
    validate_training_input(hmm, observations, config)?;

    let t_len = observations.len();
    let sparse = hmm.has_background_self_loop();
    let blocks = split_blocks(observations, config.block_size, true)?;
    for block in &blocks {
        block.verify_span(t_len, true)?;
    }

    let mut iterations = 0;
    let mut converged = false;
    let mut pi_delta = f64::INFINITY;
    let mut a_delta = f64::INFINITY;
    let mut log_likelihood = f64::NEG_INFINITY;
    let mut consecutive_degeneracies = 0;

    for step in 0..config.max_iterations {
        control.checkpoint()?;
        iterations = step + 1;
        match blocked_iteration(hmm, &blocks, t_len, sparse, executor) {
            Ok(estimates) => {
                consecutive_degeneracies = 0;
                pi_delta = l1_distance(&hmm.pi, &estimates.pi_star);
                a_delta = l1_distance(&hmm.a, &estimates.a_star);
                hmm.pi = estimates.pi_star;
                hmm.a = estimates.a_star;
                log_likelihood = estimates.log_likelihood;
                debug!(step, pi_delta, a_delta, log_likelihood, "blocked baum-welch iteration");
                if pi_delta < config.pi_threshold && a_delta < config.a_threshold {
                    converged = true;
                    break;
                }
            }
            Err(StrataError::Diverged(reason)) => {
                consecutive_degeneracies += 1;
                warn!(
                    step,
                    consecutive = consecutive_degeneracies,
                    %reason,
                    "degenerate blocked baum-welch iteration, retaining previous parameters"
                );
                if consecutive_degeneracies >= MAX_CONSECUTIVE_DEGENERACIES {
                    return Err(StrataError::Diverged(format!(
                        "{consecutive_degeneracies} consecutive degenerate iterations: {reason}"
                    )));
                }
            }
            Err(other) => return Err(other),
        }
    }

    Ok(TrainReport {
        iterations,
        converged,
        pi_delta,
        a_delta,
        log_likelihood,
    })
}

/// One block-parallel iteration: TA scans, forward reduce, α̂, c_t, TB
/// scans, backward reduce, β̂, ξ sums, and the re-estimated parameters.
fn blocked_iteration<E: Executor>(
    hmm: &Hmm,
    blocks: &[ObservationBlock],
    t_len: usize,
    sparse: bool,
    executor: &E,
) -> Result<BlockedEstimates> {
    let n = hmm.n_states;
    let m = hmm.n_symbols;
    let num_blocks = blocks.len();
    let identity = SquareMatrix::identity(n);

    // op(earlier, later) = later · earlier: prefix products accumulate on
    // the left, the way the forward chain applies its operators.
    let forward_op = |acc: &SquareMatrix, v: &SquareMatrix| {
        let mut out = SquareMatrix::new(n);
        mul_left_structured(v, acc, &mut out, sparse);
        let norm = out.raw_norm1();
        if norm > 0.0 {
            out.scalar_divide(norm);
        }
        out
    };
    // Suffix products keep the natural order; the baked-in c_t constants
    // already keep their magnitudes near one, so no rescaling.
    let backward_op = |v: &SquareMatrix, acc: &SquareMatrix| {
        let mut out = SquareMatrix::new(n);
        mul_left_structured(v, acc, &mut out, sparse);
        out
    };

    // Phase 1: build TA operators and scan them within each block.
    let states = executor.map_blocks(vec![(); num_blocks], &|block_id, _: ()| -> Result<BlockState> {
        let block = &blocks[block_id];
        let mut operators = Vec::with_capacity(block.len());
        for bt in 0..block.len() {
            let t = block.start + bt;
            let mut ta = SquareMatrix::new(n);
            if t == 0 {
                let o0 = block.observations[0];
                for i in 0..n {
                    ta.set(i, i, hmm.pi[i] * hmm.b[i * m + o0]);
                }
            } else {
                let ot = block.observations[bt];
                for i in 0..n {
                    for j in 0..n {
                        ta.set(i, j, hmm.a[j * n + i] * hmm.b[i * m + ot]);
                    }
                }
            }
            let norm = ta.raw_norm1();
            if norm <= 0.0 {
                return Err(StrataError::Diverged(format!(
                    "block {block_id}: forward operator at t={t} has no mass"
                )));
            }
            ta.scalar_divide(norm);
            operators.push(ta);
        }
        let ta = scan_left(&operators, &identity, forward_op);
        if ta.iter().any(|prefix| prefix.raw_norm1() <= 0.0) {
            return Err(StrataError::Diverged(format!(
                "block {block_id}: forward prefix lost all mass"
            )));
        }
        Ok(BlockState {
            ta,
            alphas: Vec::new(),
            scales: Vec::new(),
            tb: Vec::new(),
            betas: Vec::new(),
        })
    });
    let states = collect_block_results(states)?;

    // Reduce the per-block last prefixes into global forward offsets.
    let mut forward_offsets: Vec<Option<SquareMatrix>> = vec![None; num_blocks];
    {
        let mut acc: Option<SquareMatrix> = None;
        for (block_id, state) in states.iter().enumerate() {
            let last = state.ta.last().expect("blocks are non-empty");
            let next = match &acc {
                None => last.clone(),
                Some(prefix) => {
                    forward_offsets[block_id] = Some(prefix.clone());
                    let mut out = SquareMatrix::new(n);
                    last.multiply_out(prefix, &mut out);
                    let norm = out.raw_norm1();
                    if norm <= 0.0 {
                        return Err(StrataError::Diverged(format!(
                            "forward offset for block {block_id} lost all mass"
                        )));
                    }
                    out.scalar_divide(norm);
                    out
                }
            };
            acc = Some(next);
        }
    }

    // Phase 2: finalize the prefixes and extract α̂ by row sums.
    let states = executor.map_blocks(states, &|block_id, mut state: BlockState| -> Result<BlockState> {
        let block = &blocks[block_id];
        if let Some(offset) = &forward_offsets[block_id] {
            let mut scratch = SquareMatrix::new(n);
            for prefix in &mut state.ta {
                prefix.multiply_out(offset, &mut scratch);
                let norm = scratch.raw_norm1();
                if norm <= 0.0 {
                    return Err(StrataError::Diverged(format!(
                        "block {block_id}: finalized forward prefix lost all mass"
                    )));
                }
                scratch.scalar_divide(norm);
                std::mem::swap(prefix, &mut scratch);
            }
        }
        state.alphas = vec![0.0; block.len() * n];
        for (bt, prefix) in state.ta.iter().enumerate() {
            prefix.apply_to_ones(&mut state.alphas[bt * n..(bt + 1) * n]);
        }
        state.ta.clear();
        Ok(state)
    });
    let states = collect_block_results(states)?;

    let last_alphas: Vec<Vec<f64>> = states
        .iter()
        .map(|state| state.alphas[state.alphas.len() - n..].to_vec())
        .collect();

    // Phase 3: scaling constants, TB operators, in-block suffix scan.
    let states = executor.map_blocks(states, &|block_id, mut state: BlockState| -> Result<BlockState> {
        let block = &blocks[block_id];
        let len = block.len();
        state.scales = vec![0.0; len];
        {
            let o0 = block.observations[0];
            let mut den = 0.0;
            if block.start == 0 {
                for i in 0..n {
                    den += hmm.pi[i] * hmm.b[i * m + o0];
                }
            } else {
                let prev_alpha = &last_alphas[block_id - 1];
                for i in 0..n {
                    for j in 0..n {
                        den += hmm.a[j * n + i] * hmm.b[i * m + o0] * prev_alpha[j];
                    }
                }
            }
            if den <= 0.0 {
                return Err(StrataError::Diverged(format!(
                    "block {block_id}: scaling denominator at block offset 0 is zero"
                )));
            }
            state.scales[0] = 1.0 / den;
        }
        for bt in 1..len {
            let ot = block.observations[bt];
            let mut den = 0.0;
            for i in 0..n {
                for j in 0..n {
                    den += hmm.a[j * n + i] * hmm.b[i * m + ot] * state.alphas[(bt - 1) * n + j];
                }
            }
            if den <= 0.0 {
                return Err(StrataError::Diverged(format!(
                    "block {block_id}: scaling denominator at block offset {bt} is zero"
                )));
            }
            state.scales[bt] = 1.0 / den;
        }

        let mut operators = Vec::with_capacity(len);
        for bt in 0..len {
            let t = block.start + bt;
            let mut tb = SquareMatrix::new(n);
            if t == t_len - 1 {
                for i in 0..n {
                    tb.set(i, i, state.scales[bt]);
                }
            } else {
                let ot1 = block.observations[bt + 1];
                for i in 0..n {
                    for j in 0..n {
                        tb.set(i, j, hmm.a[i * n + j] * hmm.b[j * m + ot1] * state.scales[bt]);
                    }
                }
            }
            if tb.raw_norm1() <= 0.0 {
                return Err(StrataError::Diverged(format!(
                    "block {block_id}: backward operator at t={t} has no mass"
                )));
            }
            operators.push(tb);
        }
        state.tb = scan_right(&operators, &identity, backward_op);
        Ok(state)
    });
    let states = collect_block_results(states)?;

    // Reduce the per-block first suffixes into global backward offsets.
    let mut backward_offsets: Vec<Option<SquareMatrix>> = vec![None; num_blocks];
    {
        let mut acc: Option<SquareMatrix> = None;
        for (block_id, state) in states.iter().enumerate().rev() {
            let first = &state.tb[0];
            let next = match &acc {
                None => first.clone(),
                Some(suffix) => {
                    backward_offsets[block_id] = Some(suffix.clone());
                    let mut out = SquareMatrix::new(n);
                    first.multiply_out(suffix, &mut out);
                    out
                }
            };
            acc = Some(next);
        }
    }

    // Phase 4: finalize the suffixes and extract β̂ by row sums.
    let states = executor.map_blocks(states, &|block_id, mut state: BlockState| -> BlockState {
        let block = &blocks[block_id];
        if let Some(offset) = &backward_offsets[block_id] {
            let mut scratch = SquareMatrix::new(n);
            for suffix in &mut state.tb {
                suffix.multiply_out(offset, &mut scratch);
                std::mem::swap(suffix, &mut scratch);
            }
        }
        state.betas = vec![0.0; block.len() * n];
        for (bt, suffix) in state.tb.iter().enumerate() {
            suffix.apply_to_ones(&mut state.betas[bt * n..(bt + 1) * n]);
        }
        state.tb.clear();
        state
    });

    let first_betas: Vec<Vec<f64>> = states.iter().map(|state| state.betas[..n].to_vec()).collect();

    // Phase 5: per-block ξ sums; block 0 also yields the raw π*.
    let contributions = executor.map_blocks(
        states,
        &|block_id, state: BlockState| -> (SquareMatrix, Option<Vec<f64>>, f64) {
            let block = &blocks[block_id];
            let len = block.len();
            let mut khis = SquareMatrix::new(n);
            for bt in 0..len - 1 {
                let ot1 = block.observations[bt + 1];
                accumulate_khis(
                    &mut khis,
                    &state.alphas[bt * n..(bt + 1) * n],
                    &state.betas[(bt + 1) * n..(bt + 2) * n],
                    hmm,
                    ot1,
                    sparse,
                );
            }
            // The block's last position pairs with the next block's first β̂;
            // the final position of the sequence contributes nothing.
            if block_id + 1 < num_blocks {
                let bt = len - 1;
                let ot1 = block.observations[bt + 1];
                accumulate_khis(
                    &mut khis,
                    &state.alphas[bt * n..(bt + 1) * n],
                    &first_betas[block_id + 1],
                    hmm,
                    ot1,
                    sparse,
                );
            }
            let pi_raw = (block_id == 0).then(|| {
                state.alphas[..n]
                    .iter()
                    .zip(&state.betas[..n])
                    .map(|(alpha, beta)| alpha * beta)
                    .collect()
            });
            let ll_part: f64 = state.scales.iter().map(|c| c.ln()).sum();
            (khis, pi_raw, ll_part)
        },
    );

    // Coordinator: sum ξ across blocks, renormalize, assemble π*.
    let mut a_star = vec![0.0; n * n];
    let mut pi_star = vec![0.0; n];
    let mut log_likelihood = 0.0;
    for (khis, pi_raw, ll_part) in contributions {
        for (slot, &value) in a_star.iter_mut().zip(khis.elements()) {
            *slot += value;
        }
        if let Some(raw) = pi_raw {
            pi_star.copy_from_slice(&raw);
        }
        log_likelihood -= ll_part;
    }
    for i in 0..n {
        if normalize_in_place(&mut a_star[i * n..(i + 1) * n]) <= 0.0 {
            return Err(StrataError::Diverged(format!(
                "transition row {i} lost all mass"
            )));
        }
    }
    if normalize_in_place(&mut pi_star) <= 0.0 {
        return Err(StrataError::Diverged(
            "initial distribution lost all mass".into(),
        ));
    }

    Ok(BlockedEstimates {
        pi_star,
        a_star,
        log_likelihood,
    })
}

/// ξ_t(i,j) = α̂_t(i)·A[i][j]·β̂_{t+1}(j)·B[j][o_{t+1}], accumulated into
/// `khis`. With the sparse support, row i ≠ 0 only transitions to 0 or i.
fn accumulate_khis(
    khis: &mut SquareMatrix,
    alpha: &[f64],
    beta_next: &[f64],
    hmm: &Hmm,
    ot1: usize,
    sparse: bool,
) {
    let n = hmm.n_states;
    let m = hmm.n_symbols;
    for i in 0..n {
        if sparse && i != 0 {
            let khi0 = alpha[i] * hmm.a[i * n] * beta_next[0] * hmm.b[ot1];
            khis.set(i, 0, khis.get(i, 0) + khi0);
            let khii = alpha[i] * hmm.a[i * n + i] * beta_next[i] * hmm.b[i * m + ot1];
            khis.set(i, i, khis.get(i, i) + khii);
        } else {
            for j in 0..n {
                let khi = alpha[i] * hmm.a[i * n + j] * beta_next[j] * hmm.b[j * m + ot1];
                khis.set(i, j, khis.get(i, j) + khi);
            }
        }
    }
}

/// out = v · acc. When the sparse background + self-loop support holds,
/// row i ≠ 0 of a per-step operator is nonzero only at columns 0 and i.
fn mul_left_structured(v: &SquareMatrix, acc: &SquareMatrix, out: &mut SquareMatrix, sparse: bool) {
    if !sparse {
        v.multiply_out(acc, out);
        return;
    }
    let n = v.size();
    for j in 0..n {
        let mut el = 0.0;
        for k in 0..n {
            el += v.get(0, k) * acc.get(k, j);
        }
        out.set(0, j, el);
    }
    for i in 1..n {
        let vi0 = v.get(i, 0);
        let vii = v.get(i, i);
        for j in 0..n {
            out.set(i, j, vi0 * acc.get(0, j) + vii * acc.get(i, j));
        }
    }
}

fn collect_block_results<T>(results: Vec<Result<T>>) -> Result<Vec<T>> {
    results.into_iter().collect()
}

// ===========================================================================
// Tests
// ===========================================================================
