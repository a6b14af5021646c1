//! HMM parameter storage and construction.
//!
//! Parameters live in probability space as flat row-major vectors:
//! `pi` (length N), `a` (N×N) and `b` (N×M). State 0 is always the
//! background; states 1..=K are themes.

use std::collections::HashMap;

use strata_core::{Result, StrataError, Vocabulary};

/// A discrete hidden Markov model over vocabulary words.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Hmm {
    /// Number of hidden states N (background + K themes).
    pub(crate) n_states: usize,
    /// Number of observable states M (vocabulary size).
    pub(crate) n_symbols: usize,
    /// Initial state distribution, length N.
    pub(crate) pi: Vec<f64>,
    /// Transition matrix A[i][j] = P(state_j | state_i), row-major N×N.
    pub(crate) a: Vec<f64>,
    /// Emission matrix B[i][o] = P(word_o | state_i), row-major N×M.
    pub(crate) b: Vec<f64>,
}

impl Hmm {
    /// Create an HMM from explicit parameters, validating dimensions and
    /// probability constraints.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `n_states` or `n_symbols` is zero
    /// - Vector dimensions do not match the declared sizes
    /// - Any probability row does not sum to approximately 1.0 (tolerance 1e-6)
    pub fn new(
        n_states: usize,
        n_symbols: usize,
        pi: Vec<f64>,
        a: Vec<f64>,
        b: Vec<f64>,
    ) -> Result<Self> {
        if n_states == 0 {
            return Err(StrataError::InvalidInput("n_states must be > 0".into()));
        }
        if n_symbols == 0 {
            return Err(StrataError::InvalidInput("n_symbols must be > 0".into()));
        }
        if pi.len() != n_states {
            return Err(StrataError::InvalidInput(format!(
                "pi length {} != n_states {}",
                pi.len(),
                n_states
            )));
        }
        if a.len() != n_states * n_states {
            return Err(StrataError::InvalidInput(format!(
                "a length {} != n_states*n_states {}",
                a.len(),
                n_states * n_states
            )));
        }
        if b.len() != n_states * n_symbols {
            return Err(StrataError::InvalidInput(format!(
                "b length {} != n_states*n_symbols {}",
                b.len(),
                n_states * n_symbols
            )));
        }

        let tol = 1e-6;

        let pi_sum: f64 = pi.iter().sum();
        if (pi_sum - 1.0).abs() > tol {
            return Err(StrataError::InvalidInput(format!(
                "pi sums to {pi_sum}, expected ~1.0"
            )));
        }

        for i in 0..n_states {
            let row_sum: f64 = a[i * n_states..(i + 1) * n_states].iter().sum();
            if (row_sum - 1.0).abs() > tol {
                return Err(StrataError::InvalidInput(format!(
                    "transition row {i} sums to {row_sum}, expected ~1.0"
                )));
            }
        }

        for i in 0..n_states {
            let row_sum: f64 = b[i * n_symbols..(i + 1) * n_symbols].iter().sum();
            if (row_sum - 1.0).abs() > tol {
                return Err(StrataError::InvalidInput(format!(
                    "emission row {i} sums to {row_sum}, expected ~1.0"
                )));
            }
        }

        Ok(Self {
            n_states,
            n_symbols,
            pi,
            a,
            b,
        })
    }

    /// Build a themed HMM from per-state word distributions over a
    /// vocabulary: row 0 is the background, rows 1..=K the themes.
    ///
    /// Every distribution is densified over the full vocabulary, floored
    /// at `floor` and renormalized, so B stays strictly positive and
    /// row-stochastic. π and A get the themed initial conditions: the
    /// background keeps half its mass and spreads the other half over
    /// themes, each theme splits its mass between a self-loop and a
    /// return to the background (the sparse support the training inner
    /// loops exploit).
    ///
    /// # Errors
    ///
    /// Returns an error for an empty distribution set, a word id outside
    /// the vocabulary, a negative probability, or a non-positive floor.
    pub fn from_word_distributions(
        vocabulary: &Vocabulary,
        distributions: &[HashMap<usize, f64>],
        floor: f64,
    ) -> Result<Self> {
        if distributions.is_empty() {
            return Err(StrataError::EmptyInput(
                "no state distributions provided".into(),
            ));
        }
        if !(floor > 0.0) {
            return Err(StrataError::InvalidConfig(format!(
                "floor must be positive, got {floor}"
            )));
        }
        let n = distributions.len();
        let m = vocabulary.len();

        let mut b = vec![0.0; n * m];
        for (i, distribution) in distributions.iter().enumerate() {
            let row = &mut b[i * m..(i + 1) * m];
            for (&word, &p) in distribution {
                if word >= m {
                    return Err(StrataError::InvalidInput(format!(
                        "state {i}: word id {word} outside vocabulary of size {m}"
                    )));
                }
                if !p.is_finite() || p < 0.0 {
                    return Err(StrataError::InvalidInput(format!(
                        "state {i}: probability for word {word} is {p}"
                    )));
                }
                row[word] = p;
            }
            for slot in row.iter_mut() {
                *slot = slot.max(floor);
            }
            let sum: f64 = row.iter().sum();
            for slot in row.iter_mut() {
                *slot /= sum;
            }
        }

        let (pi, a) = themed_initial_conditions(n);
        Self::new(n, m, pi, a, b)
    }

    /// Number of hidden states.
    pub fn n_states(&self) -> usize {
        self.n_states
    }

    /// Number of observable states.
    pub fn n_symbols(&self) -> usize {
        self.n_symbols
    }

    /// Initial state distribution.
    pub fn pi(&self) -> &[f64] {
        &self.pi
    }

    /// Transition matrix, row-major.
    pub fn a(&self) -> &[f64] {
        &self.a
    }

    /// Emission matrix, row-major.
    pub fn b(&self) -> &[f64] {
        &self.b
    }

    /// Transition probability `P(state_j | state_i)`.
    #[inline]
    pub fn transition(&self, i: usize, j: usize) -> f64 {
        self.a[i * self.n_states + j]
    }

    /// Emission probability `P(symbol_o | state_i)`.
    #[inline]
    pub fn emission(&self, i: usize, o: usize) -> f64 {
        self.b[i * self.n_symbols + o]
    }

    /// Validate an observation sequence, returning an error if it is
    /// empty or contains out-of-range symbols.
    pub(crate) fn validate_observations(&self, observations: &[usize]) -> Result<()> {
        if observations.is_empty() {
            return Err(StrataError::EmptyInput(
                "observation sequence is empty".into(),
            ));
        }
        for (t, &o) in observations.iter().enumerate() {
            if o >= self.n_symbols {
                return Err(StrataError::InvalidInput(format!(
                    "observation[{t}] = {o} out of range (n_symbols = {})",
                    self.n_symbols
                )));
            }
        }
        Ok(())
    }

    /// Log-likelihood of an observation sequence under the current
    /// parameters, computed with a scaled forward pass
    /// (`L = −Σ_t ln c_t`).
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid sequence or when the forward pass
    /// degenerates to zero mass.
    pub fn log_likelihood(&self, observations: &[usize]) -> Result<f64> {
        self.validate_observations(observations)?;
        let n = self.n_states;
        let mut prev = vec![0.0; n];
        let mut cur = vec![0.0; n];
        let mut ll = 0.0;

        let mut sum = 0.0;
        for i in 0..n {
            let v = self.pi[i] * self.emission(i, observations[0]);
            prev[i] = v;
            sum += v;
        }
        if sum <= 0.0 {
            return Err(StrataError::Diverged(
                "forward pass lost all probability mass at t=0".into(),
            ));
        }
        ll += sum.ln();
        for v in &mut prev {
            *v /= sum;
        }

        for (t, &ot) in observations.iter().enumerate().skip(1) {
            let mut sum = 0.0;
            for i in 0..n {
                let mut res = 0.0;
                for j in 0..n {
                    res += prev[j] * self.transition(j, i);
                }
                let v = res * self.emission(i, ot);
                cur[i] = v;
                sum += v;
            }
            if sum <= 0.0 {
                return Err(StrataError::Diverged(format!(
                    "forward pass lost all probability mass at t={t}"
                )));
            }
            ll += sum.ln();
            for v in &mut cur {
                *v /= sum;
            }
            std::mem::swap(&mut prev, &mut cur);
        }

        Ok(ll)
    }

    /// Sample an observation sequence of the given length from the model.
    ///
    /// Deterministic for a given seed.
    pub fn generate(&self, length: usize, seed: u64) -> Vec<usize> {
        let mut rng = Xorshift64(seed.max(1));
        let mut sequence = Vec::with_capacity(length);

        let mut state = sample_index(&self.pi, rng.next_f64());
        for _ in 0..length {
            let emission_row = &self.b[state * self.n_symbols..(state + 1) * self.n_symbols];
            sequence.push(sample_index(emission_row, rng.next_f64()));
            let transition_row = &self.a[state * self.n_states..(state + 1) * self.n_states];
            state = sample_index(transition_row, rng.next_f64());
        }
        sequence
    }

    /// Whether A has the sparse "background + self-loop" support typical
    /// of theme HMMs: `A[i][j] == 0` unless `j == 0` or `j == i`.
    ///
    /// Row 0 is unconstrained. The support survives re-estimation (ξ
    /// inherits A's zeros), so detecting it once per training run is
    /// enough.
    pub fn has_background_self_loop(&self) -> bool {
        let n = self.n_states;
        for i in 1..n {
            for j in 0..n {
                if j != 0 && j != i && self.a[i * n + j] != 0.0 {
                    return false;
                }
            }
        }
        true
    }
}

/// Themed initial conditions for π and A (see
/// [`Hmm::from_word_distributions`]).
fn themed_initial_conditions(n: usize) -> (Vec<f64>, Vec<f64>) {
    if n == 1 {
        return (vec![1.0], vec![1.0]);
    }
    let k = n - 1;
    let spread = 0.5 / k as f64;

    let mut pi = vec![spread; n];
    pi[0] = 0.5;

    let mut a = vec![0.0; n * n];
    a[0] = 0.5;
    for j in 1..n {
        a[j] = spread;
    }
    for i in 1..n {
        a[i * n] = 0.5;
        a[i * n + i] = 0.5;
    }
    (pi, a)
}

/// Draw an index from a probability row by inverse transform.
fn sample_index(row: &[f64], mut u: f64) -> usize {
    let mut index = 0;
    for (i, &p) in row.iter().enumerate() {
        index = i;
        u -= p;
        if u <= 0.0 {
            break;
        }
    }
    index
}

// ---------------------------------------------------------------------------
// Seeded RNG (xorshift64)
// ---------------------------------------------------------------------------

struct Xorshift64(u64);

impl Xorshift64 {
    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / ((1u64 << 53) as f64)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
