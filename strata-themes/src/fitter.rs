//! EM fitting of the background + K themes mixture model.
//!
//! Each document d is modeled as a mixture of the fixed background
//! distribution (weight λ_B) and K theme distributions (weight 1 − λ_B,
//! split per document by mixing weights π_{d,j}). The E-step computes
//! the hidden-variable posteriors for every (document, word) pair; the
//! M-step re-estimates the mixing weights and the theme word
//! distributions from the posterior-weighted counts.
//!
//! Documents are re-indexed against a dense per-partition word index so
//! the inner loops run over flat `Vec<f64>` rows instead of hash maps.

use std::collections::HashMap;

use tracing::{debug, warn};

use strata_core::{Result, RunControl, Scored, StrataError, Summarizable};

use crate::partition::{BackgroundModel, TimePartition};
use crate::theme::Theme;

/// Iterations with a non-positive normalization denominator tolerated
/// in a row before the fit is declared diverged.
const MAX_CONSECUTIVE_DEGENERACIES: usize = 3;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for one EM fit.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EmConfig {
    /// Number of themes K.
    pub num_themes: usize,
    /// Background mixing weight λ_B, in (0, 1).
    pub lambda_background: f64,
    /// Iteration cap.
    pub max_iterations: usize,
    /// Convergence threshold on |Δ log-likelihood|.
    pub convergence_eps: f64,
    /// Floor substituted for non-positive denominators.
    pub epsilon: f64,
    /// Seed for the random theme initialization.
    pub seed: u64,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            num_themes: 10,
            lambda_background: 0.92,
            max_iterations: 30,
            convergence_eps: 1e-3,
            epsilon: 1e-10,
            seed: 42,
        }
    }
}

impl EmConfig {
    /// Check parameter ranges.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::InvalidConfig`] on any out-of-range value.
    pub fn validate(&self) -> Result<()> {
        if self.num_themes == 0 {
            return Err(StrataError::InvalidConfig(
                "num_themes must be >= 1".into(),
            ));
        }
        if !(self.lambda_background > 0.0 && self.lambda_background < 1.0) {
            return Err(StrataError::InvalidConfig(format!(
                "lambda_background must be in (0, 1), got {}",
                self.lambda_background
            )));
        }
        if self.max_iterations == 0 {
            return Err(StrataError::InvalidConfig(
                "max_iterations must be >= 1".into(),
            ));
        }
        if !(self.convergence_eps > 0.0) {
            return Err(StrataError::InvalidConfig(format!(
                "convergence_eps must be > 0, got {}",
                self.convergence_eps
            )));
        }
        if !(self.epsilon > 0.0) {
            return Err(StrataError::InvalidConfig(format!(
                "epsilon must be > 0, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fit result
// ---------------------------------------------------------------------------

/// Result of one EM fit over a partition.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EmFit {
    /// K as configured (themes before filtering).
    pub num_themes: usize,
    /// The fitted themes, one per mixture component.
    pub themes: Vec<Theme>,
    /// Indices (into the partition's document list) of the documents the
    /// fit ran over; empty documents are skipped.
    pub documents: Vec<usize>,
    /// Mixing weights π_{d,j}, row per entry of `documents`.
    pub pi: Vec<Vec<f64>>,
    /// Normalized mixture log-likelihood after the last iteration.
    pub log_likelihood: f64,
    /// Iterations actually run.
    pub iterations: usize,
    /// Whether |ΔL| dropped below the configured threshold.
    pub converged: bool,
}

impl EmFit {
    /// Themes whose average mixing weight clears `(1/K) · tau`.
    ///
    /// Idempotent: the threshold depends on the configured K, not on how
    /// many themes survive.
    pub fn filtered_themes(&self, tau: f64) -> Vec<Theme> {
        let threshold = (1.0 / self.num_themes as f64) * tau;
        self.themes
            .iter()
            .filter(|theme| theme.average_pi > threshold)
            .cloned()
            .collect()
    }
}

impl Scored for EmFit {
    fn score(&self) -> f64 {
        self.log_likelihood
    }
}

impl Summarizable for EmFit {
    fn summary(&self) -> String {
        format!(
            "EmFit: K={}, docs={}, log_likelihood={:.6}, iterations={}{}",
            self.num_themes,
            self.documents.len(),
            self.log_likelihood,
            self.iterations,
            if self.converged { " (converged)" } else { "" },
        )
    }
}

// ---------------------------------------------------------------------------
// Fitting
// ---------------------------------------------------------------------------

/// A document re-indexed against the partition's dense word index.
struct DenseDocument {
    /// Index into the partition's document list.
    index: usize,
    /// (dense word index, count) pairs.
    words: Vec<(usize, f64)>,
}

/// Fit the mixture model over a partition.
///
/// Convenience wrapper around [`fit_with_control`] with no cancellation
/// or deadline.
///
/// # Errors
///
/// See [`fit_with_control`].
pub fn fit(
    partition: &TimePartition,
    background: &BackgroundModel,
    config: &EmConfig,
) -> Result<EmFit> {
    fit_with_control(partition, background, config, &RunControl::unbounded())
}

/// Fit the mixture model over a partition, honoring `control` between
/// iterations.
///
/// # Errors
///
/// - [`StrataError::InvalidConfig`] for out-of-range parameters
/// - [`StrataError::EmptyInput`] when no non-empty document exists
/// - [`StrataError::Diverged`] after three consecutive degenerate
///   iterations
/// - [`StrataError::Cancelled`] / [`StrataError::TimedOut`] from
///   `control`
pub fn fit_with_control(
    partition: &TimePartition,
    background: &BackgroundModel,
    config: &EmConfig,
    control: &RunControl,
) -> Result<EmFit> {
    config.validate()?;

    // Empty documents are skipped; the fit needs at least one real one.
    let docs = dense_documents(partition);
    if docs.is_empty() {
        return Err(StrataError::EmptyInput(format!(
            "partition {} has no non-empty documents",
            partition.id
        )));
    }

    let words = partition_words(partition);
    let word_index: HashMap<usize, usize> =
        words.iter().enumerate().map(|(i, &w)| (w, i)).collect();
    let docs: Vec<DenseDocument> = docs
        .into_iter()
        .map(|(index, counts)| DenseDocument {
            index,
            words: counts
                .into_iter()
                .map(|(w, c)| (word_index[&w], c as f64))
                .collect(),
        })
        .collect();

    let k = config.num_themes;
    let n_words = words.len();
    let n_docs = docs.len();
    let lambda = config.lambda_background;
    let eps = config.epsilon;
    let bg: Vec<f64> = words.iter().map(|&w| background.probability(w)).collect();

    // Random positive theme rows, uniform mixing weights.
    let mut rng = Xorshift64(config.seed.max(1));
    let mut theta: Vec<Vec<f64>> = (0..k)
        .map(|_| {
            let mut row: Vec<f64> = (0..n_words).map(|_| rng.next_f64().max(eps)).collect();
            let sum: f64 = row.iter().sum();
            for p in &mut row {
                *p /= sum;
            }
            row
        })
        .collect();
    let mut pi: Vec<Vec<f64>> = vec![vec![1.0 / k as f64; k]; n_docs];

    let mut log_likelihood = f64::NEG_INFINITY;
    let mut prev_ll = f64::NEG_INFINITY;
    let mut iterations = 0;
    let mut converged = false;
    let mut consecutive_degeneracies = 0;
    let mut posterior = vec![0.0; k];

    for iteration in 0..config.max_iterations {
        control.checkpoint()?;

        let mut new_pi = vec![vec![0.0; k]; n_docs];
        let mut new_theta = vec![vec![0.0; n_words]; k];

        // E-step posteriors folded into the M-step accumulators.
        for (d, doc) in docs.iter().enumerate() {
            for &(w, count) in &doc.words {
                let mut mixture = 0.0;
                for j in 0..k {
                    mixture += pi[d][j] * theta[j][w];
                }
                let background_mass = lambda * bg[w];
                let mut denominator = background_mass + (1.0 - lambda) * mixture;
                if denominator <= 0.0 {
                    denominator = eps;
                }
                let p_background = background_mass / denominator;

                let mixture = if mixture <= 0.0 { eps } else { mixture };
                for (j, slot) in posterior.iter_mut().enumerate() {
                    *slot = pi[d][j] * theta[j][w] / mixture;
                }

                let weight = count * (1.0 - p_background);
                for j in 0..k {
                    let contribution = weight * posterior[j];
                    new_pi[d][j] += contribution;
                    new_theta[j][w] += contribution;
                }
            }
        }

        // Renormalize; a non-positive denominator aborts the iteration
        // and keeps the previous parameters.
        let degenerate = new_pi.iter().any(|row| row.iter().sum::<f64>() <= 0.0)
            || new_theta.iter().any(|row| row.iter().sum::<f64>() <= 0.0);
        iterations = iteration + 1;
        if degenerate {
            consecutive_degeneracies += 1;
            warn!(
                partition = partition.id,
                iteration,
                consecutive = consecutive_degeneracies,
                "degenerate EM normalization, retaining previous parameters"
            );
            if consecutive_degeneracies >= MAX_CONSECUTIVE_DEGENERACIES {
                return Err(StrataError::Diverged(format!(
                    "partition {}: {} consecutive degenerate EM iterations",
                    partition.id, consecutive_degeneracies
                )));
            }
            continue;
        }
        consecutive_degeneracies = 0;
        for row in &mut new_pi {
            let sum: f64 = row.iter().sum();
            for p in row.iter_mut() {
                *p /= sum;
            }
        }
        for row in &mut new_theta {
            let sum: f64 = row.iter().sum();
            for p in row.iter_mut() {
                *p /= sum;
            }
        }
        pi = new_pi;
        theta = new_theta;

        log_likelihood = mixture_log_likelihood(&docs, &pi, &theta, &bg, lambda);
        debug!(
            partition = partition.id,
            iteration, log_likelihood, "em iteration"
        );

        if prev_ll != f64::NEG_INFINITY && (log_likelihood - prev_ll).abs() < config.convergence_eps
        {
            converged = true;
            break;
        }
        prev_ll = log_likelihood;
    }

    // Shape the per-component outputs.
    let themes = (0..k)
        .map(|j| {
            let average_pi = pi.iter().map(|row| row[j]).sum::<f64>() / n_docs as f64;
            let mut order: Vec<usize> = (0..n_docs).collect();
            order.sort_by(|&a, &b| {
                pi[b][j]
                    .partial_cmp(&pi[a][j])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            Theme {
                word_probabilities: words
                    .iter()
                    .enumerate()
                    .map(|(w, &word)| (word, theta[j][w]))
                    .collect(),
                average_pi,
                top_documents: order.into_iter().map(|d| docs[d].index).collect(),
            }
        })
        .collect();

    Ok(EmFit {
        num_themes: k,
        themes,
        documents: docs.iter().map(|doc| doc.index).collect(),
        pi,
        log_likelihood,
        iterations,
        converged,
    })
}

/// Normalized mixture log-likelihood:
/// `(1/|D|) Σ_d (1/|W_d|) Σ_w c(w,d) · ln(λ_B p_B(w) + (1−λ_B) S_d(w))`.
fn mixture_log_likelihood(
    docs: &[DenseDocument],
    pi: &[Vec<f64>],
    theta: &[Vec<f64>],
    bg: &[f64],
    lambda: f64,
) -> f64 {
    let mut total = 0.0;
    for (d, doc) in docs.iter().enumerate() {
        let mut doc_ll = 0.0;
        for &(w, count) in &doc.words {
            let mut mixture = 0.0;
            for (j, pi_dj) in pi[d].iter().enumerate() {
                mixture += pi_dj * theta[j][w];
            }
            doc_ll += count * (lambda * bg[w] + (1.0 - lambda) * mixture).ln();
        }
        total += doc_ll / doc.words.len() as f64;
    }
    total / docs.len() as f64
}

/// Non-empty documents as `(index, counts)` pairs.
fn dense_documents(partition: &TimePartition) -> Vec<(usize, Vec<(usize, u32)>)> {
    partition
        .documents
        .iter()
        .enumerate()
        .filter(|(_, doc)| !doc.is_empty())
        .map(|(index, doc)| {
            (
                index,
                doc.word_counts.iter().map(|(&w, &c)| (w, c)).collect(),
            )
        })
        .collect()
}

/// Sorted distinct word ids across the partition.
fn partition_words(partition: &TimePartition) -> Vec<usize> {
    let mut words: Vec<usize> = partition
        .documents
        .iter()
        .flat_map(|doc| doc.word_counts.keys().copied())
        .collect();
    words.sort_unstable();
    words.dedup();
    words
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{Document, TimeInterval, TimePartition};

    const TOL: f64 = 1e-9;

    fn uniform_background(words: usize) -> BackgroundModel {
        BackgroundModel::new((0..words).map(|w| (w, 1.0 / words as f64)).collect()).unwrap()
    }

    fn two_document_partition() -> TimePartition {
        TimePartition {
            id: 1,
            interval: TimeInterval { start: 0, end: 604_800 },
            documents: vec![
                Document::new("a-heavy", HashMap::from([(0, 4), (1, 1)])),
                Document::new("b-heavy", HashMap::from([(0, 1), (1, 4)])),
            ],
        }
    }

    fn separation_config() -> EmConfig {
        EmConfig {
            num_themes: 2,
            lambda_background: 0.5,
            max_iterations: 200,
            convergence_eps: 1e-9,
            seed: 13,
            ..EmConfig::default()
        }
    }

    #[test]
    fn config_validation() {
        assert!(EmConfig::default().validate().is_ok());
        assert!(EmConfig { num_themes: 0, ..EmConfig::default() }.validate().is_err());
        assert!(EmConfig { lambda_background: 0.0, ..EmConfig::default() }.validate().is_err());
        assert!(EmConfig { lambda_background: 1.0, ..EmConfig::default() }.validate().is_err());
        assert!(EmConfig { max_iterations: 0, ..EmConfig::default() }.validate().is_err());
        assert!(EmConfig { convergence_eps: 0.0, ..EmConfig::default() }.validate().is_err());
        assert!(EmConfig { epsilon: 0.0, ..EmConfig::default() }.validate().is_err());
    }

    #[test]
    fn empty_partition_is_rejected() {
        let partition = TimePartition {
            id: 0,
            interval: TimeInterval { start: 0, end: 1 },
            documents: vec![],
        };
        let err = fit(&partition, &uniform_background(2), &separation_config());
        assert!(matches!(err, Err(StrataError::EmptyInput(_))));
    }

    #[test]
    fn all_empty_documents_are_rejected() {
        let partition = TimePartition {
            id: 0,
            interval: TimeInterval { start: 0, end: 1 },
            documents: vec![Document::new("empty", HashMap::new())],
        };
        let err = fit(&partition, &uniform_background(2), &separation_config());
        assert!(matches!(err, Err(StrataError::EmptyInput(_))));
    }

    #[test]
    fn empty_documents_are_skipped() {
        let mut partition = two_document_partition();
        partition.documents.insert(1, Document::new("empty", HashMap::new()));
        let fit = fit(&partition, &uniform_background(2), &separation_config()).unwrap();
        assert_eq!(fit.documents, vec![0, 2]);
        assert_eq!(fit.pi.len(), 2);
    }

    #[test]
    fn distributions_stay_stochastic() {
        let fit = fit(
            &two_document_partition(),
            &uniform_background(2),
            &separation_config(),
        )
        .unwrap();
        for theme in &fit.themes {
            let sum: f64 = theme.word_probabilities.values().sum();
            assert!((sum - 1.0).abs() < TOL, "theme sums to {sum}");
        }
        for row in &fit.pi {
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < TOL, "pi row sums to {sum}");
        }
    }

    #[test]
    fn log_likelihood_is_monotone_in_iterations() {
        // Re-running with a larger iteration cap replays the same
        // deterministic trajectory, so the final log-likelihoods must be
        // non-decreasing.
        let partition = two_document_partition();
        let background = uniform_background(2);
        let mut prev = f64::NEG_INFINITY;
        for max_iterations in 1..10 {
            let config = EmConfig {
                max_iterations,
                convergence_eps: 1e-300,
                ..separation_config()
            };
            let fit = fit(&partition, &background, &config).unwrap();
            assert!(
                fit.log_likelihood >= prev - 1e-9,
                "LL decreased: {prev} -> {}",
                fit.log_likelihood
            );
            prev = fit.log_likelihood;
        }
    }

    #[test]
    fn skewed_documents_separate_into_themes() {
        let fit = fit(
            &two_document_partition(),
            &uniform_background(2),
            &separation_config(),
        )
        .unwrap();

        // One theme concentrates on word 0, the other on word 1 (or the
        // symmetric swap).
        let theme_a = if fit.themes[0].word_probabilities[&0] > fit.themes[1].word_probabilities[&0]
        {
            0
        } else {
            1
        };
        let theme_b = 1 - theme_a;
        assert!(
            fit.themes[theme_a].word_probabilities[&0] > 0.6,
            "theme {theme_a} should favor word 0: {:?}",
            fit.themes[theme_a].word_probabilities
        );
        assert!(
            fit.themes[theme_b].word_probabilities[&1] > 0.6,
            "theme {theme_b} should favor word 1: {:?}",
            fit.themes[theme_b].word_probabilities
        );

        // The documents commit to their themes.
        assert!(fit.pi[0][theme_a] > 0.8, "pi[0] = {:?}", fit.pi[0]);
        assert!(fit.pi[1][theme_b] > 0.8, "pi[1] = {:?}", fit.pi[1]);

        // Top documents reflect the memberships.
        assert_eq!(fit.themes[theme_a].top_documents[0], 0);
        assert_eq!(fit.themes[theme_b].top_documents[0], 1);
    }

    #[test]
    fn convergence_is_recorded() {
        let config = EmConfig {
            convergence_eps: 1e-6,
            ..separation_config()
        };
        let fit = fit(&two_document_partition(), &uniform_background(2), &config).unwrap();
        assert!(fit.converged);
        assert!(fit.iterations < config.max_iterations);
    }

    #[test]
    fn iteration_cap_is_not_an_error() {
        let config = EmConfig {
            max_iterations: 2,
            convergence_eps: 1e-300,
            ..separation_config()
        };
        let fit = fit(&two_document_partition(), &uniform_background(2), &config).unwrap();
        assert!(!fit.converged);
        assert_eq!(fit.iterations, 2);
    }

    #[test]
    fn cancelled_control_stops_the_fit() {
        let control = RunControl::unbounded();
        control.cancel();
        let err = fit_with_control(
            &two_document_partition(),
            &uniform_background(2),
            &separation_config(),
            &control,
        );
        assert!(matches!(err, Err(StrataError::Cancelled)));
    }

    #[test]
    fn theme_filtering_is_idempotent() {
        let fit = fit(
            &two_document_partition(),
            &uniform_background(2),
            &separation_config(),
        )
        .unwrap();
        let tau = 0.5;
        let once = fit.filtered_themes(tau);
        // Both themes average 0.5 here, above (1/2) * 0.5.
        assert_eq!(once.len(), 2);

        let refit = EmFit {
            themes: once.clone(),
            ..fit.clone()
        };
        let twice = refit.filtered_themes(tau);
        assert_eq!(once.len(), twice.len());
    }

    #[test]
    fn high_tau_filters_weak_themes() {
        // With K=4 over two clean documents, at most two themes can carry
        // weight; a tau of 1.5 (threshold 0.375) drops the rest.
        let config = EmConfig {
            num_themes: 4,
            ..separation_config()
        };
        let fit = fit(&two_document_partition(), &uniform_background(2), &config).unwrap();
        let kept = fit.filtered_themes(1.5);
        assert!(kept.len() <= 2, "kept {} themes", kept.len());
        for theme in &kept {
            assert!(theme.average_pi > 0.375);
        }
    }
}
