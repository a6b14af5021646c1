//! The per-partition driver: selection and shaping only.

use tracing::debug;

use strata_core::{Executor, Result, RunControl, Scored, StrataError, Summarizable, Vocabulary};
use strata_hmm::{decode_blocked, train, Hmm, TrainReport};
use strata_themes::{fit_with_control, BackgroundModel, EmFit, Theme, TimePartition};

use crate::config::PipelineConfig;

/// Diagnostics of one partition run.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PartitionDiagnostics {
    /// Log-likelihood of the winning EM restart.
    pub em_log_likelihood: f64,
    /// Iterations the winning restart ran.
    pub em_iterations: usize,
    /// Whether the winning restart converged.
    pub em_converged: bool,
    /// The Baum-Welch outcome.
    pub train_report: TrainReport,
}

/// Everything the core produces for one partition.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PartitionAnalysis {
    /// The partition this analysis belongs to.
    pub partition_id: u64,
    /// The filtered themes (state i + 1 of the HMM decodes theme i).
    pub themes: Vec<Theme>,
    /// Decoded hidden state per stream position; 0 is the background.
    pub decoded_states: Vec<usize>,
    /// Log-probability of the decoded path.
    pub path_log_probability: f64,
    /// Fit and training diagnostics.
    pub diagnostics: PartitionDiagnostics,
}

impl Summarizable for PartitionAnalysis {
    fn summary(&self) -> String {
        format!(
            "Partition {}: themes={}, decoded={} states, em_ll={:.6}, bw_iterations={}",
            self.partition_id,
            self.themes.len(),
            self.decoded_states.len(),
            self.diagnostics.em_log_likelihood,
            self.diagnostics.train_report.iterations,
        )
    }
}

/// Run the configured number of EM restarts and keep the fit with the
/// best log-likelihood.
///
/// # Errors
///
/// Configuration, empty-input, cancellation and timeout errors abort
/// immediately; a restart that diverges is skipped unless every restart
/// diverges.
pub fn best_em_fit(
    partition: &TimePartition,
    background: &BackgroundModel,
    config: &PipelineConfig,
    control: &RunControl,
) -> Result<EmFit> {
    let mut best: Option<EmFit> = None;
    let mut last_error: Option<StrataError> = None;

    for run in 0..config.em_restarts {
        match fit_with_control(partition, background, &config.em_config(run), control) {
            Ok(fit) => {
                debug!(
                    partition = partition.id,
                    run,
                    log_likelihood = fit.log_likelihood,
                    iterations = fit.iterations,
                    "em restart finished"
                );
                if best
                    .as_ref()
                    .map_or(true, |incumbent| fit.score() > incumbent.score())
                {
                    best = Some(fit);
                }
            }
            Err(
                err @ (StrataError::InvalidConfig(_)
                | StrataError::EmptyInput(_)
                | StrataError::Cancelled
                | StrataError::TimedOut),
            ) => return Err(err),
            Err(err) => {
                debug!(partition = partition.id, run, %err, "em restart failed");
                last_error = Some(err);
            }
        }
    }

    best.ok_or_else(|| {
        last_error.unwrap_or_else(|| StrataError::Other("no EM restart produced a fit".into()))
    })
}

/// Shape a background distribution and filtered themes into an HMM:
/// the background at row 0 of B, the themes at rows 1..=K.
///
/// With no themes the model degenerates to the single background state.
///
/// # Errors
///
/// Propagates construction errors from [`Hmm::from_word_distributions`].
pub fn build_hmm(
    background: &BackgroundModel,
    themes: &[Theme],
    vocabulary: &Vocabulary,
    epsilon: f64,
) -> Result<Hmm> {
    let mut rows = Vec::with_capacity(themes.len() + 1);
    rows.push(background.probabilities().clone());
    rows.extend(themes.iter().map(|theme| theme.word_probabilities.clone()));
    Hmm::from_word_distributions(vocabulary, &rows, epsilon)
}

/// Analyze one partition end to end: best-of-R EM fit, theme filtering,
/// HMM shaping, Baum-Welch training, Viterbi decoding.
///
/// `word_stream` is the partition's concatenated word-id stream in
/// reading order (the ordering the documents' count maps cannot carry).
///
/// # Errors
///
/// Any stage's error is returned as-is; see the stage functions.
pub fn analyze_partition<E: Executor>(
    partition: &TimePartition,
    word_stream: &[usize],
    background: &BackgroundModel,
    vocabulary: &Vocabulary,
    config: &PipelineConfig,
    executor: &E,
    control: &RunControl,
) -> Result<PartitionAnalysis> {
    config.validate()?;
    let control = match config.timeout {
        Some(budget) => control.with_budget(budget),
        None => control.clone(),
    };

    let fit = best_em_fit(partition, background, config, &control)?;
    let themes = fit.filtered_themes(config.theme_filter_tau);
    debug!(
        partition = partition.id,
        kept = themes.len(),
        fitted = fit.num_themes,
        "theme filtering"
    );

    let mut hmm = build_hmm(background, &themes, vocabulary, config.epsilon)?;
    let train_report = train(&mut hmm, word_stream, &config.bw_config(), executor, &control)?;
    let (decoded_states, path_log_probability) =
        decode_blocked(&hmm, word_stream, config.viterbi_block_size)?;

    Ok(PartitionAnalysis {
        partition_id: partition.id,
        themes,
        decoded_states,
        path_log_probability,
        diagnostics: PartitionDiagnostics {
            em_log_likelihood: fit.log_likelihood,
            em_iterations: fit.iterations,
            em_converged: fit.converged,
            train_report,
        },
    })
}

/// Analyze a batch of partitions. Partitions are independent: one
/// failure never aborts the others, results come back in input order.
pub fn analyze_partitions<E: Executor>(
    inputs: &[(TimePartition, Vec<usize>)],
    background: &BackgroundModel,
    vocabulary: &Vocabulary,
    config: &PipelineConfig,
    executor: &E,
    control: &RunControl,
) -> Vec<Result<PartitionAnalysis>> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        inputs
            .par_iter()
            .map(|(partition, stream)| {
                analyze_partition(
                    partition, stream, background, vocabulary, config, executor, control,
                )
            })
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        inputs
            .iter()
            .map(|(partition, stream)| {
                analyze_partition(
                    partition, stream, background, vocabulary, config, executor, control,
                )
            })
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use strata_core::SerialExecutor;
    use strata_themes::{Document, TimeInterval};

    fn vocabulary() -> Vocabulary {
        Vocabulary::from_tokens(["alpha", "beta"]).unwrap()
    }

    fn background() -> BackgroundModel {
        BackgroundModel::new(HashMap::from([(0, 0.5), (1, 0.5)])).unwrap()
    }

    fn partition() -> TimePartition {
        TimePartition {
            id: 3,
            interval: TimeInterval { start: 0, end: 604_800 },
            documents: vec![
                Document::new("a-heavy", HashMap::from([(0, 4), (1, 1)])),
                Document::new("b-heavy", HashMap::from([(0, 1), (1, 4)])),
            ],
        }
    }

    fn stream() -> Vec<usize> {
        // The two documents concatenated in reading order.
        vec![0, 0, 0, 0, 1, 0, 1, 1, 1, 1]
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            num_themes: 2,
            lambda_background: 0.5,
            em_restarts: 3,
            em_max_iterations: 100,
            theme_filter_tau: 0.5,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn best_fit_maximizes_log_likelihood() {
        let config = config();
        let control = RunControl::unbounded();
        let best = best_em_fit(&partition(), &background(), &config, &control).unwrap();

        let manual_best = (0..config.em_restarts)
            .map(|run| {
                fit_with_control(&partition(), &background(), &config.em_config(run), &control)
                    .unwrap()
                    .log_likelihood
            })
            .fold(f64::NEG_INFINITY, f64::max);
        assert!((best.log_likelihood - manual_best).abs() < 1e-12);
    }

    #[test]
    fn build_hmm_places_background_at_state_zero() {
        let fit_themes = vec![Theme {
            word_probabilities: HashMap::from([(0, 0.9), (1, 0.1)]),
            average_pi: 0.5,
            top_documents: vec![0],
        }];
        let hmm = build_hmm(&background(), &fit_themes, &vocabulary(), 1e-10).unwrap();
        assert_eq!(hmm.n_states(), 2);
        assert!((hmm.emission(0, 0) - 0.5).abs() < 1e-6);
        assert!(hmm.emission(1, 0) > 0.8);
    }

    #[test]
    fn analyze_partition_end_to_end() {
        let analysis = analyze_partition(
            &partition(),
            &stream(),
            &background(),
            &vocabulary(),
            &config(),
            &SerialExecutor,
            &RunControl::unbounded(),
        )
        .unwrap();

        assert_eq!(analysis.partition_id, 3);
        assert_eq!(analysis.decoded_states.len(), stream().len());
        assert!(analysis.path_log_probability.is_finite());
        assert!(!analysis.themes.is_empty());
        assert!(analysis.themes.len() <= 2);
        for &state in &analysis.decoded_states {
            assert!(state <= analysis.themes.len());
        }
        assert!(analysis.diagnostics.em_log_likelihood.is_finite());
        assert!(analysis.diagnostics.train_report.iterations >= 1);
        assert!(analysis.summary().contains("Partition 3"));
    }

    #[test]
    fn filtering_everything_degenerates_to_background_only() {
        let config = PipelineConfig {
            theme_filter_tau: 1e9,
            ..config()
        };
        let analysis = analyze_partition(
            &partition(),
            &stream(),
            &background(),
            &vocabulary(),
            &config,
            &SerialExecutor,
            &RunControl::unbounded(),
        )
        .unwrap();
        assert!(analysis.themes.is_empty());
        assert!(analysis.decoded_states.iter().all(|&state| state == 0));
    }

    #[test]
    fn partition_failures_do_not_cascade() {
        let empty = TimePartition {
            id: 9,
            interval: TimeInterval { start: 0, end: 1 },
            documents: vec![],
        };
        let inputs = vec![(empty, stream()), (partition(), stream())];
        let results = analyze_partitions(
            &inputs,
            &background(),
            &vocabulary(),
            &config(),
            &SerialExecutor,
            &RunControl::unbounded(),
        );
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(StrataError::EmptyInput(_))));
        assert!(results[1].is_ok());
    }

    #[test]
    fn invalid_config_is_fatal() {
        let config = PipelineConfig {
            num_themes: 0,
            ..PipelineConfig::default()
        };
        let err = analyze_partition(
            &partition(),
            &stream(),
            &background(),
            &vocabulary(),
            &config,
            &SerialExecutor,
            &RunControl::unbounded(),
        );
        assert!(matches!(err, Err(StrataError::InvalidConfig(_))));
    }

    #[test]
    fn cancelled_control_aborts() {
        let control = RunControl::unbounded();
        control.cancel();
        let err = analyze_partition(
            &partition(),
            &stream(),
            &background(),
            &vocabulary(),
            &config(),
            &SerialExecutor,
            &control,
        );
        assert!(matches!(err, Err(StrataError::Cancelled)));
    }
}
