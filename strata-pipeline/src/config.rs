//! Pipeline configuration.

use std::time::Duration;

use strata_core::{Result, StrataError};
use strata_hmm::BwConfig;
use strata_themes::EmConfig;

/// Every knob of a pipeline run, with the conventional defaults.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PipelineConfig {
    /// Themes per partition (K).
    pub num_themes: usize,
    /// Background mixing weight λ_B.
    pub lambda_background: f64,
    /// Independent EM runs per partition; the best log-likelihood wins.
    pub em_restarts: usize,
    /// EM iteration cap.
    pub em_max_iterations: usize,
    /// EM convergence threshold on |ΔL|.
    pub em_convergence_eps: f64,
    /// Theme filter factor τ: keep themes with average π above `(1/K)·τ`.
    pub theme_filter_tau: f64,
    /// Baum-Welch iteration cap.
    pub bw_max_iterations: usize,
    /// Baum-Welch convergence threshold on ‖π*−π‖₁.
    pub pi_threshold: f64,
    /// Baum-Welch convergence threshold on ‖A*−A‖₁.
    pub a_threshold: f64,
    /// Observations per Baum-Welch block.
    pub bw_block_size: usize,
    /// Observations per Viterbi block.
    pub viterbi_block_size: usize,
    /// Always use sequential Baum-Welch.
    pub force_sequential_baum_welch: bool,
    /// Master seed; per-restart seeds are derived from it.
    pub rng_seed: u64,
    /// Floor substituted for zero probabilities and denominators.
    pub epsilon: f64,
    /// Optional wall-clock budget per partition run.
    pub timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_themes: 10,
            lambda_background: 0.92,
            em_restarts: 5,
            em_max_iterations: 30,
            em_convergence_eps: 1e-3,
            theme_filter_tau: 2.0,
            bw_max_iterations: 100,
            pi_threshold: 1e-4,
            a_threshold: 1e-4,
            bw_block_size: 1 << 20,
            viterbi_block_size: 1 << 20,
            force_sequential_baum_welch: false,
            rng_seed: 42,
            epsilon: 1e-10,
            timeout: None,
        }
    }
}

impl PipelineConfig {
    /// Check parameter ranges, covering the projected sub-configs too.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::InvalidConfig`] on any out-of-range value.
    pub fn validate(&self) -> Result<()> {
        if self.em_restarts == 0 {
            return Err(StrataError::InvalidConfig(
                "em_restarts must be >= 1".into(),
            ));
        }
        if !(self.theme_filter_tau > 0.0) {
            return Err(StrataError::InvalidConfig(format!(
                "theme_filter_tau must be > 0, got {}",
                self.theme_filter_tau
            )));
        }
        if self.viterbi_block_size == 0 {
            return Err(StrataError::InvalidConfig(
                "viterbi_block_size must be >= 1".into(),
            ));
        }
        self.em_config(0).validate()?;
        self.bw_config().validate()?;
        Ok(())
    }

    /// The EM configuration for one restart. Restart streams stay
    /// disjoint by mixing the run index into the master seed.
    pub fn em_config(&self, run: usize) -> EmConfig {
        EmConfig {
            num_themes: self.num_themes,
            lambda_background: self.lambda_background,
            max_iterations: self.em_max_iterations,
            convergence_eps: self.em_convergence_eps,
            epsilon: self.epsilon,
            seed: self
                .rng_seed
                .wrapping_add((run as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
        }
    }

    /// The Baum-Welch configuration.
    pub fn bw_config(&self) -> BwConfig {
        BwConfig {
            pi_threshold: self.pi_threshold,
            a_threshold: self.a_threshold,
            max_iterations: self.bw_max_iterations,
            block_size: self.bw_block_size,
            force_sequential: self.force_sequential_baum_welch,
            ..BwConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(PipelineConfig { em_restarts: 0, ..Default::default() }.validate().is_err());
        assert!(PipelineConfig { theme_filter_tau: 0.0, ..Default::default() }.validate().is_err());
        assert!(PipelineConfig { viterbi_block_size: 0, ..Default::default() }.validate().is_err());
        // Errors in the projected configs surface too.
        assert!(PipelineConfig { num_themes: 0, ..Default::default() }.validate().is_err());
        assert!(PipelineConfig { lambda_background: 1.5, ..Default::default() }.validate().is_err());
        assert!(PipelineConfig { bw_max_iterations: 0, ..Default::default() }.validate().is_err());
    }

    #[test]
    fn restart_seeds_are_distinct() {
        let config = PipelineConfig::default();
        let seeds: Vec<u64> = (0..5).map(|run| config.em_config(run).seed).collect();
        for i in 0..seeds.len() {
            for j in (i + 1)..seeds.len() {
                assert_ne!(seeds[i], seeds[j]);
            }
        }
    }

    #[test]
    fn projections_carry_the_knobs() {
        let config = PipelineConfig {
            num_themes: 7,
            lambda_background: 0.8,
            bw_block_size: 128,
            force_sequential_baum_welch: true,
            ..Default::default()
        };
        let em = config.em_config(0);
        assert_eq!(em.num_themes, 7);
        assert!((em.lambda_background - 0.8).abs() < 1e-12);
        let bw = config.bw_config();
        assert_eq!(bw.block_size, 128);
        assert!(bw.force_sequential);
    }
}
