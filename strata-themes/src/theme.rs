//! Themes: latent word distributions discovered by the EM fitter.

use std::collections::HashMap;

use strata_core::{Scored, Summarizable};

/// A latent theme within one time partition.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Theme {
    /// Word id → p(w | θ); sums to 1 over the partition's words.
    pub word_probabilities: HashMap<usize, f64>,
    /// Mean mixing weight of this theme over the partition's documents.
    pub average_pi: f64,
    /// Document indices (within the owning partition) sorted by
    /// descending membership weight.
    pub top_documents: Vec<usize>,
}

impl Theme {
    /// The `n` highest-probability words, sorted by descending probability.
    pub fn top_words(&self, n: usize) -> Vec<(usize, f64)> {
        let mut words: Vec<(usize, f64)> = self
            .word_probabilities
            .iter()
            .map(|(&w, &p)| (w, p))
            .collect();
        words.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        words.truncate(n);
        words
    }
}

impl Scored for Theme {
    fn score(&self) -> f64 {
        self.average_pi
    }
}

impl Summarizable for Theme {
    fn summary(&self) -> String {
        let head: Vec<String> = self
            .top_words(3)
            .into_iter()
            .map(|(w, p)| format!("{w}:{p:.3}"))
            .collect();
        format!(
            "Theme: avg_pi={:.4}, words={}, top=[{}]",
            self.average_pi,
            self.word_probabilities.len(),
            head.join(", ")
        )
    }
}
