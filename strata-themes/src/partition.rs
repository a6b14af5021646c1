//! Input types for a per-partition fit: documents, time partitions, and
//! the background word distribution.

use std::collections::HashMap;

use strata_core::{Result, StrataError};

/// Default probability floor for zero-count or missing background words.
const DEFAULT_FLOOR: f64 = 1e-10;

/// A tokenized document: a multiset of word ids with positive counts.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Document {
    /// Human-readable identifier (headline, file name, …).
    pub title: String,
    /// Word id → occurrence count.
    pub word_counts: HashMap<usize, u32>,
}

impl Document {
    /// Create a document from a title and word counts.
    pub fn new(title: impl Into<String>, word_counts: HashMap<usize, u32>) -> Self {
        Self {
            title: title.into(),
            word_counts,
        }
    }

    /// Total number of word occurrences.
    pub fn total_count(&self) -> u64 {
        self.word_counts.values().map(|&c| c as u64).sum()
    }

    /// Number of distinct words.
    pub fn distinct_words(&self) -> usize {
        self.word_counts.len()
    }

    /// Whether the document has no words.
    pub fn is_empty(&self) -> bool {
        self.word_counts.is_empty()
    }
}

/// Half-open time interval in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeInterval {
    pub start: i64,
    pub end: i64,
}

/// A contiguous slice of the collection: all documents published within
/// one interval, fit jointly.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimePartition {
    /// Stable partition identifier, increasing with time.
    pub id: u64,
    /// The interval the documents fall into.
    pub interval: TimeInterval,
    /// The documents of the partition.
    pub documents: Vec<Document>,
}

impl TimePartition {
    /// Whether the partition carries no documents at all.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// The collection-wide background word distribution, immutable across a
/// pipeline run.
///
/// Lookups are floored: a word with zero or missing background
/// probability reads as a small positive ε so the mixture denominators
/// stay positive.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BackgroundModel {
    probabilities: HashMap<usize, f64>,
    floor: f64,
}

impl BackgroundModel {
    /// Validate and wrap a word id → probability map.
    ///
    /// # Errors
    ///
    /// Returns an error if the map is empty, any probability is negative
    /// or non-finite, or the probabilities do not sum to ~1.0
    /// (tolerance 1e-6).
    pub fn new(probabilities: HashMap<usize, f64>) -> Result<Self> {
        if probabilities.is_empty() {
            return Err(StrataError::EmptyInput(
                "background model has no words".into(),
            ));
        }
        let mut sum = 0.0;
        for (&word, &p) in &probabilities {
            if !p.is_finite() || p < 0.0 {
                return Err(StrataError::InvalidInput(format!(
                    "background probability for word {word} is {p}"
                )));
            }
            sum += p;
        }
        if (sum - 1.0).abs() > 1e-6 {
            return Err(StrataError::InvalidInput(format!(
                "background probabilities sum to {sum}, expected ~1.0"
            )));
        }
        Ok(Self {
            probabilities,
            floor: DEFAULT_FLOOR,
        })
    }

    /// Replace the lookup floor.
    ///
    /// # Errors
    ///
    /// Returns an error unless `floor` is finite and positive.
    pub fn with_floor(mut self, floor: f64) -> Result<Self> {
        if !floor.is_finite() || floor <= 0.0 {
            return Err(StrataError::InvalidConfig(format!(
                "background floor must be positive, got {floor}"
            )));
        }
        self.floor = floor;
        Ok(self)
    }

    /// Floored background probability of a word.
    pub fn probability(&self, word: usize) -> f64 {
        self.probabilities
            .get(&word)
            .copied()
            .unwrap_or(0.0)
            .max(self.floor)
    }

    /// The raw (unfloored) probability map.
    pub fn probabilities(&self) -> &HashMap<usize, f64> {
        &self.probabilities
    }

    /// The lookup floor.
    pub fn floor(&self) -> f64 {
        self.floor
    }
}
