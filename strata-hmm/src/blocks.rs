//! Observation sequence blocking.
//!
//! The block-parallel trainers partition `[0, T)` into contiguous blocks
//! of `block_size` observations (the last may be shorter). A training
//! block additionally carries the first observation of the next block:
//! the backward operators at position t and the boundary ξ term both
//! look at `o_{t+1}`, so the last in-block position needs one
//! observation of lookahead.

use strata_core::{Result, StrataError};

/// One contiguous block of an observation sequence.
#[derive(Debug, Clone)]
pub struct ObservationBlock {
    /// Block id; blocks are numbered from 0 in sequence order.
    pub id: usize,
    /// First covered observation index (inclusive).
    pub start: usize,
    /// One past the last covered observation index.
    pub end: usize,
    /// The observations `[start, end)`, plus `o_end` when the block was
    /// split with overlap and is not the last.
    pub observations: Vec<usize>,
}

impl ObservationBlock {
    /// Number of observation positions the block covers (the overlap
    /// observation is payload, not coverage).
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the block covers no positions.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Check that the payload covers the block's span.
    ///
    /// # Errors
    ///
    /// [`StrataError::BlockSizeMismatch`] when observations are missing
    /// or superfluous; this indicates an upstream bug, not bad data.
    pub fn verify_span(&self, total: usize, overlap: bool) -> Result<()> {
        let expected = if overlap && self.end < total {
            self.len() + 1
        } else {
            self.len()
        };
        if self.observations.len() != expected {
            return Err(StrataError::BlockSizeMismatch(format!(
                "block {}: {} observations for span [{}, {}) (expected {expected})",
                self.id,
                self.observations.len(),
                self.start,
                self.end,
            )));
        }
        Ok(())
    }
}

/// Split a sequence into blocks of `block_size`.
///
/// With `overlap`, every block except the last also carries the first
/// observation of its successor.
///
/// # Errors
///
/// Returns an error for a zero block size or an empty sequence.
pub fn split_blocks(
    observations: &[usize],
    block_size: usize,
    overlap: bool,
) -> Result<Vec<ObservationBlock>> {
    if block_size == 0 {
        return Err(StrataError::InvalidConfig(
            "block_size must be > 0".into(),
        ));
    }
    let total = observations.len();
    if total == 0 {
        return Err(StrataError::EmptyInput(
            "observation sequence is empty".into(),
        ));
    }

    let num_blocks = (total + block_size - 1) / block_size;
    let mut blocks = Vec::with_capacity(num_blocks);
    for id in 0..num_blocks {
        let start = id * block_size;
        let end = (start + block_size).min(total);
        let payload_end = if overlap { (end + 1).min(total) } else { end };
        blocks.push(ObservationBlock {
            id,
            start,
            end,
            observations: observations[start..payload_end].to_vec(),
        });
    }
    Ok(blocks)
}
