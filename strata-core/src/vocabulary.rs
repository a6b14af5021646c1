//! Word token ↔ id bijection.
//!
//! The models never touch surface strings; they index everything by
//! dense word ids in `[0, len)`. The vocabulary is immutable after
//! construction. Building it (tokenization, stop-word filtering) is the
//! caller's concern.

use std::collections::HashMap;

use crate::{Result, StrataError};

/// Immutable bijection between word tokens and dense integer ids.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    tokens: Vec<String>,
    index: HashMap<String, usize>,
}

impl Vocabulary {
    /// Build a vocabulary from tokens, assigning ids in iteration order.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate tokens or an empty token set.
    pub fn from_tokens<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        if tokens.is_empty() {
            return Err(StrataError::EmptyInput("vocabulary has no tokens".into()));
        }
        let mut index = HashMap::with_capacity(tokens.len());
        for (id, token) in tokens.iter().enumerate() {
            if index.insert(token.clone(), id).is_some() {
                return Err(StrataError::InvalidInput(format!(
                    "duplicate vocabulary token: {token:?}"
                )));
            }
        }
        Ok(Self { tokens, index })
    }

    /// Id of a token, if present.
    pub fn index_of(&self, token: &str) -> Option<usize> {
        self.index.get(token).copied()
    }

    /// Token for an id, if in range.
    pub fn token(&self, id: usize) -> Option<&str> {
        self.tokens.get(id).map(String::as_str)
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the vocabulary is empty (never true for a constructed one).
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Iterate over `(id, token)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.tokens.iter().enumerate().map(|(id, t)| (id, t.as_str()))
    }
}
