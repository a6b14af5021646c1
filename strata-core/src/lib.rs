//! Shared primitives for the Strata theme life-cycle ecosystem.
//!
//! `strata-core` provides the foundation that the other Strata crates
//! build on:
//!
//! - **Error types** — [`StrataError`] and [`Result`] for structured error handling
//! - **Traits** — [`Scored`] and [`Summarizable`] contracts for analysis outputs
//! - **Matrices** — [`SquareMatrix`] dense square matrices with preallocated products
//! - **Scans** — generic associative prefix/suffix scans with a block decomposition
//! - **Execution** — the [`Executor`] block scheduler and [`RunControl`] cancellation
//! - **Vocabulary** — the word token ↔ id bijection consumed by the models

pub mod error;
pub mod traits;
pub mod matrix;
pub mod scan;
pub mod executor;
pub mod vocabulary;

pub use error::{Result, StrataError};
pub use executor::{Executor, RunControl, SerialExecutor};
pub use matrix::SquareMatrix;
pub use traits::*;
pub use vocabulary::Vocabulary;

#[cfg(feature = "parallel")]
pub use executor::RayonExecutor;
