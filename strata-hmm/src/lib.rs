//! Hidden Markov model core for the Strata theme life-cycle ecosystem.
//!
//! The observable states are vocabulary words; the hidden states are one
//! background distribution plus K theme distributions. Training
//! re-estimates π and A with Baum-Welch while the emission matrix B
//! (which comes from the EM theme fitter) stays fixed; decoding assigns
//! a hidden state to every word of a stream with Viterbi.
//!
//! Both algorithms exist in a sequential form and in a block-parallel
//! form built on the associative-scan reformulation of the
//! forward/backward recurrences; the two forms agree to floating-point
//! noise and are dispatched on problem size.
//!
//! # Quick start
//!
//! ```
//! use strata_core::{RunControl, SerialExecutor};
//! use strata_hmm::{decode, train, BwConfig, Hmm};
//!
//! let pi = vec![0.6, 0.4];
//! let a = vec![
//!     0.7, 0.3, //
//!     0.2, 0.8,
//! ];
//! let b = vec![
//!     0.9, 0.1, //
//!     0.1, 0.9,
//! ];
//! let mut hmm = Hmm::new(2, 2, pi, a, b).unwrap();
//! let observations = hmm.generate(200, 7);
//!
//! let report = train(
//!     &mut hmm,
//!     &observations,
//!     &BwConfig::default(),
//!     &SerialExecutor,
//!     &RunControl::unbounded(),
//! )
//! .unwrap();
//! assert!(report.iterations >= 1);
//!
//! let (path, score) = decode(&hmm, &observations).unwrap();
//! assert_eq!(path.len(), observations.len());
//! assert!(score.is_finite());
//! ```

pub mod model;
pub mod blocks;
pub mod baum_welch;
pub mod viterbi;

pub use baum_welch::{train, train_blocked, train_sequential, BwConfig, TrainReport};
pub use blocks::{split_blocks, ObservationBlock};
pub use model::Hmm;
pub use viterbi::{decode, decode_blocked, path_log_probability};
