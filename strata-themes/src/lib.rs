//! EM theme extraction for the Strata theme life-cycle ecosystem.
//!
//! Fits a probabilistic mixture model per time partition: documents are
//! explained by a fixed background word distribution (weighted by
//! λ_B) plus K latent themes, estimated by expectation-maximization.
//!
//! # Quick start
//!
//! ```
//! use std::collections::HashMap;
//! use strata_themes::{fit, BackgroundModel, Document, EmConfig, TimeInterval, TimePartition};
//!
//! let background = BackgroundModel::new(HashMap::from([(0, 0.5), (1, 0.5)])).unwrap();
//! let partition = TimePartition {
//!     id: 0,
//!     interval: TimeInterval { start: 0, end: 604_800 },
//!     documents: vec![
//!         Document::new("a-heavy", HashMap::from([(0, 4), (1, 1)])),
//!         Document::new("b-heavy", HashMap::from([(0, 1), (1, 4)])),
//!     ],
//! };
//! let config = EmConfig { num_themes: 2, lambda_background: 0.5, ..EmConfig::default() };
//! let result = fit(&partition, &background, &config).unwrap();
//! assert_eq!(result.themes.len(), 2);
//! ```

pub mod partition;
pub mod theme;
pub mod fitter;

pub use fitter::{fit, fit_with_control, EmConfig, EmFit};
pub use partition::{BackgroundModel, Document, TimeInterval, TimePartition};
pub use theme::Theme;
