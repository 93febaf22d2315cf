//! `swarmrouter-selection`
//!
//! **Responsibility:** decide which validator runs a job.
//!
//! Pure and synchronous. The registry snapshot, the clock and the random
//! source are all passed in; nothing here touches storage or the network.

pub mod scoring;
pub mod selector;

pub use scoring::{ScoringWeights, SelectionConfig, calculate_score};
pub use selector::{ScoredValidator, ValidatorSelector};

/// Selection configuration error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SelectionError {
    #[error("invalid scoring weights: {0}")]
    InvalidWeights(String),
}
