//! Unified error handling for the post-estimation pipeline.
//!
//! Model adapters and grid builders keep their own error enums
//! (`ModelError`, `GridError`); everything that can go wrong while composing
//! estimands, differentiating them, or finalizing inference surfaces as
//! `EffectsError`. Validation errors are raised before any model evaluation.

use crate::effects::grid::GridError;
use crate::effects::model::ModelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EffectsError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error(
        "Jacobian evaluation failed while perturbing parameter {parameter}{}: {reason}",
        .row.map(|r| format!(" (output row {r})")).unwrap_or_default()
    )]
    JacobianEvaluation {
        parameter: usize,
        row: Option<usize>,
        reason: String,
    },

    #[error(
        "Estimate in output row {row} is {value} at the fitted parameters, so its standard error cannot be computed."
    )]
    NonFiniteEstimate { row: usize, value: f64 },

    #[error("Conflicting options: {0}")]
    ConflictingOptions(String),

    #[error("Invalid hypothesis specification: {0}")]
    InvalidHypothesisSpec(String),

    #[error("No usable focal variable: {0}")]
    EmptyFocalSet(String),

    #[error("Invalid value for option '{option}': {message}")]
    InvalidOption {
        option: &'static str,
        message: String,
    },

    #[error("Group '{0}' has zero total weight; at least one member row needs a positive weight.")]
    ZeroWeightGroup(String),

    #[error("Failed to write estimate table: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to read options file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML options: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type EffectsResult<T> = Result<T, EffectsError>;

impl EffectsError {
    pub(crate) fn invalid_option(option: &'static str, message: impl Into<String>) -> Self {
        EffectsError::InvalidOption {
            option,
            message: message.into(),
        }
    }
}
