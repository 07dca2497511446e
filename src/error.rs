//! Fatal input-contract errors.
//!
//! Only contract violations abort a run. Fit failures, numerical
//! degeneracy and unresolved phenology are recovered locally: the affected
//! scope gets missing fitted values and a warning on the log channel.

use crate::solver::GlmFamily;
use thiserror::Error;

/// Input-contract violations. Raised immediately, no partial result.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("required column '{0}' is missing from the input table")]
    MissingColumn(String),

    #[error("column '{0}' contains null values but must be fully populated")]
    NullsInRequired(String),

    #[error("{0} is empty")]
    EmptyTable(&'static str),

    #[error("table contains {0} species; the pipeline processes one species per call")]
    MultipleSpecies(usize),

    #[error("species mismatch between season table ('{season}') and curve table ('{curve}')")]
    SpeciesMismatch { season: String, curve: String },

    #[error("model family {0:?} is not supported for {1}")]
    UnsupportedFamily(GlmFamily, &'static str),
}
