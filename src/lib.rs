//! Regional abundance-index estimation from multi-site count series.
//!
//! A two-stage batch pipeline for irregularly sampled monitoring counts
//! (e.g., weekly butterfly transects):
//!
//! 1. [`curve::estimate_curves`] fits a regionally pooled seasonal
//!    activity curve ("flight curve") per year, with seedable site
//!    subsampling and bounded retry.
//! 2. [`impute::impute`] uses the curve as a log-offset to fill missing
//!    site-level counts, borrowing the nearest complete year's phenology
//!    when a curve could not be estimated, and
//!    [`index::aggregate`] reduces the imputed series to one abundance
//!    index per site and year.
//!
//! All years' curves are estimated before any imputation runs; the
//! phenology fallback may reach five years in either direction. Input
//! contract violations are fatal; fit failures, numerical degeneracy and
//! unresolved phenology degrade the affected scope to missing values and
//! are reported on the `tracing` warning channel.

pub mod curve;
pub mod data;
pub mod error;
pub mod impute;
pub mod index;
pub mod phenology;
pub mod solver;

// Re-export commonly used types
pub use curve::{estimate_curves, CurveConfig, CurveSet};
pub use data::check_season_table;
pub use error::ContractError;
pub use impute::{impute, ImputeConfig, ImputeOutput};
pub use index::aggregate;
pub use solver::{FitOutcome, FittedGlm, GlmFamily};
