//! Black-box statistical solvers.
//!
//! The pipeline treats regression fitting as an external engine: it hands
//! over a design matrix, response and family, and receives fitted values
//! or an explicit failure. Nothing outside this module inspects solver
//! internals beyond the [`FitOutcome`] surface.

pub mod basis;
pub mod glm;

pub use glm::{fit_glm, FailureKind, FitFailure, FitOutcome, FittedGlm, GlmFamily, SolverOptions};
