use thiserror::Error;

use crate::likelihood::LikelihoodError;
use crate::modifiers::ModifierError;
use crate::outcomes::OutcomeError;
use crate::params::ParamError;
use crate::space::SpaceError;
use crate::transitions::CompileError;

/// Crate-wide error taxonomy. Component-local errors are narrower (and
/// cheaper to match on inside their own module); this enum is the
/// boundary type returned by `RunContext` construction and by the
/// inference controller.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Space(#[from] SpaceError),

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Modifier(#[from] ModifierError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Outcome(#[from] OutcomeError),

    #[error(transparent)]
    Likelihood(#[from] LikelihoodError),

    #[error("integration failed: {0}")]
    Integration(#[from] crate::integrator::IntegrationError),

    #[error("data error: {0}")]
    Data(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}
