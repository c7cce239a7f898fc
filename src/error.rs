use thiserror::Error;

/// EM stopped at the iteration cap before the log-likelihood settled.
///
/// Carried on a fit as a warning; the parameters reached at the cap are still
/// used for decoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NonConvergence {
    pub iterations: usize,
    pub last_improvement: f64,
}

/// Errors surfaced by the regime pipeline and its adapters
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Empty result: {0}")]
    EmptyResult(String),

    #[error("EM did not converge after {iterations} iterations (last improvement {last_improvement:.3e})")]
    NonConvergence { iterations: usize, last_improvement: f64 },

    #[error("Market data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Chart rendering failed: {0}")]
    Render(String),
}

impl PipelineError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        PipelineError::InvalidInput(reason.into())
    }
}

impl From<NonConvergence> for PipelineError {
    fn from(warning: NonConvergence) -> Self {
        PipelineError::NonConvergence {
            iterations: warning.iterations,
            last_improvement: warning.last_improvement,
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Persistence(err.to_string())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
