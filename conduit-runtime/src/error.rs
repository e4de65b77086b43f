// Runtime errors
// Crate-level error type wrapping the per-module errors

use crate::controller::LoadError;
use crate::syntax::SyntaxError;

use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Syntax(#[from] SyntaxError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("controller is already running")]
    AlreadyRunning,
}
