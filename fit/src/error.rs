//! Error types for the fitting pipeline.

use std::io;

use optimization::nnls::SolverError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FitError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("solver error: {0}")]
    Solver(#[from] SolverError),

    #[error("operation was cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, FitError>;
