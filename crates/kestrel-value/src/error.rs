//! Error types for value and path operations.

use thiserror::Error;

use crate::path::PathElement;

/// Errors raised synchronously by value and path-algebra operations.
#[derive(Debug, Error)]
pub enum ValueError {
    #[error("path elements must be a string key or non-negative integer index, got {0:?}")]
    InvalidPathElement(String),
    #[error("path element {element:?} cannot be resolved in a value of kind {kind}")]
    PathElementTypeMismatch { element: PathElement, kind: &'static str },
    #[error("index {index} out of range for sequence of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("value is not valid JSON: {0}")]
    NotJson(String),
}

pub type ValueResult<T> = Result<T, ValueError>;
