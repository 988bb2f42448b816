//! Error types for the managed tree.

use kestrel_value::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("raw state must sanitize to a JSON mapping")]
    InvalidState,
    #[error("plugin at {path} is disabled and cannot register further commands")]
    DisabledActor { path: Path },
    #[error("command {name:?} is already registered at {path}")]
    DuplicateCommand { path: Path, name: String },
}

pub type EngineResult<T> = Result<T, EngineError>;
