//! Error types for the filesystem loader.

use std::path::PathBuf;

use thiserror::Error;

/// `FilesystemReadFailure` from the engine's error taxonomy: logged by the
/// loader, never surfaced to `set_raw_state` — the previous snapshot
/// persists.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("failed to parse {path} as JSON: {source}")]
    Json { path: PathBuf, source: serde_json::Error },
    #[error("failed to watch {path}: {source}")]
    Watch { path: PathBuf, source: notify::Error },
    #[error(transparent)]
    Value(#[from] kestrel_value::ValueError),
}

pub type LoaderResult<T> = Result<T, LoaderError>;
