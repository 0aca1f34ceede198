use std::path::PathBuf;

use thiserror::Error;

/// Catalog precondition and invariant failures. All of them are fatal to the
/// command that hit them.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("volume {0} is not initialised")]
    NotInitialized(PathBuf),
    #[error("volume {root} is already initialised: {catalog}")]
    AlreadyInitialized { root: PathBuf, catalog: PathBuf },
    #[error("volume {root} holds {count} catalogs; expected at most one")]
    MultipleCatalogs { root: PathBuf, count: usize },
    #[error("catalog {path} has schema version {found}, expected {expected}")]
    SchemaMismatch { path: PathBuf, found: u32, expected: u32 },
    #[error("copy of {path} is {copied} bytes but the source is {expected} bytes")]
    SizeMismatch { path: PathBuf, copied: u64, expected: u64 },
}

#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("run log not found: {0}")]
    NotFound(PathBuf),
    #[error("run log {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}
