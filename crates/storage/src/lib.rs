pub mod error;
mod fault;
pub mod run_log;
mod sqlite;
pub mod volume;

pub use error::{RunLogError, VolumeError};
pub use fault::{is_catalog_full, is_out_of_space, is_storage_full, Outcome};
pub use run_log::{RunLog, RUN_LOG_PREFIX};
pub use volume::{
    BackupOutcome, CopySettings, FileCopy, StagedBackupSet, VolumeStore, VolumeSummary, CATALOG_PREFIX,
    DEFAULT_CHUNK_SIZE,
};
