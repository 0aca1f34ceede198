use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::is_sentinel;

/// Schema version written into every persisted record.
pub const SCHEMA_VERSION: u32 = 1;

/// Identity of one physical storage location.
///
/// `uuid` never changes once created; `root_path` is re-bound whenever the
/// volume is opened because it may be mounted somewhere else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    pub uuid: Uuid,
    pub schema_version: u32,
    pub root_path: PathBuf,
}

/// One logical backup run, or one volume-sized segment of it.
///
/// Segments of the same run share `uuid` and are ordered by
/// `sequence_number`. Only the segment written last in a completed run has
/// `is_final` set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupSet {
    pub uuid: Uuid,
    pub backup_source_dirs: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub host: String,
    pub schema_version: u32,
    pub sequence_number: u32,
    pub is_final: bool,
}

impl BackupSet {
    /// First segment of a new run. Duplicate source dirs are dropped, keeping
    /// the first occurrence.
    pub fn start(source_dirs: impl IntoIterator<Item = PathBuf>, host: &str, created_at: DateTime<Utc>) -> Self {
        let mut backup_source_dirs: Vec<PathBuf> = Vec::new();
        for dir in source_dirs {
            if !backup_source_dirs.contains(&dir) {
                backup_source_dirs.push(dir);
            }
        }
        Self {
            uuid: Uuid::new_v4(),
            backup_source_dirs,
            created_at,
            host: host.to_owned(),
            schema_version: SCHEMA_VERSION,
            sequence_number: 0,
            is_final: false,
        }
    }

    /// The segment that continues `prior` on the next volume.
    pub fn spawn_next(prior: &BackupSet) -> Self {
        Self {
            uuid: prior.uuid,
            backup_source_dirs: prior.backup_source_dirs.clone(),
            created_at: prior.created_at,
            host: prior.host.clone(),
            schema_version: SCHEMA_VERSION,
            sequence_number: prior.sequence_number + 1,
            is_final: false,
        }
    }
}

/// Catalog record of one file physically stored on one volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileTransaction {
    pub id: i64,
    pub source_path: PathBuf,
    /// Relative to the volume root.
    pub dest_path: PathBuf,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
    pub content_hash: String,
    pub schema_version: u32,
    /// Catalog row id of the backup set segment this file was stored under.
    pub backup_set_ref: i64,
}

impl FileTransaction {
    pub fn is_verified(&self) -> bool {
        !is_sentinel(&self.content_hash)
    }
}

/// Run log record: `source_path` was durably copied onto `volume_uuid`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunLogEntry {
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
    pub content_hash: String,
    pub volume_uuid: Uuid,
}

impl RunLogEntry {
    pub fn from_transaction(transaction: &FileTransaction, volume: &Volume) -> Self {
        Self {
            source_path: transaction.source_path.clone(),
            dest_path: transaction.dest_path.clone(),
            size: transaction.size,
            timestamp: transaction.timestamp,
            content_hash: transaction.content_hash.clone(),
            volume_uuid: volume.uuid,
        }
    }
}
