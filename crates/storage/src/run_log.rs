use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use spanbackup_core::{BackupSet, FileTransaction, RunLogEntry, Volume, SCHEMA_VERSION};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RunLogError;
use crate::sqlite::{conversion_err, parse_path, parse_ts, parse_uuid, path_text, PRAGMAS};

pub const RUN_LOG_PREFIX: &str = "spanbackup-runlog-";
pub const RUN_LOG_SUFFIX: &str = ".sqlite";

const CREATE_SCHEMA: &str = "
CREATE TABLE run_log (
    id INTEGER PRIMARY KEY,
    uuid TEXT NOT NULL,
    version INTEGER NOT NULL,
    host TEXT NOT NULL,
    created_at TEXT NOT NULL,
    backup_set_uuid TEXT,
    backup_set_json TEXT,
    completed_at TEXT
);
CREATE TABLE entries (
    id INTEGER PRIMARY KEY,
    source_path TEXT NOT NULL,
    dest_path TEXT NOT NULL,
    size INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    volume_uuid TEXT NOT NULL
);
CREATE UNIQUE INDEX idx_entries_source ON entries(source_path);
";

/// Journal of source paths already copied somewhere, kept on the operator's
/// machine and independent of any volume.
///
/// Entries are only ever appended. Presence of an entry is what makes a
/// resumed run skip a file.
#[derive(Debug)]
pub struct RunLog {
    conn: Connection,
    path: PathBuf,
    uuid: Uuid,
    schema_version: u32,
    host: String,
    created_at: DateTime<Utc>,
    current_backup_set: Option<BackupSet>,
    completed_at: Option<DateTime<Utc>>,
}

impl RunLog {
    /// Starts a fresh journal in `dir`. Its path is the token needed to resume.
    pub fn create(dir: &Path, host: &str) -> Result<Self> {
        let uuid = Uuid::new_v4();
        let dir = std::path::absolute(dir).with_context(|| format!("resolve log dir {}", dir.display()))?;
        let path = dir.join(format!("{RUN_LOG_PREFIX}{uuid}{RUN_LOG_SUFFIX}"));
        let created_at = Utc::now();

        let mut conn = Connection::open(&path).with_context(|| format!("create run log {}", path.display()))?;
        conn.execute_batch(PRAGMAS).context("configure run log")?;
        let tx = conn.transaction().context("begin run log creation")?;
        tx.execute_batch(CREATE_SCHEMA).context("create run log schema")?;
        tx.execute(
            "INSERT INTO run_log (id, uuid, version, host, created_at) VALUES (1, ?1, ?2, ?3, ?4)",
            params![uuid.to_string(), SCHEMA_VERSION, host, created_at.to_rfc3339()],
        )
        .context("record run log header")?;
        tx.commit().context("commit run log creation")?;

        info!(path = %path.display(), run = %uuid, "created run log");
        Ok(Self {
            conn,
            path,
            uuid,
            schema_version: SCHEMA_VERSION,
            host: host.to_owned(),
            created_at,
            current_backup_set: None,
            completed_at: None,
        })
    }

    /// Opens an existing journal by path.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(RunLogError::NotFound(path.to_path_buf()).into());
        }
        let path = std::path::absolute(path).with_context(|| format!("resolve run log {}", path.display()))?;
        let corrupt = |reason: String| RunLogError::Corrupt {
            path: path.clone(),
            reason,
        };

        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_WRITE)
            .map_err(|e| corrupt(e.to_string()))?;
        conn.execute_batch(PRAGMAS).map_err(|e| corrupt(e.to_string()))?;

        let header = conn
            .query_row(
                "SELECT uuid, version, host, created_at, backup_set_json, completed_at FROM run_log WHERE id = 1",
                [],
                |row| {
                    let backup_set = row
                        .get::<_, Option<String>>(4)?
                        .map(|raw| serde_json::from_str::<BackupSet>(&raw))
                        .transpose()
                        .map_err(|e| conversion_err(4, e))?;
                    let completed_at = row
                        .get::<_, Option<String>>(5)?
                        .map(|raw| parse_ts(5, raw))
                        .transpose()?;
                    Ok((
                        parse_uuid(0, row.get(0)?)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                        parse_ts(3, row.get(3)?)?,
                        backup_set,
                        completed_at,
                    ))
                },
            )
            .map_err(|e| corrupt(e.to_string()))?;
        let (uuid, schema_version, host, created_at, current_backup_set, completed_at) = header;
        if schema_version != SCHEMA_VERSION {
            return Err(corrupt(format!(
                "schema version {schema_version}, expected {SCHEMA_VERSION}"
            ))
            .into());
        }

        info!(path = %path.display(), run = %uuid, %host, "using existing run log");
        Ok(Self {
            conn,
            path,
            uuid,
            schema_version,
            host,
            created_at,
            current_backup_set,
            completed_at,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last backup set segment staged by this run, if any.
    pub fn current_backup_set(&self) -> Option<&BackupSet> {
        self.current_backup_set.as_ref()
    }

    pub fn current_backup_set_uuid(&self) -> Option<Uuid> {
        self.current_backup_set.as_ref().map(|set| set.uuid)
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn has_entry(&self, source: &Path) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM entries WHERE source_path = ?1",
                [path_text(source)],
                |_| Ok(()),
            )
            .optional()
            .context("look up run log entry")?;
        Ok(found.is_some())
    }

    /// Durably records that `transaction` landed on `volume`. Call only after
    /// the volume reported a successful copy.
    pub fn append(&mut self, transaction: &FileTransaction, volume: &Volume) -> Result<()> {
        let entry = RunLogEntry::from_transaction(transaction, volume);
        self.conn
            .execute(
                "INSERT OR IGNORE INTO entries (source_path, dest_path, size, timestamp, content_hash, volume_uuid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    path_text(&entry.source_path),
                    path_text(&entry.dest_path),
                    entry.size as i64,
                    entry.timestamp.to_rfc3339(),
                    entry.content_hash,
                    entry.volume_uuid.to_string()
                ],
            )
            .with_context(|| format!("append run log entry for {}", entry.source_path.display()))?;
        Ok(())
    }

    /// Remembers the segment the run is writing to, so a resume rejoins it.
    pub fn set_backup_set(&mut self, set: &BackupSet) -> Result<()> {
        let raw = serde_json::to_string(set).context("serialize backup set")?;
        self.conn
            .execute(
                "UPDATE run_log SET backup_set_uuid = ?1, backup_set_json = ?2 WHERE id = 1",
                params![set.uuid.to_string(), raw],
            )
            .context("record current backup set")?;
        debug!(backup_set = %set.uuid, sequence = set.sequence_number, "run log tracks backup set");
        self.current_backup_set = Some(set.clone());
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<()> {
        let now = Utc::now();
        self.conn
            .execute("UPDATE run_log SET completed_at = ?1 WHERE id = 1", [now.to_rfc3339()])
            .context("mark run log completed")?;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<RunLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_path, dest_path, size, timestamp, content_hash, volume_uuid FROM entries ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RunLogEntry {
                source_path: parse_path(row.get(0)?),
                dest_path: parse_path(row.get(1)?),
                size: row.get::<_, i64>(2)? as u64,
                timestamp: parse_ts(3, row.get(3)?)?,
                content_hash: row.get(4)?,
                volume_uuid: parse_uuid(5, row.get(5)?)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn entry_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))
            .context("count run log entries")?;
        Ok(count as u64)
    }

    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| e)
            .with_context(|| format!("close run log {}", self.path.display()))
    }
}
