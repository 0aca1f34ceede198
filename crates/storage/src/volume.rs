use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use spanbackup_core::{
    hash_reader, map_destination, BackupSet, FileTransaction, IntegrityHasher, Volume, SCHEMA_VERSION,
    SENTINEL_HASH,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::VolumeError;
use crate::fault::{is_catalog_full, Fault, Outcome};
use crate::sqlite::{conversion_err, parse_path, parse_ts, parse_uuid, path_text, PRAGMAS};

pub const CATALOG_PREFIX: &str = "spanbackup-volume-";
pub const CATALOG_SUFFIX: &str = ".sqlite";
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

const PARTIAL_SUFFIX: &str = ".spanbackup-partial";

const CREATE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS volume (
    id INTEGER PRIMARY KEY,
    uuid TEXT NOT NULL,
    version INTEGER NOT NULL,
    root TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS backup_sets (
    id INTEGER PRIMARY KEY,
    uuid TEXT NOT NULL,
    backup_dirs TEXT NOT NULL,
    created_at TEXT NOT NULL,
    host TEXT NOT NULL,
    version INTEGER NOT NULL,
    sequence_number INTEGER NOT NULL,
    is_final INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS file_transactions (
    id INTEGER PRIMARY KEY,
    source_path TEXT NOT NULL,
    dest_path TEXT NOT NULL,
    size INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    version INTEGER NOT NULL,
    backup_set_id INTEGER NOT NULL REFERENCES backup_sets(id)
);
CREATE INDEX IF NOT EXISTS idx_backup_sets_lineage ON backup_sets(uuid, sequence_number);
CREATE INDEX IF NOT EXISTS idx_file_transactions_source ON file_transactions(source_path);
CREATE INDEX IF NOT EXISTS idx_file_transactions_dest ON file_transactions(dest_path);
";

const TRANSACTION_COLUMNS: &str =
    "id, source_path, dest_path, size, timestamp, content_hash, version, backup_set_id";

const BACKUP_SET_COLUMNS: &str = "id, uuid, backup_dirs, created_at, host, version, sequence_number, is_final";

/// Per-run knobs for copying files onto a volume.
#[derive(Debug, Clone)]
pub struct CopySettings {
    /// Host directory files are mapped under.
    pub host: String,
    pub chunk_size: usize,
    /// Hash both sides before reusing a same-size destination file.
    pub verify_existing: bool,
}

impl CopySettings {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            verify_existing: true,
        }
    }
}

/// A backup set segment together with its row in one volume's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedBackupSet {
    pub row_id: i64,
    pub set: BackupSet,
}

/// A file stored by [`VolumeStore::backup_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCopy {
    pub transaction: FileTransaction,
    /// The destination already held matching bytes; nothing was copied.
    pub reused: bool,
}

pub type BackupOutcome = Outcome<FileCopy>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VolumeSummary {
    pub files: u64,
    pub bytes: u64,
    /// Distinct backup set lineages with at least one segment here.
    pub backup_sets: u64,
    pub segments: u64,
    pub final_backup_sets: u64,
}

/// The catalog of one storage volume, held open exclusively until
/// [`VolumeStore::disconnect`].
#[derive(Debug)]
pub struct VolumeStore {
    conn: Connection,
    catalog_path: PathBuf,
    volume: Volume,
    settings: CopySettings,
    capacity: Option<u64>,
}

impl VolumeStore {
    /// Opens the catalog under `root`, creating one when none exists.
    ///
    /// An existing catalog is re-bound to `root` since the volume may have
    /// been remounted. Fails with [`VolumeError::AlreadyInitialized`] when a
    /// catalog exists and `allow_reuse` is false, and with
    /// [`VolumeError::NotInitialized`] when none exists and
    /// `require_existing` is set.
    pub fn init(root: &Path, allow_reuse: bool, require_existing: bool) -> Result<Self> {
        Self::init_with_page_limit(root, allow_reuse, require_existing, None)
    }

    /// [`VolumeStore::init`] with the catalog held to at most `max_pages`
    /// SQLite pages. Growing past the limit reports out of space, the same
    /// as a full filesystem.
    pub fn init_with_page_limit(
        root: &Path,
        allow_reuse: bool,
        require_existing: bool,
        max_pages: Option<u64>,
    ) -> Result<Self> {
        let root = std::path::absolute(root).with_context(|| format!("resolve volume root {}", root.display()))?;
        let mut catalogs = find_catalogs(&root)?;
        if catalogs.len() > 1 {
            return Err(VolumeError::MultipleCatalogs {
                root,
                count: catalogs.len(),
            }
            .into());
        }

        let mut store = match catalogs.pop() {
            Some(catalog) if !allow_reuse => {
                return Err(VolumeError::AlreadyInitialized { root, catalog }.into());
            }
            Some(catalog) => Self::reopen(root, catalog, max_pages)?,
            None if require_existing => return Err(VolumeError::NotInitialized(root).into()),
            None => Self::create(root, max_pages)?,
        };

        let recovered = store.recover_in_flight()?;
        if recovered > 0 {
            warn!(volume = %store.volume.uuid, recovered, "discarded interrupted copies");
        }
        Ok(store)
    }

    fn create(root: PathBuf, max_pages: Option<u64>) -> Result<Self> {
        let uuid = Uuid::new_v4();
        let catalog_path = root.join(format!("{CATALOG_PREFIX}{uuid}{CATALOG_SUFFIX}"));
        info!(path = %catalog_path.display(), "creating volume catalog");

        let mut conn = open_catalog(&catalog_path, max_pages)?;
        if let Err(err) = write_identity(&mut conn, uuid, &root) {
            drop(conn);
            if let Err(cleanup) = remove_if_present(&catalog_path) {
                warn!(error = %cleanup, "could not remove unfinished catalog");
            }
            return Err(err);
        }

        Ok(Self {
            conn,
            catalog_path,
            volume: Volume {
                uuid,
                schema_version: SCHEMA_VERSION,
                root_path: root,
            },
            settings: CopySettings::new("localhost"),
            capacity: None,
        })
    }

    fn reopen(root: PathBuf, catalog_path: PathBuf, max_pages: Option<u64>) -> Result<Self> {
        let conn = open_catalog(&catalog_path, max_pages)?;
        let (uuid, version): (Uuid, u32) = conn
            .query_row("SELECT uuid, version FROM volume WHERE id = 1", [], |row| {
                Ok((parse_uuid(0, row.get(0)?)?, row.get(1)?))
            })
            .with_context(|| format!("read volume identity from {}", catalog_path.display()))?;
        if version != SCHEMA_VERSION {
            return Err(VolumeError::SchemaMismatch {
                path: catalog_path,
                found: version,
                expected: SCHEMA_VERSION,
            }
            .into());
        }

        conn.execute("UPDATE volume SET root = ?1 WHERE id = 1", [path_text(&root)])
            .context("re-bind volume root")?;
        debug!(volume = %uuid, root = %root.display(), "opened volume catalog");

        Ok(Self {
            conn,
            catalog_path,
            volume: Volume {
                uuid,
                schema_version: version,
                root_path: root,
            },
            settings: CopySettings::new("localhost"),
            capacity: None,
        })
    }

    pub fn with_settings(mut self, settings: CopySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Caps the bytes of verified files this volume may hold. Writes past the
    /// cap fail exactly like a full filesystem.
    pub fn with_capacity(mut self, capacity: Option<u64>) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn catalog_path(&self) -> &Path {
        &self.catalog_path
    }

    /// Releases the catalog. Required before the volume is unmounted.
    pub fn disconnect(self) -> Result<()> {
        let uuid = self.volume.uuid;
        self.conn
            .close()
            .map_err(|(_, e)| e)
            .with_context(|| format!("close catalog of volume {uuid}"))?;
        debug!(volume = %uuid, "volume disconnected");
        Ok(())
    }

    /// Writes a new catalog row for `set`.
    pub fn stage_backup_set(&mut self, set: &BackupSet) -> Result<Outcome<StagedBackupSet>> {
        let dirs = serde_json::to_string(&set.backup_source_dirs).context("serialize backup dirs")?;
        let inserted = self
            .conn
            .execute(
                "INSERT INTO backup_sets (uuid, backup_dirs, created_at, host, version, sequence_number, is_final)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    set.uuid.to_string(),
                    dirs,
                    set.created_at.to_rfc3339(),
                    set.host,
                    set.schema_version,
                    set.sequence_number,
                    set.is_final
                ],
            )
            .map(|_| StagedBackupSet {
                row_id: self.conn.last_insert_rowid(),
                set: set.clone(),
            })
            .map_err(|e| Fault::sql(e, || format!("stage backup set {}", set.uuid)));
        Fault::into_outcome(inserted)
    }

    /// The catalog row for one segment of a lineage, if this volume holds it.
    pub fn find_backup_set(&self, uuid: Uuid, sequence_number: u32) -> Result<Option<StagedBackupSet>> {
        let sql = format!(
            "SELECT {BACKUP_SET_COLUMNS} FROM backup_sets WHERE uuid = ?1 AND sequence_number = ?2
             ORDER BY id DESC LIMIT 1"
        );
        self.conn
            .query_row(&sql, params![uuid.to_string(), sequence_number], row_to_backup_set)
            .optional()
            .context("look up backup set")
    }

    pub fn mark_final(&mut self, staged: &mut StagedBackupSet) -> Result<()> {
        self.conn
            .execute("UPDATE backup_sets SET is_final = 1 WHERE id = ?1", [staged.row_id])
            .with_context(|| format!("finalize backup set {}", staged.set.uuid))?;
        staged.set.is_final = true;
        info!(
            backup_set = %staged.set.uuid,
            sequence = staged.set.sequence_number,
            volume = %self.volume.uuid,
            "backup set finalized"
        );
        Ok(())
    }

    /// Stores `source` on this volume under `backup_set`.
    ///
    /// A same-size destination that is already present is recorded again
    /// without copying (after a content check when `verify_existing` is on).
    /// Otherwise a sentinel row is committed first, the bytes are streamed
    /// into a partial file, and the row gets its digest once the partial file
    /// is flushed and renamed into place. Running out of room on either the
    /// data or the catalog side removes every trace of the attempt and yields
    /// [`Outcome::OutOfSpace`].
    pub fn backup_file(&mut self, source: &Path, backup_set: &StagedBackupSet) -> Result<BackupOutcome> {
        let dest = map_destination(source, &self.settings.host, &self.volume.root_path)?;
        let rel = dest
            .strip_prefix(&self.volume.root_path)
            .with_context(|| format!("{} is outside the volume", dest.display()))?
            .to_path_buf();
        let size = fs::metadata(source)
            .with_context(|| format!("stat source {}", source.display()))?
            .len();

        if let Some(hash) = self.reusable_hash(source, &dest, &rel, size)? {
            let recorded = self
                .insert_transaction(source, &rel, size, &hash, backup_set.row_id)
                .map(|transaction| FileCopy {
                    transaction,
                    reused: true,
                });
            let outcome = Fault::into_outcome(recorded)?;
            if !outcome.is_out_of_space() {
                debug!(source = %source.display(), volume = %self.volume.uuid, "already present");
            }
            return Ok(outcome);
        }

        let row_id = match self.reserve(source, &rel, size, backup_set.row_id) {
            Ok(row_id) => row_id,
            Err(Fault::OutOfSpace) => {
                info!(source = %source.display(), volume = %self.volume.uuid, "catalog out of space");
                return Ok(Outcome::OutOfSpace);
            }
            Err(Fault::Fatal(err)) => return Err(err),
        };

        let partial = partial_path(&dest);
        let copied = match self.stream(source, &dest, &partial, &rel, size) {
            Ok(hash) => match place(&partial, &dest) {
                Ok(()) => self.seal(row_id, &rel, &hash).map_err(|fault| (fault, true)),
                Err(fault) => Err((fault, false)),
            },
            Err(fault) => Err((fault, false)),
        };
        match copied {
            Ok(transaction) => {
                info!(
                    source = %source.display(),
                    volume = %self.volume.uuid,
                    size,
                    "copied"
                );
                Ok(Outcome::Stored(FileCopy {
                    transaction,
                    reused: false,
                }))
            }
            Err((Fault::OutOfSpace, placed)) => {
                info!(source = %source.display(), volume = %self.volume.uuid, "out of space");
                self.abandon(row_id, &rel, &partial, placed.then_some(dest.as_path()))?;
                Ok(Outcome::OutOfSpace)
            }
            Err((Fault::Fatal(err), placed)) => {
                if let Err(cleanup) = self.abandon(row_id, &rel, &partial, placed.then_some(dest.as_path())) {
                    warn!(error = %cleanup, "cleanup after failed copy also failed");
                }
                Err(err)
            }
        }
    }

    fn reusable_hash(&self, source: &Path, dest: &Path, rel: &Path, size: u64) -> Result<Option<String>> {
        let meta = match fs::metadata(dest) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("stat destination {}", dest.display())),
        };
        if !meta.is_file() || meta.len() != size {
            return Ok(None);
        }

        if self.settings.verify_existing {
            let source_hash = self.hash_file(source)?;
            let dest_hash = self.hash_file(dest)?;
            if source_hash == dest_hash {
                return Ok(Some(source_hash));
            }
            warn!(dest = %dest.display(), "same-size destination differs from source; recopying");
            return Ok(None);
        }

        match self.latest_verified(rel)? {
            Some((hash, _)) => Ok(Some(hash)),
            None => self.hash_file(dest).map(Some),
        }
    }

    fn hash_file(&self, path: &Path) -> Result<String> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        hash_reader(file, self.settings.chunk_size).with_context(|| format!("hash {}", path.display()))
    }

    /// Digest and size of the newest verified row for `rel`.
    fn latest_verified(&self, rel: &Path) -> Result<Option<(String, u64)>> {
        self.conn
            .query_row(
                "SELECT content_hash, size FROM file_transactions
                 WHERE dest_path = ?1 AND content_hash != ?2 ORDER BY id DESC LIMIT 1",
                params![path_text(rel), SENTINEL_HASH],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)),
            )
            .optional()
            .context("look up prior transaction")
    }

    fn insert_transaction(
        &mut self,
        source: &Path,
        rel: &Path,
        size: u64,
        hash: &str,
        backup_set_ref: i64,
    ) -> Result<FileTransaction, Fault> {
        let timestamp = Utc::now();
        self.conn
            .execute(
                "INSERT INTO file_transactions (source_path, dest_path, size, timestamp, content_hash, version, backup_set_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    path_text(source),
                    path_text(rel),
                    size as i64,
                    timestamp.to_rfc3339(),
                    hash,
                    SCHEMA_VERSION,
                    backup_set_ref
                ],
            )
            .map_err(|e| Fault::sql(e, || format!("record {}", source.display())))?;
        Ok(FileTransaction {
            id: self.conn.last_insert_rowid(),
            source_path: source.to_path_buf(),
            dest_path: rel.to_path_buf(),
            size,
            timestamp,
            content_hash: hash.to_owned(),
            schema_version: SCHEMA_VERSION,
            backup_set_ref,
        })
    }

    /// Phase one: commit a sentinel row before any byte reaches the volume.
    fn reserve(&mut self, source: &Path, rel: &Path, size: u64, backup_set_ref: i64) -> Result<i64, Fault> {
        let what = || format!("reserve catalog row for {}", source.display());
        let tx = self.conn.transaction().map_err(|e| Fault::sql(e, what))?;
        tx.execute(
            "DELETE FROM file_transactions WHERE dest_path = ?1 AND content_hash = ?2",
            params![path_text(rel), SENTINEL_HASH],
        )
        .map_err(|e| Fault::sql(e, what))?;
        tx.execute(
            "INSERT INTO file_transactions (source_path, dest_path, size, timestamp, content_hash, version, backup_set_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                path_text(source),
                path_text(rel),
                size as i64,
                Utc::now().to_rfc3339(),
                SENTINEL_HASH,
                SCHEMA_VERSION,
                backup_set_ref
            ],
        )
        .map_err(|e| Fault::sql(e, what))?;
        let row_id = tx.last_insert_rowid();
        tx.commit().map_err(|e| Fault::sql(e, what))?;
        Ok(row_id)
    }

    /// Copies `source` into `partial`, next to `dest`, and flushes it.
    /// Returns the hex digest of the copied bytes.
    fn stream(&self, source: &Path, dest: &Path, partial: &Path, rel: &Path, size: u64) -> Result<String, Fault> {
        let parent = dest
            .parent()
            .with_context(|| format!("{} has no parent directory", dest.display()))?;
        fs::create_dir_all(parent).map_err(|e| Fault::io(e, || format!("create {}", parent.display())))?;

        let mut input = File::open(source).map_err(|e| Fault::io(e, || format!("open {}", source.display())))?;
        let mut output =
            File::create(partial).map_err(|e| Fault::io(e, || format!("create {}", partial.display())))?;

        let mut budget = self.write_budget(rel)?;
        let mut hasher = IntegrityHasher::new();
        let mut buf = vec![0u8; self.settings.chunk_size.max(1)];
        loop {
            let n = match input.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Fault::io(e, || format!("read {}", source.display()))),
            };
            hasher.update(&buf[..n]);
            if let Some(left) = budget.as_mut() {
                *left = left
                    .checked_sub(n as u64)
                    .ok_or_else(|| Fault::io(io::ErrorKind::StorageFull.into(), String::new))?;
            }
            output
                .write_all(&buf[..n])
                .map_err(|e| Fault::io(e, || format!("write {}", partial.display())))?;
        }
        output
            .sync_all()
            .map_err(|e| Fault::io(e, || format!("flush {}", partial.display())))?;
        drop(output);

        let copied = fs::metadata(partial)
            .map_err(|e| Fault::io(e, || format!("stat {}", partial.display())))?
            .len();
        if copied != size || hasher.bytes() != size {
            return Err(Fault::Fatal(
                VolumeError::SizeMismatch {
                    path: source.to_path_buf(),
                    copied,
                    expected: size,
                }
                .into(),
            ));
        }

        Ok(hasher.finalize())
    }

    /// Bytes still writable under the capacity cap. The file about to be
    /// replaced counts as free.
    fn write_budget(&self, rel: &Path) -> Result<Option<u64>, Fault> {
        let Some(capacity) = self.capacity else {
            return Ok(None);
        };
        let used = self.used_bytes()?;
        let reclaimed = self.latest_verified(rel)?.map(|(_, size)| size).unwrap_or(0);
        Ok(Some((capacity + reclaimed).saturating_sub(used)))
    }

    fn used_bytes(&self) -> Result<u64> {
        let used: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(SUM(size), 0) FROM file_transactions WHERE id IN (
                     SELECT MAX(id) FROM file_transactions WHERE content_hash != ?1 GROUP BY dest_path
                 )",
                [SENTINEL_HASH],
                |row| row.get(0),
            )
            .context("sum stored bytes")?;
        Ok(used as u64)
    }

    /// Phase two: record the digest and drop rows describing bytes this copy
    /// replaced.
    fn seal(&mut self, row_id: i64, rel: &Path, hash: &str) -> Result<FileTransaction, Fault> {
        let what = || format!("seal catalog row {row_id}");
        let tx = self.conn.transaction().map_err(|e| Fault::sql(e, what))?;
        tx.execute(
            "UPDATE file_transactions SET content_hash = ?1 WHERE id = ?2",
            params![hash, row_id],
        )
        .map_err(|e| Fault::sql(e, what))?;
        tx.execute(
            "DELETE FROM file_transactions WHERE dest_path = ?1 AND id != ?2",
            params![path_text(rel), row_id],
        )
        .map_err(|e| Fault::sql(e, what))?;
        tx.commit().map_err(|e| Fault::sql(e, what))?;

        let dest = self.volume.root_path.join(rel);
        self.load_transaction(row_id)
            .map_err(|e| Fault::Fatal(e.context(format!("reload {}", dest.display()))))
    }

    /// Removes the partial file and the sentinel row. When the copy was
    /// already renamed over `rel`, the destination and every row describing
    /// it go too, since the bytes those rows describe are gone. A catalog too
    /// full to delete leaves the rows for [`VolumeStore::init`] to recover.
    fn abandon(&mut self, row_id: i64, rel: &Path, partial: &Path, placed: Option<&Path>) -> Result<()> {
        remove_if_present(partial)?;
        let deleted = match placed {
            Some(dest) => {
                remove_if_present(dest)?;
                self.conn.execute(
                    "DELETE FROM file_transactions WHERE id = ?1 OR dest_path = ?2",
                    params![row_id, path_text(rel)],
                )
            }
            None => self.conn.execute("DELETE FROM file_transactions WHERE id = ?1", [row_id]),
        };
        match deleted {
            Ok(_) => Ok(()),
            Err(e) if is_catalog_full(&e) => {
                warn!(row_id, "catalog full; interrupted row left for recovery");
                Ok(())
            }
            Err(e) => Err(e).context("delete abandoned catalog row"),
        }
    }

    /// Drops sentinel rows and partial files left by an interrupted run.
    ///
    /// A run that died between the rename and the seal left new bytes under
    /// older verified rows. Those rows are dropped along with the file
    /// whenever the newest one no longer matches what is on disk.
    fn recover_in_flight(&mut self) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT dest_path FROM file_transactions WHERE content_hash = ?1")?;
        let stale = stmt
            .query_map([SENTINEL_HASH], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        if stale.is_empty() {
            return Ok(0);
        }

        let mut replaced = Vec::new();
        for rel in &stale {
            let dest = self.volume.root_path.join(rel);
            remove_if_present(&partial_path(&dest))?;
            if !self.matches_latest_verified(Path::new(rel), &dest)? {
                warn!(dest = %dest.display(), "destination no longer matches its catalog rows; discarding");
                remove_if_present(&dest)?;
                replaced.push(rel);
            }
        }

        let tx = self.conn.transaction().context("begin recovery")?;
        for rel in replaced {
            tx.execute("DELETE FROM file_transactions WHERE dest_path = ?1", [rel])
                .context("delete superseded catalog rows")?;
        }
        tx.execute("DELETE FROM file_transactions WHERE content_hash = ?1", [SENTINEL_HASH])
            .context("delete interrupted catalog rows")?;
        tx.commit().context("commit recovery")?;
        Ok(stale.len())
    }

    /// Whether the newest verified row for `rel` still describes `dest`.
    /// True when there is no such row.
    fn matches_latest_verified(&self, rel: &Path, dest: &Path) -> Result<bool> {
        let Some((hash, size)) = self.latest_verified(rel)? else {
            return Ok(true);
        };
        let meta = match fs::metadata(dest) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e).with_context(|| format!("stat destination {}", dest.display())),
        };
        if !meta.is_file() || meta.len() != size {
            return Ok(false);
        }
        Ok(self.hash_file(dest)? == hash)
    }

    fn load_transaction(&self, row_id: i64) -> Result<FileTransaction> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM file_transactions WHERE id = ?1");
        self.conn
            .query_row(&sql, [row_id], row_to_transaction)
            .with_context(|| format!("load catalog row {row_id}"))
    }

    /// Every file transaction on this volume, oldest first.
    pub fn transactions(&self) -> Result<Vec<FileTransaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM file_transactions ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_transaction)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn backup_sets(&self) -> Result<Vec<StagedBackupSet>> {
        let sql = format!("SELECT {BACKUP_SET_COLUMNS} FROM backup_sets ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_backup_set)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn record_summary(&self) -> Result<VolumeSummary> {
        let (files, backup_sets, segments, final_backup_sets): (i64, i64, i64, i64) = self
            .conn
            .query_row(
                "SELECT
                    (SELECT COUNT(*) FROM file_transactions WHERE content_hash != ?1),
                    (SELECT COUNT(DISTINCT uuid) FROM backup_sets),
                    (SELECT COUNT(*) FROM backup_sets),
                    (SELECT COUNT(*) FROM backup_sets WHERE is_final = 1)",
                [SENTINEL_HASH],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .context("summarize catalog")?;
        Ok(VolumeSummary {
            files: files as u64,
            bytes: self.used_bytes()?,
            backup_sets: backup_sets as u64,
            segments: segments as u64,
            final_backup_sets: final_backup_sets as u64,
        })
    }
}

fn open_catalog(path: &Path, max_pages: Option<u64>) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("open catalog {}", path.display()))?;
    conn.execute_batch(PRAGMAS).context("configure catalog")?;
    if let Some(pages) = max_pages {
        let applied: i64 = conn
            .query_row(&format!("PRAGMA max_page_count = {pages}"), [], |row| row.get(0))
            .context("limit catalog size")?;
        debug!(path = %path.display(), pages = applied, "catalog page limit");
    }
    Ok(conn)
}

fn write_identity(conn: &mut Connection, uuid: Uuid, root: &Path) -> Result<()> {
    let tx = conn.transaction().context("begin catalog creation")?;
    tx.execute_batch(CREATE_SCHEMA).context("create catalog schema")?;
    tx.execute(
        "INSERT INTO volume (id, uuid, version, root) VALUES (1, ?1, ?2, ?3)",
        params![uuid.to_string(), SCHEMA_VERSION, path_text(root)],
    )
    .context("record volume identity")?;
    tx.commit().context("commit catalog creation")
}

fn find_catalogs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("scan volume root {}", root.display()))? {
        let entry = entry.with_context(|| format!("scan volume root {}", root.display()))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(CATALOG_PREFIX) && name.ends_with(CATALOG_SUFFIX) && entry.path().is_file() {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    dest.with_file_name(format!(".{name}{PARTIAL_SUFFIX}"))
}

fn place(partial: &Path, dest: &Path) -> Result<(), Fault> {
    fs::rename(partial, dest).map_err(|e| Fault::io(e, || format!("move {} into place", dest.display())))
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<FileTransaction> {
    Ok(FileTransaction {
        id: row.get(0)?,
        source_path: parse_path(row.get(1)?),
        dest_path: parse_path(row.get(2)?),
        size: row.get::<_, i64>(3)? as u64,
        timestamp: parse_ts(4, row.get(4)?)?,
        content_hash: row.get(5)?,
        schema_version: row.get(6)?,
        backup_set_ref: row.get(7)?,
    })
}

fn row_to_backup_set(row: &rusqlite::Row) -> rusqlite::Result<StagedBackupSet> {
    let dirs: String = row.get(2)?;
    Ok(StagedBackupSet {
        row_id: row.get(0)?,
        set: BackupSet {
            uuid: parse_uuid(1, row.get(1)?)?,
            backup_source_dirs: serde_json::from_str(&dirs).map_err(|e| conversion_err(2, e))?,
            created_at: parse_ts(3, row.get(3)?)?,
            host: row.get(4)?,
            schema_version: row.get(5)?,
            sequence_number: row.get(6)?,
            is_final: row.get(7)?,
        },
    })
}
