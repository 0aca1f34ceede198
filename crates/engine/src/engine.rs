use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use spanbackup_core::BackupSet;
use spanbackup_storage::{
    is_out_of_space, CopySettings, Outcome, RunLog, StagedBackupSet, VolumeStore,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::operator::{Operator, VolumeChoice, VolumeSpec};
use crate::walk::source_files;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("run log {run_log} is already completed and does not cover {path}; start a new run instead of resuming this log")]
    RunCompleted { run_log: PathBuf, path: PathBuf },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub copied: u64,
    pub reused: u64,
    /// Files skipped because the run log already had them.
    pub skipped: u64,
    pub bytes_copied: u64,
    pub rotations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every source file is logged and the last backup set is final.
    Completed { run_log: PathBuf, summary: RunSummary },
    /// The operator stopped with files left. Resume with `resume_token`.
    Suspended { resume_token: PathBuf, summary: RunSummary },
    /// The operator refused to continue a run started on another host.
    Declined { run_log: PathBuf },
}

struct ActiveVolume {
    store: VolumeStore,
    backup_set: StagedBackupSet,
}

/// Walks the sources and spreads them over a queue of volumes, rotating to
/// the next one whenever the current volume runs out of space.
///
/// At most one volume catalog is open at a time; rotation disconnects the
/// old one before the next is opened.
pub struct SpanningEngine<O> {
    run_log: RunLog,
    source_dirs: Vec<PathBuf>,
    queue: VecDeque<VolumeSpec>,
    operator: O,
    settings: CopySettings,
    /// Newest segment of the lineage; only meaningful as a staged row once
    /// `lineage_staged` is set.
    lineage: BackupSet,
    lineage_staged: bool,
    active: Option<ActiveVolume>,
    summary: RunSummary,
}

impl<O: Operator> SpanningEngine<O> {
    /// A run over `source_dirs` using `volumes` in order. A run log that
    /// already tracks a backup set resumes that lineage.
    pub fn new(
        run_log: RunLog,
        source_dirs: Vec<PathBuf>,
        volumes: impl IntoIterator<Item = VolumeSpec>,
        settings: CopySettings,
        operator: O,
    ) -> Self {
        let (lineage, lineage_staged) = match run_log.current_backup_set() {
            Some(set) => (set.clone(), true),
            None => (BackupSet::start(source_dirs.iter().cloned(), &settings.host, Utc::now()), false),
        };
        Self {
            run_log,
            source_dirs,
            queue: volumes.into_iter().collect(),
            operator,
            settings,
            lineage,
            lineage_staged,
            active: None,
            summary: RunSummary::default(),
        }
    }

    /// Backs up every regular file under the source dirs.
    pub fn run(self) -> Result<RunOutcome> {
        let roots = self.source_dirs.clone();
        self.run_paths(source_files(&roots))
    }

    /// Backs up `paths`, which must be absolute, in the order given.
    pub fn run_paths<I>(mut self, paths: I) -> Result<RunOutcome>
    where
        I: IntoIterator<Item = Result<PathBuf>>,
    {
        if self.run_log.host() != self.settings.host
            && !self
                .operator
                .confirm_host_mismatch(self.run_log.host(), &self.settings.host)?
        {
            info!(log_host = self.run_log.host(), host = %self.settings.host, "run declined on host mismatch");
            let run_log = self.run_log.path().to_path_buf();
            self.run_log.close()?;
            return Ok(RunOutcome::Declined { run_log });
        }

        for path in paths {
            let path = path?;
            if self.run_log.has_entry(&path)? {
                debug!(source = %path.display(), "already logged");
                self.summary.skipped += 1;
                continue;
            }
            if self.run_log.is_completed() {
                return Err(EngineError::RunCompleted {
                    run_log: self.run_log.path().to_path_buf(),
                    path,
                }
                .into());
            }
            if !self.store_file(&path)? {
                return self.suspend();
            }
        }
        self.finish()
    }

    /// Retries `path` on successive volumes until it is stored. Returns false
    /// when the operator stops the run instead.
    fn store_file(&mut self, path: &Path) -> Result<bool> {
        loop {
            if !self.ensure_volume()? {
                return Ok(false);
            }
            let Some(active) = self.active.as_mut() else {
                continue;
            };
            match active.store.backup_file(path, &active.backup_set)? {
                Outcome::Stored(copy) => {
                    self.run_log.append(&copy.transaction, active.store.volume())?;
                    if copy.reused {
                        self.summary.reused += 1;
                    } else {
                        self.summary.copied += 1;
                        self.summary.bytes_copied += copy.transaction.size;
                    }
                    return Ok(true);
                }
                Outcome::OutOfSpace => self.rotate()?,
            }
        }
    }

    /// Makes sure a volume is open, taking the next queued one or asking the
    /// operator. Returns false when the operator says stop.
    fn ensure_volume(&mut self) -> Result<bool> {
        while self.active.is_none() {
            let spec = match self.queue.pop_front() {
                Some(spec) => spec,
                None => match self.operator.next_volume()? {
                    VolumeChoice::Volume(spec) => spec,
                    VolumeChoice::Stop => return Ok(false),
                },
            };
            self.open_volume(spec)?;
        }
        Ok(true)
    }

    fn open_volume(&mut self, spec: VolumeSpec) -> Result<()> {
        let mut store = match VolumeStore::init_with_page_limit(&spec.path, true, false, spec.catalog_pages) {
            Ok(store) => store
                .with_settings(self.settings.clone())
                .with_capacity(spec.capacity),
            Err(err) if is_out_of_space(&err) => {
                warn!(volume = %spec, error = %err, "no room for a catalog; skipping volume");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match self.stage(&mut store)? {
            Outcome::Stored(backup_set) => {
                info!(
                    volume = %store.volume().uuid,
                    root = %store.volume().root_path.display(),
                    backup_set = %backup_set.set.uuid,
                    sequence = backup_set.set.sequence_number,
                    "current volume"
                );
                self.active = Some(ActiveVolume { store, backup_set });
            }
            Outcome::OutOfSpace => {
                warn!(volume = %store.volume().uuid, "no room for the backup set; skipping volume");
                store.disconnect()?;
            }
        }
        Ok(())
    }

    /// Finds or writes the lineage's segment on `store`. A lineage that is
    /// already staged elsewhere continues with the next sequence number.
    fn stage(&mut self, store: &mut VolumeStore) -> Result<Outcome<StagedBackupSet>> {
        let candidate = if self.lineage_staged {
            if let Some(existing) = store.find_backup_set(self.lineage.uuid, self.lineage.sequence_number)? {
                debug!(backup_set = %existing.set.uuid, sequence = existing.set.sequence_number, "rejoining segment");
                return Ok(Outcome::Stored(existing));
            }
            BackupSet::spawn_next(&self.lineage)
        } else {
            self.lineage.clone()
        };

        // A crash between staging and logging leaves the row without a log
        // record; pick it up instead of writing a duplicate.
        let outcome = match store.find_backup_set(candidate.uuid, candidate.sequence_number)? {
            Some(existing) => Outcome::Stored(existing),
            None => store.stage_backup_set(&candidate)?,
        };
        if let Outcome::Stored(staged) = &outcome {
            self.run_log.set_backup_set(&staged.set)?;
            self.lineage = staged.set.clone();
            self.lineage_staged = true;
        }
        Ok(outcome)
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(active) = self.active.take() {
            let uuid = active.store.volume().uuid;
            active.store.disconnect()?;
            self.summary.rotations += 1;
            info!(volume = %uuid, "volume full; rotating");
        }
        Ok(())
    }

    fn suspend(mut self) -> Result<RunOutcome> {
        if let Some(active) = self.active.take() {
            active.store.disconnect()?;
        }
        let resume_token = self.run_log.path().to_path_buf();
        self.run_log.close()?;
        warn!(
            resume = %resume_token.display(),
            copied = self.summary.copied,
            "no volumes left; run suspended"
        );
        Ok(RunOutcome::Suspended {
            resume_token,
            summary: self.summary,
        })
    }

    fn finish(mut self) -> Result<RunOutcome> {
        if !self.run_log.is_completed() {
            if !self.ensure_volume()? {
                return self.suspend();
            }
            if let Some(active) = self.active.as_mut() {
                active.store.mark_final(&mut active.backup_set)?;
                self.run_log.set_backup_set(&active.backup_set.set)?;
            }
            self.run_log.mark_completed()?;
        }
        if let Some(active) = self.active.take() {
            active.store.disconnect()?;
        }

        let run_log = self.run_log.path().to_path_buf();
        self.run_log.close()?;
        info!(
            copied = self.summary.copied,
            reused = self.summary.reused,
            skipped = self.summary.skipped,
            bytes = self.summary.bytes_copied,
            rotations = self.summary.rotations,
            "backup complete"
        );
        Ok(RunOutcome::Completed {
            run_log,
            summary: self.summary,
        })
    }
}
