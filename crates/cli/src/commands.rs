use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use spanbackup_core::Volume;
use spanbackup_engine::{EngineError, Operator, RunOutcome, RunSummary, SpanningEngine, VolumeSpec};
use spanbackup_storage::{RunLog, VolumeStore, VolumeSummary};
use tracing::info;

use crate::config::Settings;

pub fn init(dir: &Path, reuse: bool, out: &mut impl Write) -> Result<Volume> {
    std::fs::create_dir_all(dir).with_context(|| format!("create volume directory {dir:?}"))?;
    let store = VolumeStore::init(dir, reuse, false)?;
    let volume = store.volume().clone();
    writeln!(out, "volume {} ready at {}", volume.uuid, store.catalog_path().display())?;
    store.disconnect()?;
    Ok(volume)
}

/// Runs the backup and tells the operator how to resume if it stops early.
/// `config` is the file the settings came from, repeated in the resume
/// command.
pub fn backup<O: Operator>(
    settings: &Settings,
    config: Option<&Path>,
    sources: &[PathBuf],
    volumes: Vec<VolumeSpec>,
    resume: Option<&Path>,
    operator: O,
    out: &mut impl Write,
) -> Result<RunOutcome> {
    let run_log = match resume {
        Some(path) => RunLog::load(path)?,
        None => {
            std::fs::create_dir_all(&settings.log_dir)
                .with_context(|| format!("create log directory {:?}", settings.log_dir))?;
            let log = RunLog::create(&settings.log_dir, &settings.host)?;
            writeln!(out, "run log: {}", log.path().display())?;
            log
        }
    };

    let sources = sources
        .iter()
        .map(|dir| std::path::absolute(dir).with_context(|| format!("resolve source {dir:?}")))
        .collect::<Result<Vec<_>>>()?;

    info!(run_log = %run_log.path().display(), sources = sources.len(), volumes = volumes.len(), "starting backup");
    let engine = SpanningEngine::new(run_log, sources.clone(), volumes, settings.copy_settings(), operator);
    let outcome = engine.run().map_err(|err| {
        if err.downcast_ref::<EngineError>().is_some() {
            err.context("this run log is finished; back up again without --resume-using")
        } else {
            err
        }
    })?;

    match &outcome {
        RunOutcome::Completed { run_log, summary } => {
            write_summary(out, summary)?;
            writeln!(out, "backup complete; run log {}", run_log.display())?;
        }
        RunOutcome::Suspended { resume_token, summary } => {
            write_summary(out, summary)?;
            writeln!(out, "out of storage. Attach more volumes and resume with:")?;
            writeln!(out, "  {}", resume_command(config, resume_token, &sources))?;
        }
        RunOutcome::Declined { run_log } => {
            writeln!(out, "declined; run log {} left untouched", run_log.display())?;
        }
    }
    Ok(outcome)
}

/// The command line that resumes a suspended run. Only the new volumes are
/// left for the operator to fill in.
pub fn resume_command(config: Option<&Path>, run_log: &Path, sources: &[PathBuf]) -> String {
    let mut words = vec!["spanbackup".to_owned()];
    if let Some(config) = config {
        words.push("--config".to_owned());
        words.push(shell_quote(&config.to_string_lossy()));
    }
    words.push("backup".to_owned());
    words.push("--resume-using".to_owned());
    words.push(shell_quote(&run_log.to_string_lossy()));
    for dir in sources {
        words.push("-b".to_owned());
        words.push(shell_quote(&dir.to_string_lossy()));
    }
    words.push("-s".to_owned());
    words.push("<VOL[:SIZE]>".to_owned());
    words.join(" ")
}

fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:,=@%".contains(c));
    if plain {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn write_summary(out: &mut impl Write, summary: &RunSummary) -> Result<()> {
    writeln!(
        out,
        "copied {} files ({}), reused {}, skipped {}, {} volume rotations",
        summary.copied,
        human_size(summary.bytes_copied),
        summary.reused,
        summary.skipped,
        summary.rotations
    )?;
    Ok(())
}

pub fn transactions(dir: &Path, json: bool, out: &mut impl Write) -> Result<()> {
    let store = VolumeStore::init(dir, true, true)?;
    let transactions = store.transactions()?;
    if json {
        write_json(out, &transactions)?;
    } else {
        for tx in &transactions {
            writeln!(
                out,
                "{:>6}  {}  {:>10}  {}  {} -> {}",
                tx.id,
                tx.timestamp.to_rfc3339(),
                tx.size,
                short_hash(&tx.content_hash),
                tx.source_path.display(),
                tx.dest_path.display()
            )?;
        }
    }
    store.disconnect()
}

#[derive(Serialize)]
struct SummaryReport {
    volume: Volume,
    #[serde(flatten)]
    totals: VolumeSummary,
}

pub fn summary(dir: &Path, json: bool, out: &mut impl Write) -> Result<()> {
    let store = VolumeStore::init(dir, true, true)?;
    let report = SummaryReport {
        volume: store.volume().clone(),
        totals: store.record_summary()?,
    };
    store.disconnect()?;

    if json {
        return write_json(out, &report);
    }
    writeln!(out, "volume      {}", report.volume.uuid)?;
    writeln!(out, "root        {}", report.volume.root_path.display())?;
    writeln!(out, "files       {}", report.totals.files)?;
    writeln!(out, "bytes       {} ({})", report.totals.bytes, human_size(report.totals.bytes))?;
    writeln!(
        out,
        "backup sets {} ({} segments, {} final)",
        report.totals.backup_sets, report.totals.segments, report.totals.final_backup_sets
    )?;
    Ok(())
}

#[derive(Serialize)]
struct LogReport {
    uuid: String,
    host: String,
    created_at: String,
    completed: bool,
    backup_set: Option<String>,
    sequence_number: Option<u32>,
    entries: Vec<spanbackup_core::RunLogEntry>,
}

pub fn log(path: &Path, json: bool, out: &mut impl Write) -> Result<()> {
    let run_log = RunLog::load(path)?;
    let report = LogReport {
        uuid: run_log.uuid().to_string(),
        host: run_log.host().to_owned(),
        created_at: run_log.created_at().to_rfc3339(),
        completed: run_log.is_completed(),
        backup_set: run_log.current_backup_set_uuid().map(|uuid| uuid.to_string()),
        sequence_number: run_log.current_backup_set().map(|set| set.sequence_number),
        entries: run_log.entries()?,
    };
    run_log.close()?;

    if json {
        return write_json(out, &report);
    }
    writeln!(out, "run log     {}", report.uuid)?;
    writeln!(out, "host        {}", report.host)?;
    writeln!(out, "created     {}", report.created_at)?;
    writeln!(out, "completed   {}", if report.completed { "yes" } else { "no" })?;
    if let (Some(set), Some(seq)) = (&report.backup_set, report.sequence_number) {
        writeln!(out, "backup set  {set} (segment {seq})")?;
    }
    for entry in &report.entries {
        writeln!(
            out,
            "{}  {:>10}  {}  {} -> {}",
            entry.volume_uuid,
            entry.size,
            short_hash(&entry.content_hash),
            entry.source_path.display(),
            entry.dest_path.display()
        )?;
    }
    Ok(())
}

fn write_json<T: Serialize>(out: &mut impl Write, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
