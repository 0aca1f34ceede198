use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use spanbackup_core::map_destination;
use spanbackup_engine::{EngineError, Operator, RunOutcome, SpanningEngine, VolumeChoice, VolumeSpec};
use spanbackup_storage::{CopySettings, RunLog, StagedBackupSet, VolumeStore};
use tempfile::TempDir;

const HOST: &str = "test-host";
const KIB: u64 = 1024;

#[derive(Default)]
struct ScriptedOperator {
    confirm: bool,
    choices: VecDeque<VolumeChoice>,
    volume_prompts: usize,
    host_prompts: usize,
}

impl ScriptedOperator {
    fn stopping() -> Self {
        Self::default()
    }

    fn then(mut self, choice: VolumeChoice) -> Self {
        self.choices.push_back(choice);
        self
    }
}

impl Operator for ScriptedOperator {
    fn confirm_host_mismatch(&mut self, _log_host: &str, _current_host: &str) -> Result<bool> {
        self.host_prompts += 1;
        Ok(self.confirm)
    }

    fn next_volume(&mut self) -> Result<VolumeChoice> {
        self.volume_prompts += 1;
        Ok(self.choices.pop_front().unwrap_or(VolumeChoice::Stop))
    }
}

fn settings() -> CopySettings {
    CopySettings {
        host: HOST.to_owned(),
        chunk_size: 4096,
        verify_existing: true,
    }
}

fn write_source(dir: &Path, name: &str, len: u64) -> PathBuf {
    let path = dir.join(name);
    let bytes: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
    fs::write(&path, bytes).expect("write source");
    path
}

fn paths(files: &[PathBuf]) -> Vec<Result<PathBuf>> {
    files.iter().cloned().map(Ok).collect()
}

fn inspect(root: &Path) -> (Vec<PathBuf>, Vec<StagedBackupSet>) {
    let store = VolumeStore::init(root, true, true).expect("open volume");
    let sources = store
        .transactions()
        .expect("transactions")
        .into_iter()
        .map(|tx| tx.source_path)
        .collect();
    let sets = store.backup_sets().expect("backup sets");
    store.disconnect().expect("disconnect");
    (sources, sets)
}

fn run(
    log: RunLog,
    files: &[PathBuf],
    volumes: Vec<VolumeSpec>,
    operator: &mut ScriptedOperator,
) -> RunOutcome {
    SpanningEngine::new(log, vec![PathBuf::from("/src")], volumes, settings(), operator)
        .run_paths(paths(files))
        .expect("run")
}

struct Fixture {
    src: TempDir,
    logs: TempDir,
    vol_a: TempDir,
    vol_b: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            src: tempfile::tempdir().expect("src"),
            logs: tempfile::tempdir().expect("logs"),
            vol_a: tempfile::tempdir().expect("vol a"),
            vol_b: tempfile::tempdir().expect("vol b"),
        }
    }

    fn new_log(&self) -> RunLog {
        RunLog::create(self.logs.path(), HOST).expect("run log")
    }
}

#[test]
fn second_file_rotates_onto_next_volume() {
    let fx = Fixture::new();
    let small = write_source(fx.src.path(), "small.bin", 10 * KIB);
    let large = write_source(fx.src.path(), "large.bin", 50 * KIB);
    let files = vec![small.clone(), large.clone()];
    let volumes = vec![
        VolumeSpec::new(fx.vol_a.path()).with_capacity(40 * KIB),
        VolumeSpec::new(fx.vol_b.path()).with_capacity(100 * KIB),
    ];

    let mut operator = ScriptedOperator::stopping();
    let outcome = run(fx.new_log(), &files, volumes, &mut operator);
    let RunOutcome::Completed { run_log, summary } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(summary.copied, 2);
    assert_eq!(summary.rotations, 1);
    assert_eq!(operator.volume_prompts, 0);

    let (a_files, a_sets) = inspect(fx.vol_a.path());
    let (b_files, b_sets) = inspect(fx.vol_b.path());
    assert_eq!(a_files, vec![small]);
    assert_eq!(b_files, vec![large.clone()]);
    assert!(!map_destination(&large, HOST, fx.vol_a.path()).unwrap().exists());

    assert_eq!(a_sets.len(), 1);
    assert_eq!(b_sets.len(), 1);
    assert_eq!(a_sets[0].set.uuid, b_sets[0].set.uuid);
    assert_eq!((a_sets[0].set.sequence_number, a_sets[0].set.is_final), (0, false));
    assert_eq!((b_sets[0].set.sequence_number, b_sets[0].set.is_final), (1, true));

    let log = RunLog::load(&run_log).expect("reload log");
    assert_eq!(log.entry_count().unwrap(), 2);
    assert!(log.is_completed());
}

#[test]
fn rerun_with_completed_log_touches_nothing() {
    let fx = Fixture::new();
    let files = vec![
        write_source(fx.src.path(), "small.bin", 10 * KIB),
        write_source(fx.src.path(), "large.bin", 50 * KIB),
    ];
    let volumes = || {
        vec![
            VolumeSpec::new(fx.vol_a.path()).with_capacity(40 * KIB),
            VolumeSpec::new(fx.vol_b.path()).with_capacity(100 * KIB),
        ]
    };
    let RunOutcome::Completed { run_log, .. } = run(fx.new_log(), &files, volumes(), &mut ScriptedOperator::stopping())
    else {
        panic!("first run must complete");
    };
    let before_a = inspect(fx.vol_a.path());
    let before_b = inspect(fx.vol_b.path());

    let full = vec![
        VolumeSpec::new(fx.vol_a.path()).with_capacity(0),
        VolumeSpec::new(fx.vol_b.path()).with_capacity(0),
    ];
    let mut operator = ScriptedOperator::stopping();
    let outcome = run(RunLog::load(&run_log).unwrap(), &files, full, &mut operator);
    let RunOutcome::Completed { summary, .. } = outcome else {
        panic!("rerun must complete, got {outcome:?}");
    };
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.copied + summary.reused, 0);
    assert_eq!(operator.volume_prompts, 0);

    assert_eq!(inspect(fx.vol_a.path()), before_a);
    assert_eq!(inspect(fx.vol_b.path()), before_b);
    assert_eq!(RunLog::load(&run_log).unwrap().entry_count().unwrap(), 2);
}

#[test]
fn stop_suspends_and_resume_continues_lineage() {
    let fx = Fixture::new();
    let files = vec![
        write_source(fx.src.path(), "a.bin", 30),
        write_source(fx.src.path(), "b.bin", 30),
        write_source(fx.src.path(), "c.bin", 30),
    ];

    let mut operator = ScriptedOperator::stopping();
    let outcome = run(
        fx.new_log(),
        &files,
        vec![VolumeSpec::new(fx.vol_a.path()).with_capacity(40)],
        &mut operator,
    );
    let RunOutcome::Suspended { resume_token, summary } = outcome else {
        panic!("expected suspension, got {outcome:?}");
    };
    assert_eq!(summary.copied, 1);
    assert_eq!(operator.volume_prompts, 1);

    let log = RunLog::load(&resume_token).expect("resume token opens");
    assert_eq!(log.entry_count().unwrap(), 1);
    assert!(!log.is_completed());
    for entry in log.entries().unwrap() {
        assert!(!spanbackup_core::is_sentinel(&entry.content_hash));
        let dest = fx.vol_a.path().join(&entry.dest_path);
        assert_eq!(fs::metadata(dest).unwrap().len(), entry.size);
    }

    let outcome = run(
        log,
        &files,
        vec![VolumeSpec::new(fx.vol_b.path())],
        &mut ScriptedOperator::stopping(),
    );
    let RunOutcome::Completed { summary, .. } = outcome else {
        panic!("resume must complete, got {outcome:?}");
    };
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.copied, 2);

    let (a_files, a_sets) = inspect(fx.vol_a.path());
    let (b_files, b_sets) = inspect(fx.vol_b.path());
    assert_eq!(a_files, vec![files[0].clone()]);
    assert_eq!(b_files, vec![files[1].clone(), files[2].clone()]);
    assert_eq!((a_sets[0].set.sequence_number, a_sets[0].set.is_final), (0, false));
    assert_eq!((b_sets[0].set.sequence_number, b_sets[0].set.is_final), (1, true));
    assert_eq!(a_sets[0].set.uuid, b_sets[0].set.uuid);
}

#[test]
fn operator_can_supply_more_volumes() {
    let fx = Fixture::new();
    let files = vec![
        write_source(fx.src.path(), "a.bin", 30),
        write_source(fx.src.path(), "b.bin", 30),
    ];
    let mut operator =
        ScriptedOperator::stopping().then(VolumeChoice::Volume(VolumeSpec::new(fx.vol_b.path())));

    let outcome = run(
        fx.new_log(),
        &files,
        vec![VolumeSpec::new(fx.vol_a.path()).with_capacity(40)],
        &mut operator,
    );
    assert!(matches!(outcome, RunOutcome::Completed { .. }), "{outcome:?}");
    assert_eq!(operator.volume_prompts, 1);
    assert_eq!(inspect(fx.vol_b.path()).0, vec![files[1].clone()]);
}

#[test]
fn lineage_spans_three_volumes_in_order() {
    let fx = Fixture::new();
    let vol_c = tempfile::tempdir().expect("vol c");
    let files: Vec<PathBuf> = ["a", "b", "c"]
        .iter()
        .map(|name| write_source(fx.src.path(), name, 30))
        .collect();
    let volumes = vec![
        VolumeSpec::new(fx.vol_a.path()).with_capacity(40),
        VolumeSpec::new(fx.vol_b.path()).with_capacity(40),
        VolumeSpec::new(vol_c.path()).with_capacity(40),
    ];

    let outcome = run(fx.new_log(), &files, volumes, &mut ScriptedOperator::stopping());
    let RunOutcome::Completed { summary, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(summary.rotations, 2);

    let segments: Vec<StagedBackupSet> = [fx.vol_a.path(), fx.vol_b.path(), vol_c.path()]
        .iter()
        .flat_map(|root| inspect(root).1)
        .collect();
    let sequences: Vec<u32> = segments.iter().map(|s| s.set.sequence_number).collect();
    let finals: Vec<bool> = segments.iter().map(|s| s.set.is_final).collect();
    assert_eq!(sequences, vec![0, 1, 2]);
    assert_eq!(finals, vec![false, false, true]);
    assert!(segments.iter().all(|s| s.set.uuid == segments[0].set.uuid));
}

#[test]
fn declined_host_mismatch_does_no_work() {
    let fx = Fixture::new();
    let files = vec![write_source(fx.src.path(), "a.bin", 30)];
    let log = RunLog::create(fx.logs.path(), "other-host").expect("run log");

    let mut operator = ScriptedOperator::stopping();
    let outcome = run(log, &files, vec![VolumeSpec::new(fx.vol_a.path())], &mut operator);
    assert!(matches!(outcome, RunOutcome::Declined { .. }), "{outcome:?}");
    assert_eq!(operator.host_prompts, 1);
    assert_eq!(fs::read_dir(fx.vol_a.path()).unwrap().count(), 0);
}

#[test]
fn confirmed_host_mismatch_proceeds() {
    let fx = Fixture::new();
    let files = vec![write_source(fx.src.path(), "a.bin", 30)];
    let log = RunLog::create(fx.logs.path(), "other-host").expect("run log");

    let mut operator = ScriptedOperator {
        confirm: true,
        ..ScriptedOperator::default()
    };
    let outcome = run(log, &files, vec![VolumeSpec::new(fx.vol_a.path())], &mut operator);
    assert!(matches!(outcome, RunOutcome::Completed { .. }), "{outcome:?}");
    assert_eq!(inspect(fx.vol_a.path()).0, files);
}

#[test]
fn walking_sources_backs_up_the_tree() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.src.path().join("nested/deeper")).unwrap();
    write_source(fx.src.path(), "top.txt", 5);
    write_source(&fx.src.path().join("nested/deeper"), "leaf.txt", 7);

    let engine = SpanningEngine::new(
        fx.new_log(),
        vec![fx.src.path().to_path_buf()],
        vec![VolumeSpec::new(fx.vol_a.path())],
        settings(),
        ScriptedOperator::stopping(),
    );
    let outcome = engine.run().expect("run");
    let RunOutcome::Completed { summary, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(summary.copied, 2);

    let canonical = fs::canonicalize(fx.src.path()).unwrap();
    let leaf = canonical.join("nested/deeper/leaf.txt");
    let dest = map_destination(&leaf, HOST, fx.vol_a.path()).unwrap();
    assert_eq!(fs::read(dest).unwrap(), fs::read(&leaf).unwrap());
}

#[test]
fn empty_run_finalizes_first_segment() {
    let fx = Fixture::new();
    let outcome = run(
        fx.new_log(),
        &[],
        vec![VolumeSpec::new(fx.vol_a.path())],
        &mut ScriptedOperator::stopping(),
    );
    assert!(matches!(outcome, RunOutcome::Completed { .. }), "{outcome:?}");
    let (_, sets) = inspect(fx.vol_a.path());
    assert_eq!(sets.len(), 1);
    assert_eq!((sets[0].set.sequence_number, sets[0].set.is_final), (0, true));
}

#[test]
fn completed_log_refuses_new_files() {
    let fx = Fixture::new();
    let first = vec![write_source(fx.src.path(), "a.bin", 30)];
    let RunOutcome::Completed { run_log, .. } = run(
        fx.new_log(),
        &first,
        vec![VolumeSpec::new(fx.vol_a.path())],
        &mut ScriptedOperator::stopping(),
    ) else {
        panic!("first run must complete");
    };

    let mut more = first.clone();
    more.push(write_source(fx.src.path(), "b.bin", 30));
    let err = SpanningEngine::new(
        RunLog::load(&run_log).unwrap(),
        vec![PathBuf::from("/src")],
        vec![VolumeSpec::new(fx.vol_a.path())],
        settings(),
        ScriptedOperator::stopping(),
    )
    .run_paths(paths(&more))
    .unwrap_err();
    assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::RunCompleted { .. })));
    assert!(err.to_string().contains("start a new run"), "{err}");
}

#[test]
fn present_files_are_reused_in_a_new_run() {
    let fx = Fixture::new();
    let files = vec![write_source(fx.src.path(), "a.bin", 300)];
    let volumes = || vec![VolumeSpec::new(fx.vol_a.path())];
    run(fx.new_log(), &files, volumes(), &mut ScriptedOperator::stopping());

    let outcome = run(fx.new_log(), &files, volumes(), &mut ScriptedOperator::stopping());
    let RunOutcome::Completed { summary, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!((summary.copied, summary.reused), (0, 1));

    let (sources, sets) = inspect(fx.vol_a.path());
    assert_eq!(sources.len(), 2);
    assert_eq!(sets.len(), 2);
    assert_ne!(sets[0].set.uuid, sets[1].set.uuid);
}

#[test]
fn volume_without_room_for_a_catalog_is_skipped() {
    let fx = Fixture::new();
    let files = vec![write_source(fx.src.path(), "a.bin", 30)];
    let volumes = vec![
        VolumeSpec::new(fx.vol_a.path()).with_catalog_pages(1),
        VolumeSpec::new(fx.vol_b.path()),
    ];

    let mut operator = ScriptedOperator::stopping();
    let outcome = run(fx.new_log(), &files, volumes, &mut operator);
    assert!(matches!(outcome, RunOutcome::Completed { .. }), "{outcome:?}");
    assert_eq!(operator.volume_prompts, 0);

    assert_eq!(fs::read_dir(fx.vol_a.path()).unwrap().count(), 0);
    let (b_files, b_sets) = inspect(fx.vol_b.path());
    assert_eq!(b_files, files);
    assert_eq!((b_sets[0].set.sequence_number, b_sets[0].set.is_final), (0, true));
}
