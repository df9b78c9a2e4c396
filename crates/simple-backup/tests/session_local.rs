use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};

use simple_backup::config::{BackupPlan, PointerPolicy, PreviousLookup, RsyncOptions};
use simple_backup::copy_engine::{CopyEngine, CopyRequest, CopyResult};
use simple_backup::report::{MemoryReporter, Reporter, SessionEvent};
use simple_backup::session::IssueKind;
use simple_backup::snapshot::POINTER_NAME;
use simple_backup::target::{CommandOutput, ExecTarget, LocalTarget};
use simple_backup::{Error, Orchestrator, Result, SessionStatus};

#[derive(Default)]
struct FakeEngine {
    exit_code: i32,
    calls: Vec<(Vec<PathBuf>, String, Option<PathBuf>)>,
}

impl CopyEngine for FakeEngine {
    fn copy(&mut self, request: &CopyRequest<'_>, _reporter: &dyn Reporter) -> Result<CopyResult> {
        self.calls.push((
            request.sources.to_vec(),
            request.destination.clone(),
            request.link_reference.map(Path::to_path_buf),
        ));
        Ok(CopyResult {
            exit_code: self.exit_code,
            ..Default::default()
        })
    }
}

fn at(day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, day)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("valid time")
}

fn name(day: u32) -> String {
    format!("2024-01-{day:02} 00:00:00")
}

struct Fixture {
    _tmp: tempfile::TempDir,
    input: PathBuf,
    output: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let input = tmp.path().join("src/docs");
        fs::create_dir_all(&input).expect("mkdir input");
        fs::write(input.join("a.txt"), b"a").expect("write input");
        let output = tmp.path().join("out");
        fs::create_dir_all(&output).expect("mkdir output");
        Self {
            _tmp: tmp,
            input,
            output,
        }
    }

    fn root(&self) -> PathBuf {
        self.output.join("simple_backup")
    }

    fn seed(&self, days: &[u32]) {
        for d in days {
            fs::create_dir_all(self.root().join(name(*d))).expect("seed snapshot");
        }
    }

    fn point_to(&self, snapshot: &str) {
        std::os::unix::fs::symlink(self.root().join(snapshot), self.root().join(POINTER_NAME))
            .expect("pointer");
    }

    fn pointer(&self) -> PathBuf {
        fs::read_link(self.root().join(POINTER_NAME)).expect("read pointer")
    }

    fn entries(&self) -> Vec<String> {
        let mut v: Vec<String> = fs::read_dir(self.root())
            .expect("list root")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        v.sort();
        v
    }

    fn plan(&self, keep: i64) -> BackupPlan {
        BackupPlan {
            inputs: vec![self.input.clone()],
            output: self.output.clone(),
            exclude: vec!["*.tmp".into()],
            keep,
            remove_before: false,
            rsync: RsyncOptions::default(),
            pointer_policy: PointerPolicy::OnSuccess,
            previous_lookup: PreviousLookup::Pointer,
            server: None,
        }
    }
}

fn orchestrator(plan: BackupPlan, day: u32) -> (Orchestrator, Arc<MemoryReporter>) {
    let reporter = Arc::new(MemoryReporter::default());
    let o = Orchestrator::new(plan, reporter.clone()).with_clock(move || at(day));
    (o, reporter)
}

#[test]
fn keep_one_leaves_previous_and_new_snapshot() {
    let fx = Fixture::new();
    fx.seed(&[1, 2, 3]);
    fx.point_to(&name(3));

    let (o, _r) = orchestrator(fx.plan(1), 4);
    let mut engine = FakeEngine::default();
    let outcome = o.run_local(&mut engine).expect("session");

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(fx.entries(), vec![name(3), name(4), POINTER_NAME.to_string()]);
    assert_eq!(fx.pointer(), fx.root().join(name(4)));
    assert_eq!(outcome.removed, vec![name(1), name(2)]);

    let (sources, destination, link) = &engine.calls[0];
    assert_eq!(sources, &vec![fx.input.clone()]);
    assert_eq!(
        destination.as_str(),
        fx.root().join(name(4)).to_str().expect("utf-8 path")
    );
    assert_eq!(link.as_deref(), Some(fx.root().join(name(3)).as_path()));
}

#[test]
fn first_run_has_no_link_reference() {
    let fx = Fixture::new();
    let (o, r) = orchestrator(fx.plan(-1), 1);
    let mut engine = FakeEngine::default();
    let outcome = o.run_local(&mut engine).expect("session");

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(engine.calls[0].2, None);
    assert_eq!(fx.pointer(), fx.root().join(name(1)));
    assert!(r.events().contains(&SessionEvent::PreviousSnapshot { path: None }));
}

#[test]
fn dangling_pointer_is_ignored_and_replaced() {
    let fx = Fixture::new();
    fx.seed(&[1]);
    fx.point_to("2023-12-31 00:00:00");

    let (o, _r) = orchestrator(fx.plan(-1), 2);
    let mut engine = FakeEngine::default();
    let outcome = o.run_local(&mut engine).expect("session");

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert!(outcome.has_issue(IssueKind::PointerStale));
    assert_eq!(engine.calls[0].2, None);
    assert_eq!(fx.pointer(), fx.root().join(name(2)));
}

#[test]
fn no_existing_inputs_is_nothing_to_do() {
    let fx = Fixture::new();
    let mut plan = fx.plan(1);
    plan.inputs = vec![fx.input.join("missing"), PathBuf::from("/definitely/not/here")];

    let (o, _r) = orchestrator(plan, 1);
    let mut engine = FakeEngine::default();
    let outcome = o.run_local(&mut engine).expect("session");

    assert_eq!(outcome.status, SessionStatus::NothingToDo);
    assert_eq!(outcome.exit_code(), 0);
    assert!(engine.calls.is_empty());
    assert!(!fx.root().exists());
    assert_eq!(
        outcome
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::InputMissing)
            .count(),
        2
    );
}

#[test]
fn retention_before_copy_spares_new_snapshot_and_drops_removed_reference() {
    let fx = Fixture::new();
    fx.seed(&[1, 2]);
    fx.point_to(&name(1));
    let mut plan = fx.plan(0);
    plan.remove_before = true;
    plan.previous_lookup = PreviousLookup::Scan;

    let (o, _r) = orchestrator(plan, 3);
    let mut engine = FakeEngine::default();
    let outcome = o.run_local(&mut engine).expect("session");

    // Scan picked 02 as the link reference; the pre-copy pass removed it.
    assert_eq!(engine.calls[0].2, None);
    assert_eq!(outcome.previous, None);
    assert_eq!(outcome.removed, vec![name(2)]);
    assert_eq!(
        fx.entries(),
        vec![name(1), name(3), POINTER_NAME.to_string()]
    );
    assert_eq!(fx.pointer(), fx.root().join(name(3)));
}

#[test]
fn repeated_failures_never_prune_the_pointer_target() {
    let fx = Fixture::new();
    fx.seed(&[1]);
    fx.point_to(&name(1));

    for day in [2, 3, 4] {
        let (o, _r) = orchestrator(fx.plan(1), day);
        let mut engine = FakeEngine {
            exit_code: 12,
            ..Default::default()
        };
        let outcome = o.run_local(&mut engine).expect("session");
        assert_eq!(outcome.exit_code(), 4);
        assert!(!outcome.pointer_published);
        assert_eq!(
            engine.calls[0].2.as_deref(),
            Some(fx.root().join(name(1)).as_path())
        );
    }

    assert_eq!(fx.pointer(), fx.root().join(name(1)));
    assert!(fx.root().join(name(1)).is_dir());
    assert_eq!(
        fx.entries(),
        vec![name(1), name(4), POINTER_NAME.to_string()]
    );
}

// Local filesystem whose snapshot removals are refused.
struct RefusingRemoval;

impl ExecTarget for RefusingRemoval {
    fn describe(&self) -> String {
        LocalTarget.describe()
    }
    fn exists(&self, path: &Path) -> Result<bool> {
        LocalTarget.exists(path)
    }
    fn is_dir(&self, path: &Path) -> Result<bool> {
        LocalTarget.is_dir(path)
    }
    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        LocalTarget.list_dir(path)
    }
    fn read_link(&self, path: &Path) -> Result<Option<String>> {
        LocalTarget.read_link(path)
    }
    fn remove_link(&self, path: &Path) -> Result<()> {
        LocalTarget.remove_link(path)
    }
    fn create_link(&self, path: &Path, target: &Path) -> Result<()> {
        LocalTarget.create_link(path, target)
    }
    fn create_dir(&self, path: &Path) -> Result<()> {
        LocalTarget.create_dir(path)
    }
    fn create_dir_all(&self, path: &Path) -> Result<()> {
        LocalTarget.create_dir_all(path)
    }
    fn remove_tree(&self, path: &Path) -> Result<()> {
        Err(Error::permission_denied(format!(
            "cannot remove {}: Permission denied",
            path.display()
        )))
    }
    fn run_command(&self, argv: &[String]) -> Result<CommandOutput> {
        LocalTarget.run_command(argv)
    }
    fn copy_destination(&self, path: &Path) -> String {
        LocalTarget.copy_destination(path)
    }
}

#[test]
fn retention_failure_degrades_but_exits_zero() {
    let fx = Fixture::new();
    fx.seed(&[1, 2]);
    let (o, _r) = orchestrator(fx.plan(0), 3);
    let outcome = o
        .run_on(&RefusingRemoval, None, &mut FakeEngine::default())
        .expect("session");

    assert_eq!(outcome.status, SessionStatus::Degraded);
    assert_eq!(outcome.exit_code(), 0);
    assert!(outcome.pointer_published);
    assert!(outcome.removed.is_empty());
    assert_eq!(
        outcome
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::RetentionFailure)
            .count(),
        2
    );
    assert_eq!(
        fx.entries(),
        vec![name(1), name(2), name(3), POINTER_NAME.to_string()]
    );
}

#[test]
fn pointer_publish_failure_degrades_but_exits_zero() {
    let fx = Fixture::new();
    fx.seed(&[1]);
    fs::create_dir_all(fx.root()).expect("mkdir root");
    fs::write(fx.root().join(POINTER_NAME), b"not a link").expect("write");

    let (o, _r) = orchestrator(fx.plan(-1), 2);
    let mut engine = FakeEngine::default();
    let outcome = o.run_local(&mut engine).expect("session");

    assert_eq!(outcome.status, SessionStatus::Degraded);
    assert_eq!(outcome.exit_code(), 0);
    assert!(!outcome.pointer_published);
    assert!(outcome.has_issue(IssueKind::PointerPublishFailure));
    assert_eq!(
        engine.calls[0].2.as_deref(),
        Some(fx.root().join(name(1)).as_path())
    );
    assert_eq!(
        fs::read(fx.root().join(POINTER_NAME)).expect("read"),
        b"not a link"
    );
}

#[test]
fn retention_after_copy_never_counts_new_snapshot() {
    let fx = Fixture::new();
    fx.seed(&[1, 2]);
    let (o, _r) = orchestrator(fx.plan(0), 3);
    let outcome = o.run_local(&mut FakeEngine::default()).expect("session");

    assert_eq!(outcome.removed, vec![name(1), name(2)]);
    assert_eq!(fx.entries(), vec![name(3), POINTER_NAME.to_string()]);
}

#[test]
fn failed_copy_keeps_pointer_on_previous_snapshot() {
    let fx = Fixture::new();
    fx.seed(&[1]);
    fx.point_to(&name(1));

    let (o, r) = orchestrator(fx.plan(-1), 2);
    let mut engine = FakeEngine {
        exit_code: 23,
        ..Default::default()
    };
    let outcome = o.run_local(&mut engine).expect("session");

    assert_eq!(outcome.status, SessionStatus::Degraded);
    assert_eq!(outcome.exit_code(), 4);
    assert!(!outcome.pointer_published);
    assert_eq!(fx.pointer(), fx.root().join(name(1)));
    assert!(fx.root().join(name(2)).is_dir());
    assert!(
        r.messages(simple_backup::report::Severity::Warn)
            .iter()
            .any(|m| m.contains("return code 23"))
    );
}

#[test]
fn vanished_files_still_advance_pointer() {
    let fx = Fixture::new();
    let (o, _r) = orchestrator(fx.plan(-1), 1);
    let mut engine = FakeEngine {
        exit_code: 24,
        ..Default::default()
    };
    let outcome = o.run_local(&mut engine).expect("session");

    assert_eq!(outcome.exit_code(), 4);
    assert!(outcome.pointer_published);
    assert_eq!(fx.pointer(), fx.root().join(name(1)));
}

#[test]
fn always_policy_advances_pointer_after_failure() {
    let fx = Fixture::new();
    fx.seed(&[1]);
    fx.point_to(&name(1));
    let mut plan = fx.plan(-1);
    plan.pointer_policy = PointerPolicy::Always;

    let (o, _r) = orchestrator(plan, 2);
    let mut engine = FakeEngine {
        exit_code: 12,
        ..Default::default()
    };
    let outcome = o.run_local(&mut engine).expect("session");

    assert_eq!(outcome.exit_code(), 4);
    assert_eq!(fx.pointer(), fx.root().join(name(2)));
}

#[test]
fn missing_output_is_output_invalid() {
    let fx = Fixture::new();
    let mut plan = fx.plan(-1);
    plan.output = fx.output.join("nope");

    let (o, _r) = orchestrator(plan, 1);
    let err = o.run_local(&mut FakeEngine::default()).unwrap_err();
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn same_second_collision_fails_loudly() {
    let fx = Fixture::new();
    fx.seed(&[1]);
    let (o, _r) = orchestrator(fx.plan(-1), 1);
    let err = o.run_local(&mut FakeEngine::default()).unwrap_err();
    assert!(err.to_string().contains("cannot create"), "{err}");
}
