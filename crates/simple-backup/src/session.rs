//! One backup session: previous snapshot lookup, snapshot creation, the copy,
//! pointer publication and retention, against a local or remote target.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::config::{BackupPlan, PointerPolicy};
use crate::copy_engine::{
    CopyEngine, CopyRequest, RemoteTransport, TransferSummary, describe_exit_code,
    exit_code_is_warning,
};
use crate::error::{Error, ErrorKind, Result};
use crate::report::{Reporter, SessionEvent};
use crate::retention::{RetentionReport, apply_retention};
use crate::snapshot::{Previous, SnapshotRoot, define_snapshot_path, find_previous_snapshot, publish_latest};
use crate::ssh::{Credentials, Prompter, ServerConfig};
use crate::target::{ExecTarget, LocalTarget, RemoteShell, RemoteTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Completed,
    NothingToDo,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueKind {
    InputMissing,
    PointerStale,
    CopyEngineFailure,
    SnapshotMissing,
    PointerPublishFailure,
    RetentionFailure,
}

impl IssueKind {
    // Missing inputs and a stale pointer are reported but do not degrade the session.
    pub fn degrades(self) -> bool {
        !matches!(self, IssueKind::InputMissing | IssueKind::PointerStale)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    pub snapshot: Option<PathBuf>,
    pub previous: Option<PathBuf>,
    pub copy_exit_code: Option<i32>,
    pub transfer: Option<TransferSummary>,
    pub pointer_published: bool,
    pub removed: Vec<String>,
    pub issues: Vec<Issue>,
    pub elapsed_ms: u128,
}

impl SessionOutcome {
    fn new() -> Self {
        Self {
            status: SessionStatus::Completed,
            snapshot: None,
            previous: None,
            copy_exit_code: None,
            transfer: None,
            pointer_published: false,
            removed: Vec::new(),
            issues: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn has_issue(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }

    // 4 when the copy did not produce a complete snapshot; other degradations exit 0.
    pub fn exit_code(&self) -> i32 {
        if self.has_issue(IssueKind::CopyEngineFailure) || self.has_issue(IssueKind::SnapshotMissing) {
            4
        } else {
            0
        }
    }

    fn push(&mut self, kind: IssueKind, message: impl Into<String>) {
        self.issues.push(Issue {
            kind,
            message: message.into(),
        });
    }

    fn absorb_retention(&mut self, report: RetentionReport) {
        for (name, e) in report.failures {
            self.push(IssueKind::RetentionFailure, format!("{name}: {e}"));
        }
        self.removed.extend(report.removed);
    }
}

// Opens the remote shell and reports which credential worked.
pub trait Connector {
    type Shell: RemoteShell;

    fn server(&self) -> &ServerConfig;

    fn connect(
        &mut self,
        prompter: &mut dyn Prompter,
        reporter: &dyn Reporter,
    ) -> Result<(Self::Shell, Credentials)>;
}

type Clock = Box<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub struct Orchestrator {
    plan: BackupPlan,
    reporter: Arc<dyn Reporter>,
    clock: Clock,
}

impl Orchestrator {
    pub fn new(plan: BackupPlan, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            plan,
            reporter,
            clock: Box::new(|| chrono::Local::now().naive_local()),
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn run_local(&self, engine: &mut dyn CopyEngine) -> Result<SessionOutcome> {
        self.run_on(&LocalTarget, None, engine)
    }

    pub fn run_remote<C: Connector>(
        &self,
        connector: &mut C,
        prompter: &mut dyn Prompter,
        engine: &mut dyn CopyEngine,
    ) -> Result<SessionOutcome> {
        let (shell, credentials) = connector.connect(prompter, self.reporter.as_ref())?;
        let transport = RemoteTransport::new(connector.server(), &credentials);
        let target = RemoteTarget::new(shell);
        self.run_on(&target, Some(&transport), engine)
    }

    pub fn run_on(
        &self,
        target: &dyn ExecTarget,
        transport: Option<&RemoteTransport>,
        engine: &mut dyn CopyEngine,
    ) -> Result<SessionOutcome> {
        let started = Instant::now();
        let reporter = self.reporter.as_ref();
        let plan = &self.plan;
        let mut outcome = SessionOutcome::new();

        let output = self.output_root(target)?;
        self.check_output(target, &output)?;
        reporter.emit(SessionEvent::Started {
            destination: target.copy_destination(&output),
        });

        let root = SnapshotRoot::new(&output);
        let mut link_reference = match find_previous_snapshot(&root, target, plan.previous_lookup) {
            Previous::Found(p) => Some(p),
            Previous::None => None,
            Previous::Stale { pointer, reason } => {
                outcome.push(
                    IssueKind::PointerStale,
                    format!("{}: {reason}", pointer.display()),
                );
                reporter.emit(SessionEvent::PointerStale { pointer, reason });
                None
            }
        };
        reporter.emit(SessionEvent::PreviousSnapshot {
            path: link_reference.clone(),
        });

        let inputs = self.existing_inputs(&mut outcome);
        if inputs.is_empty() {
            reporter.info("no existing files or directories specified for backup, nothing to do");
            return Ok(self.finish(outcome, SessionStatus::NothingToDo, started));
        }

        target.create_dir_all(root.path())?;
        let snapshot = define_snapshot_path(&root, (self.clock)());
        target.create_dir(&snapshot)?;
        reporter.emit(SessionEvent::SnapshotCreated {
            path: snapshot.clone(),
        });
        outcome.snapshot = Some(snapshot.clone());
        let snapshot_name = snapshot
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());

        if plan.keep >= 0 && plan.remove_before {
            self.retention(&root, target, snapshot_name.as_deref(), &mut outcome);
            if let Some(r) = &link_reference
                && !target.is_dir(r).unwrap_or(false)
            {
                reporter.warn(&format!(
                    "link reference {} was removed by retention, copying without it",
                    r.display()
                ));
                link_reference = None;
            }
        }
        outcome.previous = link_reference.clone();

        reporter.emit(SessionEvent::CopyStarted {
            link_reference: link_reference.clone(),
        });
        let copy_started = Instant::now();
        let request = CopyRequest {
            sources: &inputs,
            excludes: &plan.exclude,
            destination: target.copy_destination(&snapshot),
            link_reference: link_reference.as_deref(),
            transport,
        };
        let copied = match engine.copy(&request, reporter) {
            Ok(result) => {
                reporter.emit(SessionEvent::CopyFinished {
                    exit_code: result.exit_code,
                    elapsed_ms: copy_started.elapsed().as_millis(),
                });
                outcome.copy_exit_code = Some(result.exit_code);
                if result.exit_code != 0 {
                    let msg = describe_exit_code(result.exit_code);
                    if exit_code_is_warning(result.exit_code) {
                        reporter.warn(&msg);
                    } else {
                        reporter.error(&msg);
                    }
                    outcome.push(IssueKind::CopyEngineFailure, msg);
                }
                if let Some(s) = &result.summary {
                    reporter.info(&format!(
                        "sent {} bytes, received {} bytes ({} bytes/sec)",
                        s.sent_bytes, s.received_bytes, s.rate
                    ));
                    if !s.total_size.is_empty() {
                        reporter.info(&format!(
                            "total size is {}, speedup is {}",
                            s.total_size, s.speedup
                        ));
                    }
                }
                let advance = match plan.pointer_policy {
                    PointerPolicy::OnSuccess => result.acceptable(),
                    PointerPolicy::Always => true,
                };
                outcome.transfer = result.summary;
                Some(advance)
            }
            Err(e) => {
                reporter.error(&format!("copy engine failed: {e}"));
                outcome.push(IssueKind::CopyEngineFailure, e.to_string());
                None
            }
        };

        let snapshot_present = target.is_dir(&snapshot).unwrap_or(false);
        if !snapshot_present {
            let msg = format!("snapshot {} is missing after the copy", snapshot.display());
            reporter.error(&msg);
            outcome.push(IssueKind::SnapshotMissing, msg);
        }

        match copied {
            Some(true) if snapshot_present => {
                match publish_latest(&root, target, &snapshot, reporter) {
                    Ok(()) => outcome.pointer_published = true,
                    Err(e) => {
                        reporter.emit(SessionEvent::PointerFailed {
                            error: e.to_string(),
                        });
                        outcome.push(IssueKind::PointerPublishFailure, e.to_string());
                    }
                }
            }
            _ => reporter.warn("last_backup not updated, it still references the previous snapshot"),
        }

        if plan.keep >= 0 && !plan.remove_before {
            self.retention(&root, target, snapshot_name.as_deref(), &mut outcome);
        }

        let status = if outcome.issues.iter().any(|i| i.kind.degrades()) {
            SessionStatus::Degraded
        } else {
            SessionStatus::Completed
        };
        Ok(self.finish(outcome, status, started))
    }

    // Snapshot paths, the link reference and the pointer are all written as absolute
    // paths on the target, so a remote output must already be absolute there.
    fn output_root(&self, target: &dyn ExecTarget) -> Result<PathBuf> {
        let output = &self.plan.output;
        if !target.is_remote() {
            return Ok(absolute(output));
        }
        if output.is_relative() {
            return Err(Error::output_invalid(format!(
                "output path {} on {} must be absolute",
                output.display(),
                target.describe()
            )));
        }
        Ok(output.clone())
    }

    fn check_output(&self, target: &dyn ExecTarget, output: &Path) -> Result<()> {
        match target.is_dir(output) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::output_invalid(format!(
                "output path {} does not exist on {}",
                output.display(),
                target.describe()
            ))),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(e),
            Err(e) => Err(Error::output_invalid(format!(
                "cannot access output path {}: {e}",
                output.display()
            ))),
        }
    }

    // Inputs are always read from the local machine.
    fn existing_inputs(&self, outcome: &mut SessionOutcome) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for input in &self.plan.inputs {
            let path = absolute(input);
            if path.exists() {
                out.push(path);
            } else {
                self.reporter.emit(SessionEvent::InputSkipped { path: path.clone() });
                outcome.push(
                    IssueKind::InputMissing,
                    format!("input {} not found", path.display()),
                );
            }
        }
        out.sort();
        out.dedup();
        out
    }

    fn retention(
        &self,
        root: &SnapshotRoot,
        target: &dyn ExecTarget,
        protect: Option<&str>,
        outcome: &mut SessionOutcome,
    ) {
        match apply_retention(root, target, self.plan.keep, protect, self.reporter.as_ref()) {
            Ok(report) => outcome.absorb_retention(report),
            Err(e) => {
                self.reporter
                    .error(&format!("cannot apply retention: {e}"));
                outcome.push(IssueKind::RetentionFailure, e.to_string());
            }
        }
    }

    fn finish(&self, mut outcome: SessionOutcome, status: SessionStatus, started: Instant) -> SessionOutcome {
        outcome.status = status;
        outcome.elapsed_ms = started.elapsed().as_millis();
        self.reporter.emit(SessionEvent::Finished {
            status,
            elapsed_ms: outcome.elapsed_ms,
        });
        outcome
    }
}

fn absolute(p: &Path) -> PathBuf {
    std::path::absolute(p).unwrap_or_else(|_| p.to_path_buf())
}
