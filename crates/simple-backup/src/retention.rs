use crate::error::{Error, ErrorKind, Result};
use crate::report::{Reporter, SessionEvent};
use crate::snapshot::{POINTER_NAME, SnapshotRoot, pointer_target};
use crate::target::ExecTarget;

#[derive(Debug, Default)]
pub struct RetentionReport {
    pub removed: Vec<String>,
    pub failures: Vec<(String, Error)>,
}

impl RetentionReport {
    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }
}

// Keep the newest `keep` snapshots besides `protect`; negative `keep` keeps everything.
// The snapshot `last_backup` references counts toward `keep` but is never removed.
// Per-item failures are recorded and the pass continues.
pub fn apply_retention(
    root: &SnapshotRoot,
    target: &dyn ExecTarget,
    keep: i64,
    protect: Option<&str>,
    reporter: &dyn Reporter,
) -> Result<RetentionReport> {
    let mut report = RetentionReport::default();
    let Ok(keep) = usize::try_from(keep) else {
        return Ok(report);
    };
    if !target.is_dir(root.path())? {
        return Ok(report);
    }

    let mut names = target.list_dir(root.path())?;
    names.retain(|n| n != POINTER_NAME && Some(n.as_str()) != protect);
    names.sort();
    let present = names.len();

    let mut budget = keep;
    if let Some(current) = pointer_target(root, target)
        && names.contains(&current)
    {
        names.retain(|n| *n != current);
        budget = budget.saturating_sub(1);
        reporter.debug(&format!("sparing {current}, referenced by {POINTER_NAME}"));
    }
    if names.len() <= budget {
        reporter.debug(&format!(
            "{present} snapshot(s) present, keeping up to {keep}"
        ));
        return Ok(report);
    }

    let excess = names.len() - budget;
    for name in names.into_iter().take(excess) {
        match target.remove_tree(&root.snapshot(&name)) {
            Ok(()) => {
                reporter.emit(SessionEvent::RetentionRemoved { name: name.clone() });
                report.removed.push(name);
            }
            Err(e) => {
                let error = match e.kind() {
                    ErrorKind::NotFound => format!("not found: {e}"),
                    ErrorKind::PermissionDenied => format!("permission denied: {e}"),
                    _ => e.to_string(),
                };
                reporter.emit(SessionEvent::RetentionFailed {
                    name: name.clone(),
                    error,
                });
                report.failures.push((name, e));
            }
        }
    }
    Ok(report)
}
