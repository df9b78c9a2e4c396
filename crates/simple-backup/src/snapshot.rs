//! Snapshot layout under a backup root and the `last_backup` pointer.
//!
//! ```text
//! <root>/simple_backup/2024-01-03 02:00:00/...
//! <root>/simple_backup/last_backup -> <root>/simple_backup/2024-01-03 02:00:00
//! ```

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::config::PreviousLookup;
use crate::error::{Error, Result};
use crate::report::{Reporter, SessionEvent};
use crate::target::ExecTarget;

pub const SNAPSHOT_DIR: &str = "simple_backup";
pub const POINTER_NAME: &str = "last_backup";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRoot {
    dir: PathBuf,
}

impl SnapshotRoot {
    pub fn new(output_root: &Path) -> Self {
        Self {
            dir: output_root.join(SNAPSHOT_DIR),
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn pointer(&self) -> PathBuf {
        self.dir.join(POINTER_NAME)
    }

    pub fn snapshot(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

// One-second granularity: two sessions in the same second get the same path.
pub fn define_snapshot_path(root: &SnapshotRoot, now: NaiveDateTime) -> PathBuf {
    root.snapshot(&now.format(TIMESTAMP_FORMAT).to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Previous {
    Found(PathBuf),
    None,
    // The pointer exists but cannot be used; the session continues without a link reference.
    Stale { pointer: PathBuf, reason: String },
}

pub fn find_previous_snapshot(
    root: &SnapshotRoot,
    target: &dyn ExecTarget,
    lookup: PreviousLookup,
) -> Previous {
    if lookup == PreviousLookup::Scan {
        return scan_latest(root, target);
    }

    let pointer = root.pointer();
    let link = match target.read_link(&pointer) {
        Ok(link) => link,
        Err(e) => {
            return Previous::Stale {
                pointer,
                reason: format!("cannot read link: {e}"),
            };
        }
    };
    let Some(link) = link else {
        return scan_latest(root, target);
    };

    let referenced = resolve_link(root, &link);
    match target.is_dir(&referenced) {
        Ok(true) => Previous::Found(referenced),
        Ok(false) => Previous::Stale {
            pointer,
            reason: format!("{} does not exist", referenced.display()),
        },
        Err(e) => Previous::Stale {
            pointer,
            reason: format!("cannot check {}: {e}", referenced.display()),
        },
    }
}

// Name of the snapshot the pointer references, when it lives directly under the root.
pub fn pointer_target(root: &SnapshotRoot, target: &dyn ExecTarget) -> Option<String> {
    let link = target.read_link(&root.pointer()).ok()??;
    let referenced = resolve_link(root, &link);
    if referenced.parent() != Some(root.path()) {
        return None;
    }
    referenced
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

fn resolve_link(root: &SnapshotRoot, link: &str) -> PathBuf {
    let p = PathBuf::from(link);
    if p.is_absolute() { p } else { root.path().join(p) }
}

// Lexicographically last subdirectory, pointer excluded.
fn scan_latest(root: &SnapshotRoot, target: &dyn ExecTarget) -> Previous {
    match target.is_dir(root.path()) {
        Ok(true) => {}
        _ => return Previous::None,
    }
    let names = match target.list_dir(root.path()) {
        Ok(names) => names,
        Err(e) => {
            return Previous::Stale {
                pointer: root.path().to_path_buf(),
                reason: format!("cannot list snapshots: {e}"),
            };
        }
    };
    for name in names.iter().rev().filter(|n| n.as_str() != POINTER_NAME) {
        let p = root.snapshot(name);
        if target.is_dir(&p).unwrap_or(false) {
            return Previous::Found(p);
        }
    }
    Previous::None
}

// Remove-then-recreate. The old value is read first so it can be logged.
pub fn publish_latest(
    root: &SnapshotRoot,
    target: &dyn ExecTarget,
    snapshot: &Path,
    reporter: &dyn Reporter,
) -> Result<()> {
    let pointer = root.pointer();
    let old = target.read_link(&pointer)?;
    if let Some(old) = old {
        target.remove_link(&pointer)?;
        reporter.emit(SessionEvent::PointerRemoved {
            old: Some(PathBuf::from(old)),
        });
    } else if target.exists(&pointer)? {
        return Err(Error::msg(format!(
            "{} exists and is not a symbolic link",
            pointer.display()
        )));
    }
    target.create_link(&pointer, snapshot)?;
    reporter.emit(SessionEvent::PointerPublished {
        target: snapshot.to_path_buf(),
    });
    Ok(())
}
