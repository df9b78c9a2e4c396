use std::path::PathBuf;
use std::sync::Mutex;

use crate::session::SessionStatus;

pub mod sanitize;

pub use sanitize::{Redactor, sanitize_log_line};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started {
        destination: String,
    },
    InputSkipped {
        path: PathBuf,
    },
    PreviousSnapshot {
        path: Option<PathBuf>,
    },
    PointerStale {
        pointer: PathBuf,
        reason: String,
    },
    SnapshotCreated {
        path: PathBuf,
    },
    RetentionRemoved {
        name: String,
    },
    RetentionFailed {
        name: String,
        error: String,
    },
    CopyStarted {
        link_reference: Option<PathBuf>,
    },
    CopyOutput {
        line: String,
    },
    CopyFinished {
        exit_code: i32,
        elapsed_ms: u128,
    },
    PointerRemoved {
        old: Option<PathBuf>,
    },
    PointerPublished {
        target: PathBuf,
    },
    PointerFailed {
        error: String,
    },
    Note {
        severity: Severity,
        message: String,
    },
    Finished {
        status: SessionStatus,
        elapsed_ms: u128,
    },
}

// Handed to the orchestrator at construction; nothing in the library logs through a global.
pub trait Reporter: Send + Sync {
    fn emit(&self, ev: SessionEvent);

    fn note(&self, severity: Severity, message: &str) {
        self.emit(SessionEvent::Note {
            severity,
            message: message.to_string(),
        });
    }

    fn debug(&self, message: &str) {
        self.note(Severity::Debug, message);
    }

    fn info(&self, message: &str) {
        self.note(Severity::Info, message);
    }

    fn warn(&self, message: &str) {
        self.note(Severity::Warn, message);
    }

    fn error(&self, message: &str) {
        self.note(Severity::Error, message);
    }
}

#[derive(Debug, Default)]
pub struct TracingReporter {
    // Copy engine output goes to info instead of debug.
    pub verbose: bool,
}

impl TracingReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl Reporter for TracingReporter {
    fn emit(&self, ev: SessionEvent) {
        match ev {
            SessionEvent::Started { destination } => {
                tracing::info!(%destination, "starting backup");
            }
            SessionEvent::InputSkipped { path } => {
                tracing::warn!("input {} not found, skipping", path.display());
            }
            SessionEvent::PreviousSnapshot { path: Some(path) } => {
                tracing::info!("previous snapshot: {}", path.display());
            }
            SessionEvent::PreviousSnapshot { path: None } => {
                tracing::info!("no previous backups available");
            }
            SessionEvent::PointerStale { pointer, reason } => {
                tracing::warn!(
                    "ignoring {}: {reason}; continuing without a link reference",
                    pointer.display()
                );
            }
            SessionEvent::SnapshotCreated { path } => {
                tracing::info!("created snapshot directory {}", path.display());
            }
            SessionEvent::RetentionRemoved { name } => {
                tracing::info!("removed old backup {name}");
            }
            SessionEvent::RetentionFailed { name, error } => {
                tracing::error!("error while removing backup {name}: {error}");
            }
            SessionEvent::CopyStarted { link_reference } => match link_reference {
                Some(r) => tracing::info!(
                    "copying files (linking against {}), this may take a long time",
                    r.display()
                ),
                None => tracing::info!("copying files, this may take a long time"),
            },
            SessionEvent::CopyOutput { line } => {
                if self.verbose {
                    tracing::info!(target: "rsync", "{line}");
                } else {
                    tracing::debug!(target: "rsync", "{line}");
                }
            }
            SessionEvent::CopyFinished {
                exit_code,
                elapsed_ms,
            } => {
                tracing::info!(exit_code, elapsed_ms, "copy engine finished");
            }
            SessionEvent::PointerRemoved { old } => match old {
                Some(old) => tracing::debug!("removed last_backup link (was {})", old.display()),
                None => tracing::debug!("removed last_backup link"),
            },
            SessionEvent::PointerPublished { target } => {
                tracing::info!("last_backup now points to {}", target.display());
            }
            SessionEvent::PointerFailed { error } => {
                tracing::error!("failed to update last_backup link: {error}");
            }
            SessionEvent::Note { severity, message } => match severity {
                Severity::Debug => tracing::debug!("{message}"),
                Severity::Info => tracing::info!("{message}"),
                Severity::Warn => tracing::warn!("{message}"),
                Severity::Error => tracing::error!("{message}"),
            },
            SessionEvent::Finished { status, elapsed_ms } => {
                let secs = elapsed_ms as f64 / 1000.0;
                match status {
                    SessionStatus::Completed => tracing::info!("backup completed"),
                    SessionStatus::NothingToDo => {
                        tracing::info!("backup finished, no files copied")
                    }
                    SessionStatus::Degraded => {
                        tracing::error!("some errors occurred while performing the backup")
                    }
                }
                tracing::info!("elapsed time: {secs:.3} seconds");
            }
        }
    }
}

// Keeps every event; used by tests and by callers that want a post-run transcript.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    events: Mutex<Vec<SessionEvent>>,
}

impl MemoryReporter {
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn messages(&self, severity: Severity) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                SessionEvent::Note {
                    severity: s,
                    message,
                } if s == severity => Some(message),
                _ => None,
            })
            .collect()
    }
}

impl Reporter for MemoryReporter {
    fn emit(&self, ev: SessionEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(ev);
        }
    }
}
