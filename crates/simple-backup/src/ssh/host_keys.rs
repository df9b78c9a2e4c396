use std::path::{Path, PathBuf};

use russh_keys::key::PublicKey;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    // Unknown hosts are refused; they must already be in known_hosts.
    #[default]
    Reject,
    // Ask on the terminal, then record the key.
    Ask,
    // Record unknown keys without asking.
    AcceptNew,
}

impl HostKeyPolicy {
    pub fn accepts_unknown_up_front(self) -> bool {
        matches!(self, HostKeyPolicy::AcceptNew)
    }

    // Value for the copy engine's own ssh `StrictHostKeyChecking`. After an
    // interactive acceptance the key is already recorded, so `yes` holds.
    pub fn strict_host_key_checking(self) -> &'static str {
        match self {
            HostKeyPolicy::Reject | HostKeyPolicy::Ask => "yes",
            HostKeyPolicy::AcceptNew => "accept-new",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    Known,
    Unknown,
    // The host is recorded with a different key (known_hosts line number).
    Changed(usize),
}

// A changed key is refused regardless of policy.
pub fn admit(status: &HostKeyStatus, accept_unknown: bool) -> bool {
    match status {
        HostKeyStatus::Known => true,
        HostKeyStatus::Unknown => accept_unknown,
        HostKeyStatus::Changed(_) => false,
    }
}

#[derive(Debug, Clone)]
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyStatus {
        match russh_keys::check_known_hosts_path(host, port, key, &self.path) {
            Ok(true) => HostKeyStatus::Known,
            Ok(false) => HostKeyStatus::Unknown,
            Err(russh_keys::Error::KeyChanged { line }) => HostKeyStatus::Changed(line),
            // Unreadable file: nothing is trusted.
            Err(_) => HostKeyStatus::Unknown,
        }
    }

    pub fn learn(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), String> {
        russh_keys::learn_known_hosts_path(host, port, key, &self.path).map_err(|e| e.to_string())
    }
}
