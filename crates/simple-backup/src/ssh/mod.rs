//! Remote session establishment.
//!
//! `credentials` holds the authentication fallback chain, independent of any
//! SSH library; `session` drives it over a real connection.

use std::fmt;
use std::path::PathBuf;

pub mod credentials;
pub mod host_keys;
pub mod prompt;
pub mod session;

pub use credentials::{Authenticator, Credentials, KeyAlgorithm, KeyLoad, resolve_credentials};
pub use host_keys::{HostKeyPolicy, HostKeyStatus, KnownHosts};
pub use prompt::{NonInteractive, Prompter, TerminalPrompter};
pub use session::{SshConnector, SshSession};

// A password or passphrase. Never printed; the buffer is zeroed on drop.
pub struct Secret(String);

impl Secret {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Clone for Secret {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        wipe(std::mem::take(&mut self.0));
    }
}

pub(crate) fn wipe(s: String) {
    let mut bytes = s.into_bytes();
    bytes.iter_mut().for_each(|b| *b = 0);
    std::hint::black_box(&bytes);
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key_file: Option<PathBuf>,
    pub known_hosts: PathBuf,
    pub host_key_policy: HostKeyPolicy,
    pub remote_sudo: bool,
}

impl ServerConfig {
    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_never_show_in_debug_output() {
        let s = Secret::new("hunter2".into());
        assert_eq!(format!("{s:?}"), "Secret(***)");
        assert_eq!(s.expose(), "hunter2");
    }
}
