use std::fmt;
use std::path::{Path, PathBuf};

use super::Secret;
use super::prompt::Prompter;
use crate::error::{Error, Result};
use crate::report::Reporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Ed25519,
    Ecdsa,
    Dss,
}

impl KeyAlgorithm {
    // Loader strategies, tried in this order against the configured key file.
    pub const ORDER: [KeyAlgorithm; 4] = [
        KeyAlgorithm::Rsa,
        KeyAlgorithm::Ed25519,
        KeyAlgorithm::Ecdsa,
        KeyAlgorithm::Dss,
    ];

    // Match an SSH algorithm name ("rsa-sha2-512", "ecdsa-sha2-nistp256", ...).
    pub fn matches_name(self, name: &str) -> bool {
        match self {
            KeyAlgorithm::Rsa => name == "ssh-rsa" || name.starts_with("rsa-"),
            KeyAlgorithm::Ed25519 => name == "ssh-ed25519",
            KeyAlgorithm::Ecdsa => name.starts_with("ecdsa-"),
            KeyAlgorithm::Dss => name == "ssh-dss",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyAlgorithm::Rsa => "RSA",
            KeyAlgorithm::Ed25519 => "Ed25519",
            KeyAlgorithm::Ecdsa => "ECDSA",
            KeyAlgorithm::Dss => "DSS",
        })
    }
}

#[derive(Debug)]
pub enum KeyLoad<K> {
    Loaded(K),
    PassphraseRequired,
    // The file holds a key of another algorithm.
    Mismatch,
    Failed(String),
}

// Which method authenticated the session. Lives only as long as the session.
#[derive(Debug, Clone)]
pub enum Credentials {
    Agent,
    KeyFile {
        path: PathBuf,
        algorithm: KeyAlgorithm,
        passphrase: Option<Secret>,
    },
    Password(Secret),
}

impl Credentials {
    pub fn describe(&self) -> String {
        match self {
            Credentials::Agent => "agent identity".into(),
            Credentials::KeyFile {
                path, algorithm, ..
            } => format!("{algorithm} key {}", path.display()),
            Credentials::Password(_) => "password".into(),
        }
    }

    // Secret the copy engine's transport must be fed, if any.
    pub fn transport_secret(&self) -> Option<&Secret> {
        match self {
            Credentials::Agent => None,
            Credentials::KeyFile { passphrase, .. } => passphrase.as_ref(),
            Credentials::Password(p) => Some(p),
        }
    }
}

// One connected-but-unauthenticated session. Ok(false) means the server
// refused that credential; Err is a transport failure and ends the chain.
pub trait Authenticator {
    type Identity;
    type Key;

    fn agent_identities(&mut self) -> Result<Vec<Self::Identity>>;

    fn describe_identity(&self, identity: &Self::Identity) -> String;

    fn try_agent(&mut self, identity: &Self::Identity) -> Result<bool>;

    fn load_key(
        &mut self,
        path: &Path,
        algorithm: KeyAlgorithm,
        passphrase: Option<&Secret>,
    ) -> KeyLoad<Self::Key>;

    fn try_key(&mut self, key: Self::Key) -> Result<bool>;

    fn try_password(&mut self, password: &Secret) -> Result<bool>;
}

// Agent identities, then the key file, then a password prompt.
pub fn resolve_credentials<A: Authenticator>(
    auth: &mut A,
    key_file: Option<&Path>,
    prompter: &mut dyn Prompter,
    login: &str,
    reporter: &dyn Reporter,
) -> Result<Credentials> {
    let fatal = |e: Error| Error::auth(format!("ssh connection to {login} failed: {e}"));

    let identities = match auth.agent_identities() {
        Ok(ids) => ids,
        Err(e) => {
            reporter.debug(&format!("ssh agent unavailable: {e}"));
            Vec::new()
        }
    };
    for id in &identities {
        let label = auth.describe_identity(id);
        if auth.try_agent(id).map_err(fatal)? {
            reporter.info(&format!("authenticated to {login} with agent identity {label}"));
            return Ok(Credentials::Agent);
        }
        reporter.debug(&format!("agent identity {label} rejected by {login}"));
    }

    if let Some(path) = key_file {
        if let Some(creds) = try_key_file(auth, path, prompter, login, reporter)? {
            return Ok(creds);
        }
        reporter.warn(&format!(
            "key file {} did not authenticate {login}, falling back to password",
            path.display()
        ));
    }

    let Some(password) = prompter.secret(&format!("{login}'s password: "))? else {
        return Err(Error::auth(format!(
            "cannot authenticate to {login}: no agent identity or key accepted and no password available"
        )));
    };
    if auth.try_password(&password).map_err(fatal)? {
        reporter.info(&format!("authenticated to {login} with password"));
        return Ok(Credentials::Password(password));
    }
    Err(Error::auth(format!(
        "ssh connection to {login} failed: password rejected"
    )))
}

fn try_key_file<A: Authenticator>(
    auth: &mut A,
    path: &Path,
    prompter: &mut dyn Prompter,
    login: &str,
    reporter: &dyn Reporter,
) -> Result<Option<Credentials>> {
    // Asked for at most once, then reused for the remaining algorithms.
    let mut passphrase: Option<Secret> = None;
    let mut asked = false;

    for algorithm in KeyAlgorithm::ORDER {
        let mut load = auth.load_key(path, algorithm, passphrase.as_ref());
        if matches!(load, KeyLoad::PassphraseRequired) && !asked {
            asked = true;
            passphrase = prompter.secret(&format!(
                "Enter passphrase for key '{}': ",
                path.display()
            ))?;
            if passphrase.is_some() {
                load = auth.load_key(path, algorithm, passphrase.as_ref());
            }
        }
        match load {
            KeyLoad::Loaded(key) => {
                reporter.debug(&format!("loaded {algorithm} key {}", path.display()));
                let ok = auth
                    .try_key(key)
                    .map_err(|e| Error::auth(format!("ssh connection to {login} failed: {e}")))?;
                if !ok {
                    return Ok(None);
                }
                reporter.info(&format!(
                    "authenticated to {login} with {algorithm} key {}",
                    path.display()
                ));
                return Ok(Some(Credentials::KeyFile {
                    path: path.to_path_buf(),
                    algorithm,
                    passphrase,
                }));
            }
            KeyLoad::PassphraseRequired => {
                reporter.debug(&format!(
                    "{algorithm}: key {} needs a passphrase",
                    path.display()
                ));
            }
            KeyLoad::Mismatch => {}
            KeyLoad::Failed(e) => {
                reporter.debug(&format!("{algorithm}: cannot load {}: {e}", path.display()));
            }
        }
    }
    reporter.warn(&format!("cannot load key file {}", path.display()));
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::MemoryReporter;
    use crate::ssh::prompt::NonInteractive;

    #[derive(Default)]
    struct Script {
        identities: Vec<&'static str>,
        accepted_identity: Option<&'static str>,
        key_algorithm: Option<KeyAlgorithm>,
        key_passphrase: Option<&'static str>,
        accept_key: bool,
        accept_password: Option<&'static str>,
        calls: Vec<String>,
    }

    impl Authenticator for Script {
        type Identity = &'static str;
        type Key = KeyAlgorithm;

        fn agent_identities(&mut self) -> Result<Vec<&'static str>> {
            Ok(self.identities.clone())
        }

        fn describe_identity(&self, identity: &&'static str) -> String {
            identity.to_string()
        }

        fn try_agent(&mut self, identity: &&'static str) -> Result<bool> {
            self.calls.push(format!("agent:{identity}"));
            Ok(self.accepted_identity == Some(*identity))
        }

        fn load_key(
            &mut self,
            _path: &Path,
            algorithm: KeyAlgorithm,
            passphrase: Option<&Secret>,
        ) -> KeyLoad<KeyAlgorithm> {
            self.calls.push(format!(
                "load:{algorithm}:{}",
                passphrase.map(Secret::expose).unwrap_or("-")
            ));
            if self.key_algorithm != Some(algorithm) {
                return KeyLoad::Mismatch;
            }
            match (self.key_passphrase, passphrase) {
                (None, _) => KeyLoad::Loaded(algorithm),
                (Some(_), None) => KeyLoad::PassphraseRequired,
                (Some(want), Some(got)) if got.expose() == want => KeyLoad::Loaded(algorithm),
                (Some(_), Some(_)) => KeyLoad::Failed("bad passphrase".into()),
            }
        }

        fn try_key(&mut self, key: KeyAlgorithm) -> Result<bool> {
            self.calls.push(format!("key:{key}"));
            Ok(self.accept_key)
        }

        fn try_password(&mut self, password: &Secret) -> Result<bool> {
            self.calls.push("password".into());
            Ok(self.accept_password == Some(password.expose()))
        }
    }

    struct Answers(Vec<&'static str>, usize);

    impl Prompter for Answers {
        fn secret(&mut self, _prompt: &str) -> Result<Option<Secret>> {
            self.1 += 1;
            Ok(self.0.pop().map(|s| Secret::new(s.to_string())))
        }

        fn confirm(&mut self, _q: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn first_accepted_agent_identity_wins() {
        let mut s = Script {
            identities: vec!["id-a", "id-b", "id-c"],
            accepted_identity: Some("id-b"),
            ..Default::default()
        };
        let r = MemoryReporter::default();
        let creds = resolve_credentials(&mut s, None, &mut NonInteractive, "u@h", &r)
            .expect("agent auth");
        assert!(matches!(creds, Credentials::Agent));
        assert_eq!(s.calls, vec!["agent:id-a", "agent:id-b"]);
    }

    #[test]
    fn encrypted_key_prompts_once_and_reuses_passphrase() {
        let mut s = Script {
            key_algorithm: Some(KeyAlgorithm::Ecdsa),
            key_passphrase: Some("open"),
            accept_key: true,
            ..Default::default()
        };
        let mut prompter = Answers(vec!["open"], 0);
        let r = MemoryReporter::default();
        let creds = resolve_credentials(
            &mut s,
            Some(Path::new("/home/u/.ssh/id")),
            &mut prompter,
            "u@h",
            &r,
        )
        .expect("key auth");

        match creds {
            Credentials::KeyFile {
                algorithm,
                passphrase,
                ..
            } => {
                assert_eq!(algorithm, KeyAlgorithm::Ecdsa);
                assert_eq!(passphrase.expect("passphrase").expose(), "open");
            }
            other => panic!("unexpected credentials: {other:?}"),
        }
        assert_eq!(prompter.1, 1);
        assert_eq!(
            s.calls,
            vec![
                "load:RSA:-",
                "load:Ed25519:-",
                "load:ECDSA:-",
                "load:ECDSA:open",
                "key:ECDSA"
            ]
        );
    }

    #[test]
    fn rejected_key_falls_back_to_password() {
        let mut s = Script {
            key_algorithm: Some(KeyAlgorithm::Rsa),
            accept_key: false,
            accept_password: Some("pw"),
            ..Default::default()
        };
        let mut prompter = Answers(vec!["pw"], 0);
        let r = MemoryReporter::default();
        let creds = resolve_credentials(
            &mut s,
            Some(Path::new("/k")),
            &mut prompter,
            "u@h",
            &r,
        )
        .expect("password auth");
        assert!(matches!(creds, Credentials::Password(_)));
        assert_eq!(s.calls, vec!["load:RSA:-", "key:RSA", "password"]);
    }

    #[test]
    fn nothing_available_non_interactive_is_auth_failure() {
        let mut s = Script::default();
        let r = MemoryReporter::default();
        let err = resolve_credentials(&mut s, None, &mut NonInteractive, "u@h", &r).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Auth);
        assert_eq!(err.exit_code(), 5);
        assert!(s.calls.is_empty());
    }

    #[test]
    fn algorithm_names_map_to_loaders() {
        assert!(KeyAlgorithm::Rsa.matches_name("rsa-sha2-512"));
        assert!(KeyAlgorithm::Rsa.matches_name("ssh-rsa"));
        assert!(KeyAlgorithm::Ed25519.matches_name("ssh-ed25519"));
        assert!(KeyAlgorithm::Ecdsa.matches_name("ecdsa-sha2-nistp384"));
        assert!(!KeyAlgorithm::Ecdsa.matches_name("ssh-ed25519"));
        assert!(KeyAlgorithm::Dss.matches_name("ssh-dss"));
    }
}
