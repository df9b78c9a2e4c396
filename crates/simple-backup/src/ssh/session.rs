use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh_keys::agent::client::AgentClient;
use russh_keys::key::{KeyPair, PublicKey};
use tokio::net::UnixStream;
use tokio::runtime::Runtime;

use super::credentials::{Authenticator, Credentials, KeyAlgorithm, KeyLoad, resolve_credentials};
use super::host_keys::{HostKeyPolicy, HostKeyStatus, KnownHosts, admit};
use super::prompt::Prompter;
use super::{Secret, ServerConfig};
use crate::error::{Error, Result};
use crate::report::Reporter;
use crate::session::Connector;
use crate::target::{RemoteShell, ShellOutput};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct SeenKey {
    status: HostKeyStatus,
    fingerprint: String,
    // Set when an admitted unknown key could not be written to known_hosts.
    learn_error: Option<String>,
}

// Host key gate: checks the server key against known_hosts and records what it saw.
struct Gate {
    known_hosts: KnownHosts,
    host: String,
    port: u16,
    accept_unknown: bool,
    seen: Arc<Mutex<Option<SeenKey>>>,
}

#[async_trait]
impl client::Handler for Gate {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let status = self
            .known_hosts
            .status(&self.host, self.port, server_public_key);
        let ok = admit(&status, self.accept_unknown);
        let learn_error = if ok && status == HostKeyStatus::Unknown {
            self.known_hosts
                .learn(&self.host, self.port, server_public_key)
                .err()
        } else {
            None
        };
        if let Ok(mut seen) = self.seen.lock() {
            *seen = Some(SeenKey {
                status,
                fingerprint: server_public_key.fingerprint(),
                learn_error,
            });
        }
        Ok(ok)
    }
}

pub struct SshSession {
    runtime: Runtime,
    handle: client::Handle<Gate>,
    user: String,
    host: String,
}

impl SshSession {
    // Connect, verify the host key per policy and authenticate.
    pub fn open(
        server: &ServerConfig,
        prompter: &mut dyn Prompter,
        reporter: &dyn Reporter,
    ) -> Result<(Self, Credentials)> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::io("cannot start ssh runtime", e))?;

        let known_hosts = KnownHosts::new(&server.known_hosts);
        if !known_hosts.path().exists() {
            reporter.warn(&format!(
                "known hosts file {} does not exist",
                known_hosts.path().display()
            ));
        }

        let login = server.login();
        let accept = server.host_key_policy.accepts_unknown_up_front();
        let (handle, seen) = match connect(&runtime, server, &known_hosts, accept) {
            Ok(connected) => connected,
            Err((e, seen)) => {
                let Some(seen) = seen else {
                    return Err(e);
                };
                match seen.status {
                    HostKeyStatus::Changed(line) => {
                        return Err(Error::auth(format!(
                            "host key for {} does not match {} line {line} (fingerprint {})",
                            server.host,
                            known_hosts.path().display(),
                            seen.fingerprint
                        )));
                    }
                    HostKeyStatus::Unknown if server.host_key_policy == HostKeyPolicy::Ask => {
                        let question = format!(
                            "The authenticity of host '{}' can't be established.\nKey fingerprint is {}.\nAdd it to {} and continue connecting?",
                            server.host,
                            seen.fingerprint,
                            known_hosts.path().display()
                        );
                        if !prompter.confirm(&question)? {
                            return Err(Error::auth(format!(
                                "host key for {} not accepted",
                                server.host
                            )));
                        }
                        connect(&runtime, server, &known_hosts, true).map_err(|(e, _)| e)?
                    }
                    HostKeyStatus::Unknown => {
                        return Err(Error::auth(format!(
                            "host {} is not in {} (fingerprint {})",
                            server.host,
                            known_hosts.path().display(),
                            seen.fingerprint
                        )));
                    }
                    HostKeyStatus::Known => return Err(e),
                }
            }
        };
        if let Some(warning) = learn_warning(seen.as_ref(), &server.host, known_hosts.path()) {
            reporter.warn(&warning);
        }

        let mut session = Self {
            runtime,
            handle,
            user: server.user.clone(),
            host: server.host.clone(),
        };
        let credentials = {
            let agent = session.runtime.block_on(AgentClient::connect_env()).ok();
            let mut auth = SessionAuth {
                runtime: &session.runtime,
                handle: &mut session.handle,
                user: &session.user,
                agent,
            };
            resolve_credentials(
                &mut auth,
                server.key_file.as_deref(),
                prompter,
                &login,
                reporter,
            )?
        };
        Ok((session, credentials))
    }
}

type Attempt = std::result::Result<
    (client::Handle<Gate>, Option<SeenKey>),
    (Error, Option<SeenKey>),
>;

// The copy engine's ssh checks the same file strictly, so an unrecorded key fails the transfer.
fn learn_warning(seen: Option<&SeenKey>, host: &str, known_hosts: &Path) -> Option<String> {
    let error = seen?.learn_error.as_deref()?;
    Some(format!(
        "cannot record the host key of {host} in {}: {error}; the copy will be refused by ssh",
        known_hosts.display()
    ))
}

fn connect(runtime: &Runtime, server: &ServerConfig, known_hosts: &KnownHosts, accept_unknown: bool) -> Attempt {
    let seen = Arc::new(Mutex::new(None));
    let gate = Gate {
        known_hosts: known_hosts.clone(),
        host: server.host.clone(),
        port: server.port,
        accept_unknown,
        seen: Arc::clone(&seen),
    };
    let config = Arc::new(client::Config::default());
    let addr = (server.host.clone(), server.port);
    let res = runtime.block_on(async {
        tokio::time::timeout(CONNECT_TIMEOUT, client::connect(config, addr, gate)).await
    });
    let seen = seen.lock().ok().and_then(|s| s.clone());
    match res {
        Ok(Ok(handle)) => Ok((handle, seen)),
        Ok(Err(e)) => Err((
            Error::auth(format!(
                "ssh connection to {}@{} failed: {e}",
                server.user, server.host
            )),
            seen,
        )),
        Err(_) => Err((
            Error::auth(format!(
                "ssh connection to {}@{} timed out",
                server.user, server.host
            )),
            seen,
        )),
    }
}

impl RemoteShell for SshSession {
    fn exec(&self, command: &str) -> Result<ShellOutput> {
        self.runtime.block_on(async {
            let mut channel = self.handle.channel_open_session().await?;
            channel.exec(true, command).await?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut exit_code = None;
            loop {
                match channel.wait().await {
                    Some(russh::ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                    Some(russh::ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                        stderr.extend_from_slice(&data)
                    }
                    Some(russh::ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = i32::try_from(exit_status).ok();
                    }
                    Some(russh::ChannelMsg::Close) | None => break,
                    _ => {}
                }
            }
            Ok::<_, Error>(ShellOutput {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                exit_code,
            })
        })
    }

    fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        let _ = self.runtime.block_on(self.handle.disconnect(
            russh::Disconnect::ByApplication,
            "",
            "en",
        ));
    }
}

struct SessionAuth<'a> {
    runtime: &'a Runtime,
    handle: &'a mut client::Handle<Gate>,
    user: &'a str,
    agent: Option<AgentClient<UnixStream>>,
}

impl Authenticator for SessionAuth<'_> {
    type Identity = PublicKey;
    type Key = KeyPair;

    fn agent_identities(&mut self) -> Result<Vec<PublicKey>> {
        let Some(agent) = self.agent.as_mut() else {
            return Ok(Vec::new());
        };
        self.runtime
            .block_on(agent.request_identities())
            .map_err(|e| Error::msg(format!("agent: {e}")))
    }

    fn describe_identity(&self, identity: &PublicKey) -> String {
        format!("{} {}", identity.name(), identity.fingerprint())
    }

    fn try_agent(&mut self, identity: &PublicKey) -> Result<bool> {
        let Some(agent) = self.agent.take() else {
            return Ok(false);
        };
        let (agent, res) = self.runtime.block_on(self.handle.authenticate_future(
            self.user,
            identity.clone(),
            agent,
        ));
        self.agent = Some(agent);
        // A signing failure inside the agent only disqualifies this identity.
        Ok(res.unwrap_or(false))
    }

    fn load_key(
        &mut self,
        path: &Path,
        algorithm: KeyAlgorithm,
        passphrase: Option<&Secret>,
    ) -> KeyLoad<KeyPair> {
        match russh_keys::load_secret_key(path, passphrase.map(Secret::expose)) {
            Ok(key) if algorithm.matches_name(key.name()) => KeyLoad::Loaded(key),
            Ok(_) => KeyLoad::Mismatch,
            Err(russh_keys::Error::KeyIsEncrypted) => KeyLoad::PassphraseRequired,
            Err(e) => KeyLoad::Failed(e.to_string()),
        }
    }

    fn try_key(&mut self, key: KeyPair) -> Result<bool> {
        Ok(self
            .runtime
            .block_on(self.handle.authenticate_publickey(self.user, Arc::new(key)))?)
    }

    fn try_password(&mut self, password: &Secret) -> Result<bool> {
        Ok(self.runtime.block_on(
            self.handle
                .authenticate_password(self.user, password.expose()),
        )?)
    }
}

// Opens an `SshSession` for the configured server.
#[derive(Debug, Clone)]
pub struct SshConnector {
    server: ServerConfig,
}

impl SshConnector {
    pub fn new(server: ServerConfig) -> Self {
        Self { server }
    }
}

impl Connector for SshConnector {
    type Shell = SshSession;

    fn server(&self) -> &ServerConfig {
        &self.server
    }

    fn connect(
        &mut self,
        prompter: &mut dyn Prompter,
        reporter: &dyn Reporter,
    ) -> Result<(SshSession, Credentials)> {
        reporter.info(&format!(
            "connecting to {}:{}",
            self.server.login(),
            self.server.port
        ));
        SshSession::open(&self.server, prompter, reporter)
    }
}
