//! The external copy engine: rsync run as a child process.

use std::env;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::config::RsyncOptions;
use crate::error::{Error, Result};
use crate::report::{Redactor, Reporter, SessionEvent, sanitize_log_line};
use crate::ssh::{Credentials, Secret, ServerConfig};

// How the child reaches the remote side: the `-e` command and its secret.
#[derive(Debug, Clone)]
pub struct RemoteTransport {
    pub user: String,
    pub port: u16,
    pub key_file: Option<PathBuf>,
    pub known_hosts: PathBuf,
    pub strict_host_key_checking: &'static str,
    pub remote_sudo: bool,
    pub secret: Option<Secret>,
    // sshpass must answer a key passphrase prompt instead of a password prompt.
    pub secret_is_passphrase: bool,
}

impl RemoteTransport {
    pub fn new(server: &ServerConfig, credentials: &Credentials) -> Self {
        let key_file = match credentials {
            Credentials::KeyFile { path, .. } => Some(path.clone()),
            _ => server.key_file.clone(),
        };
        Self {
            user: server.user.clone(),
            port: server.port,
            key_file,
            known_hosts: server.known_hosts.clone(),
            strict_host_key_checking: server.host_key_policy.strict_host_key_checking(),
            remote_sudo: server.remote_sudo,
            secret: credentials.transport_secret().cloned(),
            secret_is_passphrase: matches!(credentials, Credentials::KeyFile { .. }),
        }
    }

    // The `-e` value; sshpass wraps ssh only when there is a secret to feed.
    pub fn shell_command(&self, sshpass: Option<&Path>) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let (Some(sshpass), Some(_)) = (sshpass, &self.secret) {
            parts.push(transport_quote(&sshpass.to_string_lossy()));
            if self.secret_is_passphrase {
                parts.push("-P".into());
                parts.push("passphrase".into());
            }
            parts.push("-e".into());
        }
        parts.push("ssh".into());
        parts.push("-p".into());
        parts.push(self.port.to_string());
        if let Some(key) = &self.key_file {
            parts.push("-i".into());
            parts.push(transport_quote(&key.to_string_lossy()));
        }
        parts.push("-l".into());
        parts.push(transport_quote(&self.user));
        parts.push("-o".into());
        parts.push(transport_quote(&format!(
            "UserKnownHostsFile={}",
            self.known_hosts.display()
        )));
        parts.push("-o".into());
        parts.push(format!(
            "StrictHostKeyChecking={}",
            self.strict_host_key_checking
        ));
        parts.join(" ")
    }
}

// rsync splits `-e` on spaces and honours quotes but not backslashes.
fn transport_quote(s: &str) -> String {
    if !s.is_empty() && !s.contains([' ', '\'', '"']) {
        s.to_string()
    } else if !s.contains('\'') {
        format!("'{s}'")
    } else {
        format!("\"{s}\"")
    }
}

pub struct CopyRequest<'a> {
    pub sources: &'a [PathBuf],
    pub excludes: &'a [String],
    pub destination: String,
    pub link_reference: Option<&'a Path>,
    pub transport: Option<&'a RemoteTransport>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferSummary {
    pub sent_bytes: String,
    pub received_bytes: String,
    pub rate: String,
    pub total_size: String,
    pub speedup: String,
}

#[derive(Debug, Clone, Default)]
pub struct CopyResult {
    // -1 when the child was killed by a signal.
    pub exit_code: i32,
    // Sanitized and redacted.
    pub output: String,
    pub summary: Option<TransferSummary>,
}

impl CopyResult {
    // 24: some source files vanished during the transfer.
    pub fn acceptable(&self) -> bool {
        matches!(self.exit_code, 0 | 24)
    }
}

pub trait CopyEngine {
    // Err only when the engine could not be started; a non-zero exit is a result.
    fn copy(&mut self, request: &CopyRequest<'_>, reporter: &dyn Reporter) -> Result<CopyResult>;
}

#[derive(Debug, Clone, Default)]
pub struct Rsync {
    options: RsyncOptions,
}

impl Rsync {
    pub fn new(options: RsyncOptions) -> Self {
        Self { options }
    }

    fn program(&self) -> PathBuf {
        self.options
            .binary
            .clone()
            .unwrap_or_else(|| PathBuf::from("rsync"))
    }

    pub fn build_args(
        &self,
        request: &CopyRequest<'_>,
        exclude_from: &Path,
        files_from: &Path,
        sshpass: Option<&Path>,
    ) -> Vec<String> {
        let mut args = self.options.flags();
        if let Some(reference) = request.link_reference {
            args.push(format!("--link-dest={}", reference.display()));
        }
        args.push(format!("--exclude-from={}", exclude_from.display()));
        args.push(format!("--files-from={}", files_from.display()));
        if let Some(t) = request.transport {
            args.push("-e".into());
            args.push(t.shell_command(sshpass));
            if t.remote_sudo {
                args.push("--rsync-path=sudo rsync".into());
            }
        }
        args.push("/".into());
        args.push(request.destination.clone());
        args
    }
}

fn write_list<S: AsRef<str>>(prefix: &str, items: &[S]) -> Result<NamedTempFile> {
    let mut f = tempfile::Builder::new()
        .prefix(prefix)
        .tempfile()
        .map_err(|e| Error::io("cannot create temporary file", e))?;
    for item in items {
        writeln!(f, "{}", item.as_ref())
            .map_err(|e| Error::io("cannot write temporary file", e))?;
    }
    f.flush()
        .map_err(|e| Error::io("cannot write temporary file", e))?;
    Ok(f)
}

impl CopyEngine for Rsync {
    fn copy(&mut self, request: &CopyRequest<'_>, reporter: &dyn Reporter) -> Result<CopyResult> {
        // Both files are removed when they drop at the end of this call.
        let excludes = write_list("tmp_exclude", request.excludes)?;
        let sources: Vec<String> = request
            .sources
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let files = write_list("tmp_inputs", &sources)?;

        let mut redactor = Redactor::default();
        let secret = request.transport.and_then(|t| t.secret.as_ref());
        let sshpass = match secret {
            Some(s) => {
                redactor.add(s.expose());
                let found = find_in_path("sshpass");
                if found.is_none() {
                    reporter.warn("sshpass not found; the copy engine's ssh cannot be given the secret");
                }
                found
            }
            None => None,
        };

        let args = self.build_args(request, excludes.path(), files.path(), sshpass.as_deref());
        let program = self.program();
        reporter.debug(&format!(
            "running {} {}",
            program.display(),
            redactor.apply(&args.join(" "))
        ));

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let (Some(secret), Some(_)) = (secret, &sshpass) {
            cmd.env("SSHPASS", secret.expose());
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::io(format!("failed to start {}", program.display()), e))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        let mut output = String::new();
        let mut summary = SummaryParser::default();
        for line in rx {
            let line = sanitize_log_line(&redactor.apply(&line));
            if line.is_empty() {
                continue;
            }
            summary.feed(&line);
            output.push_str(&line);
            output.push('\n');
            reporter.emit(SessionEvent::CopyOutput { line });
        }

        let status = child
            .wait()
            .map_err(|e| Error::io(format!("waiting for {} failed", program.display()), e))?;
        Ok(CopyResult {
            exit_code: status.code().unwrap_or(-1),
            output,
            summary: summary.finish(),
        })
    }
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if !pending.is_empty() {
                    let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}

// Human description of an rsync exit code.
pub fn describe_exit_code(code: i32) -> String {
    let what = match code {
        0 => "success",
        2 => "protocol incompatibility",
        3 => "errors selecting input/output files, dirs",
        4 => "requested action not supported",
        5 => "error starting client-server protocol",
        10 => "error in socket I/O",
        11 => "error in file I/O",
        12 => "error in rsync protocol data stream",
        22 => "error allocating core memory buffers",
        23 => "partial transfer due to error",
        24 => "partial transfer due to vanished source files",
        30 => "timeout in data send/receive",
        35 => "timeout waiting for daemon connection",
        -1 => "terminated by a signal",
        _ => "check rsync(1) for details",
    };
    format!("rsync error (return code {code}) - {what}")
}

// 23 and 24 are partial transfers; everything else non-zero is an error.
pub fn exit_code_is_warning(code: i32) -> bool {
    matches!(code, 23 | 24)
}

fn sent_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^sent ([\d.,]+[KMGT]?) bytes\s+received ([\d.,]+[KMGT]?) bytes\s+([\d.,]+[KMGT]?) bytes/sec").ok()
    })
    .as_ref()
}

fn total_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^total size is ([\d.,]+[KMGT]?)\s+speedup is ([\d.,]+)").ok())
        .as_ref()
}

#[derive(Default)]
struct SummaryParser {
    sent: Option<(String, String, String)>,
    total: Option<(String, String)>,
}

impl SummaryParser {
    fn feed(&mut self, line: &str) {
        if let Some(c) = sent_re().and_then(|re| re.captures(line)) {
            self.sent = Some((c[1].to_string(), c[2].to_string(), c[3].to_string()));
        } else if let Some(c) = total_re().and_then(|re| re.captures(line)) {
            self.total = Some((c[1].to_string(), c[2].to_string()));
        }
    }

    fn finish(self) -> Option<TransferSummary> {
        let (sent_bytes, received_bytes, rate) = self.sent?;
        let (total_size, speedup) = self.total.unwrap_or_default();
        Some(TransferSummary {
            sent_bytes,
            received_bytes,
            rate,
            total_size,
            speedup,
        })
    }
}
