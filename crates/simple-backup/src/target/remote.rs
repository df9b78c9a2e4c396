use std::path::Path;

use super::{CommandOutput, ExecTarget, sh_quote, sh_quote_path};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    // Not every transport reports one.
    pub exit_code: Option<i32>,
}

// One shell command line per call, executed by the remote user's shell.
pub trait RemoteShell {
    fn exec(&self, command: &str) -> Result<ShellOutput>;

    // "user@host" as the copy engine should address the remote side.
    fn login(&self) -> String;
}

impl<S: RemoteShell + ?Sized> RemoteShell for Box<S> {
    fn exec(&self, command: &str) -> Result<ShellOutput> {
        (**self).exec(command)
    }

    fn login(&self) -> String {
        (**self).login()
    }
}

pub struct RemoteTarget<S> {
    shell: S,
}

impl<S: RemoteShell> RemoteTarget<S> {
    pub fn new(shell: S) -> Self {
        Self { shell }
    }

    pub fn shell(&self) -> &S {
        &self.shell
    }

    // `test <flag> path` evaluated remotely; no output means false.
    fn probe(&self, flag: &str, path: &Path) -> Result<bool> {
        let cmd = format!("if [ {flag} {} ]; then echo ok; fi", sh_quote_path(path));
        let out = self.shell.exec(&cmd)?;
        Ok(out.stdout.trim() == "ok")
    }

    // Mutations report failure through stderr; some transports never deliver an exit status.
    fn mutate(&self, what: &str, path: &Path, command: String) -> Result<()> {
        let out = self.shell.exec(&command)?;
        let err = first_line(&out.stderr);
        if !err.is_empty() {
            return Err(classify_stderr(
                &format!("{what} {} failed", path.display()),
                err,
            ));
        }
        if let Some(code) = out.exit_code
            && code != 0
        {
            return Err(Error::msg(format!(
                "{what} {} failed (exit {code})",
                path.display()
            )));
        }
        Ok(())
    }
}

impl<S: RemoteShell> ExecTarget for RemoteTarget<S> {
    fn describe(&self) -> String {
        format!("remote host {}", self.shell.login())
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        let q = sh_quote_path(path);
        let cmd = format!("if [ -e {q} ] || [ -L {q} ]; then echo ok; fi");
        let out = self.shell.exec(&cmd)?;
        Ok(out.stdout.trim() == "ok")
    }

    fn is_dir(&self, path: &Path) -> Result<bool> {
        self.probe("-d", path)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let out = self
            .shell
            .exec(&format!("ls -1A -- {}", sh_quote_path(path)))?;
        let err = first_line(&out.stderr);
        if !err.is_empty() {
            return Err(classify_stderr(
                &format!("cannot list {}", path.display()),
                err,
            ));
        }
        let mut names: Vec<String> = out
            .stdout
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        names.sort();
        Ok(names)
    }

    fn read_link(&self, path: &Path) -> Result<Option<String>> {
        // readlink prints nothing for a missing path or a non-link; both mean "no link".
        let out = self
            .shell
            .exec(&format!("readlink -- {} 2>/dev/null", sh_quote_path(path)))?;
        let target = out.stdout.trim_end_matches('\n');
        if target.is_empty() {
            Ok(None)
        } else {
            Ok(Some(target.to_string()))
        }
    }

    fn remove_link(&self, path: &Path) -> Result<()> {
        if !self.probe("-L", path)? {
            return Err(Error::not_found(format!(
                "cannot remove link {}: not a symbolic link",
                path.display()
            )));
        }
        self.mutate("removing link", path, format!("rm -- {}", sh_quote_path(path)))
    }

    fn create_link(&self, path: &Path, target: &Path) -> Result<()> {
        self.mutate(
            "creating link",
            path,
            format!("ln -s -- {} {}", sh_quote_path(target), sh_quote_path(path)),
        )
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        self.mutate("creating", path, format!("mkdir -- {}", sh_quote_path(path)))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.mutate(
            "creating",
            path,
            format!("mkdir -p -- {}", sh_quote_path(path)),
        )
    }

    fn remove_tree(&self, path: &Path) -> Result<()> {
        self.mutate("removing", path, format!("rm -r -- {}", sh_quote_path(path)))
    }

    fn run_command(&self, argv: &[String]) -> Result<CommandOutput> {
        if argv.is_empty() {
            return Err(Error::msg("empty command"));
        }
        let line = argv
            .iter()
            .map(|a| sh_quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        let out = self.shell.exec(&line)?;
        let mut output = out.stdout;
        output.push_str(&out.stderr);
        Ok(CommandOutput {
            exit_code: out.exit_code,
            output,
        })
    }

    fn copy_destination(&self, path: &Path) -> String {
        format!("{}:{}", self.shell.login(), path.display())
    }

    fn is_remote(&self) -> bool {
        true
    }
}

fn first_line(s: &str) -> &str {
    s.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("")
}

fn classify_stderr(context: &str, stderr: &str) -> Error {
    let lower = stderr.to_ascii_lowercase();
    let msg = format!("{context}: {stderr}");
    if lower.contains("no such file") || lower.contains("not found") {
        Error::not_found(msg)
    } else if lower.contains("permission denied") || lower.contains("operation not permitted") {
        Error::permission_denied(msg)
    } else {
        Error::msg(msg)
    }
}
