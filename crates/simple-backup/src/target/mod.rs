use std::path::Path;

use crate::error::Result;

pub mod local;
pub mod remote;

pub use local::LocalTarget;
pub use remote::{RemoteShell, RemoteTarget, ShellOutput};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    // stdout followed by stderr
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

// Directory and process operations the backup session needs, identical for the
// local machine and a remote host. Paths are absolute POSIX paths on the target.
pub trait ExecTarget {
    fn describe(&self) -> String;

    fn exists(&self, path: &Path) -> Result<bool>;

    fn is_dir(&self, path: &Path) -> Result<bool>;

    // Immediate entry names, sorted ascending.
    fn list_dir(&self, path: &Path) -> Result<Vec<String>>;

    // Ok(None) when the path is not a symbolic link or does not exist.
    fn read_link(&self, path: &Path) -> Result<Option<String>>;

    fn remove_link(&self, path: &Path) -> Result<()>;

    fn create_link(&self, path: &Path, target: &Path) -> Result<()>;

    // Fails if the directory already exists.
    fn create_dir(&self, path: &Path) -> Result<()>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    fn remove_tree(&self, path: &Path) -> Result<()>;

    fn run_command(&self, argv: &[String]) -> Result<CommandOutput>;

    // How the copy engine addresses `path` on this target.
    fn copy_destination(&self, path: &Path) -> String;

    fn is_remote(&self) -> bool {
        false
    }
}

pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

pub fn sh_quote_path(p: &Path) -> String {
    sh_quote(&p.to_string_lossy())
}
