use std::fs;
use std::path::Path;
use std::process::Command;

use super::{CommandOutput, ExecTarget};
use crate::error::{Error, Result};

#[derive(Debug, Default, Clone)]
pub struct LocalTarget;

impl ExecTarget for LocalTarget {
    fn describe(&self) -> String {
        "local filesystem".into()
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        // A dangling symlink still occupies the name.
        Ok(fs::symlink_metadata(path).is_ok())
    }

    fn is_dir(&self, path: &Path) -> Result<bool> {
        match fs::metadata(path) {
            Ok(m) => Ok(m.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(format!("cannot stat {}", path.display()), e)),
        }
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let rd = fs::read_dir(path)
            .map_err(|e| Error::io(format!("cannot list {}", path.display()), e))?;
        let mut names = Vec::new();
        for entry in rd {
            let entry = entry.map_err(|e| Error::io(format!("cannot list {}", path.display()), e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn read_link(&self, path: &Path) -> Result<Option<String>> {
        match fs::symlink_metadata(path) {
            Ok(m) if m.file_type().is_symlink() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(format!("cannot stat {}", path.display()), e)),
        }
        let target = fs::read_link(path)
            .map_err(|e| Error::io(format!("cannot read link {}", path.display()), e))?;
        Ok(Some(target.to_string_lossy().into_owned()))
    }

    fn remove_link(&self, path: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(path)
            .map_err(|e| Error::io(format!("cannot remove link {}", path.display()), e))?;
        if !meta.file_type().is_symlink() {
            return Err(Error::msg(format!(
                "refusing to remove {} (not a symbolic link)",
                path.display()
            )));
        }
        fs::remove_file(path)
            .map_err(|e| Error::io(format!("cannot remove link {}", path.display()), e))
    }

    fn create_link(&self, path: &Path, target: &Path) -> Result<()> {
        std::os::unix::fs::symlink(target, path)
            .map_err(|e| Error::io(format!("cannot create link {}", path.display()), e))
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir(path)
            .map_err(|e| Error::io(format!("cannot create {}", path.display()), e))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .map_err(|e| Error::io(format!("cannot create {}", path.display()), e))
    }

    fn remove_tree(&self, path: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(path)
            .map_err(|e| Error::io(format!("cannot remove {}", path.display()), e))?;
        let res = if meta.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        res.map_err(|e| Error::io(format!("cannot remove {}", path.display()), e))
    }

    fn run_command(&self, argv: &[String]) -> Result<CommandOutput> {
        let (prog, args) = argv
            .split_first()
            .ok_or_else(|| Error::msg("empty command"))?;
        let out = Command::new(prog)
            .args(args)
            .output()
            .map_err(|e| Error::io(format!("failed to run {prog}"), e))?;
        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(CommandOutput {
            exit_code: out.status.code(),
            output,
        })
    }

    fn copy_destination(&self, path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }
}
