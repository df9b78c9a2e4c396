//! Invoking-user resolution and expansion of configured input patterns.

use std::collections::BTreeSet;
use std::env;
use std::ffi::{CStr, CString};
use std::path::PathBuf;

use glob::{MatchOptions, Pattern};

// The user a backup runs for: the `--user` override, `SUDO_USER` under sudo, else `USER`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserContext {
    pub name: Option<String>,
    pub home: Option<PathBuf>,
}

impl UserContext {
    pub fn resolve(explicit: Option<&str>) -> Self {
        if let Some(name) = explicit.filter(|s| !s.is_empty()) {
            return Self {
                name: Some(name.to_string()),
                home: home_of(name),
            };
        }
        if is_root() {
            let name = env::var("SUDO_USER").ok().filter(|s| !s.is_empty());
            let home = name.as_deref().and_then(home_of);
            return Self { name, home };
        }
        let name = env::var("USER").ok().filter(|s| !s.is_empty());
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .filter(|p| !p.as_os_str().is_empty())
            .or_else(|| name.as_deref().and_then(home_of));
        Self { name, home }
    }

    pub fn new(name: impl Into<String>, home: impl Into<PathBuf>) -> Self {
        Self {
            name: Some(name.into()),
            home: Some(home.into()),
        }
    }

    pub fn default_config_path(&self) -> PathBuf {
        self.home
            .clone()
            .unwrap_or_default()
            .join(".config/simple_backup/simple_backup.toml")
    }

    pub fn default_known_hosts(&self) -> PathBuf {
        self.home.clone().unwrap_or_default().join(".ssh/known_hosts")
    }

    // `~` and `~/...` become the user's home. None when there is no home to use.
    pub fn expand_tilde(&self, pattern: &str) -> Option<String> {
        let rest = pattern.strip_prefix('~')?;
        if !(rest.is_empty() || rest.starts_with('/')) {
            return None;
        }
        let home = self.home.as_ref()?;
        Some(format!("{}{rest}", home.display()))
    }
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn home_of(user: &str) -> Option<PathBuf> {
    let cname = CString::new(user).ok()?;
    // getpwnam returns a pointer into static storage; copy out before returning.
    let dir = unsafe {
        let pw = libc::getpwnam(cname.as_ptr());
        if pw.is_null() || (*pw).pw_dir.is_null() {
            return None;
        }
        CStr::from_ptr((*pw).pw_dir).to_string_lossy().into_owned()
    };
    if dir.is_empty() {
        None
    } else {
        Some(PathBuf::from(dir))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expansion {
    pub paths: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

// Expand `~` and glob patterns. Unmatched patterns are skipped with a warning;
// the result is deduplicated and sorted.
pub fn expand_patterns<S: AsRef<str>>(patterns: &[S], user: &UserContext) -> Expansion {
    let mut out = BTreeSet::new();
    let mut warnings = Vec::new();

    for raw in patterns {
        let raw = raw.as_ref().trim();
        if raw.is_empty() {
            continue;
        }
        let pattern = if raw.starts_with('~') {
            match user.expand_tilde(raw) {
                Some(p) => p,
                None => {
                    warnings.push(format!("cannot expand '~' in {raw}: no user home known"));
                    raw.to_string()
                }
            }
        } else {
            raw.to_string()
        };

        let matches = glob_paths(&pattern);
        if matches.is_empty() {
            warnings.push(format!(
                "no file or directory matching input {raw}, skipping"
            ));
        }
        out.extend(matches);
    }

    Expansion {
        paths: out.into_iter().collect(),
        warnings,
    }
}

// Expand only `~` (no globbing); used for single paths such as the backup directory.
pub fn expand_path(raw: &str, user: &UserContext) -> (PathBuf, Option<String>) {
    if raw.starts_with('~') {
        match user.expand_tilde(raw) {
            Some(p) => (PathBuf::from(p), None),
            None => (
                PathBuf::from(raw),
                Some(format!("cannot expand '~' in {raw}: no user home known")),
            ),
        }
    } else {
        (PathBuf::from(raw), None)
    }
}

// Existing paths matching `pattern`. Hidden entries only match a component that
// starts with a literal `.`. A malformed pattern is taken literally.
pub fn glob_paths(pattern: &str) -> Vec<PathBuf> {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };
    let paths = match glob::glob_with(pattern, options) {
        Ok(paths) => paths,
        Err(_) => match glob::glob_with(&Pattern::escape(pattern), options) {
            Ok(paths) => paths,
            Err(_) => return Vec::new(),
        },
    };
    paths.filter_map(|p| p.ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn touch(p: &Path) {
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(p, b"x").expect("write");
    }

    #[test]
    fn tilde_expands_to_user_home_only_at_start() {
        let u = UserContext::new("alice", "/home/alice");
        assert_eq!(u.expand_tilde("~/docs").as_deref(), Some("/home/alice/docs"));
        assert_eq!(u.expand_tilde("~").as_deref(), Some("/home/alice"));
        assert_eq!(u.expand_tilde("~bob/docs"), None);
        assert_eq!(u.expand_tilde("/srv/~x"), None);
        assert_eq!(
            u.default_config_path(),
            PathBuf::from("/home/alice/.config/simple_backup/simple_backup.toml")
        );
    }

    #[test]
    fn glob_matches_per_component_and_skips_hidden() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        touch(&root.join("a/one.txt"));
        touch(&root.join("a/two.txt"));
        touch(&root.join("a/.hidden.txt"));
        touch(&root.join("b/three.log"));
        touch(&root.join("c1/x"));
        touch(&root.join("c2/x"));

        let txt = glob_paths(&format!("{}/a/*.txt", root.display()));
        assert_eq!(txt, vec![root.join("a/one.txt"), root.join("a/two.txt")]);

        let xs = glob_paths(&format!("{}/c[0-9]/x", root.display()));
        assert_eq!(xs, vec![root.join("c1/x"), root.join("c2/x")]);

        let neg = glob_paths(&format!("{}/c[!1]/?", root.display()));
        assert_eq!(neg, vec![root.join("c2/x")]);
    }

    #[test]
    fn expansion_warns_skips_and_dedupes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = dir.path().join("home");
        touch(&home.join("notes/a.md"));
        touch(&home.join("notes/b.md"));
        let user = UserContext::new("alice", &home);

        let exp = expand_patterns(
            &["~/notes/*.md", "~/notes/a.md", "~/missing", ""],
            &user,
        );
        assert_eq!(
            exp.paths,
            vec![home.join("notes/a.md"), home.join("notes/b.md")]
        );
        assert_eq!(exp.warnings.len(), 1);
        assert!(exp.warnings[0].contains("~/missing"));
    }

    #[test]
    fn tilde_without_home_is_warned() {
        let user = UserContext::default();
        let (p, warn) = expand_path("~/backups", &user);
        assert_eq!(p, PathBuf::from("~/backups"));
        assert!(warn.expect("warning").contains("no user home"));
    }

    #[test]
    fn malformed_pattern_is_taken_literally() {
        let dir = tempfile::tempdir().expect("tempdir");
        let odd = dir.path().join("a[b");
        touch(&odd);
        assert_eq!(glob_paths(&odd.to_string_lossy()), vec![odd.clone()]);

        let hidden = dir.path().join(".cache");
        touch(&hidden);
        assert_eq!(
            glob_paths(&format!("{}/.c*", dir.path().display())),
            vec![hidden]
        );
    }
}
