use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};
use crate::inputs::{UserContext, expand_path, expand_patterns};
use crate::ssh::{HostKeyPolicy, ServerConfig};

// Single-letter rsync options a user may pick instead of the default set.
pub const RSYNC_LETTERS: &str = "alptgochsDHX";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, serde::Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PointerPolicy {
    // Advance last_backup only when the copy engine exits 0 or 24.
    #[default]
    OnSuccess,
    Always,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, serde::Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PreviousLookup {
    // Follow last_backup; scan only when it does not exist.
    #[default]
    Pointer,
    // Lexicographically last snapshot directory.
    Scan,
}

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn table(&self, key: &str) -> Option<&toml::value::Table> {
        self.value.as_table().and_then(|t| t.get(key)?.as_table())
    }

    pub fn deserialize_table<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        let Some(tbl) = self.table(key) else {
            return Ok(T::default());
        };
        Value::Table(tbl.clone()).try_into().map_err(|e| {
            Error::config(format!(
                "invalid [{key}] section in {}: {e}",
                self.path.display()
            ))
        })
    }
}

// Keys of `overlay` replace those of `base`; nested tables merge.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(over_tbl)) => {
            for (k, v) in over_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read config {}", path.display()), e))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("parse error in {}: {e}", path.display())))?;

    // `[default]` is the older name of `[backup]`; `[backup]` wins key by key.
    if let Some(tbl) = value.as_table_mut()
        && let Some(legacy) = tbl.remove("default")
    {
        let mut merged = legacy;
        if let Some(current) = tbl.remove("backup") {
            merge_values(&mut merged, current);
        }
        tbl.insert("backup".into(), merged);
    }

    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupSection {
    pub inputs: Vec<String>,
    pub backup_dir: Option<String>,
    pub exclude: Vec<String>,
    pub keep: Option<i64>,
    pub remove_before: Option<bool>,
    pub checksum: Option<bool>,
    pub compress: Option<bool>,
    pub numeric_ids: Option<bool>,
    pub rsync_options: Option<String>,
    pub rsync_binary: Option<PathBuf>,
    pub pointer_policy: Option<PointerPolicy>,
    pub previous_lookup: Option<PreviousLookup>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub ssh_host: Option<String>,
    pub ssh_user: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_keyfile: Option<String>,
    pub remote_sudo: Option<bool>,
    pub known_hosts: Option<String>,
    pub host_key_policy: Option<HostKeyPolicy>,
    // Older files keep this under [server].
    pub numeric_ids: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    pub backup: BackupSection,
    pub server: ServerSection,
}

impl FileConfig {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        if let Some(root) = doc.value.as_table() {
            for key in root.keys() {
                if key != "backup" && key != "server" {
                    return Err(Error::config(format!(
                        "unknown section [{key}] in {}",
                        doc.path.display()
                    )));
                }
            }
        }
        Ok(Self {
            backup: doc.deserialize_table("backup")?,
            server: doc.deserialize_table("server")?,
        })
    }

    // A missing file is not an error: the caller warns and continues with defaults.
    pub fn load_optional(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let doc = load(path)?;
        Self::from_doc(&doc).map(Some)
    }
}

// Command-line values; any that are set win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub inputs: Option<Vec<String>>,
    pub output: Option<String>,
    pub exclude: Option<Vec<String>>,
    pub keep: Option<i64>,
    pub checksum: bool,
    pub compress: bool,
    pub numeric_ids: bool,
    pub remove_before: bool,
    pub rsync_options: Option<String>,
    pub ssh_host: Option<String>,
    pub ssh_user: Option<String>,
    pub ssh_port: Option<u16>,
    pub keyfile: Option<PathBuf>,
    pub remote_sudo: bool,
    pub host_key_policy: Option<HostKeyPolicy>,
    pub pointer_policy: Option<PointerPolicy>,
    pub previous_lookup: Option<PreviousLookup>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RsyncOptions {
    // None selects the default option set.
    pub letters: Option<String>,
    pub checksum: bool,
    pub compress: bool,
    pub numeric_ids: bool,
    pub binary: Option<PathBuf>,
}

impl RsyncOptions {
    pub fn flags(&self) -> Vec<String> {
        let mut out: Vec<String> = match &self.letters {
            None => ["-a", "-r", "-v", "-h", "-H", "-X", "-s", "--ignore-missing-args"]
                .into_iter()
                .map(String::from)
                .collect(),
            Some(letters) => {
                let mut v = vec!["-r".to_string(), "-v".to_string()];
                v.extend(letters.chars().map(|c| format!("-{c}")));
                v
            }
        };
        if self.checksum {
            out.push("-c".into());
        }
        if self.compress {
            out.push("-z".into());
        }
        if self.numeric_ids {
            out.push("--numeric-ids".into());
        }
        out
    }
}

fn parse_letters(raw: &str) -> Result<String> {
    let mut out = String::new();
    for c in raw.chars().filter(|c| !c.is_whitespace() && *c != ',' && *c != '-') {
        if !RSYNC_LETTERS.contains(c) {
            return Err(Error::config(format!(
                "invalid rsync option '{c}' (allowed: {})",
                RSYNC_LETTERS.chars().map(String::from).collect::<Vec<_>>().join(" ")
            )));
        }
        if !out.contains(c) {
            out.push(c);
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct BackupPlan {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub exclude: Vec<String>,
    pub keep: i64,
    pub remove_before: bool,
    pub rsync: RsyncOptions,
    pub pointer_policy: PointerPolicy,
    pub previous_lookup: PreviousLookup,
    pub server: Option<ServerConfig>,
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub plan: BackupPlan,
    pub warnings: Vec<String>,
}

pub fn resolve(file: &FileConfig, o: &Overrides, user: &UserContext) -> Result<Resolved> {
    let b = &file.backup;
    let s = &file.server;
    let mut warnings = Vec::new();

    let (inputs_configured, inputs) = match &o.inputs {
        Some(list) => (
            !list.is_empty(),
            list.iter().map(PathBuf::from).collect::<Vec<_>>(),
        ),
        None => {
            let exp = expand_patterns(&b.inputs, user);
            warnings.extend(exp.warnings);
            (!b.inputs.is_empty(), exp.paths)
        }
    };
    if !inputs_configured {
        return Err(Error::config(
            "no inputs specified: use -i or set inputs in the configuration file",
        ));
    }

    let output = match (&o.output, &b.backup_dir) {
        (Some(out), _) => PathBuf::from(out),
        (None, Some(dir)) => {
            let (p, warn) = expand_path(dir, user);
            warnings.extend(warn);
            p
        }
        (None, None) => {
            return Err(Error::output_invalid(
                "no output path specified: use -o or set backup_dir in the configuration file",
            ));
        }
    };

    let keep = o.keep.or(b.keep).unwrap_or(-1);
    if keep < -1 {
        return Err(Error::config(format!(
            "invalid keep value {keep}: must be -1 (keep all) or greater"
        )));
    }

    let letters = match o.rsync_options.as_ref().or(b.rsync_options.as_ref()) {
        Some(raw) => Some(parse_letters(raw)?),
        None => None,
    };
    let rsync = RsyncOptions {
        letters,
        checksum: o.checksum || b.checksum.unwrap_or(false),
        compress: o.compress || b.compress.unwrap_or(false),
        numeric_ids: o.numeric_ids
            || b.numeric_ids.unwrap_or(false)
            || s.numeric_ids.unwrap_or(false),
        binary: b.rsync_binary.clone(),
    };

    let host = o.ssh_host.clone().or_else(|| s.ssh_host.clone());
    let ssh_user = o.ssh_user.clone().or_else(|| s.ssh_user.clone());
    let server = match (host, ssh_user) {
        (Some(host), Some(ssh_user)) if !host.is_empty() && !ssh_user.is_empty() => {
            let key_file = match (&o.keyfile, &s.ssh_keyfile) {
                (Some(k), _) => Some(k.clone()),
                (None, Some(k)) => {
                    let (p, warn) = expand_path(k, user);
                    warnings.extend(warn);
                    Some(p)
                }
                (None, None) => None,
            };
            let known_hosts = match &s.known_hosts {
                Some(k) => {
                    let (p, warn) = expand_path(k, user);
                    warnings.extend(warn);
                    p
                }
                None => user.default_known_hosts(),
            };
            Some(ServerConfig {
                host,
                user: ssh_user,
                port: o.ssh_port.or(s.ssh_port).unwrap_or(22),
                key_file,
                known_hosts,
                host_key_policy: o
                    .host_key_policy
                    .or(s.host_key_policy)
                    .unwrap_or_default(),
                remote_sudo: o.remote_sudo || s.remote_sudo.unwrap_or(false),
            })
        }
        (Some(_), None) | (None, Some(_)) => {
            warnings.push("both ssh host and ssh user are needed for a remote backup; running locally".into());
            None
        }
        _ => None,
    };

    Ok(Resolved {
        plan: BackupPlan {
            inputs,
            output,
            exclude: o.exclude.clone().unwrap_or_else(|| b.exclude.clone()),
            keep,
            remove_before: o.remove_before || b.remove_before.unwrap_or(false),
            rsync,
            pointer_policy: o.pointer_policy.or(b.pointer_policy).unwrap_or_default(),
            previous_lookup: o
                .previous_lookup
                .or(b.previous_lookup)
                .unwrap_or_default(),
            server,
        },
        warnings,
    })
}
