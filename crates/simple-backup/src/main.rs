use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use simple_backup::config::{self, FileConfig, Overrides, PointerPolicy, PreviousLookup};
use simple_backup::copy_engine::Rsync;
use simple_backup::inputs::UserContext;
use simple_backup::report::TracingReporter;
use simple_backup::ssh::{HostKeyPolicy, NonInteractive, Prompter, SshConnector, TerminalPrompter};
use simple_backup::{Orchestrator, Result, SessionOutcome};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Fmt,
    Json,
}

/// Incremental backups with rsync and hard-linked snapshots
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// More verbose output (rsync output at info level)
    #[arg(short, long)]
    verbose: bool,
    /// Configuration file [default: ~/.config/simple_backup/simple_backup.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Paths/files to back up
    #[arg(short, long, num_args = 1..)]
    inputs: Option<Vec<String>>,
    /// Output directory for the backup
    #[arg(short, long)]
    output: Option<String>,
    /// Files/directories/patterns to exclude from the backup
    #[arg(short, long, num_args = 1..)]
    exclude: Option<Vec<String>>,
    /// Number of old backups to keep (-1 keeps all)
    #[arg(short, long, allow_hyphen_values = true)]
    keep: Option<i64>,
    /// User the backup runs for (home directory, default config)
    #[arg(short, long)]
    user: Option<String>,
    /// Compare files by checksum
    #[arg(short = 's', long)]
    checksum: bool,
    /// Compress data during the transfer
    #[arg(short = 'z', long)]
    compress: bool,
    /// Server hostname (remote backup)
    #[arg(long)]
    ssh_host: Option<String>,
    /// Username on the server (remote backup)
    #[arg(long)]
    ssh_user: Option<String>,
    /// SSH port on the server
    #[arg(long)]
    ssh_port: Option<u16>,
    /// SSH key location
    #[arg(long)]
    keyfile: Option<PathBuf>,
    /// Remove old backups before copying instead of after
    #[arg(long)]
    remove_before_backup: bool,
    /// rsync single-letter options used instead of the default set
    #[arg(long, num_args = 1.., value_parser = ["a", "l", "p", "t", "g", "o", "c", "h", "s", "D", "H", "X"])]
    rsync_options: Option<Vec<String>>,
    /// Run rsync on the server with sudo
    #[arg(long)]
    remote_sudo: bool,
    /// Don't map uid/gid values by name
    #[arg(long)]
    numeric_ids: bool,
    /// What to do with a server key missing from known_hosts
    #[arg(long, value_enum)]
    host_key_policy: Option<HostKeyPolicy>,
    /// When last_backup advances to the new snapshot
    #[arg(long, value_enum)]
    pointer_policy: Option<PointerPolicy>,
    /// How the previous snapshot is located
    #[arg(long, value_enum)]
    previous_lookup: Option<PreviousLookup>,
    /// Never prompt for passwords, passphrases or host keys
    #[arg(long)]
    non_interactive: bool,
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Fmt)]
    log_format: LogFormat,
    /// Print the session outcome as JSON on stdout
    #[arg(long)]
    json: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            inputs: self.inputs.clone(),
            output: self.output.clone(),
            exclude: self.exclude.clone(),
            keep: self.keep,
            checksum: self.checksum,
            compress: self.compress,
            numeric_ids: self.numeric_ids,
            remove_before: self.remove_before_backup,
            rsync_options: self.rsync_options.as_ref().map(|v| v.concat()),
            ssh_host: self.ssh_host.clone(),
            ssh_user: self.ssh_user.clone(),
            ssh_port: self.ssh_port,
            keyfile: self.keyfile.clone(),
            remote_sudo: self.remote_sudo,
            host_key_policy: self.host_key_policy,
            pointer_policy: self.pointer_policy,
            previous_lookup: self.previous_lookup,
        }
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Fmt => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn run(args: &Args) -> Result<SessionOutcome> {
    let user = UserContext::resolve(args.user.as_deref());
    if user.home.is_none() {
        tracing::warn!("cannot determine the home directory of the invoking user");
    }
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| user.default_config_path());
    let file = match FileConfig::load_optional(&config_path)? {
        Some(f) => f,
        None => {
            tracing::warn!("config file {} does not exist", config_path.display());
            FileConfig::default()
        }
    };

    let resolved = config::resolve(&file, &args.overrides(), &user)?;
    for w in &resolved.warnings {
        tracing::warn!("{w}");
    }
    let plan = resolved.plan;
    let server = plan.server.clone();
    let mut engine = Rsync::new(plan.rsync.clone());
    let orchestrator = Orchestrator::new(plan, Arc::new(TracingReporter::new(args.verbose)));

    match server {
        Some(server) => {
            let mut prompter: Box<dyn Prompter> = if args.non_interactive {
                Box::new(NonInteractive)
            } else {
                Box::new(TerminalPrompter)
            };
            let mut connector = SshConnector::new(server);
            orchestrator.run_remote(&mut connector, prompter.as_mut(), &mut engine)
        }
        None => orchestrator.run_local(&mut engine),
    }
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_logging(args.verbose, args.log_format);

    let code = match run(&args) {
        Ok(outcome) => {
            if args.json {
                match serde_json::to_string_pretty(&outcome) {
                    Ok(s) => println!("{s}"),
                    Err(e) => tracing::error!("cannot encode outcome: {e}"),
                }
            }
            outcome.exit_code()
        }
        Err(e) => {
            tracing::error!("{e}");
            e.exit_code()
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
