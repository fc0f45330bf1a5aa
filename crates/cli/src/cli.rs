use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use heuristics::WorkerSettings;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// qdevice-heuristics: run quorum device heuristics
///
/// Executes the configured heuristics commands in a separate worker process
/// and reports an aggregate Pass, Fail or Disabled verdict for each run.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// Path to configuration file.
    ///
    /// If not provided, the default locations are checked. They are
    /// `/etc/qdevice-heuristics/config.toml` and
    /// `/etc/qdevice-heuristics/config.d/*.toml`, where the latter being a
    /// glob pattern. If they don't exist, the default configuration is used.
    #[arg(short, long, value_parser = validate_file)]
    pub conffile: Option<PathBuf>,

    /// Run the heuristics once, log the verdict and exit.
    ///
    /// The exit status is 0 for Pass or Disabled and 1 for Fail.
    #[arg(long)]
    pub once: bool,

    /// Use `sync_timeout` instead of `timeout` for the `--once` run.
    #[arg(long, requires = "once")]
    pub sync: bool,

    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Serve a parent daemon over stdin, stdout and stderr.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Debug, Args, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    /// Maximum size of one message on any pipe, in bytes.
    #[arg(long)]
    pub ipc_max_size: usize,

    /// Maximum number of supervised processes.
    #[arg(long)]
    pub max_processes: usize,

    /// Kill list escalation period in milliseconds.
    #[arg(long)]
    pub kill_list_interval_ms: u64,

    /// Resolve bare command names through `PATH`.
    #[arg(long)]
    pub use_execvp: bool,
}

impl WorkerArgs {
    /// Arguments that make [`Cli`] parse back into `self`, starting with the
    /// subcommand name.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "worker".to_owned(),
            "--ipc-max-size".to_owned(),
            self.ipc_max_size.to_string(),
            "--max-processes".to_owned(),
            self.max_processes.to_string(),
            "--kill-list-interval-ms".to_owned(),
            self.kill_list_interval_ms.to_string(),
        ];
        if self.use_execvp {
            args.push("--use-execvp".to_owned());
        }
        args
    }
}

impl From<&WorkerSettings> for WorkerArgs {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            ipc_max_size: settings.ipc_max_size,
            max_processes: settings.max_processes,
            kill_list_interval_ms: u64::try_from(settings.kill_list_interval.as_millis())
                .unwrap_or(u64::MAX),
            use_execvp: settings.use_execvp,
        }
    }
}

impl From<&WorkerArgs> for WorkerSettings {
    fn from(args: &WorkerArgs) -> Self {
        Self {
            ipc_max_size: args.ipc_max_size,
            use_execvp: args.use_execvp,
            max_processes: args.max_processes,
            kill_list_interval: Duration::from_millis(args.kill_list_interval_ms),
        }
    }
}

/// Check if the file exists.
#[inline(always)]
fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = Path::new(file);
    if path.exists() {
        Ok(path.to_owned())
    } else {
        Err(format!("File not found: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn missing_config_file_is_rejected() {
        assert!(Cli::try_parse_from(["qdevice-heuristics", "-c", "/nonexistent.toml"]).is_err());
    }

    #[test]
    fn sync_requires_once() {
        assert!(Cli::try_parse_from(["qdevice-heuristics", "--sync"]).is_err());
        let cli = Cli::try_parse_from(["qdevice-heuristics", "--once", "--sync"]).unwrap();
        assert!(cli.once && cli.sync);
        assert_eq!(cli.command, None);
    }

    proptest! {
        #[test]
        fn worker_args_survive_the_command_line(
            ipc_max_size in 1usize..1_000_000,
            max_processes in 1usize..10_000,
            kill_list_interval_ms in 1u64..1_000_000,
            use_execvp in any::<bool>(),
        ) {
            let args = WorkerArgs { ipc_max_size, max_processes, kill_list_interval_ms, use_execvp };
            let cli = Cli::try_parse_from(
                std::iter::once("qdevice-heuristics".to_owned()).chain(args.to_args()),
            ).unwrap();
            prop_assert_eq!(cli.command, Some(Commands::Worker(args.clone())));

            let settings = WorkerSettings::from(&args);
            prop_assert_eq!(WorkerArgs::from(&settings), args);
        }
    }
}
