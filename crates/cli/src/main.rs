#![forbid(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use config::Config;
use flume::bounded;
use heuristics::{ExecResult, HeuristicsInstance, WorkerSettings};
use qdevice_heuristics::{
    cli::{Cli, Commands, WorkerArgs},
    daemon,
    signals::wait_for_signal,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, trace};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // The worker logs through its stderr pipe and must not start a runtime.
    if let Some(Commands::Worker(args)) = &cli.command {
        heuristics::worker::run(&WorkerSettings::from(args))?;
        return Ok(ExitCode::SUCCESS);
    }

    // NOTE: The verbosity flag takes precedence over the environment variable
    // for log control. `QDEVICE_HEURISTICS_LOG=worker=debug qdevice-heuristics`
    // shows the worker's debug messages while everything else stays at the
    // verbosity flag's level.
    let env_filter = EnvFilter::builder()
        .with_env_var("QDEVICE_HEURISTICS_LOG")
        .from_env()?
        .add_directive(cli.verbosity.log_level_filter().as_str().parse()?);

    let layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();

    let config = load_config(&cli)?;
    config.validate()?;
    debug!(?config, ?cli);

    let worker_args = WorkerArgs::from(&WorkerSettings::from(&config.advanced)).to_args();
    let exe = std::env::current_exe().context("can't locate own executable")?;
    let mut instance = HeuristicsInstance::spawn_worker(&exe, &worker_args, &config)?;

    if cli.once {
        let result = daemon::run_once(&mut instance, &config, cli.sync);
        instance.shutdown()?;
        return Ok(match result? {
            ExecResult::Fail => ExitCode::FAILURE,
            ExecResult::Pass | ExecResult::Disabled => ExitCode::SUCCESS,
        });
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        // install signal handlers
        let (signals_tx, signals_rx) = bounded(8);
        let signal_handle = tokio::spawn(async move { wait_for_signal(signals_tx).await });

        let res = daemon::run(instance, config, signals_rx, || load_config(&cli)).await;
        signal_handle.abort();
        if let Err(err) = &res {
            error!("heuristics daemon failed: {err:#}");
        }
        res
    })?;

    Ok(ExitCode::SUCCESS)
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let config = match &cli.conffile {
        Some(path) => Config::load(path)?,
        _ => {
            let mut candidates = glob::glob("/etc/qdevice-heuristics/config.d/*.toml")?
                .filter_map(Result::ok)
                .collect::<Vec<_>>();
            candidates.insert(0, PathBuf::from("/etc/qdevice-heuristics/config.toml"));
            trace!(?candidates, "config file candidates");
            Config::load_multiple(candidates)?
        }
    };
    Ok(config)
}
