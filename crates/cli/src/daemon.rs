//! The parent daemon loop.
//!
//! Pipe readiness comes from tokio's reactor; the actual reads and writes
//! are done by [`HeuristicsInstance`] on the non-blocking descriptors it
//! owns.

use crate::signals::SignalEvent;
use anyhow::Context;
use config::{Config, HeuristicsMode};
use flume::Receiver;
use heuristics::{ExecList, ExecResult, HeuristicsInstance};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// A descriptor owned by the instance, registered with the reactor.
struct PipeFd(RawFd);

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Send the configured exec list, run it once and wait for the verdict.
pub fn run_once(
    instance: &mut HeuristicsInstance,
    config: &Config,
    sync: bool,
) -> anyhow::Result<ExecResult> {
    instance.change_exec_list(Some(&ExecList::from(&config.heuristics)), sync)?;
    instance.exec(sync)?;

    let (seq, result) = instance
        .wait_for_result(instance.sync_timeout() * 2)?
        .context("no heuristics result delivered")?;
    info!(seq, %result, "heuristics result");
    Ok(result)
}

/// Run until a shutdown signal arrives or the worker connection fails.
/// The worker is stopped in both cases.
pub async fn run(
    mut instance: HeuristicsInstance,
    config: Config,
    signals: Receiver<SignalEvent>,
    reload: impl Fn() -> anyhow::Result<Config>,
) -> anyhow::Result<()> {
    let res = serve(&mut instance, config, signals, reload).await;

    if let Err(err) = instance.shutdown() {
        error!("failed to stop heuristics worker: {err}");
    }
    res
}

async fn serve(
    instance: &mut HeuristicsInstance,
    mut config: Config,
    signals: Receiver<SignalEvent>,
    reload: impl Fn() -> anyhow::Result<Config>,
) -> anyhow::Result<()> {
    let log_fd = AsyncFd::with_interest(PipeFd(instance.log_recv_fd()), Interest::READABLE)?;
    let recv_fd = AsyncFd::with_interest(PipeFd(instance.cmd_recv_fd()), Interest::READABLE)?;
    let send_fd = AsyncFd::with_interest(
        PipeFd(
            instance
                .cmd_send_fd()
                .context("heuristics worker command pipe is closed")?,
        ),
        Interest::WRITABLE,
    )?;

    let (results_tx, results_rx) = flume::unbounded();
    let notifiers = instance.notifiers_mut();
    let id = notifiers.add(
        "daemon",
        Box::new(move |seq, result| {
            results_tx
                .send((seq, result))
                .map_err(|err| err.to_string())
        }),
    );
    notifiers.set_active(id, true)?;

    instance.change_exec_list(Some(&ExecList::from(&config.heuristics)), true)?;
    instance.exec(true)?;

    let mut ticker = exec_ticker(instance.interval());

    loop {
        tokio::select! {
            guard = log_fd.readable() => {
                let mut guard = guard?;
                instance.log_read_from_pipe()?;
                guard.clear_ready();
            }

            guard = recv_fd.readable() => {
                let mut guard = guard?;
                instance.cmd_read_from_pipe()?;
                guard.clear_ready();
            }

            guard = send_fd.writable(), if instance.has_pending_output() => {
                let mut guard = guard?;
                instance.cmd_write()?;
                if instance.has_pending_output() {
                    guard.clear_ready();
                }
            }

            _ = ticker.tick() => {
                if instance.mode() == HeuristicsMode::Enabled && !instance.waiting_for_result() {
                    debug!("running periodic heuristics");
                    instance.exec(false)?;
                }
            }

            res = results_rx.recv_async() => {
                let (seq, result) = res?;
                match result {
                    ExecResult::Fail => warn!(seq, %result, "heuristics result"),
                    _ => info!(seq, %result, "heuristics result"),
                }
            }

            event = signals.recv_async() => {
                match event? {
                    SignalEvent::Reload => {
                        let loaded = reload().and_then(|new_config| {
                            new_config.validate()?;
                            Ok(new_config)
                        });
                        let new_config = match loaded {
                            Ok(new_config) => new_config,
                            Err(err) => {
                                error!("failed to reload config, keeping the current one: {err:#}");
                                continue;
                            }
                        };
                        apply_config(instance, &config, &new_config)?;
                        if new_config.heuristics.interval != config.heuristics.interval {
                            ticker = exec_ticker(new_config.heuristics.interval);
                        }
                        config = new_config;
                        info!("config reloaded");
                    }
                    SignalEvent::DumpStatus => {
                        info!(status = ?instance.status(), "current status");
                    }
                    SignalEvent::Shutdown => {
                        info!("shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn apply_config(
    instance: &mut HeuristicsInstance,
    current: &Config,
    new_config: &Config,
) -> anyhow::Result<()> {
    if new_config.advanced != current.advanced {
        warn!("advanced settings only take effect after a restart");
    }

    instance.apply_settings(&new_config.heuristics);

    let exec_list = ExecList::from(&new_config.heuristics);
    if exec_list.same_entries(instance.exec_list()) {
        debug!("heuristics exec list unchanged");
    } else {
        debug!(entries = exec_list.len(), "sending new heuristics exec list");
        instance.change_exec_list(Some(&exec_list), false)?;
    }
    Ok(())
}

fn exec_ticker(period: Duration) -> Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
