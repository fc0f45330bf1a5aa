use flume::Sender;
use tokio::signal::unix::{SignalKind, signal};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGHUP: reload the configuration.
    Reload,
    /// SIGUSR1: log the current status.
    DumpStatus,
    /// SIGINT or SIGTERM: stop the worker and exit.
    Shutdown,
}

/// Translate process signals into [`SignalEvent`]s until the receiver goes
/// away.
pub async fn wait_for_signal(tx: Sender<SignalEvent>) -> anyhow::Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut user1 = signal(SignalKind::user_defined1())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        let event = tokio::select! {
            _ = hangup.recv() => SignalEvent::Reload,
            _ = user1.recv() => SignalEvent::DumpStatus,
            _ = interrupt.recv() => SignalEvent::Shutdown,
            _ = terminate.recv() => SignalEvent::Shutdown,
        };
        debug!(?event, "received signal");

        if tx.send_async(event).await.is_err() {
            return Ok(());
        }
    }
}
