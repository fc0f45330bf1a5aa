use crate::exec_result::ExecResult;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Buffer capacity exceeded: {needed} bytes needed, {max} allowed")]
    BufferFull { needed: usize, max: usize },

    #[error("Send buffer list is full ({0} entries)")]
    SendQueueFull(usize),

    #[error("Process list is full ({0} entries)")]
    ProcessListFull(usize),

    #[error("Command {0:?} contains no arguments")]
    EmptyCommand(String),

    #[error("Line exceeds the maximum message size of {0} bytes")]
    LineTooLong(usize),

    #[error("Malformed line {line:?}: {reason}")]
    Malformed { line: String, reason: &'static str },

    #[error("Unknown command {0:?}")]
    UnknownCommand(String),

    #[error("Unexpected command {0:?} on this channel")]
    UnexpectedCommand(String),

    #[error("Peer closed the connection")]
    ConnectionLost,

    #[error("Write to peer returned zero bytes")]
    ZeroWrite,

    #[error("Failed to spawn {name} ({program}): {source}")]
    Spawn {
        name: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for process {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::Error,
    },

    #[error("Not all processes exited ({0} left)")]
    ProcessesLeft(usize),

    #[error("Unknown result notifier")]
    UnknownNotifier,

    #[error("Result notifier {name} failed for seq {seq} ({result}): {reason}")]
    Notifier {
        name: &'static str,
        seq: u32,
        result: ExecResult,
        reason: String,
    },

    #[error("Timed out after {0:?} waiting for heuristics result")]
    Timeout(Duration),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Capacity errors are answered by refusing the request; everything else
    /// tears down the channel or loop it happened on.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::BufferFull { .. }
                | Self::SendQueueFull(_)
                | Self::ProcessListFull(_)
                | Self::EmptyCommand(_)
        )
    }
}
