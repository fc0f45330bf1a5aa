use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Advanced {
    /// Maximum number of command messages queued for the heuristics worker
    /// before new requests are refused.
    pub ipc_max_send_buffers: usize,

    /// Maximum size of a single message exchanged with the heuristics
    /// worker, in bytes. A line longer than this is a framing error.
    pub ipc_max_send_receive_size: usize,

    /// Lowest accepted `timeout` and `sync_timeout`. **Measured in
    /// milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub min_timeout: Duration,

    /// Highest accepted `timeout` and `sync_timeout`. **Measured in
    /// milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub max_timeout: Duration,

    /// Lowest accepted `interval`. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub min_interval: Duration,

    /// Highest accepted `interval`. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub max_interval: Duration,

    /// Maximum number of configured heuristics execs.
    pub max_execs: usize,

    /// Resolve commands without a slash through `PATH`. When disabled, the
    /// first argument is used as an exact path.
    pub use_execvp: bool,

    /// Maximum number of processes the worker supervises at once, counting
    /// both running heuristics and processes still being killed.
    pub max_processes: usize,

    /// How often the worker escalates signals to processes it is killing.
    /// **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub kill_list_interval: Duration,
}

impl Default for Advanced {
    fn default() -> Self {
        Self {
            ipc_max_send_buffers: 128,
            ipc_max_send_receive_size: 4 * 1024,
            min_timeout: Duration::from_millis(1_000),
            max_timeout: Duration::from_millis(2 * 60 * 1_000),
            min_interval: Duration::from_millis(1_000),
            max_interval: Duration::from_millis(2 * 60 * 60 * 1_000),
            max_execs: 32,
            use_execvp: false,
            max_processes: 160,
            kill_list_interval: Duration::from_millis(5_000),
        }
    }
}
