#![forbid(unsafe_code)]

pub mod dynar;
pub mod error;
pub mod exec_list;
pub mod exec_result;
pub mod instance;
pub mod io;
pub mod lex;
pub mod notifier;
pub mod process_list;
pub mod protocol;
pub mod send_buffer;
pub mod timer;
pub mod worker;

pub use dynar::Dynar;
pub use error::Error;
pub use exec_list::{ExecList, ExecListEntry};
pub use exec_result::ExecResult;
pub use instance::{HeuristicsInstance, HeuristicsStatus, WorkerPipes};
pub use notifier::{NotifierCallback, NotifierId, ResultNotifierList};
pub use process_list::{EntryState, NotifyReason, ProcessList, ProcessListEntry, Summary};
pub use protocol::{Command, LogLine};
pub use send_buffer::{SendBuffer, SendBufferList};
pub use timer::{TimerId, TimerKind, TimerList};
pub use worker::{HeuristicsWorker, WorkerLogLayer, WorkerSettings};
