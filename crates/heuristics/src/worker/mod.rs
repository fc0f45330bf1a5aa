#![forbid(unsafe_code)]

//! The heuristics worker: runs exec batches on request from the parent.
//!
//! The worker reads commands from its command input, spawns one process
//! per exec list entry on `exec`, and answers with exactly one
//! `exec-result` per accepted `exec`: `Pass` once every process exited
//! successfully, `Fail` as soon as one failed or the deadline passed, and
//! `Disabled` right away when the exec list is empty. Only one batch is
//! live at a time; a new `exec` abandons the previous one.

pub mod log;

use crate::dynar::Dynar;
use crate::error::Error;
use crate::exec_list::ExecList;
use crate::exec_result::ExecResult;
use crate::io::{self, ReadStatus};
use crate::process_list::{NotifyReason, ProcessList, ProcessListEntry, Summary};
use crate::protocol::{self, Command};
use crate::timer::{TimerId, TimerKind, TimerList};
use config::Advanced;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigSet, Signal};
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub use self::log::WorkerLogLayer;

/// Upper bound on one poll wait, so process exits are noticed promptly.
pub const WORKER_MAX_POLL_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub ipc_max_size: usize,
    pub use_execvp: bool,
    pub max_processes: usize,
    pub kill_list_interval: Duration,
}

impl From<&Advanced> for WorkerSettings {
    fn from(advanced: &Advanced) -> Self {
        Self {
            ipc_max_size: advanced.ipc_max_send_receive_size,
            use_execvp: advanced.use_execvp,
            max_processes: advanced.max_processes,
            kill_list_interval: advanced.kill_list_interval,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&Advanced::default())
    }
}

#[derive(Debug)]
pub struct HeuristicsWorker {
    cmd_in: File,
    cmd_out: File,
    cmd_in_buffer: Dynar,
    cmd_out_buffer: Dynar,
    exec_list: ExecList,
    process_list: ProcessList,
    timers: TimerList,
    exec_timeout_timer: Option<TimerId>,
    last_exec_seq_number: u32,
    schedule_exit: bool,
}

impl HeuristicsWorker {
    pub fn new(settings: &WorkerSettings, cmd_in: File, cmd_out: File) -> Self {
        let process_list = ProcessList::new(
            settings.max_processes,
            settings.use_execvp,
            Some(Box::new(log_process_event)),
        );

        let mut timers = TimerList::new();
        timers.add_periodic(
            TimerKind::KillList,
            Instant::now(),
            settings.kill_list_interval,
        );

        debug!("Heuristics worker initialized");

        Self {
            cmd_in,
            cmd_out,
            cmd_in_buffer: Dynar::new(settings.ipc_max_size),
            cmd_out_buffer: Dynar::new(settings.ipc_max_size),
            exec_list: ExecList::new(),
            process_list,
            timers,
            exec_timeout_timer: None,
            last_exec_seq_number: 0,
            schedule_exit: false,
        }
    }

    pub fn exec_list(&self) -> &ExecList {
        &self.exec_list
    }

    pub fn process_list(&self) -> &ProcessList {
        &self.process_list
    }

    pub fn process_list_mut(&mut self) -> &mut ProcessList {
        &mut self.process_list
    }

    /// Poll until the parent goes away or a fatal error occurs.
    pub fn run(&mut self) -> Result<(), Error> {
        while self.poll_once()? {}
        Ok(())
    }

    /// One loop iteration. Returns `false` once the worker should exit.
    pub fn poll_once(&mut self) -> Result<bool, Error> {
        let wait = self
            .timers
            .time_to_expire(Instant::now())
            .map_or(WORKER_MAX_POLL_WAIT, |left| left.min(WORKER_MAX_POLL_WAIT));

        match wait_readable(self.cmd_in.as_fd(), wait) {
            Ok(Some(revents)) => {
                if revents.contains(PollFlags::POLLIN) {
                    self.cmd_read_from_pipe()?;
                } else if revents
                    .intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
                {
                    info!("Main process closed command pipe");
                    return Ok(false);
                }
            }
            Ok(None) | Err(Errno::EINTR) => {}
            Err(e) => return Err(e.into()),
        }

        self.process_list.waitpid()?;

        if self.exec_timeout_timer.is_some() {
            match self.process_list.summary_short() {
                Summary::Pending => {}
                Summary::Success => self.finish_batch(ExecResult::Pass)?,
                Summary::Failure => self.finish_batch(ExecResult::Fail)?,
            }
        }

        for (_, kind) in self.timers.expire(Instant::now()) {
            match kind {
                TimerKind::ExecTimeout => self.exec_timed_out(),
                TimerKind::KillList => self.kill_list_tick(),
            }
        }

        Ok(!self.schedule_exit)
    }

    fn cmd_read_from_pipe(&mut self) -> Result<(), Error> {
        match io::read_chunk(&mut self.cmd_in, &mut self.cmd_in_buffer) {
            Ok(ReadStatus::WouldBlock) => Ok(()),
            Ok(ReadStatus::Data) => self.cmd_process(),
            Err(Error::ConnectionLost) => {
                error!("Lost connection with main process");
                Err(Error::ConnectionLost)
            }
            Err(Error::BufferFull { max, .. }) => {
                error!("Main process sent too long command line");
                Err(Error::LineTooLong(max))
            }
            Err(e) => {
                error!("Unhandled error when reading from command input: {e}");
                Err(e)
            }
        }
    }

    fn cmd_process(&mut self) -> Result<(), Error> {
        while let Some(line) = protocol::take_line(&mut self.cmd_in_buffer) {
            let command = Command::parse(&line).inspect_err(|e| {
                error!("Can't process command from main process: {e}");
            })?;

            match command {
                Command::ExecListClear => {
                    debug!("Received exec-list-clear command");
                    self.exec_list.clear();
                }
                Command::ExecListAdd { name, command } => {
                    debug!(
                        "Received exec-list-add command with name {name:?} and command {command:?}"
                    );
                    self.exec_list.add(name, command);
                }
                Command::Exec { timeout_ms, seq } => {
                    debug!("Received exec command with seq_no {seq} and timeout {timeout_ms}");
                    self.exec(Duration::from_millis(u64::from(timeout_ms)), seq)?;
                }
                Command::ExecResult { .. } => {
                    error!("Main process sent unexpected command {line:?}");
                    return Err(Error::UnexpectedCommand(line));
                }
            }
        }
        Ok(())
    }

    fn exec(&mut self, timeout: Duration, seq: u32) -> Result<(), Error> {
        if let Some(timer) = self.exec_timeout_timer.take() {
            self.process_list.move_active_entries_to_kill_list();
            self.timers.delete(timer);
        }

        self.last_exec_seq_number = seq;

        if self.exec_list.is_empty() {
            return self.write_exec_result(seq, ExecResult::Disabled);
        }

        let mut added_all = true;
        for entry in &self.exec_list {
            if let Err(e) = self.process_list.add(&entry.name, &entry.command) {
                error!("Can't add {} to process list: {e}", entry.name);
                added_all = false;
                break;
            }
        }
        if !added_all {
            return self.abandon_batch();
        }

        if let Err(e) = self.process_list.exec_initialized() {
            error!("Can't execute process list: {e}");
            return self.abandon_batch();
        }

        self.exec_timeout_timer = Some(self.timers.add(
            TimerKind::ExecTimeout,
            Instant::now(),
            timeout,
        ));
        Ok(())
    }

    fn abandon_batch(&mut self) -> Result<(), Error> {
        self.process_list.move_active_entries_to_kill_list();
        self.write_exec_result(self.last_exec_seq_number, ExecResult::Fail)
    }

    fn finish_batch(&mut self, result: ExecResult) -> Result<(), Error> {
        self.write_exec_result(self.last_exec_seq_number, result)?;
        self.process_list.move_active_entries_to_kill_list();
        if let Some(timer) = self.exec_timeout_timer.take() {
            self.timers.delete(timer);
        }
        Ok(())
    }

    fn exec_timed_out(&mut self) {
        warn!("Not all heuristics execs finished on time");
        self.exec_timeout_timer = None;
        if let Err(e) = self.abandon_batch() {
            error!("Can't send exec result, shutting down worker: {e}");
            self.schedule_exit = true;
        }
    }

    fn kill_list_tick(&mut self) {
        if let Err(e) = self.process_list.process_kill_list() {
            error!("Process kill list failed, shutting down worker: {e}");
            self.schedule_exit = true;
            return;
        }

        let left = self.process_list.kill_list_len();
        if left > 0 {
            debug!("Still waiting for {left} processes exit");
        }
    }

    fn write_exec_result(&mut self, seq: u32, result: ExecResult) -> Result<(), Error> {
        use std::fmt::Write as _;

        self.cmd_out_buffer.clean();
        write!(self.cmd_out_buffer, "{}", Command::ExecResult { seq, result }).map_err(|_| {
            Error::BufferFull {
                needed: self.cmd_out_buffer.len(),
                max: self.cmd_out_buffer.max_size(),
            }
        })?;

        io::blocking_write(&mut self.cmd_out, self.cmd_out_buffer.as_bytes())?;
        self.cmd_out.flush()?;
        Ok(())
    }
}

fn log_process_event(reason: NotifyReason, entry: &ProcessListEntry) {
    match reason {
        NotifyReason::Executed => debug!("process {} executed", entry.name()),
        NotifyReason::Finished => match entry.exit_status() {
            Some(status) if status.success() => {
                debug!("process {} successfully finished", entry.name());
            }
            Some(status) => match (status.code(), status.signal()) {
                (Some(code), _) => warn!("process {} finished with status {code}", entry.name()),
                (None, Some(sig)) => warn!("process {} killed by signal {sig}", entry.name()),
                (None, None) => warn!("process {} finished with non zero status", entry.name()),
            },
            None => {}
        },
    }
}

fn wait_readable(fd: BorrowedFd<'_>, wait: Duration) -> Result<Option<PollFlags>, Errno> {
    let millis = u16::try_from(wait.as_millis()).unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];

    if poll(&mut fds, PollTimeout::from(millis))? == 0 {
        return Ok(None);
    }
    Ok(fds[0].revents())
}

/// Worker process entry point: serves the parent over stdin, stdout and
/// stderr until the command pipe closes, then kills what is left.
pub fn run(settings: &WorkerSettings) -> Result<(), Error> {
    // Interrupts are meant for the parent, which shuts the worker down by
    // closing the command pipe. Spawned commands start with a clean mask.
    let mut blocked = SigSet::empty();
    blocked.add(Signal::SIGPIPE);
    blocked.add(Signal::SIGINT);
    blocked.thread_block()?;

    let cmd_in = File::from(std::io::stdin().as_fd().try_clone_to_owned()?);
    let cmd_out = File::from(std::io::stdout().as_fd().try_clone_to_owned()?);
    let log_out: OwnedFd = std::io::stderr().as_fd().try_clone_to_owned()?;

    tracing_subscriber::registry()
        .with(WorkerLogLayer::new(File::from(log_out), settings.ipc_max_size))
        .try_init()
        .ok();

    let mut worker = HeuristicsWorker::new(settings, cmd_in, cmd_out);
    let res = worker.run();

    if let Err(e) = worker.process_list_mut().killall(settings.kill_list_interval) {
        error!("Can't kill all heuristics processes: {e}");
    }

    match res {
        Err(Error::ConnectionLost) | Ok(()) => Ok(()),
        Err(e) => Err(e),
    }
}
