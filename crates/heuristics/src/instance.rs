#![forbid(unsafe_code)]

//! Parent side of the heuristics engine.
//!
//! [`HeuristicsInstance`] owns the pipes to the worker, queues commands for
//! it, matches `exec-result` replies against the outstanding request and
//! hands accepted verdicts to the registered notifiers. It never blocks on
//! its own: the surrounding loop reports readiness through
//! [`cmd_read_from_pipe`](HeuristicsInstance::cmd_read_from_pipe),
//! [`log_read_from_pipe`](HeuristicsInstance::log_read_from_pipe) and
//! [`cmd_write`](HeuristicsInstance::cmd_write), or drives everything with
//! [`poll_once`](HeuristicsInstance::poll_once).

use crate::dynar::Dynar;
use crate::error::Error;
use crate::exec_list::ExecList;
use crate::exec_result::ExecResult;
use crate::io::{self, ReadStatus, WriteStatus};
use crate::notifier::ResultNotifierList;
use crate::protocol::{self, Command, LogLine};
use crate::send_buffer::SendBufferList;
use config::{Config, Heuristics, HeuristicsMode};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::ffi::OsStr;
use std::fmt::Write as _;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{Level, debug, error, info, trace, warn};

/// The parent's ends of the three worker pipes.
#[derive(Debug)]
pub struct WorkerPipes {
    /// Commands to the worker (its stdin).
    pub cmd_send: File,
    /// Results from the worker (its stdout).
    pub cmd_recv: File,
    /// Log lines from the worker (its stderr).
    pub log_recv: File,
}

/// Snapshot for the status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicsStatus {
    pub mode: HeuristicsMode,
    pub timeout: Duration,
    pub sync_timeout: Duration,
    pub interval: Duration,
    pub exec_list: ExecList,
    pub waiting_for_result: bool,
    pub expected_reply_seq_number: u32,
    pub last_result: Option<(u32, ExecResult)>,
}

#[derive(Debug)]
pub struct HeuristicsInstance {
    cmd_send: Option<File>,
    cmd_recv: File,
    log_recv: File,
    worker: Option<Child>,
    cmd_out_buffer_list: SendBufferList,
    cmd_in_buffer: Dynar,
    log_in_buffer: Dynar,
    /// Set after an overlong log line; its tail is dropped when it ends.
    log_skip_line: bool,
    mode: HeuristicsMode,
    timeout: Duration,
    sync_timeout: Duration,
    interval: Duration,
    waiting_for_result: bool,
    expected_reply_seq_number: u32,
    exec_list: ExecList,
    notifiers: ResultNotifierList,
    last_result: Option<(u32, ExecResult)>,
}

impl HeuristicsInstance {
    /// Wrap already connected pipes. All three are switched to non-blocking
    /// mode.
    pub fn new(config: &Config, pipes: WorkerPipes) -> Result<Self, Error> {
        io::set_nonblocking(&pipes.cmd_send)?;
        io::set_nonblocking(&pipes.cmd_recv)?;
        io::set_nonblocking(&pipes.log_recv)?;

        let advanced = &config.advanced;
        let heuristics = &config.heuristics;

        Ok(Self {
            cmd_send: Some(pipes.cmd_send),
            cmd_recv: pipes.cmd_recv,
            log_recv: pipes.log_recv,
            worker: None,
            cmd_out_buffer_list: SendBufferList::new(
                advanced.ipc_max_send_buffers,
                advanced.ipc_max_send_receive_size,
            ),
            cmd_in_buffer: Dynar::new(advanced.ipc_max_send_receive_size),
            log_in_buffer: Dynar::new(advanced.ipc_max_send_receive_size),
            log_skip_line: false,
            mode: heuristics.mode,
            timeout: heuristics.timeout,
            sync_timeout: heuristics.sync_timeout,
            interval: heuristics.interval,
            waiting_for_result: false,
            expected_reply_seq_number: 0,
            exec_list: ExecList::new(),
            notifiers: ResultNotifierList::new(),
            last_result: None,
        })
    }

    /// Start `program args...` as the worker process, connected through its
    /// standard descriptors. The worker gets its own process group so
    /// terminal signals reach only the parent.
    pub fn spawn_worker<I, S>(program: &Path, args: I, config: &Config) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut child = std::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|source| Error::Spawn {
                name: "heuristics worker".to_owned(),
                program: program.display().to_string(),
                source,
            })?;

        let pipes = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => WorkerPipes {
                cmd_send: File::from(OwnedFd::from(stdin)),
                cmd_recv: File::from(OwnedFd::from(stdout)),
                log_recv: File::from(OwnedFd::from(stderr)),
            },
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::ConnectionLost);
            }
        };

        debug!(pid = child.id(), "heuristics worker started");

        let mut instance = Self::new(config, pipes)?;
        instance.worker = Some(child);
        Ok(instance)
    }

    /// Take over mode, timeouts and interval from a (re)loaded configuration.
    /// The exec list is changed separately with
    /// [`change_exec_list`](Self::change_exec_list).
    pub fn apply_settings(&mut self, heuristics: &Heuristics) {
        self.mode = heuristics.mode;
        self.timeout = heuristics.timeout;
        self.sync_timeout = heuristics.sync_timeout;
        self.interval = heuristics.interval;
    }

    pub fn mode(&self) -> HeuristicsMode {
        self.mode
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn sync_timeout(&self) -> Duration {
        self.sync_timeout
    }

    pub fn waiting_for_result(&self) -> bool {
        self.waiting_for_result
    }

    pub fn expected_reply_seq_number(&self) -> u32 {
        self.expected_reply_seq_number
    }

    /// Copy of the last exec list sent to the worker.
    pub fn exec_list(&self) -> &ExecList {
        &self.exec_list
    }

    pub fn last_result(&self) -> Option<(u32, ExecResult)> {
        self.last_result
    }

    pub fn notifiers_mut(&mut self) -> &mut ResultNotifierList {
        &mut self.notifiers
    }

    pub fn has_pending_output(&self) -> bool {
        !self.cmd_out_buffer_list.is_empty()
    }

    pub fn cmd_send_fd(&self) -> Option<RawFd> {
        self.cmd_send.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn cmd_recv_fd(&self) -> RawFd {
        self.cmd_recv.as_raw_fd()
    }

    pub fn log_recv_fd(&self) -> RawFd {
        self.log_recv.as_raw_fd()
    }

    pub fn status(&self) -> HeuristicsStatus {
        HeuristicsStatus {
            mode: self.mode,
            timeout: self.timeout,
            sync_timeout: self.sync_timeout,
            interval: self.interval,
            exec_list: self.exec_list.clone(),
            waiting_for_result: self.waiting_for_result,
            expected_reply_seq_number: self.expected_reply_seq_number,
            last_result: self.last_result,
        }
    }

    /// Request a new verdict. Any result still outstanding is superseded.
    pub fn exec(&mut self, sync_in_progress: bool) -> Result<(), Error> {
        self.expected_reply_seq_number = self.expected_reply_seq_number.wrapping_add(1);
        self.waiting_for_result = true;

        let timeout = if sync_in_progress {
            self.sync_timeout
        } else {
            self.timeout
        };

        self.queue(Command::Exec {
            timeout_ms: u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX),
            seq: self.expected_reply_seq_number,
        })
    }

    /// Replace the worker's exec list. An outstanding request is re-issued
    /// so its verdict reflects the new list.
    pub fn change_exec_list(
        &mut self,
        new_exec_list: Option<&ExecList>,
        sync_in_progress: bool,
    ) -> Result<(), Error> {
        self.queue(Command::ExecListClear)?;

        if let Some(new_exec_list) = new_exec_list {
            for entry in new_exec_list {
                self.queue(Command::ExecListAdd {
                    name: entry.name.clone(),
                    command: entry.command.clone(),
                })?;
            }
        }

        self.exec_list = new_exec_list.cloned().unwrap_or_default();

        if self.waiting_for_result {
            self.exec(sync_in_progress).inspect_err(|e| {
                error!("Can't execute heuristics: {e}");
            })?;
        }
        Ok(())
    }

    fn queue(&mut self, command: Command) -> Result<(), Error> {
        let Some(mut entry) = self.cmd_out_buffer_list.get_new() else {
            error!("Can't alloc send buffer for command to heuristics worker");
            return Err(Error::SendQueueFull(self.cmd_out_buffer_list.pending_len()));
        };

        if write!(entry.buffer, "{command}").is_err() {
            error!("Command to heuristics worker does not fit into send buffer");
            let needed = command.to_string().len();
            let max = entry.buffer.max_size();
            self.cmd_out_buffer_list.discard_new(entry);
            return Err(Error::BufferFull { needed, max });
        }

        trace!(command = %command.to_string().trim_end(), "queued");
        self.cmd_out_buffer_list.put(entry);
        Ok(())
    }

    /// Write queued commands until the pipe is full or the queue is empty.
    pub fn cmd_write(&mut self) -> Result<(), Error> {
        let Some(cmd_send) = self.cmd_send.as_mut() else {
            return Err(Error::ConnectionLost);
        };

        while let Some(active) = self.cmd_out_buffer_list.get_active() {
            match io::write_chunk(cmd_send, active) {
                Ok(WriteStatus::Complete) => self.cmd_out_buffer_list.delete(),
                Ok(WriteStatus::Partial) => {}
                Ok(WriteStatus::WouldBlock) => break,
                Err(e) => {
                    error!("Unhandled error when sending message to heuristics worker: {e}");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Drain the result pipe and process every complete line.
    pub fn cmd_read_from_pipe(&mut self) -> Result<(), Error> {
        loop {
            match io::read_chunk(&mut self.cmd_recv, &mut self.cmd_in_buffer) {
                Ok(ReadStatus::WouldBlock) => return Ok(()),
                Ok(ReadStatus::Data) => self.cmd_process()?,
                Err(Error::ConnectionLost) => {
                    error!("Lost connection with heuristics worker");
                    return Err(Error::ConnectionLost);
                }
                Err(Error::BufferFull { max, .. }) => {
                    error!("Heuristics worker sent too long cmd");
                    return Err(Error::LineTooLong(max));
                }
                Err(e) => {
                    error!("Unhandled error when reading from heuristics worker cmd fd: {e}");
                    return Err(e);
                }
            }
        }
    }

    fn cmd_process(&mut self) -> Result<(), Error> {
        while let Some(line) = protocol::take_line(&mut self.cmd_in_buffer) {
            match Command::parse(&line) {
                Ok(Command::ExecResult { seq, result }) => self.process_exec_result(seq, result)?,
                Ok(_) => {
                    error!("Heuristics worker sent unexpected command {line:?}");
                    return Err(Error::UnexpectedCommand(line));
                }
                Err(e) => {
                    error!("Heuristics worker sent unparsable command: {e}");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn process_exec_result(&mut self, seq: u32, result: ExecResult) -> Result<(), Error> {
        debug!("Received heuristics exec result command with seq_no {seq} and result {result}");

        if !self.waiting_for_result {
            debug!("Received exec result is not expected. Ignoring.");
            return Ok(());
        }

        if seq != self.expected_reply_seq_number {
            debug!(
                "Received heuristics exec result seq number {seq} is not expected one \
                 (expected {}). Ignoring.",
                self.expected_reply_seq_number
            );
            return Ok(());
        }

        self.waiting_for_result = false;
        self.last_result = Some((seq, result));
        self.notifiers.notify(seq, result)
    }

    /// Drain the log pipe and re-emit every complete worker log line.
    pub fn log_read_from_pipe(&mut self) -> Result<(), Error> {
        loop {
            match io::read_chunk(&mut self.log_recv, &mut self.log_in_buffer) {
                Ok(ReadStatus::WouldBlock) => return Ok(()),
                Ok(ReadStatus::Data) => self.log_process()?,
                Err(Error::ConnectionLost) => {
                    error!("Lost connection with heuristics worker");
                    return Err(Error::ConnectionLost);
                }
                Err(Error::BufferFull { .. }) => {
                    error!("Heuristics worker sent too long log. Ignoring line");
                    self.log_in_buffer.clean();
                    self.log_skip_line = true;
                }
                Err(e) => {
                    error!("Unhandled error when reading from heuristics worker log fd: {e}");
                    return Err(e);
                }
            }
        }
    }

    fn log_process(&mut self) -> Result<(), Error> {
        while let Some(line) = protocol::take_line(&mut self.log_in_buffer) {
            if std::mem::take(&mut self.log_skip_line) {
                continue;
            }
            let line = LogLine::parse(&line).inspect_err(|e| {
                error!("Parsing of heuristics log line failed: {e}");
            })?;
            emit_worker_log(&line);
        }
        Ok(())
    }

    /// Wait up to `timeout` for pipe activity and handle it. Returns
    /// whether anything was ready.
    pub fn poll_once(&mut self, timeout: Duration) -> Result<bool, Error> {
        const LOG: usize = 0;
        const CMD_RECV: usize = 1;
        const CMD_SEND: usize = 2;

        let want_write = self.has_pending_output() && self.cmd_send.is_some();
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);

        let revents: Vec<PollFlags> = {
            let mut fds = vec![
                PollFd::new(self.log_recv.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.cmd_recv.as_fd(), PollFlags::POLLIN),
            ];
            if let (true, Some(cmd_send)) = (want_write, self.cmd_send.as_ref()) {
                fds.push(PollFd::new(cmd_send.as_fd(), PollFlags::POLLOUT));
            }

            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(0) | Err(Errno::EINTR) => return Ok(false),
                Ok(_) => fds
                    .iter()
                    .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
                    .collect(),
                Err(e) => return Err(e.into()),
            }
        };

        let closed = PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
        for (i, flags) in revents.iter().enumerate() {
            if flags.contains(PollFlags::POLLIN) {
                match i {
                    LOG => self.log_read_from_pipe()?,
                    CMD_RECV => self.cmd_read_from_pipe()?,
                    _ => {}
                }
            }

            if flags.contains(PollFlags::POLLOUT) && i == CMD_SEND {
                self.cmd_write()?;
            }

            if flags.intersects(closed) && !flags.intersects(PollFlags::POLLIN | PollFlags::POLLOUT)
            {
                // A closed pipe is not always reported as readable; read the
                // log so the worker's last words are not lost.
                let _ = self.log_read_from_pipe();
                error!("POLLERR ({i}) on heuristics pipe");
                return Err(Error::ConnectionLost);
            }
        }

        Ok(revents.iter().any(|flags| !flags.is_empty()))
    }

    /// Drive the pipes until the outstanding request is answered.
    pub fn wait_for_result(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(u32, ExecResult)>, Error> {
        let deadline = Instant::now() + timeout;

        while self.waiting_for_result {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                error!("Timeout waiting for heuristics exec result");
                return Err(Error::Timeout(timeout));
            }
            self.poll_once(left)?;
        }

        Ok(self.last_result)
    }

    /// Stop the worker: closing the command pipe makes it exit. Its exit is
    /// awaited and its remaining log lines are re-emitted.
    pub fn shutdown(&mut self) -> Result<Option<ExitStatus>, Error> {
        self.cmd_send = None;

        let Some(mut worker) = self.worker.take() else {
            return Ok(None);
        };

        debug!("Waiting for heuristics worker to finish");
        let status = worker.wait().map_err(|source| Error::Wait {
            pid: worker.id(),
            source,
        });

        match status {
            Ok(status) => {
                // Errors only mean the log was already drained.
                let _ = self.log_read_from_pipe();
                if !status.success() {
                    warn!(%status, "heuristics worker exited");
                }
                Ok(Some(status))
            }
            Err(e) => {
                error!("Heuristics worker waitpid failed: {e}");
                Err(e)
            }
        }
    }
}

impl Drop for HeuristicsInstance {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn emit_worker_log(line: &LogLine) {
    let message = line.message.as_str();
    match line.level() {
        Level::ERROR => error!(target: "worker", "{message}"),
        Level::WARN => warn!(target: "worker", "{message}"),
        Level::INFO => info!(target: "worker", "{message}"),
        _ => debug!(target: "worker", "{message}"),
    }
}
