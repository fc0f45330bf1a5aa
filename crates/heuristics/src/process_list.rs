#![forbid(unsafe_code)]

//! Supervisor for the external processes of one heuristics batch.
//!
//! Entries live on exactly one of two lists. The active list holds the
//! current batch; the kill list holds processes that were abandoned and
//! are being terminated with escalating signals (`SIGTERM`, then `SIGKILL`
//! until they are reaped). The total number of entries on both lists never
//! exceeds `max_entries`.

use crate::error::Error;
use crate::lex::split_command;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

const KILLALL_ROUNDS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Initialized,
    Running,
    Finished,
    SigtermSent,
    SigkillSent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyReason {
    Executed,
    Finished,
}

/// Outcome of the active batch so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Summary {
    /// Some processes have not finished (and, for the short variant, none
    /// of the finished ones failed).
    Pending,
    /// Every process exited with status zero.
    Success,
    /// At least one process exited with a non-zero status or on a signal.
    Failure,
}

pub type NotifyFn = Box<dyn FnMut(NotifyReason, &ProcessListEntry) + Send>;

#[derive(Debug)]
pub struct ProcessListEntry {
    name: String,
    argv: Vec<String>,
    state: EntryState,
    child: Option<Child>,
    exit_status: Option<ExitStatus>,
}

impl ProcessListEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    fn failed(&self) -> bool {
        !self.exit_status.is_some_and(|status| status.success())
    }

    fn spawn(&mut self, use_execvp: bool) -> Result<(), Error> {
        let program = &self.argv[0];
        let mut command = if use_execvp || program.contains('/') {
            Command::new(program)
        } else {
            // Without path lookup a bare name refers to the working directory.
            let mut command = Command::new(format!("./{program}"));
            command.arg0(program);
            command
        };

        let child = command
            .args(&self.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| Error::Spawn {
                name: self.name.clone(),
                program: program.clone(),
                source,
            })?;

        self.child = Some(child);
        self.state = EntryState::Running;
        Ok(())
    }

    /// Non-blocking reap. Returns true when the process has just exited
    /// while still in the `Running` state.
    fn try_reap(&mut self) -> Result<bool, Error> {
        if matches!(self.state, EntryState::Initialized | EntryState::Finished) {
            return Ok(false);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(false);
        };

        let status = child.try_wait().map_err(|source| Error::Wait {
            pid: child.id(),
            source,
        })?;
        let Some(status) = status else {
            return Ok(false);
        };

        let was_running = self.state == EntryState::Running;
        self.exit_status = Some(status);
        self.state = EntryState::Finished;
        Ok(was_running)
    }

    fn escalate(&mut self) -> Result<(), Error> {
        let (signal, next) = match self.state {
            EntryState::Running => (Signal::SIGTERM, EntryState::SigtermSent),
            EntryState::SigtermSent | EntryState::SigkillSent => {
                (Signal::SIGKILL, EntryState::SigkillSent)
            }
            EntryState::Initialized | EntryState::Finished => return Ok(()),
        };

        let Some(pid) = self.pid() else {
            return Ok(());
        };

        let res = kill(Pid::from_raw(pid as i32), signal);
        self.state = next;

        match res {
            Err(source @ (Errno::EPERM | Errno::EINVAL)) => Err(Error::Signal { pid, source }),
            _ => Ok(()),
        }
    }
}

pub struct ProcessList {
    active: Vec<ProcessListEntry>,
    to_kill: Vec<ProcessListEntry>,
    max_entries: usize,
    use_execvp: bool,
    notify_fn: Option<NotifyFn>,
}

impl ProcessList {
    pub fn new(max_entries: usize, use_execvp: bool, notify_fn: Option<NotifyFn>) -> Self {
        Self {
            active: Vec::new(),
            to_kill: Vec::new(),
            max_entries,
            use_execvp,
            notify_fn,
        }
    }

    /// Total number of entries on both lists.
    pub fn len(&self) -> usize {
        self.active.len() + self.to_kill.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active(&self) -> &[ProcessListEntry] {
        &self.active
    }

    pub fn kill_list(&self) -> &[ProcessListEntry] {
        &self.to_kill
    }

    pub fn kill_list_len(&self) -> usize {
        self.to_kill.len()
    }

    pub fn running_count(&self) -> usize {
        self.active
            .iter()
            .filter(|entry| entry.state == EntryState::Running)
            .count()
    }

    pub fn add(&mut self, name: &str, command: &str) -> Result<&ProcessListEntry, Error> {
        if self.len() >= self.max_entries {
            return Err(Error::ProcessListFull(self.max_entries));
        }

        // A quoted empty argument ("") stays in argv as an empty string.
        let argv = split_command(command);
        if argv.is_empty() {
            return Err(Error::EmptyCommand(command.to_owned()));
        }

        self.active.push(ProcessListEntry {
            name: name.to_owned(),
            argv,
            state: EntryState::Initialized,
            child: None,
            exit_status: None,
        });
        Ok(&self.active[self.active.len() - 1])
    }

    /// Start every entry still in the `Initialized` state. Stops at the
    /// first spawn failure; entries started before it keep running.
    pub fn exec_initialized(&mut self) -> Result<(), Error> {
        for entry in &mut self.active {
            if entry.state != EntryState::Initialized {
                continue;
            }

            entry.spawn(self.use_execvp)?;
            if let Some(notify) = self.notify_fn.as_mut() {
                notify(NotifyReason::Executed, &*entry);
            }
        }
        Ok(())
    }

    /// Reap exited processes. Active entries keep their exit status; kill
    /// list entries are dropped once reaped.
    pub fn waitpid(&mut self) -> Result<(), Error> {
        for entry in &mut self.active {
            if entry.try_reap()? {
                if let Some(notify) = self.notify_fn.as_mut() {
                    notify(NotifyReason::Finished, &*entry);
                }
            }
        }

        for entry in &mut self.to_kill {
            entry.try_reap()?;
        }
        self.to_kill
            .retain(|entry| entry.state != EntryState::Finished);

        Ok(())
    }

    pub fn summary(&self) -> Summary {
        let mut res = Summary::Success;
        for entry in &self.active {
            if entry.state != EntryState::Finished {
                return Summary::Pending;
            }
            if entry.failed() {
                res = Summary::Failure;
            }
        }
        res
    }

    /// Like [`summary`](Self::summary) but reports `Failure` as soon as any
    /// finished process failed, even while others still run.
    pub fn summary_short(&self) -> Summary {
        let mut res = Summary::Success;
        for entry in &self.active {
            if entry.state == EntryState::Finished {
                if entry.failed() {
                    return Summary::Failure;
                }
            } else {
                res = Summary::Pending;
            }
        }
        res
    }

    /// Abandon the active batch. Processes that never started or already
    /// finished are dropped; the rest go to the kill list.
    pub fn move_active_entries_to_kill_list(&mut self) {
        for entry in self.active.drain(..) {
            if !matches!(entry.state, EntryState::Initialized | EntryState::Finished) {
                self.to_kill.push(entry);
            }
        }
    }

    /// Reap, then send every remaining kill list entry its next signal.
    pub fn process_kill_list(&mut self) -> Result<(), Error> {
        self.waitpid()?;

        for entry in &mut self.to_kill {
            entry.escalate()?;
        }
        Ok(())
    }

    /// Terminate everything, waiting at most about `timeout`.
    pub fn killall(&mut self, timeout: Duration) -> Result<(), Error> {
        self.move_active_entries_to_kill_list();

        let action_timeout = (timeout / KILLALL_ROUNDS as u32).max(Duration::from_millis(1));

        for _ in 0..KILLALL_ROUNDS {
            self.process_kill_list()?;
        }

        for _ in 0..KILLALL_ROUNDS {
            if self.to_kill.is_empty() {
                break;
            }
            self.process_kill_list()?;
            std::thread::sleep(action_timeout);
        }

        if !self.to_kill.is_empty() {
            return Err(Error::ProcessesLeft(self.to_kill.len()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProcessList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessList")
            .field("active", &self.active)
            .field("to_kill", &self.to_kill)
            .field("max_entries", &self.max_entries)
            .field("use_execvp", &self.use_execvp)
            .finish_non_exhaustive()
    }
}
