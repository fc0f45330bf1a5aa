#![forbid(unsafe_code)]

use heuristics::io::pipe;
use heuristics::{Command, Error, ExecResult, HeuristicsWorker, WorkerSettings};
use pretty_assertions::assert_eq;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::thread::{JoinHandle, sleep};
use std::time::{Duration, Instant};

struct Harness {
    to_worker: Option<File>,
    from_worker: BufReader<File>,
    handle: JoinHandle<(HeuristicsWorker, Result<(), Error>)>,
}

impl Harness {
    fn start() -> Self {
        let settings = WorkerSettings {
            use_execvp: true,
            kill_list_interval: Duration::from_millis(200),
            ..Default::default()
        };
        let (cmd_in, to_worker) = pipe().unwrap();
        let (from_worker, cmd_out) = pipe().unwrap();

        let handle = std::thread::spawn(move || {
            let mut worker = HeuristicsWorker::new(&settings, cmd_in, cmd_out);
            let res = worker.run();
            worker
                .process_list_mut()
                .killall(settings.kill_list_interval)
                .unwrap();
            (worker, res)
        });

        Self {
            to_worker: Some(to_worker),
            from_worker: BufReader::new(from_worker),
            handle,
        }
    }

    fn send(&mut self, commands: &[Command]) {
        let to_worker = self.to_worker.as_mut().unwrap();
        for command in commands {
            to_worker.write_all(command.to_string().as_bytes()).unwrap();
        }
    }

    fn send_raw(&mut self, raw: &str) {
        self.to_worker
            .as_mut()
            .unwrap()
            .write_all(raw.as_bytes())
            .unwrap();
    }

    fn recv(&mut self) -> Command {
        let mut line = String::new();
        self.from_worker.read_line(&mut line).unwrap();
        Command::parse(line.trim_end()).unwrap()
    }

    fn finish(mut self) -> (HeuristicsWorker, Result<(), Error>) {
        self.to_worker = None;
        self.handle.join().unwrap()
    }
}

fn add(name: &str, command: &str) -> Command {
    Command::ExecListAdd {
        name: name.to_owned(),
        command: command.to_owned(),
    }
}

fn exec(timeout_ms: u32, seq: u32) -> Command {
    Command::Exec { timeout_ms, seq }
}

fn result(seq: u32, result: ExecResult) -> Command {
    Command::ExecResult { seq, result }
}

#[test]
fn empty_exec_list_is_disabled() {
    let mut harness = Harness::start();
    harness.send_raw("exec-list-clear\nexec 1000 5\n");
    assert_eq!(harness.recv(), result(5, ExecResult::Disabled));

    let (worker, res) = harness.finish();
    assert!(matches!(res, Ok(()) | Err(Error::ConnectionLost)));
    assert!(worker.exec_list().is_empty());
}

#[test]
fn passing_and_failing_batches() {
    let mut harness = Harness::start();
    harness.send(&[add("ok", "/bin/true"), exec(5000, 1)]);
    assert_eq!(harness.recv(), result(1, ExecResult::Pass));

    harness.send(&[add("bad", "false"), exec(5000, 2)]);
    assert_eq!(harness.recv(), result(2, ExecResult::Fail));

    harness.send(&[Command::ExecListClear, add("quoted", r#"sh -c "exit 0""#)]);
    harness.send(&[exec(5000, 3)]);
    assert_eq!(harness.recv(), result(3, ExecResult::Pass));

    let (worker, _) = harness.finish();
    assert_eq!(worker.exec_list().len(), 1);
    assert!(worker.process_list().is_empty());
}

#[test]
fn hanging_exec_fails_on_timeout() {
    let mut harness = Harness::start();
    harness.send(&[add("hang", "sleep 10"), exec(200, 9)]);

    let started = Instant::now();
    assert_eq!(harness.recv(), result(9, ExecResult::Fail));
    assert!(started.elapsed() < Duration::from_secs(3));

    let (worker, _) = harness.finish();
    assert!(worker.process_list().is_empty());
}

#[test]
fn new_exec_supersedes_running_batch() {
    let mut harness = Harness::start();
    harness.send(&[add("hang", "sleep 10"), exec(5000, 1)]);
    harness.send(&[Command::ExecListClear, add("ok", "true"), exec(5000, 2)]);

    // Seq 1 is abandoned without an answer.
    assert_eq!(harness.recv(), result(2, ExecResult::Pass));

    let (worker, _) = harness.finish();
    assert!(worker.process_list().is_empty());
}

#[test]
fn spawn_failure_fails_the_batch() {
    let mut harness = Harness::start();
    harness.send(&[add("missing", "/nonexistent/heuristic"), exec(5000, 4)]);
    assert_eq!(harness.recv(), result(4, ExecResult::Fail));
    harness.finish();
}

#[test]
fn unknown_command_stops_the_worker() {
    let mut harness = Harness::start();
    harness.send_raw("frobnicate\n");

    let (_, res) = harness.finish();
    assert!(matches!(res, Err(Error::UnknownCommand(_))));
}

#[test]
fn exec_result_from_parent_stops_the_worker() {
    let mut harness = Harness::start();
    harness.send(&[result(1, ExecResult::Pass)]);

    let (_, res) = harness.finish();
    assert!(matches!(res, Err(Error::UnexpectedCommand(_))));
}

#[test]
fn long_command_lines_near_the_size_limit_are_accepted() {
    let mut harness = Harness::start();

    let pre = format!("exec-list-add pre /bin/true {}\n", "p".repeat(171));
    let long = format!("exec-list-add ok /bin/true {}\n", "a".repeat(3950));
    assert_eq!(pre.len(), 199);
    assert_eq!(long.len(), 3978);

    // The long line starts at an offset that is not a multiple of the
    // read size, so its end never lines up with a read boundary.
    harness.send_raw(&pre);
    harness.send_raw(&long);
    harness.send(&[exec(5000, 1)]);
    assert_eq!(harness.recv(), result(1, ExecResult::Pass));

    for _ in 0..10 {
        harness.send(&[Command::ExecListClear]);
    }
    harness.send(&[add("ok", "/bin/true"), exec(5000, 2)]);
    assert_eq!(harness.recv(), result(2, ExecResult::Pass));

    let (worker, res) = harness.finish();
    assert!(matches!(res, Ok(()) | Err(Error::ConnectionLost)));
    assert_eq!(worker.exec_list().len(), 1);
}

#[test]
fn kill_list_is_drained_without_new_execs() {
    let settings = WorkerSettings {
        use_execvp: true,
        kill_list_interval: Duration::from_millis(100),
        ..Default::default()
    };
    let (cmd_in, mut to_worker) = pipe().unwrap();
    let (from_worker, cmd_out) = pipe().unwrap();
    let mut worker = HeuristicsWorker::new(&settings, cmd_in, cmd_out);

    let stubborn = add("stubborn", r#"/bin/sh -c "trap '' TERM; exec sleep 10""#);
    for command in [stubborn, exec(300, 7)] {
        to_worker.write_all(command.to_string().as_bytes()).unwrap();
    }

    let started = Instant::now();
    let mut abandoned = false;
    while started.elapsed() < Duration::from_secs(10) {
        assert!(worker.process_list().len() <= 1);
        assert!(worker.poll_once().unwrap(), "worker must keep running");
        abandoned |= worker.process_list().kill_list_len() == 1;
        if abandoned && worker.process_list().is_empty() {
            break;
        }
        sleep(Duration::from_millis(10));
    }

    assert!(abandoned, "timed out exec must move to the kill list");
    assert!(worker.process_list().is_empty());

    let mut reply = String::new();
    BufReader::new(from_worker).read_line(&mut reply).unwrap();
    assert_eq!(
        Command::parse(reply.trim_end()).unwrap(),
        result(7, ExecResult::Fail)
    );
    drop(to_worker);
}
