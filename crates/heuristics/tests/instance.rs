#![forbid(unsafe_code)]

use config::Config;
use heuristics::io::pipe;
use heuristics::{Error, ExecList, ExecListEntry, ExecResult, HeuristicsInstance, WorkerPipes};
use pretty_assertions::assert_eq;
use std::fs::File;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const POLL: Duration = Duration::from_millis(500);

/// Worker ends of the three pipes.
struct FakeWorker {
    cmd_in: File,
    cmd_out: File,
    log_out: File,
}

fn connect(config: &Config) -> (HeuristicsInstance, FakeWorker) {
    let (worker_cmd_in, cmd_send) = pipe().unwrap();
    let (cmd_recv, worker_cmd_out) = pipe().unwrap();
    let (log_recv, worker_log_out) = pipe().unwrap();

    let instance = HeuristicsInstance::new(
        config,
        WorkerPipes {
            cmd_send,
            cmd_recv,
            log_recv,
        },
    )
    .unwrap();

    let worker = FakeWorker {
        cmd_in: worker_cmd_in,
        cmd_out: worker_cmd_out,
        log_out: worker_log_out,
    };
    (instance, worker)
}

type Seen = Arc<Mutex<Vec<(u32, ExecResult)>>>;

fn record_results(instance: &mut HeuristicsInstance) -> Seen {
    let seen = Seen::default();
    let sink = Arc::clone(&seen);
    let notifiers = instance.notifiers_mut();
    let id = notifiers.add(
        "record",
        Box::new(move |seq, result| {
            sink.lock().unwrap().push((seq, result));
            Ok(())
        }),
    );
    notifiers.set_active(id, true).unwrap();
    seen
}

/// Everything the instance wrote, once it is gone.
fn sent_commands(instance: HeuristicsInstance, mut worker: FakeWorker) -> String {
    drop(instance);
    let mut sent = String::new();
    worker.cmd_in.read_to_string(&mut sent).unwrap();
    sent
}

#[test]
fn exec_uses_normal_or_sync_timeout() {
    let (mut instance, worker) = connect(&Config::default());

    instance.exec(false).unwrap();
    instance.exec(true).unwrap();
    assert!(instance.has_pending_output());
    assert_eq!(instance.expected_reply_seq_number(), 2);
    assert!(instance.waiting_for_result());

    instance.cmd_write().unwrap();
    assert!(!instance.has_pending_output());

    assert_eq!(
        sent_commands(instance, worker),
        "exec 5000 1\nexec 15000 2\n"
    );
}

#[test]
fn changing_exec_list_reissues_outstanding_exec() {
    let (mut instance, worker) = connect(&Config::default());
    let list: ExecList = [("a", "/bin/true"), ("b", "/usr/bin/ping -c 1 gw")]
        .into_iter()
        .map(|(name, command)| ExecListEntry::new(name, command))
        .collect();

    instance.change_exec_list(Some(&list), false).unwrap();
    assert_eq!(instance.expected_reply_seq_number(), 0);

    instance.exec(false).unwrap();
    instance.change_exec_list(None, false).unwrap();
    assert_eq!(instance.expected_reply_seq_number(), 2);
    assert!(instance.exec_list().is_empty());

    instance.cmd_write().unwrap();
    assert_eq!(
        sent_commands(instance, worker),
        "exec-list-clear\n\
         exec-list-add a /bin/true\n\
         exec-list-add b /usr/bin/ping -c 1 gw\n\
         exec 5000 1\n\
         exec-list-clear\n\
         exec 5000 2\n"
    );
}

#[test]
fn full_send_queue_refuses_commands() {
    let mut config = Config::default();
    config.advanced.ipc_max_send_buffers = 2;
    let (mut instance, _worker) = connect(&config);

    instance.exec(false).unwrap();
    instance.exec(false).unwrap();
    assert!(matches!(instance.exec(false), Err(Error::SendQueueFull(_))));

    instance.cmd_write().unwrap();
    instance.exec(false).unwrap();
}

#[test]
fn only_the_expected_result_is_delivered() {
    let (mut instance, mut worker) = connect(&Config::default());
    let seen = record_results(&mut instance);

    // Nothing outstanding yet.
    worker.cmd_out.write_all(b"exec-result 1 1\n").unwrap();
    instance.poll_once(POLL).unwrap();
    assert!(seen.lock().unwrap().is_empty());

    instance.exec(false).unwrap();
    instance.exec(false).unwrap();

    worker.cmd_out.write_all(b"exec-result 1 2\n").unwrap();
    instance.poll_once(POLL).unwrap();
    assert!(seen.lock().unwrap().is_empty());
    assert!(instance.waiting_for_result());

    worker.cmd_out.write_all(b"exec-result 2 1\n").unwrap();
    let res = instance.wait_for_result(Duration::from_secs(5)).unwrap();
    assert_eq!(res, Some((2, ExecResult::Pass)));
    assert_eq!(*seen.lock().unwrap(), vec![(2, ExecResult::Pass)]);
    assert!(!instance.waiting_for_result());

    // A duplicate is not delivered twice.
    worker.cmd_out.write_all(b"exec-result 2 1\n").unwrap();
    instance.poll_once(POLL).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(instance.status().last_result, Some((2, ExecResult::Pass)));
}

#[test]
fn failing_notifier_is_reported() {
    let (mut instance, mut worker) = connect(&Config::default());
    let notifiers = instance.notifiers_mut();
    let id = notifiers.add("broken", Box::new(|_, _| Err("no quorum".to_owned())));
    notifiers.set_active(id, true).unwrap();

    instance.exec(false).unwrap();
    worker.cmd_out.write_all(b"exec-result 1 2\n").unwrap();
    assert!(matches!(
        instance.cmd_read_from_pipe(),
        Err(Error::Notifier {
            name: "broken",
            seq: 1,
            result: ExecResult::Fail,
            ..
        })
    ));
}

#[test]
fn wait_for_result_times_out() {
    let (mut instance, _worker) = connect(&Config::default());
    instance.exec(true).unwrap();

    assert!(matches!(
        instance.wait_for_result(Duration::from_millis(100)),
        Err(Error::Timeout(_))
    ));
    assert!(instance.waiting_for_result());
}

#[test]
fn unexpected_or_malformed_replies_are_fatal() {
    let (mut instance, mut worker) = connect(&Config::default());
    worker.cmd_out.write_all(b"exec 1000 1\n").unwrap();
    assert!(matches!(
        instance.cmd_read_from_pipe(),
        Err(Error::UnexpectedCommand(_))
    ));

    let (mut instance, mut worker) = connect(&Config::default());
    worker.cmd_out.write_all(b"exec-result one 1\n").unwrap();
    assert!(matches!(
        instance.cmd_read_from_pipe(),
        Err(Error::Malformed { .. })
    ));
}

#[test]
fn too_long_reply_is_fatal() {
    let mut config = Config::default();
    config.advanced.ipc_max_send_receive_size = 16;
    let (mut instance, mut worker) = connect(&config);

    worker.cmd_out.write_all(&[b'x'; 64]).unwrap();
    assert!(matches!(
        instance.cmd_read_from_pipe(),
        Err(Error::LineTooLong(16))
    ));
}

#[test]
fn worker_exit_is_connection_lost() {
    let (mut instance, worker) = connect(&Config::default());
    drop(worker);

    let mut res = instance.poll_once(POLL);
    // The pipes may be reported one at a time.
    for _ in 0..3 {
        if res.is_err() {
            break;
        }
        res = instance.poll_once(POLL);
    }
    assert!(matches!(res, Err(Error::ConnectionLost)));
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn worker_log_lines_are_reemitted() {
    let mut config = Config::default();
    config.advanced.ipc_max_send_receive_size = 64;
    let (mut instance, mut worker) = connect(&config);

    let captured = SharedBuf::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(move || writer.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let long = format!("6 {}\n4 disk almost full\n", "x".repeat(100));
        worker.log_out.write_all(long.as_bytes()).unwrap();
        instance.log_read_from_pipe().unwrap();
    });

    let captured = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
    assert!(captured.contains("too long log"));
    assert!(!captured.contains("xxxx"));
    let reemitted = captured
        .lines()
        .find(|line| line.contains("disk almost full"))
        .unwrap();
    assert!(reemitted.contains("WARN"));
    assert!(reemitted.contains("worker"));

    worker.log_out.write_all(b"garbage\n").unwrap();
    assert!(matches!(
        instance.log_read_from_pipe(),
        Err(Error::Malformed { .. })
    ));
}

#[test]
fn log_lines_filling_the_buffer_exactly_are_accepted() {
    let mut config = Config::default();
    config.advanced.ipc_max_send_receive_size = 64;
    let (mut instance, mut worker) = connect(&config);

    let captured = SharedBuf::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        // The second line starts mid-buffer and is exactly 64 bytes long.
        let lines = format!("4 short\n4 {}\n4 after\n", "y".repeat(61));
        worker.log_out.write_all(lines.as_bytes()).unwrap();
        instance.log_read_from_pipe().unwrap();
    });

    let captured = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
    assert!(!captured.contains("too long log"));
    assert!(captured.contains("short"));
    assert!(captured.contains(&"y".repeat(61)));
    assert!(captured.contains("after"));
}
