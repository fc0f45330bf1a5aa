#![forbid(unsafe_code)]

//! Forwarding of worker log events to the parent over the log pipe.

use crate::io::blocking_write;
use crate::protocol::LogLine;
use std::fmt::Write as _;
use std::io::Write;
use std::sync::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Renders each event as a `<priority> <text>` line on the log pipe.
///
/// Lines that would exceed the parent's receive buffer are cut short at a
/// character boundary.
pub struct WorkerLogLayer {
    out: Mutex<Box<dyn Write + Send>>,
    max_line_len: usize,
}

impl WorkerLogLayer {
    pub fn new(out: impl Write + Send + 'static, max_line_len: usize) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
            max_line_len,
        }
    }
}

impl<S: Subscriber> Layer<S> for WorkerLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let mut line = LogLine::new(event.metadata().level(), visitor.finish()).to_string();
        if line.len() > self.max_line_len {
            let mut cut = self.max_line_len.saturating_sub(1);
            while cut > 0 && !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
            line.push('\n');
        }

        if let Ok(mut out) = self.out.lock() {
            // Nowhere left to report a failure to.
            let _ = blocking_write(&mut *out, line.as_bytes());
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.message.is_empty() {
            self.fields.trim_start().to_owned()
        } else {
            self.message + &self.fields
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}
