#![forbid(unsafe_code)]

//! Line protocol spoken between the parent and the worker.
//!
//! Commands travel on the command pipes, one per line:
//!
//! ```text
//! exec-list-clear
//! exec-list-add <name> <command>
//! exec <timeout_ms> <seq>
//! exec-result <seq> <result_code>
//! ```
//!
//! The worker log pipe carries `<priority> <text>` lines with syslog
//! priorities. A line ends at the first `\r` or `\n`; any run of `\0`, `\r`
//! and `\n` after it is skipped.

use crate::dynar::Dynar;
use crate::error::Error;
use crate::exec_result::ExecResult;
use std::fmt;
use tracing::Level;

pub const EXEC_LIST_CLEAR: &str = "exec-list-clear";
pub const EXEC_LIST_ADD: &str = "exec-list-add";
pub const EXEC: &str = "exec";
pub const EXEC_RESULT: &str = "exec-result";

pub const LOG_CRIT: u8 = 2;
pub const LOG_ERR: u8 = 3;
pub const LOG_WARNING: u8 = 4;
pub const LOG_INFO: u8 = 6;
pub const LOG_DEBUG: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ExecListClear,
    ExecListAdd { name: String, command: String },
    Exec { timeout_ms: u32, seq: u32 },
    ExecResult { seq: u32, result: ExecResult },
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, Error> {
        let keyword = line.split(' ').next().unwrap_or_default();

        match keyword {
            EXEC_LIST_CLEAR => Ok(Self::ExecListClear),
            EXEC_LIST_ADD => parse_exec_list_add(line),
            EXEC => {
                let (timeout_ms, seq) = parse_two_numbers(line, keyword)?;
                Ok(Self::Exec { timeout_ms, seq })
            }
            EXEC_RESULT => {
                let (seq, code) = parse_two_numbers(line, keyword)?;
                let result = ExecResult::from_code(code).ok_or_else(|| Error::Malformed {
                    line: line.to_owned(),
                    reason: "unknown result code",
                })?;
                Ok(Self::ExecResult { seq, result })
            }
            _ => Err(Error::UnknownCommand(line.to_owned())),
        }
    }
}

/// Wire form including the trailing newline.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecListClear => writeln!(f, "{EXEC_LIST_CLEAR}"),
            Self::ExecListAdd { name, command } => writeln!(
                f,
                "{EXEC_LIST_ADD} {} {}",
                strip_newlines(name),
                strip_newlines(command)
            ),
            Self::Exec { timeout_ms, seq } => writeln!(f, "{EXEC} {timeout_ms} {seq}"),
            Self::ExecResult { seq, result } => {
                writeln!(f, "{EXEC_RESULT} {seq} {}", result.code())
            }
        }
    }
}

/// `exec-list-add <name> <command>`: the name is the first word after the
/// keyword, the command is everything after the spaces that follow it.
fn parse_exec_list_add(line: &str) -> Result<Command, Error> {
    let malformed = |reason| Error::Malformed {
        line: line.to_owned(),
        reason,
    };

    let (_, rest) = line
        .split_once(' ')
        .ok_or_else(|| malformed("missing exec name"))?;
    let rest = rest.trim_start_matches(' ');
    if rest.is_empty() {
        return Err(malformed("missing exec name"));
    }

    let (name, command) = rest
        .split_once(' ')
        .ok_or_else(|| malformed("missing exec command"))?;
    let command = command.trim_start_matches(' ');
    if command.is_empty() {
        return Err(malformed("missing exec command"));
    }

    Ok(Command::ExecListAdd {
        name: name.to_owned(),
        command: command.to_owned(),
    })
}

fn parse_two_numbers(line: &str, keyword: &str) -> Result<(u32, u32), Error> {
    let mut fields = line[keyword.len()..].split_ascii_whitespace();
    let mut next = || -> Result<u32, Error> {
        fields
            .next()
            .and_then(|field| field.parse().ok())
            .ok_or_else(|| Error::Malformed {
                line: line.to_owned(),
                reason: "expected two unsigned integers",
            })
    };

    let first = next()?;
    let second = next()?;
    Ok((first, second))
}

/// One line of the worker log channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub priority: u8,
    pub message: String,
}

impl LogLine {
    pub fn new(level: &Level, message: impl Into<String>) -> Self {
        Self {
            priority: syslog_priority(level),
            message: message.into(),
        }
    }

    /// Parse `<digits> <spaces><text>`.
    pub fn parse(line: &str) -> Result<Self, Error> {
        let digits_end = line
            .find(|ch: char| !ch.is_ascii_digit())
            .unwrap_or(line.len());

        let rest = &line[digits_end..];
        if !rest.is_empty() && !rest.starts_with(' ') {
            return Err(Error::Malformed {
                line: line.to_owned(),
                reason: "unexpected character in log priority",
            });
        }

        let priority = line[..digits_end]
            .parse::<u32>()
            .unwrap_or(0)
            .min(u32::from(u8::MAX)) as u8;

        Ok(Self {
            priority,
            message: rest.trim_start_matches(' ').to_owned(),
        })
    }

    pub fn level(&self) -> Level {
        level_from_priority(self.priority)
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.priority, strip_newlines(&self.message))
    }
}

pub fn syslog_priority(level: &Level) -> u8 {
    match *level {
        Level::ERROR => LOG_ERR,
        Level::WARN => LOG_WARNING,
        Level::INFO => LOG_INFO,
        _ => LOG_DEBUG,
    }
}

pub fn level_from_priority(priority: u8) -> Level {
    match priority {
        0..=LOG_ERR => Level::ERROR,
        LOG_WARNING => Level::WARN,
        5..=LOG_INFO => Level::INFO,
        _ => Level::DEBUG,
    }
}

/// Replace line breaks with spaces so a value cannot split a message.
pub fn strip_newlines(s: &str) -> String {
    s.replace(['\n', '\r'], " ")
}

/// Remove the first complete line from `buf` and return it without its
/// terminator. Returns `None` while no terminator has arrived.
pub fn take_line(buf: &mut Dynar) -> Option<String> {
    // A terminator run may have been split across two reads.
    let leading = buf
        .as_bytes()
        .iter()
        .take_while(|&&b| matches!(b, b'\0' | b'\r' | b'\n'))
        .count();
    buf.consume(leading);

    let bytes = buf.as_bytes();
    let end = bytes.iter().position(|&b| b == b'\r' || b == b'\n')?;
    let line = String::from_utf8_lossy(&bytes[..end]).into_owned();

    let next = bytes[end..]
        .iter()
        .position(|&b| !matches!(b, b'\0' | b'\r' | b'\n'))
        .map_or(bytes.len(), |offset| end + offset);

    buf.consume(next);
    Some(line)
}

/// True when `buf` holds at least one complete line.
pub fn has_line(buf: &Dynar) -> bool {
    buf.as_bytes().iter().any(|&b| b == b'\r' || b == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn encodes_wire_form() {
        assert_eq!(Command::ExecListClear.to_string(), "exec-list-clear\n");
        assert_eq!(
            Command::ExecListAdd {
                name: "gw".into(),
                command: "ping -c 1\n10.0.0.1".into(),
            }
            .to_string(),
            "exec-list-add gw ping -c 1 10.0.0.1\n"
        );
        assert_eq!(
            Command::Exec {
                timeout_ms: 5000,
                seq: 7
            }
            .to_string(),
            "exec 5000 7\n"
        );
        assert_eq!(
            Command::ExecResult {
                seq: 7,
                result: ExecResult::Fail
            }
            .to_string(),
            "exec-result 7 2\n"
        );
    }

    #[test]
    fn parses_commands() {
        assert_eq!(
            Command::parse("exec-list-clear").unwrap(),
            Command::ExecListClear
        );
        assert_eq!(
            Command::parse("exec-list-add  ok   /bin/echo \"a b\"").unwrap(),
            Command::ExecListAdd {
                name: "ok".into(),
                command: "/bin/echo \"a b\"".into(),
            }
        );
        assert_eq!(
            Command::parse("exec 200 3").unwrap(),
            Command::Exec {
                timeout_ms: 200,
                seq: 3
            }
        );
        assert_eq!(
            Command::parse("exec-result 3 0").unwrap(),
            Command::ExecResult {
                seq: 3,
                result: ExecResult::Disabled
            }
        );
    }

    #[test]
    fn rejects_bad_commands() {
        assert!(matches!(
            Command::parse("exec-list-add"),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            Command::parse("exec-list-add name"),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            Command::parse("exec-list-add name   "),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            Command::parse("exec 12"),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            Command::parse("exec-result 1 9"),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            Command::parse("exec-all"),
            Err(Error::UnknownCommand(_))
        ));
    }

    #[test]
    fn log_lines() {
        let line = LogLine::parse("4   Not all heuristics execs finished on time").unwrap();
        assert_eq!(line.priority, LOG_WARNING);
        assert_eq!(line.message, "Not all heuristics execs finished on time");
        assert_eq!(line.level(), Level::WARN);

        assert!(LogLine::parse("x4 text").is_err());
        assert_eq!(
            LogLine::new(&Level::ERROR, "two\nlines").to_string(),
            "3 two lines\n"
        );
        assert_eq!(level_from_priority(LOG_CRIT), Level::ERROR);
        assert_eq!(level_from_priority(LOG_DEBUG), Level::DEBUG);
    }

    #[test]
    fn framing_skips_terminator_runs_and_keeps_partial_lines() {
        let mut buf = Dynar::new(128);
        buf.cat(b"exec 1 1\r\n\0\nexec-list-clear\nexec-li").unwrap();

        assert_eq!(take_line(&mut buf).as_deref(), Some("exec 1 1"));
        assert_eq!(take_line(&mut buf).as_deref(), Some("exec-list-clear"));
        assert_eq!(take_line(&mut buf), None);
        assert_eq!(buf.as_bytes(), b"exec-li");
        assert!(!has_line(&buf));

        buf.cat(b"st-clear\n").unwrap();
        assert_eq!(take_line(&mut buf).as_deref(), Some("exec-list-clear"));
        assert!(buf.is_empty());
    }

    #[test]
    fn terminator_split_across_reads_is_not_an_empty_line() {
        let mut buf = Dynar::new(64);
        buf.cat(b"exec 1 1\r").unwrap();
        assert_eq!(take_line(&mut buf).as_deref(), Some("exec 1 1"));

        buf.cat(b"\n\0exec-list-clear\n").unwrap();
        assert!(has_line(&buf));
        assert_eq!(take_line(&mut buf).as_deref(), Some("exec-list-clear"));
        assert_eq!(take_line(&mut buf), None);
    }

    proptest! {
        #[test]
        fn framed_commands_come_back_in_order(
            cmds in prop::collection::vec(
                prop_oneof![
                    Just(Command::ExecListClear),
                    ("[a-z]{1,8}", "[a-z/][a-z/ ]{0,8}[a-z]").prop_map(|(name, command)| {
                        Command::ExecListAdd { name, command }
                    }),
                    (any::<u32>(), any::<u32>())
                        .prop_map(|(timeout_ms, seq)| Command::Exec { timeout_ms, seq }),
                ],
                0..10,
            ),
            split in 0usize..512,
        ) {
            let wire: String = cmds.iter().map(ToString::to_string).collect();
            let split = split.min(wire.len());
            let mut buf = Dynar::new(4096);
            let mut decoded = Vec::new();

            for chunk in [&wire.as_bytes()[..split], &wire.as_bytes()[split..]] {
                buf.cat(chunk).unwrap();
                while let Some(line) = take_line(&mut buf) {
                    decoded.push(Command::parse(&line).unwrap());
                }
            }

            prop_assert!(buf.is_empty());
            prop_assert_eq!(decoded, cmds);
        }
    }
}
