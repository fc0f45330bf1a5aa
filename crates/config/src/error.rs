use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to serialize TOML: {0}")]
    SerializeTOML(#[from] toml_edit::ser::Error),

    #[error("Failed to deserialize TOML: {0}")]
    DeserializeTOML(#[from] toml_edit::de::Error),

    #[error("Failed to parse TOML document: {0}")]
    ParseTOML(#[from] toml_edit::TomlError),

    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("{name} {value:?} is out of range {min:?}..={max:?}")]
    OutOfRange {
        name: &'static str,
        value: Duration,
        min: Duration,
        max: Duration,
    },

    #[error("Too many heuristics execs: {count} (maximum is {max})")]
    TooManyExecs { count: usize, max: usize },

    #[error("Invalid heuristics exec name {0:?}")]
    InvalidExecName(String),

    #[error("Heuristics exec {0:?} has an empty command")]
    EmptyExecCommand(String),

    #[error("Advanced setting {0} must be greater than zero")]
    ZeroSetting(&'static str),

    #[error("max_processes ({max_processes}) must not be lower than max_execs ({max_execs})")]
    ProcessLimitTooLow {
        max_processes: usize,
        max_execs: usize,
    },
}
