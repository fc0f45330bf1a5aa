#![forbid(unsafe_code)]

mod advanced;
mod error;
mod heuristics;
mod mode;

pub use advanced::Advanced;
pub use error::Error;
pub use heuristics::Heuristics;
pub use mode::HeuristicsMode;

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub heuristics: Heuristics,
    pub advanced: Advanced,
}

impl Config {
    /// Load configuration from a TOML file. Missing fields are filled with defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml_edit::de::from_str(&text)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let toml = toml_edit::ser::to_string_pretty(self)?;
        std::fs::write(path, toml)?;
        Ok(())
    }

    /// Load configuration from multiple TOML files. Later files override earlier ones.
    pub fn load_multiple<T, U>(paths: U) -> Result<Self, Error>
    where
        T: AsRef<Path>,
        U: IntoIterator<Item = T>,
    {
        let mut merged = toml_edit::DocumentMut::new();
        for path in paths {
            let path = path.as_ref();
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(path)?;
            let doc: toml_edit::DocumentMut = text.parse()?;
            merge_document(&mut merged, doc);
        }
        let config: Config = toml_edit::de::from_str(&merged.to_string())?;
        Ok(config)
    }

    /// Check the heuristics settings against the limits in `advanced`.
    pub fn validate(&self) -> Result<(), Error> {
        let advanced = &self.advanced;
        let heuristics = &self.heuristics;

        if advanced.ipc_max_send_buffers == 0 {
            return Err(Error::ZeroSetting("ipc_max_send_buffers"));
        }
        if advanced.ipc_max_send_receive_size == 0 {
            return Err(Error::ZeroSetting("ipc_max_send_receive_size"));
        }
        if advanced.kill_list_interval.is_zero() {
            return Err(Error::ZeroSetting("kill_list_interval"));
        }
        if advanced.max_processes < advanced.max_execs {
            return Err(Error::ProcessLimitTooLow {
                max_processes: advanced.max_processes,
                max_execs: advanced.max_execs,
            });
        }

        let timeouts = advanced.min_timeout..=advanced.max_timeout;
        check_range("timeout", heuristics.timeout, &timeouts)?;
        check_range("sync_timeout", heuristics.sync_timeout, &timeouts)?;
        let intervals = advanced.min_interval..=advanced.max_interval;
        check_range("interval", heuristics.interval, &intervals)?;

        if heuristics.exec.len() > advanced.max_execs {
            return Err(Error::TooManyExecs {
                count: heuristics.exec.len(),
                max: advanced.max_execs,
            });
        }
        for (name, command) in &heuristics.exec {
            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(Error::InvalidExecName(name.clone()));
            }
            if command.trim().is_empty() {
                return Err(Error::EmptyExecCommand(name.clone()));
            }
        }

        Ok(())
    }
}

fn check_range(
    name: &'static str,
    value: Duration,
    range: &RangeInclusive<Duration>,
) -> Result<(), Error> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(Error::OutOfRange {
            name,
            value,
            min: *range.start(),
            max: *range.end(),
        })
    }
}

fn merge_document(target: &mut toml_edit::DocumentMut, source: toml_edit::DocumentMut) {
    for (key, item) in source.iter() {
        merge_item(
            target.entry(key).or_insert(toml_edit::Item::None),
            item.clone(),
        );
    }
}

fn merge_item(target: &mut toml_edit::Item, source: toml_edit::Item) {
    use toml_edit::Item;
    match (target, source) {
        (Item::Table(target_table), Item::Table(source_table)) => {
            for (key, item) in source_table.iter() {
                merge_item(target_table.entry(key).or_insert(Item::None), item.clone());
            }
        }
        (target_item, source_item) => {
            *target_item = source_item;
        }
    }
}
