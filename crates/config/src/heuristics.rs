use crate::mode::HeuristicsMode;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::collections::BTreeMap;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Heuristics {
    /// Whether heuristics are run at all, and when.
    ///
    /// See [`HeuristicsMode`] for possible values.
    pub mode: HeuristicsMode,

    /// Deadline for a whole batch of heuristics execs triggered outside of a
    /// membership change. Every exec that has not finished by then counts as
    /// failed. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub timeout: Duration,

    /// Same as `timeout`, but used while the cluster membership is being
    /// synchronized. Usually longer, because votes are only decided once the
    /// batch finishes. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub sync_timeout: Duration,

    /// How often heuristics are re-run when the mode is `on`. **Measured in
    /// milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub interval: Duration,

    /// Heuristics execs, keyed by name. The value is a command line split
    /// into arguments the way a shell would for simple quoting: whitespace
    /// separates arguments, double quotes group them and a backslash escapes
    /// the next character.
    ///
    /// ```toml
    /// [heuristics.exec]
    /// ping = "/usr/bin/ping -q -c 1 \"gateway.example.com\""
    /// ```
    pub exec: BTreeMap<String, String>,
}

impl Default for Heuristics {
    fn default() -> Self {
        Self {
            mode: HeuristicsMode::Disabled,
            timeout: Duration::from_millis(5_000),
            sync_timeout: Duration::from_millis(15_000),
            interval: Duration::from_millis(30_000),
            exec: BTreeMap::new(),
        }
    }
}

impl Heuristics {
    /// The execs that should actually be run, in name order.
    ///
    /// Disabled heuristics yield nothing, which the worker answers with a
    /// `Disabled` verdict.
    pub fn effective_exec(&self) -> impl Iterator<Item = (&str, &str)> {
        let enabled = self.mode != HeuristicsMode::Disabled;
        self.exec
            .iter()
            .filter(move |_| enabled)
            .map(|(name, command)| (name.as_str(), command.as_str()))
    }
}
