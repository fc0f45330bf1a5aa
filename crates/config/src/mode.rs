use serde::{Deserialize, Serialize};
use std::fmt;

/// When heuristics are executed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeuristicsMode {
    /// Heuristics are never executed. Every request is answered with a
    /// `Disabled` verdict.
    #[default]
    #[serde(rename = "off")]
    Disabled,

    /// Heuristics are executed regularly every `interval` and on membership
    /// changes.
    #[serde(rename = "on")]
    Enabled,

    /// Heuristics are executed only on membership changes.
    #[serde(rename = "sync")]
    Sync,
}

impl fmt::Display for HeuristicsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "Disabled",
            Self::Enabled => "Enabled",
            Self::Sync => "Sync",
        };
        f.write_str(s)
    }
}
