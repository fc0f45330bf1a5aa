#![forbid(unsafe_code)]

use std::fmt;

/// Aggregate verdict of one batch of heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecResult {
    /// No heuristics are configured.
    Disabled,
    /// Every exec exited with status zero before the deadline.
    Pass,
    /// At least one exec failed, could not be started, or the deadline hit.
    Fail,
}

impl ExecResult {
    /// Numeric code carried on the wire.
    pub const fn code(self) -> u32 {
        match self {
            Self::Disabled => 0,
            Self::Pass => 1,
            Self::Fail => 2,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Disabled),
            1 => Some(Self::Pass),
            2 => Some(Self::Fail),
            _ => None,
        }
    }
}

impl fmt::Display for ExecResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "Disabled",
            Self::Pass => "Pass",
            Self::Fail => "Fail",
        };
        f.write_str(s)
    }
}
