use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Read/write routing policy of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyMode {
    /// Reads and writes always go to the primary over a single reserved socket.
    Strong,
    /// Reads may be served by a secondary until the first write, after which the
    /// session stays on the primary. A session's view never moves backwards.
    Monotonic,
}

impl ConsistencyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsistencyMode::Strong => "strong",
            ConsistencyMode::Monotonic => "monotonic",
        }
    }

    /// Whether a read issued before any write may use a secondary.
    pub fn allows_secondary_reads(&self) -> bool {
        matches!(self, ConsistencyMode::Monotonic)
    }
}

impl fmt::Display for ConsistencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsistencyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strong" => Ok(ConsistencyMode::Strong),
            "monotonic" => Ok(ConsistencyMode::Monotonic),
            other => Err(format!("unknown consistency mode '{}'", other)),
        }
    }
}
