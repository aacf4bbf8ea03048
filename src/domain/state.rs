use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TickerHubError;

/// Which half of a ticker record a fetch targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Quote,
    Profile,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Quote => "quote",
            DataKind::Profile => "profile",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scheduling tier. Declaration order is dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    pub(crate) fn tier(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = TickerHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(TickerHubError::InvalidPriority(other.to_string())),
        }
    }
}

/// Streaming connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected. `fatal` is set when the server closed the stream for a
    /// policy violation; no reconnect is attempted after that.
    Disconnected { fatal: Option<String> },
    Connecting,
    Open,
    /// Waiting before the next reconnect attempt
    Backoff { attempt: u32 },
}

impl ConnectionState {
    pub fn idle() -> Self {
        ConnectionState::Disconnected { fatal: None }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected { fatal: Some(_) })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected { fatal: None } => "DISCONNECTED",
            ConnectionState::Disconnected { fatal: Some(_) } => "UNAVAILABLE",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Backoff { .. } => "BACKOFF",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected { fatal: Some(reason) } => {
                write!(f, "{} ({})", self.as_str(), reason)
            }
            ConnectionState::Backoff { attempt } => write!(f, "{} #{}", self.as_str(), attempt),
            _ => write!(f, "{}", self.as_str()),
        }
    }
}
