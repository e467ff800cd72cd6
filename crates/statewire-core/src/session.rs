//! Session identity and lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier binding one backend computation to its subscribers.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    #[default]
    Initializing,
    Running,
    AwaitingInput,
    Completed,
    Errored,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }

    /// Progress rank; status never moves to a lower rank.
    fn rank(self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::Running | Self::AwaitingInput => 1,
            Self::Completed | Self::Errored => 2,
        }
    }

    /// Whether `self -> next` is a legal lifecycle move.
    ///
    /// Running and awaiting-input may alternate; terminal states are final.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank() && !(next == Self::Initializing && self == Self::Initializing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::AwaitingInput => "awaiting-input",
            Self::Completed => "completed",
            Self::Errored => "errored",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a session, as listed by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub status: SessionStatus,
    /// Last assigned sequence number.
    pub seq: u64,
    pub subscribers: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
