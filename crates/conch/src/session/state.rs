//! Session lifecycle states.

use std::fmt;

/// Unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a session is in its lifecycle.
///
/// ```text
/// idle ──► connecting ──► active ──► closing ──► closed
///   │          │            │                      ▲
///   └──────────┴────────────┴──────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Channel open, no remote connection.
    #[default]
    Idle,
    /// Remote handshake and shell request in flight.
    Connecting,
    /// Shell open, relay running.
    Active,
    /// Remote teardown in progress.
    Closing,
    /// Terminal. All handles released.
    Closed,
}

impl SessionState {
    /// Returns true if `next` is a legal successor of `self`.
    pub const fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::{Active, Closed, Closing, Connecting, Idle};
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Closed)
                | (Connecting, Active)
                | (Connecting, Closed)
                | (Active, Closing)
                | (Active, Closed)
                | (Closing, Closed)
        )
    }

    /// Only an active session writes client input to the shell.
    pub const fn accepts_input(self) -> bool {
        matches!(self, SessionState::Active)
    }

    /// Returns true for `closed`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// Lowercase state name as used in logs and the health report.
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
