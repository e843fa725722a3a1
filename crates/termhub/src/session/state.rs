//! Session lifecycle states and the allowed transition graph.

use std::fmt;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// PTY and process launched, waiting for the first prompt.
    Initializing,
    /// Ready to dispatch a command.
    Idle,
    /// A command is executing.
    Busy,
    /// A stop was requested; the child is being signalled and reaped.
    Terminating,
    /// The child was reaped after a stop request.
    Terminated,
    /// Unrecoverable I/O failure or unexpected process exit.
    Error,
}

impl SessionState {
    /// Returns true for states that never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Error)
    }

    /// Returns true while the session accepts commands and resizes.
    pub fn accepts_input(self) -> bool {
        matches!(
            self,
            SessionState::Initializing | SessionState::Idle | SessionState::Busy
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// Every non-terminal state may enter `Error`; terminal states are final.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Terminated | Error, _) => false,
            (_, Error) => true,
            (Initializing, Idle) | (Idle, Busy) | (Busy, Idle) => true,
            (Initializing | Idle | Busy, Terminating) => true,
            (Terminating, Terminated) => true,
            _ => false,
        }
    }

    /// Lowercase name used in logs and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Initializing => "initializing",
            SessionState::Idle => "idle",
            SessionState::Busy => "busy",
            SessionState::Terminating => "terminating",
            SessionState::Terminated => "terminated",
            SessionState::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
