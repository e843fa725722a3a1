//! Error taxonomy for PTY allocation, process launch, session I/O and
//! registry operations.
//!
//! Only an [`ErrorKind`] and the display message ever leave the daemon;
//! see [`SessionError::kind`].

use protocol::messages::ErrorKind;
use thiserror::Error;

use super::state::SessionState;

/// Unique identifier for a session.
pub type SessionId = String;

/// Failed to open a PTY pair or configure its master descriptor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to allocate PTY: {0}")]
pub struct AllocationError(pub String);

/// Failed to start the target executable on the PTY slave.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// argv[0] (or the working directory) does not exist.
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    /// argv[0] exists but may not be executed.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The system ran out of processes, descriptors or memory.
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),
}

/// I/O failures on the PTY master.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The child side of the PTY is closed.
    #[error("end of stream: the child side of the PTY is closed")]
    Eof,

    /// The child has exited or the descriptor was already released.
    #[error("broken pipe: the child process is gone")]
    Pipe,

    /// The PTY did not accept data before the deadline.
    #[error("PTY operation timed out")]
    Timeout,
}

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session no longer accepts input.
    #[error("session {id} is not running (state: {state})")]
    NotRunning {
        /// Session identifier.
        id: SessionId,
        /// State at the time of the call.
        state: SessionState,
    },

    /// PTY allocation failed.
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    /// Process launch failed.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// PTY I/O failed.
    #[error(transparent)]
    Io(#[from] IoError),

    /// The in-flight limit is reached and the command cannot be queued.
    #[error("session {id} is busy ({in_flight} in flight, {queued} queued)")]
    Busy {
        /// Session identifier.
        id: SessionId,
        /// Commands currently executing.
        in_flight: usize,
        /// Commands waiting for dispatch.
        queued: usize,
    },

    /// The manager's concurrent-session ceiling is reached.
    #[error("session limit reached ({max} concurrent sessions)")]
    CapacityExceeded {
        /// Configured ceiling.
        max: usize,
    },

    /// The requested cursor fell out of the retained output window.
    #[error("output cursor {requested} is older than the retained window (oldest: {oldest})")]
    Truncated {
        /// Cursor supplied by the caller.
        requested: u64,
        /// Oldest offset still retained; resynchronize from the tail.
        oldest: u64,
    },

    /// The child survived SIGKILL for longer than the kill timeout.
    #[error("session {0} did not terminate in time")]
    TerminationTimeout(SessionId),

    /// Rows and columns must both be positive.
    #[error("invalid terminal size {rows}x{cols}: rows and cols must be positive")]
    InvalidSize {
        /// Requested rows.
        rows: u16,
        /// Requested columns.
        cols: u16,
    },

    /// The signal is not on the forwarding allow-list.
    #[error("signal {0} is not allowed")]
    SignalNotAllowed(i32),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),
}

impl SessionError {
    /// Wire-level classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::NotRunning { .. } => ErrorKind::NotRunning,
            SessionError::Allocation(_) => ErrorKind::Allocation,
            SessionError::Launch(LaunchError::ExecutableNotFound(_)) => {
                ErrorKind::ExecutableNotFound
            }
            SessionError::Launch(LaunchError::PermissionDenied(_)) => ErrorKind::PermissionDenied,
            SessionError::Launch(LaunchError::ResourceExhausted(_)) => {
                ErrorKind::ResourceExhausted
            }
            SessionError::Io(IoError::Eof) => ErrorKind::Eof,
            SessionError::Io(IoError::Pipe) => ErrorKind::Pipe,
            SessionError::Io(IoError::Timeout) => ErrorKind::Timeout,
            SessionError::Busy { .. } => ErrorKind::SessionBusy,
            SessionError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            SessionError::Truncated { .. } => ErrorKind::Truncated,
            SessionError::TerminationTimeout(_) => ErrorKind::TerminationTimeout,
            SessionError::InvalidSize { .. } | SessionError::SignalNotAllowed(_) => {
                ErrorKind::InvalidRequest
            }
            SessionError::ResizeFailed(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_error_kinds() {
        let err: SessionError = LaunchError::ExecutableNotFound("nope".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::ExecutableNotFound);
        assert_eq!(err.to_string(), "executable not found: nope");

        let err: SessionError = LaunchError::PermissionDenied("/etc/passwd".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_io_error_kinds() {
        assert_eq!(SessionError::from(IoError::Pipe).kind(), ErrorKind::Pipe);
        assert_eq!(SessionError::from(IoError::Eof).kind(), ErrorKind::Eof);
        assert_eq!(SessionError::from(IoError::Timeout).kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_truncated_display() {
        let err = SessionError::Truncated {
            requested: 3,
            oldest: 10,
        };
        assert_eq!(err.kind(), ErrorKind::Truncated);
        assert_eq!(
            err.to_string(),
            "output cursor 3 is older than the retained window (oldest: 10)"
        );
    }

    #[test]
    fn test_not_running_display() {
        let err = SessionError::NotRunning {
            id: "abc".to_string(),
            state: SessionState::Terminated,
        };
        assert_eq!(err.to_string(), "session abc is not running (state: terminated)");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SessionError>();
    }
}
