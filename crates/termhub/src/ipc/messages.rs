//! IPC message types for CLI-daemon communication.
//!
//! Each request and response is one JSON document per line. Byte payloads
//! (raw input, drained output) travel as base64 strings.

use protocol::{ErrorKind, InvocationSummary, Payload, ProcessStateInfo, SessionSummary};
use serde::{Deserialize, Serialize};

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List all registered sessions.
    ListSessions,
    /// Start a new session.
    CreateSession {
        /// Program and arguments; the configured default when empty.
        #[serde(default)]
        argv: Vec<String>,
        /// Extra environment variables.
        #[serde(default)]
        env: Vec<(String, String)>,
        /// Working directory.
        #[serde(default)]
        cwd: Option<String>,
        /// Terminal rows; the configured default when absent.
        #[serde(default)]
        rows: Option<u16>,
        /// Terminal columns; the configured default when absent.
        #[serde(default)]
        cols: Option<u16>,
    },
    /// Describe one session.
    GetSession {
        /// Session to describe.
        session_id: String,
    },
    /// Submit a command line.
    Submit {
        /// Target session.
        session_id: String,
        /// Command text, without the trailing newline.
        text: String,
    },
    /// Look up a submitted command.
    GetInvocation {
        /// Session the command was submitted to.
        session_id: String,
        /// Invocation identifier returned by `Submit`.
        invocation_id: String,
    },
    /// Write raw input bytes.
    Write {
        /// Target session.
        session_id: String,
        /// Bytes to write.
        data: Payload,
    },
    /// Read retained output from a cursor.
    Drain {
        /// Target session.
        session_id: String,
        /// Absolute byte offset to read from.
        #[serde(default)]
        cursor: u64,
        /// Upper bound on returned bytes.
        #[serde(default)]
        max_bytes: Option<usize>,
    },
    /// Change the terminal size.
    Resize {
        /// Target session.
        session_id: String,
        /// New terminal rows.
        rows: u16,
        /// New terminal columns.
        cols: u16,
    },
    /// Forward an allow-listed signal (SIGINT, SIGTERM, SIGWINCH, SIGKILL).
    Signal {
        /// Target session.
        session_id: String,
        /// Raw signal number.
        signal: i32,
    },
    /// Terminate a session.
    Terminate {
        /// The unique identifier of the session to terminate.
        session_id: String,
        /// Skip SIGTERM and the grace period.
        #[serde(default)]
        force: bool,
    },
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Whether the daemon is running.
        running: bool,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Number of registered sessions.
        session_count: usize,
        /// Sessions whose process is alive.
        live_sessions: usize,
        /// Configured session ceiling.
        max_sessions: usize,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// List of registered sessions.
    Sessions {
        /// Information about each session.
        sessions: Vec<SessionSummary>,
    },
    /// One session.
    Session {
        /// Session details.
        session: SessionSummary,
    },
    /// A session was started.
    SessionCreated {
        /// The new session's identifier.
        session_id: String,
        /// Child process ID.
        pid: i32,
    },
    /// A submitted command.
    Invocation {
        /// Command details.
        invocation: InvocationSummary,
    },
    /// Drained output.
    Output {
        /// Output bytes.
        data: Payload,
        /// Cursor to pass to the next drain.
        cursor: u64,
    },
    /// The request succeeded and has nothing to return.
    Ack,
    /// A session was terminated.
    Terminated {
        /// The ID of the terminated session.
        session_id: String,
        /// Final child process state.
        process: ProcessStateInfo,
    },
    /// An error occurred processing the request.
    Error {
        /// Error classification.
        kind: ErrorKind,
        /// Human-readable error message.
        message: String,
    },
}

impl IpcResponse {
    /// Builds an error response.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        IpcResponse::Error {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ping_serialization() {
        let request = IpcRequest::Ping;
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#""Ping""#);

        let deserialized: IpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, request);
    }

    #[test]
    fn test_request_create_defaults() {
        let request: IpcRequest = serde_json::from_str(r#"{"CreateSession":{}}"#).unwrap();
        assert_eq!(
            request,
            IpcRequest::CreateSession {
                argv: vec![],
                env: vec![],
                cwd: None,
                rows: None,
                cols: None,
            }
        );
    }

    #[test]
    fn test_request_write_carries_base64() {
        let request = IpcRequest::Write {
            session_id: "s-1".to_string(),
            data: Payload::new(b"hello\n".to_vec()),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"Write":{"session_id":"s-1","data":"aGVsbG8K"}}"#);

        let deserialized: IpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, request);
    }

    #[test]
    fn test_request_terminate_force_defaults_false() {
        let request: IpcRequest =
            serde_json::from_str(r#"{"Terminate":{"session_id":"abc"}}"#).unwrap();
        assert_eq!(
            request,
            IpcRequest::Terminate {
                session_id: "abc".to_string(),
                force: false,
            }
        );
    }

    #[test]
    fn test_request_drain_defaults() {
        let request: IpcRequest =
            serde_json::from_str(r#"{"Drain":{"session_id":"abc"}}"#).unwrap();
        assert_eq!(
            request,
            IpcRequest::Drain {
                session_id: "abc".to_string(),
                cursor: 0,
                max_bytes: None,
            }
        );
    }

    #[test]
    fn test_response_pong_serialization() {
        let response = IpcResponse::Pong;
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#""Pong""#);

        let deserialized: IpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, response);
    }

    #[test]
    fn test_response_error_shape() {
        let response = IpcResponse::error(ErrorKind::Truncated, "cursor evicted");
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(
            json,
            r#"{"Error":{"kind":"truncated","message":"cursor evicted"}}"#
        );
    }

    #[test]
    fn test_response_output_roundtrip() {
        let response = IpcResponse::Output {
            data: Payload::new(vec![0u8, 159, 146, 150]),
            cursor: 42,
        };
        let json = serde_json::to_string(&response).unwrap();
        let deserialized: IpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, response);
    }

    #[test]
    fn test_response_status_serialization() {
        let response = IpcResponse::Status {
            running: true,
            uptime_secs: 3600,
            session_count: 5,
            live_sessions: 4,
            max_sessions: 10,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("Status"));
        assert!(json.contains("3600"));

        let deserialized: IpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, response);
    }
}
