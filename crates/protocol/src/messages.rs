//! Wire types shared by the daemon and its clients.
//!
//! These are the data shapes that cross the control socket: error kinds,
//! session and command summaries, process exit information and a base64
//! byte payload. Request/response envelopes are built from them by the
//! daemon's IPC layer.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ProtocolError, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Classification of a failed request. Only this and a message are sent to
/// clients; internal error details never cross the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No session with the given ID.
    NotFound,
    /// The session no longer accepts input.
    NotRunning,
    /// A PTY could not be allocated.
    Allocation,
    /// argv[0] or the working directory does not exist.
    ExecutableNotFound,
    /// argv[0] is not executable.
    PermissionDenied,
    /// Out of processes, descriptors or memory.
    ResourceExhausted,
    /// The child side of the PTY is closed.
    Eof,
    /// The child is gone.
    Pipe,
    /// An operation did not finish in time.
    Timeout,
    /// In-flight and queue limits are reached.
    SessionBusy,
    /// The daemon's session ceiling is reached.
    CapacityExceeded,
    /// The output cursor was evicted.
    Truncated,
    /// The child survived SIGKILL.
    TerminationTimeout,
    /// The request was malformed or out of range.
    InvalidRequest,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// snake_case name as used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::NotRunning => "not_running",
            ErrorKind::Allocation => "allocation",
            ErrorKind::ExecutableNotFound => "executable_not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Eof => "eof",
            ErrorKind::Pipe => "pipe",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SessionBusy => "session_busy",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::Truncated => "truncated",
            ErrorKind::TerminationTimeout => "termination_timeout",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::SessionBusy
                | ErrorKind::CapacityExceeded
                | ErrorKind::Timeout
                | ErrorKind::ResourceExhausted
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitInfo {
    /// Normal exit with a code.
    Code(i32),
    /// Killed by a signal.
    Signaled(i32),
}

/// Child process state as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessStateInfo {
    Starting,
    Running,
    Draining,
    Exited { exit: ExitInfo },
    Failed { reason: String },
}

/// Summary of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Unique session identifier.
    pub id: String,
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Child process ID.
    pub pid: i32,
    /// Lifecycle state name (`initializing`, `idle`, `busy`, ...).
    pub state: String,
    /// Child process state.
    pub process: ProcessStateInfo,
    /// Terminal rows.
    pub rows: u16,
    /// Terminal columns.
    pub cols: u16,
    /// Creation time, Unix milliseconds.
    pub created_at: u64,
    /// Last input or output, Unix milliseconds.
    pub last_activity: u64,
    /// Commands executing.
    pub in_flight: usize,
    /// Commands waiting.
    pub queued: usize,
    /// Oldest retained output offset.
    pub output_start: u64,
    /// Offset one past the newest output byte.
    pub output_end: u64,
    /// Attached live subscribers.
    pub subscribers: usize,
    /// Output chunks published to subscribers.
    #[serde(default)]
    pub chunks_published: u64,
    /// Chunks discarded because a subscriber fell behind.
    #[serde(default)]
    pub overflow_events: u64,
}

/// Summary of one submitted command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationSummary {
    /// Invocation identifier.
    pub id: String,
    /// Command text as submitted.
    pub text: String,
    /// `queued`, `running`, `completed`, `cancelled` or `failed`.
    pub status: String,
    /// Submission time, Unix milliseconds.
    pub submitted_at: u64,
    /// Dispatch time, Unix milliseconds.
    pub dispatched_at: Option<u64>,
    /// Completion time, Unix milliseconds.
    pub completed_at: Option<u64>,
}

/// Raw bytes carried as a base64 string in JSON.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    /// Wraps raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Decodes a base64 string.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        STANDARD
            .decode(encoded)
            .map(Self)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }

    /// Encodes the bytes as base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the payload and returns the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Payload::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Serializes a message as one JSON line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parses one JSON line. Surrounding whitespace is ignored.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim())?)
}
