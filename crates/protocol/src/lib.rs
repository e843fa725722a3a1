//! # Termhub Protocol Library
//!
//! Wire types shared by the termhub daemon and its clients.
//!
//! ## Overview
//!
//! The control socket speaks newline-delimited JSON. This crate defines the
//! pieces every message is built from:
//!
//! - **Error kinds**: the only error information that crosses the socket
//! - **Summaries**: sessions, submitted commands and process exit states
//! - **Payloads**: raw terminal bytes carried as base64 strings
//! - **Line codec**: one JSON document per line
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{decode_line, encode_line, Payload};
//!
//! let line = encode_line(&Payload::new(b"ls -la\n".to_vec())).unwrap();
//! let payload: Payload = decode_line(&line).unwrap();
//! assert_eq!(payload.as_bytes(), b"ls -la\n");
//! ```

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    decode_line, encode_line, ErrorKind, ExitInfo, InvocationSummary, Payload, ProcessStateInfo,
    SessionSummary, PROTOCOL_VERSION,
};
