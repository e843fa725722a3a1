//! # Termhub Daemon Library
//!
//! PTY session hosting for termhub: programs run inside pseudo-terminals
//! that many consumers can drive and watch at once.
//!
//! ## Overview
//!
//! The daemon owns every session and exposes them over a local control
//! socket. It provides:
//!
//! - **Terminal allocation**: master/replica PTY pairs with an initial size
//! - **Process launch**: children on the replica with their own session and
//!   controlling terminal, then reaping and signal forwarding
//! - **Session state machine**: command queue, output history with absolute
//!   cursors, graceful termination
//! - **Output fan-out**: bounded per-subscriber queues that drop instead of
//!   blocking the reader
//! - **Registry**: capacity limit and idle sweeping
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Daemon Orchestrator                    │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌────────────────┐   ┌────────────────────────────────┐ │
//! │  │   IPC Server   │──▶│         Message Router         │ │
//! │  └────────────────┘   └───────────────┬────────────────┘ │
//! │                                       ▼                  │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │                  Session Manager                   │  │
//! │  │   Session ─ Pty ─ ProcessHandle ─ Broadcaster      │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use termhub::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Serve until a client asks us to stop.
//!     orchestrator.stop_requested().await;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY sessions and their manager
//! - [`ipc`]: Unix socket server, client and PID file
//! - [`router`]: Maps control requests onto the session manager
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod ipc;
pub mod orchestrator;
pub mod router;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{
    AllowedSignal, ExitStatus, ManagerOptions, ProcessState, Session, SessionError, SessionId,
    SessionInfo, SessionManager, SessionManagerImpl, SessionOptions, SessionSpec, SessionState,
    TerminalSize,
};

// Re-export IPC types for convenience
pub use ipc::{IpcClient, IpcError, IpcRequest, IpcResponse, IpcServer};

// Re-export router types for convenience
pub use router::{MessageRouter, RouterError, RouterResult};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
