//! Session management module.
//!
//! PTY allocation, process launch and reaping, the per-session state machine
//! with its output history and command queue, output fan-out to live
//! subscribers, and the registry that owns every session.

pub mod buffer;
pub mod command;
pub mod error;
pub mod instance;
pub mod manager;
pub mod multiplexer;
pub mod process;
pub mod pty;
pub mod state;

pub use buffer::OutputBuffer;
pub use command::{CommandInvocation, CommandQueue, InvocationStatus, QueueLimits};
pub use error::{AllocationError, IoError, LaunchError, SessionError, SessionId};
pub use instance::{ExitHook, Session, SessionInfo, SessionOptions, SessionSpec};
pub use manager::{ManagerOptions, SessionManager, SessionManagerImpl, SweepReport};
pub use multiplexer::{
    now_millis, BroadcastStats, ClientId, ClientStats, SessionOutputBroadcaster, Subscription,
    DEFAULT_SUBSCRIBER_CAPACITY,
};
pub use process::{AllowedSignal, ExitStatus, ProcessHandle, ProcessState};
pub use pty::{LaunchSpec, Pty, TerminalSize};
pub use state::SessionState;
