//! Message router for dispatching IPC requests to the session manager.
//!
//! The router owns no state of its own. Every request maps onto one or two
//! manager calls and every failure collapses into an [`IpcResponse::Error`]
//! carrying only an [`ErrorKind`] and a message.

use std::path::PathBuf;
use std::sync::Arc;

use protocol::{ErrorKind, ExitInfo, InvocationSummary, Payload, ProcessStateInfo, SessionSummary};
use tracing::{debug, info, warn};

use crate::ipc::{IpcRequest, IpcResponse};
use crate::session::{
    AllowedSignal, CommandInvocation, ExitStatus, ProcessState, SessionError, SessionId,
    SessionInfo, SessionManager, SessionSpec, TerminalSize,
};

/// Result type for router operations.
pub type RouterResult = Result<IpcResponse, RouterError>;

/// Errors that can occur during request routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Session-related error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// No invocation with this ID in the session's history.
    #[error("invocation not found: {0}")]
    InvocationNotFound(String),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RouterError {
    /// Wire-level classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::Session(e) => e.kind(),
            RouterError::InvocationNotFound(_) => ErrorKind::NotFound,
            RouterError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Convert the error to an IPC error response.
    pub fn to_response(&self) -> IpcResponse {
        IpcResponse::error(self.kind(), self.to_string())
    }
}

/// Dispatches session requests to a [`SessionManager`].
pub struct MessageRouter<S: SessionManager> {
    session_manager: Arc<S>,
}

impl<S: SessionManager> MessageRouter<S> {
    /// Create a new message router over the given manager.
    pub fn new(session_manager: Arc<S>) -> Self {
        Self { session_manager }
    }

    /// The manager requests are routed to.
    pub fn session_manager(&self) -> &Arc<S> {
        &self.session_manager
    }

    /// Route a request and always produce a response.
    pub async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match self.route(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, kind = %e.kind(), "Request failed");
                e.to_response()
            }
        }
    }

    /// Route a request to the appropriate handler.
    ///
    /// `Status` and `Stop` concern the daemon rather than a session and are
    /// rejected here; the orchestrator answers them.
    pub async fn route(&self, request: IpcRequest) -> RouterResult {
        debug!(?request, "Routing request");

        match request {
            IpcRequest::Ping => Ok(IpcResponse::Pong),
            IpcRequest::Status | IpcRequest::Stop => Err(RouterError::InvalidRequest(
                "daemon control requests are not routed to sessions".to_string(),
            )),
            IpcRequest::ListSessions => self.handle_list().await,
            IpcRequest::CreateSession {
                argv,
                env,
                cwd,
                rows,
                cols,
            } => self.handle_create(argv, env, cwd, rows, cols).await,
            IpcRequest::GetSession { session_id } => self.handle_get(session_id).await,
            IpcRequest::Submit { session_id, text } => self.handle_submit(session_id, text).await,
            IpcRequest::GetInvocation {
                session_id,
                invocation_id,
            } => self.handle_get_invocation(session_id, invocation_id),
            IpcRequest::Write { session_id, data } => self.handle_write(session_id, data).await,
            IpcRequest::Drain {
                session_id,
                cursor,
                max_bytes,
            } => self.handle_drain(session_id, cursor, max_bytes),
            IpcRequest::Resize {
                session_id,
                rows,
                cols,
            } => self.handle_resize(session_id, rows, cols).await,
            IpcRequest::Signal { session_id, signal } => self.handle_signal(session_id, signal),
            IpcRequest::Terminate { session_id, force } => {
                self.handle_terminate(session_id, force).await
            }
        }
    }

    // =========================================================================
    // Session Handlers
    // =========================================================================

    async fn handle_create(
        &self,
        argv: Vec<String>,
        env: Vec<(String, String)>,
        cwd: Option<String>,
        rows: Option<u16>,
        cols: Option<u16>,
    ) -> RouterResult {
        let size = match (rows, cols) {
            (None, None) => None,
            (rows, cols) => {
                let default = TerminalSize::default();
                Some(TerminalSize::new(
                    rows.unwrap_or(default.rows()),
                    cols.unwrap_or(default.cols()),
                )?)
            }
        };

        info!(argv = ?argv, size = ?size, "Creating new session");

        let spec = SessionSpec {
            argv,
            env,
            cwd: cwd.map(PathBuf::from),
            size,
        };
        let session_id = self.session_manager.create(spec).await?;
        let pid = self
            .session_manager
            .info(&session_id)
            .await
            .map(|info| info.pid)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        info!(session_id = %session_id, pid = pid, "Session created");

        Ok(IpcResponse::SessionCreated { session_id, pid })
    }

    async fn handle_list(&self) -> RouterResult {
        let sessions = self
            .session_manager
            .list()
            .await
            .into_iter()
            .map(session_summary)
            .collect();
        Ok(IpcResponse::Sessions { sessions })
    }

    async fn handle_get(&self, session_id: SessionId) -> RouterResult {
        match self.session_manager.info(&session_id).await {
            Some(info) => Ok(IpcResponse::Session {
                session: session_summary(info),
            }),
            None => Err(SessionError::NotFound(session_id).into()),
        }
    }

    async fn handle_submit(&self, session_id: SessionId, text: String) -> RouterResult {
        let invocation = self.session_manager.submit(&session_id, text).await?;
        debug!(
            session_id = %session_id,
            invocation_id = %invocation.id,
            status = invocation.status.as_str(),
            "Command submitted"
        );
        Ok(IpcResponse::Invocation {
            invocation: invocation_summary(&invocation),
        })
    }

    fn handle_get_invocation(&self, session_id: SessionId, invocation_id: String) -> RouterResult {
        let session = self.session_manager.get(&session_id)?;
        let invocation = session
            .invocation(&invocation_id)
            .ok_or(RouterError::InvocationNotFound(invocation_id))?;
        Ok(IpcResponse::Invocation {
            invocation: invocation_summary(&invocation),
        })
    }

    async fn handle_write(&self, session_id: SessionId, data: Payload) -> RouterResult {
        self.session_manager
            .write(&session_id, data.as_bytes())
            .await?;
        Ok(IpcResponse::Ack)
    }

    fn handle_drain(
        &self,
        session_id: SessionId,
        cursor: u64,
        max_bytes: Option<usize>,
    ) -> RouterResult {
        let (data, cursor) = match max_bytes {
            None => self.session_manager.drain_output(&session_id, cursor)?,
            Some(max) => self
                .session_manager
                .get(&session_id)?
                .drain_output_limited(cursor, max)?,
        };
        Ok(IpcResponse::Output {
            data: Payload::new(data),
            cursor,
        })
    }

    async fn handle_resize(&self, session_id: SessionId, rows: u16, cols: u16) -> RouterResult {
        let size = TerminalSize::new(rows, cols)?;
        self.session_manager.resize(&session_id, size).await?;
        debug!(session_id = %session_id, rows, cols, "Session resized");
        Ok(IpcResponse::Ack)
    }

    fn handle_signal(&self, session_id: SessionId, signal: i32) -> RouterResult {
        let sig = match AllowedSignal::try_from(signal) {
            Ok(sig) => sig,
            Err(e) => {
                warn!(session_id = %session_id, signal, "Rejected signal outside the allow-list");
                return Err(e.into());
            }
        };
        self.session_manager.signal(&session_id, sig)?;
        Ok(IpcResponse::Ack)
    }

    async fn handle_terminate(&self, session_id: SessionId, force: bool) -> RouterResult {
        info!(session_id = %session_id, force, "Terminating session");
        let process = self.session_manager.terminate(&session_id, force).await?;
        Ok(IpcResponse::Terminated {
            session_id,
            process: process_state_info(&process),
        })
    }
}

// =========================================================================
// Wire conversions
// =========================================================================

/// Converts an exit status to its wire form.
pub fn exit_info(status: ExitStatus) -> ExitInfo {
    match status {
        ExitStatus::Code(code) => ExitInfo::Code(code),
        ExitStatus::Signaled(sig) => ExitInfo::Signaled(sig),
    }
}

/// Converts a process state to its wire form.
pub fn process_state_info(state: &ProcessState) -> ProcessStateInfo {
    match state {
        ProcessState::Starting => ProcessStateInfo::Starting,
        ProcessState::Running => ProcessStateInfo::Running,
        ProcessState::Draining => ProcessStateInfo::Draining,
        ProcessState::Exited(status) => ProcessStateInfo::Exited {
            exit: exit_info(*status),
        },
        ProcessState::Failed(reason) => ProcessStateInfo::Failed {
            reason: reason.clone(),
        },
    }
}

/// Converts a session snapshot to its wire form.
pub fn session_summary(info: SessionInfo) -> SessionSummary {
    SessionSummary {
        process: process_state_info(&info.process),
        state: info.state.as_str().to_string(),
        rows: info.size.rows(),
        cols: info.size.cols(),
        id: info.id,
        argv: info.argv,
        pid: info.pid,
        created_at: info.created_at,
        last_activity: info.last_activity,
        in_flight: info.in_flight,
        queued: info.queued,
        output_start: info.output_start,
        output_end: info.output_end,
        subscribers: info.subscribers,
        chunks_published: info.chunks_published,
        overflow_events: info.overflow_events,
    }
}

/// Converts an invocation to its wire form.
pub fn invocation_summary(invocation: &CommandInvocation) -> InvocationSummary {
    InvocationSummary {
        id: invocation.id.clone(),
        text: invocation.text.clone(),
        status: invocation.status.as_str().to_string(),
        submitted_at: invocation.submitted_at,
        dispatched_at: invocation.dispatched_at,
        completed_at: invocation.completed_at,
    }
}
