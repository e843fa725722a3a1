//! Daemon orchestrator for wiring together all components.
//!
//! The `DaemonOrchestrator` owns the configuration, the session manager and
//! the IPC server. `start` binds the control socket, writes the PID file and
//! spawns the sweep and accept tasks; `stop` cancels them, shuts every
//! session down and removes the socket and PID file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::ipc::{self, IpcConnection, IpcError, IpcRequest, IpcResponse, IpcServer};
use crate::router::MessageRouter;
use crate::session::{SessionManager, SessionManagerImpl};

/// How long `stop` waits for background tasks to wind down.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A CLI client connected to the control socket.
    ClientConnected { client_id: String },
    /// A CLI client disconnected.
    ClientDisconnected { client_id: String },
    /// A client asked the daemon to stop.
    StopRequested,
    /// Error occurred.
    Error { message: String },
}

/// What every connection handler needs.
struct ConnectionContext {
    router: MessageRouter<SessionManagerImpl>,
    session_manager: Arc<SessionManagerImpl>,
    started_at: Instant,
    stop_request: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl ConnectionContext {
    async fn respond(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Status => IpcResponse::Status {
                running: true,
                uptime_secs: self.started_at.elapsed().as_secs(),
                session_count: self.session_manager.count(),
                live_sessions: self.session_manager.live_count(),
                max_sessions: self.session_manager.options().max_sessions,
            },
            IpcRequest::Stop => {
                info!("Stop requested over IPC");
                self.stop_request.cancel();
                let _ = self.event_tx.send(OrchestratorEvent::StopRequested);
                IpcResponse::Stopping
            }
            other => self.router.handle(other).await,
        }
    }
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Control socket location.
    socket_path: PathBuf,
    /// PID file written on start, if any.
    pid_file: Option<PathBuf>,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Session manager for PTY sessions.
    session_manager: Arc<SessionManagerImpl>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Cancelled when a client sends `Stop`.
    stop_request: CancellationToken,
    /// Sweep and accept tasks.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator. Nothing is bound or spawned yet.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let session_manager = Arc::new(SessionManagerImpl::with_options(config.manager_options()));
        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            socket_path: config.socket_path(),
            config,
            pid_file: None,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            session_manager,
            shutdown_token: CancellationToken::new(),
            stop_request: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            event_tx,
        })
    }

    /// Writes the daemon PID to `path` on start and removes it on stop.
    pub fn with_pid_file(mut self, path: PathBuf) -> Self {
        self.pid_file = Some(path);
        self
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the daemon orchestrator.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!(socket = %self.socket_path.display(), "Starting daemon orchestrator...");

        let server = match IpcServer::bind(&self.socket_path).await {
            Ok(server) => server,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                return Err(e).with_context(|| {
                    format!("Failed to bind control socket: {}", self.socket_path.display())
                });
            }
        };

        if let Some(pid_file) = &self.pid_file {
            if let Err(e) = ipc::write_pid_file(pid_file) {
                let _ = std::fs::remove_file(&self.socket_path);
                *self.state.write().await = OrchestratorState::Stopped;
                return Err(e).with_context(|| {
                    format!("Failed to write PID file: {}", pid_file.display())
                });
            }
        }

        let mut tasks = self.tasks.lock().await;

        tasks.push(
            self.session_manager
                .start_sweep_task(self.shutdown_token.child_token()),
        );
        debug!("Started session sweep task");

        let ctx = Arc::new(ConnectionContext {
            router: MessageRouter::new(Arc::clone(&self.session_manager)),
            session_manager: Arc::clone(&self.session_manager),
            started_at: Instant::now(),
            stop_request: self.stop_request.clone(),
            event_tx: self.event_tx.clone(),
        });
        let token = self.shutdown_token.clone();
        tasks.push(tokio::spawn(Self::accept_loop(server, ctx, token)));
        drop(tasks);

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(
            max_sessions = self.config.session.max_sessions,
            "Daemon orchestrator started successfully"
        );
        Ok(())
    }

    async fn accept_loop(server: IpcServer, ctx: Arc<ConnectionContext>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Accept loop received shutdown signal");
                    break;
                }
                accepted = server.accept() => match accepted {
                    Ok(conn) => {
                        let client_id = Uuid::new_v4().to_string();
                        debug!(client_id = %client_id, "Client connected");
                        let _ = ctx.event_tx.send(OrchestratorEvent::ClientConnected {
                            client_id: client_id.clone(),
                        });
                        tokio::spawn(Self::handle_connection(
                            conn,
                            client_id,
                            Arc::clone(&ctx),
                            token.child_token(),
                        ));
                    }
                    Err(e) => {
                        error!("Failed to accept IPC connection: {}", e);
                        let _ = ctx.event_tx.send(OrchestratorEvent::Error {
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    async fn handle_connection(
        mut conn: IpcConnection,
        client_id: String,
        ctx: Arc<ConnectionContext>,
        token: CancellationToken,
    ) {
        loop {
            let request = tokio::select! {
                _ = token.cancelled() => break,
                request = conn.read_request() => request,
            };

            let response = match request {
                Ok(Some(request)) => ctx.respond(request).await,
                Ok(None) => break,
                Err(IpcError::Protocol(e)) => {
                    warn!(client_id = %client_id, error = %e, "Malformed request");
                    IpcResponse::error(protocol::ErrorKind::InvalidRequest, e.to_string())
                }
                Err(e) => {
                    debug!(client_id = %client_id, error = %e, "Connection read failed");
                    break;
                }
            };

            if let Err(e) = conn.send_response(&response).await {
                debug!(client_id = %client_id, error = %e, "Failed to send response");
                break;
            }
        }

        debug!(client_id = %client_id, "Client disconnected");
        let _ = ctx
            .event_tx
            .send(OrchestratorEvent::ClientDisconnected { client_id });
    }

    /// Resolves once a client has sent `Stop`.
    pub async fn stop_requested(&self) {
        self.stop_request.cancelled().await
    }

    /// Stops the daemon orchestrator gracefully.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }

        self.session_manager.shutdown().await;

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Error removing socket {}: {}", self.socket_path.display(), e);
            }
        }
        if let Some(pid_file) = &self.pid_file {
            ipc::remove_pid_file(pid_file);
        }

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session manager.
    pub fn session_manager(&self) -> &Arc<SessionManagerImpl> {
        &self.session_manager
    }

    /// Returns the control socket path.
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
