//! Session manager for managing multiple PTY sessions.
//!
//! The registry is a concurrent map of live sessions plus a slot counter that
//! enforces the session ceiling. A slot is reserved before anything is
//! spawned and released as soon as the session's process is gone, so crashed
//! sessions stay inspectable without holding capacity.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::command::CommandInvocation;
use super::error::{SessionError, SessionId};
use super::instance::{Session, SessionInfo, SessionOptions, SessionSpec};
use super::multiplexer::Subscription;
use super::process::{AllowedSignal, ProcessState};
use super::pty::TerminalSize;

/// Trait for session management operations.
///
/// Implementations must be thread-safe and suitable for concurrent access.
#[allow(async_fn_in_trait)]
pub trait SessionManager: Send + Sync {
    /// Creates a new session and returns its ID.
    ///
    /// Fails with [`SessionError::CapacityExceeded`] before spawning anything
    /// once the ceiling is reached.
    async fn create(&self, spec: SessionSpec) -> Result<SessionId, SessionError>;

    /// Returns a session by ID.
    fn get(&self, session_id: &SessionId) -> Result<Arc<Session>, SessionError>;

    /// Gets information about a specific session.
    async fn info(&self, session_id: &SessionId) -> Option<SessionInfo>;

    /// Submits a command line to a session.
    async fn submit(
        &self,
        session_id: &SessionId,
        text: String,
    ) -> Result<CommandInvocation, SessionError>;

    /// Writes raw data to a session's input.
    async fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SessionError>;

    /// Reads retained output from `cursor` on.
    fn drain_output(
        &self,
        session_id: &SessionId,
        cursor: u64,
    ) -> Result<(Vec<u8>, u64), SessionError>;

    /// Attaches a live output subscriber.
    async fn subscribe(&self, session_id: &SessionId) -> Result<Subscription, SessionError>;

    /// Resizes a session's terminal.
    async fn resize(&self, session_id: &SessionId, size: TerminalSize)
        -> Result<(), SessionError>;

    /// Forwards an allow-listed signal.
    fn signal(&self, session_id: &SessionId, sig: AllowedSignal) -> Result<(), SessionError>;

    /// Terminates a session and removes it from the registry.
    async fn terminate(
        &self,
        session_id: &SessionId,
        force: bool,
    ) -> Result<ProcessState, SessionError>;

    /// Lists all registered sessions.
    async fn list(&self) -> Vec<SessionInfo>;

    /// Checks if a session is registered.
    fn exists(&self, session_id: &SessionId) -> bool;

    /// Returns the number of registered sessions.
    fn count(&self) -> usize;
}

/// Registry-wide limits and session defaults.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Maximum sessions whose process is alive.
    pub max_sessions: usize,
    /// Sessions without input or output for this long are terminated.
    pub idle_timeout: Duration,
    /// How often the sweep task runs.
    pub sweep_interval: Duration,
    /// argv used when a create request carries none.
    pub default_command: Vec<String>,
    /// Per-session tunables.
    pub session: SessionOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(30),
            default_command: vec!["/bin/sh".to_string()],
            session: SessionOptions::default(),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Finished sessions dropped from the registry.
    pub removed: usize,
    /// Idle sessions terminated.
    pub idle_terminated: usize,
}

/// A reserved unit of capacity. Dropping it frees the slot.
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Entry {
    session: Arc<Session>,
    slot: Mutex<Option<Slot>>,
}

impl Entry {
    fn release_slot(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }
}

#[derive(Default)]
struct Registry {
    sessions: DashMap<SessionId, Arc<Entry>>,
    live: Arc<AtomicUsize>,
}

impl Registry {
    fn lookup(&self, session_id: &SessionId) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(&entry.session))
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))
    }

    fn remove(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions
            .remove(session_id)
            .map(|(_, entry)| Arc::clone(&entry.session))
    }
}

/// Thread-safe session manager implementation using DashMap.
pub struct SessionManagerImpl {
    registry: Arc<Registry>,
    options: ManagerOptions,
}

impl SessionManagerImpl {
    /// Creates a manager with default limits.
    pub fn new() -> Self {
        Self::with_options(ManagerOptions::default())
    }

    /// Creates a manager with the given limits.
    pub fn with_options(options: ManagerOptions) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            options,
        }
    }

    /// Limits this manager runs with.
    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Sessions whose process is still alive.
    pub fn live_count(&self) -> usize {
        self.registry.live.load(Ordering::Acquire)
    }

    fn reserve_slot(&self) -> Result<Slot, SessionError> {
        let max = self.options.max_sessions;
        self.registry
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| Slot(Arc::clone(&self.registry.live)))
            .map_err(|_| SessionError::CapacityExceeded { max })
    }

    /// Removes finished sessions and terminates idle ones.
    pub async fn sweep(&self) -> SweepReport {
        let mut finished = Vec::new();
        let mut idle = Vec::new();

        for entry in self.registry.sessions.iter() {
            let session = &entry.value().session;
            let state = session.state();
            if state.is_terminal() {
                finished.push(entry.key().clone());
            } else if state.accepts_input() && session.idle_for() >= self.options.idle_timeout {
                idle.push(Arc::clone(session));
            }
        }

        let mut report = SweepReport::default();
        for id in finished {
            if self.registry.remove(&id).is_some() {
                report.removed += 1;
                tracing::info!(session_id = %id, "Cleaned up terminated session");
            }
        }

        let mut tasks = JoinSet::new();
        for session in idle {
            let registry = Arc::clone(&self.registry);
            tasks.spawn(async move {
                tracing::info!(
                    session_id = %session.id(),
                    idle_secs = session.idle_for().as_secs(),
                    "Terminating idle session"
                );
                let result = session.terminate(false).await;
                registry.remove(session.id());
                result.is_ok()
            });
        }
        while let Some(done) = tasks.join_next().await {
            if matches!(done, Ok(true)) {
                report.idle_terminated += 1;
            }
        }

        report
    }

    /// Starts a background task that sweeps periodically until `token` is
    /// cancelled.
    pub fn start_sweep_task(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.options.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let report = manager.sweep().await;
                        if report != SweepReport::default() {
                            tracing::debug!(
                                removed = report.removed,
                                idle_terminated = report.idle_terminated,
                                "Sweep finished"
                            );
                        }
                    }
                }
            }
            tracing::debug!("Sweep task stopped");
        })
    }

    /// Terminates every session concurrently and waits for all of them.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self
            .registry
            .sessions
            .iter()
            .map(|entry| Arc::clone(&entry.session))
            .collect();

        tracing::info!(count = sessions.len(), "Shutting down all sessions");

        let mut tasks = JoinSet::new();
        for session in sessions {
            tasks.spawn(async move {
                if let Err(e) = session.terminate(false).await {
                    tracing::warn!(
                        session_id = %session.id(),
                        error = %e,
                        "Failed to terminate session"
                    );
                }
                session.id().clone()
            });
        }
        while let Some(done) = tasks.join_next().await {
            if let Ok(id) = done {
                self.registry.remove(&id);
            }
        }
    }
}

impl Default for SessionManagerImpl {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager for SessionManagerImpl {
    async fn create(&self, mut spec: SessionSpec) -> Result<SessionId, SessionError> {
        let slot = self.reserve_slot()?;

        if spec.argv.is_empty() {
            spec.argv = self.options.default_command.clone();
        }
        // On error the slot drops here and the reservation is undone.
        let session = Session::spawn(spec, self.options.session.clone())?;
        let session_id = session.id().clone();

        self.registry.sessions.insert(
            session_id.clone(),
            Arc::new(Entry {
                session: Arc::clone(&session),
                slot: Mutex::new(Some(slot)),
            }),
        );

        let registry: Weak<Registry> = Arc::downgrade(&self.registry);
        session.set_exit_hook(Box::new(move |id, state| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let entry = registry.sessions.get(id).map(|e| Arc::clone(e.value()));
            if let Some(entry) = entry {
                if entry.release_slot() {
                    tracing::debug!(session_id = %id, state = %state, "Released session slot");
                }
            }
        }));

        tracing::info!(
            session_id = %session_id,
            pid = session.pid(),
            live = self.live_count(),
            "Registered session"
        );

        Ok(session_id)
    }

    fn get(&self, session_id: &SessionId) -> Result<Arc<Session>, SessionError> {
        self.registry.lookup(session_id)
    }

    async fn info(&self, session_id: &SessionId) -> Option<SessionInfo> {
        let session = self.registry.lookup(session_id).ok()?;
        Some(session.info().await)
    }

    async fn submit(
        &self,
        session_id: &SessionId,
        text: String,
    ) -> Result<CommandInvocation, SessionError> {
        self.registry.lookup(session_id)?.submit(text).await
    }

    async fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SessionError> {
        self.registry.lookup(session_id)?.write(data).await
    }

    fn drain_output(
        &self,
        session_id: &SessionId,
        cursor: u64,
    ) -> Result<(Vec<u8>, u64), SessionError> {
        self.registry.lookup(session_id)?.drain_output(cursor)
    }

    async fn subscribe(&self, session_id: &SessionId) -> Result<Subscription, SessionError> {
        let session = self.registry.lookup(session_id)?;
        let state = session.state();
        if state.is_terminal() {
            return Err(SessionError::NotRunning {
                id: session_id.clone(),
                state,
            });
        }
        Ok(session.subscribe().await)
    }

    async fn resize(
        &self,
        session_id: &SessionId,
        size: TerminalSize,
    ) -> Result<(), SessionError> {
        self.registry.lookup(session_id)?.resize(size).await
    }

    fn signal(&self, session_id: &SessionId, sig: AllowedSignal) -> Result<(), SessionError> {
        self.registry.lookup(session_id)?.signal(sig)
    }

    async fn terminate(
        &self,
        session_id: &SessionId,
        force: bool,
    ) -> Result<ProcessState, SessionError> {
        let session = self.registry.lookup(session_id)?;
        let result = session.terminate(force).await;

        self.registry.remove(session_id);
        tracing::info!(
            session_id = %session_id,
            result = ?result,
            "Session terminated and removed"
        );

        result
    }

    async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self
            .registry
            .sessions
            .iter()
            .map(|entry| Arc::clone(&entry.session))
            .collect();

        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    fn exists(&self, session_id: &SessionId) -> bool {
        self.registry.sessions.contains_key(session_id)
    }

    fn count(&self) -> usize {
        self.registry.sessions.len()
    }
}
