//! A single PTY session: one child process, its output history, its command
//! queue and the state machine tying them together.
//!
//! A dedicated reader task is the only producer of output. It pushes every
//! chunk into the ring buffer and the broadcaster, and drives the launch and
//! debounce timers. Submission, raw writes, resizes and termination go through
//! a per-session async mutex so they never interleave with teardown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::buffer::OutputBuffer;
use super::command::{CommandInvocation, CommandQueue, QueueLimits};
use super::error::{IoError, SessionError, SessionId};
use super::multiplexer::{
    now_millis, SessionOutputBroadcaster, Subscription, DEFAULT_SUBSCRIBER_CAPACITY,
};
use super::process::{AllowedSignal, ExitStatus, ProcessHandle, ProcessState};
use super::pty::{self, LaunchSpec, TerminalSize};
use super::state::SessionState;

/// Called once when a session reaches `Terminated` or `Error`.
pub type ExitHook = Box<dyn FnOnce(&SessionId, SessionState) + Send>;

/// Runtime tunables for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Output bytes retained for draining.
    pub buffer_capacity: usize,
    /// In-flight and queue limits.
    pub limits: QueueLimits,
    /// Quiet period after which a busy session is considered idle.
    pub debounce: Duration,
    /// How long to wait for the first output before declaring the session idle.
    pub launch_timeout: Duration,
    /// Time between SIGTERM and SIGKILL during termination.
    pub grace_period: Duration,
    /// How long to wait for the child after SIGKILL.
    pub kill_timeout: Duration,
    /// Reader poll interval.
    pub poll_interval: Duration,
    /// Output marker that completes the running command immediately.
    pub completion_sentinel: Option<String>,
    /// Queue capacity (in chunks) for each subscriber.
    pub subscriber_capacity: usize,
    /// Window size used when a spec has none.
    pub default_size: TerminalSize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: 10 * 1024 * 1024,
            limits: QueueLimits::default(),
            debounce: Duration::from_millis(200),
            launch_timeout: Duration::from_millis(500),
            grace_period: Duration::from_secs(3),
            kill_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            completion_sentinel: None,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            default_size: TerminalSize::default(),
        }
    }
}

/// What to launch for a new session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSpec {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub size: Option<TerminalSize>,
}

impl SessionSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn size(mut self, size: TerminalSize) -> Self {
        self.size = Some(size);
        self
    }

    fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            argv: self.argv.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
        }
    }
}

/// Snapshot of a session for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Process ID of the child.
    pub pid: i32,
    /// Session lifecycle state.
    pub state: SessionState,
    /// Child process state.
    pub process: ProcessState,
    /// Current terminal size.
    pub size: TerminalSize,
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
    pub chunks_published: u64,
    /// Chunks discarded because a subscriber fell behind.
    pub overflow_events: u64,
}

impl SessionInfo {
    /// Exit status once the child has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self.process {
            ProcessState::Exited(status) => Some(status),
            _ => None,
        }
    }
}

struct Inner {
    buffer: OutputBuffer,
    commands: CommandQueue,
    size: TerminalSize,
    last_output: Option<Instant>,
    last_dispatch: Option<Instant>,
    last_activity: u64,
    /// Trailing bytes kept so a sentinel split across chunks is still found.
    sentinel_window: Vec<u8>,
    /// Terminal echoes of dispatched lines not yet seen in the output.
    pending_echoes: usize,
}

impl Inner {
    fn touch(&mut self) {
        self.last_activity = now_millis();
    }

    /// Records a dispatched line. Its echo never counts toward the sentinel.
    fn expect_echo(&mut self) {
        self.pending_echoes += 1;
        self.sentinel_window.clear();
    }

    fn scan_sentinel(&mut self, chunk: &[u8], sentinel: &[u8]) -> bool {
        let mut rest = chunk;
        while self.pending_echoes > 0 {
            match rest.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    rest = &rest[end + 1..];
                    self.pending_echoes -= 1;
                }
                None => return false,
            }
        }

        if sentinel.is_empty() || rest.is_empty() {
            return false;
        }

        self.sentinel_window.extend_from_slice(rest);
        let found = self
            .sentinel_window
            .windows(sentinel.len())
            .any(|w| w == sentinel);

        if found {
            self.sentinel_window.clear();
        } else {
            let keep = sentinel.len() - 1;
            let excess = self.sentinel_window.len().saturating_sub(keep);
            self.sentinel_window.drain(..excess);
        }
        found
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A PTY session.
pub struct Session {
    id: SessionId,
    argv: Vec<String>,
    created_at: u64,
    started: Instant,
    options: SessionOptions,
    process: ProcessHandle,
    state: watch::Sender<SessionState>,
    inner: Mutex<Inner>,
    /// Serializes submission, writes and resizes against teardown.
    control: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    broadcaster: SessionOutputBroadcaster,
    exit_hook: Mutex<Option<ExitHook>>,
    finalized: AtomicBool,
}

impl Session {
    /// Allocates a PTY, launches `spec.argv` on it and starts the reader task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(spec: SessionSpec, options: SessionOptions) -> Result<Arc<Self>, SessionError> {
        let size = spec.size.unwrap_or(options.default_size);
        let pty = pty::allocate(size)?;
        let process = pty::spawn(&spec.launch_spec(), pty)?;

        let id = Uuid::new_v4().to_string();
        let (state, _) = watch::channel(SessionState::Initializing);
        let now = now_millis();

        let session = Arc::new(Self {
            id,
            argv: spec.argv,
            created_at: now,
            started: Instant::now(),
            inner: Mutex::new(Inner {
                buffer: OutputBuffer::new(options.buffer_capacity),
                commands: CommandQueue::new(options.limits),
                size,
                last_output: None,
                last_dispatch: None,
                last_activity: now,
                sentinel_window: Vec::new(),
                pending_echoes: 0,
            }),
            broadcaster: SessionOutputBroadcaster::with_default_capacity(
                options.subscriber_capacity,
            ),
            options,
            process,
            state,
            control: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            exit_hook: Mutex::new(None),
            finalized: AtomicBool::new(false),
        });

        tracing::info!(
            session_id = %session.id,
            pid = session.process.pid(),
            rows = size.rows(),
            cols = size.cols(),
            "Created new session"
        );

        tokio::spawn(reader_loop(
            Arc::downgrade(&session),
            session.shutdown.clone(),
            session.options.poll_interval,
        ));

        Ok(session)
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the child's process ID.
    pub fn pid(&self) -> i32 {
        self.process.pid()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Current child process state.
    pub fn process_state(&self) -> ProcessState {
        self.process.state()
    }

    /// Creation time, Unix milliseconds.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Time since the last input or output.
    pub fn idle_for(&self) -> Duration {
        let last = lock(&self.inner).last_activity;
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    /// Registers the callback run when the session finishes. If it already
    /// has, the hook runs immediately.
    pub fn set_exit_hook(&self, hook: ExitHook) {
        let mut slot = lock(&self.exit_hook);
        if self.finalized.load(Ordering::Acquire) {
            drop(slot);
            hook(&self.id, self.state());
        } else {
            *slot = Some(hook);
        }
    }

    /// Applies `to` if the current state satisfies `from` and the edge is
    /// allowed. Returns whether the state changed.
    fn transition(&self, from: impl Fn(SessionState) -> bool, to: SessionState) -> bool {
        let mut previous = None;
        let changed = self.state.send_if_modified(|state| {
            if from(*state) && state.can_transition_to(to) {
                previous = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });

        if let Some(previous) = previous {
            tracing::debug!(
                session_id = %self.id,
                from = %previous,
                to = %to,
                "Session state changed"
            );
        }
        changed
    }

    /// Submits a command line. It is written with a trailing newline as soon
    /// as the session is idle and under its in-flight limit.
    pub async fn submit(&self, text: impl Into<String>) -> Result<CommandInvocation, SessionError> {
        let _guard = self.control.lock().await;
        self.ensure_accepts_input()?;

        let invocation = {
            let mut inner = lock(&self.inner);
            let invocation = inner.commands.admit(&self.id, text.into())?;
            inner.touch();
            invocation
        };
        tracing::debug!(
            session_id = %self.id,
            invocation_id = %invocation.id,
            "Command submitted"
        );

        self.dispatch_locked().await?;
        Ok(self.invocation(&invocation.id).unwrap_or(invocation))
    }

    /// Writes raw input (keystrokes) with no command bookkeeping.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let _guard = self.control.lock().await;
        self.ensure_accepts_input()?;

        lock(&self.inner).touch();
        if let Err(e) = self.process.write(data).await {
            self.fail_on_write(e).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Reads all retained output from `cursor` on.
    pub fn drain_output(&self, cursor: u64) -> Result<(Vec<u8>, u64), SessionError> {
        self.drain_output_limited(cursor, usize::MAX)
    }

    /// Reads at most `max` bytes of retained output from `cursor` on.
    pub fn drain_output_limited(
        &self,
        cursor: u64,
        max: usize,
    ) -> Result<(Vec<u8>, u64), SessionError> {
        lock(&self.inner).buffer.read_from(cursor, max)
    }

    /// The newest `n` retained output bytes.
    pub fn output_tail(&self, n: usize) -> Vec<u8> {
        lock(&self.inner).buffer.tail(n)
    }

    /// Attaches a live output subscriber.
    pub async fn subscribe(&self) -> Subscription {
        let subscription = self.broadcaster.subscribe().await;
        tracing::info!(
            session_id = %self.id,
            client_id = %subscription.id(),
            "Client attached to session"
        );
        subscription
    }

    /// Applies a new terminal size.
    pub async fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        let _guard = self.control.lock().await;
        self.ensure_accepts_input()?;

        self.process.resize(size)?;
        lock(&self.inner).size = size;
        tracing::debug!(
            session_id = %self.id,
            rows = size.rows(),
            cols = size.cols(),
            "Resized session"
        );
        Ok(())
    }

    /// Current terminal size, read from the PTY while it is open.
    pub fn size(&self) -> TerminalSize {
        self.process
            .size()
            .unwrap_or_else(|_| lock(&self.inner).size)
    }

    /// Forwards an allow-listed signal to the child.
    pub fn signal(&self, sig: AllowedSignal) -> Result<(), SessionError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(SessionError::NotRunning {
                id: self.id.clone(),
                state,
            });
        }
        tracing::info!(session_id = %self.id, signal = ?sig, "Forwarding signal");
        self.process.send_signal(sig)?;
        Ok(())
    }

    /// Stops the session: SIGTERM (SIGKILL when `force`), a grace period,
    /// then SIGKILL and a bounded wait for the reap.
    ///
    /// Calling this on a finished session returns its final process state.
    pub async fn terminate(&self, force: bool) -> Result<ProcessState, SessionError> {
        let _guard = self.control.lock().await;

        if !self.transition(SessionState::accepts_input, SessionState::Terminating) {
            return Ok(self.process.state());
        }

        let cancelled = lock(&self.inner).commands.cancel_all();
        tracing::info!(
            session_id = %self.id,
            pid = self.process.pid(),
            force = force,
            cancelled = cancelled,
            "Terminating session"
        );

        let first = if force {
            AllowedSignal::Kill
        } else {
            AllowedSignal::Terminate
        };
        let _ = self.process.send_signal(first);
        self.process.mark_draining();

        if timeout(self.options.grace_period, self.process.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                session_id = %self.id,
                pid = self.process.pid(),
                "Grace period elapsed, sending SIGKILL"
            );
            let _ = self.process.send_signal(AllowedSignal::Kill);

            if timeout(self.options.kill_timeout, self.process.wait())
                .await
                .is_err()
            {
                tracing::error!(
                    session_id = %self.id,
                    pid = self.process.pid(),
                    "Child survived SIGKILL"
                );
                self.transition(|s| s == SessionState::Terminating, SessionState::Error);
                self.finish().await;
                return Err(SessionError::TerminationTimeout(self.id.clone()));
            }
        }

        self.transition(|s| s == SessionState::Terminating, SessionState::Terminated);
        self.finish().await;
        Ok(self.process.state())
    }

    /// Looks up an invocation submitted to this session.
    pub fn invocation(&self, id: &str) -> Option<CommandInvocation> {
        lock(&self.inner).commands.get(id)
    }

    /// Waits until the state satisfies `pred`, up to `limit`.
    pub async fn wait_for_state(
        &self,
        pred: impl Fn(SessionState) -> bool,
        limit: Duration,
    ) -> Result<SessionState, SessionError> {
        let mut rx = self.state.subscribe();
        let result = match timeout(limit, rx.wait_for(|s| pred(*s))).await {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) => Err(SessionError::NotRunning {
                id: self.id.clone(),
                state: self.state(),
            }),
            Err(_) => Err(IoError::Timeout.into()),
        };
        result
    }

    /// Snapshot for listings.
    pub async fn info(&self) -> SessionInfo {
        let broadcast = self.broadcaster.stats().await;
        let size = self.size();
        let inner = lock(&self.inner);
        SessionInfo {
            id: self.id.clone(),
            argv: self.argv.clone(),
            pid: self.process.pid(),
            state: self.state(),
            process: self.process.state(),
            size,
            created_at: self.created_at,
            last_activity: inner.last_activity,
            in_flight: inner.commands.in_flight_len(),
            queued: inner.commands.queued_len(),
            output_start: inner.buffer.oldest_offset(),
            output_end: inner.buffer.end_offset(),
            subscribers: broadcast.subscribers,
            chunks_published: broadcast.chunks_published,
            overflow_events: broadcast.overflow_events,
        }
    }

    fn ensure_accepts_input(&self) -> Result<(), SessionError> {
        let state = self.state();
        if state.accepts_input() {
            Ok(())
        } else {
            Err(SessionError::NotRunning {
                id: self.id.clone(),
                state,
            })
        }
    }

    /// Writes queued commands while the session can take them. Caller holds
    /// the control lock.
    async fn dispatch_locked(&self) -> Result<(), SessionError> {
        loop {
            if !matches!(self.state(), SessionState::Idle | SessionState::Busy) {
                return Ok(());
            }

            let Some(invocation) = ({
                let mut inner = lock(&self.inner);
                let next = inner.commands.next_dispatchable();
                if next.is_some() {
                    inner.last_dispatch = Some(Instant::now());
                    inner.expect_echo();
                    inner.touch();
                }
                next
            }) else {
                return Ok(());
            };

            self.transition(|s| s == SessionState::Idle, SessionState::Busy);

            let mut line = invocation.text.into_bytes();
            line.push(b'\n');
            if let Err(e) = self.process.write(&line).await {
                lock(&self.inner).commands.fail(&invocation.id);
                self.fail_on_write(e).await;
                return Err(e.into());
            }

            tracing::debug!(
                session_id = %self.id,
                invocation_id = %invocation.id,
                "Dispatched command"
            );
        }
    }

    async fn dispatch_pending(&self) {
        if !lock(&self.inner).commands.has_pending() {
            return;
        }
        // A holder of the lock dispatches on its own.
        let Ok(_guard) = self.control.try_lock() else {
            return;
        };
        let _ = self.dispatch_locked().await;
    }

    async fn fail_on_write(&self, err: IoError) {
        if self.transition(SessionState::accepts_input, SessionState::Error) {
            tracing::warn!(session_id = %self.id, error = %err, "Write to PTY failed");
            self.reap_after_failure().await;
            self.finish().await;
        }
    }

    async fn on_output(&self, data: Vec<u8>) {
        let chunk = Bytes::from(data);
        let sentinel_hit = {
            let mut inner = lock(&self.inner);
            inner.buffer.push(&chunk);
            inner.last_output = Some(Instant::now());
            inner.touch();
            match self.options.completion_sentinel.as_deref() {
                Some(sentinel) => inner.scan_sentinel(&chunk, sentinel.as_bytes()),
                None => false,
            }
        };

        self.broadcaster.broadcast(chunk).await;

        self.transition(|s| s == SessionState::Initializing, SessionState::Idle);
        if sentinel_hit && self.state() == SessionState::Busy {
            tracing::trace!(session_id = %self.id, "Completion sentinel seen");
            self.complete_commands();
        }
    }

    fn on_tick(&self) {
        match self.state() {
            SessionState::Initializing
                if self.started.elapsed() >= self.options.launch_timeout =>
            {
                tracing::debug!(session_id = %self.id, "No output before launch timeout");
                self.transition(|s| s == SessionState::Initializing, SessionState::Idle);
            }
            SessionState::Busy => {
                let quiet_since = {
                    let inner = lock(&self.inner);
                    inner.last_output.max(inner.last_dispatch)
                };
                if quiet_since.is_some_and(|t| t.elapsed() >= self.options.debounce) {
                    self.complete_commands();
                }
            }
            _ => {}
        }
    }

    fn complete_commands(&self) {
        let completed = {
            let mut inner = lock(&self.inner);
            inner.pending_echoes = 0;
            inner.commands.complete_in_flight()
        };
        if self.transition(|s| s == SessionState::Busy, SessionState::Idle) {
            tracing::debug!(session_id = %self.id, completed = completed, "Command completed");
        }
    }

    /// The child side closed. Outside of termination this is a failure.
    async fn on_child_closed(&self) {
        if !self.state().accepts_input() {
            return;
        }

        // Reap before publishing the failure so observers see the exit status.
        let status = self.reap_after_failure().await;
        if !self.transition(SessionState::accepts_input, SessionState::Error) {
            return;
        }
        tracing::warn!(
            session_id = %self.id,
            pid = self.process.pid(),
            status = ?status,
            "PTY closed, session process exited"
        );
        self.finish().await;
    }

    /// Reaps a child that went away on its own, killing it if it lingers.
    async fn reap_after_failure(&self) -> Option<ExitStatus> {
        match timeout(self.options.kill_timeout, self.process.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(_)) => None,
            Err(_) => self.process.terminate_now().await,
        }
    }

    /// Runs once the session is terminal: cancels commands, stops the reader,
    /// releases the PTY, closes subscribers and notifies the owner.
    async fn finish(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }

        let cancelled = lock(&self.inner).commands.cancel_all();
        self.shutdown.cancel();
        self.process.cleanup();
        self.broadcaster.close().await;

        let state = self.state();
        tracing::info!(
            session_id = %self.id,
            state = %state,
            process = ?self.process.state(),
            cancelled = cancelled,
            "Session finished"
        );

        let hook = lock(&self.exit_hook).take();
        if let Some(hook) = hook {
            hook(&self.id, state);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.process.pid())
            .field("state", &self.state())
            .finish()
    }
}

async fn reader_loop(session: Weak<Session>, shutdown: CancellationToken, poll: Duration) {
    loop {
        let Some(session) = session.upgrade() else {
            break;
        };

        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = session.process.read_nonblocking(poll) => read,
        };

        match read {
            Ok(Some(data)) => session.on_output(data).await,
            Ok(None) => {}
            Err(_) => {
                tracing::info!(session_id = %session.id, "PTY EOF - reader loop ending");
                session.on_child_closed().await;
                break;
            }
        }

        session.on_tick();
        session.dispatch_pending().await;
    }

    tracing::debug!("Reader loop ended");
}
