//! Single-owner handle over a child process and its PTY master.
//!
//! Every descriptor lives in an `Option` that [`ProcessHandle::cleanup`] takes
//! exactly once. The child is reaped with our own `waitpid` so the exit status
//! is observed in one place and cached.

use std::io::{ErrorKind as StdIoKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use portable_pty::{Child, MasterPty};
use tokio::time::{sleep, Instant};

use super::error::{IoError, LaunchError, SessionError};
use super::pty::{self, TerminalSize};

/// Read buffer size for a single PTY read.
const READ_CHUNK: usize = 4096;

/// Sleep between read attempts while waiting for data.
const READ_SLICE: Duration = Duration::from_millis(10);

/// Sleep between write attempts while the PTY input queue is full.
const WRITE_SLICE: Duration = Duration::from_millis(5);

/// How long a write may stay blocked on a full PTY.
const WRITE_DEADLINE: Duration = Duration::from_secs(2);

/// Upper bound on reaping after SIGKILL in [`ProcessHandle::terminate_now`].
const KILL_DEADLINE: Duration = Duration::from_secs(2);

/// Poll interval for [`ProcessHandle::wait`].
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    /// Normal exit with the given code.
    Code(i32),
    /// Terminated by the given signal number.
    Signaled(i32),
}

impl ExitStatus {
    /// True for `Code(0)`.
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit code {code}"),
            ExitStatus::Signaled(sig) => write!(f, "killed by signal {sig}"),
        }
    }
}

/// Lifecycle of the child process as seen by its handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawned, handle not yet fully wired.
    Starting,
    /// Alive.
    Running,
    /// A stop was requested; waiting for the child to go away.
    Draining,
    /// Reaped.
    Exited(ExitStatus),
    /// The child could not be observed (for example reaped elsewhere).
    Failed(String),
}

impl ProcessState {
    /// True once the child can no longer run.
    pub fn is_finished(&self) -> bool {
        matches!(self, ProcessState::Exited(_) | ProcessState::Failed(_))
    }
}

/// Signals that may be forwarded to a session's child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllowedSignal {
    /// SIGINT
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGWINCH
    WindowChange,
    /// SIGKILL
    Kill,
}

impl AllowedSignal {
    fn as_nix(self) -> Signal {
        match self {
            AllowedSignal::Interrupt => Signal::SIGINT,
            AllowedSignal::Terminate => Signal::SIGTERM,
            AllowedSignal::WindowChange => Signal::SIGWINCH,
            AllowedSignal::Kill => Signal::SIGKILL,
        }
    }

    /// Raw signal number.
    pub fn number(self) -> i32 {
        self.as_nix() as i32
    }
}

impl TryFrom<i32> for AllowedSignal {
    type Error = SessionError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match Signal::try_from(value) {
            Ok(Signal::SIGINT) => Ok(AllowedSignal::Interrupt),
            Ok(Signal::SIGTERM) => Ok(AllowedSignal::Terminate),
            Ok(Signal::SIGWINCH) => Ok(AllowedSignal::WindowChange),
            Ok(Signal::SIGKILL) => Ok(AllowedSignal::Kill),
            _ => Err(SessionError::SignalNotAllowed(value)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns a child process, its pid and the PTY master.
pub struct ProcessHandle {
    pid: Pid,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    state: Mutex<ProcessState>,
    cleaned: AtomicBool,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("cleaned", &self.cleaned.load(Ordering::Acquire))
            .finish()
    }
}

impl ProcessHandle {
    pub(crate) fn new(
        master: Box<dyn MasterPty + Send>,
        child: Box<dyn Child + Send + Sync>,
    ) -> Result<Self, LaunchError> {
        let raw_pid = child
            .process_id()
            .ok_or_else(|| LaunchError::ResourceExhausted("child has no pid".to_string()))?;
        let pid = Pid::from_raw(raw_pid as i32);

        let handle = Self {
            pid,
            master: Mutex::new(None),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            child: Mutex::new(Some(child)),
            state: Mutex::new(ProcessState::Starting),
            cleaned: AtomicBool::new(false),
        };

        // On failure the handle is dropped, which kills and reaps the child.
        let reader = master
            .try_clone_reader()
            .map_err(|e| LaunchError::ResourceExhausted(format!("PTY reader: {e}")))?;
        let writer = master
            .take_writer()
            .map_err(|e| LaunchError::ResourceExhausted(format!("PTY writer: {e}")))?;

        *lock(&handle.reader) = Some(reader);
        *lock(&handle.writer) = Some(writer);
        *lock(&handle.master) = Some(master);
        *lock(&handle.state) = ProcessState::Running;

        Ok(handle)
    }

    /// Child process id.
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Current process state.
    pub fn state(&self) -> ProcessState {
        lock(&self.state).clone()
    }

    /// True while the child has not been reaped.
    pub fn is_live(&self) -> bool {
        !self.state().is_finished()
    }

    /// Marks the process as being stopped. No effect once finished.
    pub fn mark_draining(&self) {
        let mut state = lock(&self.state);
        if !state.is_finished() {
            *state = ProcessState::Draining;
        }
    }

    /// Returns whatever output is available within `timeout`.
    ///
    /// `Ok(None)` means nothing arrived in time; it is not an error. Once the
    /// child side is closed every call returns [`IoError::Eof`].
    pub async fn read_nonblocking(&self, timeout: Duration) -> Result<Option<Vec<u8>>, IoError> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            match self.read_once(&mut buf) {
                Ok(Some(n)) => {
                    buf.truncate(n);
                    return Ok(Some(buf));
                }
                Ok(None) => {}
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(READ_SLICE.min(deadline - now)).await;
        }
    }

    fn read_once(&self, buf: &mut [u8]) -> Result<Option<usize>, IoError> {
        let mut reader = lock(&self.reader);
        let Some(reader) = reader.as_mut() else {
            return Err(IoError::Eof);
        };

        match reader.read(buf) {
            Ok(0) => Err(IoError::Eof),
            Ok(n) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), StdIoKind::WouldBlock | StdIoKind::Interrupted) => {
                Ok(None)
            }
            // Linux reports EIO on the master once the slave is closed.
            Err(e) => {
                tracing::trace!(pid = self.pid(), error = %e, "PTY read ended");
                Err(IoError::Eof)
            }
        }
    }

    /// Writes all of `data` to the PTY master.
    pub async fn write(&self, data: &[u8]) -> Result<(), IoError> {
        let deadline = Instant::now() + WRITE_DEADLINE;
        let mut written = 0;

        while written < data.len() {
            if self.cleaned.load(Ordering::Acquire) || self.state().is_finished() {
                return Err(IoError::Pipe);
            }

            match self.write_once(&data[written..]) {
                Ok(Some(n)) => written += n,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        return Err(IoError::Timeout);
                    }
                    sleep(WRITE_SLICE).await;
                }
                Err(e) => return Err(e),
            }
        }

        let mut writer = lock(&self.writer);
        if let Some(writer) = writer.as_mut() {
            match writer.flush() {
                Ok(()) => {}
                Err(e) if e.kind() == StdIoKind::WouldBlock => {}
                Err(_) => return Err(IoError::Pipe),
            }
        }
        Ok(())
    }

    fn write_once(&self, data: &[u8]) -> Result<Option<usize>, IoError> {
        let mut writer = lock(&self.writer);
        let Some(writer) = writer.as_mut() else {
            return Err(IoError::Pipe);
        };

        match writer.write(data) {
            Ok(0) => Err(IoError::Pipe),
            Ok(n) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), StdIoKind::WouldBlock | StdIoKind::Interrupted) => {
                Ok(None)
            }
            Err(e) => {
                tracing::debug!(pid = self.pid(), error = %e, "PTY write failed");
                Err(IoError::Pipe)
            }
        }
    }

    /// Delivers an allow-listed signal. A reaped child is left alone, since
    /// its pid may already belong to another process.
    pub fn send_signal(&self, sig: AllowedSignal) -> Result<(), IoError> {
        if self.state().is_finished() {
            return Ok(());
        }

        match kill(self.pid, sig.as_nix()) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => {
                tracing::warn!(
                    pid = self.pid(),
                    signal = ?sig,
                    error = %e,
                    "Failed to signal child"
                );
                Err(IoError::Pipe)
            }
        }
    }

    /// Reaps the child if it has exited, without blocking.
    pub fn try_wait(&self) -> Result<Option<ExitStatus>, IoError> {
        let mut state = lock(&self.state);
        match &*state {
            ProcessState::Exited(status) => return Ok(Some(*status)),
            ProcessState::Failed(_) => return Err(IoError::Eof),
            _ => {}
        }

        let status = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => ExitStatus::Code(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => ExitStatus::Signaled(sig as i32),
            Ok(_) => return Ok(None),
            Err(Errno::EINTR) => return Ok(None),
            Err(e) => {
                tracing::warn!(pid = self.pid(), error = %e, "waitpid failed");
                *state = ProcessState::Failed(format!("waitpid: {e}"));
                return Err(IoError::Eof);
            }
        };

        tracing::debug!(pid = self.pid(), status = %status, "Reaped child");
        *state = ProcessState::Exited(status);
        Ok(Some(status))
    }

    /// Waits until the child terminates and returns its status.
    ///
    /// Cancel-safe: dropping the future leaves the handle untouched, and the
    /// status is cached once observed.
    pub async fn wait(&self) -> Result<ExitStatus, IoError> {
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(status);
            }
            sleep(WAIT_SLICE).await;
        }
    }

    /// SIGKILLs the child, waits briefly for it and releases the master.
    pub async fn terminate_now(&self) -> Option<ExitStatus> {
        let _ = self.send_signal(AllowedSignal::Kill);
        let status = tokio::time::timeout(KILL_DEADLINE, self.wait())
            .await
            .ok()
            .and_then(Result::ok);
        self.cleanup();
        status
    }

    /// Applies a new window size to the PTY.
    pub fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        let master = lock(&self.master);
        let master = master.as_ref().ok_or(SessionError::Io(IoError::Pipe))?;
        pty::resize(master.as_ref(), size)
    }

    /// Live window size of the PTY.
    pub fn size(&self) -> Result<TerminalSize, SessionError> {
        let master = lock(&self.master);
        let master = master.as_ref().ok_or(SessionError::Io(IoError::Pipe))?;
        pty::size(master.as_ref())
    }

    /// True once [`cleanup`](Self::cleanup) has run.
    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned.load(Ordering::Acquire)
    }

    /// Closes the PTY master. Only the first call does anything.
    pub fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }

        // Writer first: its drop may push a final EOF to the child.
        drop(lock(&self.writer).take());
        drop(lock(&self.reader).take());
        drop(lock(&self.master).take());
        drop(lock(&self.child).take());

        tracing::trace!(pid = self.pid(), "Released PTY master");
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.cleanup();

        if !matches!(self.try_wait(), Ok(None)) {
            return;
        }

        tracing::warn!(pid = self.pid(), "Killing orphaned child");
        let _ = kill(self.pid, Signal::SIGKILL);
        if matches!(self.try_wait(), Ok(None)) {
            // Reap off-thread so a slow exit never stalls the runtime.
            let pid = self.pid;
            std::thread::spawn(move || {
                let _ = waitpid(pid, None);
            });
        }
    }
}
