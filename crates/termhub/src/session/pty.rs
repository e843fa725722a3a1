//! PTY allocation and process launch.
//!
//! [`allocate`] opens a master/slave pair with the requested window size and
//! switches the master to non-blocking mode. [`spawn`] starts an explicit
//! argv on the slave (never through a shell), drops the slave and hands the
//! master to a [`ProcessHandle`].

use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize, SlavePty};

use super::error::{AllocationError, LaunchError, SessionError};
use super::process::ProcessHandle;

/// Terminal window size. Both dimensions are always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TerminalSize {
    rows: u16,
    cols: u16,
}

impl TerminalSize {
    /// Creates a size, rejecting zero rows or columns.
    pub fn new(rows: u16, cols: u16) -> Result<Self, SessionError> {
        if rows == 0 || cols == 0 {
            return Err(SessionError::InvalidSize { rows, cols });
        }
        Ok(Self { rows, cols })
    }

    /// Number of rows.
    pub fn rows(&self) -> u16 {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> u16 {
        self.cols
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// A freshly allocated PTY pair, not yet bound to a process.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    slave: Box<dyn SlavePty + Send>,
}

impl Pty {
    /// Current window size of the pair.
    pub fn size(&self) -> Result<TerminalSize, SessionError> {
        size(self.master.as_ref())
    }
}

/// Opens a PTY pair with the given window size.
///
/// The master is put into non-blocking mode so reads never stall the
/// session's reader task.
pub fn allocate(size: TerminalSize) -> Result<Pty, AllocationError> {
    let pair = native_pty_system()
        .openpty(size.into())
        .map_err(|e| AllocationError(e.to_string()))?;

    let fd = pair
        .master
        .as_raw_fd()
        .ok_or_else(|| AllocationError("PTY master has no descriptor".to_string()))?;
    set_nonblocking(fd).map_err(|e| AllocationError(format!("fcntl(O_NONBLOCK): {e}")))?;

    tracing::trace!(fd = fd, rows = size.rows, cols = size.cols, "Allocated PTY pair");

    Ok(Pty {
        master: pair.master,
        slave: pair.slave,
    })
}

/// Applies a new window size. Only terminal attributes are touched, so this
/// is safe while another task reads from the master.
pub fn resize(master: &dyn MasterPty, size: TerminalSize) -> Result<(), SessionError> {
    master
        .resize(size.into())
        .map_err(|e| SessionError::ResizeFailed(e.to_string()))
}

/// Queries the live window size.
pub fn size(master: &dyn MasterPty) -> Result<TerminalSize, SessionError> {
    let size = master
        .get_size()
        .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
    TerminalSize::new(size.rows, size.cols)
}

fn set_nonblocking(fd: RawFd) -> Result<(), Errno> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// What to run inside a PTY.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Program and arguments. Never interpreted by a shell.
    pub argv: Vec<String>,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory; inherits the daemon's when `None`.
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    /// Creates a spec from an argv vector.
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

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the working directory.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// Starts `spec.argv` with the PTY slave as its standard streams.
///
/// The slave descriptor is closed as soon as the child is running; from then
/// on the returned handle is the only owner of the master.
pub fn spawn(spec: &LaunchSpec, pty: Pty) -> Result<ProcessHandle, LaunchError> {
    let program = spec
        .argv
        .first()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| LaunchError::ExecutableNotFound("empty argv".to_string()))?;

    if let Some(dir) = &spec.cwd {
        if !dir.is_dir() {
            return Err(LaunchError::ExecutableNotFound(format!(
                "working directory {} does not exist",
                dir.display()
            )));
        }
    }

    let executable = resolve_executable(program, spec.cwd.as_deref())?;

    let mut cmd = CommandBuilder::new(&executable);
    cmd.args(&spec.argv[1..]);
    if let Some(dir) = &spec.cwd {
        cmd.cwd(dir);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let Pty { master, slave } = pty;
    let child = slave
        .spawn_command(cmd)
        .map_err(|e| classify_spawn_error(&e, program))?;
    drop(slave);

    let handle = ProcessHandle::new(master, child)?;

    tracing::debug!(
        pid = handle.pid(),
        program = %executable.display(),
        args = spec.argv.len() - 1,
        "Launched process on PTY"
    );

    Ok(handle)
}

/// Resolves argv[0] to an executable path.
///
/// Names containing a slash are taken as paths (relative to `cwd` when one is
/// given); bare names are looked up on `PATH`.
fn resolve_executable(program: &str, cwd: Option<&Path>) -> Result<PathBuf, LaunchError> {
    if !program.contains('/') {
        return which::which(program)
            .map_err(|_| LaunchError::ExecutableNotFound(program.to_string()));
    }

    let path = match cwd {
        Some(dir) if Path::new(program).is_relative() => dir.join(program),
        _ => PathBuf::from(program),
    };

    let metadata = std::fs::metadata(&path)
        .map_err(|_| LaunchError::ExecutableNotFound(path.display().to_string()))?;

    if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
        return Err(LaunchError::PermissionDenied(path.display().to_string()));
    }

    Ok(path)
}

fn classify_spawn_error(err: &anyhow::Error, program: &str) -> LaunchError {
    let Some(io) = err.downcast_ref::<std::io::Error>() else {
        return LaunchError::ResourceExhausted(format!("{program}: {err}"));
    };

    match io.kind() {
        std::io::ErrorKind::NotFound => LaunchError::ExecutableNotFound(program.to_string()),
        std::io::ErrorKind::PermissionDenied => {
            LaunchError::PermissionDenied(program.to_string())
        }
        _ => LaunchError::ResourceExhausted(format!("{program}: {io}")),
    }
}
