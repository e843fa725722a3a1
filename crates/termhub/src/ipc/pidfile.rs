//! PID file helpers used to detect a running daemon.
//!
//! The PID file lives at `$XDG_DATA_HOME/termhub/daemon.pid`, falling back to
//! `~/.local/share/termhub/daemon.pid`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Get the path to the daemon PID file.
pub fn get_pid_file_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        });
    data_dir.join("termhub").join("daemon.pid")
}

/// Whether the PID file names a live process.
pub fn is_daemon_running() -> bool {
    get_daemon_pid().is_some()
}

/// PID of the running daemon, if any. Stale or unparsable PID files are
/// removed.
pub fn get_daemon_pid() -> Option<u32> {
    read_live_pid(&get_pid_file_path())
}

/// Writes the current process ID to `path`, creating parent directories.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", std::process::id()))
}

/// Removes the PID file at `path` if it names this process.
pub fn remove_pid_file(path: &Path) {
    let ours = fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .map(|pid| pid == std::process::id())
        .unwrap_or(false);
    if ours {
        let _ = fs::remove_file(path);
    }
}

fn read_live_pid(path: &Path) -> Option<u32> {
    let pid_str = fs::read_to_string(path).ok()?;

    let pid: u32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => {
            let _ = fs::remove_file(path);
            return None;
        }
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        let _ = fs::remove_file(path);
        None
    }
}

/// Signal 0 liveness check. EPERM still means the process exists.
fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}
