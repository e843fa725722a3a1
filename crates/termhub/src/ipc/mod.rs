//! Unix Domain Socket IPC between the `termhubd` CLI and the daemon.
//!
//! ## Overview
//!
//! Every request and response is a single JSON object followed by a newline.
//! A connection may carry any number of request/response pairs; the daemon
//! answers them in order.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/termhub/daemon.sock`
//! - Fallback: `/tmp/termhub-$UID/daemon.sock`
//!
//! The config file's `daemon.socket_path` overrides both.
//!
//! ## Example
//!
//! ```rust,no_run
//! use termhub::ipc::{get_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     let session_id = client.create_session(vec!["/bin/cat".into()]).await?;
//!     client.write(&session_id, b"hello\n").await?;
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse};
pub use pidfile::{
    get_daemon_pid, get_pid_file_path, is_daemon_running, remove_pid_file, write_pid_file,
};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Get the socket path for IPC communication.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/termhub/daemon.sock`
/// 2. Otherwise: `/tmp/termhub-$UID/daemon.sock`
#[cfg(unix)]
pub fn get_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("termhub").join("daemon.sock")
    } else {
        let uid = nix::unistd::getuid();
        PathBuf::from(format!("/tmp/termhub-{}", uid)).join("daemon.sock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_get_socket_path_with_xdg_runtime_dir() {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();

        // SAFETY: serialized with the other env-var tests
        unsafe {
            std::env::set_var("XDG_RUNTIME_DIR", "/run/user/1000");
        }
        let path = get_socket_path();
        assert_eq!(path, PathBuf::from("/run/user/1000/termhub/daemon.sock"));

        // SAFETY: serialized with the other env-var tests
        unsafe {
            match original {
                Some(val) => std::env::set_var("XDG_RUNTIME_DIR", val),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
    }

    #[test]
    #[serial]
    fn test_get_socket_path_without_xdg_runtime_dir() {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();

        // SAFETY: serialized with the other env-var tests
        unsafe {
            std::env::remove_var("XDG_RUNTIME_DIR");
        }
        let path = get_socket_path();
        let expected = format!("/tmp/termhub-{}/daemon.sock", nix::unistd::getuid());
        assert_eq!(path, PathBuf::from(expected));

        // SAFETY: serialized with the other env-var tests
        unsafe {
            if let Some(val) = original {
                std::env::set_var("XDG_RUNTIME_DIR", val);
            }
        }
    }

    #[test]
    #[serial]
    fn test_socket_path_shape() {
        let path = get_socket_path();
        assert!(path.is_absolute());
        assert!(path.extension().map(|e| e == "sock").unwrap_or(false));
    }
}
