//! Unix Domain Socket IPC module for CLI-daemon communication.
//!
//! The CLI drives a running daemon over a local socket: it can create, list,
//! inspect and kill sessions, query status, and request shutdown.
//!
//! ## Overview
//!
//! The IPC system uses a JSON newline-delimited protocol. Each message is a
//! single JSON object followed by a newline.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/ptyrelay/daemon.sock`
//! - Fallback: `/tmp/ptyrelay-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{get_socket_path, IpcClient, IpcResponse};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!
//!     if let IpcResponse::Sessions { sessions } = client.list_sessions().await? {
//!         for session in sessions {
//!             println!("{} {}", session.id, session.shell);
//!         }
//!     }
//!
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
pub use server::{IpcConnection, IpcError, IpcServer, MAX_REQUEST_BYTES};

use std::path::PathBuf;

/// Get the socket path for IPC communication.
///
/// ## Path Resolution
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/ptyrelay/daemon.sock`
/// 2. Otherwise: `/tmp/ptyrelay-$UID/daemon.sock`
pub fn get_socket_path() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => {
            PathBuf::from(runtime_dir).join("ptyrelay").join("daemon.sock")
        }
        _ => {
            let uid = nix::unistd::getuid();
            PathBuf::from(format!("/tmp/ptyrelay-{}", uid)).join("daemon.sock")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn with_runtime_dir<T>(value: Option<&str>, f: impl FnOnce() -> T) -> T {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();
        // SAFETY: callers are #[serial], so no other test reads the environment concurrently.
        unsafe {
            match value {
                Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
        let result = f();
        // SAFETY: as above.
        unsafe {
            match original {
                Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
        result
    }

    #[test]
    #[serial]
    fn test_get_socket_path_with_xdg_runtime_dir() {
        let path = with_runtime_dir(Some("/run/user/1000"), get_socket_path);
        assert_eq!(path, PathBuf::from("/run/user/1000/ptyrelay/daemon.sock"));
    }

    #[test]
    #[serial]
    fn test_get_socket_path_without_xdg_runtime_dir() {
        let path = with_runtime_dir(None, get_socket_path);
        let expected = format!("/tmp/ptyrelay-{}/daemon.sock", nix::unistd::getuid());
        assert_eq!(path, PathBuf::from(expected));
    }

    #[test]
    #[serial]
    fn test_empty_runtime_dir_falls_back() {
        let path = with_runtime_dir(Some(""), get_socket_path);
        assert!(path.starts_with("/tmp"));
        assert!(path.extension().is_some_and(|e| e == "sock"));
    }
}
