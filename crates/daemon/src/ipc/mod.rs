//! Command surface over a Unix domain socket.
//!
//! Each message is a single JSON object followed by a newline. Requests
//! mirror the operations of the supervisor, the group store and the
//! persistence layer; `Write` and `Resize` are fire-and-forget. A
//! connection that sends `Subscribe` receives `Event` messages for every
//! session until it disconnects.
//!
//! ## Socket Path
//!
//! - `$XDG_RUNTIME_DIR/termdeck/termdeck.sock` when the runtime dir is set
//! - `/tmp/termdeck-$UID/termdeck.sock` otherwise
//!
//! ## Example
//!
//! ```rust,no_run
//! use termdeck::ipc::{get_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     if client.ping().await? {
//!         println!("Daemon is running");
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse};
pub use pidfile::{is_daemon_running, pid_file_in, running_pid, PidFile, PidFileError};
pub use server::{IpcConnection, IpcError, IpcServer, RequestReader, ResponseWriter};

use std::path::PathBuf;

/// Default socket path for the command surface.
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir)
                .join("termdeck")
                .join("termdeck.sock");
        }
    }

    let uid = std::fs::metadata("/proc/self")
        .map(|m| m.uid())
        .unwrap_or(0);
    PathBuf::from(format!("/tmp/termdeck-{}", uid)).join("termdeck.sock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn with_runtime_dir<F: FnOnce()>(value: Option<&str>, f: F) {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();
        // SAFETY: serialized test touching only this variable
        unsafe {
            match value {
                Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
        f();
        // SAFETY: as above
        unsafe {
            match original {
                Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
    }

    #[test]
    #[serial]
    fn test_socket_path_under_runtime_dir() {
        with_runtime_dir(Some("/run/user/1000"), || {
            assert_eq!(
                get_socket_path(),
                PathBuf::from("/run/user/1000/termdeck/termdeck.sock")
            );
        });
    }

    #[test]
    #[serial]
    fn test_socket_path_fallback() {
        with_runtime_dir(None, || {
            let path = get_socket_path();
            let text = path.to_string_lossy();
            assert!(text.starts_with("/tmp/termdeck-"));
            assert!(text.ends_with("/termdeck.sock"));
            assert!(path.is_absolute());
        });
    }
}
