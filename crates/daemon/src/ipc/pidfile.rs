//! Pid file used as the daemon's single-instance guard.
//!
//! The file lives in the data directory as `termdeck.pid`. A pid file whose
//! process is gone, or whose contents do not parse, is stale and removed on
//! the next check.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File name of the pid file inside the data directory.
pub const PID_FILE_NAME: &str = "termdeck.pid";

/// Pid file path for `data_dir`.
pub fn pid_file_in(data_dir: &Path) -> PathBuf {
    data_dir.join(PID_FILE_NAME)
}

/// Pid of the daemon recorded at `path`, if that process is alive.
/// Stale files are removed.
pub fn running_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    let Ok(pid) = contents.trim().parse::<u32>() else {
        cleanup_stale_pid_file(path);
        return None;
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(path);
        None
    }
}

/// Whether a live daemon owns the pid file at `path`.
pub fn is_daemon_running(path: &Path) -> bool {
    running_pid(path).is_some()
}

/// Errors acquiring the pid file.
#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("Daemon already running (PID: {0})")]
    AlreadyRunning(u32),

    #[error("Failed to write pid file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held pid file. Removed on drop when it still names this process.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Records the current process at `path` unless another live daemon
    /// already holds it.
    pub fn acquire(path: &Path) -> Result<Self, PidFileError> {
        if let Some(pid) = running_pid(path) {
            if pid != std::process::id() {
                return Err(PidFileError::AlreadyRunning(pid));
            }
        }

        let io_err = |source| PidFileError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let pid = std::process::id();
        fs::write(path, format!("{}\n", pid)).map_err(io_err)?;
        tracing::debug!(pid = pid, "Wrote pid file {:?}", path);

        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let owned = fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            == Some(self.pid);
        if owned {
            cleanup_stale_pid_file(&self.path);
        }
    }
}

/// Whether a process with `pid` exists.
fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}/stat", pid)).exists()
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        i32::try_from(pid)
            .map(|raw| kill(Pid::from_raw(raw), None).is_ok())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn cleanup_stale_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pid_file_in_data_dir() {
        let path = pid_file_in(Path::new("/var/lib/termdeck"));
        assert_eq!(path, PathBuf::from("/var/lib/termdeck/termdeck.pid"));
    }

    #[test]
    fn test_no_file_means_not_running() {
        let temp_dir = tempdir().unwrap();
        assert!(!is_daemon_running(&temp_dir.path().join(PID_FILE_NAME)));
    }

    #[test]
    fn test_current_process_is_running() {
        assert!(is_process_running(std::process::id()));
        assert!(!is_process_running(4_000_000_000));
    }

    #[test]
    fn test_stale_pid_file_is_removed() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join(PID_FILE_NAME);
        fs::write(&path, "4000000000\n").unwrap();

        assert_eq!(running_pid(&path), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_garbage_pid_file_is_removed() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join(PID_FILE_NAME);
        fs::write(&path, "not a pid").unwrap();

        assert_eq!(running_pid(&path), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_acquire_writes_and_drop_removes() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join(PID_FILE_NAME);

        let guard = PidFile::acquire(&path).unwrap();
        assert_eq!(guard.pid(), std::process::id());
        assert_eq!(running_pid(&path), Some(std::process::id()));

        drop(guard);
        assert!(!path.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_acquire_refuses_live_owner() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join(PID_FILE_NAME);
        // PID 1 is always alive.
        fs::write(&path, "1\n").unwrap();

        match PidFile::acquire(&path) {
            Err(PidFileError::AlreadyRunning(pid)) => assert_eq!(pid, 1),
            other => panic!("Expected AlreadyRunning, got {:?}", other),
        }
        assert!(path.exists());
    }
}
