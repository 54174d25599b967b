//! Backing process management.
//!
//! A [`BackingProcess`] is a shell running behind a pseudo-terminal. Spawning
//! returns the process handle together with its [`ProcessIo`]; the caller
//! registers the handle first and then starts the I/O tasks, so an exit can
//! never be observed before registration.
//!
//! Three blocking tasks serve each process:
//! - the reader forwards output chunks as [`SessionEvent::Data`];
//! - the writer drains queued input in order;
//! - the waiter owns the child, waits for it, lets the reader finish, then
//!   reports the exit code.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::{SessionEvent, TerminalId};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::events::EventBus;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(TerminalId),

    /// Failed to spawn the backing process.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to queue input for the backing process.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to terminate the backing process.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// How long the waiter lets the reader drain after the child exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Everything needed to start a backing process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    /// Complete environment; the inherited one is not added again.
    pub env: BTreeMap<String, String>,
}

/// Handle to a live backing process.
pub struct BackingProcess {
    process_id: String,
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    size: Mutex<(u16, u16)>,
    superseded: Arc<AtomicBool>,
}

/// The I/O halves of a freshly spawned process, not yet running.
pub struct ProcessIo {
    child: Box<dyn Child + Send + Sync>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl BackingProcess {
    /// Opens a PTY of the requested size and spawns the program in it.
    pub fn spawn(spec: &SpawnSpec) -> Result<(Self, ProcessIo), SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        cmd.env_clear();
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", spec.program, e)))?;

        // The slave must be closed here so the reader sees EOF once the
        // child and its descendants are gone.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let process = BackingProcess {
            process_id: Uuid::new_v4().to_string(),
            pid: child.process_id(),
            master: Mutex::new(pair.master),
            input_tx,
            killer: Mutex::new(child.clone_killer()),
            size: Mutex::new((spec.cols, spec.rows)),
            superseded: Arc::new(AtomicBool::new(false)),
        };

        Ok((
            process,
            ProcessIo {
                child,
                reader,
                writer,
                input_rx,
            },
        ))
    }

    /// Internal id unique to this spawn.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Marks the process as replaced by a newer session for the same
    /// terminal. Its exit is then not reported.
    pub fn supersede(&self) {
        self.superseded.store(true, Ordering::SeqCst);
    }

    /// Flag set by [`supersede`](Self::supersede), shareable with the exit
    /// handler.
    pub fn superseded_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.superseded)
    }

    /// OS process id of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current terminal size as (cols, rows).
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues bytes for the shell. Bytes are forwarded verbatim and in order.
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.input_tx
            .send(data.to_vec())
            .map_err(|_| SessionError::WriteFailed("input channel closed".to_string()))
    }

    /// Changes the PTY window size.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.master
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        *self.size.lock().unwrap_or_else(|e| e.into_inner()) = (cols, rows);
        Ok(())
    }

    /// Terminates the process: a graceful kill, then a forced kill of the
    /// whole process tree. Failure of the forced step is ignored because the
    /// process may already be gone.
    pub fn terminate(&self) -> Result<(), SessionError> {
        let graceful = self
            .killer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .kill();

        if let Some(pid) = self.pid {
            force_kill_tree(pid);
        }

        graceful.map_err(|e| SessionError::KillFailed(e.to_string()))
    }
}

impl ProcessIo {
    /// Starts the reader, writer and waiter tasks.
    ///
    /// `on_exit` runs once on the waiter task with the process id and exit
    /// code, after all output read so far has been published.
    pub fn start<F>(self, terminal_id: TerminalId, process_id: String, events: EventBus, on_exit: F)
    where
        F: FnOnce(&str, Option<i32>) + Send + 'static,
    {
        let ProcessIo {
            mut child,
            reader,
            writer,
            input_rx,
        } = self;

        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

        let reader_id = terminal_id.clone();
        tokio::task::spawn_blocking(move || {
            read_loop(reader, &reader_id, &events);
            let _ = done_tx.send(());
        });

        let writer_id = terminal_id.clone();
        tokio::task::spawn_blocking(move || write_loop(writer, input_rx, &writer_id));

        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    tracing::warn!(terminal_id = %terminal_id, error = %e, "Failed to wait for backing process");
                    None
                }
            };

            if done_rx.recv_timeout(READER_DRAIN_TIMEOUT).is_err() {
                tracing::debug!(terminal_id = %terminal_id, "Reader still open after exit");
            }

            tracing::info!(terminal_id = %terminal_id, exit_code = ?code, "Backing process exited");
            on_exit(&process_id, code);
        });
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, terminal_id: &str, events: &EventBus) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!(terminal_id = %terminal_id, "PTY EOF");
                break;
            }
            Ok(n) => events.publish(SessionEvent::Data {
                terminal_id: terminal_id.to_string(),
                data: buffer[..n].to_vec(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO once the last slave handle closes.
                tracing::debug!(terminal_id = %terminal_id, error = %e, "PTY read ended");
                break;
            }
        }
    }
}

fn write_loop(
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    terminal_id: &str,
) {
    while let Some(data) = input_rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            tracing::warn!(terminal_id = %terminal_id, error = %e, "Failed to write to PTY");
            break;
        }
    }
}

/// Kills the process group led by `pid`.
#[cfg(unix)]
fn force_kill_tree(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::trace!(pid = pid, error = %e, "Forced kill skipped");
    }
}

/// Kills `pid` and its children with `taskkill /T /F`.
#[cfg(windows)]
fn force_kill_tree(pid: u32) {
    let result = std::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/T", "/F"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    if let Err(e) = result {
        tracing::trace!(pid = pid, error = %e, "Forced kill skipped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    fn sh_spec(script: Option<&str>) -> SpawnSpec {
        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        SpawnSpec {
            program: "/bin/sh".to_string(),
            args: script
                .map(|s| vec!["-c".to_string(), s.to_string()])
                .unwrap_or_default(),
            cwd: std::env::temp_dir(),
            cols: 80,
            rows: 24,
            env,
        }
    }

    async fn collect_until(
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        marker: &str,
    ) -> bool {
        let mut output = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(SessionEvent::Data { data, .. })) => {
                    output.push_str(&String::from_utf8_lossy(&data));
                    if output.contains(marker) {
                        return true;
                    }
                }
                Ok(_) => {}
                Err(_) => {}
            }
        }
        false
    }

    #[tokio::test]
    async fn test_spawn_reports_size_and_pid() {
        let (process, io) = BackingProcess::spawn(&sh_spec(None)).unwrap();
        assert_eq!(process.size(), (80, 24));
        assert!(process.pid().is_some());
        assert_eq!(process.process_id().len(), 36);

        io.start("t".into(), process.process_id().to_string(), EventBus::new(), |_, _| {});
        process.terminate().ok();
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let mut spec = sh_spec(None);
        spec.program = "/definitely/not/a/shell".to_string();
        let result = BackingProcess::spawn(&spec);
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_write_and_read_output() {
        let bus = EventBus::new();
        let (_, mut rx) = bus.subscribe();
        let (process, io) = BackingProcess::spawn(&sh_spec(None)).unwrap();
        io.start("t".into(), process.process_id().to_string(), bus, |_, _| {});

        process.write(b"echo pty_marker_$((40+2))\n").unwrap();
        assert!(collect_until(&mut rx, "pty_marker_42").await);

        process.terminate().ok();
    }

    #[tokio::test]
    async fn test_env_is_applied() {
        let bus = EventBus::new();
        let (_, mut rx) = bus.subscribe();
        let mut spec = sh_spec(Some("echo value=$TERMDECK_TEST_VAR"));
        spec.env
            .insert("TERMDECK_TEST_VAR".to_string(), "from_spec".to_string());
        let (process, io) = BackingProcess::spawn(&spec).unwrap();
        io.start("t".into(), process.process_id().to_string(), bus, |_, _| {});

        assert!(collect_until(&mut rx, "value=from_spec").await);
    }

    #[tokio::test]
    async fn test_exit_code_reported_after_output() {
        let bus = EventBus::new();
        let (_, mut rx) = bus.subscribe();
        let (process, io) = BackingProcess::spawn(&sh_spec(Some("echo bye; exit 7"))).unwrap();

        let (exit_tx, exit_rx) = oneshot::channel();
        let expected_id = process.process_id().to_string();
        io.start("t".into(), expected_id.clone(), bus, move |id, code| {
            let _ = exit_tx.send((id.to_string(), code));
        });

        let (id, code) = timeout(Duration::from_secs(5), exit_rx)
            .await
            .expect("exit not reported")
            .unwrap();
        assert_eq!(id, expected_id);
        assert_eq!(code, Some(7));

        let mut output = String::new();
        while let Ok(SessionEvent::Data { data, .. }) = rx.try_recv() {
            output.push_str(&String::from_utf8_lossy(&data));
        }
        assert!(output.contains("bye"));
    }

    #[tokio::test]
    async fn test_resize_updates_size() {
        let (process, io) = BackingProcess::spawn(&sh_spec(None)).unwrap();
        io.start("t".into(), process.process_id().to_string(), EventBus::new(), |_, _| {});

        process.resize(120, 40).unwrap();
        assert_eq!(process.size(), (120, 40));

        process.terminate().ok();
    }

    #[tokio::test]
    async fn test_terminate_triggers_exit() {
        let (process, io) = BackingProcess::spawn(&sh_spec(None)).unwrap();
        let (exit_tx, exit_rx) = oneshot::channel();
        io.start("t".into(), process.process_id().to_string(), EventBus::new(), move |_, code| {
            let _ = exit_tx.send(code);
        });

        let _ = process.terminate();
        assert!(timeout(Duration::from_secs(5), exit_rx).await.is_ok());
    }
}
