//! Session supervisor owning the registry of live backing processes.
//!
//! The registry is keyed by terminal id and holds at most one process per
//! id. Entries are removed exactly once: either by `kill`, or by the exit
//! handler of the process that occupies the slot.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use protocol::{
    CreateSessionRequest, CreateSessionResult, KillResult, SessionEvent, SessionSummary,
    TerminalId, TerminalStatus,
};
use tokio::sync::mpsc;

use super::events::{EventBus, SubscriberId};
use super::pty::{BackingProcess, SessionError, SpawnSpec};
use crate::config::SessionConfig;
use crate::environment::EnvironmentResolver;

type Registry = DashMap<TerminalId, Arc<BackingProcess>>;

/// Spawns, tracks and terminates backing processes.
pub struct SessionSupervisor {
    sessions: Arc<Registry>,
    events: EventBus,
    resolver: EnvironmentResolver,
    defaults: SessionConfig,
    home_dir: PathBuf,
}

impl SessionSupervisor {
    /// Creates a supervisor using the process environment and home directory.
    pub fn new(defaults: SessionConfig) -> Self {
        Self::with_environment(
            defaults,
            EnvironmentResolver::from_process(),
            fallback_home_dir(),
        )
    }

    /// Creates a supervisor with an explicit environment and fallback directory.
    pub fn with_environment(
        defaults: SessionConfig,
        resolver: EnvironmentResolver,
        home_dir: PathBuf,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            events: EventBus::new(),
            resolver,
            defaults,
            home_dir,
        }
    }

    /// Directory used when a requested working directory is unusable.
    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    /// Event bus carrying data and status events of every session.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribes to data and status events of every session.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::UnboundedReceiver<SessionEvent>) {
        self.events.subscribe()
    }

    /// Starts a session for `request.terminal_id`.
    ///
    /// Any session already registered under the id is terminated first.
    /// Spawn failures are reported in the result and leave the registry
    /// untouched.
    pub async fn create(&self, request: CreateSessionRequest) -> CreateSessionResult {
        let terminal_id = request.terminal_id.clone();

        if let Some((_, prior)) = self.sessions.remove(&terminal_id) {
            tracing::warn!(
                terminal_id = %terminal_id,
                process_id = %prior.process_id(),
                "Terminal already had a session, terminating it"
            );
            prior.supersede();
            terminate_in_background(&terminal_id, prior).await;
        }

        let (cwd, fallback_cwd) = self.resolve_cwd(&request.cwd);
        if let Some(fallback) = &fallback_cwd {
            tracing::info!(
                terminal_id = %terminal_id,
                requested = %request.cwd,
                fallback = %fallback.display(),
                "Working directory unusable, using home directory"
            );
        }

        let (program, args) = resolve_shell(request.shell.as_deref());
        let cols = if request.cols == 0 { self.defaults.default_cols } else { request.cols };
        let rows = if request.rows == 0 { self.defaults.default_rows } else { request.rows };

        let spec = SpawnSpec {
            program,
            args,
            cwd,
            cols,
            rows,
            env: self.resolver.resolve(&request.search_path, &request.env),
        };

        let program = spec.program.clone();
        let spawned = match tokio::task::spawn_blocking(move || BackingProcess::spawn(&spec)).await
        {
            Ok(result) => result,
            Err(e) => Err(SessionError::SpawnFailed(e.to_string())),
        };

        let (process, io) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(terminal_id = %terminal_id, shell = %program, error = %e, "Failed to spawn session");
                return CreateSessionResult::failed(e.to_string());
            }
        };

        let process = Arc::new(process);
        let process_id = process.process_id().to_string();
        self.register(&terminal_id, Arc::clone(&process)).await;

        tracing::info!(
            terminal_id = %terminal_id,
            process_id = %process_id,
            pid = ?process.pid(),
            shell = %program,
            cols = cols,
            rows = rows,
            "Created session"
        );

        let registry = Arc::clone(&self.sessions);
        let events = self.events.clone();
        let exit_id = terminal_id.clone();
        let superseded = process.superseded_flag();
        io.start(
            terminal_id,
            process_id,
            self.events.clone(),
            move |process_id, exit_code| {
                let superseded = superseded.load(Ordering::SeqCst);
                handle_exit(&registry, &events, &exit_id, process_id, superseded, exit_code)
            },
        );

        CreateSessionResult::ok(fallback_cwd.map(|p| p.to_string_lossy().into_owned()))
    }

    /// Puts `process` into the slot for `terminal_id`. A process that was
    /// inserted concurrently under the same id is terminated.
    async fn register(&self, terminal_id: &str, process: Arc<BackingProcess>) {
        let displaced = self.sessions.insert(terminal_id.to_string(), process);
        if let Some(prior) = displaced {
            tracing::warn!(
                terminal_id = %terminal_id,
                process_id = %prior.process_id(),
                "Concurrent create displaced a session, terminating it"
            );
            prior.supersede();
            terminate_in_background(terminal_id, prior).await;
        }
    }

    /// Forwards bytes to the session. Unknown ids are ignored.
    pub fn write(&self, terminal_id: &str, data: &[u8]) {
        let Some(process) = self.get(terminal_id) else {
            return;
        };
        if let Err(e) = process.write(data) {
            tracing::warn!(terminal_id = %terminal_id, error = %e, "Write dropped");
        }
    }

    /// Changes the window size of the session. Zero sizes and unknown ids
    /// are ignored; failures are logged and never end the session.
    pub fn resize(&self, terminal_id: &str, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            return;
        }
        let Some(process) = self.get(terminal_id) else {
            return;
        };
        match process.resize(cols, rows) {
            Ok(()) => {
                tracing::debug!(terminal_id = %terminal_id, cols = cols, rows = rows, "Resized PTY")
            }
            Err(e) => tracing::warn!(terminal_id = %terminal_id, error = %e, "Resize failed"),
        }
    }

    /// Terminates the session. Returns `success: false` when no session is
    /// registered. The entry is removed before termination starts.
    pub async fn kill(&self, terminal_id: &str) -> KillResult {
        let Some((_, process)) = self.sessions.remove(terminal_id) else {
            tracing::debug!(terminal_id = %terminal_id, "Kill ignored, no session");
            return KillResult { success: false };
        };

        terminate_in_background(terminal_id, process).await;
        tracing::info!(terminal_id = %terminal_id, "Session killed");
        KillResult { success: true }
    }

    /// Removes the session and terminates it without waiting.
    pub fn request_kill(&self, terminal_id: &str) -> bool {
        let Some((_, process)) = self.sessions.remove(terminal_id) else {
            return false;
        };

        let terminal_id = terminal_id.to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || terminate_logged(&terminal_id, &process));
            }
            Err(_) => terminate_logged(&terminal_id, &process),
        }
        true
    }

    /// Terminates every session. Individual failures do not stop the sweep.
    pub async fn kill_all(&self) -> usize {
        let ids: Vec<TerminalId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut killed = 0;
        for id in ids {
            if self.kill(&id).await.success {
                killed += 1;
            }
        }
        tracing::info!(count = killed, "Killed all sessions");
        killed
    }

    /// Number of live sessions.
    pub fn running_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn contains(&self, terminal_id: &str) -> bool {
        self.sessions.contains_key(terminal_id)
    }

    /// Snapshot of all live sessions, sorted by terminal id.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let (cols, rows) = entry.value().size();
                SessionSummary {
                    terminal_id: entry.key().clone(),
                    process_id: entry.value().process_id().to_string(),
                    pid: entry.value().pid(),
                    cols,
                    rows,
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.terminal_id.cmp(&b.terminal_id));
        sessions
    }

    fn get(&self, terminal_id: &str) -> Option<Arc<BackingProcess>> {
        self.sessions
            .get(terminal_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the directory to start in and, if it differs from the
    /// request, the fallback that was used.
    fn resolve_cwd(&self, requested: &str) -> (PathBuf, Option<PathBuf>) {
        let requested = requested.trim();
        if requested.is_empty() {
            return (self.home_dir.clone(), Some(self.home_dir.clone()));
        }

        let path = PathBuf::from(requested);
        if path == self.home_dir || path.is_dir() {
            (path, None)
        } else {
            (self.home_dir.clone(), Some(self.home_dir.clone()))
        }
    }
}

fn handle_exit(
    registry: &Registry,
    events: &EventBus,
    terminal_id: &str,
    process_id: &str,
    superseded: bool,
    exit_code: Option<i32>,
) {
    let removed = registry
        .remove_if(terminal_id, |_, process| process.process_id() == process_id)
        .is_some();

    if superseded || (!removed && registry.contains_key(terminal_id)) {
        tracing::debug!(terminal_id = %terminal_id, process_id = %process_id, "Superseded session exited");
        return;
    }

    events.publish(SessionEvent::Status {
        terminal_id: terminal_id.to_string(),
        status: TerminalStatus::Exited,
        exit_code,
    });
}

async fn terminate_in_background(terminal_id: &str, process: Arc<BackingProcess>) {
    let id = terminal_id.to_string();
    if let Err(e) = tokio::task::spawn_blocking(move || terminate_logged(&id, &process)).await {
        tracing::warn!(terminal_id = %terminal_id, error = %e, "Termination task failed");
    }
}

fn terminate_logged(terminal_id: &str, process: &BackingProcess) {
    if let Err(e) = process.terminate() {
        tracing::warn!(terminal_id = %terminal_id, error = %e, "Kill failed, assuming process is gone");
    }
}

/// Resolves the shell program and arguments.
///
/// An explicit specifier other than `"default"` wins. Otherwise PowerShell
/// on Windows, `$SHELL` elsewhere, falling back to `/bin/zsh` on macOS and
/// `/bin/bash` on other systems.
pub fn resolve_shell(spec: Option<&str>) -> (String, Vec<String>) {
    let program = spec
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "default")
        .map(str::to_string)
        .unwrap_or_else(default_shell);

    let args = if cfg!(windows) && program.to_lowercase().contains("powershell") {
        vec!["-NoLogo".to_string(), "-NoExit".to_string()]
    } else {
        Vec::new()
    };

    (program, args)
}

fn default_shell() -> String {
    if cfg!(windows) {
        return "powershell.exe".to_string();
    }
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            if cfg!(target_os = "macos") {
                "/bin/zsh".to_string()
            } else {
                "/bin/bash".to_string()
            }
        })
}

fn fallback_home_dir() -> PathBuf {
    dirs::home_dir()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn supervisor(home: &Path) -> SessionSupervisor {
        SessionSupervisor::with_environment(
            SessionConfig::default(),
            EnvironmentResolver::from_process(),
            home.to_path_buf(),
        )
    }

    fn sh(terminal_id: &str, cwd: &Path) -> CreateSessionRequest {
        CreateSessionRequest::new(terminal_id)
            .with_shell("/bin/sh")
            .with_cwd(cwd.to_string_lossy())
    }

    async fn wait_for_exit(
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        terminal_id: &str,
    ) -> Option<Option<i32>> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if let SessionEvent::Status {
                terminal_id: id,
                exit_code,
                ..
            } = event
            {
                if id == terminal_id {
                    return Some(exit_code);
                }
            }
        }
        None
    }

    #[test]
    fn test_resolve_shell_explicit_wins() {
        let (program, args) = resolve_shell(Some("/bin/zsh"));
        assert_eq!(program, "/bin/zsh");
        assert!(args.is_empty());
    }

    #[test]
    fn test_resolve_shell_default_specifier() {
        let (program, _) = resolve_shell(Some("default"));
        assert!(!program.is_empty());
        assert_ne!(program, "default");
        let (program, _) = resolve_shell(None);
        assert!(!program.is_empty());
    }

    #[test]
    fn test_resolve_cwd() {
        let home = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let sup = supervisor(home.path());

        assert_eq!(sup.resolve_cwd(&other.path().to_string_lossy()), (other.path().to_path_buf(), None));
        assert_eq!(
            sup.resolve_cwd("/nonexistent/dir"),
            (home.path().to_path_buf(), Some(home.path().to_path_buf()))
        );
        assert_eq!(
            sup.resolve_cwd(""),
            (home.path().to_path_buf(), Some(home.path().to_path_buf()))
        );
        assert_eq!(
            sup.resolve_cwd(&home.path().to_string_lossy()),
            (home.path().to_path_buf(), None)
        );
    }

    #[tokio::test]
    async fn test_create_registers_session() {
        let home = TempDir::new().unwrap();
        let sup = supervisor(home.path());

        let result = sup.create(sh("t1", home.path())).await;
        assert!(result.success, "{:?}", result.error);
        assert!(result.fallback_cwd.is_none());
        assert_eq!(sup.running_count(), 1);

        let list = sup.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].terminal_id, "t1");
        assert_eq!((list[0].cols, list[0].rows), (80, 24));

        sup.kill_all().await;
    }

    #[tokio::test]
    async fn test_create_with_missing_cwd_reports_fallback() {
        let home = TempDir::new().unwrap();
        let sup = supervisor(home.path());

        let result = sup
            .create(CreateSessionRequest::new("t1").with_shell("/bin/sh").with_cwd("/nonexistent"))
            .await;
        assert!(result.success);
        assert_eq!(
            result.fallback_cwd.as_deref(),
            Some(home.path().to_string_lossy().as_ref())
        );

        sup.kill_all().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_registry_untouched() {
        let home = TempDir::new().unwrap();
        let sup = supervisor(home.path());

        let result = sup
            .create(CreateSessionRequest::new("t1").with_shell("/no/such/shell"))
            .await;
        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(sup.running_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_dimensions_use_defaults() {
        let home = TempDir::new().unwrap();
        let sup = supervisor(home.path());

        let result = sup.create(sh("t1", home.path()).with_size(0, 0)).await;
        assert!(result.success);
        assert_eq!(sup.list()[0].cols, 80);
        assert_eq!(sup.list()[0].rows, 24);

        sup.kill_all().await;
    }

    #[tokio::test]
    async fn test_second_create_replaces_prior_session() {
        let home = TempDir::new().unwrap();
        let sup = supervisor(home.path());
        let (_, mut rx) = sup.subscribe();

        assert!(sup.create(sh("t1", home.path())).await.success);
        let first = sup.list()[0].process_id.clone();
        assert!(sup.create(sh("t1", home.path())).await.success);

        assert_eq!(sup.running_count(), 1);
        let second = sup.list()[0].process_id.clone();
        assert_ne!(first, second);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(sup.contains("t1"), "old exit must not evict the new session");
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, SessionEvent::Status { .. }),
                "replaced session reported an exit: {:?}",
                event
            );
        }

        sup.kill_all().await;
    }

    fn spawn_sh() -> (Arc<BackingProcess>, crate::session::ProcessIo) {
        let spec = SpawnSpec {
            program: "/bin/sh".to_string(),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
            cols: 80,
            rows: 24,
            env: std::env::vars().collect(),
        };
        let (process, io) = BackingProcess::spawn(&spec).unwrap();
        (Arc::new(process), io)
    }

    #[tokio::test]
    async fn test_register_terminates_displaced_process() {
        let home = TempDir::new().unwrap();
        let sup = supervisor(home.path());

        let (first, first_io) = spawn_sh();
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
        first_io.start(
            "t1".into(),
            first.process_id().to_string(),
            EventBus::new(),
            move |_, _| {
                let _ = exit_tx.send(());
            },
        );
        let (second, second_io) = spawn_sh();
        second_io.start(
            "t1".into(),
            second.process_id().to_string(),
            EventBus::new(),
            |_, _| {},
        );

        sup.register("t1", Arc::clone(&first)).await;
        sup.register("t1", Arc::clone(&second)).await;

        // The test still holds the first handle, so only an explicit
        // terminate can end it.
        assert!(timeout(Duration::from_secs(5), exit_rx).await.is_ok());
        assert_eq!(sup.running_count(), 1);
        assert_eq!(sup.list()[0].process_id, second.process_id());

        sup.kill_all().await;
    }

    #[tokio::test]
    async fn test_concurrent_creates_leave_one_session() {
        let home = TempDir::new().unwrap();
        let sup = supervisor(home.path());

        let (a, b) = tokio::join!(
            sup.create(sh("t1", home.path())),
            sup.create(sh("t1", home.path()))
        );
        assert!(a.success && b.success);
        assert_eq!(sup.running_count(), 1);

        sup.kill_all().await;
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let home = TempDir::new().unwrap();
        let sup = supervisor(home.path());

        assert!(sup.create(sh("t1", home.path())).await.success);
        assert!(sup.kill("t1").await.success);
        assert!(!sup.kill("t1").await.success);
        assert!(!sup.kill("never-existed").await.success);
        assert_eq!(sup.running_count(), 0);
    }

    #[tokio::test]
    async fn test_natural_exit_removes_entry_and_emits_status() {
        let home = TempDir::new().unwrap();
        let sup = supervisor(home.path());
        let (_, mut rx) = sup.subscribe();

        assert!(sup.create(sh("t1", home.path())).await.success);
        sup.write("t1", b"exit 3\n");

        assert_eq!(wait_for_exit(&mut rx, "t1").await, Some(Some(3)));
        assert_eq!(sup.running_count(), 0);
        assert!(!sup.kill("t1").await.success);
    }

    #[tokio::test]
    async fn test_kill_emits_single_exit_status() {
        let home = TempDir::new().unwrap();
        let sup = supervisor(home.path());
        let (_, mut rx) = sup.subscribe();

        assert!(sup.create(sh("t1", home.path())).await.success);
        assert!(sup.kill("t1").await.success);
        assert!(wait_for_exit(&mut rx, "t1").await.is_some());

        let again = timeout(Duration::from_millis(300), wait_for_exit(&mut rx, "t1")).await;
        assert!(matches!(again, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn test_write_and_resize_on_unknown_id_are_noops() {
        let home = TempDir::new().unwrap();
        let sup = supervisor(home.path());
        sup.write("ghost", b"ls\n");
        sup.resize("ghost", 100, 30);
        assert_eq!(sup.running_count(), 0);
    }

    #[tokio::test]
    async fn test_resize_ignores_zero_dimensions() {
        let home = TempDir::new().unwrap();
        let sup = supervisor(home.path());
        assert!(sup.create(sh("t1", home.path())).await.success);

        sup.resize("t1", 0, 50);
        assert_eq!((sup.list()[0].cols, sup.list()[0].rows), (80, 24));

        sup.resize("t1", 100, 50);
        assert_eq!((sup.list()[0].cols, sup.list()[0].rows), (100, 50));

        sup.kill_all().await;
    }

    #[tokio::test]
    async fn test_kill_all_clears_registry() {
        let home = TempDir::new().unwrap();
        let sup = supervisor(home.path());
        for id in ["a", "b", "c"] {
            assert!(sup.create(sh(id, home.path())).await.success);
        }
        assert_eq!(sup.running_count(), 3);
        assert_eq!(sup.kill_all().await, 3);
        assert_eq!(sup.running_count(), 0);
    }

    #[tokio::test]
    async fn test_request_kill_removes_synchronously() {
        let home = TempDir::new().unwrap();
        let sup = supervisor(home.path());
        assert!(sup.create(sh("t1", home.path())).await.success);

        assert!(sup.request_kill("t1"));
        assert!(!sup.contains("t1"));
        assert!(!sup.request_kill("t1"));
    }
}
