//! Daemon orchestrator for wiring together all components.
//!
//! The `DeckOrchestrator` owns the session supervisor, the group store and
//! the persistence layer, forwards session status into the store, and
//! serves the command surface.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use protocol::{
    AppSettings, CreateSessionRequest, CreateSessionResult, SearchPathOverrides, SessionEvent,
    TerminalStatus, TerminalUpdate,
};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::directory::{DirectoryPicker, HeadlessDirectoryPicker};
use crate::ipc::{IpcConnection, IpcError, IpcRequest, IpcResponse, IpcServer};
use crate::persistence::{self, Persistence, PersistenceError};
use crate::session::SessionSupervisor;
use crate::store::{GroupStateStore, NewTerminal, SessionTerminator, TerminalDefaults};

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, restoring state.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

fn terminal_defaults(settings: &AppSettings) -> TerminalDefaults {
    TerminalDefaults {
        cwd: settings.default_cwd.clone(),
        shell: settings.default_shell.clone(),
    }
}

/// Daemon orchestrator that manages all subsystems.
pub struct DeckOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    supervisor: Arc<SessionSupervisor>,
    store: GroupStateStore,
    persistence: Persistence,
    picker: Arc<dyn DirectoryPicker>,
    shutdown_token: CancellationToken,
    started_at: Instant,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl DeckOrchestrator {
    /// Creates an orchestrator backed by the store file under the data
    /// directory. Must be called inside a Tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let store_path = config.store_path();
        let persistence = Persistence::open_file(&store_path)
            .with_context(|| format!("Failed to open store at {}", store_path.display()))?;
        Ok(Self::with_persistence(config, persistence))
    }

    /// Creates an orchestrator over an existing persistence handle.
    pub fn with_persistence(config: Config, persistence: Persistence) -> Self {
        let supervisor = Arc::new(SessionSupervisor::new(config.session.clone()));
        let terminator: Arc<dyn SessionTerminator> = supervisor.clone();
        let store = GroupStateStore::with_persistence(terminator, persistence.clone());

        Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            supervisor,
            store,
            persistence,
            picker: Arc::new(HeadlessDirectoryPicker),
            shutdown_token: CancellationToken::new(),
            started_at: Instant::now(),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Replaces the directory picker used by `SelectDirectory`.
    pub fn with_directory_picker(mut self, picker: Arc<dyn DirectoryPicker>) -> Self {
        self.picker = picker;
        self
    }

    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    pub fn store(&self) -> &GroupStateStore {
        &self.store
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    /// It is cancelled by `stop` and by a `Stop` request.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Restores persisted state, starts status forwarding and binds the
    /// command socket.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }

        info!("Starting TermDeck orchestrator...");

        let server = match self.prepare().await {
            Ok(server) => server,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                return Err(e);
            }
        };

        self.track(tokio::spawn(forward_status(
            Arc::clone(&self.supervisor),
            self.store.clone(),
            self.shutdown_token.clone(),
        )));
        self.track(tokio::spawn(Arc::clone(self).serve(server)));

        *self.state.write().await = OrchestratorState::Running;
        info!("TermDeck orchestrator started successfully");
        Ok(())
    }

    /// Restores persisted state and binds the command socket.
    async fn prepare(&self) -> Result<IpcServer> {
        let detected = self
            .blocking(|p| Ok(p.run_startup_detection()))
            .await
            .context("Install path detection failed")?;
        debug!(count = detected.len(), "Install paths available");

        let (groups, last_active) = self.persistence.load_groups();
        self.store.load(groups, last_active).await;
        self.store
            .set_terminal_defaults(terminal_defaults(&self.persistence.settings()))
            .await;

        let socket_path = self.config.socket_path();
        let server = IpcServer::bind(&socket_path)
            .await
            .with_context(|| format!("Failed to bind socket at {}", socket_path.display()))?;
        info!("Command surface listening on {:?}", socket_path);
        Ok(server)
    }

    /// Terminates every session, writes pending state and removes the
    /// socket.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }

        info!("Stopping TermDeck orchestrator...");
        self.shutdown_token.cancel();

        let killed = self.supervisor.kill_all().await;
        debug!(count = killed, "Sessions terminated");

        if let Err(e) = self.store.flush().await {
            warn!("Error saving group state: {}", e);
        }

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!("Background task ended abnormally: {}", e);
            }
        }

        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&socket_path) {
                warn!("Failed to remove socket {:?}: {}", socket_path, e);
            }
        }

        *self.state.write().await = OrchestratorState::Stopped;
        info!("TermDeck orchestrator stopped");
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(Persistence) -> persistence::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let persistence = self.persistence.clone();
        tokio::task::spawn_blocking(move || f(persistence))
            .await
            .map_err(|e| PersistenceError::Background(e.to_string()))?
    }

    /// Starts a session and mirrors the outcome into the owning terminal.
    ///
    /// Search-path inputs come from the stored settings when the request
    /// carries none.
    pub async fn create_session(&self, mut request: CreateSessionRequest) -> CreateSessionResult {
        if request.search_path == SearchPathOverrides::default() {
            request.search_path = self.persistence.settings().search_path_overrides();
        }
        let terminal_id = request.terminal_id.clone();
        let group_id = self.store.find_terminal_group(&terminal_id).await;

        // Statuses left over from an earlier session no longer apply.
        if let Some(group_id) = &group_id {
            let reset = TerminalUpdate::status(TerminalStatus::Idle, None);
            if let Err(e) = self.store.update_terminal(group_id, &terminal_id, reset).await {
                debug!(terminal_id = %terminal_id, error = %e, "Terminal left before launch");
            }
        }

        let result = self.supervisor.create(request).await;
        let Some(group_id) = group_id else {
            return result;
        };

        // An exit forwarded while the launch was in flight stays in place.
        let outcome = if result.success {
            self.store
                .mark_running(
                    &group_id,
                    &terminal_id,
                    TerminalStatus::Idle,
                    result.fallback_cwd.clone(),
                )
                .await
        } else {
            self.store
                .update_terminal(
                    &group_id,
                    &terminal_id,
                    TerminalUpdate::status(TerminalStatus::Error, None),
                )
                .await
        };
        if let Err(e) = outcome {
            debug!(terminal_id = %terminal_id, error = %e, "Terminal left before status update");
        }
        result
    }

    /// Handles one request. Returns `None` for fire-and-forget requests.
    pub async fn handle_request(&self, request: IpcRequest) -> Option<IpcResponse> {
        let response = match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                running: self.state().await == OrchestratorState::Running,
                uptime_secs: self.started_at.elapsed().as_secs(),
                session_count: self.supervisor.running_count(),
                group_count: self.store.groups().await.len(),
            },
            IpcRequest::Stop => {
                info!("Stop requested over the command surface");
                self.shutdown_token.cancel();
                IpcResponse::Stopping
            }
            IpcRequest::CreateSession(request) => {
                IpcResponse::SessionCreated(self.create_session(request).await)
            }
            IpcRequest::Write { terminal_id, data } => {
                self.supervisor.write(&terminal_id, &data);
                return None;
            }
            IpcRequest::Resize {
                terminal_id,
                cols,
                rows,
            } => {
                self.supervisor.resize(&terminal_id, cols, rows);
                return None;
            }
            IpcRequest::Kill { terminal_id } => {
                IpcResponse::Killed(self.supervisor.kill(&terminal_id).await)
            }
            IpcRequest::Subscribe => {
                IpcResponse::error("Subscribe is only available on a socket connection")
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self.supervisor.list(),
            },
            IpcRequest::GetSettings => IpcResponse::Settings(self.persistence.settings()),
            IpcRequest::SetSettings(patch) => {
                match self.blocking(move |p| p.update_settings(patch)).await {
                    Ok(settings) => {
                        self.store
                            .set_terminal_defaults(terminal_defaults(&settings))
                            .await;
                        IpcResponse::Settings(settings)
                    }
                    Err(e) => IpcResponse::error(e),
                }
            }
            IpcRequest::DetectInstallPaths => {
                match self.blocking(|p| p.detect_install_paths()).await {
                    Ok(paths) => IpcResponse::InstallPaths { paths },
                    Err(e) => IpcResponse::error(e),
                }
            }
            IpcRequest::LoadGroups => IpcResponse::Groups {
                groups: self.store.groups().await,
                last_active_group_id: self.store.active_group_id().await,
            },
            IpcRequest::SaveGroups {
                groups,
                last_active_group_id,
            } => match self.store.replace(groups, last_active_group_id).await {
                Ok(()) => IpcResponse::Ack,
                Err(e) => IpcResponse::error(e),
            },
            IpcRequest::SelectDirectory => {
                let picker = Arc::clone(&self.picker);
                let path = tokio::task::spawn_blocking(move || picker.select_directory())
                    .await
                    .ok()
                    .flatten();
                IpcResponse::Directory {
                    path: path.map(|p| p.to_string_lossy().into_owned()),
                }
            }
            IpcRequest::AddGroup { name, layout } => {
                match self.store.add_group(&name, layout).await {
                    Ok(group) => IpcResponse::Group(group),
                    Err(e) => IpcResponse::error(e),
                }
            }
            IpcRequest::RemoveGroup { group_id } => match self.store.remove_group(&group_id).await {
                Ok(group) => IpcResponse::Group(group),
                Err(e) => IpcResponse::error(e),
            },
            IpcRequest::AddTerminal {
                group_id,
                label,
                cwd,
                shell,
            } => {
                let options = NewTerminal { label, cwd, shell };
                match self.store.add_terminal(&group_id, options).await {
                    Ok(terminal) => IpcResponse::Terminal(terminal),
                    Err(e) => IpcResponse::error(e),
                }
            }
            IpcRequest::RemoveTerminal {
                group_id,
                terminal_id,
            } => match self.store.remove_terminal(&group_id, &terminal_id).await {
                Ok(terminal) => IpcResponse::Terminal(terminal),
                Err(e) => IpcResponse::error(e),
            },
            IpcRequest::MoveTerminal {
                from_group_id,
                to_group_id,
                terminal_id,
            } => match self
                .store
                .move_terminal(&from_group_id, &to_group_id, &terminal_id)
                .await
            {
                Ok(moved) => IpcResponse::Moved { moved },
                Err(e) => IpcResponse::error(e),
            },
            IpcRequest::SetActiveGroup { group_id } => {
                match self.store.set_active_group(group_id.as_deref()).await {
                    Ok(()) => IpcResponse::Ack,
                    Err(e) => IpcResponse::error(e),
                }
            }
        };
        Some(response)
    }

    async fn serve(self: Arc<Self>, server: IpcServer) {
        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                accepted = server.accept() => match accepted {
                    Ok(connection) => {
                        debug!("Command client connected");
                        tokio::spawn(Arc::clone(&self).handle_connection(connection));
                    }
                    Err(e) => warn!("Failed to accept command client: {}", e),
                },
            }
        }
        debug!("Command surface closed");
    }

    async fn handle_connection(self: Arc<Self>, connection: IpcConnection) {
        let (mut reader, mut writer) = connection.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<IpcResponse>();

        let writer_task = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                if let Err(e) = writer.send_response(&response).await {
                    debug!("Command client went away: {}", e);
                    break;
                }
            }
        });

        let mut subscription = None;
        loop {
            let read = tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                read = reader.read_request() => read,
            };
            let request = match read {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(IpcError::Json(e)) => {
                    let _ = tx.send(IpcResponse::error(format!("Invalid request: {}", e)));
                    continue;
                }
                Err(e) => {
                    debug!("Command connection failed: {}", e);
                    break;
                }
            };

            if request == IpcRequest::Subscribe {
                if subscription.is_none() {
                    let (id, events) = self.supervisor.subscribe();
                    let task = tokio::spawn(push_events(events, tx.clone()));
                    subscription = Some((id, task));
                }
                let _ = tx.send(IpcResponse::Subscribed);
                continue;
            }

            if let Some(response) = self.handle_request(request).await {
                if tx.send(response).is_err() {
                    break;
                }
            }
        }

        if let Some((id, task)) = subscription {
            self.supervisor.events().unsubscribe(id);
            task.abort();
        }
        drop(tx);
        let _ = writer_task.await;
        debug!("Command client disconnected");
    }
}

async fn push_events(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    tx: mpsc::UnboundedSender<IpcResponse>,
) {
    while let Some(event) = events.recv().await {
        if tx.send(IpcResponse::Event(event)).is_err() {
            break;
        }
    }
}

/// Applies every status event of the supervisor to the store.
async fn forward_status(
    supervisor: Arc<SessionSupervisor>,
    store: GroupStateStore,
    shutdown: CancellationToken,
) {
    let (id, mut events) = supervisor.subscribe();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(SessionEvent::Status {
                terminal_id,
                status,
                exit_code,
            }) => {
                if store.apply_status(&terminal_id, status, exit_code).await.is_none() {
                    debug!(terminal_id = %terminal_id, "Status for a terminal outside every group");
                }
            }
            Some(SessionEvent::Data { .. }) => {}
            None => break,
        }
    }
    supervisor.events().unsubscribe(id);
}
