//! End-to-end integration tests for TermDeck.
//!
//! These tests verify complete flows work correctly:
//! - Daemon startup, restore and shutdown
//! - Cascading session teardown from the group store
//! - The command surface over a real socket
//! - The persisted document layout

use std::sync::Arc;
use std::time::Duration;

use protocol::{
    CreateSessionRequest, GridLayout, SessionEvent, SettingsPatch, TerminalGroup, TerminalStatus,
};
use tempfile::TempDir;
use termdeck::config::Config;
use termdeck::ipc::{IpcClient, IpcRequest, IpcResponse, PidFile, PidFileError};
use termdeck::orchestrator::{DeckOrchestrator, OrchestratorState};
use termdeck::persistence::Persistence;
use termdeck::session::SessionSupervisor;
use termdeck::store::{GroupStateStore, NewTerminal, SessionTerminator};

/// Create a test configuration with a temporary directory.
fn create_test_config() -> (Config, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.daemon.data_dir = temp_dir.path().to_path_buf();
    config.ipc.socket_path = Some(temp_dir.path().join("termdeck.sock"));
    (config, temp_dir)
}

/// Orchestrator over the store file in `config`, with install detection
/// disabled by a manual Claude path.
fn create_orchestrator(config: &Config) -> Arc<DeckOrchestrator> {
    let persistence = Persistence::open_file(config.store_path()).unwrap();
    persistence
        .update_settings(SettingsPatch {
            claude_path: Some("/opt/claude/bin".into()),
            ..SettingsPatch::default()
        })
        .unwrap();
    Arc::new(DeckOrchestrator::with_persistence(config.clone(), persistence))
}

async fn send(client: &mut IpcClient, request: IpcRequest) -> IpcResponse {
    client.send(request).await.unwrap()
}

// =============================================================================
// Orchestrator Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_orchestrator_state_starts_stopped() {
    let (config, _temp_dir) = create_test_config();

    let orchestrator = create_orchestrator(&config);
    assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);

    // Stop should succeed even when already stopped
    assert!(orchestrator.stop().await.is_ok());
}

#[tokio::test]
async fn test_restart_restores_groups_with_idle_status() {
    let (config, _temp_dir) = create_test_config();

    let first = create_orchestrator(&config);
    first.start().await.unwrap();
    let group = first.store().add_group("Build", GridLayout::new(1, 2).unwrap()).await.unwrap();
    let terminal = first
        .store()
        .add_terminal(&group.id, NewTerminal::default())
        .await
        .unwrap();
    first
        .store()
        .apply_status(&terminal.id, TerminalStatus::Running, None)
        .await;
    first.stop().await.unwrap();

    let second = Arc::new(DeckOrchestrator::new(config).unwrap());
    second.start().await.unwrap();
    let restored = second.store().terminal(&group.id, &terminal.id).await.unwrap();
    assert_eq!(restored.status, TerminalStatus::Idle);
    assert_eq!(restored.exit_code, None);
    assert_eq!(second.store().group(&group.id).await.unwrap().layout, GridLayout::new(1, 2).unwrap());
    second.stop().await.unwrap();
}

#[tokio::test]
async fn test_pid_file_guards_single_instance() {
    let (config, _temp_dir) = create_test_config();
    let path = config.pid_file_path();

    let held = PidFile::acquire(&path).unwrap();
    assert_eq!(held.pid(), std::process::id());

    // A live foreign pid blocks a second daemon.
    std::fs::write(&path, "1\n").unwrap();
    match PidFile::acquire(&path) {
        Err(PidFileError::AlreadyRunning(pid)) => assert_eq!(pid, 1),
        other => panic!("Expected AlreadyRunning, got {:?}", other),
    }
}

// =============================================================================
// Store and Supervisor Tests
// =============================================================================

#[tokio::test]
async fn test_remove_group_terminates_every_session() {
    let home = TempDir::new().unwrap();
    let supervisor = Arc::new(SessionSupervisor::new(Default::default()));
    let terminator: Arc<dyn SessionTerminator> = supervisor.clone();
    let store = GroupStateStore::new(terminator);

    let group = store.add_group("Ops", GridLayout::default()).await.unwrap();
    let mut ids = Vec::new();
    for label in ["a", "b", "c"] {
        let terminal = store
            .add_terminal(
                &group.id,
                NewTerminal {
                    label: label.to_string(),
                    ..NewTerminal::default()
                },
            )
            .await
            .unwrap();
        let request = CreateSessionRequest::new(terminal.id.clone())
            .with_cwd(home.path().to_string_lossy())
            .with_shell("/bin/sh");
        assert!(supervisor.create(request).await.success);
        ids.push(terminal.id);
    }
    assert_eq!(supervisor.running_count(), 3);

    let removed = store.remove_group(&group.id).await.unwrap();
    assert_eq!(removed.terminals.len(), 3);
    assert_eq!(supervisor.running_count(), 0);
    for id in &ids {
        assert!(!supervisor.contains(id));
    }
    assert!(store.groups().await.is_empty());
}

#[tokio::test]
async fn test_move_keeps_session_running() {
    let supervisor = Arc::new(SessionSupervisor::new(Default::default()));
    let terminator: Arc<dyn SessionTerminator> = supervisor.clone();
    let store = GroupStateStore::new(terminator);

    let from = store.add_group("From", GridLayout::default()).await.unwrap();
    let to = store.add_group("To", GridLayout::default()).await.unwrap();
    let terminal = store
        .add_terminal(&from.id, NewTerminal::default())
        .await
        .unwrap();
    let request = CreateSessionRequest::new(terminal.id.clone()).with_shell("/bin/sh");
    assert!(supervisor.create(request).await.success);

    assert!(store.move_terminal(&from.id, &to.id, &terminal.id).await.unwrap());
    assert_eq!(store.find_terminal_group(&terminal.id).await, Some(to.id.clone()));
    assert!(supervisor.contains(&terminal.id));
    store.check_invariants().await.unwrap();

    supervisor.kill_all().await;
}

// =============================================================================
// Command Surface Tests
// =============================================================================

#[tokio::test]
async fn test_command_surface_full_flow() {
    let (config, temp_dir) = create_test_config();
    let orchestrator = create_orchestrator(&config);
    orchestrator.start().await.unwrap();

    let socket = config.socket_path();
    let mut control = IpcClient::connect(&socket).await.unwrap();
    let mut events = IpcClient::connect(&socket).await.unwrap();
    events.subscribe().await.unwrap();

    let group = match send(
        &mut control,
        IpcRequest::AddGroup {
            name: "Work".into(),
            layout: GridLayout::default(),
        },
    )
    .await
    {
        IpcResponse::Group(group) => group,
        other => panic!("Expected Group, got {:?}", other),
    };

    let terminal = match send(
        &mut control,
        IpcRequest::AddTerminal {
            group_id: group.id.clone(),
            label: "shell".into(),
            cwd: temp_dir.path().to_string_lossy().into_owned(),
            shell: Some("/bin/sh".into()),
        },
    )
    .await
    {
        IpcResponse::Terminal(terminal) => terminal,
        other => panic!("Expected Terminal, got {:?}", other),
    };

    let request = CreateSessionRequest::new(terminal.id.clone())
        .with_cwd(terminal.cwd.clone())
        .with_shell(terminal.shell.clone())
        .with_size(100, 30);
    match control.create_session(request).await.unwrap() {
        IpcResponse::SessionCreated(result) => {
            assert!(result.success, "{:?}", result.error);
            assert!(result.fallback_cwd.is_none());
        }
        other => panic!("Expected SessionCreated, got {:?}", other),
    }

    match send(&mut control, IpcRequest::ListSessions).await {
        IpcResponse::Sessions { sessions } => {
            assert_eq!(sessions.len(), 1);
            assert_eq!(sessions[0].terminal_id, terminal.id);
            assert_eq!((sessions[0].cols, sessions[0].rows), (100, 30));
        }
        other => panic!("Expected Sessions, got {:?}", other),
    }

    control
        .write(&terminal.id, b"echo flow-$((6*7))\n")
        .await
        .unwrap();
    let mut output = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let SessionEvent::Data { data, .. } = events.next_event().await.unwrap() {
                output.extend_from_slice(&data);
                if String::from_utf8_lossy(&output).contains("flow-42") {
                    break;
                }
            }
        }
    })
    .await
    .expect("output not received");

    // Removing the terminal ends its session; the exit is pushed as status.
    match send(
        &mut control,
        IpcRequest::RemoveTerminal {
            group_id: group.id.clone(),
            terminal_id: terminal.id.clone(),
        },
    )
    .await
    {
        IpcResponse::Terminal(removed) => assert_eq!(removed.id, terminal.id),
        other => panic!("Expected Terminal, got {:?}", other),
    }
    assert!(!orchestrator.supervisor().contains(&terminal.id));

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let SessionEvent::Status { status, .. } = events.next_event().await.unwrap() {
                assert_eq!(status, TerminalStatus::Exited);
                break;
            }
        }
    })
    .await
    .expect("exit status not received");

    match send(&mut control, IpcRequest::LoadGroups).await {
        IpcResponse::Groups {
            groups,
            last_active_group_id,
        } => {
            assert_eq!(groups.len(), 1);
            assert!(groups[0].terminals.is_empty());
            assert_eq!(last_active_group_id, Some(group.id.clone()));
        }
        other => panic!("Expected Groups, got {:?}", other),
    }

    orchestrator.stop().await.unwrap();
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_malformed_line_gets_error_and_connection_survives() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let (config, _temp_dir) = create_test_config();
    let orchestrator = create_orchestrator(&config);
    orchestrator.start().await.unwrap();

    let stream = tokio::net::UnixStream::connect(config.socket_path())
        .await
        .unwrap();
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    write_half.write_all(b"{not json}\n\"Ping\"\n").await.unwrap();

    let first: IpcResponse = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert!(matches!(first, IpcResponse::Error { .. }));
    let second: IpcResponse = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(second, IpcResponse::Pong);

    orchestrator.stop().await.unwrap();
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[tokio::test]
async fn test_store_file_envelope() {
    let (config, _temp_dir) = create_test_config();
    let orchestrator = create_orchestrator(&config);
    orchestrator.start().await.unwrap();

    let group = orchestrator
        .store()
        .add_group("Docs", GridLayout::default())
        .await
        .unwrap();
    orchestrator.stop().await.unwrap();

    let text = std::fs::read_to_string(config.store_path()).unwrap();
    let document: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(document["version"], 1);
    assert_eq!(document["lastActiveGroupId"], group.id.as_str());
    assert_eq!(document["settings"]["claudePath"], "/opt/claude/bin");

    let groups: Vec<TerminalGroup> = serde_json::from_value(document["groups"].clone()).unwrap();
    assert_eq!(groups, vec![group]);
}
