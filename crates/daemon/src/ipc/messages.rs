//! IPC message types for the command surface.
//!
//! Requests and responses are serde's externally tagged enums, one JSON
//! object per line. After `Subscribe` the daemon pushes `Event` responses
//! on the same connection.

use protocol::messages::base64_bytes;
use protocol::{
    AppSettings, CreateSessionRequest, CreateSessionResult, GridLayout, GroupId, KillResult,
    SessionEvent, SessionSummary, SettingsPatch, Terminal, TerminalGroup, TerminalId,
};
use serde::{Deserialize, Serialize};

/// Requests sent to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// Start a session for a terminal.
    CreateSession(CreateSessionRequest),
    /// Forward input to a session. No response is sent.
    Write {
        terminal_id: TerminalId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Change a session's window size. No response is sent.
    Resize {
        terminal_id: TerminalId,
        cols: u16,
        rows: u16,
    },
    /// Terminate a session.
    Kill { terminal_id: TerminalId },
    /// Receive data and status events on this connection.
    Subscribe,
    /// List all live sessions.
    ListSessions,
    GetSettings,
    SetSettings(SettingsPatch),
    /// Rescan install locations and store the result.
    DetectInstallPaths,
    LoadGroups,
    /// Replace the stored groups wholesale.
    SaveGroups {
        groups: Vec<TerminalGroup>,
        last_active_group_id: Option<GroupId>,
    },
    /// Ask the directory picker for a path.
    SelectDirectory,
    AddGroup {
        name: String,
        layout: GridLayout,
    },
    /// Remove a group, terminating its sessions.
    RemoveGroup { group_id: GroupId },
    AddTerminal {
        group_id: GroupId,
        label: String,
        cwd: String,
        shell: Option<String>,
    },
    RemoveTerminal {
        group_id: GroupId,
        terminal_id: TerminalId,
    },
    MoveTerminal {
        from_group_id: GroupId,
        to_group_id: GroupId,
        terminal_id: TerminalId,
    },
    SetActiveGroup { group_id: Option<GroupId> },
}

impl IpcRequest {
    /// Fire-and-forget requests get no response.
    pub fn expects_response(&self) -> bool {
        !matches!(self, IpcRequest::Write { .. } | IpcRequest::Resize { .. })
    }
}

/// Responses sent by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        running: bool,
        uptime_secs: u64,
        /// Live sessions, used to confirm shutdown.
        session_count: usize,
        group_count: usize,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// Generic success for requests without a payload.
    Ack,
    SessionCreated(CreateSessionResult),
    Killed(KillResult),
    /// Acknowledges `Subscribe`; events follow.
    Subscribed,
    /// Pushed session event.
    Event(SessionEvent),
    Sessions { sessions: Vec<SessionSummary> },
    Settings(AppSettings),
    InstallPaths { paths: Vec<String> },
    Groups {
        groups: Vec<TerminalGroup>,
        last_active_group_id: Option<GroupId>,
    },
    Group(TerminalGroup),
    Terminal(Terminal),
    Moved { moved: bool },
    Directory { path: Option<String> },
    /// An error occurred processing the request.
    Error { message: String },
}

impl IpcResponse {
    pub fn error(message: impl std::fmt::Display) -> Self {
        IpcResponse::Error {
            message: message.to_string(),
        }
    }
}
