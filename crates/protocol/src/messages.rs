//! Session payloads exchanged between the UI boundary and the daemon.
//!
//! Output bytes travel base64-encoded so every payload stays valid JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{SearchPathOverrides, TerminalId, TerminalStatus};

/// Default terminal width used when a caller passes zero.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height used when a caller passes zero.
pub const DEFAULT_ROWS: u16 = 24;

/// Request to start a backing process for a terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateSessionRequest {
    /// Terminal id the session is registered under.
    pub terminal_id: TerminalId,
    /// Requested working directory; empty means "use the home directory".
    pub cwd: String,
    /// Shell specifier; `None` or `"default"` selects the platform shell.
    pub shell: Option<String>,
    pub cols: u16,
    pub rows: u16,
    /// Extra environment variables for this session.
    pub env: HashMap<String, String>,
    /// Search-path inputs taken from the current settings.
    pub search_path: SearchPathOverrides,
}

impl Default for CreateSessionRequest {
    fn default() -> Self {
        Self {
            terminal_id: String::new(),
            cwd: String::new(),
            shell: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            env: HashMap::new(),
            search_path: SearchPathOverrides::default(),
        }
    }
}

impl CreateSessionRequest {
    pub fn new(terminal_id: impl Into<TerminalId>) -> Self {
        Self {
            terminal_id: terminal_id.into(),
            ..Self::default()
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the requested working directory was replaced by the home
    /// directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_cwd: Option<String>,
}

impl CreateSessionResult {
    pub fn ok(fallback_cwd: Option<String>) -> Self {
        Self {
            success: true,
            error: None,
            fallback_cwd,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            fallback_cwd: None,
        }
    }
}

/// Outcome of a kill request. `success` is false when nothing was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillResult {
    pub success: bool,
}

/// Events pushed from the supervisor to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Output produced by a backing process.
    Data {
        terminal_id: TerminalId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Lifecycle transition of a session.
    Status {
        terminal_id: TerminalId,
        status: TerminalStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}

impl SessionEvent {
    pub fn terminal_id(&self) -> &str {
        match self {
            SessionEvent::Data { terminal_id, .. } => terminal_id,
            SessionEvent::Status { terminal_id, .. } => terminal_id,
        }
    }
}

/// Description of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub terminal_id: TerminalId,
    /// Internal id generated for this spawn; differs across respawns.
    pub process_id: String,
    /// OS process id, when the platform reports one.
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
}

/// Serde adapter encoding raw bytes as a base64 string.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
