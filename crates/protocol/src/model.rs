//! Persisted data model: groups, terminals, layouts and settings.
//!
//! Field names serialize in camelCase so the persisted envelope keeps the
//! shape `{ version, groups, lastActiveGroupId, settings }`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Unique identifier of a terminal, shared by the store and the supervisor.
pub type TerminalId = String;

/// Unique identifier of a group.
pub type GroupId = String;

/// Current schema version of the persisted envelope.
pub const SCHEMA_VERSION: u32 = 1;

/// Named layout presets offered to the user.
pub const PRESET_LAYOUTS: &[(&str, GridLayout)] = &[
    ("2x2", GridLayout { rows: 2, cols: 2 }),
    ("2x3", GridLayout { rows: 2, cols: 3 }),
    ("2x4", GridLayout { rows: 2, cols: 4 }),
    ("3x2", GridLayout { rows: 3, cols: 2 }),
    ("3x3", GridLayout { rows: 3, cols: 3 }),
    ("3x4", GridLayout { rows: 3, cols: 4 }),
    ("4x2", GridLayout { rows: 4, cols: 2 }),
    ("4x3", GridLayout { rows: 4, cols: 3 }),
    ("4x4", GridLayout { rows: 4, cols: 4 }),
];

/// Grid layout of a group.
///
/// `rows * cols` is the number of terminals shown per page. It is a soft
/// limit: a group may hold more terminals, which are paginated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridLayout {
    pub rows: u16,
    pub cols: u16,
}

impl GridLayout {
    /// Creates a layout, rejecting zero dimensions.
    pub fn new(rows: u16, cols: u16) -> Result<Self> {
        let layout = Self { rows, cols };
        layout.validate()?;
        Ok(layout)
    }

    /// Looks up a named preset such as `"2x3"`.
    pub fn preset(name: &str) -> Result<Self> {
        PRESET_LAYOUTS
            .iter()
            .find(|(preset, _)| *preset == name)
            .map(|(_, layout)| *layout)
            .ok_or_else(|| ProtocolError::UnknownPreset(name.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.rows == 0 || self.cols == 0 {
            return Err(ProtocolError::InvalidLayout {
                rows: self.rows,
                cols: self.cols,
            });
        }
        Ok(())
    }

    /// Number of grid cells per page.
    pub fn capacity(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    /// Number of pages needed to show `terminal_count` terminals (at least 1).
    pub fn page_count(&self, terminal_count: usize) -> usize {
        let per_page = self.capacity().max(1);
        terminal_count.div_ceil(per_page).max(1)
    }
}

impl Default for GridLayout {
    fn default() -> Self {
        Self { rows: 2, cols: 2 }
    }
}

/// Lifecycle status of a terminal as recorded in its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    /// No session has been started yet.
    #[default]
    Idle,
    /// A backing process is alive.
    Running,
    /// The backing process exited.
    Exited,
    /// The session could not be started.
    Error,
}

/// Terminal metadata owned by exactly one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Terminal {
    pub id: TerminalId,
    pub label: String,
    pub cwd: String,
    /// Shell specifier; `"default"` means the platform default.
    pub shell: String,
    #[serde(default)]
    pub status: TerminalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Creation time in Unix epoch milliseconds.
    pub created_at: u64,
}

impl Terminal {
    /// Applies a partial update. A status change replaces the exit code with
    /// the one carried by the update.
    pub fn apply(&mut self, update: &TerminalUpdate) {
        if let Some(label) = &update.label {
            self.label = label.clone();
        }
        if let Some(cwd) = &update.cwd {
            self.cwd = cwd.clone();
        }
        if let Some(shell) = &update.shell {
            self.shell = shell.clone();
        }
        if let Some(status) = update.status {
            self.status = status;
            self.exit_code = update.exit_code;
        } else if update.exit_code.is_some() {
            self.exit_code = update.exit_code;
        }
    }
}

/// Partial update for a terminal (shallow merge).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TerminalUpdate {
    pub label: Option<String>,
    pub cwd: Option<String>,
    pub shell: Option<String>,
    pub status: Option<TerminalStatus>,
    pub exit_code: Option<i32>,
}

impl TerminalUpdate {
    /// An update that only carries a status transition.
    pub fn status(status: TerminalStatus, exit_code: Option<i32>) -> Self {
        Self {
            status: Some(status),
            exit_code,
            ..Self::default()
        }
    }

    /// Whether this update touches only the status fields.
    pub fn is_status_only(&self) -> bool {
        self.label.is_none() && self.cwd.is_none() && self.shell.is_none()
    }
}

/// A named collection of terminals sharing a grid layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalGroup {
    pub id: GroupId,
    pub name: String,
    /// Display color as a hex string.
    pub color: String,
    pub layout: GridLayout,
    #[serde(default)]
    pub terminals: Vec<Terminal>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl TerminalGroup {
    pub fn contains(&self, terminal_id: &str) -> bool {
        self.terminals.iter().any(|t| t.id == terminal_id)
    }

    pub fn terminal(&self, terminal_id: &str) -> Option<&Terminal> {
        self.terminals.iter().find(|t| t.id == terminal_id)
    }

    pub fn page_count(&self) -> usize {
        self.layout.page_count(self.terminals.len())
    }

    /// Terminals shown on page `index`; out-of-range indices clamp to the
    /// last page.
    pub fn page(&self, index: usize) -> &[Terminal] {
        let per_page = self.layout.capacity().max(1);
        let index = index.min(self.page_count() - 1);
        let start = (index * per_page).min(self.terminals.len());
        let end = (start + per_page).min(self.terminals.len());
        &self.terminals[start..end]
    }
}

/// Partial update for a group (shallow merge).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupUpdate {
    pub name: Option<String>,
    pub color: Option<String>,
    pub layout: Option<GridLayout>,
}

/// UI theme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
    System,
}

/// Saved window geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBounds {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Process-wide application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub theme: Theme,
    pub font_size: u16,
    pub font_family: String,
    /// `"default"` selects the platform shell.
    pub default_shell: String,
    pub default_cwd: String,
    pub scrollback_lines: u32,
    /// Manually configured Claude CLI location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_path: Option<String>,
    /// Extra search-path entries separated by `;`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_paths: Option<String>,
    /// Install locations found by the startup scan.
    #[serde(rename = "detectedClaudePaths")]
    pub detected_paths: Vec<String>,
    pub shortcuts: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_bounds: Option<WindowBounds>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            theme: Theme::Dark,
            font_size: 14,
            font_family: r#"Consolas, "Courier New", monospace"#.to_string(),
            default_shell: "default".to_string(),
            default_cwd: String::new(),
            scrollback_lines: 10_000,
            claude_path: None,
            extra_paths: None,
            detected_paths: Vec::new(),
            shortcuts: default_shortcuts(),
            window_bounds: None,
        }
    }
}

impl AppSettings {
    /// Shallow-merges a patch into these settings.
    pub fn merge(&mut self, patch: SettingsPatch) {
        if let Some(theme) = patch.theme {
            self.theme = theme;
        }
        if let Some(font_size) = patch.font_size {
            self.font_size = font_size;
        }
        if let Some(font_family) = patch.font_family {
            self.font_family = font_family;
        }
        if let Some(default_shell) = patch.default_shell {
            self.default_shell = default_shell;
        }
        if let Some(default_cwd) = patch.default_cwd {
            self.default_cwd = default_cwd;
        }
        if let Some(scrollback_lines) = patch.scrollback_lines {
            self.scrollback_lines = scrollback_lines;
        }
        if let Some(claude_path) = patch.claude_path {
            self.claude_path = non_blank(claude_path);
        }
        if let Some(extra_paths) = patch.extra_paths {
            self.extra_paths = non_blank(extra_paths);
        }
        if let Some(detected_paths) = patch.detected_paths {
            self.detected_paths = detected_paths;
        }
        if let Some(shortcuts) = patch.shortcuts {
            self.shortcuts = shortcuts;
        }
        if let Some(window_bounds) = patch.window_bounds {
            self.window_bounds = Some(window_bounds);
        }
    }

    /// The search-path inputs a new session needs.
    pub fn search_path_overrides(&self) -> SearchPathOverrides {
        SearchPathOverrides {
            claude_path: self.claude_path.clone(),
            extra_paths: self.extra_paths.clone(),
            detected_paths: self.detected_paths.clone(),
        }
    }

    /// Whether a manual Claude path is configured.
    pub fn has_manual_claude_path(&self) -> bool {
        self.claude_path
            .as_deref()
            .map(|p| !p.trim().is_empty())
            .unwrap_or(false)
    }
}

fn non_blank(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Default keyboard shortcut map.
pub fn default_shortcuts() -> BTreeMap<String, String> {
    [
        ("newGroup", "CmdOrCtrl+N"),
        ("newTerminal", "CmdOrCtrl+T"),
        ("closeTerminal", "CmdOrCtrl+W"),
        ("nextGroup", "CmdOrCtrl+Tab"),
        ("prevGroup", "CmdOrCtrl+Shift+Tab"),
        ("focusUp", "Alt+Up"),
        ("focusDown", "Alt+Down"),
        ("focusLeft", "Alt+Left"),
        ("focusRight", "Alt+Right"),
        ("maximize", "CmdOrCtrl+Enter"),
    ]
    .into_iter()
    .map(|(action, keys)| (action.to_string(), keys.to_string()))
    .collect()
}

/// Partial settings update. An empty `claude_path` or `extra_paths` clears
/// the value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsPatch {
    pub theme: Option<Theme>,
    pub font_size: Option<u16>,
    pub font_family: Option<String>,
    pub default_shell: Option<String>,
    pub default_cwd: Option<String>,
    pub scrollback_lines: Option<u32>,
    pub claude_path: Option<String>,
    pub extra_paths: Option<String>,
    #[serde(rename = "detectedClaudePaths")]
    pub detected_paths: Option<Vec<String>>,
    pub shortcuts: Option<BTreeMap<String, String>>,
    pub window_bounds: Option<WindowBounds>,
}

/// Settings that feed the search-path computation of a new session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchPathOverrides {
    pub claude_path: Option<String>,
    pub extra_paths: Option<String>,
    pub detected_paths: Vec<String>,
}

/// The unit written to and read from durable storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedData {
    pub version: u32,
    pub groups: Vec<TerminalGroup>,
    pub last_active_group_id: Option<GroupId>,
    pub settings: AppSettings,
}

impl Default for PersistedData {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            groups: Vec::new(),
            last_active_group_id: None,
            settings: AppSettings::default(),
        }
    }
}
