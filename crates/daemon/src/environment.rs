//! Execution environment for new sessions.
//!
//! The resolver builds the environment a backing process is spawned with:
//! the inherited process environment, a search path extended with the
//! configured and auto-detected Claude CLI locations, the per-session
//! overrides, and the fixed terminal capability variables.
//!
//! Detection of install locations is best effort. Any failure while scanning
//! degrades to fewer (or zero) results and is only logged.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use protocol::SearchPathOverrides;

/// Separator between entries of the search-path variable.
#[cfg(windows)]
pub const PATH_LIST_SEPARATOR: char = ';';
#[cfg(not(windows))]
pub const PATH_LIST_SEPARATOR: char = ':';

/// Separator used by the user-facing `extra_paths` setting on every platform.
pub const EXTRA_PATHS_SEPARATOR: char = ';';

/// Terminal capability variables applied on top of everything else.
pub const TERMINAL_CAPABILITIES: &[(&str, &str)] =
    &[("TERM", "xterm-256color"), ("COLORTERM", "truecolor")];

/// Computes the environment for a new session.
#[derive(Debug, Clone)]
pub struct EnvironmentResolver {
    inherited: BTreeMap<String, String>,
}

impl EnvironmentResolver {
    /// Snapshot of the current process environment.
    pub fn from_process() -> Self {
        Self::with_inherited(std::env::vars())
    }

    /// Resolver over an explicit base environment.
    pub fn with_inherited<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            inherited: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// The inherited search path (`PATH`, or `Path` as Windows spells it).
    pub fn inherited_path(&self) -> &str {
        self.inherited
            .get("PATH")
            .or_else(|| self.inherited.get("Path"))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Directories to prepend to the inherited search path, in order.
    pub fn search_path_additions(&self, overrides: &SearchPathOverrides) -> Vec<String> {
        search_path_additions(overrides, self.inherited_path())
    }

    /// Full environment for a session.
    pub fn resolve(
        &self,
        overrides: &SearchPathOverrides,
        session_env: &HashMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut env = self.inherited.clone();

        let additions = self.search_path_additions(overrides);
        if !additions.is_empty() {
            let path = prepend_to_path(&additions, self.inherited_path());
            tracing::debug!(added = additions.len(), "Extended session search path");
            if cfg!(windows) {
                env.insert("Path".to_string(), path.clone());
            }
            env.insert("PATH".to_string(), path);
        }

        for (key, value) in session_env {
            env.insert(key.clone(), value.clone());
        }

        for (key, value) in TERMINAL_CAPABILITIES {
            env.insert((*key).to_string(), (*value).to_string());
        }

        env
    }
}

impl Default for EnvironmentResolver {
    fn default() -> Self {
        Self::from_process()
    }
}

/// Ordered, deduplicated list of directories to prepend.
///
/// 1. The manual Claude path, if set and present on disk.
/// 2. Each `;`-separated extra path that is an existing directory.
/// 3. Without a manual Claude path, each detected path that is an existing
///    directory.
///
/// Candidates already contained in `inherited_path` are skipped.
pub fn search_path_additions(overrides: &SearchPathOverrides, inherited_path: &str) -> Vec<String> {
    let manual = overrides
        .claude_path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty());

    let mut candidates: Vec<&str> = Vec::new();

    if let Some(path) = manual {
        if Path::new(path).exists() {
            candidates.push(path);
        }
    }

    if let Some(extra) = overrides.extra_paths.as_deref() {
        candidates.extend(
            extra
                .split(EXTRA_PATHS_SEPARATOR)
                .map(str::trim)
                .filter(|p| !p.is_empty() && Path::new(p).is_dir()),
        );
    }

    if manual.is_none() {
        candidates.extend(
            overrides
                .detected_paths
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty() && Path::new(p).is_dir()),
        );
    }

    let mut additions: Vec<String> = Vec::new();
    for candidate in candidates {
        if inherited_path.contains(candidate) || additions.iter().any(|a| a == candidate) {
            continue;
        }
        additions.push(candidate.to_string());
    }
    additions
}

/// Joins `additions` in front of `inherited` without touching inherited entries.
pub fn prepend_to_path(additions: &[String], inherited: &str) -> String {
    let separator = PATH_LIST_SEPARATOR.to_string();
    let mut parts: Vec<&str> = additions.iter().map(String::as_str).collect();
    if !inherited.is_empty() {
        parts.push(inherited);
    }
    parts.join(&separator)
}

/// Filesystem roots scanned during install detection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionRoots {
    pub home: Option<PathBuf>,
    /// `%LOCALAPPDATA%` on Windows.
    pub local_app_data: Option<PathBuf>,
    /// `%APPDATA%` on Windows.
    pub app_data: Option<PathBuf>,
    /// `C:\Program Files` on Windows.
    pub program_files: Option<PathBuf>,
    /// Fixed system directories checked on Unix.
    pub system_dirs: Vec<PathBuf>,
}

impl DetectionRoots {
    /// Roots derived from the current user and process environment.
    pub fn from_env() -> Self {
        let home = dirs::home_dir();
        let local_app_data = std::env::var_os("LOCALAPPDATA")
            .map(PathBuf::from)
            .or_else(|| home.as_ref().map(|h| h.join("AppData").join("Local")));
        let app_data = std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .or_else(|| home.as_ref().map(|h| h.join("AppData").join("Roaming")));
        let program_files = std::env::var_os("ProgramFiles")
            .map(PathBuf::from)
            .or_else(|| cfg!(windows).then(|| PathBuf::from("C:\\Program Files")));

        Self {
            home,
            local_app_data,
            app_data,
            program_files,
            system_dirs: vec![
                PathBuf::from("/opt/homebrew/bin"),
                PathBuf::from("/usr/local/bin"),
            ],
        }
    }
}

/// Scans well-known install locations of the Claude CLI for this platform.
pub fn detect_install_paths() -> Vec<String> {
    let roots = DetectionRoots::from_env();
    let found = if cfg!(windows) {
        detect_windows_layout(&roots)
    } else {
        detect_unix_layout(&roots)
    };
    tracing::info!(count = found.len(), paths = ?found, "Install path detection finished");
    found
}

/// Windows layout: WinGet packages and links, npm globals, Node.js installs.
pub fn detect_windows_layout(roots: &DetectionRoots) -> Vec<String> {
    let mut found = Vec::new();

    if let Some(local) = &roots.local_app_data {
        let packages = local.join("Microsoft").join("WinGet").join("Packages");
        found.extend(scan_winget_packages(&packages));
    }

    if let Some(app_data) = &roots.app_data {
        let npm = app_data.join("npm");
        if npm.join("claude.cmd").exists() {
            tracing::debug!(path = %npm.display(), "Found npm installation");
            push_unique(&mut found, &npm);
        }
    }

    let mut node_dirs = Vec::new();
    if let Some(local) = &roots.local_app_data {
        let links = local.join("Microsoft").join("WinGet").join("Links");
        if links.is_dir() {
            push_unique(&mut found, &links);
        }
        node_dirs.push(local.join("Programs").join("nodejs"));
    }
    if let Some(home) = &roots.home {
        node_dirs.push(
            home.join("AppData")
                .join("Local")
                .join("Programs")
                .join("nodejs"),
        );
    }
    if let Some(program_files) = &roots.program_files {
        node_dirs.push(program_files.join("nodejs"));
    }
    for dir in node_dirs {
        if dir.is_dir() {
            push_unique(&mut found, &dir);
        }
    }

    found
}

fn scan_winget_packages(packages: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(packages) {
        Ok(entries) => entries,
        Err(e) => {
            if packages.exists() {
                tracing::warn!(path = %packages.display(), error = %e, "Failed to scan WinGet packages");
            }
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if !name.contains("claude") {
            continue;
        }
        let dir = entry.path();
        if dir.join("claude.exe").exists() {
            tracing::debug!(path = %dir.display(), "Found WinGet installation");
            push_unique(&mut found, &dir);
        }
    }
    found.sort();
    found
}

/// Unix layout: `claude` on the inherited path, user-local bins, Homebrew,
/// and the nvm default node.
pub fn detect_unix_layout(roots: &DetectionRoots) -> Vec<String> {
    let mut found = Vec::new();

    if let Ok(binary) = which::which("claude") {
        if let Some(parent) = binary.parent() {
            push_unique(&mut found, parent);
        }
    }

    if let Some(home) = &roots.home {
        for dir in [home.join(".local").join("bin"), home.join(".npm-global").join("bin")] {
            if dir.join("claude").exists() {
                push_unique(&mut found, &dir);
            }
        }
        if let Some(node_bin) = nvm_node_bin(home) {
            if node_bin.join("claude").exists() {
                push_unique(&mut found, &node_bin);
            }
        }
    }

    for dir in &roots.system_dirs {
        if dir.join("claude").exists() {
            push_unique(&mut found, dir);
        }
    }

    found
}

fn push_unique(found: &mut Vec<String>, path: &Path) {
    let path = path.to_string_lossy().into_owned();
    if !found.contains(&path) {
        found.push(path);
    }
}

/// Bin directory of the nvm default node, falling back to the newest install.
fn nvm_node_bin(home: &Path) -> Option<PathBuf> {
    let nvm_dir = home.join(".nvm");
    let versions_dir = nvm_dir.join("versions").join("node");

    let mut versions: Vec<String> = std::fs::read_dir(&versions_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.starts_with('v'))
        .collect();
    if versions.is_empty() {
        return None;
    }
    sort_versions(&mut versions);

    let alias = std::fs::read_to_string(nvm_dir.join("alias").join("default"))
        .ok()
        .map(|s| s.trim().trim_start_matches('v').to_string())
        .filter(|s| !s.is_empty());

    let selected = alias
        .and_then(|alias| {
            versions
                .iter()
                .rev()
                .find(|v| v.trim_start_matches('v').starts_with(&alias))
                .cloned()
        })
        .or_else(|| versions.last().cloned())?;

    let bin = versions_dir.join(selected).join("bin");
    bin.is_dir().then_some(bin)
}

/// Sorts `vX.Y.Z` strings by numeric version.
fn sort_versions(versions: &mut [String]) {
    versions.sort_by_key(|v| {
        let mut parts = v
            .trim_start_matches('v')
            .split('.')
            .map(|s| s.parse::<u32>().unwrap_or(0));
        (
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        )
    });
}
