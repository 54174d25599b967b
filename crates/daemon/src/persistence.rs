//! Durable key-value boundary and the persistence façade built on it.
//!
//! The persisted document is a single JSON object shaped like
//! [`PersistedData`]: `version`, `groups`, `lastActiveGroupId` and
//! `settings`. [`JsonFileStore`] keeps it in one file and rewrites it
//! atomically (temp file + rename) on every mutation. Unreadable contents
//! are discarded and replaced by defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use protocol::{AppSettings, GroupId, PersistedData, SettingsPatch, TerminalGroup};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::environment;

pub const KEY_VERSION: &str = "version";
pub const KEY_GROUPS: &str = "groups";
pub const KEY_LAST_ACTIVE_GROUP: &str = "lastActiveGroupId";
pub const KEY_SETTINGS: &str = "settings";

/// File name of the persisted store inside the data directory.
pub const STORE_FILE_NAME: &str = "termdeck-data.json";

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Background write failed: {0}")]
    Background(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Read/write contract of the durable store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Writes several keys as one mutation.
    fn set_many(&self, entries: Vec<(&str, Value)>) -> Result<()> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Location of the backing file, if any.
    fn location(&self) -> Option<PathBuf> {
        None
    }
}

fn default_document() -> Map<String, Value> {
    match serde_json::to_value(PersistedData::default()) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn fill_defaults(document: &mut Map<String, Value>) {
    for (key, value) in default_document() {
        document.entry(key).or_insert(value);
    }
}

/// In-memory store, used by tests and for read-only runs.
pub struct MemoryStore {
    document: RwLock<Map<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            document: RwLock::new(default_document()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.document
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.document
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
        Ok(())
    }
}

/// Single-file JSON store.
pub struct JsonFileStore {
    path: PathBuf,
    document: RwLock<Map<String, Value>>,
}

impl JsonFileStore {
    /// Opens the store at `path`, creating defaults when the file is
    /// missing or unreadable.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (document, rewrite) = Self::read_document(&path);

        let store = Self {
            path,
            document: RwLock::new(document),
        };
        if rewrite {
            let document = store.document.read().unwrap_or_else(|e| e.into_inner());
            store.write_document(&document)?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(path: &Path) -> (Map<String, Value>, bool) {
        if !path.exists() {
            tracing::debug!("Store file not found at {:?}, starting with defaults", path);
            return (default_document(), true);
        }

        let parsed = fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|contents| {
                serde_json::from_str::<Value>(&contents).map_err(|e| e.to_string())
            });

        match parsed {
            Ok(Value::Object(mut document)) => {
                fill_defaults(&mut document);
                (document, false)
            }
            Ok(_) => {
                tracing::warn!("Store file {:?} is not a JSON object, resetting", path);
                (default_document(), true)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Store file {:?} is unreadable, resetting", path);
                (default_document(), true)
            }
        }
    }

    /// Atomic write: temp file, then rename.
    fn write_document(&self, document: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let contents = serde_json::to_string_pretty(document)?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, contents).map_err(|source| PersistenceError::Io {
            path: temp_path.clone(),
            source,
        })?;
        fs::rename(&temp_path, &self.path).map_err(|source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        })?;

        tracing::debug!("Saved store to {:?}", self.path);
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.document
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.set_many(vec![(key, value)])
    }

    fn set_many(&self, entries: Vec<(&str, Value)>) -> Result<()> {
        let mut document = self.document.write().unwrap_or_else(|e| e.into_inner());
        for (key, value) in entries {
            document.insert(key.to_string(), value);
        }
        self.write_document(&document)
    }

    fn location(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }
}

/// Typed access to settings and groups over a [`KeyValueStore`].
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn KeyValueStore>,
    /// Serializes read-merge-write of the settings value.
    settings_lock: Arc<Mutex<()>>,
}

impl Persistence {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            settings_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Persistence over a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Persistence over the JSON file at `path`.
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(Arc::new(JsonFileStore::open(path)?)))
    }

    fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.store.get(key)?;
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Stored value is invalid, using default");
                None
            }
        }
    }

    /// Schema version of the stored document.
    pub fn version(&self) -> u32 {
        self.read(KEY_VERSION).unwrap_or(protocol::SCHEMA_VERSION)
    }

    pub fn settings(&self) -> AppSettings {
        self.read(KEY_SETTINGS).unwrap_or_default()
    }

    /// Shallow-merges `patch` into the stored settings and persists them.
    pub fn update_settings(&self, patch: SettingsPatch) -> Result<AppSettings> {
        let _guard = self.settings_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut settings = self.settings();
        settings.merge(patch);
        self.store
            .set(KEY_SETTINGS, serde_json::to_value(&settings)?)?;
        Ok(settings)
    }

    /// Stored groups and the last active group id.
    pub fn load_groups(&self) -> (Vec<TerminalGroup>, Option<GroupId>) {
        let groups = self.read(KEY_GROUPS).unwrap_or_default();
        let last_active = self.read::<Option<GroupId>>(KEY_LAST_ACTIVE_GROUP).flatten();
        (groups, last_active)
    }

    pub fn save_groups(&self, groups: &[TerminalGroup]) -> Result<()> {
        self.store.set(KEY_GROUPS, serde_json::to_value(groups)?)
    }

    pub fn set_last_active_group(&self, group_id: Option<&str>) -> Result<()> {
        self.store
            .set(KEY_LAST_ACTIVE_GROUP, serde_json::to_value(group_id)?)
    }

    /// Saves groups and the active group id as one mutation.
    pub fn save_state(&self, groups: &[TerminalGroup], last_active: Option<&str>) -> Result<()> {
        self.store.set_many(vec![
            (KEY_GROUPS, serde_json::to_value(groups)?),
            (KEY_LAST_ACTIVE_GROUP, serde_json::to_value(last_active)?),
        ])
    }

    /// Scans for install locations and stores the result in the settings.
    pub fn detect_install_paths(&self) -> Result<Vec<String>> {
        self.record_detected_paths(environment::detect_install_paths())
    }

    /// Stores `paths` as the detected install locations.
    pub fn record_detected_paths(&self, paths: Vec<String>) -> Result<Vec<String>> {
        self.update_settings(SettingsPatch {
            detected_paths: Some(paths.clone()),
            ..SettingsPatch::default()
        })?;
        Ok(paths)
    }

    /// Runs detection at startup unless a manual Claude path is configured.
    /// Failures are logged and never returned.
    pub fn run_startup_detection(&self) -> Vec<String> {
        let settings = self.settings();
        if settings.has_manual_claude_path() {
            tracing::debug!("Manual Claude path configured, skipping detection");
            return settings.detected_paths;
        }
        match self.detect_install_paths() {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to store detected install paths");
                Vec::new()
            }
        }
    }

    /// Location of the backing file, if any.
    pub fn store_path(&self) -> Option<PathBuf> {
        self.store.location()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{GridLayout, Theme};
    use tempfile::TempDir;

    fn group(id: &str) -> TerminalGroup {
        TerminalGroup {
            id: id.to_string(),
            name: id.to_string(),
            color: "#10b981".to_string(),
            layout: GridLayout::default(),
            terminals: Vec::new(),
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn test_memory_store_defaults() {
        let persistence = Persistence::in_memory();
        assert_eq!(persistence.version(), 1);
        assert_eq!(persistence.settings(), AppSettings::default());
        let (groups, last) = persistence.load_groups();
        assert!(groups.is_empty());
        assert!(last.is_none());
        assert!(persistence.store_path().is_none());
    }

    #[test]
    fn test_update_settings_merges_and_persists() {
        let persistence = Persistence::in_memory();
        let updated = persistence
            .update_settings(SettingsPatch {
                theme: Some(Theme::Light),
                ..SettingsPatch::default()
            })
            .unwrap();
        assert_eq!(updated.theme, Theme::Light);
        assert_eq!(updated.font_size, 14);
        assert_eq!(persistence.settings(), updated);
    }

    #[test]
    fn test_concurrent_updates_keep_every_patch() {
        let persistence = Persistence::in_memory();
        let rounds = 200u32;

        let scrollback = {
            let persistence = persistence.clone();
            std::thread::spawn(move || {
                for i in 1..=rounds {
                    persistence
                        .update_settings(SettingsPatch {
                            scrollback_lines: Some(1000 + i),
                            ..SettingsPatch::default()
                        })
                        .unwrap();
                }
            })
        };
        let claude = {
            let persistence = persistence.clone();
            std::thread::spawn(move || {
                for i in 1..=rounds {
                    persistence
                        .update_settings(SettingsPatch {
                            claude_path: Some(format!("/opt/claude-{}", i)),
                            ..SettingsPatch::default()
                        })
                        .unwrap();
                }
            })
        };
        scrollback.join().unwrap();
        claude.join().unwrap();

        let settings = persistence.settings();
        assert_eq!(settings.scrollback_lines, 1000 + rounds);
        assert_eq!(settings.claude_path.as_deref(), Some("/opt/claude-200"));
    }

    #[test]
    fn test_file_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data").join(STORE_FILE_NAME);

        {
            let persistence = Persistence::open_file(&path).unwrap();
            persistence
                .save_state(&[group("g1"), group("g2")], Some("g2"))
                .unwrap();
            persistence
                .update_settings(SettingsPatch {
                    font_size: Some(18),
                    ..SettingsPatch::default()
                })
                .unwrap();
        }

        let reopened = Persistence::open_file(&path).unwrap();
        let (groups, last) = reopened.load_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(last.as_deref(), Some("g2"));
        assert_eq!(reopened.settings().font_size, 18);
        assert_eq!(reopened.store_path(), Some(path.clone()));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_file_store_uses_camel_case_envelope() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(STORE_FILE_NAME);
        let persistence = Persistence::open_file(&path).unwrap();
        persistence.set_last_active_group(Some("g1")).unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["lastActiveGroupId"], "g1");
        assert!(raw["settings"]["detectedClaudePaths"].is_array());
    }

    #[test]
    fn test_invalid_file_is_reset() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(STORE_FILE_NAME);
        fs::write(&path, "{ not json").unwrap();

        let persistence = Persistence::open_file(&path).unwrap();
        assert_eq!(persistence.settings(), AppSettings::default());

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw.is_object());
    }

    #[test]
    fn test_missing_keys_are_filled() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(STORE_FILE_NAME);
        fs::write(&path, r#"{"groups": []}"#).unwrap();

        let persistence = Persistence::open_file(&path).unwrap();
        assert_eq!(persistence.version(), 1);
        assert_eq!(persistence.settings().scrollback_lines, 10_000);
    }

    #[test]
    fn test_invalid_settings_value_falls_back() {
        let store = Arc::new(MemoryStore::new());
        store.set(KEY_SETTINGS, Value::String("broken".into())).unwrap();
        let persistence = Persistence::new(store);
        assert_eq!(persistence.settings(), AppSettings::default());
    }

    #[test]
    fn test_record_detected_paths() {
        let persistence = Persistence::in_memory();
        let paths = vec!["C:\\Users\\u\\AppData\\Roaming\\npm".to_string()];
        assert_eq!(persistence.record_detected_paths(paths.clone()).unwrap(), paths);
        assert_eq!(persistence.settings().detected_paths, paths);
    }

    #[test]
    fn test_startup_detection_skipped_with_manual_path() {
        let persistence = Persistence::in_memory();
        persistence
            .update_settings(SettingsPatch {
                claude_path: Some("/opt/claude".to_string()),
                detected_paths: Some(vec!["/kept".to_string()]),
                ..SettingsPatch::default()
            })
            .unwrap();
        assert_eq!(persistence.run_startup_detection(), vec!["/kept".to_string()]);
    }
}
