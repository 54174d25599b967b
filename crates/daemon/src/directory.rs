//! Directory-selection capability.
//!
//! Choosing a directory is a dialog owned by the UI. The daemon has no
//! display, so its picker answers `None`, the same answer a cancelled
//! dialog gives.

use std::path::PathBuf;

/// Asks the user for a directory.
pub trait DirectoryPicker: Send + Sync {
    /// The chosen directory, or `None` when nothing was chosen.
    fn select_directory(&self) -> Option<PathBuf>;
}

/// Picker for runs without a display.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessDirectoryPicker;

impl DirectoryPicker for HeadlessDirectoryPicker {
    fn select_directory(&self) -> Option<PathBuf> {
        tracing::debug!("Directory selection requested without a display");
        None
    }
}

/// Picker that always answers with a fixed directory.
#[derive(Debug, Clone)]
pub struct FixedDirectoryPicker(pub PathBuf);

impl DirectoryPicker for FixedDirectoryPicker {
    fn select_directory(&self) -> Option<PathBuf> {
        Some(self.0.clone())
    }
}
