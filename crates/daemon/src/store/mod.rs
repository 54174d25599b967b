//! Group and terminal metadata store.
//!
//! [`DeckState`] holds the graph and enforces placement rules;
//! [`GroupStateStore`] serializes access to it, cascades teardown to the
//! session layer and schedules saves.

pub mod group_store;
pub mod state;

use thiserror::Error;

pub use group_store::{GroupStateStore, NewTerminal, TerminalDefaults, GROUP_COLORS};
pub use state::DeckState;

/// Errors from store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Terminal {terminal_id} not found in group {group_id}")]
    TerminalNotFound {
        group_id: String,
        terminal_id: String,
    },

    #[error("Invalid layout {rows}x{cols}")]
    InvalidLayout { rows: u16, cols: u16 },

    #[error("Terminal {0} is owned by more than one group")]
    OwnershipViolation(String),

    #[error("Group id {0} is used more than once")]
    DuplicateGroup(String),
}

/// Terminates the session behind a terminal id without waiting for it.
pub trait SessionTerminator: Send + Sync {
    /// Returns true when a session was registered.
    fn request_kill(&self, terminal_id: &str) -> bool;
}

impl SessionTerminator for crate::session::SessionSupervisor {
    fn request_kill(&self, terminal_id: &str) -> bool {
        crate::session::SessionSupervisor::request_kill(self, terminal_id)
    }
}
