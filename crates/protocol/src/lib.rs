//! # TermDeck Protocol Library
//!
//! Shared types for the TermDeck terminal manager.
//!
//! ## Overview
//!
//! - **Data model**: groups, terminals, grid layouts and application settings,
//!   serialized in the shape of the persisted envelope
//! - **Session payloads**: create/kill results and the data/status events
//!   pushed by the session supervisor
//!
//! This crate performs no I/O.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{GridLayout, CreateSessionRequest};
//!
//! let layout = GridLayout::new(2, 2).unwrap();
//! assert_eq!(layout.page_count(5), 2);
//!
//! let request = CreateSessionRequest::new("terminal-1").with_size(120, 30);
//! assert_eq!(request.cols, 120);
//! ```
//!
//! ## Modules
//!
//! - [`model`]: persisted data model
//! - [`messages`]: session payloads
//! - [`error`]: error types

pub mod error;
pub mod messages;
pub mod model;

pub use error::{ProtocolError, Result};
pub use messages::{
    CreateSessionRequest, CreateSessionResult, KillResult, SessionEvent, SessionSummary,
    DEFAULT_COLS, DEFAULT_ROWS,
};
pub use model::{
    default_shortcuts, AppSettings, GridLayout, GroupId, GroupUpdate, PersistedData,
    SearchPathOverrides, SettingsPatch, Terminal, TerminalGroup, TerminalId, TerminalStatus,
    TerminalUpdate, Theme, WindowBounds, PRESET_LAYOUTS, SCHEMA_VERSION,
};
