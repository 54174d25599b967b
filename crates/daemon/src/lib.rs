//! # TermDeck Daemon Library
//!
//! Backend of a multi-terminal workspace. Terminals are organized into
//! named groups, each rendered as a grid; every terminal can be backed by
//! a shell process running under a pseudo-terminal.
//!
//! ## Overview
//!
//! - **Session Supervision**: spawn, feed, resize and terminate backing
//!   processes keyed by terminal id, with a search-path computed per session
//! - **Group Store**: the group/terminal graph with single ownership of
//!   every terminal, cascading teardown and coalesced persistence
//! - **Persistence**: a key-value document holding groups, the active
//!   group and application settings
//! - **Resize Coordination**: output buffering while a terminal's grid
//!   size changes
//! - **Command Surface**: newline-delimited JSON over a Unix socket
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Deck Orchestrator                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐  status   ┌──────────────────────────┐ │
//! │  │     Session      │ ────────► │    Group State Store     │ │
//! │  │    Supervisor    │ ◄──────── │   (single RwLock owner)  │ │
//! │  └──────────────────┘   kill    └────────────┬─────────────┘ │
//! │           │ events                           │ snapshots     │
//! │  ┌────────▼─────────┐             ┌──────────▼─────────────┐ │
//! │  │  Command Surface │             │      Persistence       │ │
//! │  │   (Unix socket)  │             │  (JSON key-value file) │ │
//! │  └──────────────────┘             └────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use termdeck::{Config, DeckOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let orchestrator = Arc::new(DeckOrchestrator::new(config)?);
//!     orchestrator.start().await?;
//!
//!     // Serve until a client sends Stop.
//!     orchestrator.shutdown_token().cancelled().await;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY spawning and the session supervisor
//! - [`environment`]: Search-path computation and install detection
//! - [`store`]: Group and terminal metadata
//! - [`persistence`]: Durable key-value storage
//! - [`resize`]: Resize coordination
//! - [`emulator`]: Screen-side helpers for the resize coordinator
//! - [`directory`]: Directory selection capability
//! - [`ipc`]: Command surface over a Unix socket
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod directory;
pub mod emulator;
pub mod environment;
pub mod ipc;
pub mod orchestrator;
pub mod persistence;
pub mod resize;
pub mod session;
pub mod store;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{SessionError, SessionSupervisor};

// Re-export store types for convenience
pub use store::{GroupStateStore, NewTerminal, SessionTerminator, StoreError};

// Re-export persistence types for convenience
pub use persistence::{KeyValueStore, Persistence, PersistenceError};

// Re-export resize types for convenience
pub use resize::{ResizeCoordinator, ResizeGate, ResizeTiming};

// Re-export orchestrator types for convenience
pub use orchestrator::{DeckOrchestrator, OrchestratorState};
