//! Session management module.
//!
//! This module provides PTY spawning and the supervisor that owns the
//! registry of live sessions, one per terminal id.

pub mod events;
pub mod pty;
pub mod supervisor;

pub use events::{EventBus, SubscriberId};
pub use pty::{BackingProcess, ProcessIo, SessionError, SpawnSpec};
pub use supervisor::{resolve_shell, SessionSupervisor};
