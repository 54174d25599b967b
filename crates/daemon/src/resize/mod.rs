//! Resize coordination between an emulator and its backing process.
//!
//! [`gate`] holds the synchronous state machine; [`coordinator`] drives it
//! with debounce and settle timers on a per-session task.

pub mod coordinator;
pub mod gate;

pub use coordinator::{DimensionSink, ResizeCoordinator, ResizeTiming};
pub use gate::{fit_dimensions, ContainerSize, DataAction, ResizeGate, ResizeStats};
