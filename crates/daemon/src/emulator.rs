//! Terminal emulator capability.
//!
//! Rendering and escape-sequence handling belong to an external emulator.
//! The core only needs the operations of [`Emulator`]. [`HeadlessEmulator`]
//! implements them without rendering, keeping the received output so that
//! ordering can be inspected.

use std::sync::{Arc, Mutex};

/// Size of one character cell in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellSize {
    pub width: f64,
    pub height: f64,
}

/// Operations the core performs on a terminal emulator.
pub trait Emulator: Send {
    /// Renders output bytes.
    fn write(&mut self, data: &[u8]);

    /// Changes the emulator grid.
    fn resize(&mut self, cols: u16, rows: u16);

    /// Repaints rows `start..=end`.
    fn refresh(&mut self, start_row: u16, end_row: u16);

    fn cols(&self) -> u16;

    fn rows(&self) -> u16;

    /// Pixel size of a cell, used to fit the grid into its container.
    fn cell_size(&self) -> CellSize;

    fn get_selection(&self) -> String;

    fn clear(&mut self);

    fn select_all(&mut self);

    /// Releases the emulator. No calls are made afterwards.
    fn dispose(&mut self);
}

/// Operation recorded by [`HeadlessEmulator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmulatorOp {
    Write(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Refresh { start_row: u16, end_row: u16 },
    Clear,
    SelectAll,
    Dispose,
}

#[derive(Debug, Default)]
struct HeadlessState {
    cols: u16,
    rows: u16,
    output: Vec<u8>,
    selected: bool,
    disposed: bool,
    ops: Vec<EmulatorOp>,
}

/// Emulator without a display.
pub struct HeadlessEmulator {
    cell: CellSize,
    state: Arc<Mutex<HeadlessState>>,
}

/// Read access to a [`HeadlessEmulator`] that has been moved elsewhere.
#[derive(Clone)]
pub struct HeadlessHandle {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessEmulator {
    pub fn new(cols: u16, rows: u16, cell: CellSize) -> Self {
        Self {
            cell,
            state: Arc::new(Mutex::new(HeadlessState {
                cols,
                rows,
                ..HeadlessState::default()
            })),
        }
    }

    pub fn handle(&self) -> HeadlessHandle {
        HeadlessHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HeadlessState) -> R) -> R {
        f(&mut self.state.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl HeadlessHandle {
    fn with_state<R>(&self, f: impl FnOnce(&HeadlessState) -> R) -> R {
        f(&self.state.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Everything written so far, in order.
    pub fn output(&self) -> Vec<u8> {
        self.with_state(|s| s.output.clone())
    }

    pub fn size(&self) -> (u16, u16) {
        self.with_state(|s| (s.cols, s.rows))
    }

    pub fn ops(&self) -> Vec<EmulatorOp> {
        self.with_state(|s| s.ops.clone())
    }

    pub fn is_disposed(&self) -> bool {
        self.with_state(|s| s.disposed)
    }
}

impl Emulator for HeadlessEmulator {
    fn write(&mut self, data: &[u8]) {
        self.with_state(|s| {
            s.output.extend_from_slice(data);
            s.ops.push(EmulatorOp::Write(data.to_vec()));
        });
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.with_state(|s| {
            s.cols = cols;
            s.rows = rows;
            s.ops.push(EmulatorOp::Resize { cols, rows });
        });
    }

    fn refresh(&mut self, start_row: u16, end_row: u16) {
        self.with_state(|s| s.ops.push(EmulatorOp::Refresh { start_row, end_row }));
    }

    fn cols(&self) -> u16 {
        self.with_state(|s| s.cols)
    }

    fn rows(&self) -> u16 {
        self.with_state(|s| s.rows)
    }

    fn cell_size(&self) -> CellSize {
        self.cell
    }

    fn get_selection(&self) -> String {
        self.with_state(|s| {
            if s.selected {
                String::from_utf8_lossy(&s.output).into_owned()
            } else {
                String::new()
            }
        })
    }

    fn clear(&mut self) {
        self.with_state(|s| {
            s.output.clear();
            s.selected = false;
            s.ops.push(EmulatorOp::Clear);
        });
    }

    fn select_all(&mut self) {
        self.with_state(|s| {
            s.selected = true;
            s.ops.push(EmulatorOp::SelectAll);
        });
    }

    fn dispose(&mut self) {
        self.with_state(|s| {
            s.disposed = true;
            s.ops.push(EmulatorOp::Dispose);
        });
    }
}
