//! Per-session resize coordinator.
//!
//! The coordinator is an actor owning an emulator, a [`ResizeGate`] and the
//! single timer that drives a resize cycle:
//!
//! ```text
//! Idle --container change--> Debounce --quiet period--> Settle --delay--> Idle
//!            ^                  |  ^                       |
//!            |                  +--+ change restarts       | change re-enters
//!            +-----------------------------------------------+ Debounce
//! ```
//!
//! When the debounce period ends the emulator is resized to the fitted
//! dimensions and, if they differ from the last ones sent, the backing
//! process is notified. When the settle delay ends, queued output is written
//! in arrival order, the visible rows are repainted and the gate opens.
//! Disposal cancels the timer and discards the queue.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use protocol::TerminalId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};

use super::gate::{fit_dimensions, ContainerSize, DataAction, ResizeGate, ResizeStats};
use crate::config::ResizeConfig;
use crate::emulator::Emulator;

/// Receiver of dimension changes for a backing process.
pub trait DimensionSink: Send + Sync {
    fn resize(&self, terminal_id: &str, cols: u16, rows: u16);
}

impl DimensionSink for crate::session::SessionSupervisor {
    fn resize(&self, terminal_id: &str, cols: u16, rows: u16) {
        crate::session::SessionSupervisor::resize(self, terminal_id, cols, rows)
    }
}

/// Timing and capacity of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeTiming {
    pub debounce: Duration,
    pub settle: Duration,
    pub pending_capacity: usize,
}

impl Default for ResizeTiming {
    fn default() -> Self {
        Self::from(&ResizeConfig::default())
    }
}

impl From<&ResizeConfig> for ResizeTiming {
    fn from(config: &ResizeConfig) -> Self {
        Self {
            debounce: config.debounce(),
            settle: config.settle(),
            pending_capacity: config.pending_capacity,
        }
    }
}

enum Command {
    Ready(Option<(u16, u16)>),
    Container(ContainerSize),
    Data(Bytes),
    Stats(oneshot::Sender<ResizeStats>),
    Dispose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Debounce,
    Settle,
}

/// Handle to a running coordinator. Dropping every handle disposes it.
#[derive(Clone)]
pub struct ResizeCoordinator {
    terminal_id: TerminalId,
    tx: mpsc::UnboundedSender<Command>,
}

impl ResizeCoordinator {
    /// Starts the coordinator task for one session.
    pub fn spawn<E>(
        terminal_id: impl Into<TerminalId>,
        emulator: E,
        sink: Arc<dyn DimensionSink>,
        timing: ResizeTiming,
    ) -> (Self, JoinHandle<()>)
    where
        E: Emulator + 'static,
    {
        let terminal_id = terminal_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            terminal_id: terminal_id.clone(),
            emulator,
            sink,
            timing,
            gate: ResizeGate::new(timing.pending_capacity),
            phase: Phase::Idle,
            timer: None,
        };
        let task = tokio::spawn(actor.run(rx));
        (Self { terminal_id, tx }, task)
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    /// Signals that the initial spawn finished, with the size it used
    /// (`None` if it failed). Earlier measurements may start a cycle now.
    pub fn mark_ready(&self, spawned: Option<(u16, u16)>) {
        self.send(Command::Ready(spawned));
    }

    /// Reports a new container measurement.
    pub fn container_resized(&self, size: ContainerSize) {
        self.send(Command::Container(size));
    }

    /// Feeds output of the backing process.
    pub fn push_data(&self, data: impl Into<Bytes>) {
        self.send(Command::Data(data.into()));
    }

    /// Current counters, or `None` once disposed.
    pub async fn stats(&self) -> Option<ResizeStats> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Command::Stats(tx)).ok()?;
        rx.await.ok()
    }

    /// Cancels timers, discards queued output and disposes the emulator.
    pub fn dispose(&self) {
        self.send(Command::Dispose);
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            tracing::trace!(terminal_id = %self.terminal_id, "Coordinator already disposed");
        }
    }
}

struct Actor<E> {
    terminal_id: TerminalId,
    emulator: E,
    sink: Arc<dyn DimensionSink>,
    timing: ResizeTiming,
    gate: ResizeGate,
    phase: Phase,
    timer: Option<Pin<Box<Sleep>>>,
}

impl<E: Emulator> Actor<E> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Ready(spawned)) => {
                        if self.gate.mark_ready(spawned) {
                            self.start_debounce();
                        }
                    }
                    Some(Command::Container(size)) => {
                        if self.gate.on_container(size) {
                            self.start_debounce();
                        }
                    }
                    Some(Command::Data(chunk)) => self.on_data(chunk),
                    Some(Command::Stats(reply)) => {
                        let _ = reply.send(self.gate.stats());
                    }
                    Some(Command::Dispose) | None => {
                        self.dispose();
                        break;
                    }
                },
                _ = wait_timer(&mut self.timer) => self.on_timer(),
            }
        }
    }

    fn start_debounce(&mut self) {
        self.phase = Phase::Debounce;
        self.timer = Some(Box::pin(sleep(self.timing.debounce)));
    }

    fn on_data(&mut self, chunk: Bytes) {
        match self.gate.on_data(chunk) {
            DataAction::Deliver(chunk) => self.emulator.write(&chunk),
            DataAction::Dropped { first_in_cycle: true } => tracing::warn!(
                terminal_id = %self.terminal_id,
                capacity = self.timing.pending_capacity,
                "Resize queue full, dropping output"
            ),
            DataAction::Queued | DataAction::Dropped { .. } | DataAction::Discarded => {}
        }
    }

    fn on_timer(&mut self) {
        match self.phase {
            Phase::Debounce => {
                self.apply_dimensions();
                self.phase = Phase::Settle;
                self.timer = Some(Box::pin(sleep(self.timing.settle)));
            }
            Phase::Settle => {
                self.flush();
                self.phase = Phase::Idle;
                self.timer = None;
            }
            Phase::Idle => self.timer = None,
        }
    }

    fn apply_dimensions(&mut self) {
        let Some(container) = self.gate.last_container() else {
            return;
        };
        let cell = self.emulator.cell_size();
        let Some((cols, rows)) = fit_dimensions(container, cell.width, cell.height) else {
            tracing::debug!(terminal_id = %self.terminal_id, "Cell size unavailable, skipping fit");
            return;
        };

        if (self.emulator.cols(), self.emulator.rows()) != (cols, rows) {
            self.emulator.resize(cols, rows);
        }
        if self.gate.on_dimensions(cols, rows) {
            tracing::debug!(terminal_id = %self.terminal_id, cols = cols, rows = rows, "Notifying new dimensions");
            self.sink.resize(&self.terminal_id, cols, rows);
        }
    }

    fn flush(&mut self) {
        let queued = self.gate.finish();
        let dropped = self.gate.stats().dropped_chunks;
        if !queued.is_empty() {
            tracing::debug!(terminal_id = %self.terminal_id, chunks = queued.len(), dropped_total = dropped, "Flushing queued output");
        }
        for chunk in queued {
            self.emulator.write(&chunk);
        }
        let last_row = self.emulator.rows().saturating_sub(1);
        self.emulator.refresh(0, last_row);
    }

    fn dispose(&mut self) {
        self.timer = None;
        let discarded = self.gate.dispose();
        if discarded > 0 {
            tracing::debug!(terminal_id = %self.terminal_id, chunks = discarded, "Discarded queued output on dispose");
        }
        self.emulator.dispose();
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(deadline) => deadline.as_mut().await,
        None => std::future::pending().await,
    }
}
