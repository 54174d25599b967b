//! Resize gate: the timer-free core of resize coordination.
//!
//! The gate decides what happens to each output chunk and each container
//! measurement. While a resize is in flight, output is queued in arrival
//! order and handed back in one piece when the cycle finishes. The queue is
//! bounded; chunks beyond capacity are dropped and counted.

use std::collections::VecDeque;

use bytes::Bytes;

/// Measured pixel size of the emulator's container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerSize {
    pub width: f64,
    pub height: f64,
}

impl ContainerSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Zero or negative sizes come from hidden containers.
    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }
}

/// Counters describing the gate's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResizeStats {
    /// Resize cycles completed.
    pub cycles: u64,
    /// Dimension changes forwarded to the backing process.
    pub notifications: u64,
    /// Cycles whose dimensions matched the last forwarded size.
    pub deduplicated: u64,
    /// Chunks queued while resizing.
    pub queued_chunks: u64,
    /// Chunks dropped because the queue was full.
    pub dropped_chunks: u64,
}

/// What to do with an incoming output chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataAction {
    /// Write the chunk to the emulator now.
    Deliver(Bytes),
    /// The chunk was queued behind an in-flight resize.
    Queued,
    /// The queue was full. `first_in_cycle` is set for the first loss of a cycle.
    Dropped { first_in_cycle: bool },
    /// The gate was disposed.
    Discarded,
}

/// Per-session resize state.
#[derive(Debug)]
pub struct ResizeGate {
    ready: bool,
    resizing: bool,
    disposed: bool,
    last_sent: Option<(u16, u16)>,
    last_container: Option<ContainerSize>,
    pending: VecDeque<Bytes>,
    capacity: usize,
    dropped_in_cycle: u64,
    stats: ResizeStats,
}

impl ResizeGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            ready: false,
            resizing: false,
            disposed: false,
            last_sent: None,
            last_container: None,
            pending: VecDeque::with_capacity(capacity.min(128)),
            capacity: capacity.max(1),
            dropped_in_cycle: 0,
            stats: ResizeStats::default(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_resizing(&self) -> bool {
        self.resizing
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn last_sent(&self) -> Option<(u16, u16)> {
        self.last_sent
    }

    pub fn last_container(&self) -> Option<ContainerSize> {
        self.last_container
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> ResizeStats {
        self.stats
    }

    /// Marks the initial spawn as finished with the size the process was
    /// started with. Returns true when a remembered measurement should start
    /// a resize cycle.
    pub fn mark_ready(&mut self, spawned: Option<(u16, u16)>) -> bool {
        if self.disposed || self.ready {
            return false;
        }
        self.ready = true;
        if spawned.is_some() {
            self.last_sent = spawned;
        }
        if self.last_container.is_some() {
            self.resizing = true;
            true
        } else {
            false
        }
    }

    /// Records a container measurement. Returns true when the debounce
    /// timer should be (re)started.
    pub fn on_container(&mut self, size: ContainerSize) -> bool {
        if self.disposed || size.is_empty() || self.last_container == Some(size) {
            return false;
        }
        self.last_container = Some(size);
        if !self.ready {
            return false;
        }
        self.resizing = true;
        true
    }

    /// Routes an output chunk.
    pub fn on_data(&mut self, chunk: Bytes) -> DataAction {
        if self.disposed {
            return DataAction::Discarded;
        }
        if !self.resizing {
            return DataAction::Deliver(chunk);
        }
        if self.pending.len() >= self.capacity {
            self.dropped_in_cycle += 1;
            self.stats.dropped_chunks += 1;
            return DataAction::Dropped {
                first_in_cycle: self.dropped_in_cycle == 1,
            };
        }
        self.pending.push_back(chunk);
        self.stats.queued_chunks += 1;
        DataAction::Queued
    }

    /// Called when the debounce period ends with the freshly fitted size.
    /// Returns true when the backing process must be told about it.
    pub fn on_dimensions(&mut self, cols: u16, rows: u16) -> bool {
        if self.disposed || cols == 0 || rows == 0 {
            return false;
        }
        if self.last_sent == Some((cols, rows)) {
            self.stats.deduplicated += 1;
            return false;
        }
        self.last_sent = Some((cols, rows));
        self.stats.notifications += 1;
        true
    }

    /// Ends the cycle: opens the gate and returns the queued chunks in
    /// arrival order.
    pub fn finish(&mut self) -> Vec<Bytes> {
        if self.disposed {
            return Vec::new();
        }
        self.resizing = false;
        self.dropped_in_cycle = 0;
        self.stats.cycles += 1;
        self.pending.drain(..).collect()
    }

    /// Chunks dropped in the current cycle.
    pub fn dropped_in_cycle(&self) -> u64 {
        self.dropped_in_cycle
    }

    /// Discards queued output. The gate accepts nothing afterwards.
    pub fn dispose(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        self.disposed = true;
        self.resizing = false;
        self.ready = false;
        discarded
    }
}

/// Number of whole cells that fit into `container`, at least 1x1.
/// Returns `None` when the cell size is unusable.
pub fn fit_dimensions(container: ContainerSize, cell_width: f64, cell_height: f64) -> Option<(u16, u16)> {
    if !(cell_width > 0.0 && cell_height > 0.0) || container.is_empty() {
        return None;
    }
    let cols = (container.width / cell_width).floor().clamp(1.0, u16::MAX as f64) as u16;
    let rows = (container.height / cell_height).floor().clamp(1.0, u16::MAX as f64) as u16;
    Some((cols, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_gate(capacity: usize) -> ResizeGate {
        let mut gate = ResizeGate::new(capacity);
        assert!(!gate.mark_ready(Some((80, 24))));
        gate
    }

    #[test]
    fn test_data_passes_through_when_idle() {
        let mut gate = ready_gate(4);
        assert_eq!(
            gate.on_data(Bytes::from_static(b"x")),
            DataAction::Deliver(Bytes::from_static(b"x"))
        );
    }

    #[test]
    fn test_measurements_before_ready_are_remembered() {
        let mut gate = ResizeGate::new(4);
        assert!(!gate.on_container(ContainerSize::new(800.0, 400.0)));
        assert!(!gate.is_resizing());
        assert!(gate.mark_ready(Some((80, 24))));
        assert!(gate.is_resizing());
        assert!(!gate.mark_ready(Some((80, 24))));
    }

    #[test]
    fn test_zero_and_duplicate_measurements_ignored() {
        let mut gate = ready_gate(4);
        assert!(!gate.on_container(ContainerSize::new(0.0, 300.0)));
        assert!(gate.on_container(ContainerSize::new(640.0, 480.0)));
        gate.finish();
        assert!(!gate.on_container(ContainerSize::new(640.0, 480.0)));
        assert!(gate.on_container(ContainerSize::new(641.0, 480.0)));
    }

    #[test]
    fn test_queued_data_flushes_in_arrival_order() {
        let mut gate = ready_gate(10);
        gate.on_container(ContainerSize::new(640.0, 480.0));
        for chunk in [&b"one"[..], b"two", b"three"] {
            assert_eq!(gate.on_data(Bytes::copy_from_slice(chunk)), DataAction::Queued);
        }
        let flushed = gate.finish();
        assert_eq!(
            flushed,
            vec![
                Bytes::from_static(b"one"),
                Bytes::from_static(b"two"),
                Bytes::from_static(b"three")
            ]
        );
        assert!(!gate.is_resizing());
        assert_eq!(
            gate.on_data(Bytes::from_static(b"four")),
            DataAction::Deliver(Bytes::from_static(b"four"))
        );
    }

    #[test]
    fn test_overflow_drops_newest_and_counts() {
        let mut gate = ready_gate(2);
        gate.on_container(ContainerSize::new(640.0, 480.0));
        assert_eq!(gate.on_data(Bytes::from_static(b"a")), DataAction::Queued);
        assert_eq!(gate.on_data(Bytes::from_static(b"b")), DataAction::Queued);
        assert_eq!(
            gate.on_data(Bytes::from_static(b"c")),
            DataAction::Dropped { first_in_cycle: true }
        );
        assert_eq!(
            gate.on_data(Bytes::from_static(b"d")),
            DataAction::Dropped { first_in_cycle: false }
        );
        assert_eq!(gate.stats().dropped_chunks, 2);
        assert_eq!(gate.finish().len(), 2);
        assert_eq!(gate.dropped_in_cycle(), 0);
    }

    #[test]
    fn test_dimension_dedup() {
        let mut gate = ready_gate(4);
        assert!(!gate.on_dimensions(80, 24));
        assert!(gate.on_dimensions(120, 30));
        assert!(!gate.on_dimensions(120, 30));
        assert_eq!(gate.last_sent(), Some((120, 30)));
        let stats = gate.stats();
        assert_eq!(stats.notifications, 1);
        assert_eq!(stats.deduplicated, 2);
    }

    #[test]
    fn test_dispose_discards_queue() {
        let mut gate = ready_gate(4);
        gate.on_container(ContainerSize::new(640.0, 480.0));
        gate.on_data(Bytes::from_static(b"a"));
        assert_eq!(gate.dispose(), 1);
        assert!(gate.finish().is_empty());
        assert_eq!(gate.on_data(Bytes::from_static(b"b")), DataAction::Discarded);
        assert!(!gate.on_container(ContainerSize::new(1.0, 1.0)));
    }

    #[test]
    fn test_fit_dimensions() {
        let container = ContainerSize::new(965.0, 490.0);
        assert_eq!(fit_dimensions(container, 8.0, 16.0), Some((120, 30)));
        assert_eq!(
            fit_dimensions(ContainerSize::new(3.0, 3.0), 8.0, 16.0),
            Some((1, 1))
        );
        assert_eq!(fit_dimensions(container, 0.0, 16.0), None);
        assert_eq!(fit_dimensions(ContainerSize::new(0.0, 10.0), 8.0, 16.0), None);
    }
}
