//! Serialized access to the group graph with cascading teardown and
//! coalesced persistence.

use std::sync::Arc;

use protocol::{
    GridLayout, GroupId, GroupUpdate, Terminal, TerminalGroup, TerminalStatus, TerminalUpdate,
};
use rand::seq::SliceRandom;
use tokio::sync::{watch, Mutex, RwLock};

use super::state::{now_millis, DeckState};
use super::{SessionTerminator, StoreError};
use crate::persistence::{Persistence, PersistenceError};

/// Display colors assigned to new groups.
pub const GROUP_COLORS: &[&str] = &[
    "#3b82f6", "#10b981", "#f59e0b", "#ef4444", "#8b5cf6", "#ec4899", "#06b6d4", "#f97316",
];

fn random_color() -> String {
    GROUP_COLORS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(GROUP_COLORS[0])
        .to_string()
}

/// Options for a new terminal.
#[derive(Debug, Clone, Default)]
pub struct NewTerminal {
    pub label: String,
    pub cwd: String,
    pub shell: Option<String>,
}

/// Fallbacks applied to new terminals, taken from the settings.
#[derive(Debug, Clone)]
pub struct TerminalDefaults {
    pub cwd: String,
    pub shell: String,
}

impl Default for TerminalDefaults {
    fn default() -> Self {
        Self {
            cwd: String::new(),
            shell: "default".to_string(),
        }
    }
}

struct Inner {
    deck: DeckState,
    defaults: TerminalDefaults,
    revision: u64,
}

/// State handed to the persister.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    revision: u64,
    groups: Vec<TerminalGroup>,
    active_group_id: Option<GroupId>,
}

impl Snapshot {
    fn of(inner: &Inner) -> Self {
        Self {
            revision: inner.revision,
            groups: inner.deck.groups().to_vec(),
            active_group_id: inner.deck.active_group_id().map(str::to_string),
        }
    }
}

/// Writes snapshots in revision order, skipping stale ones.
struct SnapshotWriter {
    persistence: Persistence,
    written: Mutex<u64>,
}

impl SnapshotWriter {
    async fn write(&self, snapshot: Arc<Snapshot>) -> Result<bool, PersistenceError> {
        let mut written = self.written.lock().await;
        if snapshot.revision <= *written {
            return Ok(false);
        }

        let persistence = self.persistence.clone();
        let data = Arc::clone(&snapshot);
        tokio::task::spawn_blocking(move || {
            persistence.save_state(&data.groups, data.active_group_id.as_deref())
        })
        .await
        .map_err(|e| PersistenceError::Background(e.to_string()))??;

        *written = snapshot.revision;
        tracing::debug!(revision = snapshot.revision, "Persisted group state");
        Ok(true)
    }
}

struct PersistHandle {
    tx: watch::Sender<Arc<Snapshot>>,
    writer: Arc<SnapshotWriter>,
}

async fn run_persister(mut rx: watch::Receiver<Arc<Snapshot>>, writer: Arc<SnapshotWriter>) {
    while rx.changed().await.is_ok() {
        let snapshot = Arc::clone(&rx.borrow_and_update());
        if let Err(e) = writer.write(snapshot).await {
            tracing::error!(error = %e, "Failed to persist group state");
        }
    }
    tracing::debug!("Persister stopped");
}

/// Owner of the group/terminal graph.
///
/// All mutations go through one write lock, so structural edits and
/// status updates are applied one at a time. Every mutation that changes
/// persisted data schedules a save without waiting for it; saves coalesce
/// so that a burst of status updates produces one write with the latest
/// state.
#[derive(Clone)]
pub struct GroupStateStore {
    inner: Arc<RwLock<Inner>>,
    terminator: Arc<dyn SessionTerminator>,
    persist: Option<Arc<PersistHandle>>,
}

impl GroupStateStore {
    /// Creates an in-memory store.
    pub fn new(terminator: Arc<dyn SessionTerminator>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                deck: DeckState::new(),
                defaults: TerminalDefaults::default(),
                revision: 0,
            })),
            terminator,
            persist: None,
        }
    }

    /// Creates a store that saves through `persistence`. Must be called
    /// inside a Tokio runtime; the persister task runs until every clone
    /// of the store is dropped.
    pub fn with_persistence(terminator: Arc<dyn SessionTerminator>, persistence: Persistence) -> Self {
        let (tx, rx) = watch::channel(Arc::new(Snapshot::default()));
        let writer = Arc::new(SnapshotWriter {
            persistence,
            written: Mutex::new(0),
        });
        tokio::spawn(run_persister(rx, Arc::clone(&writer)));

        Self {
            persist: Some(Arc::new(PersistHandle { tx, writer })),
            ..Self::new(terminator)
        }
    }

    fn schedule_save(&self, inner: &mut Inner) {
        inner.revision += 1;
        if let Some(persist) = &self.persist {
            persist.tx.send_replace(Arc::new(Snapshot::of(inner)));
        }
    }

    /// Writes the current state and waits for it. Returns false when
    /// nothing newer than the last write exists or no persistence is set.
    pub async fn flush(&self) -> Result<bool, PersistenceError> {
        let Some(persist) = &self.persist else {
            return Ok(false);
        };
        let snapshot = Arc::new(Snapshot::of(&*self.inner.read().await));
        persist.writer.write(snapshot).await
    }

    /// Sets the fallbacks used by [`add_terminal`](Self::add_terminal).
    pub async fn set_terminal_defaults(&self, defaults: TerminalDefaults) {
        self.inner.write().await.defaults = defaults;
    }

    pub async fn add_group(&self, name: &str, layout: GridLayout) -> Result<TerminalGroup, StoreError> {
        let now = now_millis();
        let group = TerminalGroup {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            color: random_color(),
            layout,
            terminals: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.inner.write().await;
        inner.deck.insert_group(group.clone())?;
        self.schedule_save(&mut inner);

        tracing::info!(group_id = %group.id, name = %group.name, "Group added");
        Ok(group)
    }

    /// Requests termination of every terminal in the group, then removes it.
    pub async fn remove_group(&self, group_id: &str) -> Result<TerminalGroup, StoreError> {
        let mut inner = self.inner.write().await;
        let group = inner
            .deck
            .group(group_id)
            .ok_or_else(|| StoreError::GroupNotFound(group_id.to_string()))?;

        let mut killed = 0;
        for terminal in &group.terminals {
            if self.terminator.request_kill(&terminal.id) {
                killed += 1;
            }
        }

        let removed = inner.deck.remove_group(group_id)?;
        self.schedule_save(&mut inner);

        tracing::info!(
            group_id = %group_id,
            terminals = removed.terminals.len(),
            killed = killed,
            "Group removed"
        );
        Ok(removed)
    }

    pub async fn update_group(&self, group_id: &str, update: GroupUpdate) -> Result<TerminalGroup, StoreError> {
        let mut inner = self.inner.write().await;
        let group = inner.deck.update_group(group_id, &update, now_millis())?.clone();
        self.schedule_save(&mut inner);
        Ok(group)
    }

    /// Changes the layout. Terminals are never evicted; only pagination
    /// changes.
    pub async fn set_group_layout(&self, group_id: &str, layout: GridLayout) -> Result<TerminalGroup, StoreError> {
        self.update_group(
            group_id,
            GroupUpdate {
                layout: Some(layout),
                ..GroupUpdate::default()
            },
        )
        .await
    }

    /// Creates terminal metadata with status idle. No session is started.
    pub async fn add_terminal(&self, group_id: &str, options: NewTerminal) -> Result<Terminal, StoreError> {
        let mut inner = self.inner.write().await;

        let cwd = if options.cwd.is_empty() {
            inner.defaults.cwd.clone()
        } else {
            options.cwd
        };
        let shell = options
            .shell
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| inner.defaults.shell.clone());
        let terminal = Terminal {
            id: uuid::Uuid::new_v4().to_string(),
            label: options.label,
            cwd,
            shell,
            status: TerminalStatus::Idle,
            exit_code: None,
            created_at: now_millis(),
        };

        let terminal = inner
            .deck
            .push_terminal(group_id, terminal, now_millis())?
            .clone();
        self.schedule_save(&mut inner);

        tracing::debug!(group_id = %group_id, terminal_id = %terminal.id, "Terminal added");
        Ok(terminal)
    }

    /// Requests termination of the session, then removes the metadata.
    pub async fn remove_terminal(&self, group_id: &str, terminal_id: &str) -> Result<Terminal, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.deck.terminal(group_id, terminal_id).is_none() {
            return Err(match inner.deck.group(group_id) {
                None => StoreError::GroupNotFound(group_id.to_string()),
                Some(_) => StoreError::TerminalNotFound {
                    group_id: group_id.to_string(),
                    terminal_id: terminal_id.to_string(),
                },
            });
        }

        self.terminator.request_kill(terminal_id);
        let removed = inner.deck.remove_terminal(group_id, terminal_id, now_millis())?;
        self.schedule_save(&mut inner);

        tracing::debug!(group_id = %group_id, terminal_id = %terminal_id, "Terminal removed");
        Ok(removed)
    }

    pub async fn update_terminal(
        &self,
        group_id: &str,
        terminal_id: &str,
        update: TerminalUpdate,
    ) -> Result<Terminal, StoreError> {
        let mut inner = self.inner.write().await;
        let terminal = inner
            .deck
            .update_terminal(group_id, terminal_id, &update, now_millis())?
            .clone();
        self.schedule_save(&mut inner);
        Ok(terminal)
    }

    /// Marks a launched terminal running unless its status moved away from
    /// `expected` since the launch began. See [`DeckState::mark_running`].
    pub async fn mark_running(
        &self,
        group_id: &str,
        terminal_id: &str,
        expected: TerminalStatus,
        cwd: Option<String>,
    ) -> Result<Terminal, StoreError> {
        let mut inner = self.inner.write().await;
        let terminal = inner
            .deck
            .mark_running(group_id, terminal_id, expected, cwd, now_millis())?
            .clone();
        self.schedule_save(&mut inner);
        Ok(terminal)
    }

    /// Moves a terminal between groups in a single state transition.
    /// Returns false when nothing moved.
    pub async fn move_terminal(
        &self,
        from_group_id: &str,
        to_group_id: &str,
        terminal_id: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let moved = inner
            .deck
            .move_terminal(from_group_id, to_group_id, terminal_id, now_millis())?;
        if moved {
            self.schedule_save(&mut inner);
            tracing::debug!(
                terminal_id = %terminal_id,
                from = %from_group_id,
                to = %to_group_id,
                "Terminal moved"
            );
        }
        Ok(moved)
    }

    pub async fn set_active_group(&self, group_id: Option<&str>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.deck.set_active_group(group_id)?;
        self.schedule_save(&mut inner);
        Ok(())
    }

    pub async fn set_active_terminal(&self, terminal_id: Option<&str>) {
        self.inner.write().await.deck.set_active_terminal(terminal_id);
    }

    pub async fn activate_group_at(&self, index: usize) -> Option<GroupId> {
        let mut inner = self.inner.write().await;
        let id = inner.deck.activate_group_at(index)?.id.clone();
        self.schedule_save(&mut inner);
        Some(id)
    }

    pub async fn next_group(&self) -> Option<GroupId> {
        self.cycle_group(1).await
    }

    pub async fn prev_group(&self) -> Option<GroupId> {
        self.cycle_group(-1).await
    }

    async fn cycle_group(&self, step: isize) -> Option<GroupId> {
        let mut inner = self.inner.write().await;
        let id = inner.deck.cycle_group(step)?.id.clone();
        self.schedule_save(&mut inner);
        Some(id)
    }

    /// Status-event sink: updates whichever group owns the terminal.
    pub async fn apply_status(
        &self,
        terminal_id: &str,
        status: TerminalStatus,
        exit_code: Option<i32>,
    ) -> Option<GroupId> {
        let mut inner = self.inner.write().await;
        let owner = inner
            .deck
            .apply_status(terminal_id, status, exit_code, now_millis())?;
        self.schedule_save(&mut inner);
        Some(owner)
    }

    /// Replaces the graph with restored data without scheduling a save.
    pub async fn load(&self, groups: Vec<TerminalGroup>, last_active: Option<GroupId>) {
        let mut inner = self.inner.write().await;
        inner.deck.restore(groups, last_active);
        tracing::info!(
            groups = inner.deck.groups().len(),
            active = ?inner.deck.active_group_id(),
            "Group state loaded"
        );
    }

    /// Replaces the graph with `groups` as sent by the UI and saves it.
    pub async fn replace(
        &self,
        groups: Vec<TerminalGroup>,
        last_active: Option<GroupId>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.deck.replace(groups, last_active)?;
        self.schedule_save(&mut inner);
        Ok(())
    }

    pub async fn groups(&self) -> Vec<TerminalGroup> {
        self.inner.read().await.deck.groups().to_vec()
    }

    pub async fn group(&self, group_id: &str) -> Option<TerminalGroup> {
        self.inner.read().await.deck.group(group_id).cloned()
    }

    pub async fn active_group(&self) -> Option<TerminalGroup> {
        self.inner.read().await.deck.active_group().cloned()
    }

    pub async fn active_group_id(&self) -> Option<GroupId> {
        self.inner.read().await.deck.active_group_id().map(str::to_string)
    }

    pub async fn active_terminal_id(&self) -> Option<String> {
        self.inner.read().await.deck.active_terminal_id().map(str::to_string)
    }

    pub async fn terminal(&self, group_id: &str, terminal_id: &str) -> Option<Terminal> {
        self.inner.read().await.deck.terminal(group_id, terminal_id).cloned()
    }

    pub async fn find_terminal_group(&self, terminal_id: &str) -> Option<GroupId> {
        self.inner
            .read()
            .await
            .deck
            .find_terminal_group(terminal_id)
            .map(|g| g.id.clone())
    }

    pub async fn check_invariants(&self) -> Result<(), StoreError> {
        self.inner.read().await.deck.check_invariants()
    }
}
