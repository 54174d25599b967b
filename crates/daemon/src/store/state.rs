//! The group/terminal graph and its placement rules.
//!
//! `DeckState` is plain data with synchronous mutators. Every mutator
//! either completes or leaves the graph untouched, so a terminal id is
//! owned by exactly one group after any call returns.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use protocol::{
    GridLayout, GroupId, GroupUpdate, Terminal, TerminalGroup, TerminalId, TerminalStatus,
    TerminalUpdate,
};

use super::StoreError;

/// Current time in Unix epoch milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn check_layout(layout: &GridLayout) -> Result<(), StoreError> {
    layout.validate().map_err(|_| StoreError::InvalidLayout {
        rows: layout.rows,
        cols: layout.cols,
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeckState {
    groups: Vec<TerminalGroup>,
    active_group_id: Option<GroupId>,
    active_terminal_id: Option<TerminalId>,
}

impl DeckState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn groups(&self) -> &[TerminalGroup] {
        &self.groups
    }

    pub fn active_group_id(&self) -> Option<&str> {
        self.active_group_id.as_deref()
    }

    pub fn active_terminal_id(&self) -> Option<&str> {
        self.active_terminal_id.as_deref()
    }

    pub fn group(&self, group_id: &str) -> Option<&TerminalGroup> {
        self.groups.iter().find(|g| g.id == group_id)
    }

    fn group_index(&self, group_id: &str) -> Result<usize, StoreError> {
        self.groups
            .iter()
            .position(|g| g.id == group_id)
            .ok_or_else(|| StoreError::GroupNotFound(group_id.to_string()))
    }

    pub fn active_group(&self) -> Option<&TerminalGroup> {
        self.active_group_id.as_deref().and_then(|id| self.group(id))
    }

    pub fn terminal(&self, group_id: &str, terminal_id: &str) -> Option<&Terminal> {
        self.group(group_id).and_then(|g| g.terminal(terminal_id))
    }

    /// The group that owns `terminal_id`.
    pub fn find_terminal_group(&self, terminal_id: &str) -> Option<&TerminalGroup> {
        self.groups.iter().find(|g| g.contains(terminal_id))
    }

    /// Appends a group and makes it active.
    pub fn insert_group(&mut self, group: TerminalGroup) -> Result<(), StoreError> {
        check_layout(&group.layout)?;
        if let Some(t) = group.terminals.iter().find(|t| self.find_terminal_group(&t.id).is_some()) {
            return Err(StoreError::OwnershipViolation(t.id.clone()));
        }
        self.active_group_id = Some(group.id.clone());
        self.groups.push(group);
        Ok(())
    }

    /// Removes a group. When it was active, activation falls to the first
    /// remaining group.
    pub fn remove_group(&mut self, group_id: &str) -> Result<TerminalGroup, StoreError> {
        let index = self.group_index(group_id)?;
        let removed = self.groups.remove(index);

        if self.active_group_id.as_deref() == Some(group_id) {
            self.active_group_id = self.groups.first().map(|g| g.id.clone());
        }
        if let Some(active) = &self.active_terminal_id {
            if removed.contains(active) {
                self.active_terminal_id = None;
            }
        }
        Ok(removed)
    }

    /// Shallow-merges `update` into the group.
    pub fn update_group(
        &mut self,
        group_id: &str,
        update: &GroupUpdate,
        now: u64,
    ) -> Result<&TerminalGroup, StoreError> {
        if let Some(layout) = &update.layout {
            check_layout(layout)?;
        }
        let index = self.group_index(group_id)?;
        let group = &mut self.groups[index];
        if let Some(name) = &update.name {
            group.name = name.clone();
        }
        if let Some(color) = &update.color {
            group.color = color.clone();
        }
        if let Some(layout) = update.layout {
            group.layout = layout;
        }
        group.updated_at = now;
        Ok(group)
    }

    /// Appends a terminal to a group. Ids already owned elsewhere are
    /// rejected.
    pub fn push_terminal(
        &mut self,
        group_id: &str,
        terminal: Terminal,
        now: u64,
    ) -> Result<&Terminal, StoreError> {
        let index = self.group_index(group_id)?;
        if self.find_terminal_group(&terminal.id).is_some() {
            return Err(StoreError::OwnershipViolation(terminal.id));
        }
        let group = &mut self.groups[index];
        group.terminals.push(terminal);
        group.updated_at = now;
        Ok(&group.terminals[group.terminals.len() - 1])
    }

    pub fn remove_terminal(
        &mut self,
        group_id: &str,
        terminal_id: &str,
        now: u64,
    ) -> Result<Terminal, StoreError> {
        let index = self.group_index(group_id)?;
        let group = &mut self.groups[index];
        let position = group
            .terminals
            .iter()
            .position(|t| t.id == terminal_id)
            .ok_or_else(|| StoreError::TerminalNotFound {
                group_id: group_id.to_string(),
                terminal_id: terminal_id.to_string(),
            })?;
        let removed = group.terminals.remove(position);
        group.updated_at = now;

        if self.active_terminal_id.as_deref() == Some(terminal_id) {
            self.active_terminal_id = None;
        }
        Ok(removed)
    }

    pub fn update_terminal(
        &mut self,
        group_id: &str,
        terminal_id: &str,
        update: &TerminalUpdate,
        now: u64,
    ) -> Result<&Terminal, StoreError> {
        let index = self.group_index(group_id)?;
        let group = &mut self.groups[index];
        let terminal = group
            .terminals
            .iter_mut()
            .find(|t| t.id == terminal_id)
            .ok_or_else(|| StoreError::TerminalNotFound {
                group_id: group_id.to_string(),
                terminal_id: terminal_id.to_string(),
            })?;
        terminal.apply(update);
        group.updated_at = now;
        Ok(terminal)
    }

    /// Records a successful launch. `cwd` is always applied; the status
    /// becomes running only while it is still `expected`, so an exit that
    /// was applied in the meantime is kept.
    pub fn mark_running(
        &mut self,
        group_id: &str,
        terminal_id: &str,
        expected: TerminalStatus,
        cwd: Option<String>,
        now: u64,
    ) -> Result<&Terminal, StoreError> {
        let current = self
            .terminal(group_id, terminal_id)
            .map(|t| t.status)
            .ok_or_else(|| StoreError::TerminalNotFound {
                group_id: group_id.to_string(),
                terminal_id: terminal_id.to_string(),
            })?;
        let update = TerminalUpdate {
            cwd,
            status: (current == expected).then_some(TerminalStatus::Running),
            ..TerminalUpdate::default()
        };
        self.update_terminal(group_id, terminal_id, &update, now)
    }

    /// Moves a terminal between groups in one step. Returns `Ok(false)`
    /// when nothing moved: same group, unknown source group, or terminal
    /// not in the source.
    pub fn move_terminal(
        &mut self,
        from_group_id: &str,
        to_group_id: &str,
        terminal_id: &str,
        now: u64,
    ) -> Result<bool, StoreError> {
        if from_group_id == to_group_id {
            return Ok(false);
        }
        let Ok(from) = self.group_index(from_group_id) else {
            return Ok(false);
        };
        let Some(position) = self.groups[from].terminals.iter().position(|t| t.id == terminal_id)
        else {
            return Ok(false);
        };
        // Resolve the destination before touching the source.
        let to = self.group_index(to_group_id)?;

        let terminal = self.groups[from].terminals.remove(position);
        self.groups[from].updated_at = now;
        self.groups[to].terminals.push(terminal);
        self.groups[to].updated_at = now;
        Ok(true)
    }

    /// Selects the active group and clears the active terminal.
    pub fn set_active_group(&mut self, group_id: Option<&str>) -> Result<(), StoreError> {
        if let Some(id) = group_id {
            self.group_index(id)?;
        }
        self.active_group_id = group_id.map(str::to_string);
        self.active_terminal_id = None;
        Ok(())
    }

    pub fn set_active_terminal(&mut self, terminal_id: Option<&str>) {
        self.active_terminal_id = terminal_id.map(str::to_string);
    }

    /// Activates the group at `index`.
    pub fn activate_group_at(&mut self, index: usize) -> Option<&TerminalGroup> {
        let id = self.groups.get(index)?.id.clone();
        self.active_group_id = Some(id);
        self.active_terminal_id = None;
        self.groups.get(index)
    }

    /// Activates the group after (`step = 1`) or before (`step = -1`) the
    /// active one, wrapping around.
    pub fn cycle_group(&mut self, step: isize) -> Option<&TerminalGroup> {
        if self.groups.is_empty() {
            return None;
        }
        let len = self.groups.len() as isize;
        let current = self
            .active_group_id
            .as_deref()
            .and_then(|id| self.groups.iter().position(|g| g.id == id));
        let next = match current {
            Some(i) => (i as isize + step).rem_euclid(len) as usize,
            None => 0,
        };
        self.activate_group_at(next)
    }

    /// Records a status transition for whichever group owns the terminal.
    pub fn apply_status(
        &mut self,
        terminal_id: &str,
        status: TerminalStatus,
        exit_code: Option<i32>,
        now: u64,
    ) -> Option<GroupId> {
        let group_id = self.find_terminal_group(terminal_id)?.id.clone();
        let update = TerminalUpdate::status(status, exit_code);
        self.update_terminal(&group_id, terminal_id, &update, now)
            .ok()
            .map(|_| group_id)
    }

    /// Replaces the whole graph with restored data. Restored terminals are
    /// reset to idle. Duplicate terminal ids keep their first owner and
    /// invalid layouts fall back to the default.
    pub fn restore(&mut self, groups: Vec<TerminalGroup>, last_active: Option<GroupId>) {
        let mut seen_groups = HashSet::new();
        let mut seen_terminals = HashSet::new();
        let mut restored = Vec::with_capacity(groups.len());

        for mut group in groups {
            if !seen_groups.insert(group.id.clone()) {
                tracing::warn!(group_id = %group.id, "Dropping duplicate group");
                continue;
            }
            if check_layout(&group.layout).is_err() {
                tracing::warn!(group_id = %group.id, "Invalid layout, using default");
                group.layout = GridLayout::default();
            }
            group.terminals.retain(|t| {
                let fresh = seen_terminals.insert(t.id.clone());
                if !fresh {
                    tracing::warn!(terminal_id = %t.id, "Dropping duplicate terminal");
                }
                fresh
            });
            for terminal in &mut group.terminals {
                terminal.status = TerminalStatus::Idle;
                terminal.exit_code = None;
            }
            restored.push(group);
        }

        self.active_group_id = last_active
            .filter(|id| restored.iter().any(|g| &g.id == id))
            .or_else(|| restored.first().map(|g| g.id.clone()));
        self.active_terminal_id = None;
        self.groups = restored;
    }

    /// Replaces the graph wholesale, keeping statuses as given. The
    /// current graph is kept when the new one breaks a placement rule.
    pub fn replace(
        &mut self,
        groups: Vec<TerminalGroup>,
        last_active: Option<GroupId>,
    ) -> Result<(), StoreError> {
        let active_group_id = last_active
            .filter(|id| groups.iter().any(|g| &g.id == id))
            .or_else(|| groups.first().map(|g| g.id.clone()));
        let candidate = Self {
            groups,
            active_group_id,
            active_terminal_id: None,
        };
        candidate.check_invariants()?;
        let mut seen = HashSet::new();
        if let Some(g) = candidate.groups.iter().find(|g| !seen.insert(g.id.as_str())) {
            return Err(StoreError::DuplicateGroup(g.id.clone()));
        }
        *self = candidate;
        Ok(())
    }

    /// Verifies terminal-id uniqueness and layout validity.
    pub fn check_invariants(&self) -> Result<(), StoreError> {
        let mut seen = HashSet::new();
        for group in &self.groups {
            check_layout(&group.layout)?;
            for terminal in &group.terminals {
                if !seen.insert(terminal.id.as_str()) {
                    return Err(StoreError::OwnershipViolation(terminal.id.clone()));
                }
            }
        }
        if let Some(active) = self.active_group_id.as_deref() {
            self.group_index(active)?;
        }
        Ok(())
    }
}
