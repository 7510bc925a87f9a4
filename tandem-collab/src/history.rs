//! Per-client undo/redo over full diagram snapshots.
//!
//! A bounded linear history: a deque of snapshots plus a cursor pointing at
//! the one currently shown. Pushing while the cursor is not at the tip drops
//! the redo branch. Nothing here is shared or persisted.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tandem_core::{now_millis, Edge, Node};

/// History tuning.
#[derive(Debug, Clone, Copy)]
pub struct HistoryConfig {
    /// Maximum number of retained snapshots, seed included. At least 1.
    pub capacity: usize,
    /// Minimum interval between two accepted pushes.
    pub debounce: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            debounce: Duration::from_millis(300),
        }
    }
}

/// One snapshot of the editable graph.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    /// Milliseconds since epoch.
    pub captured_at: u64,
}

impl HistoryEntry {
    fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self {
            nodes,
            edges,
            captured_at: now_millis(),
        }
    }
}

/// Bounded undo/redo stack.
///
/// Invariant: `entries` is never empty and `cursor < entries.len()`.
#[derive(Debug, Clone)]
pub struct HistoryManager {
    entries: VecDeque<HistoryEntry>,
    cursor: usize,
    config: HistoryConfig,
    last_accepted: Option<Instant>,
}

impl HistoryManager {
    /// Seed the history with the initial graph.
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self::with_config(nodes, edges, HistoryConfig::default())
    }

    pub fn with_config(nodes: Vec<Node>, edges: Vec<Edge>, mut config: HistoryConfig) -> Self {
        config.capacity = config.capacity.max(1);
        let mut entries = VecDeque::with_capacity(config.capacity);
        entries.push_back(HistoryEntry::new(nodes, edges));
        Self {
            entries,
            cursor: 0,
            config,
            last_accepted: None,
        }
    }

    /// Record a snapshot. Returns `false` when it fell inside the debounce window.
    pub fn push_state(&mut self, nodes: Vec<Node>, edges: Vec<Edge>) -> bool {
        self.push_state_at(nodes, edges, Instant::now())
    }

    /// [`Self::push_state`] with an explicit clock reading.
    pub fn push_state_at(&mut self, nodes: Vec<Node>, edges: Vec<Edge>, now: Instant) -> bool {
        if let Some(last) = self.last_accepted {
            if now.saturating_duration_since(last) < self.config.debounce {
                log::trace!("History push debounced");
                return false;
            }
        }
        self.last_accepted = Some(now);

        self.entries.truncate(self.cursor + 1);
        self.entries.push_back(HistoryEntry::new(nodes, edges));
        while self.entries.len() > self.config.capacity {
            self.entries.pop_front();
        }
        self.cursor = self.entries.len() - 1;
        true
    }

    /// Step back. `None` at the oldest snapshot.
    pub fn undo(&mut self) -> Option<&HistoryEntry> {
        if !self.can_undo() {
            return None;
        }
        self.cursor -= 1;
        self.entries.get(self.cursor)
    }

    /// Step forward. `None` at the newest snapshot.
    pub fn redo(&mut self) -> Option<&HistoryEntry> {
        if !self.can_redo() {
            return None;
        }
        self.cursor += 1;
        self.entries.get(self.cursor)
    }

    /// Reset to a single empty snapshot.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.entries.push_back(HistoryEntry::new(Vec::new(), Vec::new()));
        self.cursor = 0;
        self.last_accepted = None;
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor + 1 < self.entries.len()
    }

    /// The snapshot at the cursor.
    pub fn current(&self) -> Option<&HistoryEntry> {
        self.entries.get(self.cursor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn config(&self) -> HistoryConfig {
        self.config
    }
}
