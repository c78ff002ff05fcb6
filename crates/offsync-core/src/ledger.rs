//! In-memory count of unsynced local edits
//!
//! The ledger mirrors the replica's durable change tracking row by row so
//! that a partial sync can clear exactly the rows the service accepted.
//! Every mutation publishes `PendingEditCountChanged` for the badge.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::events::{EventBus, SyncEvent};
use crate::models::{EditKind, RowId, RowKey, RowMutation, TableKey};

/// Pending edit counts of one table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl TableCounts {
    pub fn total(&self) -> usize {
        self.added + self.updated + self.deleted
    }
}

/// Pending edits per local table
#[derive(Debug, Default)]
pub struct EditLedger {
    tables: BTreeMap<TableKey, BTreeMap<RowId, EditKind>>,
    events: Option<EventBus>,
}

impl EditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger that announces count changes on `events`
    pub fn with_events(events: EventBus) -> Self {
        Self {
            tables: BTreeMap::new(),
            events: Some(events),
        }
    }

    pub fn record_add(&mut self, key: RowKey) {
        self.record(key, EditKind::Add);
    }

    pub fn record_update(&mut self, key: RowKey) {
        self.record(key, EditKind::Update);
    }

    pub fn record_delete(&mut self, key: RowKey) {
        self.record(key, EditKind::Delete);
    }

    /// Merge a new edit on `key` into its pending state
    pub fn record(&mut self, key: RowKey, kind: EditKind) {
        let previous = self.pending_kind(key);
        self.set(key, EditKind::merge(previous, kind));
        self.notify();
    }

    /// Mirror mutations reported by the replica
    pub fn apply(&mut self, mutations: &[RowMutation]) {
        for mutation in mutations {
            self.set(mutation.key, mutation.pending);
        }
        self.notify();
    }

    pub fn pending_count(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    pub fn has_local_edits(&self) -> bool {
        self.pending_count() > 0
    }

    pub fn pending_kind(&self, key: RowKey) -> Option<EditKind> {
        self.tables
            .get(&key.table)
            .and_then(|rows| rows.get(&key.id))
            .copied()
    }

    pub fn counts(&self, table: TableKey) -> TableCounts {
        let mut counts = TableCounts::default();
        for kind in self.tables.get(&table).into_iter().flat_map(|rows| rows.values()) {
            match kind {
                EditKind::Add => counts.added += 1,
                EditKind::Update => counts.updated += 1,
                EditKind::Delete => counts.deleted += 1,
            }
        }
        counts
    }

    /// Counts for every table with pending edits
    pub fn all_counts(&self) -> Vec<(TableKey, TableCounts)> {
        self.tables
            .keys()
            .map(|table| (*table, self.counts(*table)))
            .collect()
    }

    pub fn pending_rows(&self) -> Vec<RowKey> {
        self.tables
            .iter()
            .flat_map(|(table, rows)| rows.keys().map(|id| RowKey { table: *table, id: *id }))
            .collect()
    }

    /// Zero every count after a fully successful upload
    pub(crate) fn reset(&mut self) {
        self.tables.clear();
        self.notify();
    }

    /// Clear the rows the service accepted, leaving rejected ones pending
    pub(crate) fn clear_rows(&mut self, rows: &[RowKey]) {
        for key in rows {
            self.set(*key, None);
        }
        self.notify();
    }

    /// Replace the contents with the replica's durable tracking
    ///
    /// Used whenever the replica is installed, reopened or deleted. An
    /// upload clears the ledger through `reset` or `clear_rows` instead.
    pub(crate) fn seed<I>(&mut self, rows: I)
    where
        I: IntoIterator<Item = (RowKey, EditKind)>,
    {
        self.tables.clear();
        for (key, kind) in rows {
            self.set(key, Some(kind));
        }
        self.notify();
    }

    fn set(&mut self, key: RowKey, pending: Option<EditKind>) {
        match pending {
            Some(kind) => {
                self.tables.entry(key.table).or_default().insert(key.id, kind);
            }
            None => {
                if let Some(rows) = self.tables.get_mut(&key.table) {
                    rows.remove(&key.id);
                    if rows.is_empty() {
                        self.tables.remove(&key.table);
                    }
                }
            }
        }
    }

    fn notify(&self) {
        if let Some(events) = &self.events {
            events.emit(SyncEvent::PendingEditCountChanged {
                count: self.pending_count(),
            });
        }
    }
}
