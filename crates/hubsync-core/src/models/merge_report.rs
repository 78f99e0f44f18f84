//! Merge report model

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Record, RecordId};

/// What an import did to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Added,
    Updated,
    Tombstoned,
    Unchanged,
}

/// Which side of the merge lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardedSide {
    Local,
    Incoming,
}

/// Why the losing version lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictCause {
    /// The kept version had a strictly greater `lastModified`.
    NewerTimestamp,
    /// Both versions had the same `lastModified`; the policy's tie rule decided.
    TieBreak,
}

/// A differing version that an import discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Table holding the record
    pub table: String,
    /// Record involved in the conflict
    pub record_id: RecordId,
    /// Timestamp of the version that was kept
    pub kept_last_modified: i64,
    /// Full content of the version that lost
    pub discarded: Record,
    pub discarded_side: DiscardedSide,
    pub cause: ConflictCause,
}

impl SyncConflict {
    pub const fn discarded_last_modified(&self) -> i64 {
        self.discarded.last_modified
    }
}

/// Per-table outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReport {
    pub added: usize,
    pub updated: usize,
    pub tombstoned: usize,
    pub unchanged: usize,
}

impl TableReport {
    pub const fn total(&self) -> usize {
        self.added + self.updated + self.tombstoned + self.unchanged
    }

    pub const fn changed(&self) -> usize {
        self.added + self.updated + self.tombstoned
    }
}

/// Result of importing one snapshot into a replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub tables: BTreeMap<String, TableReport>,
    pub conflicts: Vec<SyncConflict>,
}

impl MergeReport {
    pub fn record(&mut self, table: &str, outcome: RecordOutcome) {
        let counts = self.tables.entry(table.to_string()).or_default();
        match outcome {
            RecordOutcome::Added => counts.added += 1,
            RecordOutcome::Updated => counts.updated += 1,
            RecordOutcome::Tombstoned => counts.tombstoned += 1,
            RecordOutcome::Unchanged => counts.unchanged += 1,
        }
    }

    pub fn push_conflict(&mut self, conflict: SyncConflict) {
        self.conflicts.push(conflict);
    }

    pub fn table(&self, name: &str) -> TableReport {
        self.tables.get(name).copied().unwrap_or_default()
    }

    /// Counters summed over every table.
    pub fn totals(&self) -> TableReport {
        self.tables
            .values()
            .fold(TableReport::default(), |acc, counts| TableReport {
                added: acc.added + counts.added,
                updated: acc.updated + counts.updated,
                tombstoned: acc.tombstoned + counts.tombstoned,
                unchanged: acc.unchanged + counts.unchanged,
            })
    }

    pub fn changed_count(&self) -> usize {
        self.totals().changed()
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Conflicts touching one record, in the order they were found.
    pub fn conflicts_for<'a>(
        &'a self,
        table: &'a str,
        record_id: RecordId,
    ) -> impl Iterator<Item = &'a SyncConflict> + 'a {
        self.conflicts
            .iter()
            .filter(move |conflict| conflict.table == table && conflict.record_id == record_id)
    }

    /// One line summary for logs and CLI output.
    pub fn summary(&self) -> String {
        let totals = self.totals();
        format!(
            "{} added, {} updated, {} tombstoned, {} unchanged, {} conflict(s)",
            totals.added,
            totals.updated,
            totals.tombstoned,
            totals.unchanged,
            self.conflicts.len()
        )
    }
}
