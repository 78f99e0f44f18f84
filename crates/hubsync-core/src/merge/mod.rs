//! Merge resolver.
//!
//! Everything here is a pure function of its inputs. The replica store feeds
//! the current local tables and an incoming snapshot to [`plan_import`] and
//! commits the returned writes in one transaction.
//!
//! Under [`MergePolicy::PreferNewer`] the winner of two versions is the
//! maximum under the total order `(lastModified, canonical encoding)`. Taking
//! a maximum is commutative, associative and idempotent, so inbox entries can
//! be merged in any order, and replayed, with the same final state.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::{
    ConflictCause, DiscardedSide, MergeReport, Record, RecordOutcome, Snapshot, SyncConflict,
    Table,
};

/// Per-record rule applied by an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Spoke pull: the incoming version replaces the local one unless the
    /// local `lastModified` is strictly greater.
    KeepNewerLocal,
    /// Hub merge: the strictly newer version wins; equal timestamps fall back
    /// to the greater canonical encoding.
    PreferNewer,
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeepNewerLocal => f.write_str("keep-newer-local"),
            Self::PreferNewer => f.write_str("prefer-newer"),
        }
    }
}

/// Decision for a single record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// `true` when the incoming version must be written.
    pub take_incoming: bool,
    pub outcome: RecordOutcome,
    /// Set when a differing version was thrown away.
    pub discarded: Option<(DiscardedSide, ConflictCause)>,
}

impl Resolution {
    const fn keep_local(discarded: Option<(DiscardedSide, ConflictCause)>) -> Self {
        Self {
            take_incoming: false,
            outcome: RecordOutcome::Unchanged,
            discarded,
        }
    }
}

/// Resolve one record key.
pub fn resolve(policy: MergePolicy, local: Option<&Record>, incoming: &Record) -> Resolution {
    let Some(local) = local else {
        let outcome = if incoming.is_deleted() {
            RecordOutcome::Tombstoned
        } else {
            RecordOutcome::Added
        };
        return Resolution {
            take_incoming: true,
            outcome,
            discarded: None,
        };
    };

    let local_bytes = local.canonical_bytes();
    let incoming_bytes = incoming.canonical_bytes();
    if local_bytes == incoming_bytes {
        return Resolution::keep_local(None);
    }

    let by_timestamp = incoming.last_modified.cmp(&local.last_modified);
    let incoming_wins = match policy {
        MergePolicy::KeepNewerLocal => by_timestamp != Ordering::Less,
        MergePolicy::PreferNewer => {
            by_timestamp.then_with(|| incoming_bytes.cmp(&local_bytes)) == Ordering::Greater
        }
    };
    let cause = if by_timestamp == Ordering::Equal {
        ConflictCause::TieBreak
    } else {
        ConflictCause::NewerTimestamp
    };

    if !incoming_wins {
        return Resolution::keep_local(Some((DiscardedSide::Incoming, cause)));
    }

    let outcome = if incoming.is_deleted() && !local.is_deleted() {
        RecordOutcome::Tombstoned
    } else {
        RecordOutcome::Updated
    };
    Resolution {
        take_incoming: true,
        outcome,
        discarded: Some((DiscardedSide::Local, cause)),
    }
}

/// Writes and report computed for one import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportPlan {
    /// `(table, record)` pairs to upsert, in table then id order.
    pub writes: Vec<(String, Record)>,
    pub report: MergeReport,
}

impl ImportPlan {
    pub fn is_noop(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Compute every per-record decision of importing `incoming` into `local`.
///
/// Records present only locally are left alone; absence never deletes.
pub fn plan_import(
    policy: MergePolicy,
    local: &BTreeMap<String, Table>,
    incoming: &Snapshot,
) -> ImportPlan {
    let mut plan = ImportPlan::default();

    for (table_name, incoming_table) in &incoming.tables {
        plan.report.tables.entry(table_name.clone()).or_default();
        let local_table = local.get(table_name);

        for record in incoming_table.records() {
            let current = local_table.and_then(|table| table.get(record.id));
            let resolution = resolve(policy, current, record);
            plan.report.record(table_name, resolution.outcome);

            if let (Some((side, cause)), Some(current)) = (resolution.discarded, current) {
                let (kept, discarded) = match side {
                    DiscardedSide::Local => (record, current),
                    DiscardedSide::Incoming => (current, record),
                };
                plan.report.push_conflict(SyncConflict {
                    table: table_name.clone(),
                    record_id: record.id,
                    kept_last_modified: kept.last_modified,
                    discarded: discarded.clone(),
                    discarded_side: side,
                    cause,
                });
            }

            if resolution.take_incoming {
                plan.writes.push((table_name.clone(), record.clone()));
            }
        }
    }

    plan
}

/// Merge two snapshots without touching any store.
///
/// The result keeps `base`'s envelope and carries the merged tables.
pub fn merge_snapshots(
    policy: MergePolicy,
    base: &Snapshot,
    incoming: &Snapshot,
) -> (Snapshot, MergeReport) {
    let plan = plan_import(policy, &base.tables, incoming);
    let mut merged = base.clone();
    for name in incoming.tables.keys() {
        merged.table_mut(name);
    }
    for (table, record) in plan.writes {
        merged.table_mut(&table).upsert(record);
    }
    (merged, plan.report)
}
