//! Snapshot model

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Record, RecordId};

/// Snapshot layout version written by this client.
pub const FORMAT_VERSION: u32 = 1;

/// Immutable export of every table of a replica, tombstones included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub format_version: u32,
    /// Unix ms when the snapshot was exported
    pub exported_at: i64,
    /// Present only on inbox entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission: Option<Submission>,
    #[serde(default)]
    pub tables: BTreeMap<String, Table>,
    /// Envelope fields written by newer clients
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Snapshot {
    pub fn new(exported_at: i64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            exported_at,
            submission: None,
            tables: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    /// Annotate the snapshot as an inbox entry.
    #[must_use]
    pub fn submitted(mut self, submitted_by: impl Into<String>, submitted_at: i64) -> Self {
        self.submission = Some(Submission {
            submitted_by: submitted_by.into(),
            submitted_at,
            extra: Map::new(),
        });
        self
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn table_mut(&mut self, name: &str) -> &mut Table {
        self.tables.entry(name.to_string()).or_default()
    }

    pub fn record_count(&self) -> usize {
        self.tables.values().map(Table::len).sum()
    }

    pub const fn is_inbox_entry(&self) -> bool {
        self.submission.is_some()
    }
}

/// Who submitted an inbox entry, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub submitted_by: String,
    pub submitted_at: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Records of one table keyed by id.
///
/// Serialized as a JSON array; decoding rejects duplicate ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Record>", into = "Vec<Record>")]
pub struct Table {
    records: BTreeMap<RecordId, Record>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from records, failing on the first duplicate id.
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Result<Self, DuplicateRecordId> {
        let mut table = Self::new();
        for record in records {
            let id = record.id;
            if table.records.insert(id, record).is_some() {
                return Err(DuplicateRecordId(id));
            }
        }
        Ok(table)
    }

    /// Insert or replace a record, returning the previous version.
    pub fn upsert(&mut self, record: Record) -> Option<Record> {
        self.records.insert(record.id, record)
    }

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.records.get(&id)
    }

    pub fn remove(&mut self, id: RecordId) -> Option<Record> {
        self.records.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.records.keys().copied()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records.into_values().collect()
    }
}

impl FromIterator<Record> for Table {
    /// Later records with the same id replace earlier ones.
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        let mut table = Self::new();
        for record in iter {
            table.upsert(record);
        }
        table
    }
}

impl TryFrom<Vec<Record>> for Table {
    type Error = DuplicateRecordId;

    fn try_from(records: Vec<Record>) -> Result<Self, Self::Error> {
        Self::from_records(records)
    }
}

impl From<Table> for Vec<Record> {
    fn from(table: Table) -> Self {
        table.into_records()
    }
}

/// Two records in one table share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("duplicate record id {0}")]
pub struct DuplicateRecordId(pub RecordId);

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn record(id: i64, last_modified: i64) -> Record {
        Record::new(RecordId::new(id), last_modified, Map::new())
    }

    #[test]
    fn table_rejects_duplicate_ids() {
        let error = Table::from_records([record(1, 10), record(1, 20)]).unwrap_err();
        assert_eq!(error, DuplicateRecordId(RecordId::new(1)));

        let decoded = serde_json::from_value::<Table>(json!([
            {"id": 1, "lastModified": 1},
            {"id": 1, "lastModified": 2}
        ]));
        assert!(decoded.is_err());
    }

    #[test]
    fn table_serializes_as_sorted_array() {
        let table = Table::from_records([record(2, 10), record(1, 20)]).unwrap();
        assert_eq!(
            serde_json::to_value(&table).unwrap(),
            json!([{"id": 1, "lastModified": 20}, {"id": 2, "lastModified": 10}])
        );
    }

    #[test]
    fn submitted_marks_inbox_entry() {
        let mut snapshot = Snapshot::new(5).submitted("spoke-a", 6);
        snapshot.table_mut("students").upsert(record(1, 1));

        assert!(snapshot.is_inbox_entry());
        assert_eq!(snapshot.record_count(), 1);
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(
            value["submission"],
            json!({"submittedBy": "spoke-a", "submittedAt": 6})
        );
    }

    #[test]
    fn from_iter_keeps_last_duplicate() {
        let table: Table = [record(1, 10), record(1, 20)].into_iter().collect();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(RecordId::new(1)).unwrap().last_modified, 20);
    }
}
