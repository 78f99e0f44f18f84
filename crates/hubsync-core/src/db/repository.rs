//! Record repository implementation

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::models::{Record, RecordId, Snapshot, Table, RESERVED_FIELDS};

/// Longest accepted table name.
const MAX_TABLE_NAME_LEN: usize = 64;

/// Record counts of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub table: String,
    pub live: usize,
    pub tombstoned: usize,
}

/// Trait for replica record storage operations
///
/// Every domain write goes through `put`, `bulk_put`, `create` or `delete`,
/// which stamp `lastModified`. `apply_writes` stores records exactly as given
/// and is reserved for snapshot imports.
pub trait RecordRepository {
    /// All records of a table, tombstones included, ordered by id
    fn get_all(&self, table: &str) -> Result<Vec<Record>>;

    /// Records of a table that are not tombstoned, ordered by id
    fn list_live(&self, table: &str) -> Result<Vec<Record>>;

    /// Get a record by id, tombstoned or not
    fn get(&self, table: &str, id: RecordId) -> Result<Option<Record>>;

    /// Upsert a record, stamping `lastModified`
    fn put(&self, table: &str, record: Record) -> Result<Record>;

    /// Upsert many records in one transaction
    fn bulk_put(&self, table: &str, records: Vec<Record>) -> Result<Vec<Record>>;

    /// Insert a new record under an id that must not exist yet
    fn create(&self, table: &str, id: RecordId, fields: Map<String, Value>) -> Result<Record>;

    /// Tombstone a record
    fn delete(&self, table: &str, id: RecordId) -> Result<Record>;

    /// Names of every table holding at least one record
    fn list_tables(&self) -> Result<Vec<String>>;

    /// Live and tombstoned counts per table
    fn table_stats(&self) -> Result<Vec<TableStats>>;

    /// Every table keyed by name
    fn load_tables(&self) -> Result<BTreeMap<String, Table>>;

    /// Export every table, tombstones included
    fn export_snapshot(&self, exported_at: i64) -> Result<Snapshot>;

    /// Store records verbatim in one transaction
    fn apply_writes(&self, writes: &[(String, Record)]) -> Result<()>;
}

/// `SQLite` implementation of `RecordRepository`
pub struct SqliteRecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Version stamp for a write: now, unless the clock went backwards.
    const fn next_stamp(previous: Option<i64>, now: i64) -> i64 {
        match previous {
            Some(previous) if previous >= now => previous + 1,
            _ => now,
        }
    }

    fn current_stamp(&self, table: &str, id: RecordId) -> Result<Option<i64>> {
        let stamp = self
            .conn
            .query_row(
                "SELECT last_modified FROM records WHERE table_name = ? AND id = ?",
                params![table, id.value()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stamp)
    }

    fn write(conn: &Connection, table: &str, record: &Record) -> Result<()> {
        // Reserved names live in their own columns; a copy in the body would
        // duplicate keys in exported snapshots.
        let fields = record
            .fields
            .iter()
            .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
            .collect::<BTreeMap<_, _>>();
        let body = serde_json::to_string(&fields)?;
        conn.execute(
            "INSERT INTO records (table_name, id, last_modified, deleted, body)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(table_name, id) DO UPDATE SET
                last_modified = excluded.last_modified,
                deleted = excluded.deleted,
                body = excluded.body",
            params![
                table,
                record.id.value(),
                record.last_modified,
                record.deleted,
                body
            ],
        )?;
        Ok(())
    }

    fn stamped_write(&self, table: &str, mut record: Record, now: i64) -> Result<Record> {
        record.strip_reserved_fields();
        let previous = self.current_stamp(table, record.id)?;
        record.last_modified = Self::next_stamp(previous, now);
        Self::write(self.conn, table, &record)?;
        Ok(record)
    }

    fn query_records(&self, sql: &str, table: &str) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![table], parse_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawRecord::into_record).collect()
    }
}

/// Row shape before the JSON body is parsed
struct RawRecord {
    id: i64,
    last_modified: i64,
    deleted: Option<bool>,
    body: String,
}

impl RawRecord {
    fn into_record(self) -> Result<Record> {
        let fields: Map<String, Value> = serde_json::from_str(&self.body).map_err(|error| {
            Error::Database(format!("Stored record {} has an invalid body: {error}", self.id))
        })?;
        Ok(Record {
            id: RecordId::new(self.id),
            last_modified: self.last_modified,
            deleted: self.deleted,
            fields,
        })
    }
}

fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        last_modified: row.get(1)?,
        deleted: row.get(2)?,
        body: row.get(3)?,
    })
}

/// Validate a table name supplied by domain code.
pub fn validate_table_name(table: &str) -> Result<&str> {
    let table = table.trim();
    if table.is_empty() {
        return Err(Error::InvalidInput("Table name cannot be empty".to_string()));
    }
    if table.len() > MAX_TABLE_NAME_LEN {
        return Err(Error::InvalidInput(format!(
            "Table name is longer than {MAX_TABLE_NAME_LEN} characters"
        )));
    }
    if !table
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(Error::InvalidInput(format!(
            "Table name '{table}' may only contain letters, digits, '_' and '-'"
        )));
    }
    Ok(table)
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn get_all(&self, table: &str) -> Result<Vec<Record>> {
        let table = validate_table_name(table)?;
        self.query_records(
            "SELECT id, last_modified, deleted, body FROM records
             WHERE table_name = ? ORDER BY id",
            table,
        )
    }

    fn list_live(&self, table: &str) -> Result<Vec<Record>> {
        let table = validate_table_name(table)?;
        self.query_records(
            "SELECT id, last_modified, deleted, body FROM records
             WHERE table_name = ? AND COALESCE(deleted, 0) = 0 ORDER BY id",
            table,
        )
    }

    fn get(&self, table: &str, id: RecordId) -> Result<Option<Record>> {
        let table = validate_table_name(table)?;
        let raw = self
            .conn
            .query_row(
                "SELECT id, last_modified, deleted, body FROM records
                 WHERE table_name = ? AND id = ?",
                params![table, id.value()],
                parse_row,
            )
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    fn put(&self, table: &str, record: Record) -> Result<Record> {
        let table = validate_table_name(table)?;
        self.stamped_write(table, record, crate::util::now_millis())
    }

    fn bulk_put(&self, table: &str, records: Vec<Record>) -> Result<Vec<Record>> {
        let table = validate_table_name(table)?;
        let now = crate::util::now_millis();
        let tx = self.conn.unchecked_transaction()?;
        let stored = records
            .into_iter()
            .map(|record| self.stamped_write(table, record, now))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;
        Ok(stored)
    }

    fn create(&self, table: &str, id: RecordId, fields: Map<String, Value>) -> Result<Record> {
        let table = validate_table_name(table)?;
        if self.current_stamp(table, id)?.is_some() {
            return Err(Error::InvalidInput(format!(
                "Record {id} already exists in table '{table}'"
            )));
        }
        let record = Record::new(id, crate::util::now_millis(), fields);
        Self::write(self.conn, table, &record)?;
        Ok(record)
    }

    fn delete(&self, table: &str, id: RecordId) -> Result<Record> {
        let table = validate_table_name(table)?;
        let mut record = self
            .get(table, id)?
            .ok_or_else(|| Error::NotFound(format!("{table}/{id}")))?;
        record.deleted = Some(true);
        self.stamped_write(table, record, crate::util::now_millis())
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT table_name FROM records ORDER BY table_name")?;
        let tables = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(tables)
    }

    fn table_stats(&self) -> Result<Vec<TableStats>> {
        let mut stmt = self.conn.prepare(
            "SELECT table_name,
                    SUM(CASE WHEN COALESCE(deleted, 0) = 0 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN COALESCE(deleted, 0) = 0 THEN 0 ELSE 1 END)
             FROM records
             GROUP BY table_name
             ORDER BY table_name",
        )?;
        let stats = stmt
            .query_map([], |row| {
                Ok(TableStats {
                    table: row.get(0)?,
                    live: usize::try_from(row.get::<_, i64>(1)?).unwrap_or_default(),
                    tombstoned: usize::try_from(row.get::<_, i64>(2)?).unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stats)
    }

    fn load_tables(&self) -> Result<BTreeMap<String, Table>> {
        let mut stmt = self.conn.prepare(
            "SELECT table_name, id, last_modified, deleted, body FROM records
             ORDER BY table_name, id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    RawRecord {
                        id: row.get(1)?,
                        last_modified: row.get(2)?,
                        deleted: row.get(3)?,
                        body: row.get(4)?,
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut tables: BTreeMap<String, Table> = BTreeMap::new();
        for (table, raw) in rows {
            tables.entry(table).or_default().upsert(raw.into_record()?);
        }
        Ok(tables)
    }

    fn export_snapshot(&self, exported_at: i64) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new(exported_at);
        snapshot.tables = self.load_tables()?;
        Ok(snapshot)
    }

    fn apply_writes(&self, writes: &[(String, Record)]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for (table, record) in writes {
            let table = validate_table_name(table)?;
            Self::write(&tx, table, record)?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::db::Database;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let db = setup();
        let repo = SqliteRecordRepository::new(db.connection());

        let created = repo
            .create("students", RecordId::new(1), fields(json!({"name": "Ayu"})))
            .unwrap();
        let fetched = repo.get("students", RecordId::new(1)).unwrap().unwrap();
        assert_eq!(fetched, created);
        assert!(repo.get("students", RecordId::new(2)).unwrap().is_none());
    }

    #[test]
    fn test_create_rejects_existing_id() {
        let db = setup();
        let repo = SqliteRecordRepository::new(db.connection());

        repo.create("students", RecordId::new(1), Map::new()).unwrap();
        let error = repo
            .create("students", RecordId::new(1), Map::new())
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
    }

    #[test]
    fn test_put_never_decreases_last_modified() {
        let db = setup();
        let repo = SqliteRecordRepository::new(db.connection());
        let future = crate::util::now_millis() + 60_000;

        repo.apply_writes(&[(
            "students".to_string(),
            Record::new(RecordId::new(1), future, Map::new()),
        )])
        .unwrap();

        let stored = repo
            .put("students", Record::new(RecordId::new(1), 0, fields(json!({"a": 1}))))
            .unwrap();
        assert_eq!(stored.last_modified, future + 1);
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let db = setup();
        let repo = SqliteRecordRepository::new(db.connection());

        let created = repo.create("students", RecordId::new(1), Map::new()).unwrap();
        let deleted = repo.delete("students", RecordId::new(1)).unwrap();
        assert!(deleted.is_deleted());
        assert!(deleted.last_modified > created.last_modified);

        assert_eq!(repo.get_all("students").unwrap().len(), 1);
        assert!(repo.list_live("students").unwrap().is_empty());
        assert!(matches!(
            repo.delete("students", RecordId::new(9)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_put_drops_reserved_domain_fields() {
        let db = setup();
        let repo = SqliteRecordRepository::new(db.connection());

        let shadowing = Record {
            id: RecordId::new(1),
            last_modified: 0,
            deleted: None,
            fields: fields(json!({"id": 99, "lastModified": 5, "deleted": true, "name": "Ayu"})),
        };
        let stored = repo.put("students", shadowing).unwrap();
        assert_eq!(stored.fields, fields(json!({"name": "Ayu"})));
        assert!(!stored.is_deleted());

        let exported = repo.export_snapshot(1_000).unwrap();
        let decoded = crate::codec::decode(&crate::codec::encode(&exported).unwrap()).unwrap();
        assert_eq!(decoded, exported);
        let record = decoded.table("students").unwrap().get(RecordId::new(1)).unwrap();
        assert_eq!(record.id, RecordId::new(1));
        assert_eq!(record.fields.get("name"), Some(&json!("Ayu")));
    }

    #[test]
    fn test_put_without_deleted_resurrects() {
        let db = setup();
        let repo = SqliteRecordRepository::new(db.connection());

        repo.create("students", RecordId::new(1), Map::new()).unwrap();
        let tombstone = repo.delete("students", RecordId::new(1)).unwrap();
        let revived = repo
            .put("students", Record::new(RecordId::new(1), 0, Map::new()))
            .unwrap();
        assert!(!revived.is_deleted());
        assert!(revived.last_modified > tombstone.last_modified);
    }

    #[test]
    fn test_bulk_put_and_stats() {
        let db = setup();
        let repo = SqliteRecordRepository::new(db.connection());

        let records = (1..=3)
            .map(|id| Record::new(RecordId::new(id), 0, Map::new()))
            .collect();
        repo.bulk_put("ledger", records).unwrap();
        repo.create("students", RecordId::new(1), Map::new()).unwrap();
        repo.delete("ledger", RecordId::new(2)).unwrap();

        assert_eq!(repo.list_tables().unwrap(), vec!["ledger", "students"]);
        assert_eq!(
            repo.table_stats().unwrap(),
            vec![
                TableStats {
                    table: "ledger".to_string(),
                    live: 2,
                    tombstoned: 1,
                },
                TableStats {
                    table: "students".to_string(),
                    live: 1,
                    tombstoned: 0,
                },
            ]
        );
    }

    #[test]
    fn test_apply_writes_keeps_exact_versions() {
        let db = setup();
        let repo = SqliteRecordRepository::new(db.connection());

        let mut tombstone = Record::new(RecordId::new(5), 42, fields(json!({"x": [1, 2]})));
        tombstone.deleted = Some(false);
        repo.apply_writes(&[("catalog".to_string(), tombstone.clone())])
            .unwrap();

        let snapshot = repo.export_snapshot(99).unwrap();
        assert_eq!(snapshot.exported_at, 99);
        assert_eq!(
            snapshot.table("catalog").unwrap().get(RecordId::new(5)),
            Some(&tombstone)
        );
    }

    #[test]
    fn test_apply_writes_is_atomic() {
        let db = setup();
        let repo = SqliteRecordRepository::new(db.connection());

        let result = repo.apply_writes(&[
            ("students".to_string(), Record::new(RecordId::new(1), 1, Map::new())),
            ("bad table!".to_string(), Record::new(RecordId::new(2), 1, Map::new())),
        ]);
        assert!(result.is_err());
        assert!(repo.list_tables().unwrap().is_empty());
    }

    #[test]
    fn test_table_names_are_validated() {
        assert!(validate_table_name(" students ").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("a/b").is_err());
        assert!(validate_table_name(&"x".repeat(65)).is_err());
    }
}
