//! Shared replica store service used by the sync engine and domain code.
//!
//! The database sits behind an async mutex. Every method takes the lock only
//! for its synchronous `SQLite` work, so an in-flight sync never blocks domain
//! reads and writes while it waits on the relay.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::db::{
    Database, RecordRepository, SqliteRecordRepository, SqliteSyncMetaRepository,
    SyncMetaRepository, TableStats,
};
use crate::merge::{plan_import, MergePolicy};
use crate::models::{IdGenerator, MergeReport, Record, RecordId, Snapshot, Table};
use crate::state::LastSync;
use crate::util::now_millis;
use crate::Result;

/// Thread-safe local replica store.
#[derive(Clone)]
pub struct ReplicaService {
    db: Arc<Mutex<Database>>,
    ids: Arc<IdGenerator>,
    db_path: Option<PathBuf>,
}

impl std::fmt::Debug for ReplicaService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaService")
            .field("db_path", &self.db_path)
            .field("device_tag", &self.ids.device_tag())
            .finish_non_exhaustive()
    }
}

impl ReplicaService {
    /// Open the replica at the given filesystem path.
    ///
    /// A file that is not a `SQLite` database is moved aside and replaced by
    /// an empty replica.
    pub fn open_path(db_path: impl Into<PathBuf>, device_id: &str) -> Result<Self> {
        let db_path = db_path.into();
        let db = match Database::open(&db_path) {
            Ok(db) => db,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local replica at {} is unreadable: {error}. Moving it aside and starting empty.",
                    db_path.display()
                );
                Self::quarantine_corrupted_db_files(&db_path)?;
                Database::open(&db_path)?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            ids: Arc::new(IdGenerator::new(device_id)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory replica (primarily for tests).
    pub fn open_in_memory(device_id: &str) -> Result<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open_in_memory()?)),
            ids: Arc::new(IdGenerator::new(device_id)),
            db_path: None,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn is_corrupted_db_error(error: &crate::Error) -> bool {
        let message = error.to_string().to_ascii_lowercase();
        message.contains("file is not a database") || message.contains("malformed")
    }

    fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
        let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };

        if db_path.exists() {
            let backup_path =
                db_path.with_file_name(format!("{base_name}.corrupt-{}", now_millis()));
            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted local DB file from {} to {}",
                db_path.display(),
                backup_path.display()
            );
        }

        for suffix in ["-wal", "-shm", "-journal"] {
            let sidecar = db_path.with_file_name(format!("{base_name}{suffix}"));
            if sidecar.exists() {
                std::fs::remove_file(&sidecar)?;
                tracing::warn!("Removed stale local replica file {}", sidecar.display());
            }
        }

        Ok(())
    }

    /// All records of a table, tombstones included.
    pub async fn get_all(&self, table: &str) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).get_all(table)
    }

    /// Records of a table that are not tombstoned.
    pub async fn list_live(&self, table: &str) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).list_live(table)
    }

    /// Fetch one record, tombstoned or not.
    pub async fn get(&self, table: &str, id: RecordId) -> Result<Option<Record>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).get(table, id)
    }

    /// Upsert a record by id.
    pub async fn put(&self, table: &str, record: Record) -> Result<Record> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).put(table, record)
    }

    /// Upsert many records atomically.
    pub async fn bulk_put(&self, table: &str, records: Vec<Record>) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).bulk_put(table, records)
    }

    /// Create a record under a freshly generated id.
    pub async fn create(&self, table: &str, fields: Map<String, Value>) -> Result<Record> {
        let id = self.ids.next_id();
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).create(table, id, fields)
    }

    /// Tombstone a record.
    pub async fn delete(&self, table: &str, id: RecordId) -> Result<Record> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).delete(table, id)
    }

    /// Names of tables holding records.
    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).list_tables()
    }

    /// Live and tombstoned counts per table.
    pub async fn table_stats(&self) -> Result<Vec<TableStats>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).table_stats()
    }

    /// Every table keyed by name.
    pub async fn load_tables(&self) -> Result<BTreeMap<String, Table>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).load_tables()
    }

    /// Export every table, tombstones included.
    pub async fn export_snapshot(&self) -> Result<Snapshot> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).export_snapshot(now_millis())
    }

    /// Import a snapshot under a merge policy.
    ///
    /// Every decision is computed before the first write, and the writes are
    /// committed in one transaction. On error the replica is unchanged.
    pub async fn import_snapshot(
        &self,
        snapshot: &Snapshot,
        policy: MergePolicy,
    ) -> Result<MergeReport> {
        let db = self.db.lock().await;
        let repo = SqliteRecordRepository::new(db.connection());
        let local = repo.load_tables()?;
        let plan = plan_import(policy, &local, snapshot);

        if !plan.is_noop() {
            repo.apply_writes(&plan.writes)?;
        }
        tracing::debug!(
            "Imported snapshot with {policy}: {}",
            plan.report.summary()
        );
        Ok(plan.report)
    }

    /// Most recent sync attempt.
    pub async fn last_sync(&self) -> Result<Option<LastSync>> {
        let db = self.db.lock().await;
        SqliteSyncMetaRepository::new(db.connection()).load_last_sync()
    }

    pub async fn save_last_sync(&self, last_sync: &LastSync) -> Result<()> {
        let db = self.db.lock().await;
        SqliteSyncMetaRepository::new(db.connection()).save_last_sync(last_sync)
    }

    /// Rewrite a sync attempt left in `Syncing` by a crash as an error.
    ///
    /// Returns the rewritten attempt, if there was one.
    pub async fn recover_interrupted_sync(&self) -> Result<Option<LastSync>> {
        let db = self.db.lock().await;
        let repo = SqliteSyncMetaRepository::new(db.connection());
        let Some(last) = repo.load_last_sync()? else {
            return Ok(None);
        };
        if !last.is_interrupted() {
            return Ok(None);
        }

        let recovered = last.finished(
            crate::state::SyncStatus::Error,
            now_millis(),
            Some("Interrupted before completion; local replica unchanged".to_string()),
        );
        repo.save_last_sync(&recovered)?;
        tracing::warn!(
            "Recovered interrupted {} started at {}",
            recovered.operation,
            recovered.started_at
        );
        Ok(Some(recovered))
    }

    /// `exportedAt` of the last master snapshot pulled or published.
    pub async fn last_master(&self) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        SqliteSyncMetaRepository::new(db.connection()).load_last_master()
    }

    pub async fn save_last_master(&self, exported_at: i64) -> Result<()> {
        let db = self.db.lock().await;
        SqliteSyncMetaRepository::new(db.connection()).save_last_master(exported_at)
    }

    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.connection().execute_batch(sql)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::state::{SyncOperation, SyncStatus};

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn create_assigns_unique_ids() {
        let replica = ReplicaService::open_in_memory("spoke-a").unwrap();
        let first = replica.create("students", fields(json!({"name": "Ayu"}))).await.unwrap();
        let second = replica.create("students", fields(json!({"name": "Bima"}))).await.unwrap();

        assert!(second.id > first.id);
        assert_eq!(replica.list_live("students").await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn import_is_atomic_on_invalid_table() {
        let replica = ReplicaService::open_in_memory("hub").unwrap();
        let mut snapshot = Snapshot::new(1);
        snapshot
            .table_mut("students")
            .upsert(Record::new(RecordId::new(1), 5, Map::new()));
        snapshot
            .table_mut("not a table")
            .upsert(Record::new(RecordId::new(2), 5, Map::new()));

        assert!(replica
            .import_snapshot(&snapshot, MergePolicy::PreferNewer)
            .await
            .is_err());
        assert!(replica.list_tables().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn export_then_import_is_noop() {
        let replica = ReplicaService::open_in_memory("hub").unwrap();
        replica.create("students", Map::new()).await.unwrap();
        let snapshot = replica.export_snapshot().await.unwrap();

        let report = replica
            .import_snapshot(&snapshot, MergePolicy::KeepNewerLocal)
            .await
            .unwrap();
        assert_eq!(report.changed_count(), 0);
        assert_eq!(report.table("students").unchanged, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn interrupted_sync_is_recovered_as_error() {
        let replica = ReplicaService::open_in_memory("spoke").unwrap();
        assert_eq!(replica.recover_interrupted_sync().await.unwrap(), None);

        replica
            .save_last_sync(&LastSync::started(SyncOperation::Pull, 1))
            .await
            .unwrap();
        let recovered = replica.recover_interrupted_sync().await.unwrap().unwrap();
        assert_eq!(recovered.status, SyncStatus::Error);
        assert_eq!(replica.last_sync().await.unwrap(), Some(recovered));
        assert_eq!(replica.recover_interrupted_sync().await.unwrap(), None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn corrupted_db_file_is_quarantined_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("replica.db");
        let wal_path = dir.path().join("replica.db-wal");
        std::fs::write(&db_path, b"definitely not sqlite, just sixteen+ bytes of junk").unwrap();
        std::fs::write(&wal_path, b"wal").unwrap();

        let replica = ReplicaService::open_path(&db_path, "spoke").unwrap();
        assert_eq!(replica.db_path(), Some(db_path.as_path()));
        // The reopened replica may start its own WAL, never the stale one.
        if wal_path.exists() {
            assert_ne!(std::fs::read(&wal_path).unwrap(), b"wal".to_vec());
        }

        replica.create("students", Map::new()).await.unwrap();
        assert_eq!(replica.get_all("students").await.unwrap().len(), 1);

        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("replica.db.corrupt-")
            })
            .count();
        assert_eq!(backups, 1);
    }
}
