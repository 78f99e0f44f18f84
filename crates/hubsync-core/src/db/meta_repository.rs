//! Sync bookkeeping repository implementation

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::state::LastSync;

const LAST_SYNC_KEY: &str = "last_sync";
const LAST_MASTER_KEY: &str = "last_master_exported_at";

/// Trait for small key/value sync bookkeeping
pub trait SyncMetaRepository {
    /// Load the most recent sync attempt
    fn load_last_sync(&self) -> Result<Option<LastSync>>;

    /// Save the most recent sync attempt
    fn save_last_sync(&self, last_sync: &LastSync) -> Result<()>;

    /// `exportedAt` of the last master snapshot imported or published
    fn load_last_master(&self) -> Result<Option<i64>>;

    /// Remember the `exportedAt` of a master snapshot
    fn save_last_master(&self, exported_at: i64) -> Result<()>;
}

/// `SQLite` implementation of `SyncMetaRepository`
pub struct SqliteSyncMetaRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSyncMetaRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?",
                [key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(error) => {
                    tracing::warn!("Ignoring unreadable sync_meta value for {key}: {error}");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn set_value<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?)",
            params![key, raw],
        )?;
        Ok(())
    }
}

impl SyncMetaRepository for SqliteSyncMetaRepository<'_> {
    fn load_last_sync(&self) -> Result<Option<LastSync>> {
        self.get_value(LAST_SYNC_KEY)
    }

    fn save_last_sync(&self, last_sync: &LastSync) -> Result<()> {
        self.set_value(LAST_SYNC_KEY, last_sync)
    }

    fn load_last_master(&self) -> Result<Option<i64>> {
        self.get_value(LAST_MASTER_KEY)
    }

    fn save_last_master(&self, exported_at: i64) -> Result<()> {
        self.set_value(LAST_MASTER_KEY, &exported_at)
    }
}
