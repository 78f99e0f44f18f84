//! Database layer for the local replica

mod connection;
mod meta_repository;
mod migrations;
mod repository;

pub use connection::Database;
pub use meta_repository::{SqliteSyncMetaRepository, SyncMetaRepository};
pub use repository::{validate_table_name, RecordRepository, SqliteRecordRepository, TableStats};
