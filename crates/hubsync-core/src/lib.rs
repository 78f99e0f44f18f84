//! hubsync-core - Core library for hubsync
//!
//! This crate contains the replica store, snapshot codec, relay adapters,
//! merge resolver and sync engine shared by every hubsync front end.

pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod merge;
pub mod models;
pub mod pairing;
pub mod relay;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

pub use config::{RelayConfig, RelayCredential, RelayProvider};
pub use error::{Error, ErrorClass, Result};
pub use merge::MergePolicy;
pub use models::{
    DeviceIdentity, DeviceRole, MergeReport, Record, RecordId, Snapshot, SyncConflict, Table,
};
pub use pairing::PairingBundle;
pub use relay::{Relay, RelayBackend, RelayError};
pub use services::ReplicaService;
pub use state::{LastSync, SyncOperation, SyncStatus, SyncStatusHandle};
pub use sync::{InboxEntryRef, SyncEngine};
