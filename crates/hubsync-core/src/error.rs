//! Error types for hubsync-core

use serde::Serialize;
use thiserror::Error;

use crate::models::{DeviceRole, MergeReport};
use crate::relay::{RelayError, RelayErrorKind};
use crate::state::SyncStatus;

/// Result type alias using hubsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in hubsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record or object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Relay adapter error
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// A snapshot blob failed to decode; nothing was applied
    #[error("Corrupt snapshot data: {0}")]
    CorruptData(String),

    /// A pairing token could not be decoded or is inconsistent
    #[error("Invalid pairing bundle: {0}")]
    InvalidBundle(String),

    /// Another sync operation holds the device's sync slot
    #[error("Another sync operation is not finished (status: {0})")]
    SyncBusy(SyncStatus),

    /// Operation not permitted for this device's role
    #[error("`{operation}` can only run on a {required} device")]
    WrongRole {
        operation: &'static str,
        required: DeviceRole,
    },

    /// Pull requested before the hub published anything
    #[error("No master snapshot has been published yet")]
    MasterNotPublished,

    /// Inbox entry merged locally, but removing it from the relay failed
    #[error("Inbox entry {path} was merged locally but could not be removed from the relay: {source}")]
    InboxCleanup {
        path: String,
        report: Box<MergeReport>,
        #[source]
        source: RelayError,
    },
}

/// Coarse classification used for user-facing messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Credentials are stale or invalid; the device must be re-paired.
    Unauthorized,
    /// Network or rate limiting; retry manually.
    Transient,
    /// A snapshot failed to decode; both replicas were left untouched.
    CorruptData,
    /// The requested object or record does not exist.
    NotFound,
    /// Another sync operation has not finished.
    Busy,
    /// The request was refused before doing any work.
    Rejected,
    /// Local storage or filesystem failure.
    Local,
    /// Anything else.
    Unknown,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Relay(error) | Self::InboxCleanup { source: error, .. } => match error.kind() {
                RelayErrorKind::Unauthorized => ErrorClass::Unauthorized,
                RelayErrorKind::NotFound => ErrorClass::NotFound,
                RelayErrorKind::Transient => ErrorClass::Transient,
                RelayErrorKind::Unknown => ErrorClass::Unknown,
            },
            Self::CorruptData(_) => ErrorClass::CorruptData,
            Self::NotFound(_) | Self::MasterNotPublished => ErrorClass::NotFound,
            Self::SyncBusy(_) => ErrorClass::Busy,
            Self::InvalidInput(_) | Self::InvalidBundle(_) | Self::WrongRole { .. } => {
                ErrorClass::Rejected
            }
            Self::Database(_) | Self::Sqlite(_) | Self::Io(_) | Self::Serialization(_) => {
                ErrorClass::Local
            }
        }
    }

    /// Whether a manual retry of the same operation can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Busy)
    }

    /// Whether the device has to consume a fresh pairing bundle.
    pub fn requires_repairing(&self) -> bool {
        matches!(self.class(), ErrorClass::Unauthorized)
    }
}
