//! Relay adapters.
//!
//! A relay is passive object storage: it stores and serves opaque blobs and
//! runs no logic of its own. Every backend implements [`Relay`] with paths
//! relative to the configured root, so callers only ever see the fixed layout
//! below.

use std::fmt;

use thiserror::Error;

use crate::config::{RelayConfig, RelayCredential};
use crate::Result;

mod drive;
mod http;
mod memory;
mod s3;
mod webdav;

pub use drive::DriveRelay;
pub use memory::MemoryRelay;
pub use s3::{endpoint_url as s3_endpoint_url, S3Relay};
pub use webdav::WebDavRelay;

/// Published master snapshot.
pub const MASTER_PATH: &str = "master.json";
/// Prefix of staged spoke submissions.
pub const INBOX_PREFIX: &str = "inbox/";
/// Active pairing token.
pub const PAIRING_PATH: &str = "pairing/active.txt";

/// Result alias for relay calls.
pub type RelayResult<T> = std::result::Result<T, RelayError>;

/// Classified relay failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Credentials rejected; the device must be re-paired
    #[error("Relay rejected the credentials: {0}")]
    Unauthorized(String),

    /// Object does not exist
    #[error("Relay object not found: {0}")]
    NotFound(String),

    /// Network failure, timeout or rate limiting
    #[error("Relay temporarily unavailable: {0}")]
    Transient(String),

    /// Anything else
    #[error("Relay error: {0}")]
    Unknown(String),
}

/// Discriminant of [`RelayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayErrorKind {
    Unauthorized,
    NotFound,
    Transient,
    Unknown,
}

impl RelayError {
    pub const fn kind(&self) -> RelayErrorKind {
        match self {
            Self::Unauthorized(_) => RelayErrorKind::Unauthorized,
            Self::NotFound(_) => RelayErrorKind::NotFound,
            Self::Transient(_) => RelayErrorKind::Transient,
            Self::Unknown(_) => RelayErrorKind::Unknown,
        }
    }

    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Classify an HTTP status shared by every HTTP backend.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::Unauthorized(message),
            404 => Self::NotFound(message),
            408 | 425 | 429 | 500..=599 => Self::Transient(message),
            _ => Self::Unknown(message),
        }
    }
}

/// Relay call, used for logging and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelayOperation {
    Put,
    Get,
    List,
    Delete,
}

impl fmt::Display for RelayOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Put => "put",
            Self::Get => "get",
            Self::List => "list",
            Self::Delete => "delete",
        })
    }
}

/// Uniform blob storage contract.
///
/// `put` overwrites and `delete` of a missing object succeeds, so both are
/// idempotent. `list` returns the objects directly inside the prefix's folder
/// whose names start with the rest of the prefix.
#[allow(async_fn_in_trait)]
pub trait Relay {
    /// Store a blob, replacing any existing object
    async fn put(&self, path: &str, blob: Vec<u8>) -> RelayResult<()>;

    /// Fetch a blob
    async fn get(&self, path: &str) -> RelayResult<Vec<u8>>;

    /// Object paths under a prefix, sorted
    async fn list(&self, prefix: &str) -> RelayResult<Vec<String>>;

    /// Remove an object
    async fn delete(&self, path: &str) -> RelayResult<()>;
}

/// Backend selected by the deployment's relay configuration.
#[derive(Debug, Clone)]
pub enum RelayBackend {
    Drive(DriveRelay),
    WebDav(WebDavRelay),
    S3(S3Relay),
    Memory(MemoryRelay),
}

impl RelayBackend {
    /// Build the backend named by a relay configuration.
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let root = config.root_path.as_str();
        let backend = match &config.credential {
            RelayCredential::Drive { .. } => Self::Drive(DriveRelay::new(root, &config.credential)?),
            RelayCredential::WebDav { .. } => {
                Self::WebDav(WebDavRelay::new(root, &config.credential)?)
            }
            RelayCredential::S3 { .. } => Self::S3(S3Relay::new(root, &config.credential)?),
        };
        tracing::debug!(
            "Using {} relay rooted at '{root}'",
            config.credential.provider()
        );
        Ok(backend)
    }
}

impl Relay for RelayBackend {
    async fn put(&self, path: &str, blob: Vec<u8>) -> RelayResult<()> {
        match self {
            Self::Drive(relay) => relay.put(path, blob).await,
            Self::WebDav(relay) => relay.put(path, blob).await,
            Self::S3(relay) => relay.put(path, blob).await,
            Self::Memory(relay) => relay.put(path, blob).await,
        }
    }

    async fn get(&self, path: &str) -> RelayResult<Vec<u8>> {
        match self {
            Self::Drive(relay) => relay.get(path).await,
            Self::WebDav(relay) => relay.get(path).await,
            Self::S3(relay) => relay.get(path).await,
            Self::Memory(relay) => relay.get(path).await,
        }
    }

    async fn list(&self, prefix: &str) -> RelayResult<Vec<String>> {
        match self {
            Self::Drive(relay) => relay.list(prefix).await,
            Self::WebDav(relay) => relay.list(prefix).await,
            Self::S3(relay) => relay.list(prefix).await,
            Self::Memory(relay) => relay.list(prefix).await,
        }
    }

    async fn delete(&self, path: &str) -> RelayResult<()> {
        match self {
            Self::Drive(relay) => relay.delete(path).await,
            Self::WebDav(relay) => relay.delete(path).await,
            Self::S3(relay) => relay.delete(path).await,
            Self::Memory(relay) => relay.delete(path).await,
        }
    }
}

/// Normalize an object path relative to the root: no leading slash, no empty
/// or dot segments.
pub fn normalize_object_path(path: &str) -> RelayResult<String> {
    let mut segments = Vec::new();
    for segment in path.trim().split('/') {
        match segment.trim() {
            "" => {}
            "." | ".." => {
                return Err(RelayError::Unknown(format!(
                    "Relay path '{path}' may not contain '.' or '..' segments"
                )))
            }
            segment => segments.push(segment),
        }
    }
    if segments.is_empty() {
        return Err(RelayError::Unknown("Relay path cannot be empty".to_string()));
    }
    Ok(segments.join("/"))
}

/// Join the root path and a relative object path.
fn join_root(root: &str, path: &str) -> String {
    if root.is_empty() {
        path.to_string()
    } else {
        format!("{root}/{path}")
    }
}

/// Split a list prefix into its directory and the remaining name prefix.
fn split_prefix(prefix: &str) -> (&str, &str) {
    let prefix = prefix.trim_start_matches('/');
    prefix
        .rfind('/')
        .map_or(("", prefix), |index| (&prefix[..index], &prefix[index + 1..]))
}
