use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] hubsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Secure storage error: {0}")]
    SecretStore(String),
    #[error("Profile '{0}' is not initialized. Run `hubsync init --role hub|spoke` first.")]
    NotInitialized(String),
    #[error(
        "No relay configured for profile '{0}'. Run `hubsync relay set ...`, consume a pairing token, or set HUBSYNC_RELAY_* variables."
    )]
    RelayNotConfigured(String),
    #[error("Invalid record fields: {0}")]
    InvalidFields(String),
    #[error("Record {id} not found in table '{table}'")]
    RecordNotFound { table: String, id: i64 },
    #[error("Missing relay option: {0}")]
    MissingRelayOption(String),
}
