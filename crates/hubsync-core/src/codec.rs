//! Snapshot codec.
//!
//! Snapshots travel as UTF-8 JSON. Decoding is all-or-nothing: any malformed
//! blob is reported as [`Error::CorruptData`] before a single record reaches
//! the replica store.

use crate::models::{Snapshot, FORMAT_VERSION};
use crate::{Error, Result};

/// Encode a snapshot to a relay blob.
pub fn encode(snapshot: &Snapshot) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(snapshot)?)
}

/// Decode a relay blob into a snapshot.
pub fn decode(blob: &[u8]) -> Result<Snapshot> {
    if blob.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::CorruptData("snapshot blob is empty".to_string()));
    }

    let snapshot: Snapshot =
        serde_json::from_slice(blob).map_err(|error| Error::CorruptData(error.to_string()))?;

    if snapshot.format_version > FORMAT_VERSION {
        tracing::warn!(
            format_version = snapshot.format_version,
            supported = FORMAT_VERSION,
            "Decoded snapshot written by a newer client; unknown fields are preserved"
        );
    }

    Ok(snapshot)
}
