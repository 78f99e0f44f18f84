//! Inbox entry naming.

use serde::{Deserialize, Serialize};

use crate::relay::INBOX_PREFIX;
use crate::{Error, Result};

const ENTRY_SUFFIX: &str = ".json";

/// Relay path of the inbox entry a device submits at `submitted_at`.
pub fn inbox_entry_path(device_id: &str, submitted_at: i64) -> String {
    format!("{INBOX_PREFIX}{device_id}-{submitted_at}{ENTRY_SUFFIX}")
}

/// A pending inbox entry, identified by its relay path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxEntryRef {
    pub path: String,
    pub submitter: String,
    /// Unix ms taken from the entry name
    pub submitted_at: i64,
}

impl InboxEntryRef {
    /// Parse a relay path of the form `inbox/{submitter}-{timestampMs}.json`.
    pub fn parse(path: &str) -> Option<Self> {
        let path = path.trim().trim_start_matches('/');
        let name = path.strip_prefix(INBOX_PREFIX)?;
        let stem = name.strip_suffix(ENTRY_SUFFIX)?;
        // Submitter ids may contain dashes; the timestamp never does.
        let (submitter, timestamp) = stem.rsplit_once('-')?;
        if submitter.is_empty() || submitter.contains('/') {
            return None;
        }
        let submitted_at = timestamp.parse::<i64>().ok()?;
        Some(Self {
            path: path.to_string(),
            submitter: submitter.to_string(),
            submitted_at,
        })
    }

    /// Resolve a user-supplied entry: either a full relay path or a bare
    /// entry name such as `front-desk-1700000000000.json`.
    pub fn resolve(entry: &str) -> Result<Self> {
        let entry = entry.trim().trim_start_matches('/');
        let path = if entry.starts_with(INBOX_PREFIX) {
            entry.to_string()
        } else if entry.ends_with(ENTRY_SUFFIX) {
            format!("{INBOX_PREFIX}{entry}")
        } else {
            format!("{INBOX_PREFIX}{entry}{ENTRY_SUFFIX}")
        };
        Self::parse(&path).ok_or_else(|| {
            Error::InvalidInput(format!(
                "'{entry}' is not an inbox entry name (expected {{submitter}}-{{timestampMs}}.json)"
            ))
        })
    }
}

/// Parse listed paths into entries ordered by `(submitted_at, submitter)`.
///
/// Objects that do not follow the naming scheme are skipped.
pub fn collect_entries(paths: impl IntoIterator<Item = String>) -> Vec<InboxEntryRef> {
    let mut entries = paths
        .into_iter()
        .filter_map(|path| {
            let entry = InboxEntryRef::parse(&path);
            if entry.is_none() {
                tracing::warn!("Ignoring unexpected object in inbox: {path}");
            }
            entry
        })
        .collect::<Vec<_>>();
    entries.sort_by(|left, right| {
        (left.submitted_at, &left.submitter, &left.path)
            .cmp(&(right.submitted_at, &right.submitter, &right.path))
    });
    entries
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn path_round_trips_through_parse() {
        let path = inbox_entry_path("front-desk", 1_700_000_000_123);
        assert_eq!(path, "inbox/front-desk-1700000000123.json");
        let entry = InboxEntryRef::parse(&path).unwrap();
        assert_eq!(entry.submitter, "front-desk");
        assert_eq!(entry.submitted_at, 1_700_000_000_123);
        assert_eq!(entry.path, path);
    }

    #[test]
    fn parse_rejects_foreign_names() {
        for path in [
            "master.json",
            "inbox/notes.txt",
            "inbox/-12.json",
            "inbox/spoke-abc.json",
            "inbox/nested/spoke-12.json",
        ] {
            assert_eq!(InboxEntryRef::parse(path), None, "{path}");
        }
    }

    #[test]
    fn resolve_accepts_bare_names() {
        let expected = InboxEntryRef::parse("inbox/a-5.json").unwrap();
        assert_eq!(InboxEntryRef::resolve("a-5.json").unwrap(), expected);
        assert_eq!(InboxEntryRef::resolve("a-5").unwrap(), expected);
        assert_eq!(InboxEntryRef::resolve("/inbox/a-5.json").unwrap(), expected);
        assert!(InboxEntryRef::resolve("master").is_err());
    }

    #[test]
    fn entries_sort_by_time_then_submitter() {
        let entries = collect_entries(vec![
            "inbox/zeta-20.json".to_string(),
            "inbox/beta-10.json".to_string(),
            "inbox/readme.md".to_string(),
            "inbox/alpha-20.json".to_string(),
        ]);
        let order = entries
            .iter()
            .map(|entry| entry.path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            order,
            ["inbox/beta-10.json", "inbox/alpha-20.json", "inbox/zeta-20.json"]
        );
    }
}
