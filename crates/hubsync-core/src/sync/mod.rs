//! Hub and spoke synchronization.
//!
//! Spokes push their replica to the relay inbox and pull the master. The hub
//! merges inbox entries into its own replica and publishes it as the new
//! master. Every operation is user-triggered; nothing retries on its own.

mod engine;
mod inbox;

pub use engine::{IssuedPairing, MergedEntry, Paired, PublishedMaster, SyncEngine};
pub use inbox::{collect_entries, inbox_entry_path, InboxEntryRef};
