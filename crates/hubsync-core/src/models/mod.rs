//! Data models for hubsync

mod device;
mod merge_report;
mod record;
mod snapshot;

pub use device::{DeviceIdentity, DeviceRole};
pub use merge_report::{
    ConflictCause, DiscardedSide, MergeReport, RecordOutcome, SyncConflict, TableReport,
};
pub use record::{IdGenerator, Record, RecordId, RESERVED_FIELDS};
pub use snapshot::{DuplicateRecordId, Snapshot, Submission, Table, FORMAT_VERSION};
