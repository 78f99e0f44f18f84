//! Device-wide sync status.
//!
//! Each device runs at most one sync operation at a time. The status moves
//! `Idle -> Syncing -> {Success, Error}` and returns to `Idle` once the caller
//! acknowledges the outcome. Requests made while the status is not `Idle` are
//! rejected rather than queued.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Unified sync state shown to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Success,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Success => "success",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// User-triggered sync operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Push,
    Pull,
    Merge,
    Publish,
    IssuePairing,
    ConsumePairing,
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Merge => "merge",
            Self::Publish => "publish",
            Self::IssuePairing => "issue-pairing",
            Self::ConsumePairing => "consume-pairing",
        };
        f.write_str(label)
    }
}

/// Persisted record of the most recent sync attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSync {
    pub operation: SyncOperation,
    pub status: SyncStatus,
    /// Unix ms when the attempt started.
    pub started_at: i64,
    /// Unix ms when the attempt finished, if it did.
    #[serde(default)]
    pub finished_at: Option<i64>,
    /// Error text or a short outcome summary.
    #[serde(default)]
    pub message: Option<String>,
}

impl LastSync {
    pub const fn started(operation: SyncOperation, started_at: i64) -> Self {
        Self {
            operation,
            status: SyncStatus::Syncing,
            started_at,
            finished_at: None,
            message: None,
        }
    }

    #[must_use]
    pub fn finished(mut self, status: SyncStatus, finished_at: i64, message: Option<String>) -> Self {
        self.status = status;
        self.finished_at = Some(finished_at);
        self.message = message;
        self
    }

    /// Whether this attempt never recorded an outcome (process died mid-sync).
    pub const fn is_interrupted(&self) -> bool {
        matches!(self.status, SyncStatus::Syncing)
    }
}

/// Shared handle over the live sync status.
///
/// Cloning the handle shares the same state; UI layers call
/// [`SyncStatusHandle::subscribe`] to observe transitions.
#[derive(Clone, Debug)]
pub struct SyncStatusHandle {
    tx: Arc<watch::Sender<SyncStatus>>,
}

impl Default for SyncStatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatusHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::Idle);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> SyncStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Move `Idle -> Syncing`. Returns the blocking status otherwise.
    ///
    /// The returned guard settles the status; dropping it unfinished (a
    /// cancelled or panicking operation) leaves `Error`.
    pub(crate) fn try_begin(&self) -> Result<InFlight<'_>, SyncStatus> {
        let mut blocking = SyncStatus::Idle;
        let started = self.tx.send_if_modified(|status| {
            if *status == SyncStatus::Idle {
                *status = SyncStatus::Syncing;
                true
            } else {
                blocking = *status;
                false
            }
        });

        if started {
            Ok(InFlight {
                handle: self,
                settled: false,
            })
        } else {
            Err(blocking)
        }
    }

    /// Return a finished `Success`/`Error` status to `Idle`.
    ///
    /// Returns `false` when there was nothing to acknowledge.
    pub fn acknowledge(&self) -> bool {
        self.tx.send_if_modified(|status| {
            if matches!(status, SyncStatus::Success | SyncStatus::Error) {
                *status = SyncStatus::Idle;
                true
            } else {
                false
            }
        })
    }
}

/// The in-flight operation holding a [`SyncStatusHandle`] in `Syncing`.
#[derive(Debug)]
pub(crate) struct InFlight<'a> {
    handle: &'a SyncStatusHandle,
    settled: bool,
}

impl InFlight<'_> {
    pub(crate) fn finish(mut self, succeeded: bool) {
        self.settle(if succeeded {
            SyncStatus::Success
        } else {
            SyncStatus::Error
        });
    }

    fn settle(&mut self, outcome: SyncStatus) {
        self.settled = true;
        self.handle.tx.send_replace(outcome);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!("Sync operation ended without finishing; marking it failed");
            self.settle(SyncStatus::Error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_is_rejected_while_not_idle() {
        let status = SyncStatusHandle::new();
        let attempt = status.try_begin().unwrap();
        assert_eq!(status.try_begin().err(), Some(SyncStatus::Syncing));

        attempt.finish(true);
        assert_eq!(status.current(), SyncStatus::Success);
        assert_eq!(status.try_begin().err(), Some(SyncStatus::Success));

        assert!(status.acknowledge());
        status.try_begin().unwrap().finish(true);
    }

    #[test]
    fn acknowledge_ignores_idle_and_syncing() {
        let status = SyncStatusHandle::new();
        assert!(!status.acknowledge());
        let _attempt = status.try_begin().unwrap();
        assert!(!status.acknowledge());
        assert_eq!(status.current(), SyncStatus::Syncing);
    }

    #[test]
    fn subscribers_observe_transitions() {
        let status = SyncStatusHandle::new();
        let mut rx = status.subscribe();
        let attempt = status.try_begin().unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), SyncStatus::Syncing);
        attempt.finish(false);
        assert_eq!(*rx.borrow_and_update(), SyncStatus::Error);
    }

    #[test]
    fn dropped_attempt_settles_as_error() {
        let status = SyncStatusHandle::new();
        drop(status.try_begin().unwrap());
        assert_eq!(status.current(), SyncStatus::Error);

        assert!(status.acknowledge());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _attempt = status.try_begin().unwrap();
            panic!("operation blew up");
        }));
        assert!(result.is_err());
        assert_eq!(status.current(), SyncStatus::Error);
    }

    #[test]
    fn last_sync_marks_interrupted_attempts() {
        let started = LastSync::started(SyncOperation::Pull, 10);
        assert!(started.is_interrupted());
        let done = started.finished(SyncStatus::Success, 20, None);
        assert!(!done.is_interrupted());
        assert_eq!(done.finished_at, Some(20));
    }
}
