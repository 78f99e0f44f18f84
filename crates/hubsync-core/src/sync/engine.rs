//! Push, pull, merge and publish over a relay.

use std::future::Future;

use serde::{Deserialize, Serialize};

use super::inbox::{collect_entries, inbox_entry_path, InboxEntryRef};
use crate::codec;
use crate::config::RelayConfig;
use crate::merge::MergePolicy;
use crate::models::{DeviceIdentity, DeviceRole, MergeReport};
use crate::pairing::PairingBundle;
use crate::relay::{Relay, RelayBackend, INBOX_PREFIX, MASTER_PATH, PAIRING_PATH};
use crate::services::ReplicaService;
use crate::state::{LastSync, SyncOperation, SyncStatus, SyncStatusHandle};
use crate::util::now_millis;
use crate::{Error, Result};

/// Outcome of merging one inbox entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedEntry {
    pub entry: InboxEntryRef,
    pub report: MergeReport,
}

/// Master snapshot written by a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedMaster {
    pub exported_at: i64,
    pub record_count: usize,
}

/// Pairing bundle issued by the hub, with its token form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedPairing {
    pub bundle: PairingBundle,
    pub token: String,
}

/// Result of consuming a pairing token on a spoke.
#[derive(Debug)]
pub struct Paired<R: Relay> {
    pub engine: SyncEngine<R>,
    pub config: RelayConfig,
    /// Report of the initial pull; `None` when the hub has not published yet
    pub initial_pull: Option<MergeReport>,
}

/// Sync engine for one device.
///
/// All operations share the device's [`SyncStatusHandle`]; a request made
/// while another one has not been acknowledged fails with
/// [`Error::SyncBusy`].
#[derive(Debug, Clone)]
pub struct SyncEngine<R: Relay> {
    relay: R,
    replica: ReplicaService,
    identity: DeviceIdentity,
    status: SyncStatusHandle,
}

impl<R: Relay> SyncEngine<R> {
    pub fn new(relay: R, replica: ReplicaService, identity: DeviceIdentity) -> Self {
        Self {
            relay,
            replica,
            identity,
            status: SyncStatusHandle::new(),
        }
    }

    /// Share an existing status handle, e.g. one a UI already observes.
    #[must_use]
    pub fn with_status(mut self, status: SyncStatusHandle) -> Self {
        self.status = status;
        self
    }

    pub const fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub const fn replica(&self) -> &ReplicaService {
        &self.replica
    }

    pub const fn relay(&self) -> &R {
        &self.relay
    }

    pub const fn status(&self) -> &SyncStatusHandle {
        &self.status
    }

    /// Spoke push: upload the local replica as a new inbox entry.
    pub async fn push(&self) -> Result<InboxEntryRef> {
        self.require_role("push", DeviceRole::Spoke)?;
        self.track(SyncOperation::Push, self.push_local(), |entry| {
            format!("Submitted {}", entry.path)
        })
        .await
    }

    /// Spoke pull: import the master, keeping local records that are newer.
    pub async fn pull(&self) -> Result<MergeReport> {
        self.track(SyncOperation::Pull, self.pull_master(), MergeReport::summary)
            .await
    }

    /// Pending inbox entries in merge order.
    pub async fn list_inbox(&self) -> Result<Vec<InboxEntryRef>> {
        self.require_role("inbox list", DeviceRole::Hub)?;
        let paths = self.relay.list(INBOX_PREFIX).await?;
        Ok(collect_entries(paths))
    }

    /// Hub merge of a single inbox entry.
    ///
    /// The entry is removed from the relay only after the local commit.
    pub async fn merge_entry(&self, entry: &InboxEntryRef) -> Result<MergeReport> {
        self.require_role("merge", DeviceRole::Hub)?;
        self.track(SyncOperation::Merge, self.merge_one(entry), MergeReport::summary)
            .await
    }

    /// Hub merge of every pending entry, oldest first. Stops at the first
    /// failing entry; entries merged before it stay merged.
    pub async fn merge_inbox(&self) -> Result<Vec<MergedEntry>> {
        self.require_role("merge", DeviceRole::Hub)?;
        self.track(SyncOperation::Merge, self.merge_all(), |merged| {
            format!("Merged {} inbox entries", merged.len())
        })
        .await
    }

    /// Hub publish: overwrite the master with the hub's replica.
    pub async fn publish(&self) -> Result<PublishedMaster> {
        self.require_role("publish", DeviceRole::Hub)?;
        self.track(SyncOperation::Publish, self.publish_master(), |master| {
            format!("Published {} records", master.record_count)
        })
        .await
    }

    /// Hub: issue a pairing bundle for `config` and store its token on the
    /// relay so another hub session can show it again.
    pub async fn issue_pairing(&self, config: &RelayConfig) -> Result<IssuedPairing> {
        self.require_role("pairing issue", DeviceRole::Hub)?;
        self.track(
            SyncOperation::IssuePairing,
            async {
                let bundle = PairingBundle::new(config, now_millis());
                let token = bundle.encode_token()?;
                self.relay.put(PAIRING_PATH, token.clone().into_bytes()).await?;
                Ok(IssuedPairing { bundle, token })
            },
            |issued| format!("Issued pairing for {} relay", issued.bundle.provider),
        )
        .await
    }

    /// Hub: token stored by the last [`SyncEngine::issue_pairing`], if any.
    pub async fn active_pairing(&self) -> Result<Option<String>> {
        self.require_role("pairing show", DeviceRole::Hub)?;
        let blob = match self.relay.get(PAIRING_PATH).await {
            Ok(blob) => blob,
            Err(error) if error.is_not_found() => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let token = String::from_utf8(blob)
            .map_err(|_| Error::CorruptData(format!("{PAIRING_PATH} is not UTF-8 text")))?;
        Ok(Some(token.trim().to_string()))
    }

    /// Spoke: consume a pairing token, connect to the relay it names and run
    /// the initial pull.
    pub async fn pair_with<F>(
        token: &str,
        replica: ReplicaService,
        identity: DeviceIdentity,
        status: SyncStatusHandle,
        connect: F,
    ) -> Result<Paired<R>>
    where
        F: FnOnce(&RelayConfig) -> Result<R>,
    {
        if identity.role != DeviceRole::Spoke {
            return Err(Error::WrongRole {
                operation: "pairing consume",
                required: DeviceRole::Spoke,
            });
        }
        let config = PairingBundle::decode_token(token)?.into_config()?;
        let relay = connect(&config)?;
        let engine = Self::new(relay, replica, identity).with_status(status);

        let initial_pull = engine
            .track(
                SyncOperation::ConsumePairing,
                async {
                    match engine.pull_master().await {
                        Ok(report) => Ok(Some(report)),
                        Err(Error::MasterNotPublished) => Ok(None),
                        Err(error) => Err(error),
                    }
                },
                |report| {
                    report.as_ref().map_or_else(
                        || "Paired; no master published yet".to_string(),
                        |report| format!("Paired; {}", report.summary()),
                    )
                },
            )
            .await?;

        Ok(Paired {
            engine,
            config,
            initial_pull,
        })
    }

    async fn push_local(&self) -> Result<InboxEntryRef> {
        let snapshot = self.replica.export_snapshot().await?;
        let submitted_at = snapshot.exported_at;
        let records = snapshot.record_count();
        let snapshot = snapshot.submitted(self.identity.device_id.clone(), submitted_at);

        let path = inbox_entry_path(&self.identity.device_id, submitted_at);
        self.relay.put(&path, codec::encode(&snapshot)?).await?;
        tracing::info!("Pushed {records} records to {path}");

        Ok(InboxEntryRef {
            path,
            submitter: self.identity.device_id.clone(),
            submitted_at,
        })
    }

    async fn pull_master(&self) -> Result<MergeReport> {
        let blob = match self.relay.get(MASTER_PATH).await {
            Ok(blob) => blob,
            Err(error) if error.is_not_found() => return Err(Error::MasterNotPublished),
            Err(error) => return Err(error.into()),
        };
        let master = codec::decode(&blob)?;
        let report = self
            .replica
            .import_snapshot(&master, MergePolicy::KeepNewerLocal)
            .await?;
        self.remember_master(master.exported_at).await;
        tracing::info!(
            "Pulled master exported at {}: {}",
            master.exported_at,
            report.summary()
        );
        Ok(report)
    }

    async fn merge_one(&self, entry: &InboxEntryRef) -> Result<MergeReport> {
        let blob = self.relay.get(&entry.path).await?;
        let snapshot = codec::decode(&blob)?;
        if !snapshot.is_inbox_entry() {
            return Err(Error::CorruptData(format!(
                "{} has no submission metadata",
                entry.path
            )));
        }

        let report = self
            .replica
            .import_snapshot(&snapshot, MergePolicy::PreferNewer)
            .await?;

        if let Err(source) = self.relay.delete(&entry.path).await {
            tracing::warn!("Merged {} but could not remove it: {source}", entry.path);
            return Err(Error::InboxCleanup {
                path: entry.path.clone(),
                report: Box::new(report),
                source,
            });
        }

        tracing::info!("Merged {}: {}", entry.path, report.summary());
        if report.has_conflicts() {
            tracing::info!(
                "{} discarded {} conflicting versions",
                entry.path,
                report.conflicts.len()
            );
        }
        Ok(report)
    }

    async fn merge_all(&self) -> Result<Vec<MergedEntry>> {
        let entries = collect_entries(self.relay.list(INBOX_PREFIX).await?);
        let mut merged = Vec::with_capacity(entries.len());
        for entry in entries {
            let report = self.merge_one(&entry).await?;
            merged.push(MergedEntry { entry, report });
        }
        Ok(merged)
    }

    async fn publish_master(&self) -> Result<PublishedMaster> {
        let snapshot = self.replica.export_snapshot().await?;
        self.relay
            .put(MASTER_PATH, codec::encode(&snapshot)?)
            .await?;
        self.remember_master(snapshot.exported_at).await;

        let published = PublishedMaster {
            exported_at: snapshot.exported_at,
            record_count: snapshot.record_count(),
        };
        tracing::info!(
            "Published master with {} records at {}",
            published.record_count,
            published.exported_at
        );
        Ok(published)
    }

    fn require_role(&self, operation: &'static str, required: DeviceRole) -> Result<()> {
        if self.identity.role == required {
            Ok(())
        } else {
            Err(Error::WrongRole {
                operation,
                required,
            })
        }
    }

    /// Run `work` as the device's single in-flight sync operation.
    async fn track<T>(
        &self,
        operation: SyncOperation,
        work: impl Future<Output = Result<T>>,
        describe: impl FnOnce(&T) -> String,
    ) -> Result<T> {
        let in_flight = self.status.try_begin().map_err(Error::SyncBusy)?;

        let attempt = LastSync::started(operation, now_millis());
        self.persist_attempt(&attempt).await;
        tracing::info!("Starting {operation}");

        let result = work.await;
        let (status, message) = match &result {
            Ok(value) => (SyncStatus::Success, describe(value)),
            Err(error) => {
                tracing::warn!("{operation} failed: {error}");
                (SyncStatus::Error, error.to_string())
            }
        };
        self.persist_attempt(&attempt.finished(status, now_millis(), Some(message)))
            .await;
        in_flight.finish(result.is_ok());
        result
    }

    /// Bookkeeping after the replica or relay already changed; never fails
    /// the operation.
    async fn remember_master(&self, exported_at: i64) {
        if let Err(error) = self.replica.save_last_master(exported_at).await {
            tracing::warn!("Failed to record master exported at {exported_at}: {error}");
        }
    }

    async fn persist_attempt(&self, attempt: &LastSync) {
        if let Err(error) = self.replica.save_last_sync(attempt).await {
            tracing::warn!("Failed to record {} status: {error}", attempt.operation);
        }
    }
}

impl SyncEngine<RelayBackend> {
    /// Spoke: consume a pairing token against the relay backend it names.
    pub async fn pair(
        token: &str,
        replica: ReplicaService,
        identity: DeviceIdentity,
        status: SyncStatusHandle,
    ) -> Result<Paired<RelayBackend>> {
        Self::pair_with(token, replica, identity, status, RelayBackend::from_config).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map, Value};

    use super::*;
    use crate::config::RelayCredential;
    use crate::models::{Record, RecordId, Snapshot};
    use crate::relay::{MemoryRelay, RelayError, RelayOperation};

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn engine(relay: &MemoryRelay, device_id: &str, role: DeviceRole) -> SyncEngine<MemoryRelay> {
        SyncEngine::new(
            relay.clone(),
            ReplicaService::open_in_memory(device_id).unwrap(),
            DeviceIdentity::new(device_id, role).unwrap(),
        )
    }

    fn relay_config() -> RelayConfig {
        RelayConfig::new(
            "school",
            RelayCredential::Drive {
                access_token: "tok".to_string(),
                api_url: None,
                content_url: None,
            },
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn push_writes_annotated_inbox_entry() {
        let relay = MemoryRelay::new();
        let spoke = engine(&relay, "front-desk", DeviceRole::Spoke);
        spoke
            .replica()
            .create("students", fields(json!({"name": "Ayu"})))
            .await
            .unwrap();

        let entry = spoke.push().await.unwrap();
        assert_eq!(entry.submitter, "front-desk");
        assert_eq!(spoke.status().current(), SyncStatus::Success);

        let snapshot = codec::decode(&relay.object(&entry.path).unwrap()).unwrap();
        let submission = snapshot.submission.as_ref().unwrap();
        assert_eq!(submission.submitted_by, "front-desk");
        assert_eq!(submission.submitted_at, entry.submitted_at);
        assert_eq!(snapshot.record_count(), 1);
        assert!(relay.object(MASTER_PATH).is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn operations_enforce_roles_without_touching_status() {
        let relay = MemoryRelay::new();
        let hub = engine(&relay, "hub", DeviceRole::Hub);
        let spoke = engine(&relay, "spoke", DeviceRole::Spoke);

        assert!(matches!(hub.push().await, Err(Error::WrongRole { .. })));
        assert!(matches!(spoke.publish().await, Err(Error::WrongRole { .. })));
        assert!(matches!(spoke.list_inbox().await, Err(Error::WrongRole { .. })));
        assert!(matches!(
            spoke.issue_pairing(&relay_config()).await,
            Err(Error::WrongRole { .. })
        ));
        assert_eq!(hub.status().current(), SyncStatus::Idle);
        assert_eq!(spoke.status().current(), SyncStatus::Idle);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unacknowledged_outcome_rejects_next_request() {
        let relay = MemoryRelay::new();
        let spoke = engine(&relay, "spoke", DeviceRole::Spoke);
        spoke.push().await.unwrap();

        let error = spoke.push().await.unwrap_err();
        assert!(matches!(error, Error::SyncBusy(SyncStatus::Success)));

        assert!(spoke.status().acknowledge());
        spoke.push().await.unwrap();
    }

    /// Relay whose calls never complete.
    #[derive(Debug, Clone, Copy)]
    struct StalledRelay;

    impl Relay for StalledRelay {
        async fn put(&self, _path: &str, _blob: Vec<u8>) -> crate::relay::RelayResult<()> {
            std::future::pending().await
        }

        async fn get(&self, _path: &str) -> crate::relay::RelayResult<Vec<u8>> {
            std::future::pending().await
        }

        async fn list(&self, _prefix: &str) -> crate::relay::RelayResult<Vec<String>> {
            std::future::pending().await
        }

        async fn delete(&self, _path: &str) -> crate::relay::RelayResult<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancelled_operation_settles_as_error() {
        let spoke = SyncEngine::new(
            StalledRelay,
            ReplicaService::open_in_memory("spoke").unwrap(),
            DeviceIdentity::new("spoke", DeviceRole::Spoke).unwrap(),
        );

        {
            let mut pull = std::pin::pin!(spoke.pull());
            tokio::select! {
                biased;
                _ = &mut pull => panic!("stalled pull completed"),
                () = tokio::task::yield_now() => {}
            }
            assert_eq!(spoke.status().current(), SyncStatus::Syncing);
        }

        assert_eq!(spoke.status().current(), SyncStatus::Error);
        assert!(spoke.status().acknowledge());
        let last = spoke.replica().last_sync().await.unwrap().unwrap();
        assert!(last.is_interrupted());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn pull_succeeds_when_master_bookkeeping_fails() {
        let relay = MemoryRelay::new();
        let hub = engine(&relay, "hub", DeviceRole::Hub);
        hub.replica()
            .create("students", fields(json!({"name": "Ayu"})))
            .await
            .unwrap();
        hub.publish().await.unwrap();

        let spoke = engine(&relay, "spoke", DeviceRole::Spoke);
        spoke
            .replica()
            .execute_batch(
                "CREATE TRIGGER reject_last_master BEFORE INSERT ON sync_meta
                 WHEN NEW.key = 'last_master_exported_at'
                 BEGIN SELECT RAISE(ABORT, 'sync_meta rejected'); END;",
            )
            .await
            .unwrap();

        let report = spoke.pull().await.unwrap();
        assert_eq!(report.table("students").added, 1);
        assert_eq!(spoke.status().current(), SyncStatus::Success);
        assert_eq!(spoke.replica().list_live("students").await.unwrap().len(), 1);
        assert_eq!(spoke.replica().last_master().await.unwrap(), None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn pull_before_publish_reports_missing_master() {
        let relay = MemoryRelay::new();
        let spoke = engine(&relay, "spoke", DeviceRole::Spoke);
        let error = spoke.pull().await.unwrap_err();
        assert!(matches!(error, Error::MasterNotPublished));
        assert_eq!(spoke.status().current(), SyncStatus::Error);

        let last = spoke.replica().last_sync().await.unwrap().unwrap();
        assert_eq!(last.operation, SyncOperation::Pull);
        assert_eq!(last.status, SyncStatus::Error);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn corrupt_entry_stays_in_inbox_and_replica_is_untouched() {
        let relay = MemoryRelay::new();
        relay.insert("inbox/spoke-5.json", b"{ not json".to_vec());
        let hub = engine(&relay, "hub", DeviceRole::Hub);

        let entries = hub.list_inbox().await.unwrap();
        let error = hub.merge_entry(&entries[0]).await.unwrap_err();
        assert!(matches!(error, Error::CorruptData(_)));
        assert!(relay.object("inbox/spoke-5.json").is_some());
        assert!(hub.replica().list_tables().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn merge_rejects_entry_without_submission() {
        let relay = MemoryRelay::new();
        relay.insert(
            "inbox/spoke-5.json",
            codec::encode(&Snapshot::new(5)).unwrap(),
        );
        let hub = engine(&relay, "hub", DeviceRole::Hub);
        let entry = InboxEntryRef::resolve("spoke-5").unwrap();
        assert!(matches!(
            hub.merge_entry(&entry).await,
            Err(Error::CorruptData(_))
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_cleanup_keeps_merged_report() {
        let relay = MemoryRelay::new();
        let mut snapshot = Snapshot::new(10).submitted("spoke", 10);
        snapshot.table_mut("students").upsert(Record::new(
            RecordId::new(1),
            10,
            fields(json!({"name": "Ayu"})),
        ));
        relay.insert("inbox/spoke-10.json", codec::encode(&snapshot).unwrap());
        relay.fail_next(
            RelayOperation::Delete,
            RelayError::Transient("503".to_string()),
        );

        let hub = engine(&relay, "hub", DeviceRole::Hub);
        let entry = InboxEntryRef::resolve("spoke-10.json").unwrap();
        match hub.merge_entry(&entry).await.unwrap_err() {
            Error::InboxCleanup { path, report, .. } => {
                assert_eq!(path, "inbox/spoke-10.json");
                assert_eq!(report.table("students").added, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(hub.replica().get_all("students").await.unwrap().len(), 1);

        // A retry re-merges the same entry without changing anything.
        hub.status().acknowledge();
        let report = hub.merge_entry(&entry).await.unwrap();
        assert_eq!(report.changed_count(), 0);
        assert!(relay.object(&entry.path).is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn issued_pairing_is_stored_and_consumable() {
        let relay = MemoryRelay::new();
        let hub = engine(&relay, "hub", DeviceRole::Hub);
        assert_eq!(hub.active_pairing().await.unwrap(), None);

        let issued = hub.issue_pairing(&relay_config()).await.unwrap();
        assert_eq!(hub.active_pairing().await.unwrap(), Some(issued.token.clone()));
        hub.status().acknowledge();
        hub.publish().await.unwrap();

        let paired = SyncEngine::pair_with(
            &issued.token,
            ReplicaService::open_in_memory("spoke").unwrap(),
            DeviceIdentity::new("spoke", DeviceRole::Spoke).unwrap(),
            SyncStatusHandle::new(),
            |config| {
                assert_eq!(config, &relay_config());
                Ok(relay.clone())
            },
        )
        .await
        .unwrap();
        assert_eq!(paired.config, relay_config());
        assert!(paired.initial_pull.is_some());
        assert_eq!(paired.engine.status().current(), SyncStatus::Success);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn pairing_before_first_publish_succeeds_without_pull() {
        let relay = MemoryRelay::new();
        let token = PairingBundle::new(&relay_config(), 1).encode_token().unwrap();
        let paired = SyncEngine::pair_with(
            &token,
            ReplicaService::open_in_memory("spoke").unwrap(),
            DeviceIdentity::new("spoke", DeviceRole::Spoke).unwrap(),
            SyncStatusHandle::new(),
            |_| Ok(relay.clone()),
        )
        .await
        .unwrap();
        assert_eq!(paired.initial_pull, None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn invalid_token_is_rejected_before_connecting() {
        let result = SyncEngine::<MemoryRelay>::pair_with(
            "hubsync1.garbage!",
            ReplicaService::open_in_memory("spoke").unwrap(),
            DeviceIdentity::new("spoke", DeviceRole::Spoke).unwrap(),
            SyncStatusHandle::new(),
            |_| panic!("must not connect"),
        )
        .await;
        assert!(matches!(result, Err(Error::InvalidBundle(_))));
    }
}
