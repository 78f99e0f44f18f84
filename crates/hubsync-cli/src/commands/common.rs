use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};

use chrono::Utc;
use hubsync_core::models::{ConflictCause, DiscardedSide};
use hubsync_core::relay::RelayBackend;
use hubsync_core::{
    DeviceIdentity, MergeReport, Record, RelayConfig, ReplicaService, SyncConflict, SyncEngine,
};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::cli::GlobalArgs;
use crate::config_profiles::{DeviceProfile, DeviceProfilesConfig};
use crate::error::CliError;
use crate::secret_store::RelayConfigStore;

/// Everything a command needs about the selected device profile.
#[derive(Debug)]
pub struct DeviceContext {
    pub profile_name: String,
    pub profile: DeviceProfile,
    pub identity: DeviceIdentity,
    pub replica: ReplicaService,
}

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub id: i64,
    pub last_modified: i64,
    pub last_modified_iso: String,
    pub deleted: bool,
    pub fields: Map<String, Value>,
}

pub fn load_profiles() -> Result<DeviceProfilesConfig, CliError> {
    DeviceProfilesConfig::load().map_err(CliError::Config)
}

pub fn open_device(globals: &GlobalArgs) -> Result<DeviceContext, CliError> {
    let config = load_profiles()?;
    let profile_name = config.resolve_profile_name(globals.profile.as_deref());
    let profile = config
        .profile(&profile_name)
        .cloned()
        .ok_or_else(|| CliError::NotInitialized(profile_name.clone()))?;
    let identity = profile.identity()?;
    let db_path = resolve_db_path(
        globals.db_path.clone(),
        &profile_name,
        profile.db_path.as_deref(),
    )?;
    let replica = ReplicaService::open_path(db_path, &identity.device_id)?;

    Ok(DeviceContext {
        profile_name,
        profile,
        identity,
        replica,
    })
}

/// Relay configuration for a profile: keychain first, then environment.
pub fn resolve_relay_config(profile_name: &str) -> Result<RelayConfig, CliError> {
    if let Some(config) = RelayConfigStore::new(profile_name).load()? {
        return Ok(config);
    }
    RelayConfig::from_env()?.ok_or_else(|| CliError::RelayNotConfigured(profile_name.to_string()))
}

pub async fn open_engine(
    context: &DeviceContext,
) -> Result<(SyncEngine<RelayBackend>, RelayConfig), CliError> {
    let config = resolve_relay_config(&context.profile_name)?;
    let relay = RelayBackend::from_config(&config)?;
    recover_interrupted_sync(&context.replica).await?;
    let engine = SyncEngine::new(relay, context.replica.clone(), context.identity.clone());
    Ok((engine, config))
}

pub async fn recover_interrupted_sync(replica: &ReplicaService) -> Result<(), CliError> {
    if let Some(recovered) = replica.recover_interrupted_sync().await? {
        eprintln!(
            "Previous {} started {} was interrupted; local replica is unchanged.",
            recovered.operation,
            format_sync_timestamp(recovered.started_at)
        );
    }
    Ok(())
}

pub fn resolve_db_path(
    cli_db_path: Option<PathBuf>,
    profile_name: &str,
    profile_db_path: Option<&Path>,
) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path
        .or_else(|| env::var_os("HUBSYNC_DB_PATH").map(PathBuf::from))
        .or_else(|| profile_db_path.map(Path::to_path_buf))
    {
        return Ok(path);
    }
    default_db_path(profile_name)
}

pub fn default_db_path(profile_name: &str) -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("hubsync").join(format!("{profile_name}.db")))
        .ok_or_else(|| CliError::Config("Failed to resolve CLI data directory".to_string()))
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn format_report_lines(report: &MergeReport) -> Vec<String> {
    let mut lines = report
        .tables
        .iter()
        .map(|(table, counts)| {
            format!(
                "{table:<20}  +{} added  ~{} updated  x{} tombstoned  ={} unchanged",
                counts.added, counts.updated, counts.tombstoned, counts.unchanged
            )
        })
        .collect::<Vec<_>>();
    lines.extend(report.conflicts.iter().map(format_conflict_line));
    lines.push(report.summary());
    lines
}

pub fn format_conflict_line(conflict: &SyncConflict) -> String {
    let side = match conflict.discarded_side {
        DiscardedSide::Local => "local",
        DiscardedSide::Incoming => "incoming",
    };
    let cause = match conflict.cause {
        ConflictCause::NewerTimestamp => "older",
        ConflictCause::TieBreak => "tie-break",
    };
    format!(
        "conflict  {}/{}  discarded {side} version ({cause}) lastModified={} kept={}  {}",
        conflict.table,
        conflict.record_id,
        conflict.discarded_last_modified(),
        conflict.kept_last_modified,
        preview(&fields_json(&conflict.discarded.fields), 60)
    )
}

pub fn format_record_lines(records: &[Record]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let relative_time = format_relative_time(record.last_modified, now_ms);
            let marker = if record.is_deleted() { "deleted" } else { "" };
            format!(
                "{:<20}  {relative_time:<10}  {marker:<7}  {}",
                record.id,
                preview(&fields_json(&record.fields), 60)
            )
        })
        .collect()
}

pub fn record_to_list_item(record: &Record) -> RecordListItem {
    RecordListItem {
        id: record.id.value(),
        last_modified: record.last_modified,
        last_modified_iso: format_sync_timestamp(record.last_modified),
        deleted: record.is_deleted(),
        fields: record.fields.clone(),
    }
}

fn fields_json(fields: &Map<String, Value>) -> String {
    Value::Object(fields.clone()).to_string()
}

pub fn preview(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

/// Parse record fields given as a JSON object.
pub fn parse_fields(raw: &str) -> Result<Map<String, Value>, CliError> {
    let value = serde_json::from_str::<Value>(raw.trim())
        .map_err(|error| CliError::InvalidFields(error.to_string()))?;
    match value {
        Value::Object(fields) => Ok(fields),
        other => Err(CliError::InvalidFields(format!(
            "expected a JSON object, got {}",
            preview(&other.to_string(), 40)
        ))),
    }
}

pub fn resolve_fields(argument: Option<&str>) -> Result<Map<String, Value>, CliError> {
    if let Some(raw) = argument.and_then(normalize_content) {
        return parse_fields(&raw);
    }
    if let Some(raw) = read_piped_stdin()? {
        return parse_fields(&raw);
    }
    Err(CliError::InvalidFields(
        "pass a JSON object argument or pipe one on stdin".to_string(),
    ))
}

pub fn normalize_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_content(&buffer))
}
