use hubsync_core::db::TableStats;
use hubsync_core::{DeviceRole, LastSync, RelayProvider, SyncStatus};
use serde::Serialize;

use crate::cli::GlobalArgs;
use crate::commands::common::{format_sync_timestamp, open_device, print_json, recover_interrupted_sync};
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct StatusOutput {
    profile: String,
    device_id: String,
    role: DeviceRole,
    relay_provider: Option<RelayProvider>,
    db_path: Option<String>,
    status: SyncStatus,
    last_sync: Option<LastSync>,
    last_master_at: Option<i64>,
    tables: Vec<TableStats>,
}

pub async fn run_status(globals: &GlobalArgs) -> Result<(), CliError> {
    let device = open_device(globals)?;
    recover_interrupted_sync(&device.replica).await?;

    let last_sync = device.replica.last_sync().await?;
    let output = StatusOutput {
        profile: device.profile_name.clone(),
        device_id: device.identity.device_id.clone(),
        role: device.identity.role,
        relay_provider: device.profile.relay_provider,
        db_path: device
            .replica
            .db_path()
            .map(|path| path.display().to_string()),
        // Each CLI invocation runs one operation to completion.
        status: SyncStatus::Idle,
        last_sync,
        last_master_at: device.replica.last_master().await?,
        tables: device.replica.table_stats().await?,
    };

    if globals.json {
        return print_json(&output);
    }

    println!("Profile:  {} ({} {})", output.profile, output.role, output.device_id);
    let relay = output.relay_provider.map_or_else(
        || "not stored (HUBSYNC_RELAY_* env)".to_string(),
        |provider| provider.to_string(),
    );
    println!("Relay:    {relay}");
    if let Some(path) = &output.db_path {
        println!("Replica:  {path}");
    }
    match &output.last_sync {
        Some(last) => {
            println!(
                "Last sync: {} {} at {}",
                last.operation,
                last.status,
                format_sync_timestamp(last.finished_at.unwrap_or(last.started_at))
            );
            if let Some(message) = &last.message {
                println!("           {message}");
            }
        }
        None => println!("Last sync: never"),
    }
    if let Some(exported_at) = output.last_master_at {
        println!("Master:   {}", format_sync_timestamp(exported_at));
    }
    for stats in &output.tables {
        println!(
            "  {:<20}  {} live  {} tombstoned",
            stats.table, stats.live, stats.tombstoned
        );
    }
    Ok(())
}
