use hubsync_core::relay::RelayBackend;
use hubsync_core::{SyncEngine, SyncStatusHandle};
use serde::Serialize;

use crate::cli::{GlobalArgs, PairingCommands};
use crate::commands::common::{
    format_report_lines, load_profiles, open_device, open_engine, print_json,
    recover_interrupted_sync,
};
use crate::commands::relay_cmd::RelaySummary;
use crate::error::CliError;
use crate::secret_store::RelayConfigStore;

#[derive(Debug, Serialize)]
struct IssuedOutput<'a> {
    token: &'a str,
    issued_at: i64,
    relay: RelaySummary,
}

pub async fn run_pairing(command: PairingCommands, globals: &GlobalArgs) -> Result<(), CliError> {
    match command {
        PairingCommands::Issue => run_pairing_issue(globals).await,
        PairingCommands::Show => run_pairing_show(globals).await,
        PairingCommands::Consume { token } => run_pairing_consume(&token, globals).await,
    }
}

async fn run_pairing_issue(globals: &GlobalArgs) -> Result<(), CliError> {
    let device = open_device(globals)?;
    let (engine, config) = open_engine(&device).await?;
    let issued = engine.issue_pairing(&config).await?;

    if globals.json {
        return print_json(&IssuedOutput {
            token: &issued.token,
            issued_at: issued.bundle.issued_at,
            relay: RelaySummary::new(&config),
        });
    }
    eprintln!("Anyone holding this token gets the same relay access as this hub.");
    println!("{}", issued.token);
    Ok(())
}

async fn run_pairing_show(globals: &GlobalArgs) -> Result<(), CliError> {
    let device = open_device(globals)?;
    let (engine, _) = open_engine(&device).await?;
    match engine.active_pairing().await? {
        Some(token) if globals.json => print_json(&serde_json::json!({ "token": token })),
        Some(token) => {
            println!("{token}");
            Ok(())
        }
        None if globals.json => print_json(&serde_json::json!({ "token": null })),
        None => {
            println!("No pairing token has been issued.");
            Ok(())
        }
    }
}

async fn run_pairing_consume(token: &str, globals: &GlobalArgs) -> Result<(), CliError> {
    let device = open_device(globals)?;
    recover_interrupted_sync(&device.replica).await?;

    let paired = SyncEngine::<RelayBackend>::pair(
        token,
        device.replica.clone(),
        device.identity.clone(),
        SyncStatusHandle::new(),
    )
    .await?;

    RelayConfigStore::new(&device.profile_name).save(&paired.config)?;
    let mut profiles = load_profiles()?;
    if let Some(profile) = profiles.profile_mut(&device.profile_name) {
        profile.relay_provider = Some(paired.config.provider());
        profiles.save().map_err(CliError::Config)?;
    }

    if globals.json {
        return print_json(&serde_json::json!({
            "relay": RelaySummary::new(&paired.config),
            "initialPull": paired.initial_pull,
        }));
    }
    println!(
        "Paired profile '{}' with {} relay",
        device.profile_name,
        paired.config.provider()
    );
    match &paired.initial_pull {
        Some(report) => {
            for line in format_report_lines(report) {
                println!("{line}");
            }
        }
        None => println!("The hub has not published a master yet."),
    }
    Ok(())
}
