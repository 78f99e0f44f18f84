use hubsync_core::{DeviceIdentity, DeviceRole, ReplicaService};
use serde::Serialize;

use crate::cli::GlobalArgs;
use crate::commands::common::{load_profiles, print_json, resolve_db_path};
use crate::config_profiles::DeviceProfile;
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct InitOutput<'a> {
    profile: &'a str,
    device_id: &'a str,
    role: DeviceRole,
    db_path: String,
    config_path: String,
}

pub async fn run_init(
    role: DeviceRole,
    device_id: Option<&str>,
    no_activate: bool,
    globals: &GlobalArgs,
) -> Result<(), CliError> {
    let mut config = load_profiles()?;
    let profile_name = config.resolve_profile_name(globals.profile.as_deref());

    let existing = config.profile(&profile_name).cloned();
    let identity = match (device_id, existing.as_ref()) {
        (Some(device_id), _) => DeviceIdentity::new(device_id, role)?,
        (None, Some(profile)) => DeviceIdentity::new(&profile.device_id, role)?,
        (None, None) => DeviceIdentity::generate(role),
    };

    let mut profile = existing.unwrap_or_else(|| DeviceProfile::new(&identity));
    if profile.device_id != identity.device_id {
        tracing::warn!(
            "Profile '{profile_name}' changes device id from {} to {}",
            profile.device_id,
            identity.device_id
        );
    }
    profile.device_id.clone_from(&identity.device_id);
    profile.role = identity.role;
    if globals.db_path.is_some() {
        profile.db_path.clone_from(&globals.db_path);
    }

    let db_path = resolve_db_path(
        globals.db_path.clone(),
        &profile_name,
        profile.db_path.as_deref(),
    )?;
    let replica = ReplicaService::open_path(&db_path, &identity.device_id)?;
    replica.recover_interrupted_sync().await?;

    config.profiles.insert(profile_name.clone(), profile);
    if !no_activate || config.active_profile.is_none() {
        config.active_profile = Some(profile_name.clone());
    }
    config.version = 1;
    let config_path = config.save().map_err(CliError::Config)?;

    if globals.json {
        return print_json(&InitOutput {
            profile: &profile_name,
            device_id: &identity.device_id,
            role: identity.role,
            db_path: db_path.display().to_string(),
            config_path: config_path.display().to_string(),
        });
    }

    println!(
        "Profile '{profile_name}' is a {} device with id {}",
        identity.role, identity.device_id
    );
    println!("Replica: {}", db_path.display());
    println!("Config:  {}", config_path.display());
    Ok(())
}
