use hubsync_core::config::DEFAULT_ROOT_PATH;
use hubsync_core::util::normalize_text_option;
use hubsync_core::{RelayConfig, RelayCredential, RelayProvider};
use serde::Serialize;

use crate::cli::{GlobalArgs, RelayCommands, RelaySetArgs};
use crate::commands::common::{load_profiles, print_json, resolve_relay_config};
use crate::error::CliError;
use crate::secret_store::RelayConfigStore;

/// Relay configuration without secrets.
#[derive(Debug, Serialize)]
pub struct RelaySummary {
    pub provider: RelayProvider,
    pub root_path: String,
    pub location: String,
}

impl RelaySummary {
    pub fn new(config: &RelayConfig) -> Self {
        let location = match &config.credential {
            RelayCredential::Drive { api_url, .. } => api_url
                .clone()
                .unwrap_or_else(|| "Dropbox API".to_string()),
            RelayCredential::WebDav { url, username, .. } => format!("{username} @ {url}"),
            RelayCredential::S3 {
                bucket,
                account_id,
                endpoint,
                ..
            } => endpoint
                .clone()
                .or_else(|| account_id.as_ref().map(|id| format!("R2 account {id}")))
                .map_or_else(|| bucket.clone(), |host| format!("{bucket} @ {host}")),
        };
        Self {
            provider: config.provider(),
            root_path: config.root_path.clone(),
            location,
        }
    }
}

pub fn run_relay(command: RelayCommands, globals: &GlobalArgs) -> Result<(), CliError> {
    match command {
        RelayCommands::Set(args) => run_relay_set(&args, globals),
        RelayCommands::Show => run_relay_show(globals),
        RelayCommands::Clear => run_relay_clear(globals),
    }
}

fn run_relay_set(args: &RelaySetArgs, globals: &GlobalArgs) -> Result<(), CliError> {
    let mut config = load_profiles()?;
    let profile_name = config.resolve_profile_name(globals.profile.as_deref());
    let profile = config
        .profile_mut(&profile_name)
        .ok_or_else(|| CliError::NotInitialized(profile_name.clone()))?;

    let relay_config = if args.from_env {
        RelayConfig::from_env()?.ok_or_else(|| {
            CliError::MissingRelayOption("no HUBSYNC_RELAY_* variables are set".to_string())
        })?
    } else {
        relay_config_from_args(args)?
    };

    RelayConfigStore::new(&profile_name).save(&relay_config)?;
    profile.relay_provider = Some(relay_config.provider());
    config.save().map_err(CliError::Config)?;

    let summary = RelaySummary::new(&relay_config);
    if globals.json {
        return print_json(&summary);
    }
    println!(
        "Stored {} relay for profile '{profile_name}' rooted at '{}'",
        summary.provider, summary.root_path
    );
    Ok(())
}

fn run_relay_show(globals: &GlobalArgs) -> Result<(), CliError> {
    let config = load_profiles()?;
    let profile_name = config.resolve_profile_name(globals.profile.as_deref());
    let summary = RelaySummary::new(&resolve_relay_config(&profile_name)?);
    if globals.json {
        return print_json(&summary);
    }
    println!("Provider: {}", summary.provider);
    println!("Root:     {}", summary.root_path);
    println!("Location: {}", summary.location);
    Ok(())
}

fn run_relay_clear(globals: &GlobalArgs) -> Result<(), CliError> {
    let mut config = load_profiles()?;
    let profile_name = config.resolve_profile_name(globals.profile.as_deref());
    RelayConfigStore::new(&profile_name).clear()?;
    if let Some(profile) = config.profile_mut(&profile_name) {
        profile.relay_provider = None;
        config.save().map_err(CliError::Config)?;
    }
    println!("Cleared relay credentials for profile '{profile_name}'");
    Ok(())
}

/// Build a relay configuration from `relay set` options.
pub fn relay_config_from_args(args: &RelaySetArgs) -> Result<RelayConfig, CliError> {
    let provider = args
        .provider
        .map(RelayProvider::from)
        .ok_or_else(|| CliError::MissingRelayOption("provider (drive, webdav or s3)".to_string()))?;
    let required = |value: &Option<String>, flag: &str| {
        normalize_text_option(value.clone())
            .ok_or_else(|| CliError::MissingRelayOption(format!("--{flag}")))
    };
    let optional = |value: &Option<String>| normalize_text_option(value.clone());

    let credential = match provider {
        RelayProvider::Drive => RelayCredential::Drive {
            access_token: required(&args.token, "token")?,
            api_url: optional(&args.api_url),
            content_url: optional(&args.content_url),
        },
        RelayProvider::WebDav => RelayCredential::WebDav {
            url: required(&args.url, "url")?,
            username: required(&args.username, "username")?,
            password: args.password.clone().unwrap_or_default(),
        },
        RelayProvider::S3 => RelayCredential::S3 {
            bucket: required(&args.bucket, "bucket")?,
            access_key_id: required(&args.access_key_id, "access-key-id")?,
            secret_access_key: required(&args.secret_access_key, "secret-access-key")?,
            account_id: optional(&args.account_id),
            endpoint: optional(&args.endpoint),
        },
    };

    let config = RelayConfig::new(
        args.root.as_deref().unwrap_or(DEFAULT_ROOT_PATH),
        credential,
    );
    config.validate()?;
    Ok(config)
}
