//! hubsync CLI - hub and spoke record sync from the command line
//!
//! Every sync operation is user-triggered and runs to completion before the
//! process exits.

mod cli;
mod commands;
mod config_profiles;
mod error;
mod secret_store;

use clap::Parser;

use crate::cli::{Cli, Commands, InboxCommands};
use crate::commands::completions::run_completions;
use crate::commands::init::run_init;
use crate::commands::pairing::run_pairing;
use crate::commands::record::run_record;
use crate::commands::relay_cmd::run_relay;
use crate::commands::status::run_status;
use crate::commands::sync::{run_inbox_list, run_merge, run_publish, run_pull, run_push};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hubsync=info".parse().expect("static directive is valid")),
        )
        .init();

    let cli = Cli::parse();
    let globals = cli.globals;

    match cli.command {
        Commands::Init {
            role,
            device_id,
            no_activate,
        } => run_init(role.into(), device_id.as_deref(), no_activate, &globals).await?,
        Commands::Relay { command } => run_relay(command, &globals)?,
        Commands::Push => run_push(&globals).await?,
        Commands::Pull => run_pull(&globals).await?,
        Commands::Inbox {
            command: InboxCommands::List,
        } => run_inbox_list(&globals).await?,
        Commands::Merge { entry, all } => run_merge(entry.as_deref(), all, &globals).await?,
        Commands::Publish => run_publish(&globals).await?,
        Commands::Pairing { command } => run_pairing(command, &globals).await?,
        Commands::Status => run_status(&globals).await?,
        Commands::Record { command } => run_record(command, &globals).await?,
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref())?,
    }

    Ok(())
}
