use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use hubsync_core::{DeviceRole, RelayProvider};

#[derive(Parser)]
#[command(name = "hubsync")]
#[command(about = "Sync offline record replicas through a hub and a passive cloud relay")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub globals: GlobalArgs,
}

#[derive(Args, Clone, Debug, Default)]
pub struct GlobalArgs {
    /// Optional path to the local replica database
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Device profile to use
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Set up this device as a hub or a spoke
    Init {
        /// Sync role of this device
        #[arg(long, value_enum)]
        role: RoleArg,
        /// Device id (generated when omitted)
        #[arg(long, value_name = "ID")]
        device_id: Option<String>,
        /// Keep current active profile instead of activating this one
        #[arg(long)]
        no_activate: bool,
    },
    /// Configure the relay this device talks to
    Relay {
        #[command(subcommand)]
        command: RelayCommands,
    },
    /// Upload the local replica to the relay inbox (spoke)
    Push,
    /// Import the published master (spoke)
    Pull,
    /// Inspect the relay inbox (hub)
    Inbox {
        #[command(subcommand)]
        command: InboxCommands,
    },
    /// Merge inbox entries into the local replica (hub)
    Merge {
        /// Entry name, e.g. front-desk-1700000000000.json
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        entry: Option<String>,
        /// Merge every pending entry, oldest first
        #[arg(long)]
        all: bool,
    },
    /// Overwrite the master with the local replica (hub)
    Publish,
    /// Hand relay access to spokes
    Pairing {
        #[command(subcommand)]
        command: PairingCommands,
    },
    /// Show device, relay and last sync status
    Status,
    /// Read and write local records
    Record {
        #[command(subcommand)]
        command: RecordCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum RoleArg {
    Hub,
    Spoke,
}

impl From<RoleArg> for DeviceRole {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Hub => Self::Hub,
            RoleArg::Spoke => Self::Spoke,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ProviderArg {
    Drive,
    Webdav,
    S3,
}

impl From<ProviderArg> for RelayProvider {
    fn from(value: ProviderArg) -> Self {
        match value {
            ProviderArg::Drive => Self::Drive,
            ProviderArg::Webdav => Self::WebDav,
            ProviderArg::S3 => Self::S3,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[derive(Subcommand)]
pub enum RelayCommands {
    /// Store relay credentials for this profile in the OS keychain
    Set(RelaySetArgs),
    /// Show the configured relay (secrets redacted)
    Show,
    /// Remove stored relay credentials
    Clear,
}

#[derive(Args, Clone, Debug, Default)]
pub struct RelaySetArgs {
    /// Relay backend
    #[arg(value_enum)]
    pub provider: Option<ProviderArg>,
    /// Folder or key prefix holding the relay layout
    #[arg(long, value_name = "PATH")]
    pub root: Option<String>,
    /// Drive access token
    #[arg(long, value_name = "TOKEN")]
    pub token: Option<String>,
    /// Drive API base URL override
    #[arg(long, value_name = "URL")]
    pub api_url: Option<String>,
    /// Drive content base URL override
    #[arg(long, value_name = "URL")]
    pub content_url: Option<String>,
    /// WebDAV collection URL
    #[arg(long, value_name = "URL")]
    pub url: Option<String>,
    /// WebDAV username
    #[arg(long, value_name = "NAME")]
    pub username: Option<String>,
    /// WebDAV password
    #[arg(long, value_name = "PASSWORD")]
    pub password: Option<String>,
    /// S3 bucket
    #[arg(long, value_name = "NAME")]
    pub bucket: Option<String>,
    /// S3 access key id
    #[arg(long, value_name = "ID")]
    pub access_key_id: Option<String>,
    /// S3 secret access key
    #[arg(long, value_name = "KEY")]
    pub secret_access_key: Option<String>,
    /// R2 account id (derives the endpoint)
    #[arg(long, value_name = "ID")]
    pub account_id: Option<String>,
    /// S3-compatible endpoint URL
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,
    /// Read every value from HUBSYNC_* environment variables instead
    #[arg(long, conflicts_with = "provider")]
    pub from_env: bool,
}

#[derive(Subcommand)]
pub enum InboxCommands {
    /// List pending inbox entries in merge order
    List,
}

#[derive(Subcommand)]
pub enum PairingCommands {
    /// Issue a pairing token for the configured relay (hub)
    Issue,
    /// Show the token issued last (hub)
    Show,
    /// Consume a pairing token and run the initial pull (spoke)
    Consume {
        /// Token starting with hubsync1.
        token: String,
    },
}

#[derive(Subcommand)]
pub enum RecordCommands {
    /// Create or update a record
    Put {
        /// Table name
        table: String,
        /// Record id (a new id is generated when omitted)
        #[arg(long)]
        id: Option<i64>,
        /// Domain fields as a JSON object (read from stdin when omitted)
        fields: Option<String>,
    },
    /// Tombstone a record
    Delete {
        /// Table name
        table: String,
        /// Record id
        id: i64,
    },
    /// List records of a table
    List {
        /// Table name
        table: String,
        /// Include tombstoned records
        #[arg(long)]
        include_deleted: bool,
    },
    /// List tables with record counts
    Tables,
}
