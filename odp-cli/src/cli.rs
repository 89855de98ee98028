use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Operational deployment plan editor")]
pub struct Cli {
    /// Path to the item store (.db/.sqlite for SQLite, .yaml for YAML)
    #[clap(long, global = true)]
    pub db: Option<PathBuf>,

    /// Enable debug logging
    #[clap(long, short = 'v', global = true)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Command,
}

/// Field values for a create, update or validate payload
#[derive(clap::Args, Debug)]
pub struct PayloadArgs {
    /// JSON file holding the payload object
    #[clap(long)]
    pub file: Option<PathBuf>,

    /// Set a field (value parsed as JSON, otherwise taken as a string)
    #[clap(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    /// Full snapshot with version histories
    Json,
    /// Readable summary of current items
    Markdown,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendArg {
    Yaml,
    Sqlite,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a new item
    Create {
        /// Entity kind (requirement, change, wave, service, ...)
        kind: String,

        #[clap(flatten)]
        payload: PayloadArgs,
    },

    /// Update an item; omitted fields keep their current value
    Update {
        /// Item ID
        id: String,

        /// Version ID the update is based on
        #[clap(long)]
        expected: String,

        #[clap(flatten)]
        payload: PayloadArgs,
    },

    /// Show the current version of an item
    Show {
        /// Item ID
        id: String,
    },

    /// Show all versions of an item
    History {
        /// Item ID
        id: String,
    },

    /// List current items
    List {
        /// Only list this kind
        #[clap(long)]
        kind: Option<String>,
    },

    /// Show items as a tree by group, folder and parent
    Tree {
        /// Only include this kind
        #[clap(long)]
        kind: Option<String>,
    },

    /// Validate a payload without saving it
    Validate {
        /// Entity kind
        kind: String,

        /// Validate as an update of this item
        #[clap(long)]
        id: Option<String>,

        #[clap(flatten)]
        payload: PayloadArgs,
    },

    /// Export the store
    Export {
        /// Output file
        #[clap(long, short = 'o')]
        output: PathBuf,

        #[clap(long, value_enum, default_value = "json")]
        format: ExportFormat,
    },

    /// Show the store location and item counts
    Info,

    /// Copy every item and version into another store
    Migrate {
        /// Target store path
        #[clap(long)]
        to: PathBuf,

        /// Target backend (inferred from the extension when omitted)
        #[clap(long, value_enum)]
        backend: Option<BackendArg>,
    },
}
