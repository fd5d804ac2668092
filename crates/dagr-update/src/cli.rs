use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dagr_core::BumpKind;

/// Update, roll back and inspect a Dagr installation.
#[derive(Debug, Parser)]
#[command(name = "dagr-update", version, about, long_about = None)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// Installation root (overrides $PROJECT_DIR)
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Query the release endpoint for a newer version
    Check,

    /// Install the latest release, or the archive at --url
    Update {
        /// Archive to install instead of the latest release
        #[arg(long)]
        url: Option<String>,
    },

    /// Restore the installation from a backup
    Rollback {
        /// Backup name as shown by `backups`
        name: String,
    },

    /// List backups, newest first
    Backups {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the installed version record
    Version,

    /// Bump the installed version marker
    Bump {
        /// major, minor or patch
        kind: BumpKind,

        /// Print the new version without writing it
        #[arg(long)]
        dry_run: bool,
    },
}
