use backup_engine::Tier;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "stack-backup", author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Capture every configured source into a new backup set
    Backup {
        /// daily, weekly or monthly
        tier: Tier,
    },

    /// List backup sets from their manifests
    List {
        /// Only this tier (default: all tiers)
        tier: Option<Tier>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Re-check the archives of a backup set against its manifest
    Verify { id: String, tier: Tier },

    /// Stop services, put a backup set back in place, start services
    Restore {
        id: String,
        tier: Tier,

        /// Skip the interactive confirmation
        #[arg(long)]
        yes: bool,
    },

    /// Run a retention pass for one tier
    Prune { tier: Tier },

    /// Inspect or clear the run lock
    Lock {
        #[command(subcommand)]
        action: LockCommand,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum LockCommand {
    /// Show who holds the run lock
    Status,

    /// Remove a lock left behind by a crashed run
    Clear {
        /// Also remove a lock whose holder is still running
        #[arg(long)]
        force: bool,
    },
}
