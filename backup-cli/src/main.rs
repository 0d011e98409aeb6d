//! stack-backup - Main entry point
//!
//! Tiered backup, verification and restore of the stack's state. Meant to be
//! invoked by cron (`stack-backup backup daily`) and by operators.

mod cli;
mod commands;
mod docker;
mod logger;

use backup_engine::{BackupError, Config};
use clap::Parser;
use cli::Cli;
use std::io;
use std::process::ExitCode;

const EXIT_USAGE: u8 = 2;

fn main() -> ExitCode {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("stack-backup: {}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = logger::init(log_level) {
        eprintln!("stack-backup: failed to initialize logging: {}", e);
    }

    tracing::debug!("stack-backup v{}", env!("CARGO_PKG_VERSION"));

    let stdout = io::stdout();
    let stdin = io::stdin();
    match commands::run(cli.command, &config, &mut stdout.lock(), &mut stdin.lock()) {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<BackupError>() {
        Some(BackupError::Config(_)) => EXIT_USAGE,
        _ => 1,
    }
}
