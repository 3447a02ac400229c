pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "renewdesk",
    about = "RenewDesk operator CLI",
    long_about = "Apply session-store migrations, inspect effective configuration, run readiness \
                  checks, and sweep expired renewal sessions.",
    after_help = "Examples:\n  renewdesk config\n  renewdesk smoke\n  renewdesk purge"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Run a renewal session round trip against the configured store")]
    Smoke,
    #[command(about = "Delete expired sessions and index entries from the SQLite store")]
    Purge,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Smoke => commands::smoke::run(),
        Command::Purge => commands::purge::run(),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
