pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "prechat",
    about = "Prechat operator CLI",
    long_about = "Inspect configuration, apply migrations, check readiness and read persisted admission state.",
    after_help = "Examples:\n  prechat doctor --json\n  prechat config\n  prechat migrate --status\n  prechat status"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate {
        #[arg(long, help = "List pending migrations without applying them")]
        status: bool,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, model provider settings, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Show persisted budget, cache, coalescing and throttle state")]
    Status {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate { status } => commands::migrate::run(status),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Status { json } => commands::status::run(json),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
