pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "deckhand",
    about = "Deckhand operator CLI",
    long_about = "Operate the Deckhand proposal service: schema migrations, readiness checks, and config inspection.",
    after_help = "Examples:\n  deckhand migrate\n  deckhand doctor --json\n  deckhand --config config/deckhand.toml config"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a deckhand.toml file")]
    config: Option<PathBuf>,
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
    #[command(about = "Validate config, database connectivity, schema state, and provider credentials")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(config_path),
        Command::Config => commands::config::run(config_path),
        Command::Doctor { json } => commands::doctor::run(config_path, json),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
