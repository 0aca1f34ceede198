use std::io;

use anyhow::Result;
use clap::Parser;
use spanbackup::args::{Cli, Command};
use spanbackup::commands;
use spanbackup::config::{load_config, Config, Settings};
use spanbackup::prompt::ConsoleOperator;
use spanbackup_engine::RunOutcome;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    let settings = Settings::resolve(&cfg)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_filter)),
        )
        .with_writer(io::stderr)
        .init();

    let mut out = io::stdout().lock();
    match cli.command {
        Command::Init { dir, reuse } => {
            commands::init(&dir, reuse, &mut out)?;
        }
        Command::Backup { sources, volumes, resume } => {
            let outcome = commands::backup(
                &settings,
                cli.config.as_deref(),
                &sources,
                volumes,
                resume.as_deref(),
                ConsoleOperator::stdio(),
                &mut out,
            )?;
            if !matches!(outcome, RunOutcome::Completed { .. }) {
                std::process::exit(2);
            }
        }
        Command::Transactions { dir, json } => commands::transactions(&dir, json, &mut out)?,
        Command::Summary { dir, json } => commands::summary(&dir, json, &mut out)?,
        Command::Log { run_log, json } => commands::log(&run_log, json, &mut out)?,
    }
    Ok(())
}
