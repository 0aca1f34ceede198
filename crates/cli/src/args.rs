use std::path::PathBuf;

use clap::{Parser, Subcommand};
use spanbackup_engine::VolumeSpec;

#[derive(Debug, Parser)]
#[command(name = "spanbackup", version, about = "Back up directories across a series of storage volumes")]
pub struct Cli {
    /// TOML config file.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Prepare a directory to receive backups.
    Init {
        dir: PathBuf,
        /// Accept a directory that already holds a catalog.
        #[arg(long)]
        reuse: bool,
    },
    /// Start a backup, or resume one from its run log.
    Backup {
        #[arg(short = 'b', long = "backup", value_name = "DIR", required = true)]
        sources: Vec<PathBuf>,
        #[arg(short = 's', long = "storage", value_name = "VOL[:SIZE]", required = true)]
        volumes: Vec<VolumeSpec>,
        #[arg(short = 'r', long = "resume-using", value_name = "RUNLOG")]
        resume: Option<PathBuf>,
    },
    /// List the file transactions recorded on a volume.
    Transactions {
        dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Totals for a volume.
    Summary {
        dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Show a run log.
    Log {
        run_log: PathBuf,
        #[arg(long)]
        json: bool,
    },
}
