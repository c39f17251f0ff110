//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flashy")]
#[command(author, version, about = "BMC firmware update agent", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Host configuration file (TOML format)
    /// Defaults to the built-in OpenBMC paths
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one update step
    ///
    /// Exits 0 on success, 42 when the BMC is safe to reboot and retry,
    /// 52 when it is not, and 1 otherwise. Failures are reported on stderr
    /// as {"message": "..."}.
    Run {
        /// Step to run (see `flashy list`)
        step: String,

        /// Flash device, as type:specifier (e.g. mtd:flash0)
        device: String,

        /// Image file
        image: PathBuf,

        /// Don't show progress bars
        #[arg(long)]
        no_progress: bool,

        /// Don't pet the hardware watchdog while flashing
        #[arg(long)]
        no_watchdog: bool,
    },

    /// List update steps and flash device types
    List,

    /// Show vboot enforcement, MTD partitions and mounts
    Status,
}
