//! CLI command definitions
//!
//! Defines the clap commands for the onboarding rig.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Perform one provisioning run against the configured device
    Run {
        /// Path to the rig configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write the run report to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Append the full run log to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Print the resolved configuration
    Config {
        /// Path to the rig configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}
