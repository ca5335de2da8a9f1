//! Device onboarding test rig
//!
//! Runs one provisioning-and-capture pass against the device attached to
//! the configured serial console and prints a structured report.

use std::path::Path;

use clap::Parser;

use onboard_rig::commands::Commands;
use onboard_rig::common::{config::Config, logging, Error, Result};
use onboard_rig::rig::HostRig;
use onboard_rig::run::{Run, RunOptions};

#[derive(Parser)]
#[command(name = "onboard-rig", about = "Device onboarding test rig")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::Run { log_file, .. } => log_file.clone(),
        _ => None,
    };
    // The guard keeps the background log writer alive until exit
    let _guard = match logging::init(log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { config, output, .. } => run_once(config.as_deref(), output.as_deref()).await,
        Commands::Config { config } => show_config(config.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Perform one run and emit the report as JSON
async fn run_once(config: Option<&Path>, output: Option<&Path>) -> Result<()> {
    let config = Config::load(config)?;
    tracing::info!(
        device = %config.device.serial,
        direct = %config.direct_wifi.netif,
        infra = %config.infra_wifi.netif,
        "starting run"
    );

    let rig = HostRig::new(config.clone());
    let report = Run::new(config, Box::new(rig))
        .run(RunOptions::default())
        .await?;

    let json = serde_json::to_string_pretty(&report)?;
    match output {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{json}"),
    }
    Ok(())
}

/// Print the configuration as the rig resolved it
fn show_config(path: Option<&Path>) -> Result<()> {
    let config = Config::load(path)?;
    let toml = toml::to_string_pretty(&config).map_err(|e| Error::Internal(e.to_string()))?;
    print!("{toml}");
    Ok(())
}
