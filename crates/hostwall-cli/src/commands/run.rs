//! Run command - start the filtering engine

use std::sync::mpsc;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use hostwall_core::{Config, FilterManager, SystemResolver};

/// Run command arguments
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: String,
}

/// Execute the run command
pub fn execute(args: RunArgs) -> Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;
    info!(
        filters = config.filters.len(),
        ipv6 = config.ipv6,
        "Loaded configuration"
    );

    let resolver =
        Arc::new(SystemResolver::from_system_conf().context("Failed to create resolver")?);

    let mut manager =
        FilterManager::start(&config, resolver).context("Failed to start filters")?;

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("Failed to set signal handler")?;

    info!("hostwall started");
    let _ = stop_rx.recv();

    info!("stopping");
    manager.stop();

    Ok(())
}
