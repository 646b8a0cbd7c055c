//! Validate command - check a configuration file

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use hostwall_core::Config;

/// Validate command arguments
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: String,
}

/// Execute the validate command
pub fn execute(args: ValidateArgs) -> Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    println!(
        "{} {} ({} filter{})",
        "✓".green().bold(),
        "configuration is valid",
        config.filters.len(),
        if config.filters.len() == 1 { "" } else { "s" }
    );

    for filter in &config.filters {
        let mut notes = Vec::new();
        if filter.dns_queue != 0 {
            notes.push(format!("dnsQueue {}", filter.dns_queue));
        }
        if filter.traffic_queue != 0 {
            notes.push(format!("trafficQueue {}", filter.traffic_queue));
        }
        if filter.allow_all_hostnames {
            notes.push("allows all hostnames".to_string());
        } else {
            notes.push(format!(
                "{} allowed hostname(s)",
                filter.allowed_hostnames.len()
            ));
        }
        println!("  {} {}: {}", "-".cyan(), filter.name.bold(), notes.join(", "));
    }

    Ok(())
}
