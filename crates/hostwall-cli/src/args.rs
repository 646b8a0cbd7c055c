//! Command-line argument parsing

use clap::{Parser, ValueEnum};

use crate::commands::Command;

/// Hostwall - hostname-based egress firewall
///
/// Restricts outbound traffic to an allow-list of hostnames. Packets
/// are received from NFQUEUE queues populated by operator-installed
/// nftables rules; hostwall inspects them and issues accept or drop
/// verdicts.
#[derive(Parser, Debug)]
#[command(name = "hostwall")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Run in quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format for logs
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Log file path
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<String>,
}

/// Log output format
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text
    Text,
    /// JSON format
    Json,
    /// Compact format
    Compact,
}
