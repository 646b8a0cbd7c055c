//! CLI subcommands

pub mod run;
pub mod validate;

use clap::Subcommand;

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start filtering packets
    Run(run::RunArgs),
    /// Check a configuration file and exit
    Validate(validate::ValidateArgs),
}
