//! Hostwall CLI
//!
//! Command-line interface for the egress filtering engine.

mod args;
mod commands;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use args::{Args, LogFormat};

/// Exit code for configuration errors.
const EXIT_CONFIG: i32 = 1;
/// Exit code for runtime errors.
const EXIT_RUNTIME: i32 = 2;

fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("error initializing logging: {e:#}");
        std::process::exit(EXIT_RUNTIME);
    }

    if !args.quiet {
        print_banner();
    }

    if let Err(e) = run(args) {
        error!("Fatal error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn run(args: Args) -> Result<()> {
    match args.command {
        commands::Command::Run(run_args) => commands::run::execute(run_args),
        commands::Command::Validate(validate_args) => commands::validate::execute(validate_args),
    }
}

/// Wire up tracing: RUST_LOG wins, otherwise the verbosity flags pick
/// the level. With `--log-file` the file replaces stderr as the sink.
fn init_logging(args: &Args) -> Result<()> {
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let to_file = args.log_file.is_some();
    let sink = match &args.log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot open log file {path}"))?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(sink)
        .with_ansi(!to_file)
        .with_target(args.verbose >= 2);

    match args.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
    }

    Ok(())
}

/// Configuration problems and runtime failures exit differently so
/// wrapper scripts can tell them apart.
fn exit_code(err: &anyhow::Error) -> i32 {
    let config_error = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<hostwall_core::Error>())
        .any(|core| core.is_config());

    if config_error {
        EXIT_CONFIG
    } else {
        EXIT_RUNTIME
    }
}

fn print_banner() {
    use colored::Colorize;

    println!();
    println!(
        "  {} {}",
        "hostwall".green().bold(),
        env!("CARGO_PKG_VERSION").white()
    );
    println!("  {}", "hostname-based egress firewall".white());
    println!();
}
