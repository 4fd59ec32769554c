//! webproxy: filtering, caching forward HTTP/HTTPS proxy
//!
//! This is the main entry point for the webproxy binary. It handles CLI
//! argument parsing, configuration loading and logging initialization, then
//! either runs the proxy or sends one management command to a running proxy.
//!
//! # I/O Architecture
//!
//! - **Audit logging**: Goes to syslog (not stdout/stderr)
//! - **Debug logging**: `tracing` output on stderr, level chosen by `-v`,
//!   `RUST_LOG` or `general.log_level`
//! - **Command output**: Management subcommands print results on stdout

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use webproxy::{cli::Cli, cli_handler, config::ConfigLoader, orchestrator};

fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    // Load configuration with hierarchy merging
    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    init_tracing(cli.verbose, &config.general.log_level)?;
    debug!("Parsed CLI arguments: {:?}", cli);
    debug!("Loaded configuration: {:?}", config);

    match &cli.command {
        Some(command) if !cli.is_serve() => {
            cli_handler::handle_command(command, &config.control.socket_path())
        }
        _ => orchestrator::run_proxy(&cli, &config),
    }
}

/// Initialize the tracing subscriber for debug/development logging.
///
/// This is separate from the audit telemetry which goes to syslog.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG` if set, otherwise the configured level
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, configured: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured)),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
