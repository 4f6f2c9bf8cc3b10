//! vantage: local TLS interception proxy with notary-quorum trust
//!
//! This is the main entry point for the vantage binary. It handles CLI argument
//! parsing, configuration loading and telemetry initialization, then hands the
//! subcommand to the command handler.
//!
//! # I/O Architecture
//!
//! - **Audit logging**: Goes to syslog (not stdout/stderr), one JSON event per
//!   trust decision, tunnel and notary change
//! - **Debug logging**: `tracing` to stderr, filtered by `-v` or `RUST_LOG`
//! - **stdout**: Reserved for command output (`notaries list`, `export-ca`)

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, warn};
use vantage::{cli::Cli, cli_handler, config::ConfigLoader, telemetry::AuditLogger};

fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    init_tracing(cli.verbose)?;

    debug!("Parsed CLI arguments: {:?}", cli);

    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    debug!("Loaded configuration: {:?}", config);

    let audit = Arc::new(init_audit(cli.no_syslog));

    cli_handler::handle_command(&cli.command, &config, audit)
}

/// Open the syslog audit trail, degrading to a null logger when syslog is
/// unavailable or disabled.
fn init_audit(no_syslog: bool) -> AuditLogger {
    if no_syslog {
        return AuditLogger::new_null();
    }
    match AuditLogger::new() {
        Ok(logger) => logger,
        Err(e) => {
            warn!("Audit logging disabled: {}", e);
            AuditLogger::new_null()
        }
    }
}

/// Initialize the tracing subscriber for debug/development logging.
///
/// This is separate from the audit telemetry which goes to syslog.
///
/// # Verbosity Levels
/// - 0 (default): Only warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
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
