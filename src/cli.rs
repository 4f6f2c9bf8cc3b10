//! Command-line interface definitions for vantage.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Local TLS interception proxy that trusts certificates by notary quorum.
///
/// vantage sits between your client and the network. For every HTTPS
/// connection it fetches the destination certificate itself, asks a set of
/// independent notaries whether they see the same certificate, and only then
/// presents the client a certificate it will accept.
#[derive(Parser, Debug)]
#[command(name = "vantage")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Do not write audit events to syslog.
    #[arg(long = "no-syslog", global = true)]
    pub no_syslog: bool,
}

/// Subcommands for vantage.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the proxy.
    Run {
        /// Address to listen on (overrides `proxy.listen`).
        #[arg(long = "listen", value_name = "ADDR")]
        listen: Option<String>,

        /// Upstream proxy, `http://host:port` or `socks5://host:port`
        /// (overrides `proxy.upstream`).
        #[arg(long = "upstream", value_name = "URL")]
        upstream: Option<String>,
    },

    /// Import a notary bundle file.
    #[command(name = "import-bundle")]
    ImportBundle {
        /// Path to the bundle JSON.
        path: PathBuf,
    },

    /// Manage configured notaries.
    #[command(subcommand)]
    Notaries(NotaryCommand),

    /// Manage the fingerprint cache.
    #[command(subcommand)]
    Cache(CacheCommand),

    /// Write the local CA certificate (PEM) so clients can trust it.
    #[command(name = "export-ca")]
    ExportCa {
        /// Output file. Prints to stdout when omitted.
        path: Option<PathBuf>,
    },
}

/// `vantage notaries ...`
#[derive(Subcommand, Debug)]
pub enum NotaryCommand {
    /// List notaries.
    List,
    /// Include a notary in quorums.
    Enable {
        /// Notary name.
        name: String,
    },
    /// Exclude a notary from quorums.
    Disable {
        /// Notary name.
        name: String,
    },
    /// Delete a notary.
    Remove {
        /// Notary name.
        name: String,
    },
}

/// `vantage cache ...`
#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// List cached fingerprints.
    List,
    /// Forget every cached fingerprint.
    Clear,
}

impl Cli {
    /// Listen address given on the command line, if any.
    pub fn listen_override(&self) -> Option<&str> {
        match &self.command {
            Commands::Run { listen, .. } => listen.as_deref(),
            _ => None,
        }
    }

    /// Upstream proxy given on the command line, if any.
    pub fn upstream_override(&self) -> Option<&str> {
        match &self.command {
            Commands::Run { upstream, .. } => upstream.as_deref(),
            _ => None,
        }
    }
}
