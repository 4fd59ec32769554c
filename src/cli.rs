//! Command-line interface definitions for webproxy.
//!
//! Uses clap's derive API for type-safe argument parsing. Running without a
//! subcommand starts the proxy; the management subcommands talk to a running
//! proxy over its control socket.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Caching HTTP/HTTPS forward proxy with a runtime block list.
#[derive(Parser, Debug)]
#[command(name = "webproxy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run (or omit to start the proxy).
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address to listen on (overrides `proxy.listen`).
    #[arg(short = 'l', long = "listen", value_name = "ADDR")]
    pub listen: Option<String>,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Block a host, `host/path` prefix or `*.domain` pattern (repeatable).
    #[arg(short = 'b', long = "block", value_name = "PATTERN")]
    pub block: Vec<String>,

    /// Explicitly allow a pattern (repeatable).
    #[arg(short = 'a', long = "allow", value_name = "PATTERN")]
    pub allow: Vec<String>,

    /// Disable the response cache.
    #[arg(long = "no-cache")]
    pub no_cache: bool,

    /// Do not send audit events to syslog.
    #[arg(long = "no-audit")]
    pub no_audit: bool,

    /// Control socket path (overrides `control.socket_path`).
    #[arg(short = 's', long = "socket", value_name = "PATH", global = true)]
    pub socket: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands for webproxy.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start the proxy (the default when no subcommand is given).
    Serve,

    /// Block a pattern on the running proxy.
    Block {
        /// Host, `host/path` prefix, or `*.domain` pattern.
        pattern: String,
    },

    /// Remove a block rule from the running proxy.
    Unblock {
        /// Pattern previously passed to `block`.
        pattern: String,
    },

    /// Add an allow rule, e.g. to carve an exception out of a wildcard block.
    Allow {
        /// Host, `host/path` prefix, or `*.domain` pattern.
        pattern: String,
    },

    /// Remove any rule with this pattern.
    Remove {
        /// Rule pattern.
        pattern: String,
    },

    /// List the active rules.
    Rules,

    /// Inspect or purge the response cache.
    Cache {
        /// Cache operation.
        #[command(subcommand)]
        action: CacheCommand,
    },
}

/// Cache management operations.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCommand {
    /// Show cache statistics.
    Stats,
    /// Drop every cached response.
    Purge,
}

impl Cli {
    /// Whether this invocation starts the proxy.
    pub fn is_serve(&self) -> bool {
        matches!(self.command, None | Some(Commands::Serve))
    }
}
