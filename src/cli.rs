//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Multi-process web server with a supervised worker pool.
#[derive(Parser, Debug)]
#[command(name = "webfleet")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, env = "WEBFLEET_CONFIG", default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the supervisor and its worker processes.
    Serve(ServeArgs),
}

/// Arguments for the serve command.
#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    /// Force development mode (one worker, memory sessions, request logging).
    #[arg(long)]
    pub dev: bool,

    /// Deployment environment (`production` enables one worker per core).
    #[arg(long = "env", env = "WEBFLEET_ENV")]
    pub environment: Option<String>,

    /// Host address to bind to.
    #[arg(long, env = "WEBFLEET_HOST")]
    pub host: Option<String>,

    /// Port to listen on.
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Number of worker processes (default: one per core in production, one otherwise).
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Run as a worker process (used internally by the supervisor).
    #[arg(long, hide = true)]
    pub internal_worker: bool,
}

/// Verbosity level for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Quiet: errors only.
    Quiet,
    /// Default: warnings and lifecycle events.
    Normal,
    /// -v: include request-level info.
    Info,
    /// -vv: include debug info.
    Debug,
}

impl From<u8> for Verbosity {
    fn from(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            _ => Verbosity::Debug,
        }
    }
}

impl Cli {
    /// Get the verbosity level based on -v/-q flags.
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            Verbosity::from(self.verbose)
        }
    }
}
