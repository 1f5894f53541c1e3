//! webfleet - supervised multi-process web server

mod cli;
mod config;
mod error;
mod logging;
mod routes;
mod server;
mod supervisor;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::{Cli, Commands, ServeArgs};
use config::{FileConfig, ServerConfig};

/// Program entry point: parses CLI arguments, sets up logging, dispatches the
/// selected command and prints the error chain on failure.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    logging::init(logging::LogConfig::from_verbosity(cli.verbosity()).with_env_overrides());
    logging::install_panic_hook();

    let result = match &cli.command {
        Commands::Serve(args) => cmd_serve(&cli, args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Start the supervisor, or a single worker when run with `--internal-worker`.
///
/// Both roles resolve the configuration the same way, so a worker sees exactly
/// what its supervisor saw.
fn cmd_serve(cli: &Cli, args: &ServeArgs) -> Result<()> {
    let file = FileConfig::load(&cli.config)?;
    let config = ServerConfig::resolve(file, args)?;

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;

    if args.internal_worker {
        rt.block_on(server::run_worker(config))?;
    } else {
        let worker_args = std::env::args_os().skip(1).collect();
        rt.block_on(supervisor::run(config, worker_args))?;
    }

    Ok(())
}
