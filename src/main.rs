//! Setfarm CLI entry point
//!
//! A thin composition layer: parse CLI arguments, resolve the state
//! directory and settings, initialize logging, route the command, and map
//! fatal errors to exit codes.

use clap::Parser;

use setfarm::app::{handle_fatal_error, init_logging, AppConfig};
use setfarm::cli::{execute_command, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match AppConfig::new(cli.verbose) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(e) = execute_command(cli.command, &config).await {
        handle_fatal_error(e, cli.verbose);
    }
}
