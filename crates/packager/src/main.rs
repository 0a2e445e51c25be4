// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! CLI for building and signing autoupdater packages.

use clap::{ArgAction, Parser, Subcommand};

mod build;
mod error;
mod keys;

pub(crate) use error::{Error, Result};

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    Build(build::Options),
    GenerateKey(keys::Options),
}

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Build and sign autoupdater packages and manifests",
    propagate_version(true)
)]
struct Cli {
    /// Enables verbose logging.
    #[clap(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing_subscriber(verbosity: u8) {
    // each -v raises the level; without one, RUST_LOG may lower it
    let level = if verbosity >= 2 {
        tracing::Level::TRACE
    } else if verbosity == 1 {
        tracing::Level::DEBUG
    } else {
        tracing_subscriber::EnvFilter::builder()
            .from_env_lossy()
            .max_level_hint()
            .and_then(|hint| hint.into_level())
            .unwrap_or(tracing::Level::INFO)
    };

    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_target(level >= tracing::Level::DEBUG)
        .with_max_level(level)
        .without_time()
        .compact()
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_subscriber(cli.verbose);

    let result = match cli.command {
        Commands::Build(options) => build::command(options),
        Commands::GenerateKey(options) => keys::command(options),
    };

    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}
