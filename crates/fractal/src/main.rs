//! fractal - operational CLI for the fractal memory system.
//!
//! Exit codes: 0 success, 1 validation failure, 2 dependency unavailable,
//! 3 internal error.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fractal_core::error::Error;

mod cli;
mod commands;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let result = run(&cli).await;
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(exit_code(&e));
    }
}

async fn run(cli: &Cli) -> Result<(), Error> {
    let options = commands::load_options(cli.config.as_deref())?;

    match &cli.command {
        Commands::Migrate => commands::migrate::run(&options),
        Commands::SmokeTest => commands::smoke::run(&options).await,
        Commands::Reset { yes } => commands::reset::run(&options, *yes).await,
        Commands::Inspect { json } => commands::inspect::run(&options, *json).await,
    }
}

fn exit_code(e: &Error) -> i32 {
    match e {
        Error::Validation(_) => 1,
        Error::StoreUnavailable(_) | Error::Database(_) | Error::Io(_) => 2,
        _ => 3,
    }
}
