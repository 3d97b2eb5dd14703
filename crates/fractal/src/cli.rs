//! CLI argument definitions using clap derive macros.

use clap::{Parser, Subcommand};

/// Fractal memory operations CLI
#[derive(Parser, Debug)]
#[command(name = "fractal")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to a JSON configuration file (memory options payload)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply schema migrations up to the latest version
    Migrate,

    /// End-to-end health check: remember, recall, consolidate, stats
    SmokeTest,

    /// Destructive: flush the volatile store and delete all graph nodes
    Reset {
        /// Confirm the destructive reset
        #[arg(long)]
        yes: bool,
    },

    /// Dump per-tier counters
    Inspect {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}
