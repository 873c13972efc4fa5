//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a simulated session: relays announce, churn, and get selected
    Simulate {
        /// How long to run, in seconds
        #[arg(short, long, default_value_t = 10)]
        duration: u64,
        /// Print application events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Hammer initialize/shutdown and report the settled status
    Cycle {
        /// Number of initialize/shutdown pairs
        #[arg(short = 'n', long, default_value_t = 5)]
        cycles: u32,
    },
    /// Initialize, pin a relay by hand, and show the result
    Relay {
        /// Relay destination (32 hex characters)
        destination: String,
        /// Display name stored with the selection
        #[arg(short, long, default_value = "manual relay")]
        name: String,
    },
    /// Print the effective configuration as TOML
    Config,
}
