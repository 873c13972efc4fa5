//! Columba CLI library
//!
//! Command-line driver for the Columba service. Sessions run against the
//! simulated engine and in-memory relay store from `columba-harness`.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use config::{CliAppConfig, SimulationConfig};
pub use error::{CliError, Result};
