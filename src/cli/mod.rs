//! Command-line interface for pqueue-fetcher.
//!
//! Provides commands for running simulation scenarios and printing the
//! effective configuration.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
