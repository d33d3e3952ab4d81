//! Command-line interface for quotaflow.
//!
//! Provides commands for running batches, managing stored credentials,
//! checking item files, and inspecting configuration.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
