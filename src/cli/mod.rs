//! Command-line interface for the hodei orchestrator.
//!
//! Provides the `serve` and `config` commands plus the process exit-code
//! mapping.

mod commands;

pub use commands::{exit_codes, parse_cli, run_with_cli, Cli, Command};
