//! Command-line interface for env-forge.
//!
//! Provides the batch `run` command, standalone validation of an artifact
//! pair, and memory-pool inspection.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
