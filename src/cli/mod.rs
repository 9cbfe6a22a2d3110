//! Command-line interface for fairq.
//!
//! Provides commands for enqueueing, consuming, dead-letter management and
//! holding run locks.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
