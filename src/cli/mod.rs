//! Command-line interface for mailqueue.
//!
//! Provides commands for running the queue and administering failed mail.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
