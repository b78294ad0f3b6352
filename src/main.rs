//! mailqueue CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.
//! Logs go to stderr so admin commands can print JSON on stdout.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = mailqueue::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level CLI arg (scoped to this crate)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_directive()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    mailqueue::cli::run_with_cli(cli).await
}
