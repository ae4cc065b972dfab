use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = physio_progress_cli::Cli::parse();

    // Logs go to stderr; stdout carries the JSON contracts.
    let log_level = if cli.verbose() { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    physio_progress_cli::run_cli(cli)
}
