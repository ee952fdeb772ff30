use clap::Parser;
use tracing_subscriber::EnvFilter;

use nap::cli::{Cli, execute};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // stdout carries the report, so logs go to stderr
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = execute(cli).await;
    std::process::exit(code);
}
