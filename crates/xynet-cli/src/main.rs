//! # xynet CLI
//!
//! Compiles hierarchical part templates into Xyce-style netlists.

use clap::Parser;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use xynet_cli::config::CliConfig;
use xynet_cli::error::CliResult;
use xynet_cli::XynetCli;

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = XynetCli::parse();
    let config = CliConfig::load(cli.config.as_deref());

    // RUST_LOG wins, then --verbose, then the configured level
    let level = match (&config, cli.verbose) {
        (_, true) => "debug".to_string(),
        (Ok(c), false) => c.log_level.clone().unwrap_or_else(|| "info".to_string()),
        (Err(_), false) => "info".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = match config {
        Ok(c) => c,
        Err(err) => {
            error!("Failed to load configuration: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = cli.execute(&config).await {
        error!("Command failed: {}", err);
        std::process::exit(1);
    }

    Ok(())
}
