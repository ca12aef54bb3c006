//! CLI command implementations for xynet

use clap::{Parser, Subcommand};

use crate::config::CliConfig;
use crate::error::CliResult;

pub mod compile;
pub mod devices;
pub mod verify;

/// xynet - compile part templates into simulator netlists
#[derive(Parser, Debug)]
#[command(
    name = "xynet",
    version,
    about = "Compile hierarchical part templates into Xyce-style netlists",
    long_about = "xynet expands nested part templates into a numbered network of instances, \
                  realizes connections with a seeded random source and writes a flat netlist \
                  describing every instance in the simulator's primitive language."
)]
pub struct XynetCli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile a template into a netlist
    #[command(alias = "build")]
    Compile(compile::CompileCommand),

    /// Check a template without compiling it
    Verify(verify::VerifyCommand),

    /// List device primitives
    Devices(devices::DevicesCommand),
}

impl XynetCli {
    /// Execute the CLI command
    pub async fn execute(self, config: &CliConfig) -> CliResult<()> {
        match self.command {
            Commands::Compile(cmd) => cmd.execute(config).await,
            Commands::Verify(cmd) => cmd.execute().await,
            Commands::Devices(cmd) => cmd.execute().await,
        }
    }
}
