//! imcore - unified CLI entrypoint.
//!
//! Usage:
//!   imcore start --config config/imcore.toml
//!   imcore check-config --config config/imcore.toml
//!   imcore inspect id <id>...

use anyhow::Result;
use clap::Parser;
use imcore::cli::commands::{run_check_config, run_inspect, run_start};
use imcore::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::CheckConfig(args) => run_check_config(args),
        Commands::Inspect(args) => run_inspect(args),
    }
}
