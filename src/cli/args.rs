//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// imcore - delivery core for an instant-messaging fleet.
#[derive(Parser)]
#[command(name = "imcore")]
#[command(version)]
#[command(about = "IM delivery server and diagnostic tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the delivery server
    Start(StartArgs),

    /// Parse and validate a configuration file without starting
    CheckConfig(CheckConfigArgs),

    /// Decode server-side identifiers
    Inspect(InspectArgs),
}

// -----------------------------------------------------------------------------
// Start command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/imcore.toml")]
    pub config: PathBuf,
}

// -----------------------------------------------------------------------------
// Check-config command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct CheckConfigArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/imcore.toml")]
    pub config: PathBuf,
}

// -----------------------------------------------------------------------------
// Inspect command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct InspectArgs {
    #[command(subcommand)]
    pub action: InspectAction,
}

#[derive(Subcommand)]
pub enum InspectAction {
    /// Decode a snowflake message id into its timestamp, worker and sequence
    Id(IdInspectArgs),
}

#[derive(Args)]
pub struct IdInspectArgs {
    /// Message ids to decode
    #[arg(required = true)]
    pub ids: Vec<u64>,

    /// Emit JSON instead of text
    #[arg(long)]
    pub json: bool,
}
