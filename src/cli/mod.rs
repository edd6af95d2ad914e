//! imcore CLI - unified command-line interface.
//!
//! Provides a single binary entry point for:
//! - `imcore start` - Start the delivery server
//! - `imcore check-config` - Validate a configuration file
//! - `imcore inspect id` - Decode snowflake message ids

mod args;
pub mod commands;

pub use args::{
    CheckConfigArgs, Cli, Commands, IdInspectArgs, InspectAction, InspectArgs, StartArgs,
};
