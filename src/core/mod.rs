//! Core runtime infrastructure.
//!
//! This module contains the essential components for running an imcore server:
//! - `config` - Configuration parsing and validation
//! - `runtime` - Process wiring, startup and drain
//! - `time` - Wall clock and manual clock

pub mod config;
pub mod runtime;
pub mod time;

pub use config::*;
pub use runtime::*;
pub use time::*;
