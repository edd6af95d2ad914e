//! Connection registry and fleet presence.
//!
//! - `registry` - Per-process user → connection table
//! - `routing` - Shared route/status records and route resolution

pub mod registry;
pub mod routing;

pub use registry::*;
pub use routing::*;
