//! CLI command implementations.

mod check;
mod inspect;
mod start;

pub use check::run_check_config;
pub use inspect::run_inspect;
pub use start::run_start;
