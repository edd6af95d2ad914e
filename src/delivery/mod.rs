//! Message delivery.
//!
//! - `ids` - Snowflake message id generator
//! - `pool` - Bounded worker pools with drop-on-full submission
//! - `retry` - Acknowledgement tracking, resend and demotion to offline
//! - `offline` - Offline message and notice store collaborator
//! - `history` - Write-through message history collaborator

pub mod history;
pub mod ids;
pub mod offline;
pub mod pool;
pub mod retry;

pub use history::*;
pub use ids::*;
pub use offline::*;
pub use pool::*;
pub use retry::*;
