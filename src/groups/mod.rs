//! Group membership sharding.
//!
//! - `membership` - Membership cache collaborator
//! - `sharding` - Per-server group slices maintained on connect and disconnect
//! - `fanout` - Local delivery of published group messages

pub mod fanout;
pub mod membership;
pub mod sharding;

pub use fanout::*;
pub use membership::*;
pub use sharding::*;
