//! Admission control.
//!
//! - `limiter` - Connect-time IP block list, global, per-IP and connect-rate ceilings
//! - `flow` - Per-frame size and rate limits with throttle cooldown

pub mod flow;
pub mod limiter;

pub use flow::*;
pub use limiter::*;
