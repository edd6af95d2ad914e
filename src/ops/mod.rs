//! Operations and observability.
//!
//! - `metrics` - Delivery and connection counters in text exposition format
//! - `telemetry` - Tracing setup and the admin HTTP endpoint
//! - `audit` - In-memory audit event ring

pub mod audit;
pub mod metrics;
pub mod telemetry;

pub use metrics::DeliveryMetrics;
pub use telemetry::{init_tracing, LogHandle};
