//! Networking layer.
//!
//! - `wire` - Protobuf envelope and payload schema
//! - `cluster` - Forwarding to peer servers and the group bus
//! - `redis_cluster` - Redis pub/sub transport for both
//! - `dispatch` - Typed handlers behind a bounded dispatch pool
//! - `ingress` - WebSocket accept loop, connection lifecycle and frame loop

pub mod cluster;
pub mod dispatch;
pub mod ingress;
pub mod redis_cluster;
pub mod wire;

pub use cluster::*;
pub use dispatch::*;
pub use ingress::*;
pub use redis_cluster::RedisCluster;
pub use wire::*;
