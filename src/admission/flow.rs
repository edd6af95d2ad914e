use crate::audit;
use crate::config::FlowControlConfig;
use crate::store::{keys, SharedStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowViolation {
    /// The source is inside a throttle cooldown.
    Throttled,
    MessageTooLarge { size: i64, max: i64 },
    MessageRate { count: i64, max: i64 },
    ByteRate { bytes: i64, max: i64 },
}

impl FlowViolation {
    pub fn label(&self) -> &'static str {
        match self {
            FlowViolation::Throttled => "throttled",
            FlowViolation::MessageTooLarge { .. } => "message_too_large",
            FlowViolation::MessageRate { .. } => "message_rate",
            FlowViolation::ByteRate { .. } => "byte_rate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDecision {
    Allow,
    /// Silently discard the frame; the connection stays open.
    Drop(FlowViolation),
}

impl FlowDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, FlowDecision::Allow)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FlowStats {
    pub ip: String,
    pub messages_in_window: i64,
    pub bytes_in_window: i64,
    pub throttled: bool,
}

/// Per-source inbound frame limits, windowed at one second across the fleet.
///
/// Any breach throttles the source address for the configured cooldown. Counter failures
/// let the frame through.
#[derive(Clone)]
pub struct FlowController {
    store: Arc<dyn SharedStore>,
    config: FlowControlConfig,
}

impl FlowController {
    pub fn new(store: Arc<dyn SharedStore>, config: FlowControlConfig) -> Self {
        Self { store, config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn check_frame(&self, ip: &str, size: usize) -> FlowDecision {
        if !self.config.enabled {
            return FlowDecision::Allow;
        }
        match self.evaluate(ip, size as i64).await {
            Ok(FlowDecision::Allow) => FlowDecision::Allow,
            Ok(FlowDecision::Drop(FlowViolation::Throttled)) => {
                FlowDecision::Drop(FlowViolation::Throttled)
            }
            Ok(FlowDecision::Drop(violation)) => {
                if let Err(err) = self.throttle_for(ip, violation.label()).await {
                    tracing::warn!("throttle marker for {ip} not written: {err}");
                }
                FlowDecision::Drop(violation)
            }
            Err(err) => {
                tracing::debug!("flow counters unavailable, passing frame from {ip}: {err}");
                FlowDecision::Allow
            }
        }
    }

    async fn evaluate(&self, ip: &str, size: i64) -> Result<FlowDecision, StoreError> {
        let cfg = &self.config;
        if self.store.marker(&keys::flow_throttled(ip)).await?.is_some() {
            return Ok(FlowDecision::Drop(FlowViolation::Throttled));
        }
        if size > cfg.max_message_bytes {
            return Ok(FlowDecision::Drop(FlowViolation::MessageTooLarge {
                size,
                max: cfg.max_message_bytes,
            }));
        }
        let count = self
            .store
            .incr_window(&keys::flow_messages(ip), 1, WINDOW)
            .await?;
        if count > cfg.max_messages_per_second {
            return Ok(FlowDecision::Drop(FlowViolation::MessageRate {
                count,
                max: cfg.max_messages_per_second,
            }));
        }
        let bytes = self
            .store
            .incr_window(&keys::flow_bytes(ip), size, WINDOW)
            .await?;
        if bytes > cfg.max_bytes_per_second {
            return Ok(FlowDecision::Drop(FlowViolation::ByteRate {
                bytes,
                max: cfg.max_bytes_per_second,
            }));
        }
        Ok(FlowDecision::Allow)
    }

    async fn throttle_for(&self, ip: &str, reason: &str) -> Result<(), StoreError> {
        let cooldown = Duration::from_secs(self.config.throttle_seconds);
        self.store
            .set_marker(&keys::flow_throttled(ip), reason, Some(cooldown))
            .await?;
        tracing::info!("throttling {ip} for {}s: {reason}", cooldown.as_secs());
        audit::emit("ip_throttled", ip, "", reason);
        Ok(())
    }

    /// Throttle `ip` for one cooldown regardless of its traffic.
    pub async fn throttle_ip(&self, ip: &str) -> Result<(), StoreError> {
        self.throttle_for(ip, "manual").await
    }

    pub async fn unthrottle_ip(&self, ip: &str) -> Result<bool, StoreError> {
        let removed = self.store.delete(&keys::flow_throttled(ip)).await?;
        if removed {
            audit::emit("ip_unthrottled", ip, "", "cooldown lifted");
        }
        Ok(removed)
    }

    pub async fn is_throttled(&self, ip: &str) -> Result<bool, StoreError> {
        Ok(self.store.marker(&keys::flow_throttled(ip)).await?.is_some())
    }

    pub async fn flow_stats(&self, ip: &str) -> Result<FlowStats, StoreError> {
        Ok(FlowStats {
            ip: ip.to_string(),
            messages_in_window: self.store.counter(&keys::flow_messages(ip)).await?,
            bytes_in_window: self.store.counter(&keys::flow_bytes(ip)).await?,
            throttled: self.is_throttled(ip).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::time::ManualClock;

    fn controller(cfg: FlowControlConfig) -> (FlowController, Arc<MemoryStore<ManualClock>>, ManualClock) {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (FlowController::new(store.clone(), cfg), store, clock)
    }

    fn config() -> FlowControlConfig {
        FlowControlConfig {
            max_message_bytes: 100,
            max_messages_per_second: 3,
            max_bytes_per_second: 250,
            throttle_seconds: 10,
            ..FlowControlConfig::default()
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_throttles_source() {
        let (flow, _, clock) = controller(config());
        let decision = flow.check_frame("10.0.0.1", 101).await;
        assert_eq!(
            decision,
            FlowDecision::Drop(FlowViolation::MessageTooLarge { size: 101, max: 100 })
        );
        // small frames are dropped during the cooldown
        assert_eq!(
            flow.check_frame("10.0.0.1", 1).await,
            FlowDecision::Drop(FlowViolation::Throttled)
        );
        clock.advance(Duration::from_secs(11));
        assert!(flow.check_frame("10.0.0.1", 1).await.allowed());
    }

    #[tokio::test]
    async fn test_message_rate_window() {
        let (flow, _, clock) = controller(config());
        for _ in 0..3 {
            assert!(flow.check_frame("10.0.0.2", 10).await.allowed());
        }
        let decision = flow.check_frame("10.0.0.2", 10).await;
        assert!(matches!(
            decision,
            FlowDecision::Drop(FlowViolation::MessageRate { count: 4, max: 3 })
        ));
        assert!(flow.is_throttled("10.0.0.2").await.unwrap());
        assert!(flow.unthrottle_ip("10.0.0.2").await.unwrap());
        clock.advance(Duration::from_secs(1));
        assert!(flow.check_frame("10.0.0.2", 10).await.allowed());
    }

    #[tokio::test]
    async fn test_byte_rate_window() {
        let (flow, _, _) = controller(config());
        assert!(flow.check_frame("10.0.0.3", 100).await.allowed());
        assert!(flow.check_frame("10.0.0.3", 100).await.allowed());
        assert_eq!(
            flow.check_frame("10.0.0.3", 100).await,
            FlowDecision::Drop(FlowViolation::ByteRate { bytes: 300, max: 250 })
        );
    }

    #[tokio::test]
    async fn test_counter_outage_passes_frames() {
        let (flow, store, _) = controller(config());
        store.set_unavailable(true);
        assert!(flow.check_frame("10.0.0.4", 5_000).await.allowed());
    }

    #[tokio::test]
    async fn test_manual_throttle_and_stats() {
        let (flow, _, _) = controller(config());
        assert!(flow.check_frame("10.0.0.5", 40).await.allowed());
        flow.throttle_ip("10.0.0.5").await.unwrap();
        let stats = flow.flow_stats("10.0.0.5").await.unwrap();
        assert_eq!(stats.messages_in_window, 1);
        assert_eq!(stats.bytes_in_window, 40);
        assert!(stats.throttled);
    }

    #[tokio::test]
    async fn test_disabled_controller_allows_everything() {
        let (flow, _, _) = controller(FlowControlConfig {
            enabled: false,
            ..config()
        });
        assert!(flow.check_frame("10.0.0.6", 1_000_000).await.allowed());
    }
}
