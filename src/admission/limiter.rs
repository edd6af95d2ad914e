use crate::audit;
use crate::config::ConnectionLimitConfig;
use crate::store::{keys, AdmissionLimits, AdmissionVerdict, SharedStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a connection attempt was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("ip {ip} is blocked")]
    Blocked { ip: String },
    #[error("global connection ceiling reached ({current}/{max})")]
    GlobalLimit { current: i64, max: i64 },
    #[error("per-ip connection ceiling reached for {ip} ({current}/{max})")]
    PerIpLimit { ip: String, current: i64, max: i64 },
    #[error("connect rate ceiling reached for {ip} ({current}/{max} per window)")]
    RateLimit { ip: String, current: i64, max: i64 },
}

impl AdmissionError {
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::Blocked { .. } => "blocked",
            AdmissionError::GlobalLimit { .. } => "global_limit",
            AdmissionError::PerIpLimit { .. } => "per_ip_limit",
            AdmissionError::RateLimit { .. } => "rate_limit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct IpConnectionStats {
    pub ip: String,
    pub connections: i64,
    pub connects_in_window: i64,
    pub blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ConnectionStats {
    pub global: i64,
    pub max_total: i64,
    pub ip: Option<IpConnectionStats>,
}

/// Connect-time gate backed by fleet-wide counters.
///
/// Checks run in order: block list, global ceiling, per-IP ceiling, per-IP connect rate.
/// The global counter never expires; the per-IP counter expiry is re-armed on each
/// admission. A store failure during the check admits the connection.
#[derive(Clone)]
pub struct ConnectionLimiter {
    store: Arc<dyn SharedStore>,
    config: ConnectionLimitConfig,
}

impl ConnectionLimiter {
    pub fn new(store: Arc<dyn SharedStore>, config: ConnectionLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn limits(&self) -> AdmissionLimits {
        let cfg = &self.config;
        AdmissionLimits {
            max_total: cfg.max_total,
            max_per_ip: cfg.max_per_ip,
            max_per_window: cfg.max_per_minute,
            ip_ttl: Duration::from_secs(cfg.ip_ttl_seconds),
            rate_window: Duration::from_secs(cfg.rate_ttl_seconds),
        }
    }

    /// Check and count the connection in one store operation. Rejections are audited.
    pub async fn admit(&self, ip: &str, user_id: &str) -> Result<(), AdmissionError> {
        if !self.config.enabled {
            return Ok(());
        }
        let cfg = &self.config;
        let verdict = match self.store.admit_connection(ip, self.limits()).await {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::warn!("admission counters unavailable, admitting {ip}: {err}");
                return Ok(());
            }
        };
        let rejection = match verdict {
            AdmissionVerdict::Admitted => return Ok(()),
            AdmissionVerdict::Blocked => AdmissionError::Blocked { ip: ip.to_string() },
            AdmissionVerdict::GlobalLimit(current) => AdmissionError::GlobalLimit {
                current,
                max: cfg.max_total,
            },
            AdmissionVerdict::PerIpLimit(current) => AdmissionError::PerIpLimit {
                ip: ip.to_string(),
                current,
                max: cfg.max_per_ip,
            },
            AdmissionVerdict::RateLimit(current) => AdmissionError::RateLimit {
                ip: ip.to_string(),
                current,
                max: cfg.max_per_minute,
            },
        };
        audit::emit("connection_rejected", ip, user_id, &rejection.to_string());
        Err(rejection)
    }

    /// Undo the live-connection counters for a closed connection. The rate counter is left
    /// to expire with its window.
    pub async fn release(&self, ip: &str) {
        if !self.config.enabled {
            return;
        }
        for key in [keys::GLOBAL_CONNECTIONS.to_string(), keys::ip_connections(ip)] {
            if let Err(err) = self.store.decr_counter(&key).await {
                tracing::warn!("admission counter {key} not decremented: {err}");
            }
        }
    }

    /// Block `ip` for `duration`, or until unblocked when `None`.
    pub async fn block_ip(&self, ip: &str, duration: Option<Duration>) -> Result<(), StoreError> {
        self.store
            .set_marker(&keys::ip_blocked(ip), "1", duration)
            .await?;
        let message = match duration {
            Some(d) => format!("blocked for {}s", d.as_secs()),
            None => "blocked until lifted".to_string(),
        };
        audit::emit("ip_blocked", ip, "", &message);
        Ok(())
    }

    pub async fn unblock_ip(&self, ip: &str) -> Result<bool, StoreError> {
        let removed = self.store.delete(&keys::ip_blocked(ip)).await?;
        if removed {
            audit::emit("ip_unblocked", ip, "", "block lifted");
        }
        Ok(removed)
    }

    pub async fn is_blocked(&self, ip: &str) -> Result<bool, StoreError> {
        Ok(self.store.marker(&keys::ip_blocked(ip)).await?.is_some())
    }

    pub async fn connection_stats(&self, ip: Option<&str>) -> Result<ConnectionStats, StoreError> {
        let global = self.store.counter(keys::GLOBAL_CONNECTIONS).await?;
        let ip = match ip {
            Some(ip) => Some(IpConnectionStats {
                ip: ip.to_string(),
                connections: self.store.counter(&keys::ip_connections(ip)).await?,
                connects_in_window: self.store.counter(&keys::ip_rate(ip)).await?,
                blocked: self.is_blocked(ip).await?,
            }),
            None => None,
        };
        Ok(ConnectionStats {
            global,
            max_total: self.config.max_total,
            ip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::time::ManualClock;

    fn limiter(cfg: ConnectionLimitConfig) -> (ConnectionLimiter, Arc<MemoryStore<ManualClock>>, ManualClock) {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (ConnectionLimiter::new(store.clone(), cfg), store, clock)
    }

    fn config(max_per_ip: i64) -> ConnectionLimitConfig {
        ConnectionLimitConfig {
            max_per_ip,
            max_total: 100,
            max_per_minute: 100,
            ..ConnectionLimitConfig::default()
        }
    }

    #[tokio::test]
    async fn test_per_ip_ceiling_frees_after_release() {
        let (limiter, _, _) = limiter(config(2));
        limiter.admit("10.0.0.1", "a").await.unwrap();
        limiter.admit("10.0.0.1", "b").await.unwrap();
        let err = limiter.admit("10.0.0.1", "c").await.unwrap_err();
        assert_eq!(err.reason(), "per_ip_limit");
        // other addresses are unaffected
        limiter.admit("10.0.0.2", "d").await.unwrap();

        limiter.release("10.0.0.1").await;
        limiter.admit("10.0.0.1", "c").await.unwrap();
    }

    #[tokio::test]
    async fn test_block_list_checked_first() {
        let (limiter, _, clock) = limiter(config(0));
        limiter
            .block_ip("10.0.0.9", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let err = limiter.admit("10.0.0.9", "a").await.unwrap_err();
        assert_eq!(err, AdmissionError::Blocked { ip: "10.0.0.9".into() });

        clock.advance(Duration::from_secs(61));
        assert!(!limiter.is_blocked("10.0.0.9").await.unwrap());
    }

    #[tokio::test]
    async fn test_global_ceiling() {
        let cfg = ConnectionLimitConfig {
            max_total: 1,
            ..config(10)
        };
        let (limiter, _, _) = limiter(cfg);
        limiter.admit("10.0.0.1", "a").await.unwrap();
        let err = limiter.admit("10.0.0.2", "b").await.unwrap_err();
        assert!(matches!(err, AdmissionError::GlobalLimit { current: 1, max: 1 }));
    }

    #[tokio::test]
    async fn test_rate_window_expires() {
        let cfg = ConnectionLimitConfig {
            max_per_minute: 2,
            ..config(10)
        };
        let (limiter, _, clock) = limiter(cfg);
        for user in ["a", "b"] {
            limiter.admit("10.0.0.1", user).await.unwrap();
            limiter.release("10.0.0.1").await;
        }
        let err = limiter.admit("10.0.0.1", "c").await.unwrap_err();
        assert_eq!(err.reason(), "rate_limit");
        clock.advance(Duration::from_secs(61));
        limiter.admit("10.0.0.1", "c").await.unwrap();
    }

    #[tokio::test]
    async fn test_global_count_outlives_ip_ttl() {
        let cfg = ConnectionLimitConfig {
            max_total: 1,
            ..config(1)
        };
        let (limiter, store, clock) = limiter(cfg);
        limiter.admit("10.0.0.1", "a").await.unwrap();
        clock.advance(Duration::from_secs(3_601));
        let err = limiter.admit("10.0.0.2", "b").await.unwrap_err();
        assert_eq!(err.reason(), "global_limit");
        assert_eq!(store.counter(keys::GLOBAL_CONNECTIONS).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admits_never_overshoot() {
        let cfg = ConnectionLimitConfig {
            max_total: 8,
            ..config(100)
        };
        let (limiter, store, _) = limiter(cfg);
        let attempts = (0..9).map(|i| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.admit("10.0.0.1", &format!("u{i}")).await })
        });
        let results = futures::future::join_all(attempts).await;
        let rejected: Vec<_> = results
            .into_iter()
            .map(|joined| joined.unwrap())
            .filter_map(Result::err)
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].reason(), "global_limit");
        assert_eq!(store.counter(keys::GLOBAL_CONNECTIONS).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_release_floors_at_zero() {
        let (limiter, store, _) = limiter(config(5));
        limiter.release("10.0.0.1").await;
        limiter.admit("10.0.0.1", "a").await.unwrap();
        limiter.release("10.0.0.1").await;
        limiter.release("10.0.0.1").await;
        assert_eq!(store.counter(&keys::ip_connections("10.0.0.1")).await.unwrap(), 0);
        assert_eq!(store.counter(keys::GLOBAL_CONNECTIONS).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let (limiter, store, _) = limiter(config(0));
        store.set_unavailable(true);
        limiter.admit("10.0.0.1", "a").await.unwrap();
        limiter.release("10.0.0.1").await;
    }

    #[tokio::test]
    async fn test_stats_report_ip_counters() {
        let (limiter, _, _) = limiter(config(5));
        limiter.admit("10.0.0.3", "a").await.unwrap();
        let stats = limiter.connection_stats(Some("10.0.0.3")).await.unwrap();
        assert_eq!(stats.global, 1);
        let ip = stats.ip.unwrap();
        assert_eq!(ip.connections, 1);
        assert_eq!(ip.connects_in_window, 1);
        assert!(!ip.blocked);
    }
}
