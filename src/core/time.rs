use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Clock abstraction to enforce deterministic time sourcing in core paths.
///
/// `now_millis` is wall-clock time since the Unix epoch. It is the time base for
/// everything shared across the fleet (retry schedule scores, TTLs, snowflake ids).
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    fn now_millis(&self) -> u64;
    fn sleep(&self, duration: Duration) -> tokio::time::Sleep;
}

/// System-backed clock; replaceable in tests or deterministic replay.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn sleep(&self, duration: Duration) -> tokio::time::Sleep {
        tokio::time::sleep(duration)
    }
}

/// Manually advanced clock. Time only moves when `advance` or `set_millis` is called.
#[derive(Clone)]
pub struct ManualClock {
    base: Instant,
    origin_millis: u64,
    offset_millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            base: Instant::now(),
            origin_millis: start_millis,
            offset_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_millis(&self, millis: u64) {
        let offset = millis.saturating_sub(self.origin_millis);
        self.offset_millis.store(offset, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2025-01-01T00:00:00Z
        Self::new(1_735_689_600_000)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_millis.load(Ordering::SeqCst))
    }

    fn now_millis(&self) -> u64 {
        self.origin_millis + self.offset_millis.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) -> tokio::time::Sleep {
        tokio::time::sleep(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        let before = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now_millis(), 6_000);
        assert_eq!(clock.now() - before, Duration::from_secs(5));
        clock.set_millis(2_500);
        assert_eq!(clock.now_millis(), 2_500);
    }
}
