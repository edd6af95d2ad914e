use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide delivery counters rendered on `/metrics`.
#[derive(Clone, Default, Debug)]
pub struct DeliveryMetrics {
    connections_active: Arc<AtomicI64>,
    connections_opened: Arc<AtomicU64>,
    connections_replaced: Arc<AtomicU64>,
    frames_in: Arc<AtomicU64>,
    frames_throttled: Arc<AtomicU64>,
    dispatch_dropped: Arc<AtomicU64>,
    protocol_violations: Arc<AtomicU64>,
    admission_rejected: Arc<AtomicU64>,
    routed_local: Arc<AtomicU64>,
    routed_remote: Arc<AtomicU64>,
    routed_offline: Arc<AtomicU64>,
    retries_enqueued: Arc<AtomicU64>,
    retry_enqueue_failures: Arc<AtomicU64>,
    retries_resent: Arc<AtomicU64>,
    retries_demoted: Arc<AtomicU64>,
    retries_acked: Arc<AtomicU64>,
    offline_replayed: Arc<AtomicU64>,
    shard_updates: Arc<AtomicU64>,
    group_pushes: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySnapshot {
    pub connections_active: i64,
    pub connections_opened: u64,
    pub connections_replaced: u64,
    pub frames_in: u64,
    pub frames_throttled: u64,
    pub dispatch_dropped: u64,
    pub protocol_violations: u64,
    pub admission_rejected: u64,
    pub routed_local: u64,
    pub routed_remote: u64,
    pub routed_offline: u64,
    pub retries_enqueued: u64,
    pub retry_enqueue_failures: u64,
    pub retries_resent: u64,
    pub retries_demoted: u64,
    pub retries_acked: u64,
    pub offline_replayed: u64,
    pub shard_updates: u64,
    pub group_pushes: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum RouteKind {
    Local,
    Remote,
    Offline,
}

fn bump(counter: &AtomicU64) {
    let _ = counter.fetch_add(1, Ordering::Relaxed);
}

impl DeliveryMetrics {
    pub fn connection_opened(&self) {
        bump(&self.connections_opened);
        let _ = self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_replaced(&self) {
        bump(&self.connections_replaced);
    }

    pub fn frame_in(&self) {
        bump(&self.frames_in);
    }

    pub fn frame_throttled(&self) {
        bump(&self.frames_throttled);
    }

    pub fn dispatch_dropped(&self) {
        bump(&self.dispatch_dropped);
    }

    pub fn protocol_violation(&self) {
        bump(&self.protocol_violations);
    }

    pub fn admission_rejected(&self) {
        bump(&self.admission_rejected);
    }

    pub fn routed(&self, kind: RouteKind) {
        match kind {
            RouteKind::Local => bump(&self.routed_local),
            RouteKind::Remote => bump(&self.routed_remote),
            RouteKind::Offline => bump(&self.routed_offline),
        }
    }

    pub fn retry_enqueued(&self) {
        bump(&self.retries_enqueued);
    }

    pub fn retry_enqueue_failed(&self) {
        bump(&self.retry_enqueue_failures);
    }

    pub fn retry_resent(&self) {
        bump(&self.retries_resent);
    }

    pub fn retry_demoted(&self) {
        bump(&self.retries_demoted);
    }

    pub fn retry_acked(&self) {
        bump(&self.retries_acked);
    }

    pub fn offline_replayed(&self, count: usize) {
        let _ = self
            .offline_replayed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn shard_updated(&self, count: usize) {
        let _ = self.shard_updates.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn group_pushed(&self, count: usize) {
        let _ = self.group_pushes.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_replaced: self.connections_replaced.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_throttled: self.frames_throttled.load(Ordering::Relaxed),
            dispatch_dropped: self.dispatch_dropped.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            admission_rejected: self.admission_rejected.load(Ordering::Relaxed),
            routed_local: self.routed_local.load(Ordering::Relaxed),
            routed_remote: self.routed_remote.load(Ordering::Relaxed),
            routed_offline: self.routed_offline.load(Ordering::Relaxed),
            retries_enqueued: self.retries_enqueued.load(Ordering::Relaxed),
            retry_enqueue_failures: self.retry_enqueue_failures.load(Ordering::Relaxed),
            retries_resent: self.retries_resent.load(Ordering::Relaxed),
            retries_demoted: self.retries_demoted.load(Ordering::Relaxed),
            retries_acked: self.retries_acked.load(Ordering::Relaxed),
            offline_replayed: self.offline_replayed.load(Ordering::Relaxed),
            shard_updates: self.shard_updates.load(Ordering::Relaxed),
            group_pushes: self.group_pushes.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition of the counters.
    pub fn render(&self) -> String {
        let s = self.snapshot();
        let mut body = String::new();
        let _ = write!(
            body,
            "imcore_connections_active {}\nimcore_connections_opened_total {}\nimcore_connections_replaced_total {}\nimcore_frames_total {}\nimcore_frames_throttled_total {}\nimcore_dispatch_dropped_total {}\nimcore_protocol_violations_total {}\nimcore_admission_rejected_total {}\n",
            s.connections_active,
            s.connections_opened,
            s.connections_replaced,
            s.frames_in,
            s.frames_throttled,
            s.dispatch_dropped,
            s.protocol_violations,
            s.admission_rejected,
        );
        for (route, value) in [
            ("local", s.routed_local),
            ("remote", s.routed_remote),
            ("offline", s.routed_offline),
        ] {
            let _ = writeln!(body, "imcore_routed_total{{route=\"{route}\"}} {value}");
        }
        let _ = write!(
            body,
            "imcore_retries_enqueued_total {}\nimcore_retry_enqueue_failures_total {}\nimcore_retries_resent_total {}\nimcore_retries_demoted_total {}\nimcore_retries_acked_total {}\nimcore_offline_replayed_total {}\nimcore_shard_updates_total {}\nimcore_group_pushes_total {}\n",
            s.retries_enqueued,
            s.retry_enqueue_failures,
            s.retries_resent,
            s.retries_demoted,
            s.retries_acked,
            s.offline_replayed,
            s.shard_updates,
            s.group_pushes,
        );
        body
    }
}
