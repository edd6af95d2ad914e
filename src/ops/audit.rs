use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::event;

const SINK_CAPACITY: usize = 1_024;

/// Security-relevant admission event: rejections, blocks and throttles.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub event_type: String,
    pub ip: String,
    pub user_id: String,
    pub message: String,
}

/// Bounded ring of the most recent audit events.
#[derive(Clone, Default)]
pub struct AuditSink {
    inner: Arc<Mutex<VecDeque<AuditEvent>>>,
    evicted: Arc<AtomicU64>,
}

impl AuditSink {
    pub fn record(&self, event: AuditEvent) {
        if let Ok(mut guard) = self.inner.lock() {
            if guard.len() == SINK_CAPACITY {
                guard.pop_front();
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
            guard.push_back(event);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static AUDIT_SINK: OnceLock<AuditSink> = OnceLock::new();

fn sink() -> &'static AuditSink {
    AUDIT_SINK.get_or_init(AuditSink::default)
}

pub fn sink_len() -> usize {
    sink().len()
}

pub fn evicted() -> u64 {
    sink().evicted.load(Ordering::Relaxed)
}

/// Return a copy of the retained audit events, oldest first.
pub fn snapshot() -> Vec<AuditEvent> {
    sink()
        .inner
        .lock()
        .map(|g| g.iter().cloned().collect())
        .unwrap_or_default()
}

/// Emit an audit event on the `audit` tracing target and retain it in the sink.
pub fn emit(event_type: &str, ip: &str, user_id: &str, message: &str) {
    event!(
        target: "audit",
        tracing::Level::INFO,
        %event_type,
        %ip,
        %user_id,
        %message
    );
    sink().record(AuditEvent {
        event_type: event_type.to_string(),
        ip: ip.to_string(),
        user_id: user_id.to_string(),
        message: message.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_is_bounded() {
        let sink = AuditSink::default();
        for n in 0..SINK_CAPACITY + 5 {
            sink.record(AuditEvent {
                event_type: "ip_blocked".into(),
                ip: format!("10.0.0.{n}"),
                user_id: String::new(),
                message: String::new(),
            });
        }
        assert_eq!(sink.len(), SINK_CAPACITY);
        assert_eq!(sink.evicted.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_emit_is_visible_in_snapshot() {
        emit("connection_rejected", "192.0.2.44", "bob", "per-ip ceiling");
        assert!(snapshot()
            .iter()
            .any(|e| e.ip == "192.0.2.44" && e.event_type == "connection_rejected"));
    }
}
