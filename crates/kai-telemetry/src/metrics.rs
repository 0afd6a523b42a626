use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Monotonic process counters surfaced through the health endpoint.
#[derive(Debug, Default)]
pub struct DaemonMetrics {
    sessions_created: AtomicU64,
    sessions_deleted: AtomicU64,
    messages_persisted: AtomicU64,
    rpc_requests: AtomicU64,
    hub_events_published: AtomicU64,
}

impl DaemonMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_deleted(&self) {
        self.sessions_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_persisted(&self) {
        self.messages_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rpc_request(&self) {
        self.rpc_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hub_event(&self) {
        self.hub_events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_deleted: self.sessions_deleted.load(Ordering::Relaxed),
            messages_persisted: self.messages_persisted.load(Ordering::Relaxed),
            rpc_requests: self.rpc_requests.load(Ordering::Relaxed),
            hub_events_published: self.hub_events_published.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time view of the counters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub sessions_created: u64,
    pub sessions_deleted: u64,
    pub messages_persisted: u64,
    pub rpc_requests: u64,
    pub hub_events_published: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = DaemonMetrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.sessions_created, 0);
        assert_eq!(snap.rpc_requests, 0);
    }

    #[test]
    fn counters_accumulate() {
        let metrics = DaemonMetrics::new();
        metrics.record_session_created();
        metrics.record_session_created();
        metrics.record_message_persisted();
        metrics.record_rpc_request();

        let snap = metrics.snapshot();
        assert_eq!(snap.sessions_created, 2);
        assert_eq!(snap.messages_persisted, 1);
        assert_eq!(snap.rpc_requests, 1);
        assert_eq!(snap.sessions_deleted, 0);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let metrics = DaemonMetrics::new();
        metrics.record_hub_event();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["hubEventsPublished"], 1);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn concurrent_increments() {
        let metrics = std::sync::Arc::new(DaemonMetrics::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let m = metrics.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    m.record_rpc_request();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.snapshot().rpc_requests, 800);
    }
}
