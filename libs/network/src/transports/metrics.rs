//! Transport Frame Metrics
//!
//! Counters for frame traffic, shared by every transport flavour and cloned
//! into the reader and writer halves of a connection.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

struct FrameCounters {
    created: Instant,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    /// Milliseconds after `created`, offset by one; zero means no traffic yet
    last_activity_ms: AtomicU64,
    errors: Mutex<HashMap<&'static str, u64>>,
}

#[derive(Clone)]
pub struct MetricsTracker {
    counters: Arc<FrameCounters>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(FrameCounters {
                created: Instant::now(),
                frames_sent: AtomicU64::new(0),
                frames_received: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                last_activity_ms: AtomicU64::new(0),
                errors: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[inline]
    pub fn record_send(&self, bytes: usize) {
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_receive(&self, bytes: usize) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Count a failed frame operation under `kind` (read, write, oversized...)
    pub fn record_error(&self, kind: &'static str) {
        *self.counters.errors.lock().entry(kind).or_insert(0) += 1;
    }

    pub fn error_counts(&self) -> HashMap<&'static str, u64> {
        self.counters.errors.lock().clone()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.counters.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.counters.bytes_received.load(Ordering::Relaxed)
    }

    pub fn get_snapshot(&self) -> super::TransportMetrics {
        let counters = &self.counters;
        let last = counters.last_activity_ms.load(Ordering::Relaxed);
        super::TransportMetrics {
            frames_sent: counters.frames_sent.load(Ordering::Relaxed),
            frames_received: counters.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            errors: counters.errors.lock().values().sum(),
            last_activity: (last > 0).then(|| {
                counters.created + std::time::Duration::from_millis(last - 1)
            }),
        }
    }

    fn touch(&self) {
        let elapsed = self.counters.created.elapsed().as_millis() as u64;
        self.counters
            .last_activity_ms
            .fetch_max(elapsed + 1, Ordering::Relaxed);
    }
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts_frames_and_errors() {
        let metrics = MetricsTracker::new();
        assert!(metrics.get_snapshot().last_activity.is_none());

        metrics.record_send(10);
        metrics.record_send(6);
        metrics.record_receive(4);
        metrics.record_error("read");
        metrics.record_error("read");
        metrics.record_error("oversized");

        let snapshot = metrics.get_snapshot();
        assert_eq!(snapshot.frames_sent, 2);
        assert_eq!(snapshot.bytes_sent, 16);
        assert_eq!(snapshot.frames_received, 1);
        assert_eq!(snapshot.errors, 3);
        assert!(snapshot.last_activity.is_some());
        assert_eq!(metrics.error_counts().get("read"), Some(&2));
    }
}
