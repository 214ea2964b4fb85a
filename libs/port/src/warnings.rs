//! Communication Warnings
//!
//! Protocol anomalies that do not break a connection: envelopes for unknown
//! ids, acknowledgements nobody is waiting for, payloads that fail a schema.
//! Each one is logged locally; the first few per port are also reported to the
//! peer so both logs show the problem.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Warnings reported to the peer per port before going quiet
pub const DEFAULT_MAX_REMOTE_WARNINGS: usize = 5;

#[derive(Debug)]
pub struct CommunicationWarnings {
    side: &'static str,
    max_remote: usize,
    reported: AtomicUsize,
}

impl CommunicationWarnings {
    pub fn new(side: &'static str, max_remote: usize) -> Self {
        Self {
            side,
            max_remote,
            reported: AtomicUsize::new(0),
        }
    }

    /// Log `warning`; returns it back if the peer should hear about it too
    pub fn raise(&self, warning: String) -> Option<String> {
        warn!(port = self.side, warning = %warning, "Communication warning");
        let count = self.reported.fetch_add(1, Ordering::Relaxed);
        (count < self.max_remote).then_some(warning)
    }

    /// A warning the peer reported about our traffic
    pub fn received(&self, warning: &str) {
        warn!(port = self.side, warning = %warning, "Peer reported communication warning");
    }

    pub fn raised(&self) -> usize {
        self.reported.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_first_warnings_are_forwarded() {
        let warnings = CommunicationWarnings::new("client", 2);
        assert!(warnings.raise("a".into()).is_some());
        assert!(warnings.raise("b".into()).is_some());
        assert!(warnings.raise("c".into()).is_none());
        assert_eq!(warnings.raised(), 3);
    }
}
