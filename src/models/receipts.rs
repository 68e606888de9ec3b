//! Windowed idempotency receipts for per-share ledger writes
//!
//! A share can only be processed while it is younger than the retention
//! window, so a receipt older than the window can never be consulted again
//! and is dropped on the next write to the same record.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareReceipts(BTreeMap<String, DateTime<Utc>>);

impl ShareReceipts {
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Record `key` at `at`, pruning receipts older than `retention`.
    /// Returns false when the key is already present.
    pub fn record(&mut self, key: &str, at: DateTime<Utc>, retention: Duration) -> bool {
        if self.0.contains_key(key) {
            return false;
        }
        self.prune_before(at - retention);
        self.0.insert(key.to_string(), at);
        true
    }

    /// Drop every receipt recorded before `cutoff`; returns how many went
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.0.len();
        self.0.retain(|_, recorded_at| *recorded_at >= cutoff);
        before - self.0.len()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_prunes_outside_window() {
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let retention = Duration::days(2);
        let mut receipts = ShareReceipts::default();

        for day in 0..10 {
            let key = format!("share:{}", day);
            assert!(receipts.record(&key, start + Duration::days(day), retention));
        }
        assert_eq!(receipts.len(), 3);
        assert!(receipts.contains("share:9"));
        assert!(receipts.contains("share:7"));
        assert!(!receipts.contains("share:6"));

        // duplicate inside the window
        assert!(!receipts.record("share:9", start + Duration::days(9), retention));
    }
}
