//! In-process matching statistics.
//!
//! Cheap atomic counters snapshotted into the distributed-stats response.
//! These are per-process numbers; the Prometheus metrics carry the
//! cluster-wide view.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct StatsInner {
    attempts: AtomicU64,
    matches: AtomicU64,
    abandoned: AtomicU64,
    total_wait_ms: AtomicU64,
}

/// Running match statistics. Cheaply cloneable; clones share counters.
#[derive(Debug, Clone, Default)]
pub struct MatchStats {
    inner: Arc<StatsInner>,
}

impl MatchStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one match attempt (immediate or sweep-driven).
    pub fn record_attempt(&self) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a match abandoned to a concurrent claim.
    pub fn record_abandoned(&self) {
        self.inner.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one created match and both sides' queue waits.
    pub fn record_match(&self, waits: [Duration; 2]) {
        self.inner.matches.fetch_add(1, Ordering::Relaxed);
        let total: u64 = waits
            .iter()
            .map(|w| u64::try_from(w.as_millis()).unwrap_or(u64::MAX))
            .fold(0, u64::saturating_add);
        self.inner.total_wait_ms.fetch_add(total, Ordering::Relaxed);
    }

    /// Snapshot the counters.
    #[must_use]
    pub fn snapshot(&self) -> MatchStatsSnapshot {
        let attempts = self.inner.attempts.load(Ordering::Relaxed);
        let matches = self.inner.matches.load(Ordering::Relaxed);
        let abandoned = self.inner.abandoned.load(Ordering::Relaxed);
        let total_wait_ms = self.inner.total_wait_ms.load(Ordering::Relaxed);

        #[allow(clippy::cast_precision_loss)]
        let success_rate = if attempts == 0 {
            0.0
        } else {
            matches as f64 / attempts as f64
        };
        let avg_wait_ms = if matches == 0 {
            0
        } else {
            total_wait_ms / (matches * 2)
        };

        MatchStatsSnapshot {
            attempts,
            matches,
            abandoned,
            success_rate,
            avg_wait_ms,
        }
    }
}

/// Point-in-time view of the matching counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchStatsSnapshot {
    pub attempts: u64,
    pub matches: u64,
    pub abandoned: u64,
    pub success_rate: f64,
    pub avg_wait_ms: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let stats = MatchStats::new();
        let snap = stats.snapshot();
        assert_eq!(snap.attempts, 0);
        assert_eq!(snap.matches, 0);
        assert!((snap.success_rate - 0.0).abs() < f64::EPSILON);
        assert_eq!(snap.avg_wait_ms, 0);
    }

    #[test]
    fn test_success_rate_and_average_wait() {
        let stats = MatchStats::new();
        stats.record_attempt();
        stats.record_attempt();
        stats.record_attempt();
        stats.record_attempt();
        stats.record_match([Duration::from_millis(100), Duration::from_millis(300)]);

        let snap = stats.snapshot();
        assert_eq!(snap.attempts, 4);
        assert_eq!(snap.matches, 1);
        assert!((snap.success_rate - 0.25).abs() < f64::EPSILON);
        assert_eq!(snap.avg_wait_ms, 200);
    }

    #[test]
    fn test_clones_share_counters() {
        let stats = MatchStats::new();
        let clone = stats.clone();
        clone.record_attempt();
        clone.record_abandoned();

        let snap = stats.snapshot();
        assert_eq!(snap.attempts, 1);
        assert_eq!(snap.abandoned, 1);
    }
}
