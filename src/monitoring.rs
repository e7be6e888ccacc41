//! Engine statistics and health grading for Kestrel.
//!
//! Counters are plain atomics bumped on the hot path; [`IngestStats::snapshot`]
//! produces a serializable view for periodic logging.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// System health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemHealth {
    /// All systems operational.
    Healthy,
    /// Some items are being dropped or rejected.
    Degraded,
    /// A significant share of work is failing.
    Unhealthy,
    /// Nothing gets persisted.
    Critical,
}

impl SystemHealth {
    /// Get severity score (0-100).
    pub fn severity(&self) -> u8 {
        match self {
            SystemHealth::Healthy => 0,
            SystemHealth::Degraded => 25,
            SystemHealth::Unhealthy => 75,
            SystemHealth::Critical => 100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemHealth::Healthy => "healthy",
            SystemHealth::Degraded => "degraded",
            SystemHealth::Unhealthy => "unhealthy",
            SystemHealth::Critical => "critical",
        }
    }
}

/// Engine-wide counters.
#[derive(Debug)]
pub struct IngestStats {
    started: Instant,
    produced: AtomicU64,
    rejected: AtomicU64,
    analyzed: AtomicU64,
    invalid: AtomicU64,
    unknown_kind: AtomicU64,
    dispatched: AtomicU64,
    dispatch_dropped: AtomicU64,
    remote_failures: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    records_written: AtomicU64,
    records_lost: AtomicU64,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    pub fn new() -> Self {
        IngestStats {
            started: Instant::now(),
            produced: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            analyzed: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            unknown_kind: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            dispatch_dropped: AtomicU64::new(0),
            remote_failures: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            records_lost: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_produce(&self, accepted: bool) {
        if accepted {
            self.produced.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_analyzed(&self, count: u64) {
        self.analyzed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_kind(&self, count: u64) {
        self.unknown_kind.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_dropped(&self) {
        self.dispatch_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_failure(&self) {
        self.remote_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, written: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.records_written.fetch_add(written, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self, lost: u64) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
        self.records_lost.fetch_add(lost, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let produced = self.produced.load(Ordering::Relaxed);
        let uptime = self.uptime();
        let secs = uptime.as_secs_f64();

        StatsSnapshot {
            uptime_secs: uptime.as_secs(),
            produced,
            rejected: self.rejected.load(Ordering::Relaxed),
            ingest_rate: if secs > 0.0 { produced as f64 / secs } else { 0.0 },
            analyzed: self.analyzed.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            unknown_kind: self.unknown_kind.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dispatch_dropped: self.dispatch_dropped.load(Ordering::Relaxed),
            remote_failures: self.remote_failures.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            records_lost: self.records_lost.load(Ordering::Relaxed),
        }
    }
}

/// Serializable point-in-time view of [`IngestStats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub produced: u64,
    pub rejected: u64,
    pub ingest_rate: f64,
    pub analyzed: u64,
    pub invalid: u64,
    pub unknown_kind: u64,
    pub dispatched: u64,
    pub dispatch_dropped: u64,
    pub remote_failures: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub records_written: u64,
    pub records_lost: u64,
}

impl StatsSnapshot {
    /// Grades the engine from its failure ratios.
    pub fn health(&self) -> SystemHealth {
        let attempted_flushes = self.flushes + self.flush_failures;
        if attempted_flushes > 0 && self.flushes == 0 {
            return SystemHealth::Critical;
        }

        let flush_failure_rate = ratio(self.flush_failures, attempted_flushes);
        let reject_rate = ratio(self.rejected, self.produced + self.rejected);
        let remote_failure_rate = ratio(self.remote_failures, self.dispatched + self.remote_failures);

        if flush_failure_rate > 0.25 || remote_failure_rate > 0.25 || reject_rate > 0.5 {
            SystemHealth::Unhealthy
        } else if flush_failure_rate > 0.0 || remote_failure_rate > 0.0 || reject_rate > 0.01 {
            SystemHealth::Degraded
        } else {
            SystemHealth::Healthy
        }
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}
