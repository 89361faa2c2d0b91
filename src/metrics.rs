//! In-process metrics for the audit phases
//!
//! Fixed-bucket histograms over the audit pre- and post-phase
//! durations. Storage is process-wide and initialised at most once;
//! the snapshot form is what the administration surface renders.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use serde::Serialize;

/// Upper bucket bounds in seconds for the pre-phase histogram.
const BEFORE_BUCKETS: &[f64] = &[1e-7, 2e-7, 5e-7, 1e-6, 2e-6, 5e-6, 1e-5, 1e-4, 1e-3];

/// Upper bucket bounds in seconds for the post-phase histogram.
const AFTER_BUCKETS: &[f64] = &[1e-8, 2e-8, 5e-8, 1e-7, 2e-7, 5e-7, 1e-6, 1e-5, 1e-4, 1e-3];

struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum_nanos: AtomicU64,
}

impl Histogram {
    fn new(bounds: &'static [f64]) -> Self {
        let buckets = (0..bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self { bounds, buckets, count: AtomicU64::new(0), sum_nanos: AtomicU64::new(0) }
    }

    fn observe(&self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        for (i, bound) in self.bounds.iter().enumerate() {
            if seconds <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self
                .bounds
                .iter()
                .zip(self.buckets.iter())
                .map(|(bound, count)| Bucket { le: *bound, count: count.load(Ordering::Relaxed) })
                .collect(),
            count: self.count.load(Ordering::Relaxed),
            sum_seconds: self.sum_nanos.load(Ordering::Relaxed) as f64 / 1e9,
        }
    }
}

/// One cumulative histogram bucket
#[derive(Debug, Clone, Serialize)]
pub struct Bucket {
    pub le: f64,
    pub count: u64,
}

/// Serializable view of a histogram
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<Bucket>,
    pub count: u64,
    pub sum_seconds: f64,
}

/// Snapshot of both audit phase histograms
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub before_duration_seconds: HistogramSnapshot,
    pub after_duration_seconds: HistogramSnapshot,
}

struct AuditMetrics {
    before_duration: Histogram,
    after_duration: Histogram,
}

static AUDIT_METRICS: OnceLock<AuditMetrics> = OnceLock::new();

fn metrics() -> &'static AuditMetrics {
    AUDIT_METRICS.get_or_init(|| AuditMetrics {
        before_duration: Histogram::new(BEFORE_BUCKETS),
        after_duration: Histogram::new(AFTER_BUCKETS),
    })
}

/// Forces sink initialisation. Safe to call repeatedly; only the
/// first call allocates.
pub fn init() {
    let _ = metrics();
}

pub fn observe_before_duration(duration: Duration) {
    metrics().before_duration.observe(duration);
}

pub fn observe_after_duration(duration: Duration) {
    metrics().after_duration.observe(duration);
}

pub fn snapshot() -> MetricsSnapshot {
    let metrics = metrics();
    MetricsSnapshot {
        before_duration_seconds: metrics.before_duration.snapshot(),
        after_duration_seconds: metrics.after_duration.snapshot(),
    }
}
