use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use dashmap::DashMap;
use serde::Serialize;

/// Histogram bucket upper bounds in seconds for execution durations.
const DURATION_BUCKETS_SECS: [u64; 7] = [5, 30, 60, 300, 900, 1800, 3600];

#[derive(Default)]
struct DurationHistogram {
    // one slot per bucket plus the overflow slot
    counts: [AtomicU64; DURATION_BUCKETS_SECS.len() + 1],
    total_ms: AtomicU64,
    samples: AtomicU64,
}

impl DurationHistogram {
    fn record(&self, duration: Duration) {
        let secs = duration.as_secs();
        let idx = DURATION_BUCKETS_SECS
            .iter()
            .position(|bound| secs <= *bound)
            .unwrap_or(DURATION_BUCKETS_SECS.len());
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.total_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub bucket_bounds_secs: Vec<u64>,
    pub bucket_counts: Vec<u64>,
    pub samples: u64,
    pub mean_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub execution_durations: BTreeMap<String, HistogramSnapshot>,
}

/// In-process counters and histograms. Dispatcher admission, event-bus
/// publishes and execution lifecycles all report here; a snapshot is cheap
/// enough to serve from a handler.
#[derive(Default)]
pub struct MetricsService {
    counters: DashMap<String, AtomicU64>,
    durations: DashMap<String, DurationHistogram>,
}

impl MetricsService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str) {
        self.incr_by(name, 1);
    }

    pub fn incr_by(&self, name: &str, delta: u64) {
        self.counters
            .entry(name.to_string())
            .or_default()
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn record_execution_duration(&self, exec_type: &str, duration: Duration) {
        self.durations
            .entry(exec_type.to_string())
            .or_default()
            .record(duration);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        let execution_durations = self
            .durations
            .iter()
            .map(|entry| {
                let h = entry.value();
                let samples = h.samples.load(Ordering::Relaxed);
                let mean_ms = if samples == 0 {
                    0
                } else {
                    h.total_ms.load(Ordering::Relaxed) / samples
                };
                (
                    entry.key().clone(),
                    HistogramSnapshot {
                        bucket_bounds_secs: DURATION_BUCKETS_SECS.to_vec(),
                        bucket_counts: h
                            .counts
                            .iter()
                            .map(|c| c.load(Ordering::Relaxed))
                            .collect(),
                        samples,
                        mean_ms,
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            counters,
            execution_durations,
        }
    }
}
