//! Ingestion and QF metrics.
//!
//! Tracks the counters and gauges operators watch:
//! - Events processed, duplicated, rejected
//! - Ranges that exhausted their retries, live resubscriptions
//! - Cursor lag per contract (chain head minus cursor)
//! - Per-event processing latency (fixed-bucket histogram)
//! - Duration of the last QF calculation
//!
//! Everything is lock-free except the per-contract lag map.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use crate::domain::{BlockNumber, ContractAddress};

/// Upper bounds (inclusive, milliseconds) of the latency histogram buckets.
pub const LATENCY_BUCKETS_MS: [u64; 10] = [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000];

#[derive(Debug, Default)]
struct Histogram {
    // One slot per bucket plus the overflow bucket.
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl Histogram {
    fn observe(&self, value_ms: u64) {
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| value_ms <= *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let mut buckets = Vec::with_capacity(LATENCY_BUCKETS_MS.len() + 1);
        let mut cumulative = 0;
        for (i, slot) in self.buckets.iter().enumerate() {
            cumulative += slot.load(Ordering::Relaxed);
            let le = LATENCY_BUCKETS_MS
                .get(i)
                .map(|b| b.to_string())
                .unwrap_or_else(|| "+Inf".to_string());
            buckets.push(BucketSnapshot {
                le,
                count: cumulative,
            });
        }
        HistogramSnapshot {
            buckets,
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketSnapshot {
    pub le: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramSnapshot {
    pub buckets: Vec<BucketSnapshot>,
    pub count: u64,
    pub sum_ms: u64,
}

/// Point-in-time copy of every metric, as served on `/metrics`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub events_processed: u64,
    pub events_duplicate: u64,
    pub events_error: u64,
    pub ranges_failed: u64,
    pub resubscriptions: u64,
    pub cursor_lag: BTreeMap<String, u64>,
    pub event_processing_latency_ms: HistogramSnapshot,
    pub last_qf_duration_ms: u64,
}

/// Shared metrics registry. Cloned around as `Arc<Metrics>`.
#[derive(Debug, Default)]
pub struct Metrics {
    events_processed: AtomicU64,
    events_duplicate: AtomicU64,
    events_error: AtomicU64,
    ranges_failed: AtomicU64,
    resubscriptions: AtomicU64,
    cursor_lag: RwLock<BTreeMap<ContractAddress, u64>>,
    latency: Histogram,
    last_qf_duration_ms: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_duplicate(&self) {
        self.events_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_error(&self) {
        self.events_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ranges_failed(&self) {
        self.ranges_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resubscriptions(&self) {
        self.resubscriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_latency(&self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.latency.observe(ms);
    }

    /// Record `head - cursor` for a contract; a cursor ahead of head reads as zero lag.
    pub fn set_cursor_lag(&self, contract: &ContractAddress, head: BlockNumber, cursor: BlockNumber) {
        let lag = head.saturating_sub(cursor);
        match self.cursor_lag.write() {
            Ok(mut map) => {
                map.insert(contract.clone(), lag);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(contract.clone(), lag);
            }
        }
    }

    pub fn set_last_qf_duration(&self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.last_qf_duration_ms.store(ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let cursor_lag = match self.cursor_lag.read() {
            Ok(map) => map
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
        };

        MetricsSnapshot {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_duplicate: self.events_duplicate.load(Ordering::Relaxed),
            events_error: self.events_error.load(Ordering::Relaxed),
            ranges_failed: self.ranges_failed.load(Ordering::Relaxed),
            resubscriptions: self.resubscriptions.load(Ordering::Relaxed),
            cursor_lag,
            event_processing_latency_ms: self.latency.snapshot(),
            last_qf_duration_ms: self.last_qf_duration_ms.load(Ordering::Relaxed),
        }
    }
}
