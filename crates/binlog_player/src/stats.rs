//! Player telemetry: counters, sliding-window rates, and timing histograms.
//!
//! These are intentionally lightweight so the applier can update them on the
//! hot path without noticeable overhead: single-writer atomic counters, a
//! mutex only around the rate windows. Readers may snapshot concurrently at
//! any time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Number of samples retained by each rate window.
pub const RATE_SAMPLES: usize = 15;
/// Sampling interval of each rate window.
pub const RATE_INTERVAL: Duration = Duration::from_secs(60);

/// Histogram bucket boundaries for timing metrics (microseconds).
const TIMING_BUCKETS_US: [u64; 12] = [
    100,     // 0.1ms
    250,     // 0.25ms
    500,     // 0.5ms
    1_000,   // 1ms
    2_000,   // 2ms
    5_000,   // 5ms
    10_000,  // 10ms
    20_000,  // 20ms
    50_000,  // 50ms
    100_000, // 100ms
    200_000, // 200ms
    500_000, // 500ms
];

/// Monotone counter, safe for single-writer/many-reader use.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-second rate of a [`Counter`] over a sliding window of
/// [`RATE_SAMPLES`] samples taken every [`RATE_INTERVAL`].
///
/// The window advances lazily whenever it is observed; when more than one
/// interval has elapsed since the last observation, the counter delta is
/// spread evenly across the elapsed samples.
pub struct Rates {
    counter: Arc<Counter>,
    samples: usize,
    interval: Duration,
    window: Mutex<RateWindow>,
}

struct RateWindow {
    anchor: Instant,
    last_count: u64,
    history: VecDeque<f64>,
}

impl Rates {
    pub fn new(counter: Arc<Counter>, samples: usize, interval: Duration) -> Self {
        let last_count = counter.get();
        Self {
            counter,
            samples: samples.max(1),
            interval,
            window: Mutex::new(RateWindow {
                anchor: Instant::now(),
                last_count,
                history: VecDeque::with_capacity(samples.max(1)),
            }),
        }
    }

    fn advance(&self, window: &mut RateWindow) {
        let now = Instant::now();
        let elapsed = now.duration_since(window.anchor);
        let interval_ns = self.interval.as_nanos().max(1);
        let steps = (elapsed.as_nanos() / interval_ns) as u64;
        if steps == 0 {
            return;
        }

        let count = self.counter.get();
        let delta = count.saturating_sub(window.last_count);
        let span_secs = steps as f64 * self.interval.as_secs_f64();
        let per_sec = if span_secs > 0.0 {
            delta as f64 / span_secs
        } else {
            0.0
        };

        for _ in 0..steps.min(self.samples as u64) {
            if window.history.len() == self.samples {
                window.history.pop_front();
            }
            window.history.push_back(per_sec);
        }

        // Re-anchor at the most recent complete interval boundary.
        let partial = (elapsed.as_nanos() % interval_ns) as u64;
        window.anchor = now - Duration::from_nanos(partial);
        window.last_count = count;
    }

    /// Per-second rates, oldest first. Empty until one interval has passed.
    pub fn snapshot(&self) -> Vec<f64> {
        let mut window = self
            .window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.advance(&mut window);
        window.history.iter().copied().collect()
    }
}

/// Count, sum, max, and a bucketed latency histogram for one timing series.
#[derive(Debug, Default)]
pub struct Timings {
    count: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
    buckets: [AtomicU64; TIMING_BUCKETS_US.len() + 1],
}

/// Point-in-time view of a [`Timings`] series.
#[derive(Clone, Copy, Debug)]
pub struct TimingsSnapshot {
    pub count: u64,
    pub total_ns: u64,
    pub max_ns: u64,
    pub p50_ns: u64,
    pub p99_ns: u64,
}

impl Timings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the elapsed time from `start` to now.
    pub fn record(&self, start: Instant) {
        self.record_duration(start.elapsed());
    }

    pub fn record_duration(&self, elapsed: Duration) {
        let ns = elapsed.as_nanos().min(u128::from(u64::MAX)) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
        let us = ns / 1_000;
        let idx = TIMING_BUCKETS_US
            .iter()
            .position(|&bound| us <= bound)
            .unwrap_or(TIMING_BUCKETS_US.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Estimate the value at quantile `q` from the bucket counts. Values in
    /// the overflow bucket report the observed max.
    fn percentile_ns(&self, q: f64, count: u64) -> u64 {
        if count == 0 {
            return 0;
        }
        let target = ((q * count as f64).ceil() as u64).clamp(1, count);
        let mut seen = 0u64;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return match TIMING_BUCKETS_US.get(idx) {
                    Some(&bound_us) => bound_us * 1_000,
                    None => self.max_ns.load(Ordering::Relaxed),
                };
            }
        }
        self.max_ns.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TimingsSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        TimingsSnapshot {
            count,
            total_ns: self.total_ns.load(Ordering::Relaxed),
            max_ns: self.max_ns.load(Ordering::Relaxed),
            p50_ns: self.percentile_ns(0.50, count),
            p99_ns: self.percentile_ns(0.99, count),
        }
    }
}

/// Aggregate telemetry for one player: transaction and query counts, their
/// per-second rates, and their timing series.
pub struct PlayerStats {
    txn_count: Arc<Counter>,
    query_count: Arc<Counter>,
    txns_per_sec: Rates,
    queries_per_sec: Rates,
    txn_time: Timings,
    query_time: Timings,
}

impl PlayerStats {
    pub fn new() -> Self {
        let txn_count = Arc::new(Counter::new());
        let query_count = Arc::new(Counter::new());
        let txns_per_sec = Rates::new(Arc::clone(&txn_count), RATE_SAMPLES, RATE_INTERVAL);
        let queries_per_sec = Rates::new(Arc::clone(&query_count), RATE_SAMPLES, RATE_INTERVAL);
        Self {
            txn_count,
            query_count,
            txns_per_sec,
            queries_per_sec,
            txn_time: Timings::new(),
            query_time: Timings::new(),
        }
    }

    /// Record one committed transaction and its wall time.
    pub fn record_txn(&self, start: Instant) {
        self.txn_count.add(1);
        self.txn_time.record(start);
    }

    /// Record one executed statement and its wall time. Failed statements
    /// count too; telemetry tracks work issued, not work that succeeded.
    pub fn record_query(&self, start: Instant) {
        self.query_count.add(1);
        self.query_time.record(start);
    }

    pub fn txn_count(&self) -> u64 {
        self.txn_count.get()
    }

    pub fn query_count(&self) -> u64 {
        self.query_count.get()
    }

    /// JSON snapshot with the six well-known fields.
    pub fn json_snapshot(&self) -> String {
        serde_json::json!({
            "TxnCount": self.txn_count.get(),
            "QueryCount": self.query_count.get(),
            "QueriesPerSec": self.queries_per_sec.snapshot(),
            "TxnPerSec": self.txns_per_sec.snapshot(),
            "TxnTime": timings_json(self.txn_time.snapshot()),
            "QueryTime": timings_json(self.query_time.snapshot()),
        })
        .to_string()
    }
}

impl Default for PlayerStats {
    fn default() -> Self {
        Self::new()
    }
}

fn timings_json(snapshot: TimingsSnapshot) -> serde_json::Value {
    serde_json::json!({
        "Count": snapshot.count,
        "TotalNs": snapshot.total_ns,
        "MaxNs": snapshot.max_ns,
        "P50Ns": snapshot.p50_ns,
        "P99Ns": snapshot.p99_ns,
    })
}
