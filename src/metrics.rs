//! Server-wide request metrics
//!
//! Tracks request latencies with percentile calculations (p50, p95, p99),
//! slow request detection and per-method statistics. One instance per
//! server, shared by every session through `Arc`.
//!
//! # Example
//!
//! ```
//! use txsync::metrics::Metrics;
//!
//! let metrics = Metrics::new();
//! metrics.record_request("findAll", 15);
//!
//! let stats = metrics.snapshot();
//! assert_eq!(stats.request_count, 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// Rolling window of recent request latencies used for percentiles.
const LATENCY_WINDOW_SIZE: usize = 1000;

/// Only the most recent slow requests are kept.
const MAX_SLOW_REQUESTS: usize = 10;

/// Default slow request threshold in milliseconds.
pub const SLOW_REQUEST_THRESHOLD_MS: u64 = 100;

pub struct Metrics {
    request_count: AtomicU64,
    slow_request_count: AtomicU64,
    error_count: AtomicU64,

    /// Latency window, with its running sum kept alongside
    latencies_ms: Mutex<LatencyWindow>,

    /// method -> (count, latency sum)
    per_method: Mutex<HashMap<String, (u64, u64)>>,

    slow_requests: Mutex<VecDeque<SlowRequest>>,
    slow_threshold_ms: u64,

    started_at: Instant,
}

#[derive(Default)]
struct LatencyWindow {
    values: VecDeque<u64>,
    sum: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowRequest {
    pub method: String,
    pub duration_ms: u64,
    /// ms since metrics started
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodStat {
    pub method: String,
    pub count: u64,
    pub avg_ms: u64,
}

/// Point-in-time copy of all metrics, sent in `getStatistics`
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub slow_request_count: u64,
    pub error_count: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub avg_ms: u64,
    pub top_slow_requests: Vec<SlowRequest>,
    /// Methods ordered by call count, descending
    pub methods: Vec<MethodStat>,
    pub uptime_secs: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::with_slow_threshold(SLOW_REQUEST_THRESHOLD_MS)
    }

    pub fn with_slow_threshold(slow_threshold_ms: u64) -> Self {
        Self {
            request_count: AtomicU64::new(0),
            slow_request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            latencies_ms: Mutex::new(LatencyWindow {
                values: VecDeque::with_capacity(LATENCY_WINDOW_SIZE),
                sum: 0,
            }),
            per_method: Mutex::new(HashMap::new()),
            slow_requests: Mutex::new(VecDeque::with_capacity(MAX_SLOW_REQUESTS)),
            slow_threshold_ms,
            started_at: Instant::now(),
        }
    }

    pub fn slow_threshold_ms(&self) -> u64 {
        self.slow_threshold_ms
    }

    /// Record a completed request. Returns true if it counted as slow.
    pub fn record_request(&self, method: &str, duration_ms: u64) -> bool {
        self.request_count.fetch_add(1, Ordering::Relaxed);

        {
            let mut per_method = self.per_method.lock();
            let entry = per_method.entry(method.to_string()).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += duration_ms;
        }

        {
            let mut window = self.latencies_ms.lock();
            if window.values.len() >= LATENCY_WINDOW_SIZE {
                if let Some(old) = window.values.pop_front() {
                    window.sum -= old;
                }
            }
            window.values.push_back(duration_ms);
            window.sum += duration_ms;
        }

        if duration_ms < self.slow_threshold_ms {
            return false;
        }

        self.slow_request_count.fetch_add(1, Ordering::Relaxed);
        let mut slow = self.slow_requests.lock();
        if slow.len() >= MAX_SLOW_REQUESTS {
            slow.pop_front();
        }
        slow.push_back(SlowRequest {
            method: method.to_string(),
            duration_ms,
            timestamp_ms: self.started_at.elapsed().as_millis() as u64,
        });
        true
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p95, p99, avg) = {
            let window = self.latencies_ms.lock();
            if window.values.is_empty() {
                (0, 0, 0, 0)
            } else {
                let mut sorted: Vec<u64> = window.values.iter().copied().collect();
                sorted.sort_unstable();

                let len = sorted.len();
                let p50 = sorted[len * 50 / 100];
                let p95 = sorted[len * 95 / 100];
                let p99 = sorted.get(len * 99 / 100).copied().unwrap_or(sorted[len - 1]);
                (p50, p95, p99, window.sum / len as u64)
            }
        };

        let mut methods: Vec<MethodStat> = self
            .per_method
            .lock()
            .iter()
            .map(|(method, (count, sum))| MethodStat {
                method: method.clone(),
                count: *count,
                avg_ms: if *count > 0 { sum / count } else { 0 },
            })
            .collect();
        methods.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.method.cmp(&b.method)));

        MetricsSnapshot {
            request_count: self.request_count.load(Ordering::Relaxed),
            slow_request_count: self.slow_request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            p50_ms: p50,
            p95_ms: p95,
            p99_ms: p99,
            avg_ms: avg,
            top_slow_requests: self.slow_requests.lock().iter().cloned().collect(),
            methods,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod metrics_tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_snapshot() {
        let snapshot = Metrics::new().snapshot();
        assert_eq!(snapshot.request_count, 0);
        assert_eq!(snapshot.p50_ms, 0);
        assert!(snapshot.methods.is_empty());
        assert!(snapshot.top_slow_requests.is_empty());
    }

    #[test]
    fn test_percentile_calculation() {
        let metrics = Metrics::new();
        for i in 1..=100 {
            metrics.record_request("findAll", i);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.p50_ms, 51);
        assert_eq!(snapshot.p95_ms, 96);
        assert_eq!(snapshot.p99_ms, 100);
        assert_eq!(snapshot.avg_ms, 50);
    }

    #[test]
    fn test_slow_request_tracking() {
        let metrics = Metrics::with_slow_threshold(50);
        assert!(!metrics.record_request("tx", 10));
        assert!(metrics.record_request("tx", 75));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.slow_request_count, 1);
        assert_eq!(snapshot.top_slow_requests[0].method, "tx");
        assert_eq!(snapshot.top_slow_requests[0].duration_ms, 75);
    }

    #[test]
    fn test_slow_requests_limited() {
        let metrics = Metrics::with_slow_threshold(1);
        for i in 0..25 {
            metrics.record_request("tx", 10 + i);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.slow_request_count, 25);
        assert_eq!(snapshot.top_slow_requests.len(), MAX_SLOW_REQUESTS);
        assert_eq!(snapshot.top_slow_requests.last().unwrap().duration_ms, 34);
    }

    #[test]
    fn test_latency_window_eviction() {
        let metrics = Metrics::new();
        for _ in 0..LATENCY_WINDOW_SIZE {
            metrics.record_request("ping", 1000);
        }
        for _ in 0..LATENCY_WINDOW_SIZE {
            metrics.record_request("ping", 1);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.avg_ms, 1);
        assert_eq!(snapshot.p99_ms, 1);
        assert_eq!(snapshot.request_count, 2 * LATENCY_WINDOW_SIZE as u64);
    }

    #[test]
    fn test_methods_ordered_by_count() {
        let metrics = Metrics::new();
        metrics.record_request("tx", 4);
        metrics.record_request("findAll", 2);
        metrics.record_request("findAll", 4);

        let methods = metrics.snapshot().methods;
        assert_eq!(methods[0].method, "findAll");
        assert_eq!(methods[0].count, 2);
        assert_eq!(methods[0].avg_ms, 3);
        assert_eq!(methods[1].method, "tx");
    }

    #[test]
    fn test_thread_safety() {
        let metrics = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&metrics);
                thread::spawn(move || {
                    for i in 0..100 {
                        m.record_request("findAll", i % 7);
                    }
                    m.record_error();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.request_count, 800);
        assert_eq!(snapshot.error_count, 8);
    }
}
