//! In-process performance monitoring
//!
//! Named counters plus a sliding window of operation samples. The window
//! holds the last `window` of samples (default 60s); snapshots prune
//! anything older before computing latency percentiles and throughput.
//! Each monitor is private to its owning component.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct OpSample {
    at: Instant,
    latency: Duration,
}

/// Counters and sliding-window stats for one component.
pub struct PerformanceMonitor {
    counters: Mutex<FxHashMap<String, u64>>,
    window: Mutex<VecDeque<OpSample>>,
    window_span: Duration,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl PerformanceMonitor {
    /// Monitor with the given sliding-window span.
    pub fn new(window_span: Duration) -> Self {
        PerformanceMonitor {
            counters: Mutex::new(FxHashMap::default()),
            window: Mutex::new(VecDeque::new()),
            window_span,
        }
    }

    /// Increment a named counter by one.
    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    /// Increment a named counter by `delta`.
    pub fn add(&self, name: &str, delta: u64) {
        *self.counters.lock().entry(name.to_string()).or_insert(0) += delta;
    }

    /// Current value of a named counter.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    /// Record one operation's latency into the sliding window.
    pub fn record_latency(&self, latency: Duration) {
        let mut window = self.window.lock();
        window.push_back(OpSample {
            at: Instant::now(),
            latency,
        });
        // opportunistic prune so the deque stays bounded under load
        if let Some(cutoff) = Instant::now().checked_sub(self.window_span) {
            while window.front().map_or(false, |s| s.at < cutoff) {
                window.pop_front();
            }
        }
    }

    /// Prune the window and compute a snapshot.
    pub fn snapshot(&self) -> MonitorSnapshot {
        let counters = self.counters.lock().clone();
        let mut window = self.window.lock();
        if let Some(cutoff) = Instant::now().checked_sub(self.window_span) {
            while window.front().map_or(false, |s| s.at < cutoff) {
                window.pop_front();
            }
        }

        let mut latencies: Vec<Duration> = window.iter().map(|s| s.latency).collect();
        latencies.sort();
        let percentile = |p: f64| -> Duration {
            if latencies.is_empty() {
                Duration::ZERO
            } else {
                let idx = ((latencies.len() as f64 - 1.0) * p).round() as usize;
                latencies[idx]
            }
        };

        MonitorSnapshot {
            counters: counters.into_iter().collect(),
            sample_count: latencies.len(),
            ops_per_sec: latencies.len() as f64 / self.window_span.as_secs_f64(),
            p50: percentile(0.50),
            p95: percentile(0.95),
            max: latencies.last().copied().unwrap_or(Duration::ZERO),
        }
    }
}

/// Point-in-time view of a monitor.
#[derive(Debug, Clone)]
pub struct MonitorSnapshot {
    /// Counter values at snapshot time
    pub counters: Vec<(String, u64)>,
    /// Samples inside the window
    pub sample_count: usize,
    /// Window throughput
    pub ops_per_sec: f64,
    /// Median latency
    pub p50: Duration,
    /// 95th percentile latency
    pub p95: Duration,
    /// Worst latency in the window
    pub max: Duration,
}

impl MonitorSnapshot {
    /// Look up a counter by name.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }
}
