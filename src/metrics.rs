//! Metrics collection for the clearance/interception engine
//!
//! Std-only metrics: atomic counters for the three driving operations and
//! the out-of-band replays, a ring-buffer histogram for operation
//! durations, and Prometheus text export. Callers that already run a
//! metrics endpoint can scrape [`Metrics::to_prometheus_format`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

/// Maximum number of duration samples kept in the histogram
const MAX_HISTOGRAM_SAMPLES: usize = 1000;

/// Metrics for the engine's operations
#[derive(Debug)]
pub struct Metrics {
    /// Total script evaluations started
    pub evaluations_total: AtomicU64,
    /// Total clearance solve attempts started
    pub clearance_attempts_total: AtomicU64,
    /// Total interception sessions started
    pub interception_sessions_total: AtomicU64,
    /// Total requests accepted across all interception sessions
    pub requests_captured_total: AtomicU64,
    /// Total out-of-band replays attempted
    pub replays_total: AtomicU64,
    /// Replays that failed and fell through to engine handling
    pub replay_failures_total: AtomicU64,
    /// Total errors encountered
    pub errors_total: AtomicU64,

    /// Operation durations for percentile calculation
    op_durations: RwLock<RingBuffer<Duration>>,
    /// Errors broken down by type
    errors_by_type: RwLock<HashMap<String, u64>>,
}

/// Memory-efficient ring buffer for histogram samples
#[derive(Debug)]
struct RingBuffer<T> {
    data: Vec<T>,
    capacity: usize,
    write_pos: usize,
}

impl<T: Clone + Ord> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            write_pos: 0,
        }
    }

    fn push(&mut self, value: T) {
        if self.data.len() < self.capacity {
            self.data.push(value);
        } else {
            self.data[self.write_pos] = value;
        }
        self.write_pos = (self.write_pos + 1) % self.capacity;
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    /// Percentile over the retained window (0.0 to 1.0)
    fn percentile(&self, p: f64) -> Option<T> {
        if self.data.is_empty() {
            return None;
        }
        let mut sorted = self.data.clone();
        sorted.sort();
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted.get(idx).cloned()
    }
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self {
            evaluations_total: AtomicU64::new(0),
            clearance_attempts_total: AtomicU64::new(0),
            interception_sessions_total: AtomicU64::new(0),
            requests_captured_total: AtomicU64::new(0),
            replays_total: AtomicU64::new(0),
            replay_failures_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            op_durations: RwLock::new(RingBuffer::new(MAX_HISTOGRAM_SAMPLES)),
            errors_by_type: RwLock::new(HashMap::new()),
        }
    }

    /// Record a completed script evaluation
    pub fn record_evaluation(&self, duration: Duration) {
        self.evaluations_total.fetch_add(1, Ordering::Relaxed);
        self.push_duration(duration);
    }

    /// Record a completed clearance attempt
    pub fn record_clearance_attempt(&self, duration: Duration) {
        self.clearance_attempts_total.fetch_add(1, Ordering::Relaxed);
        self.push_duration(duration);
    }

    /// Record a completed interception session and how many requests it kept
    pub fn record_interception(&self, captured: usize, duration: Duration) {
        self.interception_sessions_total
            .fetch_add(1, Ordering::Relaxed);
        self.requests_captured_total
            .fetch_add(captured as u64, Ordering::Relaxed);
        self.push_duration(duration);
    }

    /// Record an out-of-band replay attempt
    pub fn record_replay(&self, ok: bool) {
        self.replays_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.replay_failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an error
    pub fn record_error(&self, error_type: &str) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut breakdown) = self.errors_by_type.write() {
            *breakdown.entry(error_type.to_string()).or_insert(0) += 1;
        }
    }

    fn push_duration(&self, duration: Duration) {
        if let Ok(mut durations) = self.op_durations.write() {
            durations.push(duration);
        }
    }

    /// Convert metrics to Prometheus text format
    pub fn to_prometheus_format(&self) -> String {
        let mut output = String::new();

        output.push_str(&format!(
            "sekisho_evaluations_total {}\n",
            self.evaluations_total.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "sekisho_clearance_attempts_total {}\n",
            self.clearance_attempts_total.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "sekisho_interception_sessions_total {}\n",
            self.interception_sessions_total.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "sekisho_requests_captured_total {}\n",
            self.requests_captured_total.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "sekisho_replays_total {}\n",
            self.replays_total.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "sekisho_replay_failures_total {}\n",
            self.replay_failures_total.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "sekisho_errors_total {}\n",
            self.errors_total.load(Ordering::Relaxed)
        ));

        if let Ok(durations) = self.op_durations.read() {
            if durations.len() > 0 {
                if let Some(p50) = durations.percentile(0.5) {
                    output.push_str(&format!(
                        "sekisho_op_duration_p50_ms {}\n",
                        p50.as_millis()
                    ));
                }
                if let Some(p95) = durations.percentile(0.95) {
                    output.push_str(&format!(
                        "sekisho_op_duration_p95_ms {}\n",
                        p95.as_millis()
                    ));
                }
                if let Some(p99) = durations.percentile(0.99) {
                    output.push_str(&format!(
                        "sekisho_op_duration_p99_ms {}\n",
                        p99.as_millis()
                    ));
                }
            }
        }

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get or initialize the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
