//! Kick-interval metrics collection.
//!
//! Tracks the spacing between hardware watchdog kicks (and, more generally,
//! any other periodic heartbeat) in a ring buffer histogram, without heap
//! allocation during normal operation, so the real-time kicker thread can
//! record a sample on every pass.

use std::time::Duration;

/// Kick-interval metrics with a ring buffer for latency tracking.
#[derive(Debug)]
pub struct KickMetrics {
    /// Ring buffer of interval durations in nanoseconds.
    samples: Box<[u64]>,
    /// Current write position in the ring buffer.
    write_pos: usize,
    /// Number of samples collected (saturates at buffer size).
    sample_count: usize,
    /// Total kicks recorded.
    total_kicks: u64,
    /// Minimum observed interval in nanoseconds.
    min_ns: u64,
    /// Maximum observed interval in nanoseconds.
    max_ns: u64,
    /// Sum of all intervals for mean calculation.
    sum_ns: u64,
    /// Number of intervals that exceeded the configured deadline.
    overrun_count: u64,
    /// Configured kick deadline in nanoseconds.
    deadline_ns: u64,
}

impl KickMetrics {
    /// Create a new metrics collector with the given histogram size.
    ///
    /// # Arguments
    ///
    /// * `histogram_size` - Number of samples to retain in the ring buffer.
    /// * `deadline` - Expected interval; samples exceeding this are overruns.
    #[must_use]
    pub fn new(histogram_size: usize, deadline: Duration) -> Self {
        let size = histogram_size.max(1);
        Self {
            samples: vec![0u64; size].into_boxed_slice(),
            write_pos: 0,
            sample_count: 0,
            total_kicks: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            sum_ns: 0,
            overrun_count: 0,
            deadline_ns: deadline.as_nanos() as u64,
        }
    }

    /// Record an interval.
    ///
    /// This method is allocation-free so it is safe to call from the
    /// real-time kicker thread.
    pub fn record(&mut self, duration: Duration) {
        self.record_ns(duration.as_nanos() as u64);
    }

    /// Record an interval in nanoseconds directly.
    pub fn record_ns(&mut self, ns: u64) {
        self.samples[self.write_pos] = ns;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.sample_count = self.sample_count.saturating_add(1).min(self.samples.len());

        self.total_kicks += 1;
        self.min_ns = self.min_ns.min(ns);
        self.max_ns = self.max_ns.max(ns);
        self.sum_ns = self.sum_ns.wrapping_add(ns);

        if ns > self.deadline_ns {
            self.overrun_count += 1;
        }
    }

    /// Get total number of intervals recorded.
    #[must_use]
    pub fn total_kicks(&self) -> u64 {
        self.total_kicks
    }

    /// Get minimum observed interval.
    #[must_use]
    pub fn min(&self) -> Option<Duration> {
        (self.total_kicks > 0).then(|| Duration::from_nanos(self.min_ns))
    }

    /// Get maximum observed interval.
    #[must_use]
    pub fn max(&self) -> Option<Duration> {
        (self.total_kicks > 0).then(|| Duration::from_nanos(self.max_ns))
    }

    /// Get mean interval.
    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        (self.total_kicks > 0).then(|| Duration::from_nanos(self.sum_ns / self.total_kicks))
    }

    /// Get number of overruns (intervals that exceeded the deadline).
    #[must_use]
    pub fn overrun_count(&self) -> u64 {
        self.overrun_count
    }

    /// Compute a percentile from the ring buffer.
    ///
    /// Returns `None` if no samples have been collected or the percentile is
    /// out of the `0.0..=100.0` range.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.sample_count == 0 {
            return None;
        }
        if !(0.0..=100.0).contains(&percentile) || percentile.is_nan() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();

        let idx = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        let idx = idx.min(sorted.len() - 1);

        Some(Duration::from_nanos(sorted[idx]))
    }

    /// Compute multiple percentiles efficiently. Invalid percentiles are
    /// skipped rather than causing an error.
    #[must_use]
    pub fn percentiles(&self, percentiles: &[f64]) -> Vec<(f64, Duration)> {
        if self.sample_count == 0 {
            return vec![];
        }

        let mut sorted: Vec<u64> = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();

        percentiles
            .iter()
            .filter(|&&p| (0.0..=100.0).contains(&p) && !p.is_nan())
            .map(|&p| {
                let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
                let idx = idx.min(sorted.len() - 1);
                (p, Duration::from_nanos(sorted[idx]))
            })
            .collect()
    }

    /// Get a snapshot of current metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_kicks: self.total_kicks,
            min_ns: (self.total_kicks > 0).then_some(self.min_ns),
            max_ns: (self.total_kicks > 0).then_some(self.max_ns),
            mean_ns: (self.total_kicks > 0).then(|| self.sum_ns / self.total_kicks),
            overrun_count: self.overrun_count,
            sample_count: self.sample_count,
        }
    }

    /// Reset all metrics to initial state.
    pub fn reset(&mut self) {
        self.samples.fill(0);
        self.write_pos = 0;
        self.sample_count = 0;
        self.total_kicks = 0;
        self.min_ns = u64::MAX;
        self.max_ns = 0;
        self.sum_ns = 0;
        self.overrun_count = 0;
    }
}

/// Immutable snapshot of metrics for reporting.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Total intervals recorded.
    pub total_kicks: u64,
    /// Minimum interval in nanoseconds.
    pub min_ns: Option<u64>,
    /// Maximum interval in nanoseconds.
    pub max_ns: Option<u64>,
    /// Mean interval in nanoseconds.
    pub mean_ns: Option<u64>,
    /// Number of overruns.
    pub overrun_count: u64,
    /// Number of samples in the histogram.
    pub sample_count: usize,
}

impl MetricsSnapshot {
    /// Get jitter (max - min) in nanoseconds.
    #[must_use]
    pub fn jitter_ns(&self) -> Option<u64> {
        match (self.min_ns, self.max_ns) {
            (Some(min), Some(max)) => Some(max - min),
            _ => None,
        }
    }
}
