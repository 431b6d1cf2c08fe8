//! Monotonic time helpers shared by the bus, watchdogs, and policy modules.

use std::time::{Duration, Instant};

/// A monotonic instant paired with the wall-clock offset read from
/// `/proc/uptime` at process start, so persisted counters can be compared
/// against uptime across process restarts without depending on the system
/// clock (which may jump, e.g. on NTP sync).
#[derive(Debug, Clone, Copy)]
pub struct Timebase {
    started_at: Instant,
    uptime_at_start: Duration,
}

impl Timebase {
    /// Capture the current timebase using `/proc/uptime`. Falls back to
    /// zero offset if the file is unreadable (e.g. non-Linux test hosts).
    #[must_use]
    pub fn capture() -> Self {
        Self {
            started_at: Instant::now(),
            uptime_at_start: read_proc_uptime().unwrap_or_default(),
        }
    }

    /// Construct a timebase from an explicit uptime offset, for tests.
    #[must_use]
    pub fn with_uptime(uptime_at_start: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            uptime_at_start,
        }
    }

    /// System uptime "now", computed as the captured offset plus elapsed
    /// monotonic time since capture.
    #[must_use]
    pub fn uptime_now(&self) -> Duration {
        self.uptime_at_start + self.started_at.elapsed()
    }

    /// Monotonic elapsed time since this timebase was captured.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

fn read_proc_uptime() -> Option<Duration> {
    let content = std::fs::read_to_string("/proc/uptime").ok()?;
    let first = content.split_whitespace().next()?;
    let secs: f64 = first.parse().ok()?;
    Some(Duration::from_secs_f64(secs.max(0.0)))
}
