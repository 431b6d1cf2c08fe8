//! Bounded single-reader, multi-producer logging ring.
//!
//! The daemon's logging sinks (syslog, file, netlink/STI) are out of scope
//! for this crate, but the in-process plumbing that keeps them off the main
//! loop's critical path is not: every thread (the main loop, the hardware
//! watchdog kicker, the process-watchdog tick thread) pushes formatted log
//! lines into this ring; a single dedicated consumer thread drains it and
//! hands lines to whatever sink is actually configured. A producer that
//! finds the ring full drops its message rather than blocking, since no
//! logging backpressure may ever stall a real-time thread; once the ring
//! next drains back under seven-eighths full, the consumer is handed one
//! synthetic "N messages lost" entry so the gap is visible in the sink.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Ring capacity, matching the original's fixed 128-entry buffer.
pub const CAPACITY: usize = 128;

/// One entry taken off the ring by the consumer thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// A line a producer pushed.
    Line(String),
    /// Synthetic marker emitted once the ring has drained enough that the
    /// gap left by dropped lines is worth surfacing.
    Lost(u64),
}

struct Shared {
    queue: VecDeque<LogEntry>,
    lost_since_marker: u64,
    closed: bool,
}

/// The ring itself: a bounded queue guarded by a mutex, with a condvar the
/// consumer blocks on between drains.
pub struct LogRing {
    shared: Mutex<Shared>,
    not_empty: Condvar,
}

impl LogRing {
    /// Build an empty ring at the default [`CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Mutex::new(Shared { queue: VecDeque::with_capacity(CAPACITY), lost_since_marker: 0, closed: false }),
            not_empty: Condvar::new(),
        }
    }

    /// Push a line from a producer thread. Drops the line instead of
    /// blocking if the ring is already at [`CAPACITY`].
    pub fn push(&self, line: impl Into<String>) {
        let mut guard = self.shared.lock().unwrap();
        if guard.queue.len() >= CAPACITY {
            guard.lost_since_marker += 1;
            return;
        }
        guard.queue.push_back(LogEntry::Line(line.into()));
        self.not_empty.notify_one();
    }

    /// Block until at least one entry is available (or the ring is closed),
    /// pop it, and fold in a "lost" marker if the ring has drained below
    /// seven-eighths full since the last drop.
    ///
    /// Returns `None` once the ring is closed and drained.
    pub fn pop_blocking(&self) -> Option<LogEntry> {
        let mut guard = self.shared.lock().unwrap();
        loop {
            if let Some(entry) = self.take_one(&mut guard) {
                return Some(entry);
            }
            if guard.closed {
                return None;
            }
            guard = self.not_empty.wait(guard).unwrap();
        }
    }

    /// Non-blocking variant used in tests and by a consumer that also needs
    /// to service other work between drains.
    pub fn try_pop(&self) -> Option<LogEntry> {
        let mut guard = self.shared.lock().unwrap();
        self.take_one(&mut guard)
    }

    fn take_one(&self, guard: &mut Shared) -> Option<LogEntry> {
        const DRAIN_THRESHOLD: usize = CAPACITY - CAPACITY / 8;

        if guard.lost_since_marker > 0 && guard.queue.len() < DRAIN_THRESHOLD {
            let lost = guard.lost_since_marker;
            guard.lost_since_marker = 0;
            return Some(LogEntry::Lost(lost));
        }
        guard.queue.pop_front()
    }

    /// Wake any blocked consumer and make future `pop_blocking` calls
    /// return `None` once the ring is empty. Called once at shutdown.
    pub fn close(&self) {
        self.shared.lock().unwrap().closed = true;
        self.not_empty.notify_all();
    }

    /// Number of lines currently queued (for diagnostics).
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().unwrap().queue.len()
    }

    /// Whether the ring currently holds no lines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}
