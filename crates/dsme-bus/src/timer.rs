//! Monotonic-clock timer wheel.
//!
//! A min-heap of `{deadline, callback}` pairs. The event loop computes
//! `next_deadline() - now` and blocks on its I/O multiplexer for at most
//! that long, then calls [`TimerWheel::fire_ready`]. A callback returning
//! `true` is re-armed at `now + period`; `false` destroys it.
//!
//! The daemon runs two wheels side by side — one for the high-priority
//! watchdog-kicker cadence, one for everything else — so the event loop can
//! drain the high wheel before message dispatch on each tick and the normal
//! wheel after, per the two priority classes the module kernel defines.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Identifies a timer so it can be cancelled before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// An owning handle to an armed timer, returned so the owning module can
/// cancel it early (e.g. from `fini`).
#[derive(Debug, Clone, Copy)]
pub struct TimerHandle(TimerId);

impl TimerHandle {
    /// The underlying timer identity.
    #[must_use]
    pub fn id(&self) -> TimerId {
        self.0
    }
}

struct Entry {
    deadline: Instant,
    period: Duration,
    callback: Box<dyn FnMut() -> bool + Send>,
}

/// A monotonic min-heap of timers.
#[derive(Default)]
pub struct TimerWheel {
    next_id: u64,
    entries: HashMap<TimerId, Entry>,
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
}

impl TimerWheel {
    /// Create an empty timer wheel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a new timer. `callback` is invoked once `deadline` has passed;
    /// if it returns `true` the timer is re-armed at `now + period`.
    pub fn arm(
        &mut self,
        deadline: Instant,
        period: Duration,
        callback: impl FnMut() -> bool + Send + 'static,
    ) -> TimerHandle {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.entries.insert(
            id,
            Entry {
                deadline,
                period,
                callback: Box::new(callback),
            },
        );
        self.heap.push(Reverse((deadline, id)));
        TimerHandle(id)
    }

    /// Convenience: arm a periodic timer starting `period` from now.
    pub fn arm_periodic(
        &mut self,
        now: Instant,
        period: Duration,
        callback: impl FnMut() -> bool + Send + 'static,
    ) -> TimerHandle {
        self.arm(now + period, period, callback)
    }

    /// Cancel a timer before it fires. A no-op if it already fired or was
    /// already cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.entries.remove(&handle.0);
    }

    /// The deadline of the next timer to fire, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Fire every timer whose deadline has passed `now`, re-arming those
    /// whose callback requests it.
    pub fn fire_ready(&mut self, now: Instant) {
        while let Some(&Reverse((deadline, id))) = self.heap.peek() {
            if deadline > now {
                break;
            }
            self.heap.pop();

            let Some(entry) = self.entries.get_mut(&id) else {
                // Cancelled since it was scheduled; drop the stale heap slot.
                continue;
            };

            let rearm = (entry.callback)();
            if rearm {
                let period = entry.period;
                entry.deadline = now + period;
                let next_deadline = entry.deadline;
                self.heap.push(Reverse((next_deadline, id)));
            } else {
                self.entries.remove(&id);
            }
        }
    }

    /// Number of timers currently armed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no timers are currently armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
