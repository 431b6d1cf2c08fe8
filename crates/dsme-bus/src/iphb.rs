//! IP-Heartbeat (IPHB) wake-up coalescing broker.
//!
//! Subscribers publish a `(min, max)` window relative to "now"; the broker
//! picks one fire instant that every currently eligible subscriber can live
//! with, so many independent polling loops (disk monitor, process
//! watchdog, power-on timer) share a single wake-up instead of each
//! keeping the CPU awake on its own schedule. A subscription is
//! single-shot: a subscriber that wants periodic wakes resubscribes from
//! its own handler once it has been woken.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Identifies an outstanding IPHB subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscription {
    min_deadline: Instant,
    max_deadline: Instant,
    /// Id of the owning module, so [`IphbBroker::drop_owner`] can sweep
    /// subscriptions left behind by a module that unloaded.
    owner: u32,
}

/// The coalescing wake-up broker.
#[derive(Default)]
pub struct IphbBroker {
    next_id: u64,
    subs: HashMap<SubscriptionId, Subscription>,
}

impl IphbBroker {
    /// Create a broker with no outstanding subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe for a wake-up between `min` and `max` seconds from `now`.
    pub fn subscribe(
        &mut self,
        now: Instant,
        min: Duration,
        max: Duration,
        owner: u32,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subs.insert(
            id,
            Subscription {
                min_deadline: now + min,
                max_deadline: now + max,
                owner,
            },
        );
        id
    }

    /// Cancel a subscription before it fires.
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subs.remove(&id);
    }

    /// Drop every subscription owned by `owner` (a module that unloaded).
    pub fn drop_owner(&mut self, owner: u32) {
        self.subs.retain(|_, sub| sub.owner != owner);
    }

    /// The next instant the broker would fire if nothing else changes.
    ///
    /// When subscriber windows intersect, that instant is the earliest time
    /// every window already admits (the latest of all `min`s). When no
    /// intersection exists, it is the earliest deadline that cannot be
    /// delayed any further (the earliest `max`).
    #[must_use]
    pub fn next_fire(&self) -> Option<Instant> {
        if self.subs.is_empty() {
            return None;
        }
        let lo = self.subs.values().map(|s| s.min_deadline).max()?;
        let hi = self.subs.values().map(|s| s.max_deadline).min()?;
        Some(if lo <= hi { lo } else { hi })
    }

    /// Fire and remove every subscription whose window is satisfied by
    /// `now`. Returns `(id, owner)` pairs so a caller with several owners
    /// sharing one broker (disk monitor, power-on timer, ...) knows which
    /// of them to re-dispatch to; oldest-registered first is not
    /// guaranteed — callers should not depend on order.
    pub fn fire_due(&mut self, now: Instant) -> Vec<(SubscriptionId, u32)> {
        let Some(fire_time) = self.next_fire() else {
            return Vec::new();
        };
        if now < fire_time {
            return Vec::new();
        }

        let lo = self.subs.values().map(|s| s.min_deadline).max().unwrap();
        let hi = self.subs.values().map(|s| s.max_deadline).min().unwrap();

        let ready: Vec<SubscriptionId> = if lo <= hi {
            // Common window exists: every subscriber can be woken together.
            self.subs.keys().copied().collect()
        } else {
            // No intersection: only the subscriber(s) that cannot wait any
            // longer fire this round; the rest keep their own deadline.
            self.subs
                .iter()
                .filter(|(_, sub)| sub.max_deadline == hi)
                .map(|(id, _)| *id)
                .collect()
        };

        ready
            .into_iter()
            .filter_map(|id| self.subs.remove(&id).map(|sub| (id, sub.owner)))
            .collect()
    }

    /// Number of outstanding subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// Whether there are no outstanding subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_subscriber_fires_within_window() {
        let mut broker = IphbBroker::new();
        let now = Instant::now();
        broker.subscribe(now, Duration::from_secs(28), Duration::from_secs(30), 1);

        assert!(broker.fire_due(now + Duration::from_secs(20)).is_empty());
        let fired = broker.fire_due(now + Duration::from_secs(29));
        assert_eq!(fired.len(), 1);
        assert!(broker.is_empty());
    }

    #[test]
    fn overlapping_subscribers_coalesce_on_one_tick() {
        let mut broker = IphbBroker::new();
        let now = Instant::now();
        // Disk monitor: 28-32 min; process-watchdog-like: 24-40 min.
        broker.subscribe(now, Duration::from_secs(28 * 60), Duration::from_secs(32 * 60), 1);
        broker.subscribe(now, Duration::from_secs(24 * 60), Duration::from_secs(40 * 60), 2);

        let fire_time = broker.next_fire().unwrap();
        assert_eq!(fire_time, now + Duration::from_secs(28 * 60));

        let fired = broker.fire_due(fire_time);
        assert_eq!(fired.len(), 2);
    }

    #[test]
    fn disjoint_windows_fire_only_the_one_that_cannot_wait() {
        let mut broker = IphbBroker::new();
        let now = Instant::now();
        let a = broker.subscribe(now, Duration::from_secs(10), Duration::from_secs(15), 1);
        let _b = broker.subscribe(now, Duration::from_secs(30), Duration::from_secs(40), 2);

        // No overlap between [10,15] and [30,40]: earliest max is 15s, and
        // only the subscriber whose window ends there fires.
        let fire_time = broker.next_fire().unwrap();
        assert_eq!(fire_time, now + Duration::from_secs(15));

        let fired = broker.fire_due(fire_time);
        assert_eq!(fired, vec![(a, 1)]);
        assert_eq!(broker.len(), 1);
    }

    #[test]
    fn drop_owner_removes_its_subscriptions_only() {
        let mut broker = IphbBroker::new();
        let now = Instant::now();
        broker.subscribe(now, Duration::from_secs(1), Duration::from_secs(2), 1);
        broker.subscribe(now, Duration::from_secs(1), Duration::from_secs(2), 2);

        broker.drop_owner(1);
        assert_eq!(broker.len(), 1);
    }

    #[test]
    fn empty_broker_has_no_next_fire() {
        let broker = IphbBroker::new();
        assert!(broker.next_fire().is_none());
    }
}
