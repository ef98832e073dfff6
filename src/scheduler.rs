//! Lease timers.
//!
//! Every pending T1, T2, expiry, offer-hold and quarantine deadline is a
//! [`TimerEvent`] in a [`TimerQueue`] keyed by address. Events are replaced
//! under the address's lock whenever its lease changes, and each event
//! carries the slot generation it was scheduled against so a firing that lost
//! a race with a renewal is discarded.
//!
//! [`Scheduler`] is the background task that drains due events into
//! [`LeaseStore::expire_due`].

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::lease::{Lease, LeaseState};
use crate::store::LeaseStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// T1: informational move to `Renewing`.
    Renewal,
    /// T2: move to `Rebinding`.
    Rebinding,
    /// Lease end: back to the pool.
    Expiry,
    /// An unanswered offer lapses.
    OfferHold,
    /// A declined address becomes allocatable again.
    Quarantine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerEvent {
    pub due: DateTime<Utc>,
    pub address: Ipv4Addr,
    pub kind: TimerKind,
    pub generation: u64,
}

/// Pending events ordered by due time, with a per-address index for cancellation.
#[derive(Debug, Default)]
pub struct TimerQueue {
    events: BTreeSet<TimerEvent>,
    by_address: HashMap<Ipv4Addr, Vec<TimerEvent>>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels everything pending for `address` and schedules `events` instead.
    pub fn replace(&mut self, address: Ipv4Addr, events: Vec<TimerEvent>) {
        self.cancel(address);
        if events.is_empty() {
            return;
        }
        for event in &events {
            self.events.insert(*event);
        }
        self.by_address.insert(address, events);
    }

    pub fn cancel(&mut self, address: Ipv4Addr) {
        if let Some(events) = self.by_address.remove(&address) {
            for event in events {
                self.events.remove(&event);
            }
        }
    }

    /// Removes and returns every event due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<TimerEvent> {
        let mut due = Vec::new();
        while let Some(first) = self.events.first().copied() {
            if first.due > now {
                break;
            }
            self.events.remove(&first);
            if let Some(pending) = self.by_address.get_mut(&first.address) {
                pending.retain(|event| *event != first);
                if pending.is_empty() {
                    self.by_address.remove(&first.address);
                }
            }
            due.push(first);
        }
        due
    }

    pub fn pending(&self) -> usize {
        self.events.len()
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.events.first().map(|event| event.due)
    }

    pub fn events_for(&self, address: Ipv4Addr) -> Vec<TimerEvent> {
        self.by_address.get(&address).cloned().unwrap_or_default()
    }
}

/// Background driver for lease timers.
pub struct Scheduler {
    store: Arc<LeaseStore>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<LeaseStore>, tick: Duration) -> Self {
        Self { store, tick }
    }

    pub fn from_config(store: Arc<LeaseStore>) -> Self {
        let tick = Duration::from_millis(store.config().scheduler_tick_millis);
        Self::new(store, tick)
    }

    /// Fires everything due at the store's current time.
    pub async fn tick_once(&self) -> Vec<Lease> {
        let now = self.store.now();
        let changed = self.store.expire_due(now).await;
        for lease in &changed {
            log_transition(lease);
        }
        changed
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Lease scheduler running every {:?}", self.tick);

        loop {
            interval.tick().await;
            self.tick_once().await;
        }
    }
}

fn log_transition(lease: &Lease) {
    let client = lease
        .client_id
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string());
    match lease.state {
        LeaseState::Expired => info!("EXPIRED {} (client {})", lease.address, client),
        state => debug!("{} is now {} (client {})", lease.address, state, client),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    fn event(seconds: i64, last_octet: u8, kind: TimerKind, generation: u64) -> TimerEvent {
        TimerEvent {
            due: at(seconds),
            address: Ipv4Addr::new(10, 0, 0, last_octet),
            kind,
            generation,
        }
    }

    #[test]
    fn test_pop_due_in_order() {
        let mut queue = TimerQueue::new();
        queue.replace(
            Ipv4Addr::new(10, 0, 0, 1),
            vec![
                event(30, 1, TimerKind::Expiry, 1),
                event(10, 1, TimerKind::Renewal, 1),
            ],
        );
        queue.replace(
            Ipv4Addr::new(10, 0, 0, 2),
            vec![event(20, 2, TimerKind::OfferHold, 4)],
        );

        let due = queue.pop_due(at(25));
        assert_eq!(
            due,
            vec![
                event(10, 1, TimerKind::Renewal, 1),
                event(20, 2, TimerKind::OfferHold, 4),
            ]
        );
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.next_due(), Some(at(30)));
        assert!(queue.events_for(Ipv4Addr::new(10, 0, 0, 2)).is_empty());
    }

    #[test]
    fn test_replace_cancels_previous_events() {
        let address = Ipv4Addr::new(10, 0, 0, 1);
        let mut queue = TimerQueue::new();
        queue.replace(address, vec![event(100, 1, TimerKind::Expiry, 1)]);
        queue.replace(address, vec![event(200, 1, TimerKind::Expiry, 2)]);

        assert_eq!(queue.pending(), 1);
        assert!(queue.pop_due(at(150)).is_empty());
        assert_eq!(queue.pop_due(at(200)), vec![event(200, 1, TimerKind::Expiry, 2)]);
    }

    #[test]
    fn test_cancel_clears_address() {
        let address = Ipv4Addr::new(10, 0, 0, 1);
        let mut queue = TimerQueue::new();
        queue.replace(
            address,
            vec![
                event(10, 1, TimerKind::Renewal, 1),
                event(20, 1, TimerKind::Rebinding, 1),
            ],
        );
        queue.cancel(address);

        assert_eq!(queue.pending(), 0);
        assert!(queue.pop_due(at(1000)).is_empty());
    }

    #[test]
    fn test_due_exactly_now_fires() {
        let mut queue = TimerQueue::new();
        queue.replace(
            Ipv4Addr::new(10, 0, 0, 1),
            vec![event(50, 1, TimerKind::Expiry, 1)],
        );
        assert!(queue.pop_due(at(50) - TimeDelta::milliseconds(1)).is_empty());
        assert_eq!(queue.pop_due(at(50)).len(), 1);
    }
}
