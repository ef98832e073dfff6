//! The authoritative lease table.
//!
//! Every pool address owns a slot behind its own [`Mutex`]; an immutable
//! index maps addresses to slots, so operations on different addresses never
//! contend. Three small side structures are kept in step with the slots:
//!
//! - the free set, the only thing new-address allocation locks as a whole;
//! - the client index (client id to the address it holds);
//! - the [`TimerQueue`] of pending lease deadlines.
//!
//! Lock order is slot before any side structure, and slots in ascending
//! address order when two are needed. Allocation holds the free set and
//! only ever `try_lock`s slots, skipping busy ones.
//!
//! Changes that produce or remove a binding are written to the
//! [`LeaseBackend`] before the slot is touched; if that write fails the slot
//! is left as it was.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::{ClientId, Lease, LeaseState, Reservation, ReservationSource};
use crate::persist::{LeaseBackend, LeaseRecord};
use crate::scheduler::{TimerEvent, TimerKind, TimerQueue};

/// Times a two-address operation re-reads the client index before giving up.
const LOCK_ATTEMPTS: usize = 3;

#[derive(Debug)]
struct Slot {
    lease: Lease,
    reservation: Option<Reservation>,
    generation: u64,
}

impl Slot {
    fn address(&self) -> Ipv4Addr {
        self.lease.address
    }

    fn idle_lease(&self) -> Lease {
        Lease::idle(self.address(), self.reservation.is_some())
    }

    fn is_allocatable(&self) -> bool {
        self.lease.state == LeaseState::Free && self.reservation.is_none()
    }

    fn admits(&self, client_id: &ClientId) -> bool {
        self.reservation
            .as_ref()
            .is_none_or(|reservation| reservation.admits(client_id))
    }

    fn admin_reservation(&self) -> Option<Reservation> {
        self.reservation
            .clone()
            .filter(|reservation| reservation.source == ReservationSource::Admin)
    }

    fn record_for(&self, lease: Lease) -> LeaseRecord {
        LeaseRecord {
            lease,
            reservation: self.admin_reservation(),
        }
    }

    fn timer_events(&self) -> Vec<TimerEvent> {
        let lease = &self.lease;
        let mut events = Vec::new();
        let mut schedule = |due: Option<DateTime<Utc>>, kind: TimerKind| {
            if let Some(due) = due {
                events.push(TimerEvent {
                    due,
                    address: lease.address,
                    kind,
                    generation: self.generation,
                });
            }
        };

        match lease.state {
            LeaseState::Bound => {
                schedule(lease.t1_time, TimerKind::Renewal);
                schedule(lease.t2_time, TimerKind::Rebinding);
                schedule(lease.lease_end, TimerKind::Expiry);
            }
            LeaseState::Renewing => {
                schedule(lease.t2_time, TimerKind::Rebinding);
                schedule(lease.lease_end, TimerKind::Expiry);
            }
            LeaseState::Rebinding => schedule(lease.lease_end, TimerKind::Expiry),
            LeaseState::Offered => schedule(lease.lease_end, TimerKind::OfferHold),
            LeaseState::Declined => schedule(lease.lease_end, TimerKind::Quarantine),
            _ => {}
        }

        events
    }
}

async fn lock_pair<'a>(
    first: &'a Mutex<Slot>,
    second: &'a Mutex<Slot>,
    first_is_lower: bool,
) -> (MutexGuard<'a, Slot>, MutexGuard<'a, Slot>) {
    if first_is_lower {
        let first = first.lock().await;
        let second = second.lock().await;
        (first, second)
    } else {
        let second = second.lock().await;
        let first = first.lock().await;
        (first, second)
    }
}

pub struct LeaseStore {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    backend: Arc<dyn LeaseBackend>,
    slots: Vec<Mutex<Slot>>,
    index: HashMap<Ipv4Addr, usize>,
    clients: RwLock<HashMap<ClientId, Ipv4Addr>>,
    reservations: RwLock<HashMap<ClientId, Ipv4Addr>>,
    free: Mutex<BTreeSet<Ipv4Addr>>,
    timers: Mutex<TimerQueue>,
}

impl LeaseStore {
    /// Builds the table for the configured pool and replays the journal.
    ///
    /// Bindings come back with their persisted timestamps and their timers
    /// are rebuilt from those; anything already due fires on the first
    /// scheduler tick. Offers do not survive a restart. Opening never writes
    /// to the backend.
    pub async fn open(
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        backend: Arc<dyn LeaseBackend>,
    ) -> Result<Self> {
        let now = clock.now();

        let mut static_reservations = HashMap::new();
        for binding in &config.static_bindings {
            static_reservations.insert(
                binding.ip_address,
                Reservation {
                    client_id: Some(binding.client_id()?),
                    source: ReservationSource::Config,
                },
            );
        }

        let mut latest: HashMap<Ipv4Addr, LeaseRecord> = HashMap::new();
        for record in backend.load().await? {
            latest.insert(record.lease.address, record);
        }

        let mut slots = Vec::new();
        let mut index = HashMap::new();
        let mut clients = HashMap::new();
        let mut reservations = HashMap::new();
        let mut free = BTreeSet::new();
        let mut timers = TimerQueue::new();

        for address in config.pool_addresses() {
            let mut reservation = static_reservations.remove(&address);
            let mut lease = Lease::idle(address, false);

            if let Some(record) = latest.remove(&address) {
                if reservation.is_none() {
                    reservation = record
                        .reservation
                        .filter(|reservation| reservation.source == ReservationSource::Admin);
                }
                lease = record.lease;
            }

            let restored = match lease.state {
                state if state.is_bound() => match (&lease.client_id, lease.lease_end) {
                    (Some(client_id), Some(_)) if !clients.contains_key(client_id) => {
                        clients.insert(client_id.clone(), address);
                        lease.state = LeaseState::Bound;
                        true
                    }
                    _ => {
                        warn!("Discarding inconsistent lease record for {}", address);
                        false
                    }
                },
                LeaseState::Declined => {
                    lease.lease_end.get_or_insert(now);
                    true
                }
                _ => false,
            };
            if !restored {
                lease = Lease::idle(address, reservation.is_some());
            }

            if let Some(client_id) = reservation.as_ref().and_then(|r| r.client_id.clone()) {
                reservations.insert(client_id, address);
            }

            let slot = Slot {
                lease,
                reservation,
                generation: 0,
            };
            if slot.is_allocatable() {
                free.insert(address);
            }
            timers.replace(address, slot.timer_events());

            index.insert(address, slots.len());
            slots.push(Mutex::new(slot));
        }

        for address in latest.keys() {
            warn!("Ignoring journal record for {} outside the pool", address);
        }

        let store = Self {
            config,
            clock,
            backend,
            slots,
            index,
            clients: RwLock::new(clients),
            reservations: RwLock::new(reservations),
            free: Mutex::new(free),
            timers: Mutex::new(timers),
        };

        info!(
            "Lease store ready: {} addresses, {} bound, {} free",
            store.slots.len(),
            store.active_count().await,
            store.free_count().await
        );

        Ok(store)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Whether `address` is an allocatable pool member (in range, not excluded).
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.index.contains_key(&address)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, address: Ipv4Addr) -> Result<&Mutex<Slot>> {
        self.index
            .get(&address)
            .map(|&position| &self.slots[position])
            .ok_or(Error::AddressOutOfRange(address))
    }

    async fn persist_required(&self, record: LeaseRecord) -> Result<()> {
        self.backend.append(&record).await.map_err(|error| {
            error!(
                "Failed to persist lease for {}: {}",
                record.lease.address, error
            );
            Error::Persistence(error.to_string())
        })
    }

    async fn persist_best_effort(&self, record: LeaseRecord) {
        if let Err(error) = self.backend.append(&record).await {
            error!(
                "Failed to persist {} state for {}: {}",
                record.lease.state, record.lease.address, error
            );
        }
    }

    /// Replaces the slot's lease and brings the side structures in line.
    ///
    /// Bumps the generation, so every timer scheduled before is void.
    async fn install(&self, slot: &mut Slot, lease: Lease) {
        let address = slot.address();
        let previous = slot
            .lease
            .client_id
            .clone()
            .filter(|_| slot.lease.state.is_active());

        slot.lease = lease;
        slot.generation += 1;

        {
            let mut clients = self.clients.write().await;
            if let Some(previous) = previous
                && clients.get(&previous) == Some(&address)
            {
                clients.remove(&previous);
            }
            if slot.lease.state.is_active()
                && let Some(client_id) = &slot.lease.client_id
            {
                clients.insert(client_id.clone(), address);
            }
        }

        {
            let mut free = self.free.lock().await;
            if slot.is_allocatable() {
                free.insert(address);
            } else {
                free.remove(&address);
            }
        }

        self.timers
            .lock()
            .await
            .replace(address, slot.timer_events());
    }

    /// Reserves the client index entry for `address`.
    ///
    /// Returns the other address if the client already holds one.
    async fn claim_client(&self, client_id: &ClientId, address: Ipv4Addr) -> Option<Ipv4Addr> {
        let mut clients = self.clients.write().await;
        match clients.get(client_id) {
            Some(&held) if held != address => Some(held),
            _ => {
                clients.insert(client_id.clone(), address);
                None
            }
        }
    }

    async fn offer_locked(
        &self,
        slot: &mut Slot,
        client_id: &ClientId,
        xid: u32,
    ) -> Result<Ipv4Addr> {
        let address = slot.address();
        if let Some(held) = self.claim_client(client_id, address).await {
            debug!("{} already holds {}, not offering {}", client_id, held, address);
            return Ok(held);
        }

        let now = self.clock.now();
        let hold_until = now + TimeDelta::seconds(i64::from(self.config.offer_timeout_seconds));
        self.install(
            slot,
            Lease::offered(address, client_id.clone(), xid, now, hold_until),
        )
        .await;
        debug!("{} offered to {} until {}", address, client_id, hold_until);
        Ok(address)
    }

    /// Marks the lowest free address `Offered` to `client_id`.
    ///
    /// Addresses whose lock is held elsewhere are skipped rather than waited
    /// for. If the client turns out to hold an address already, that address
    /// is returned and nothing new is offered.
    ///
    /// # Errors
    ///
    /// [`Error::PoolExhausted`] when no free address could be taken.
    pub async fn allocate_candidate(&self, client_id: &ClientId, xid: u32) -> Result<Ipv4Addr> {
        let mut slot = {
            let free = self.free.lock().await;
            let mut chosen = None;
            for address in free.iter() {
                let Some(&position) = self.index.get(address) else {
                    continue;
                };
                match self.slots[position].try_lock() {
                    Ok(guard) if guard.is_allocatable() => {
                        chosen = Some(guard);
                        break;
                    }
                    Ok(_) => continue,
                    Err(_) => debug!("{} is busy, trying the next address", address),
                }
            }
            chosen.ok_or(Error::PoolExhausted)?
        };

        self.offer_locked(&mut slot, client_id, xid).await
    }

    /// Offers a specific address to `client_id`.
    ///
    /// Refreshes the hold when it is already offered to this client and
    /// leaves it alone when the client already has it bound.
    pub async fn try_offer(
        &self,
        address: Ipv4Addr,
        client_id: &ClientId,
        xid: u32,
    ) -> Result<Ipv4Addr> {
        let Ok(mut slot) = self.slot(address)?.try_lock() else {
            return Err(Error::AddressBusy(address));
        };

        match slot.lease.state {
            LeaseState::Offered if slot.lease.is_held_by(client_id) => {
                self.offer_locked(&mut slot, client_id, xid).await
            }
            state if state.is_bound() && slot.lease.is_held_by(client_id) => Ok(address),
            LeaseState::Free | LeaseState::Reserved if slot.admits(client_id) => {
                self.offer_locked(&mut slot, client_id, xid).await
            }
            LeaseState::Declined => Err(Error::AddressConflict(address)),
            _ => Err(Error::ClientMismatch(address)),
        }
    }

    /// Binds `address` to `client_id` for `lease_duration` seconds.
    ///
    /// Accepts an address offered to or bound to this client, a reservation
    /// for it, or any free address (a client rebinding from another server).
    /// A second identical request (same client and xid) returns the existing
    /// lease untouched. If the client held a different address, that one is
    /// released in the same step.
    ///
    /// # Errors
    ///
    /// - [`Error::AddressOutOfRange`] if the address is not in the pool
    /// - [`Error::ClientMismatch`] if another client holds or reserved it
    /// - [`Error::AddressConflict`] if it is quarantined
    /// - [`Error::Persistence`] if the binding could not be written
    pub async fn confirm(
        &self,
        address: Ipv4Addr,
        client_id: &ClientId,
        xid: u32,
        lease_duration: u32,
        hostname: Option<String>,
    ) -> Result<Lease> {
        let target = self.slot(address)?;

        for _ in 0..LOCK_ATTEMPTS {
            let elsewhere = self
                .active_address(client_id)
                .await
                .filter(|&held| held != address);

            match elsewhere {
                None => {
                    let mut slot = target.lock().await;
                    if self
                        .active_address(client_id)
                        .await
                        .is_some_and(|held| held != address)
                    {
                        continue;
                    }
                    return self
                        .confirm_locked(&mut slot, None, client_id, xid, lease_duration, hostname)
                        .await;
                }
                Some(other) => {
                    let (mut slot, mut previous) =
                        lock_pair(target, self.slot(other)?, address < other).await;
                    if self.active_address(client_id).await != Some(other) {
                        continue;
                    }
                    return self
                        .confirm_locked(
                            &mut slot,
                            Some(&mut previous),
                            client_id,
                            xid,
                            lease_duration,
                            hostname,
                        )
                        .await;
                }
            }
        }

        warn!("Gave up confirming {} for {} under contention", address, client_id);
        Err(Error::AddressBusy(address))
    }

    async fn confirm_locked(
        &self,
        slot: &mut Slot,
        previous: Option<&mut Slot>,
        client_id: &ClientId,
        xid: u32,
        lease_duration: u32,
        hostname: Option<String>,
    ) -> Result<Lease> {
        let address = slot.address();

        if slot.lease.state == LeaseState::Declined {
            return Err(Error::AddressConflict(address));
        }
        if !slot.admits(client_id) {
            return Err(Error::ClientMismatch(address));
        }
        if slot.lease.state.is_active() && !slot.lease.is_held_by(client_id) {
            return Err(Error::ClientMismatch(address));
        }
        if slot.lease.state.is_bound() && slot.lease.xid == Some(xid) {
            debug!("Replayed xid {:#010x} for {}", xid, address);
            return Ok(slot.lease.clone());
        }

        let hostname = hostname.or_else(|| {
            slot.lease
                .is_held_by(client_id)
                .then(|| slot.lease.hostname.clone())
                .flatten()
        });
        let bound = Lease::bound(
            address,
            client_id.clone(),
            xid,
            self.clock.now(),
            self.config.lease_timing(lease_duration),
            hostname,
        );

        self.persist_required(slot.record_for(bound.clone())).await?;

        if let Some(previous) = previous
            && previous.lease.is_held_by(client_id)
        {
            let idle = previous.idle_lease();
            self.persist_best_effort(previous.record_for(idle.clone()))
                .await;
            info!(
                "{} moved from {} to {}",
                client_id,
                previous.address(),
                address
            );
            self.install(previous, idle).await;
        }

        self.install(slot, bound.clone()).await;
        Ok(bound)
    }

    /// Extends the client's existing binding on `address`.
    ///
    /// # Errors
    ///
    /// - [`Error::LeaseNotFound`] if nothing is bound there
    /// - [`Error::ClientMismatch`] if it is bound to someone else
    /// - [`Error::Persistence`] if the extension could not be written
    pub async fn renew(
        &self,
        address: Ipv4Addr,
        client_id: &ClientId,
        xid: u32,
        lease_duration: u32,
    ) -> Result<Lease> {
        let Ok(mutex) = self.slot(address) else {
            return Err(Error::LeaseNotFound(address));
        };
        let mut slot = mutex.lock().await;

        if !slot.lease.state.is_bound() {
            return Err(Error::LeaseNotFound(address));
        }
        if !slot.lease.is_held_by(client_id) {
            return Err(Error::ClientMismatch(address));
        }
        if slot.lease.xid == Some(xid) {
            return Ok(slot.lease.clone());
        }

        let renewed = Lease::bound(
            address,
            client_id.clone(),
            xid,
            self.clock.now(),
            self.config.lease_timing(lease_duration),
            slot.lease.hostname.clone(),
        );
        self.persist_required(slot.record_for(renewed.clone()))
            .await?;
        self.install(&mut slot, renewed.clone()).await;
        Ok(renewed)
    }

    /// Gives the client's address back to the pool.
    ///
    /// Returns the lease as it was at release, in state `Released`.
    pub async fn release(&self, address: Ipv4Addr, client_id: &ClientId) -> Result<Lease> {
        let Ok(mutex) = self.slot(address) else {
            return Err(Error::LeaseNotFound(address));
        };
        let mut slot = mutex.lock().await;

        if !slot.lease.is_held_by(client_id) {
            return Err(Error::LeaseNotFound(address));
        }

        let mut released = slot.lease.clone();
        released.state = LeaseState::Released;

        let idle = slot.idle_lease();
        self.persist_best_effort(slot.record_for(idle.clone())).await;
        self.install(&mut slot, idle).await;
        Ok(released)
    }

    /// The client reports the address in use by someone else.
    pub async fn decline(&self, address: Ipv4Addr, client_id: &ClientId) -> Result<Lease> {
        let Ok(mutex) = self.slot(address) else {
            return Err(Error::LeaseNotFound(address));
        };
        let mut slot = mutex.lock().await;

        if !slot.lease.is_held_by(client_id) {
            return Err(Error::LeaseNotFound(address));
        }
        Ok(self.quarantine_locked(&mut slot).await)
    }

    /// Pulls `address` out of allocation for the configured cooldown.
    pub async fn quarantine(&self, address: Ipv4Addr) -> Result<Lease> {
        let mut slot = self.slot(address)?.lock().await;
        Ok(self.quarantine_locked(&mut slot).await)
    }

    async fn quarantine_locked(&self, slot: &mut Slot) -> Lease {
        let address = slot.address();
        let now = self.clock.now();
        let until = now + TimeDelta::seconds(i64::from(self.config.decline_quarantine_seconds));
        let declined = Lease::declined(address, now, until);

        self.persist_best_effort(slot.record_for(declined.clone()))
            .await;
        self.install(slot, declined.clone()).await;
        warn!("{} quarantined until {}", address, until);
        declined
    }

    /// Drops the client's pending offer, if it has one.
    pub async fn withdraw_offer(&self, client_id: &ClientId) -> Option<Ipv4Addr> {
        let address = self.active_address(client_id).await?;
        let mut slot = self.slot(address).ok()?.lock().await;

        if slot.lease.state == LeaseState::Offered && slot.lease.is_held_by(client_id) {
            let idle = slot.idle_lease();
            self.install(&mut slot, idle).await;
            Some(address)
        } else {
            None
        }
    }

    /// Fires every timer due at `now` and returns the leases it changed.
    ///
    /// Expired leases are reported in state `Expired`; everything else as
    /// it is after the transition.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Vec<Lease> {
        let due = self.timers.lock().await.pop_due(now);
        let mut changed = Vec::new();

        for event in due {
            let Ok(mutex) = self.slot(event.address) else {
                continue;
            };
            let mut slot = mutex.lock().await;

            if slot.generation != event.generation {
                debug!(
                    "Discarding stale {:?} timer for {}",
                    event.kind, event.address
                );
                continue;
            }

            match (event.kind, slot.lease.state) {
                (TimerKind::Renewal, LeaseState::Bound) => {
                    slot.lease.state = LeaseState::Renewing;
                    changed.push(slot.lease.clone());
                }
                (TimerKind::Rebinding, LeaseState::Bound | LeaseState::Renewing) => {
                    slot.lease.state = LeaseState::Rebinding;
                    changed.push(slot.lease.clone());
                }
                (TimerKind::Expiry, state) if state.is_bound() => {
                    let mut expired = slot.lease.clone();
                    expired.state = LeaseState::Expired;
                    let idle = slot.idle_lease();
                    self.persist_best_effort(slot.record_for(idle.clone()))
                        .await;
                    self.install(&mut slot, idle).await;
                    changed.push(expired);
                }
                (TimerKind::OfferHold, LeaseState::Offered) => {
                    let idle = slot.idle_lease();
                    self.install(&mut slot, idle).await;
                    changed.push(slot.lease.clone());
                }
                (TimerKind::Quarantine, LeaseState::Declined) => {
                    let idle = slot.idle_lease();
                    self.persist_best_effort(slot.record_for(idle.clone()))
                        .await;
                    self.install(&mut slot, idle).await;
                    changed.push(slot.lease.clone());
                }
                (kind, state) => {
                    debug!(
                        "Ignoring {:?} timer for {} in state {}",
                        kind, event.address, state
                    );
                }
            }
        }

        changed
    }

    pub async fn active_address(&self, client_id: &ClientId) -> Option<Ipv4Addr> {
        self.clients.read().await.get(client_id).copied()
    }

    pub async fn reserved_address(&self, client_id: &ClientId) -> Option<Ipv4Addr> {
        self.reservations.read().await.get(client_id).copied()
    }

    pub async fn lease(&self, address: Ipv4Addr) -> Option<Lease> {
        let slot = self.slot(address).ok()?.lock().await;
        Some(slot.lease.clone())
    }

    pub async fn lease_for_client(&self, client_id: &ClientId) -> Option<Lease> {
        let address = self.active_address(client_id).await?;
        self.lease(address)
            .await
            .filter(|lease| lease.is_held_by(client_id))
    }

    /// Every address not in the `Free` state, in address order.
    pub async fn list(&self) -> Vec<Lease> {
        let mut leases = Vec::new();
        for mutex in &self.slots {
            let slot = mutex.lock().await;
            if slot.lease.state != LeaseState::Free {
                leases.push(slot.lease.clone());
            }
        }
        leases
    }

    /// Ends whatever holds `address` now: a binding, an offer or a quarantine.
    pub async fn force_expire(&self, address: Ipv4Addr) -> Result<Lease> {
        let mut slot = self.slot(address)?.lock().await;

        if !slot.lease.state.is_active() && slot.lease.state != LeaseState::Declined {
            return Err(Error::LeaseNotFound(address));
        }

        let mut expired = slot.lease.clone();
        expired.state = LeaseState::Expired;

        let idle = slot.idle_lease();
        self.persist_required(slot.record_for(idle.clone())).await?;
        self.install(&mut slot, idle).await;
        info!("{} force-expired", address);
        Ok(expired)
    }

    /// Withholds `address` from dynamic allocation, optionally for one client.
    ///
    /// A current binding is left alone; the reservation applies once it ends.
    pub async fn reserve(&self, address: Ipv4Addr, client_id: Option<ClientId>) -> Result<Lease> {
        let mut slot = self.slot(address)?.lock().await;

        if let Some(client_id) = &client_id
            && let Some(existing) = self.reserved_address(client_id).await
            && existing != address
        {
            return Err(Error::InvalidConfig(format!(
                "{} already has a reservation at {}",
                client_id, existing
            )));
        }

        let reservation = Reservation {
            client_id: client_id.clone(),
            source: ReservationSource::Admin,
        };
        let lease = match slot.lease.state {
            LeaseState::Free | LeaseState::Reserved => Lease::idle(address, true),
            _ => slot.lease.clone(),
        };

        self.persist_required(LeaseRecord {
            lease: lease.clone(),
            reservation: Some(reservation.clone()),
        })
        .await?;

        let replaced = slot.reservation.replace(reservation);
        {
            let mut reservations = self.reservations.write().await;
            if let Some(old_client) = replaced.and_then(|old| old.client_id) {
                reservations.remove(&old_client);
            }
            if let Some(client_id) = client_id {
                reservations.insert(client_id, address);
            }
        }
        self.install(&mut slot, lease.clone()).await;
        info!("{} reserved", address);
        Ok(lease)
    }

    /// Returns a reserved address to dynamic allocation.
    pub async fn unreserve(&self, address: Ipv4Addr) -> Result<Lease> {
        let mut slot = self.slot(address)?.lock().await;

        if slot.reservation.is_none() {
            return Err(Error::LeaseNotFound(address));
        }

        let lease = match slot.lease.state {
            LeaseState::Reserved => Lease::idle(address, false),
            _ => slot.lease.clone(),
        };
        self.persist_required(LeaseRecord {
            lease: lease.clone(),
            reservation: None,
        })
        .await?;

        if let Some(client_id) = slot.reservation.take().and_then(|old| old.client_id) {
            self.reservations.write().await.remove(&client_id);
        }
        self.install(&mut slot, lease.clone()).await;
        info!("{} unreserved", address);
        Ok(lease)
    }

    /// Rewrites the journal to one record per non-free address.
    ///
    /// Holds every slot for the duration, so no append can slip in between
    /// the snapshot and the rewrite.
    pub async fn compact(&self) -> Result<()> {
        let mut guards = Vec::with_capacity(self.slots.len());
        for mutex in &self.slots {
            guards.push(mutex.lock().await);
        }

        let records: Vec<LeaseRecord> = guards
            .iter()
            .filter(|slot| {
                !matches!(slot.lease.state, LeaseState::Free | LeaseState::Offered)
                    || slot.admin_reservation().is_some()
            })
            .map(|slot| match slot.lease.state {
                LeaseState::Offered => slot.record_for(slot.idle_lease()),
                _ => slot.record_for(slot.lease.clone()),
            })
            .collect();

        self.backend
            .compact(&records)
            .await
            .map_err(|error| Error::Persistence(error.to_string()))
    }

    pub async fn free_count(&self) -> usize {
        self.free.lock().await.len()
    }

    /// Clients currently holding an offered or bound address.
    pub async fn active_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn pending_timers(&self) -> usize {
        self.timers.lock().await.pending()
    }

    pub async fn timers_for(&self, address: Ipv4Addr) -> Vec<TimerEvent> {
        self.timers.lock().await.events_for(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::StaticBinding;
    use crate::persist::MemoryBackend;

    const DURATION: u32 = 3600;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn test_config() -> Config {
        Config {
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            pool_start: Ipv4Addr::new(192, 168, 1, 100),
            pool_end: Ipv4Addr::new(192, 168, 1, 104),
            lease_duration_seconds: DURATION,
            ..Default::default()
        }
    }

    fn client(last: u8) -> ClientId {
        ClientId::from_mac([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, last)
    }

    struct Harness {
        store: LeaseStore,
        clock: Arc<ManualClock>,
        backend: Arc<MemoryBackend>,
    }

    async fn harness_with(config: Config, backend: Arc<MemoryBackend>) -> Harness {
        let clock = Arc::new(ManualClock::new(start()));
        let store = LeaseStore::open(Arc::new(config), clock.clone(), backend.clone())
            .await
            .unwrap();
        Harness {
            store,
            clock,
            backend,
        }
    }

    async fn harness() -> Harness {
        harness_with(test_config(), Arc::new(MemoryBackend::new())).await
    }

    #[tokio::test]
    async fn test_allocate_lowest_free_address() {
        let h = harness().await;
        let first = h.store.allocate_candidate(&client(1), 1).await.unwrap();
        let second = h.store.allocate_candidate(&client(2), 2).await.unwrap();

        assert_eq!(first, addr(100));
        assert_eq!(second, addr(101));
        assert_eq!(h.store.lease(first).await.unwrap().state, LeaseState::Offered);
        assert_eq!(h.store.free_count().await, 3);
    }

    #[tokio::test]
    async fn test_allocate_returns_existing_holding() {
        let h = harness().await;
        let first = h.store.allocate_candidate(&client(1), 1).await.unwrap();
        let again = h.store.allocate_candidate(&client(1), 2).await.unwrap();

        assert_eq!(first, again);
        assert_eq!(h.store.free_count().await, 4);
        assert_eq!(h.store.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_allocate_skips_locked_address() {
        let h = harness().await;
        let position = h.store.index[&addr(100)];
        let _held = h.store.slots[position].lock().await;

        let chosen = h.store.allocate_candidate(&client(1), 1).await.unwrap();
        assert_eq!(chosen, addr(101));
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let h = harness().await;
        for last in 1..=5 {
            h.store.allocate_candidate(&client(last), 1).await.unwrap();
        }
        assert!(matches!(
            h.store.allocate_candidate(&client(9), 1).await,
            Err(Error::PoolExhausted)
        ));
    }

    #[tokio::test]
    async fn test_excluded_addresses_never_allocated() {
        let config = Config {
            excluded_addresses: vec![addr(100), addr(101)],
            ..test_config()
        };
        let h = harness_with(config, Arc::new(MemoryBackend::new())).await;

        assert_eq!(h.store.allocate_candidate(&client(1), 1).await.unwrap(), addr(102));
        assert!(!h.store.contains(addr(100)));
        assert!(matches!(
            h.store.confirm(addr(100), &client(2), 2, DURATION, None).await,
            Err(Error::AddressOutOfRange(_))
        ));
    }

    #[tokio::test]
    async fn test_confirm_binds_and_persists() {
        let h = harness().await;
        let address = h.store.allocate_candidate(&client(1), 7).await.unwrap();
        let lease = h
            .store
            .confirm(address, &client(1), 7, DURATION, Some("laptop".to_string()))
            .await
            .unwrap();

        assert_eq!(lease.state, LeaseState::Bound);
        assert_eq!(lease.lease_end, Some(start() + TimeDelta::seconds(3600)));
        assert_eq!(lease.t1_time, Some(start() + TimeDelta::seconds(1800)));
        assert_eq!(lease.t2_time, Some(start() + TimeDelta::seconds(3150)));

        let records = h.backend.records().await;
        assert_eq!(records.last().unwrap().lease, lease);
        assert_eq!(h.store.timers_for(address).await.len(), 3);
    }

    #[tokio::test]
    async fn test_confirm_replay_is_idempotent() {
        let h = harness().await;
        let first = h
            .store
            .confirm(addr(100), &client(1), 1, DURATION, None)
            .await
            .unwrap();
        let writes = h.backend.records().await.len();

        h.clock.advance_secs(5);
        let again = h
            .store
            .confirm(addr(100), &client(1), 1, DURATION, None)
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_eq!(h.backend.records().await.len(), writes);
    }

    #[tokio::test]
    async fn test_confirm_other_client_mismatch() {
        let h = harness().await;
        h.store
            .confirm(addr(100), &client(1), 1, DURATION, None)
            .await
            .unwrap();
        assert!(matches!(
            h.store.confirm(addr(100), &client(2), 2, DURATION, None).await,
            Err(Error::ClientMismatch(_))
        ));

        let offered = h.store.allocate_candidate(&client(3), 3).await.unwrap();
        assert!(matches!(
            h.store.confirm(offered, &client(2), 4, DURATION, None).await,
            Err(Error::ClientMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_confirm_moves_client() {
        let h = harness().await;
        h.store
            .confirm(addr(100), &client(1), 1, DURATION, None)
            .await
            .unwrap();
        h.store
            .confirm(addr(103), &client(1), 2, DURATION, None)
            .await
            .unwrap();

        assert_eq!(h.store.lease(addr(100)).await.unwrap().state, LeaseState::Free);
        assert_eq!(h.store.active_address(&client(1)).await, Some(addr(103)));
        assert_eq!(h.store.active_count().await, 1);
        assert!(h.store.timers_for(addr(100)).await.is_empty());
    }

    #[tokio::test]
    async fn test_confirm_fails_without_durable_write() {
        let h = harness().await;
        let address = h.store.allocate_candidate(&client(1), 1).await.unwrap();
        h.backend.set_fail_writes(true);

        assert!(matches!(
            h.store.confirm(address, &client(1), 1, DURATION, None).await,
            Err(Error::Persistence(_))
        ));
        assert_eq!(h.store.lease(address).await.unwrap().state, LeaseState::Offered);
    }

    #[tokio::test]
    async fn test_renew_extends_and_replaces_timers() {
        let h = harness().await;
        h.store
            .confirm(addr(100), &client(1), 1, DURATION, None)
            .await
            .unwrap();

        h.clock.advance_secs(2000);
        let renewed = h
            .store
            .renew(addr(100), &client(1), 2, DURATION)
            .await
            .unwrap();
        assert_eq!(
            renewed.lease_end,
            Some(start() + TimeDelta::seconds(2000 + 3600))
        );
        assert_eq!(
            renewed.t1_time,
            Some(start() + TimeDelta::seconds(2000 + 1800))
        );

        let timers = h.store.timers_for(addr(100)).await;
        assert_eq!(timers.len(), 3);
        assert!(timers.iter().all(|timer| timer.due > h.clock.now()));
    }

    #[tokio::test]
    async fn test_renew_errors() {
        let h = harness().await;
        assert!(matches!(
            h.store.renew(addr(100), &client(1), 1, DURATION).await,
            Err(Error::LeaseNotFound(_))
        ));
        h.store
            .confirm(addr(100), &client(1), 1, DURATION, None)
            .await
            .unwrap();
        assert!(matches!(
            h.store.renew(addr(100), &client(2), 2, DURATION).await,
            Err(Error::ClientMismatch(_))
        ));
        assert!(matches!(
            h.store.renew(addr(50), &client(1), 2, DURATION).await,
            Err(Error::LeaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_release_returns_address() {
        let h = harness().await;
        h.store
            .confirm(addr(100), &client(1), 1, DURATION, None)
            .await
            .unwrap();

        assert!(matches!(
            h.store.release(addr(100), &client(2)).await,
            Err(Error::LeaseNotFound(_))
        ));

        let released = h.store.release(addr(100), &client(1)).await.unwrap();
        assert_eq!(released.state, LeaseState::Released);
        assert_eq!(h.store.lease(addr(100)).await.unwrap().state, LeaseState::Free);
        assert_eq!(h.store.free_count().await, 5);
        assert_eq!(h.store.pending_timers().await, 0);
    }

    #[tokio::test]
    async fn test_decline_quarantines_until_cooldown() {
        let h = harness().await;
        h.store
            .confirm(addr(100), &client(1), 1, DURATION, None)
            .await
            .unwrap();
        h.store.decline(addr(100), &client(1)).await.unwrap();

        assert_eq!(
            h.store.lease(addr(100)).await.unwrap().state,
            LeaseState::Declined
        );
        assert_eq!(h.store.allocate_candidate(&client(2), 2).await.unwrap(), addr(101));
        assert!(matches!(
            h.store.confirm(addr(100), &client(3), 3, DURATION, None).await,
            Err(Error::AddressConflict(_))
        ));

        h.clock.advance_secs(3600);
        let changed = h.store.expire_due(h.clock.now()).await;
        assert!(changed.iter().any(|lease| lease.address == addr(100)));
        assert_eq!(h.store.lease(addr(100)).await.unwrap().state, LeaseState::Free);
    }

    #[tokio::test]
    async fn test_timer_progression() {
        let h = harness().await;
        h.store
            .confirm(addr(100), &client(1), 1, DURATION, None)
            .await
            .unwrap();

        h.clock.advance_secs(1800);
        h.store.expire_due(h.clock.now()).await;
        assert_eq!(
            h.store.lease(addr(100)).await.unwrap().state,
            LeaseState::Renewing
        );

        h.clock.advance_secs(1350);
        h.store.expire_due(h.clock.now()).await;
        assert_eq!(
            h.store.lease(addr(100)).await.unwrap().state,
            LeaseState::Rebinding
        );

        h.clock.advance_secs(449);
        assert!(h.store.expire_due(h.clock.now()).await.is_empty());

        h.clock.advance_secs(1);
        let changed = h.store.expire_due(h.clock.now()).await;
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].state, LeaseState::Expired);
        assert_eq!(h.store.lease(addr(100)).await.unwrap().state, LeaseState::Free);
        assert_eq!(h.store.active_address(&client(1)).await, None);
    }

    #[tokio::test]
    async fn test_offer_hold_lapses() {
        let h = harness().await;
        let address = h.store.allocate_candidate(&client(1), 1).await.unwrap();

        h.clock.advance_secs(29);
        assert!(h.store.expire_due(h.clock.now()).await.is_empty());

        h.clock.advance_secs(1);
        h.store.expire_due(h.clock.now()).await;
        assert_eq!(h.store.lease(address).await.unwrap().state, LeaseState::Free);
        assert_eq!(h.store.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_stale_timer_discarded() {
        let h = harness().await;
        h.store
            .confirm(addr(100), &client(1), 1, DURATION, None)
            .await
            .unwrap();

        // the expiry is popped before the renewal bumps the generation
        h.clock.advance_secs(3600);
        let stale = h.store.timers.lock().await.pop_due(h.clock.now());
        assert_eq!(stale.len(), 3);
        h.store
            .renew(addr(100), &client(1), 2, DURATION)
            .await
            .unwrap();
        h.store.timers.lock().await.replace(addr(100), stale);

        let changed = h.store.expire_due(h.clock.now()).await;
        assert!(changed.is_empty());
        assert_eq!(h.store.lease(addr(100)).await.unwrap().state, LeaseState::Bound);
    }

    #[tokio::test]
    async fn test_restart_restores_bindings_and_timers() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let h = harness_with(test_config(), backend.clone()).await;
            h.store
                .confirm(addr(100), &client(1), 1, DURATION, None)
                .await
                .unwrap();
            h.store
                .confirm(addr(101), &client(2), 2, DURATION, None)
                .await
                .unwrap();
            h.store.release(addr(101), &client(2)).await.unwrap();
            h.store.allocate_candidate(&client(3), 3).await.unwrap();
        }

        let h = harness_with(test_config(), backend).await;
        let lease = h.store.lease(addr(100)).await.unwrap();
        assert_eq!(lease.state, LeaseState::Bound);
        assert_eq!(lease.lease_end, Some(start() + TimeDelta::seconds(3600)));
        assert_eq!(h.store.lease(addr(101)).await.unwrap().state, LeaseState::Free);
        assert_eq!(h.store.lease(addr(102)).await.unwrap().state, LeaseState::Free);
        assert_eq!(h.store.active_address(&client(1)).await, Some(addr(100)));
        assert_eq!(h.store.timers_for(addr(100)).await.len(), 3);
        assert_eq!(h.store.lease_for_client(&client(1)).await, Some(lease));
        assert!(h.store.lease_for_client(&client(2)).await.is_none());

        let history = h.backend.records().await.len();
        assert!(history > 1);
        h.store.compact().await.unwrap();
        assert_eq!(h.backend.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_restart_after_downtime_fires_in_order() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let h = harness_with(test_config(), backend.clone()).await;
            h.store
                .confirm(addr(100), &client(1), 1, DURATION, None)
                .await
                .unwrap();
        }

        let h = harness_with(test_config(), backend).await;
        h.clock.advance_secs(5000);
        let changed = h.store.expire_due(h.clock.now()).await;
        let states: Vec<_> = changed.iter().map(|lease| lease.state).collect();
        assert_eq!(
            states,
            vec![
                LeaseState::Renewing,
                LeaseState::Rebinding,
                LeaseState::Expired
            ]
        );
    }

    #[tokio::test]
    async fn test_open_leaves_journal_history_untouched() {
        let timing = crate::lease::LeaseTiming {
            duration: DURATION,
            renewal: 1800,
            rebinding: 3150,
        };
        let history: Vec<LeaseRecord> = [1, 2]
            .into_iter()
            .map(|xid| LeaseRecord {
                lease: Lease::bound(addr(100), client(1), xid, start(), timing, None),
                reservation: None,
            })
            .collect();
        let backend = Arc::new(MemoryBackend::with_records(history.clone()));

        let h = harness_with(test_config(), backend).await;
        assert_eq!(h.store.lease(addr(100)).await.unwrap().xid, Some(2));
        assert_eq!(h.backend.records().await, history);
    }

    #[tokio::test]
    async fn test_static_binding_reserved_for_client() {
        let config = Config {
            static_bindings: vec![StaticBinding {
                mac_address: "aa:bb:cc:dd:ee:07".to_string(),
                ip_address: addr(100),
                hostname: None,
            }],
            ..test_config()
        };
        let h = harness_with(config, Arc::new(MemoryBackend::new())).await;

        assert_eq!(
            h.store.lease(addr(100)).await.unwrap().state,
            LeaseState::Reserved
        );
        assert_eq!(h.store.reserved_address(&client(7)).await, Some(addr(100)));
        assert_eq!(h.store.allocate_candidate(&client(1), 1).await.unwrap(), addr(101));
        assert!(matches!(
            h.store.confirm(addr(100), &client(1), 1, DURATION, None).await,
            Err(Error::ClientMismatch(_))
        ));

        h.store
            .confirm(addr(100), &client(7), 2, DURATION, None)
            .await
            .unwrap();
        h.store.release(addr(100), &client(7)).await.unwrap();
        assert_eq!(
            h.store.lease(addr(100)).await.unwrap().state,
            LeaseState::Reserved
        );
    }

    #[tokio::test]
    async fn test_admin_reservation_persists() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let h = harness_with(test_config(), backend.clone()).await;
            h.store.reserve(addr(102), Some(client(5))).await.unwrap();
            h.store.reserve(addr(103), None).await.unwrap();
        }

        let h = harness_with(test_config(), backend).await;
        assert_eq!(h.store.reserved_address(&client(5)).await, Some(addr(102)));
        assert_eq!(
            h.store.lease(addr(103)).await.unwrap().state,
            LeaseState::Reserved
        );
        assert_eq!(h.store.free_count().await, 3);

        assert!(matches!(
            h.store.try_offer(addr(103), &client(1), 1).await,
            Err(Error::ClientMismatch(_))
        ));

        h.store.unreserve(addr(103)).await.unwrap();
        assert_eq!(h.store.lease(addr(103)).await.unwrap().state, LeaseState::Free);
        assert_eq!(h.store.free_count().await, 4);
    }

    #[tokio::test]
    async fn test_force_expire() {
        let h = harness().await;
        h.store
            .confirm(addr(100), &client(1), 1, DURATION, None)
            .await
            .unwrap();

        let expired = h.store.force_expire(addr(100)).await.unwrap();
        assert_eq!(expired.state, LeaseState::Expired);
        assert_eq!(h.store.lease(addr(100)).await.unwrap().state, LeaseState::Free);
        assert!(matches!(
            h.store.force_expire(addr(100)).await,
            Err(Error::LeaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_withdraw_offer_only_touches_offers() {
        let h = harness().await;
        let offered = h.store.allocate_candidate(&client(1), 1).await.unwrap();
        assert_eq!(h.store.withdraw_offer(&client(1)).await, Some(offered));
        assert_eq!(h.store.lease(offered).await.unwrap().state, LeaseState::Free);

        h.store
            .confirm(addr(101), &client(2), 2, DURATION, None)
            .await
            .unwrap();
        assert_eq!(h.store.withdraw_offer(&client(2)).await, None);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_unique() {
        let h = Arc::new(harness().await);
        let mut tasks = Vec::new();
        for last in 1..=8u8 {
            let h = Arc::clone(&h);
            tasks.push(tokio::spawn(async move {
                h.store.allocate_candidate(&client(last), u32::from(last)).await
            }));
        }

        let mut granted = Vec::new();
        let mut exhausted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(address) => granted.push(address),
                Err(Error::PoolExhausted) => exhausted += 1,
                Err(error) => panic!("unexpected error: {}", error),
            }
        }

        granted.sort();
        granted.dedup();
        assert_eq!(granted.len(), 5);
        assert_eq!(exhausted, 3);
    }
}
