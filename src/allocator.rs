//! Address selection for DISCOVER.
//!
//! The order of preference is:
//!
//! 1. the address the client already holds;
//! 2. the client's reservation;
//! 3. the address it asked for (option 50), if allocatable;
//! 4. the lowest free pool address.
//!
//! A new candidate is held as `Offered` before it is probed, so a slow probe
//! never lets two clients race for the same address. A candidate that answers
//! the probe is quarantined and the next one is tried.

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ConflictProbeConfig;
use crate::error::{Error, Result};
use crate::lease::{ClientId, Lease};
use crate::store::LeaseStore;

/// Checks whether an address is already in use on the network.
#[async_trait]
pub trait ConflictProbe: Send + Sync {
    async fn in_use(&self, address: Ipv4Addr) -> bool;
}

/// Never reports a conflict.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProbe;

#[async_trait]
impl ConflictProbe for NoProbe {
    async fn in_use(&self, _address: Ipv4Addr) -> bool {
        false
    }
}

/// ICMP echo through the system `ping` binary.
#[derive(Debug, Clone)]
pub struct PingProbe {
    timeout: Duration,
    attempts: u32,
}

impl PingProbe {
    pub fn new(timeout: Duration, attempts: u32) -> Self {
        Self {
            timeout,
            attempts: attempts.max(1),
        }
    }

    fn command(&self, address: Ipv4Addr) -> Command {
        let mut command = Command::new("ping");
        if cfg!(windows) {
            command
                .arg("-n")
                .arg("1")
                .arg("-w")
                .arg(self.timeout.as_millis().to_string());
        } else {
            let seconds = self.timeout.as_secs_f64().ceil().max(1.0) as u64;
            command
                .arg("-c")
                .arg("1")
                .arg("-W")
                .arg(seconds.to_string());
        }
        command
            .arg(address.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl ConflictProbe for PingProbe {
    async fn in_use(&self, address: Ipv4Addr) -> bool {
        // ping rounds its own deadline up to whole seconds
        let deadline = self.timeout + Duration::from_secs(1);

        for attempt in 1..=self.attempts {
            match tokio::time::timeout(deadline, self.command(address).status()).await {
                Ok(Ok(status)) if status.success() => return true,
                Ok(Ok(_)) | Err(_) => {
                    debug!("No reply from {} (attempt {})", address, attempt);
                }
                Ok(Err(error)) => {
                    warn!("Conflict probe unavailable: {}", error);
                    return false;
                }
            }
        }

        false
    }
}

/// The probe described by `config`.
pub fn probe_from_config(config: &ConflictProbeConfig) -> Arc<dyn ConflictProbe> {
    if config.enabled {
        Arc::new(PingProbe::new(
            Duration::from_millis(config.timeout_millis),
            config.attempts,
        ))
    } else {
        Arc::new(NoProbe)
    }
}

pub struct PoolAllocator {
    store: Arc<LeaseStore>,
    probe: Arc<dyn ConflictProbe>,
}

impl PoolAllocator {
    pub fn new(store: Arc<LeaseStore>, probe: Arc<dyn ConflictProbe>) -> Self {
        Self { store, probe }
    }

    /// Picks and holds an address to offer `client_id`.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolExhausted`] when nothing can be offered
    /// - [`Error::AddressBusy`] when the client's own address is locked by a
    ///   concurrent transaction
    pub async fn select(
        &self,
        client_id: &ClientId,
        xid: u32,
        requested: Option<Ipv4Addr>,
    ) -> Result<Lease> {
        if let Some(address) = self.store.active_address(client_id).await {
            let held = self.store.try_offer(address, client_id, xid).await?;
            return self.snapshot(held).await;
        }

        if let Some(address) = self.store.reserved_address(client_id).await {
            match self.offer_probed(address, client_id, xid).await {
                Ok(Some(lease)) => return Ok(lease),
                Ok(None) => {}
                Err(error) => debug!("Reserved {} unavailable: {}", address, error),
            }
        }

        if let Some(address) = requested.filter(|&address| self.store.contains(address)) {
            match self.offer_probed(address, client_id, xid).await {
                Ok(Some(lease)) => return Ok(lease),
                Ok(None) => {}
                Err(error) => debug!("Requested {} unavailable: {}", address, error),
            }
        }

        // each conflict quarantines an address, so this is bounded by the pool
        for _ in 0..=self.store.capacity() {
            let address = self.store.allocate_candidate(client_id, xid).await?;
            if let Some(lease) = self.probe_held(address, client_id).await? {
                return Ok(lease);
            }
        }

        Err(Error::PoolExhausted)
    }

    async fn offer_probed(
        &self,
        address: Ipv4Addr,
        client_id: &ClientId,
        xid: u32,
    ) -> Result<Option<Lease>> {
        let held = self.store.try_offer(address, client_id, xid).await?;
        self.probe_held(held, client_id).await
    }

    /// Probes an address just offered to `client_id`; `None` on conflict.
    async fn probe_held(&self, address: Ipv4Addr, client_id: &ClientId) -> Result<Option<Lease>> {
        let lease = self.snapshot(address).await?;
        if lease.state.is_bound() && lease.is_held_by(client_id) {
            return Ok(Some(lease));
        }

        if self.probe.in_use(address).await {
            warn!("{} answered the conflict probe, quarantining", address);
            self.store.quarantine(address).await?;
            return Ok(None);
        }

        Ok(Some(lease))
    }

    async fn snapshot(&self, address: Ipv4Addr) -> Result<Lease> {
        self.store
            .lease(address)
            .await
            .ok_or(Error::LeaseNotFound(address))
    }
}
