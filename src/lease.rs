//! Lease records and the identities they are keyed on.
//!
//! A [`Lease`] is the state of one pool address: who holds it, in which
//! [`LeaseState`], and the T1/T2/expiry timestamps derived from the granted
//! duration. The live table of leases is kept by [`LeaseStore`](crate::LeaseStore).

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::packet::HTYPE_ETHERNET;

/// Stable client identity: option 61 when sent, else htype + chaddr.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Vec<u8>);

impl ClientId {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Identity of an Ethernet client without option 61.
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let mut id = Vec::with_capacity(7);
        id.push(HTYPE_ETHERNET);
        id.extend_from_slice(&mac);
        Self(id)
    }

    /// Parses colon or dash separated hex octets.
    pub fn from_hex(text: &str) -> Result<Self> {
        let normalized = text.trim().to_lowercase().replace('-', ":");
        if normalized.is_empty() {
            return Err(Error::InvalidConfig("empty client identifier".to_string()));
        }

        let bytes = normalized
            .split(':')
            .map(|part| {
                if part.is_empty() || part.len() > 2 {
                    return Err(Error::InvalidConfig(format!(
                        "invalid octet '{}' in client identifier {}",
                        part, text
                    )));
                }
                u8::from_str_radix(part, 16).map_err(|_| {
                    Error::InvalidConfig(format!(
                        "invalid octet '{}' in client identifier {}",
                        part, text
                    ))
                })
            })
            .collect::<Result<Vec<u8>>>()?;

        Ok(Self(bytes))
    }

    /// Like [`from_hex`](Self::from_hex), but six octets are read as an
    /// Ethernet MAC and prefixed with the hardware type.
    pub fn from_mac_or_hex(text: &str) -> Result<Self> {
        let id = Self::from_hex(text)?;
        match <[u8; 6]>::try_from(id.0.as_slice()) {
            Ok(mac) => Ok(Self::from_mac(mac)),
            Err(_) => Ok(id),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, byte) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.is_empty() {
            // option 61 may legally be zero-length
            return Ok(Self(Vec::new()));
        }
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Lifecycle state of one pool address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Free,
    Offered,
    Bound,
    Renewing,
    Rebinding,
    Expired,
    Released,
    Declined,
    Reserved,
}

impl LeaseState {
    /// States in which the address belongs to a client.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Offered | Self::Bound | Self::Renewing | Self::Rebinding
        )
    }

    /// States that come out of a confirmed REQUEST.
    pub fn is_bound(self) -> bool {
        matches!(self, Self::Bound | Self::Renewing | Self::Rebinding)
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::Offered => "offered",
            Self::Bound => "bound",
            Self::Renewing => "renewing",
            Self::Rebinding => "rebinding",
            Self::Expired => "expired",
            Self::Released => "released",
            Self::Declined => "declined",
            Self::Reserved => "reserved",
        };
        f.write_str(name)
    }
}

/// Where a reservation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationSource {
    /// `static_bindings` in the config file; re-applied on every start.
    Config,
    /// Made at run time; persisted in the lease journal.
    Admin,
}

/// An address withheld from dynamic allocation.
///
/// With a `client_id` the address is kept for that client only; without
/// one nobody can lease it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub client_id: Option<ClientId>,
    pub source: ReservationSource,
}

impl Reservation {
    pub fn admits(&self, client_id: &ClientId) -> bool {
        self.client_id.as_ref() == Some(client_id)
    }
}

/// Durations of one grant, in seconds from lease start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTiming {
    pub duration: u32,
    pub renewal: u32,
    pub rebinding: u32,
}

/// The binding of one address to (at most) one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub client_id: Option<ClientId>,
    pub state: LeaseState,
    pub lease_start: Option<DateTime<Utc>>,
    pub lease_end: Option<DateTime<Utc>>,
    pub t1_time: Option<DateTime<Utc>>,
    pub t2_time: Option<DateTime<Utc>>,
    pub xid: Option<u32>,
    pub hostname: Option<String>,
}

impl Lease {
    /// An unheld address: `Free`, or `Reserved` if it carries a reservation.
    pub fn idle(address: Ipv4Addr, reserved: bool) -> Self {
        Self {
            address,
            client_id: None,
            state: if reserved {
                LeaseState::Reserved
            } else {
                LeaseState::Free
            },
            lease_start: None,
            lease_end: None,
            t1_time: None,
            t2_time: None,
            xid: None,
            hostname: None,
        }
    }

    /// A provisional hold for `client_id` that lapses at `hold_until`.
    pub fn offered(
        address: Ipv4Addr,
        client_id: ClientId,
        xid: u32,
        now: DateTime<Utc>,
        hold_until: DateTime<Utc>,
    ) -> Self {
        Self {
            address,
            client_id: Some(client_id),
            state: LeaseState::Offered,
            lease_start: Some(now),
            lease_end: Some(hold_until),
            t1_time: None,
            t2_time: None,
            xid: Some(xid),
            hostname: None,
        }
    }

    /// A confirmed lease starting at `start`.
    pub fn bound(
        address: Ipv4Addr,
        client_id: ClientId,
        xid: u32,
        start: DateTime<Utc>,
        timing: LeaseTiming,
        hostname: Option<String>,
    ) -> Self {
        let after = |seconds: u32| start + TimeDelta::seconds(i64::from(seconds));
        Self {
            address,
            client_id: Some(client_id),
            state: LeaseState::Bound,
            lease_start: Some(start),
            lease_end: Some(after(timing.duration)),
            t1_time: Some(after(timing.renewal)),
            t2_time: Some(after(timing.rebinding)),
            xid: Some(xid),
            hostname,
        }
    }

    /// An address pulled from allocation until `until`.
    pub fn declined(address: Ipv4Addr, now: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            address,
            client_id: None,
            state: LeaseState::Declined,
            lease_start: Some(now),
            lease_end: Some(until),
            t1_time: None,
            t2_time: None,
            xid: None,
            hostname: None,
        }
    }

    /// Durations of a bound lease, as granted.
    pub fn timing(&self) -> Option<LeaseTiming> {
        let start = self.lease_start?;
        let seconds = |at: Option<DateTime<Utc>>| -> Option<u32> {
            u32::try_from((at? - start).num_seconds()).ok()
        };
        Some(LeaseTiming {
            duration: seconds(self.lease_end)?,
            renewal: seconds(self.t1_time)?,
            rebinding: seconds(self.t2_time)?,
        })
    }

    pub fn is_held_by(&self, client_id: &ClientId) -> bool {
        self.state.is_active() && self.client_id.as_ref() == Some(client_id)
    }

    /// Granted duration in seconds, 0 for leases without timestamps.
    pub fn duration_seconds(&self) -> i64 {
        match (self.lease_start, self.lease_end) {
            (Some(start), Some(end)) => (end - start).num_seconds().max(0),
            _ => 0,
        }
    }

    /// Seconds remaining at `now`, or 0 if expired.
    pub fn remaining_seconds_at(&self, now: DateTime<Utc>) -> i64 {
        self.lease_end
            .map(|end| (end - now).num_seconds().max(0))
            .unwrap_or(0)
    }

    /// Seconds remaining until expiration, or 0 if expired.
    pub fn remaining_seconds(&self) -> i64 {
        self.remaining_seconds_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_client_id_display_and_parse() {
        let id = ClientId::from_mac([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(id.to_string(), "01:aa:bb:cc:dd:ee:ff");
        assert_eq!(ClientId::from_hex(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_mac_strings_become_ethernet_ids() {
        let id = ClientId::from_mac_or_hex("AA-BB-CC-DD-EE-FF").unwrap();
        assert_eq!(id.as_bytes(), &[1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

        let raw = ClientId::from_mac_or_hex("ff:00:01").unwrap();
        assert_eq!(raw.as_bytes(), &[0xff, 0x00, 0x01]);
    }

    #[test]
    fn test_bad_client_ids_rejected() {
        assert!(ClientId::from_hex("").is_err());
        assert!(ClientId::from_hex("zz:01").is_err());
        assert!(ClientId::from_hex("aa::bb").is_err());
        assert!(ClientId::from_hex("abc").is_err());
    }

    #[test]
    fn test_client_id_serializes_as_string() {
        let id = ClientId::new(vec![0xde, 0xad]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"de:ad\"");
        let back: ClientId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_empty_client_id_survives_serde() {
        let id = ClientId::new(Vec::new());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"\"");
        let back: ClientId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_six_byte_option_61_survives_serde() {
        let id = ClientId::new(vec![1, 2, 3, 4, 5, 6]);
        let back: ClientId = serde_json::from_str(&serde_json::to_string(&id).unwrap()).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_bound_lease_timers() {
        let timing = LeaseTiming {
            duration: 3600,
            renewal: 1800,
            rebinding: 3150,
        };
        let lease = Lease::bound(
            Ipv4Addr::new(192, 168, 1, 100),
            ClientId::from_mac([0xaa; 6]),
            1,
            start(),
            timing,
            Some("host".to_string()),
        );

        assert_eq!(lease.state, LeaseState::Bound);
        assert_eq!(lease.t1_time, Some(start() + TimeDelta::seconds(1800)));
        assert_eq!(lease.t2_time, Some(start() + TimeDelta::seconds(3150)));
        assert_eq!(lease.lease_end, Some(start() + TimeDelta::seconds(3600)));
        assert_eq!(lease.duration_seconds(), 3600);
        assert_eq!(lease.timing(), Some(timing));
        assert_eq!(lease.remaining_seconds_at(start() + TimeDelta::seconds(600)), 3000);
        assert_eq!(lease.remaining_seconds_at(start() + TimeDelta::seconds(7200)), 0);
    }

    #[test]
    fn test_state_classes() {
        assert!(LeaseState::Offered.is_active());
        assert!(!LeaseState::Offered.is_bound());
        assert!(LeaseState::Rebinding.is_bound());
        assert!(!LeaseState::Declined.is_active());
        assert!(!LeaseState::Reserved.is_active());
        assert_eq!(LeaseState::Renewing.to_string(), "renewing");
    }

    #[test]
    fn test_idle_lease() {
        let address = Ipv4Addr::new(10, 0, 0, 5);
        assert_eq!(Lease::idle(address, false).state, LeaseState::Free);
        assert_eq!(Lease::idle(address, true).state, LeaseState::Reserved);
    }

    #[test]
    fn test_is_held_by() {
        let client = ClientId::from_mac([1; 6]);
        let other = ClientId::from_mac([2; 6]);
        let lease = Lease::offered(
            Ipv4Addr::new(10, 0, 0, 5),
            client.clone(),
            7,
            start(),
            start() + TimeDelta::seconds(30),
        );
        assert!(lease.is_held_by(&client));
        assert!(!lease.is_held_by(&other));
    }
}
