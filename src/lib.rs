//! # leasehold
//!
//! A DHCPv4 lease engine implementing RFC 2131 (DHCP) and RFC 2132 (DHCP Options).
//!
//! ## Features
//!
//! - Full DORA exchange plus RELEASE, DECLINE and INFORM
//! - Per-address locking: concurrent clients never contend on a global lock
//! - Durable lease journal, synced before every ACK
//! - T1/T2/expiry timers that survive restarts
//! - Static and run-time reservations, excluded addresses
//! - Relay agent support (giaddr routing, Option 82 echo)
//! - Long options (RFC 3396) and option overload
//! - Optional ICMP conflict probe, per-client rate limiting
//!
//! ## Quick Start
//!
//! ```no_run
//! use leasehold::{Config, DhcpServer};
//!
//! #[tokio::main]
//! async fn main() -> leasehold::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let server = DhcpServer::new(config).await?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`DhcpPacket`] / [`OptionSet`] - wire codec
//! - [`LeaseStore`] - the lease table, journal-backed through a [`LeaseBackend`]
//! - [`PoolAllocator`] - picks the address to offer
//! - [`TransactionEngine`] - maps each message onto store operations and a reply
//! - [`Scheduler`] - fires lease timers
//! - [`DhcpServer`] - UDP socket on port 67 tying it together

pub mod allocator;
pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod lease;
pub mod options;
pub mod packet;
pub mod persist;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod transaction;

pub use allocator::{ConflictProbe, NoProbe, PingProbe, PoolAllocator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use lease::{ClientId, Lease, LeaseState};
pub use options::{DhcpOption, MessageType, OptionSet};
pub use packet::DhcpPacket;
pub use persist::{JournalFile, LeaseBackend, LeaseRecord, MemoryBackend};
pub use scheduler::Scheduler;
pub use server::DhcpServer;
pub use store::LeaseStore;
pub use transaction::{Reply, TransactionEngine};
