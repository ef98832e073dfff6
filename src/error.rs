//! Error types for the lease engine.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. Protocol-level variants never leave
//! the transaction engine; clients only ever observe a NAK or silence.

use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Errors that can occur while serving or administering leases.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or lease journal).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Datagram that is not a well-formed DHCP request.
    ///
    /// Too short, bad magic cookie, excessive hops, bad hardware length,
    /// or a message type outside the defined set.
    #[error("Malformed DHCP message: {0}")]
    MalformedMessage(String),

    /// An option whose length overruns the buffer or does not fit its type.
    #[error("Malformed option {code}: {reason}")]
    MalformedOption { code: u8, reason: String },

    /// No address is available for a new client.
    ///
    /// Every pool address is bound, offered, reserved, excluded or quarantined.
    #[error("No available IP addresses in pool")]
    PoolExhausted,

    /// The address is quarantined after a decline or a failed conflict probe.
    #[error("Address {0} is quarantined")]
    AddressConflict(Ipv4Addr),

    /// The address belongs to a different client.
    #[error("Address {0} is held by another client")]
    ClientMismatch(Ipv4Addr),

    /// Another transaction holds the address lock.
    #[error("Address {0} is busy")]
    AddressBusy(Ipv4Addr),

    /// Requested IP address is outside the configured pool.
    #[error("Address {0} is outside the configured pool range")]
    AddressOutOfRange(Ipv4Addr),

    /// No lease matches the address (and client) given.
    #[error("No lease for {0}")]
    LeaseNotFound(Ipv4Addr),

    /// The lease journal could not be written durably.
    #[error("Lease persistence failed: {0}")]
    Persistence(String),

    /// Another process holds the lease journal for writing.
    #[error("Lease journal {} is in use by another process", .0.display())]
    JournalInUse(PathBuf),

    /// The client exceeded its request budget for the current window.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// The client is not on the known-clients list.
    #[error("Client is not allowed")]
    NotAllowed,

    /// Invalid server configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without administrator privileges.
    #[error("Socket error: {0}")]
    Socket(String),
}

/// A specialized Result type for lease operations.
pub type Result<T> = std::result::Result<T, Error>;
