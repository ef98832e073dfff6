//! DHCP message framing (RFC 2131 §2).
//!
//! A message is the 236-byte BOOTP header, the magic cookie and an options
//! area. When option 52 is present the `file` and `sname` header fields are
//! scanned for options as well, in that order (RFC 3396 §5), and pieces of
//! the same option found in several places are joined.
//!
//! ```text
//! offset  size  field
//!      0     1  op      BOOTREQUEST / BOOTREPLY
//!      1     1  htype
//!      2     1  hlen
//!      3     1  hops
//!      4     4  xid
//!      8     2  secs
//!     10     2  flags   bit 15 = broadcast
//!     12     4  ciaddr
//!     16     4  yiaddr
//!     20     4  siaddr
//!     24     4  giaddr
//!     28    16  chaddr
//!     44    64  sname
//!    108   128  file
//!    236     4  magic cookie 99.130.83.99
//!    240     -  options
//! ```

use std::fmt::Write as _;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::lease::ClientId;
use crate::options::{DhcpOption, MessageType, OptionScanner, OptionSet};

pub const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Broadcast bit of the `flags` field.
pub const BROADCAST_FLAG: u16 = 0x8000;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

const SNAME_OFFSET: usize = 44;
const FILE_OFFSET: usize = SNAME_OFFSET + 64;
const COOKIE_OFFSET: usize = FILE_OFFSET + 128;
const OPTIONS_OFFSET: usize = COOKIE_OFFSET + DHCP_MAGIC_COOKIE.len();

/// Replies are padded to this size for relay agents that still expect BOOTP.
const MIN_MESSAGE_SIZE: usize = 300;

/// Every IPv4 host accepts datagrams of this size (RFC 791).
const ENCODE_CAPACITY: usize = 576;

/// Relay hop count past which a message is treated as looping.
const MAX_HOPS: u8 = 16;

/// Sequential reader over the fixed header. The caller checks the length.
struct HeaderReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> HeaderReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.position..self.position + N]);
        self.position += N;
        out
    }

    fn byte(&mut self) -> u8 {
        let [value] = self.array();
        value
    }

    fn u16(&mut self) -> u16 {
        u16::from_be_bytes(self.array())
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.array())
    }

    fn address(&mut self) -> Ipv4Addr {
        Ipv4Addr::from(self.array::<4>())
    }
}

/// One DHCP message, inbound or outbound.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    /// Set by a client that already holds the address (RENEWING, REBINDING, INFORM).
    pub ciaddr: Ipv4Addr,
    /// The address being handed out.
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    /// Relay agent address; zero when the client is on-link.
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    /// All options, including those carried in overloaded `file`/`sname`.
    pub options: OptionSet,
}

impl DhcpPacket {
    /// Decodes a datagram.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedMessage`] for a short datagram, a wrong cookie, a
    /// hop count above 16 or an Ethernet `hlen` other than 6;
    /// [`Error::MalformedOption`] when an option area does not decode.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < OPTIONS_OFFSET {
            return Err(Error::MalformedMessage(format!(
                "{} bytes is shorter than the {} byte header",
                data.len(),
                OPTIONS_OFFSET
            )));
        }
        if data[COOKIE_OFFSET..OPTIONS_OFFSET] != DHCP_MAGIC_COOKIE {
            return Err(Error::MalformedMessage("Invalid magic cookie".to_string()));
        }

        let mut header = HeaderReader::new(data);
        let op = header.byte();
        let htype = header.byte();
        let hlen = header.byte();
        let hops = header.byte();

        if hops > MAX_HOPS {
            return Err(Error::MalformedMessage(format!(
                "Hop count {} exceeds maximum {}",
                hops, MAX_HOPS
            )));
        }
        if htype == HTYPE_ETHERNET && hlen != HLEN_ETHERNET {
            return Err(Error::MalformedMessage(format!(
                "Ethernet frame with hlen {}",
                hlen
            )));
        }

        let xid = header.u32();
        let secs = header.u16();
        let flags = header.u16();
        let ciaddr = header.address();
        let yiaddr = header.address();
        let siaddr = header.address();
        let giaddr = header.address();
        let chaddr = header.array();
        let sname = header.array();
        let file = header.array();

        let mut scanner = OptionScanner::default();
        scanner.scan(&data[OPTIONS_OFFSET..])?;
        if let Some(overload) = scanner.overload()? {
            if overload.includes_file() {
                scanner.scan(&file)?;
            }
            if overload.includes_sname() {
                scanner.scan(&sname)?;
            }
        }

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options: scanner.finish()?,
        })
    }

    /// Encodes the message, options in ascending code order, padded to 300 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENCODE_CAPACITY);

        out.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        for address in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            out.extend_from_slice(&address.octets());
        }
        out.extend_from_slice(&self.chaddr);
        out.extend_from_slice(&self.sname);
        out.extend_from_slice(&self.file);
        out.extend_from_slice(&DHCP_MAGIC_COOKIE);
        out.extend_from_slice(&self.options.encode());

        if out.len() < MIN_MESSAGE_SIZE {
            out.resize(MIN_MESSAGE_SIZE, 0);
        }
        out
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.options.message_type()
    }

    /// Option 50.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.options.requested_ip()
    }

    /// Option 54, naming the server whose offer a REQUEST accepts.
    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.options.server_identifier()
    }

    /// Option 82, echoed unchanged in every reply.
    pub fn relay_agent_info(&self) -> Option<&[u8]> {
        self.options.relay_agent_info()
    }

    pub fn hostname(&self) -> Option<&str> {
        self.options.hostname()
    }

    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.options.parameter_request_list()
    }

    pub fn requested_lease_time(&self) -> Option<u32> {
        self.options.lease_time()
    }

    /// The first `hlen` bytes of `chaddr`, at most 16.
    pub fn chaddr_bytes(&self) -> &[u8] {
        &self.chaddr[..usize::from(self.hlen).min(self.chaddr.len())]
    }

    /// `chaddr` as lowercase colon-separated hex, for logs.
    pub fn format_mac(&self) -> String {
        let mut text = String::with_capacity(self.chaddr_bytes().len() * 3);
        for byte in self.chaddr_bytes() {
            if !text.is_empty() {
                text.push(':');
            }
            let _ = write!(text, "{:02x}", byte);
        }
        text
    }

    /// The identity leases are keyed on: option 61 when sent with a value,
    /// else `htype` followed by the hardware address.
    pub fn client_id(&self) -> ClientId {
        if let Some(id) = self.options.client_identifier().filter(|id| !id.is_empty()) {
            return ClientId::new(id.to_vec());
        }
        let mut id = Vec::with_capacity(1 + self.chaddr_bytes().len());
        id.push(self.htype);
        id.extend_from_slice(self.chaddr_bytes());
        ClientId::new(id)
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }

    /// Builds a BOOTREPLY answering `request`.
    ///
    /// Copies `xid`, `flags`, `giaddr` and the hardware fields, clears
    /// `ciaddr`, `hops` and `secs`, and adds option 53 to `options`.
    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        mut options: OptionSet,
    ) -> Self {
        options.insert(DhcpOption::MessageType(message_type));

        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options,
        }
    }
}
