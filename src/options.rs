//! Option encoding (RFC 2132), long options (RFC 3396) and option 82 (RFC 3046).
//!
//! [`DhcpOption`] is one typed option value and [`OptionSet`] the code-ordered
//! collection a message carries. Codes without a typed variant decode to
//! [`DhcpOption::Unknown`] and are written back unchanged.
//!
//! On the wire an option is `code, length, value` with at most 255 value
//! bytes. Longer values are written as consecutive instances of the same code
//! and every instance of a code is joined back together on decode.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Largest value a single TLV can carry.
const MAX_OPTION_CHUNK: usize = 255;

/// Option codes with a typed [`DhcpOption`] variant, plus Pad and End.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    Hostname = 12,
    DomainName = 15,
    InterfaceMtu = 26,
    BroadcastAddress = 28,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    OptionOverload = 52,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    RenewalTime = 58,
    RebindingTime = 59,
    ClientIdentifier = 61,
    RelayAgentInfo = 82,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            12 => Ok(Self::Hostname),
            15 => Ok(Self::DomainName),
            26 => Ok(Self::InterfaceMtu),
            28 => Ok(Self::BroadcastAddress),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            52 => Ok(Self::OptionOverload),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            58 => Ok(Self::RenewalTime),
            59 => Ok(Self::RebindingTime),
            61 => Ok(Self::ClientIdentifier),
            82 => Ok(Self::RelayAgentInfo),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

/// Value of option 53.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        }
    }

    /// True for the message types a client sends to a server.
    pub fn is_client_message(self) -> bool {
        matches!(
            self,
            Self::Discover | Self::Request | Self::Decline | Self::Release | Self::Inform
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which header fields (option 52) hold options after the options area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OverloadFlag {
    File = 1,
    Sname = 2,
    Both = 3,
}

impl OverloadFlag {
    pub fn includes_file(self) -> bool {
        matches!(self, Self::File | Self::Both)
    }

    pub fn includes_sname(self) -> bool {
        matches!(self, Self::Sname | Self::Both)
    }
}

impl TryFrom<u8> for OverloadFlag {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::File),
            2 => Ok(Self::Sname),
            3 => Ok(Self::Both),
            other => Err(other),
        }
    }
}

/// One decoded option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// The first router is the client's default gateway.
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    Hostname(String),
    DomainName(String),
    BroadcastAddress(Ipv4Addr),
    RequestedIpAddress(Ipv4Addr),
    /// Seconds.
    LeaseTime(u32),
    OptionOverload(OverloadFlag),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    /// T1, seconds.
    RenewalTime(u32),
    /// T2, seconds.
    RebindingTime(u32),
    ClientIdentifier(Vec<u8>),
    /// Opaque sub-options added by a relay agent.
    RelayAgentInfo(Vec<u8>),
    InterfaceMtu(u16),
    Unknown(u8, Vec<u8>),
}

fn malformed(code: u8, reason: impl Into<String>) -> Error {
    Error::MalformedOption {
        code,
        reason: reason.into(),
    }
}

fn parse_addr(code: u8, data: &[u8]) -> Result<Ipv4Addr> {
    let octets: [u8; 4] = data
        .try_into()
        .map_err(|_| malformed(code, format!("expected 4 bytes, got {}", data.len())))?;
    Ok(Ipv4Addr::from(octets))
}

fn parse_addr_list(code: u8, data: &[u8]) -> Result<Vec<Ipv4Addr>> {
    if !data.len().is_multiple_of(4) {
        return Err(malformed(
            code,
            format!("address list length {} is not a multiple of 4", data.len()),
        ));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::from([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn parse_text(code: u8, data: &[u8]) -> Result<String> {
    String::from_utf8(data.to_vec()).map_err(|_| malformed(code, "text is not valid UTF-8"))
}

fn parse_u32(code: u8, data: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = data
        .try_into()
        .map_err(|_| malformed(code, format!("expected 4 bytes, got {}", data.len())))?;
    Ok(u32::from_be_bytes(bytes))
}

impl DhcpOption {
    pub fn option_code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u8,
            Self::Router(_) => OptionCode::Router as u8,
            Self::DnsServer(_) => OptionCode::DnsServer as u8,
            Self::Hostname(_) => OptionCode::Hostname as u8,
            Self::DomainName(_) => OptionCode::DomainName as u8,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress as u8,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::OptionOverload(_) => OptionCode::OptionOverload as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList as u8,
            Self::RenewalTime(_) => OptionCode::RenewalTime as u8,
            Self::RebindingTime(_) => OptionCode::RebindingTime as u8,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier as u8,
            Self::RelayAgentInfo(_) => OptionCode::RelayAgentInfo as u8,
            Self::InterfaceMtu(_) => OptionCode::InterfaceMtu as u8,
            Self::Unknown(code, _) => *code,
        }
    }

    /// Decodes the complete value of option `code`, after split instances
    /// have been joined.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedOption`] when the value has the wrong size for its
    /// type, names an undefined enumeration value, or is text that is not
    /// UTF-8.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Ok(Self::SubnetMask(parse_addr(code, data)?)),
            Ok(OptionCode::Router) => Ok(Self::Router(parse_addr_list(code, data)?)),
            Ok(OptionCode::DnsServer) => Ok(Self::DnsServer(parse_addr_list(code, data)?)),
            Ok(OptionCode::Hostname) => Ok(Self::Hostname(parse_text(code, data)?)),
            Ok(OptionCode::DomainName) => Ok(Self::DomainName(parse_text(code, data)?)),
            Ok(OptionCode::BroadcastAddress) => {
                Ok(Self::BroadcastAddress(parse_addr(code, data)?))
            }
            Ok(OptionCode::RequestedIpAddress) => {
                Ok(Self::RequestedIpAddress(parse_addr(code, data)?))
            }
            Ok(OptionCode::LeaseTime) => Ok(Self::LeaseTime(parse_u32(code, data)?)),
            Ok(OptionCode::OptionOverload) => {
                let [value] = data else {
                    return Err(malformed(code, "option overload must be 1 byte"));
                };
                OverloadFlag::try_from(*value)
                    .map(Self::OptionOverload)
                    .map_err(|value| malformed(code, format!("overload value {}", value)))
            }
            Ok(OptionCode::MessageType) => {
                let [value] = data else {
                    return Err(malformed(code, "message type must be 1 byte"));
                };
                MessageType::try_from(*value)
                    .map(Self::MessageType)
                    .map_err(|value| malformed(code, format!("unknown message type {}", value)))
            }
            Ok(OptionCode::ServerIdentifier) => {
                Ok(Self::ServerIdentifier(parse_addr(code, data)?))
            }
            Ok(OptionCode::ParameterRequestList) => Ok(Self::ParameterRequestList(data.to_vec())),
            Ok(OptionCode::RenewalTime) => Ok(Self::RenewalTime(parse_u32(code, data)?)),
            Ok(OptionCode::RebindingTime) => Ok(Self::RebindingTime(parse_u32(code, data)?)),
            Ok(OptionCode::ClientIdentifier) => Ok(Self::ClientIdentifier(data.to_vec())),
            Ok(OptionCode::RelayAgentInfo) => Ok(Self::RelayAgentInfo(data.to_vec())),
            Ok(OptionCode::InterfaceMtu) => {
                let bytes: [u8; 2] = data
                    .try_into()
                    .map_err(|_| malformed(code, format!("expected 2 bytes, got {}", data.len())))?;
                Ok(Self::InterfaceMtu(u16::from_be_bytes(bytes)))
            }
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => {
                Err(malformed(code, "pad/end carry no value"))
            }
            Err(other) => Ok(Self::Unknown(other, data.to_vec())),
        }
    }

    /// The option value without code or length bytes.
    pub fn value_bytes(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(addr)
            | Self::BroadcastAddress(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => addr.octets().to_vec(),
            Self::Router(addrs) | Self::DnsServer(addrs) => {
                addrs.iter().flat_map(|addr| addr.octets()).collect()
            }
            Self::Hostname(name) | Self::DomainName(name) => name.as_bytes().to_vec(),
            Self::LeaseTime(time) | Self::RenewalTime(time) | Self::RebindingTime(time) => {
                time.to_be_bytes().to_vec()
            }
            Self::OptionOverload(flag) => vec![*flag as u8],
            Self::MessageType(message_type) => vec![*message_type as u8],
            Self::ParameterRequestList(data)
            | Self::ClientIdentifier(data)
            | Self::RelayAgentInfo(data)
            | Self::Unknown(_, data) => data.clone(),
            Self::InterfaceMtu(mtu) => mtu.to_be_bytes().to_vec(),
        }
    }

    /// Wire form of the option: one TLV, or several with the same code when
    /// the value exceeds 255 bytes. An empty value is a zero-length TLV.
    pub fn encode(&self) -> Vec<u8> {
        let code = self.option_code();
        let value = self.value_bytes();

        if value.is_empty() {
            return vec![code, 0];
        }

        let mut result = Vec::with_capacity(value.len() + 2 * value.len().div_ceil(MAX_OPTION_CHUNK));
        for chunk in value.chunks(MAX_OPTION_CHUNK) {
            result.push(code);
            result.push(chunk.len() as u8);
            result.extend_from_slice(chunk);
        }
        result
    }
}

/// Collects raw option values across one or more option areas.
///
/// Instances of the same code are concatenated in the order they are seen,
/// which is how a split long option is reassembled.
#[derive(Debug, Default)]
pub(crate) struct OptionScanner {
    raw: BTreeMap<u8, Vec<u8>>,
}

impl OptionScanner {
    /// Scans one option area up to its End marker.
    pub(crate) fn scan(&mut self, data: &[u8]) -> Result<()> {
        let mut index = 0;

        while index < data.len() {
            let code = data[index];

            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }

            if code == OptionCode::End as u8 {
                break;
            }

            let Some(&length) = data.get(index + 1) else {
                return Err(malformed(code, "length byte missing"));
            };
            let length = length as usize;

            let Some(value) = data.get(index + 2..index + 2 + length) else {
                return Err(malformed(
                    code,
                    format!(
                        "declared length {} overruns the remaining {} bytes",
                        length,
                        data.len() - index - 2
                    ),
                ));
            };

            self.raw.entry(code).or_default().extend_from_slice(value);
            index += 2 + length;
        }

        Ok(())
    }

    /// The overload flag seen so far, if any.
    pub(crate) fn overload(&self) -> Result<Option<OverloadFlag>> {
        let code = OptionCode::OptionOverload as u8;
        match self.raw.get(&code) {
            Some(data) => match DhcpOption::parse(code, data)? {
                DhcpOption::OptionOverload(flag) => Ok(Some(flag)),
                _ => Ok(None),
            },
            None => Ok(None),
        }
    }

    pub(crate) fn finish(self) -> Result<OptionSet> {
        let mut options = OptionSet::new();
        for (code, data) in self.raw {
            options.insert(DhcpOption::parse(code, &data)?);
        }
        Ok(options)
    }
}

/// Options of one message keyed by code.
///
/// Iteration and encoding always run in ascending code order, so the same
/// set always produces the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet {
    options: BTreeMap<u8, DhcpOption>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a single option area (Pad skipped, End terminates).
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedOption`] when a declared length overruns the
    /// buffer or a known option carries a value of the wrong shape.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut scanner = OptionScanner::default();
        scanner.scan(data)?;
        scanner.finish()
    }

    /// Encodes all options followed by the End marker.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        for option in self.options.values() {
            bytes.extend_from_slice(&option.encode());
        }
        bytes.push(OptionCode::End as u8);
        bytes
    }

    /// Inserts an option, returning the one it replaced.
    pub fn insert(&mut self, option: DhcpOption) -> Option<DhcpOption> {
        self.options.insert(option.option_code(), option)
    }

    pub fn get(&self, code: u8) -> Option<&DhcpOption> {
        self.options.get(&code)
    }

    pub fn remove(&mut self, code: u8) -> Option<DhcpOption> {
        self.options.remove(&code)
    }

    pub fn contains(&self, code: u8) -> bool {
        self.options.contains_key(&code)
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DhcpOption> {
        self.options.values()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&DhcpOption) -> bool) {
        self.options.retain(|_, option| keep(option));
    }

    pub fn message_type(&self) -> Option<MessageType> {
        match self.get(OptionCode::MessageType as u8) {
            Some(DhcpOption::MessageType(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        match self.get(OptionCode::RequestedIpAddress as u8) {
            Some(DhcpOption::RequestedIpAddress(ip)) => Some(*ip),
            _ => None,
        }
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        match self.get(OptionCode::ServerIdentifier as u8) {
            Some(DhcpOption::ServerIdentifier(ip)) => Some(*ip),
            _ => None,
        }
    }

    pub fn client_identifier(&self) -> Option<&[u8]> {
        match self.get(OptionCode::ClientIdentifier as u8) {
            Some(DhcpOption::ClientIdentifier(id)) => Some(id.as_slice()),
            _ => None,
        }
    }

    pub fn relay_agent_info(&self) -> Option<&[u8]> {
        match self.get(OptionCode::RelayAgentInfo as u8) {
            Some(DhcpOption::RelayAgentInfo(info)) => Some(info.as_slice()),
            _ => None,
        }
    }

    pub fn hostname(&self) -> Option<&str> {
        match self.get(OptionCode::Hostname as u8) {
            Some(DhcpOption::Hostname(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        match self.get(OptionCode::ParameterRequestList as u8) {
            Some(DhcpOption::ParameterRequestList(params)) => Some(params.as_slice()),
            _ => None,
        }
    }

    pub fn lease_time(&self) -> Option<u32> {
        match self.get(OptionCode::LeaseTime as u8) {
            Some(DhcpOption::LeaseTime(time)) => Some(*time),
            _ => None,
        }
    }

    pub fn overload(&self) -> Option<OverloadFlag> {
        match self.get(OptionCode::OptionOverload as u8) {
            Some(DhcpOption::OptionOverload(flag)) => Some(*flag),
            _ => None,
        }
    }
}

impl FromIterator<DhcpOption> for OptionSet {
    fn from_iter<I: IntoIterator<Item = DhcpOption>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl Extend<DhcpOption> for OptionSet {
    fn extend<I: IntoIterator<Item = DhcpOption>>(&mut self, iter: I) {
        for option in iter {
            self.insert(option);
        }
    }
}
