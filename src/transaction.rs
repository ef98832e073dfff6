//! Per-message DHCP state machine.
//!
//! [`TransactionEngine::handle`] turns one inbound datagram into at most one
//! reply. All lease decisions go through the [`LeaseStore`]; this module only
//! maps store outcomes onto OFFER, ACK, NAK or silence and builds the reply
//! options.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::allocator::{ConflictProbe, PoolAllocator};
use crate::config::{Config, MIN_LEASE_SECONDS, sanitize_hostname};
use crate::error::{Error, Result};
use crate::guard::RateGuard;
use crate::lease::{ClientId, Lease, LeaseTiming};
use crate::options::{DhcpOption, MessageType, OptionSet};
use crate::packet::{BOOTREQUEST, BROADCAST_FLAG, DhcpPacket};
use crate::store::LeaseStore;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// A reply and where to send it.
#[derive(Debug, Clone)]
pub struct Reply {
    pub packet: DhcpPacket,
    pub destination: SocketAddr,
}

/// What the engine knows about the message being handled.
#[derive(Debug)]
struct Transaction {
    client_id: ClientId,
    mac: String,
    message_type: MessageType,
    lease: Option<Lease>,
}

pub struct TransactionEngine {
    config: Arc<Config>,
    store: Arc<LeaseStore>,
    allocator: PoolAllocator,
    guard: RateGuard,
}

impl TransactionEngine {
    pub fn new(store: Arc<LeaseStore>, probe: Arc<dyn ConflictProbe>) -> Result<Self> {
        let config = Arc::clone(store.config());
        let guard = RateGuard::from_config(&config)?;
        Ok(Self {
            allocator: PoolAllocator::new(Arc::clone(&store), probe),
            config,
            store,
            guard,
        })
    }

    pub fn store(&self) -> &Arc<LeaseStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Parses and handles one datagram received from `source`.
    pub async fn handle(&self, data: &[u8], source: SocketAddr) -> Option<Reply> {
        match DhcpPacket::parse(data) {
            Ok(packet) => self.handle_packet(&packet, source).await,
            Err(error) => {
                warn!("Dropping datagram from {}: {}", source, error);
                None
            }
        }
    }

    pub async fn handle_packet(&self, packet: &DhcpPacket, source: SocketAddr) -> Option<Reply> {
        if packet.op != BOOTREQUEST {
            warn!("Dropping op {} message from {}", packet.op, source);
            return None;
        }

        let Some(message_type) = packet.message_type() else {
            warn!("Dropping message without a DHCP message type from {}", source);
            return None;
        };

        if !message_type.is_client_message() {
            warn!("Ignoring {} from {}", message_type, source);
            return None;
        }

        let mut transaction = Transaction {
            client_id: packet.client_id(),
            mac: packet.format_mac(),
            message_type,
            lease: None,
        };

        let span = info_span!(
            "dhcp",
            xid = %format!("{:#010x}", packet.xid),
            client = %transaction.client_id
        );

        async {
            if let Err(error) = self.guard.check(&transaction.client_id, message_type).await {
                warn!("{} from {} dropped: {}", message_type, transaction.mac, error);
                return None;
            }

            info!("{} from {} ({})", message_type, transaction.mac, source);

            let reply = match message_type {
                MessageType::Discover => self.handle_discover(packet, &mut transaction).await,
                MessageType::Request => self.handle_request(packet, &mut transaction).await,
                MessageType::Decline => {
                    self.handle_decline(packet, &mut transaction).await;
                    None
                }
                MessageType::Release => {
                    self.handle_release(packet, &mut transaction).await;
                    None
                }
                MessageType::Inform => Some(self.handle_inform(packet, &transaction)),
                _ => None,
            };

            if let Some(lease) = &transaction.lease {
                debug!(
                    "{} left {} {}",
                    transaction.message_type, lease.address, lease.state
                );
            }

            reply.map(|reply| Reply {
                destination: reply_destination(packet, &reply),
                packet: reply,
            })
        }
        .instrument(span)
        .await
    }

    async fn handle_discover(
        &self,
        packet: &DhcpPacket,
        transaction: &mut Transaction,
    ) -> Option<DhcpPacket> {
        let lease = match self
            .allocator
            .select(&transaction.client_id, packet.xid, packet.requested_ip())
            .await
        {
            Ok(lease) => lease,
            Err(Error::PoolExhausted) => {
                warn!("Pool exhausted, cannot offer IP to {}", transaction.mac);
                return None;
            }
            Err(error) => {
                warn!("No offer for {}: {}", transaction.mac, error);
                return None;
            }
        };

        let timing = match lease.timing().filter(|_| lease.state.is_bound()) {
            Some(timing) => timing,
            None => self.config.lease_timing(self.negotiate_lease_time(packet)),
        };
        let options = self.finish_options(packet, self.build_lease_options(timing));
        let offer = DhcpPacket::create_reply(
            packet,
            MessageType::Offer,
            lease.address,
            self.config.server_ip,
            options,
        );

        info!("OFFER {} to {}", lease.address, transaction.mac);
        transaction.lease = Some(lease);
        Some(offer)
    }

    async fn handle_request(
        &self,
        packet: &DhcpPacket,
        transaction: &mut Transaction,
    ) -> Option<DhcpPacket> {
        let client_id = &transaction.client_id;

        if let Some(server_id) = packet.server_identifier()
            && server_id != self.config.server_ip
        {
            match self.store.withdraw_offer(client_id).await {
                Some(address) => info!(
                    "{} chose server {}, withdrew offer of {}",
                    transaction.mac, server_id, address
                ),
                None => info!(
                    "REQUEST from {} is for different server {}",
                    transaction.mac, server_id
                ),
            }
            return None;
        }

        let ciaddr = Some(packet.ciaddr).filter(|ip| !ip.is_unspecified());
        let Some(address) = packet.requested_ip().or(ciaddr) else {
            warn!("REQUEST from {} names no address", transaction.mac);
            return None;
        };

        if !self.store.contains(address) {
            return Some(self.nak(packet, transaction, "Requested IP not in pool"));
        }

        let lease_duration = self.negotiate_lease_time(packet);
        let renewing = packet.requested_ip().is_none() && ciaddr.is_some();

        let result = if renewing {
            match self
                .store
                .renew(address, client_id, packet.xid, lease_duration)
                .await
            {
                Err(Error::LeaseNotFound(_)) => {
                    self.confirm(packet, client_id, address, lease_duration)
                        .await
                }
                other => other,
            }
        } else {
            self.confirm(packet, client_id, address, lease_duration)
                .await
        };

        match result {
            Ok(lease) => {
                let timing = lease
                    .timing()
                    .unwrap_or_else(|| self.config.lease_timing(lease_duration));
                let options = self.finish_options(packet, self.build_lease_options(timing));
                let mut ack = DhcpPacket::create_reply(
                    packet,
                    MessageType::Ack,
                    address,
                    self.config.server_ip,
                    options,
                );
                ack.ciaddr = packet.ciaddr;

                info!(
                    "ACK {} to {} (lease: {} seconds)",
                    address, transaction.mac, timing.duration
                );
                transaction.lease = Some(lease);
                Some(ack)
            }
            Err(Error::ClientMismatch(_)) => Some(self.nak(
                packet,
                transaction,
                "Requested IP is held by another client",
            )),
            Err(Error::AddressConflict(_)) => {
                Some(self.nak(packet, transaction, "Requested IP is quarantined"))
            }
            Err(Error::AddressOutOfRange(_)) => {
                Some(self.nak(packet, transaction, "Requested IP not in pool"))
            }
            Err(Error::Persistence(reason)) => {
                error!(
                    "Withholding ACK of {} to {}: {}",
                    address, transaction.mac, reason
                );
                None
            }
            Err(error) => {
                warn!(
                    "REQUEST from {} for {} dropped: {}",
                    transaction.mac, address, error
                );
                None
            }
        }
    }

    async fn confirm(
        &self,
        packet: &DhcpPacket,
        client_id: &ClientId,
        address: Ipv4Addr,
        lease_duration: u32,
    ) -> Result<Lease> {
        let hostname = packet
            .hostname()
            .map(sanitize_hostname)
            .filter(|name| !name.is_empty());
        self.store
            .confirm(address, client_id, packet.xid, lease_duration, hostname)
            .await
    }

    async fn handle_decline(&self, packet: &DhcpPacket, transaction: &mut Transaction) {
        if let Some(server_id) = packet.server_identifier()
            && server_id != self.config.server_ip
        {
            return;
        }

        let Some(declined_ip) = packet.requested_ip() else {
            warn!("DECLINE from {} names no address", transaction.mac);
            return;
        };

        match self.store.decline(declined_ip, &transaction.client_id).await {
            Ok(lease) => {
                warn!(
                    "DECLINE from {} for {} - marked IP as unavailable",
                    transaction.mac, declined_ip
                );
                transaction.lease = Some(lease);
            }
            Err(_) => warn!(
                "DECLINE from {} for {} rejected - IP not associated with this client",
                transaction.mac, declined_ip
            ),
        }
    }

    async fn handle_release(&self, packet: &DhcpPacket, transaction: &mut Transaction) {
        if packet.ciaddr.is_unspecified() {
            warn!("RELEASE from {} with no ciaddr", transaction.mac);
            return;
        }

        match self
            .store
            .release(packet.ciaddr, &transaction.client_id)
            .await
        {
            Ok(lease) => {
                info!("RELEASE from {} for {}", transaction.mac, packet.ciaddr);
                transaction.lease = Some(lease);
            }
            Err(error) => warn!(
                "RELEASE from {} for {} ignored: {}",
                transaction.mac, packet.ciaddr, error
            ),
        }
    }

    fn handle_inform(&self, packet: &DhcpPacket, transaction: &Transaction) -> DhcpPacket {
        let options = self.finish_options(packet, self.build_inform_options());
        let mut ack = DhcpPacket::create_reply(
            packet,
            MessageType::Ack,
            Ipv4Addr::UNSPECIFIED,
            self.config.server_ip,
            options,
        );
        ack.ciaddr = packet.ciaddr;

        info!("INFORM response to {}", transaction.mac);
        ack
    }

    fn nak(&self, packet: &DhcpPacket, transaction: &Transaction, reason: &str) -> DhcpPacket {
        let mut options = OptionSet::new();
        options.insert(DhcpOption::ServerIdentifier(self.config.server_ip));
        if let Some(relay_info) = packet.relay_agent_info() {
            options.insert(DhcpOption::RelayAgentInfo(relay_info.to_vec()));
        }

        let mut nak = DhcpPacket::create_reply(
            packet,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            self.config.server_ip,
            options,
        );
        if !packet.giaddr.is_unspecified() {
            nak.flags |= BROADCAST_FLAG;
        }

        warn!("NAK to {}: {}", transaction.mac, reason);
        nak
    }

    fn negotiate_lease_time(&self, packet: &DhcpPacket) -> u32 {
        let max_lease = self.config.max_lease_seconds();
        match packet.requested_lease_time() {
            Some(requested) => requested.max(MIN_LEASE_SECONDS).min(max_lease),
            None => self.config.lease_duration_seconds,
        }
    }

    fn build_common_options(&self, options: &mut OptionSet) {
        options.insert(DhcpOption::SubnetMask(self.config.subnet_mask));

        if let Some(gateway) = self.config.gateway {
            options.insert(DhcpOption::Router(vec![gateway]));
        }

        if !self.config.dns_servers.is_empty() {
            options.insert(DhcpOption::DnsServer(self.config.dns_servers.clone()));
        }

        if let Some(ref domain) = self.config.domain_name {
            options.insert(DhcpOption::DomainName(domain.clone()));
        }
    }

    fn build_lease_options(&self, timing: LeaseTiming) -> OptionSet {
        let mut options = OptionSet::new();
        options.insert(DhcpOption::ServerIdentifier(self.config.server_ip));
        options.insert(DhcpOption::LeaseTime(timing.duration));

        self.build_common_options(&mut options);

        options.insert(DhcpOption::BroadcastAddress(
            self.config.calculate_broadcast(),
        ));
        options.insert(DhcpOption::RenewalTime(timing.renewal));
        options.insert(DhcpOption::RebindingTime(timing.rebinding));

        if let Some(mtu) = self.config.mtu {
            options.insert(DhcpOption::InterfaceMtu(mtu));
        }

        options
    }

    fn build_inform_options(&self) -> OptionSet {
        let mut options = OptionSet::new();
        options.insert(DhcpOption::ServerIdentifier(self.config.server_ip));

        self.build_common_options(&mut options);

        options
    }

    /// Applies the client's parameter request list and echoes option 82.
    fn finish_options(&self, packet: &DhcpPacket, options: OptionSet) -> OptionSet {
        let mut options = filter_options_by_prl(options, packet.parameter_request_list());
        if let Some(relay_info) = packet.relay_agent_info() {
            options.insert(DhcpOption::RelayAgentInfo(relay_info.to_vec()));
        }
        options
    }
}

fn filter_options_by_prl(
    mut options: OptionSet,
    parameter_request_list: Option<&[u8]>,
) -> OptionSet {
    let Some(prl) = parameter_request_list else {
        return options;
    };

    options.retain(|opt| {
        let code = opt.option_code();
        matches!(code, 53 | 54 | 51 | 58 | 59) || prl.contains(&code)
    });
    options
}

/// Where a reply to `request` goes (RFC 2131 section 4.1).
pub fn reply_destination(request: &DhcpPacket, reply: &DhcpPacket) -> SocketAddr {
    let is_nak = reply.message_type() == Some(MessageType::Nak);

    if !request.giaddr.is_unspecified() {
        SocketAddr::new(IpAddr::V4(request.giaddr), DHCP_SERVER_PORT)
    } else if is_nak || request.is_broadcast() || request.ciaddr.is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
    } else {
        SocketAddr::new(IpAddr::V4(request.ciaddr), DHCP_CLIENT_PORT)
    }
}
