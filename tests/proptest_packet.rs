use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use chrono::DateTime;
use proptest::prelude::*;

use leasehold::packet::{BOOTREQUEST, DHCP_MAGIC_COOKIE, HLEN_ETHERNET, HTYPE_ETHERNET};
use leasehold::{
    Config, DhcpPacket, LeaseStore, ManualClock, MemoryBackend, MessageType, NoProbe,
    TransactionEngine,
};

const HEADER_LEN: usize = 240;

#[derive(Debug, Clone)]
struct Header {
    hops: u8,
    xid: u32,
    secs: u16,
    flags: u16,
    addresses: [[u8; 4]; 4],
    chaddr: [u8; 16],
}

impl Header {
    fn bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(HEADER_LEN + 1);
        data.extend_from_slice(&[BOOTREQUEST, HTYPE_ETHERNET, HLEN_ETHERNET, self.hops]);
        data.extend_from_slice(&self.xid.to_be_bytes());
        data.extend_from_slice(&self.secs.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        for address in &self.addresses {
            data.extend_from_slice(address);
        }
        data.extend_from_slice(&self.chaddr);
        data.resize(236, 0);
        data.extend_from_slice(&DHCP_MAGIC_COOKIE);
        data
    }
}

fn header() -> impl Strategy<Value = Header> {
    (
        0u8..=16,
        any::<u32>(),
        any::<u16>(),
        any::<u16>(),
        any::<[[u8; 4]; 4]>(),
        any::<[u8; 16]>(),
    )
        .prop_map(|(hops, xid, secs, flags, addresses, chaddr)| Header {
            hops,
            xid,
            secs,
            flags,
            addresses,
            chaddr,
        })
}

fn plain_header() -> Vec<u8> {
    Header {
        hops: 0,
        xid: 1,
        secs: 0,
        flags: 0,
        addresses: [[0; 4]; 4],
        chaddr: [0; 16],
    }
    .bytes()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2000))]

    #[test]
    fn arbitrary_datagrams_never_panic(data in prop::collection::vec(any::<u8>(), 0..1500)) {
        let _ = DhcpPacket::parse(&data);
    }

    #[test]
    fn arbitrary_option_areas_never_panic(
        options in prop::collection::vec(any::<u8>(), 0..600),
        sname in any::<[u8; 32]>(),
        file in any::<[u8; 32]>(),
        overload in 0u8..=4,
    ) {
        let mut data = plain_header();
        data[44..76].copy_from_slice(&sname);
        data[108..140].copy_from_slice(&file);
        data.extend_from_slice(&[52, 1, overload]);
        data.extend_from_slice(&options);
        let _ = DhcpPacket::parse(&data);
    }

    #[test]
    fn header_bytes_survive_parse_and_encode(header in header()) {
        let mut data = header.bytes();
        data.push(255);

        let packet = DhcpPacket::parse(&data).unwrap();
        prop_assert_eq!(packet.xid, header.xid);
        prop_assert_eq!(packet.flags, header.flags);
        prop_assert_eq!(packet.giaddr, Ipv4Addr::from(header.addresses[3]));
        prop_assert_eq!(packet.chaddr, header.chaddr);

        let encoded = packet.encode();
        prop_assert!(encoded.len() >= 300);
        prop_assert_eq!(&encoded[..HEADER_LEN], &data[..HEADER_LEN]);
    }

    #[test]
    fn truncated_headers_rejected(data in prop::collection::vec(any::<u8>(), 0..HEADER_LEN)) {
        prop_assert!(DhcpPacket::parse(&data).is_err());
    }

    #[test]
    fn foreign_cookies_rejected(cookie in any::<[u8; 4]>()) {
        prop_assume!(cookie != DHCP_MAGIC_COOKIE);
        let mut data = plain_header();
        data[236..240].copy_from_slice(&cookie);
        prop_assert!(DhcpPacket::parse(&data).is_err());
    }

    #[test]
    fn relay_loops_rejected(hops in 17u8..=255) {
        let mut data = plain_header();
        data[3] = hops;
        prop_assert!(DhcpPacket::parse(&data).is_err());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn fuzzed_requests_only_draw_server_replies(
        header in header(),
        message in 1u8..=8,
        options in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let mut data = header.bytes();
        data.extend_from_slice(&[53, 1, message]);
        data.extend_from_slice(&options);

        let (reply, bound) = runtime.block_on(async {
            let config = Config {
                pool_end: Ipv4Addr::new(192, 168, 1, 103),
                ..Default::default()
            };
            let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
            let store = LeaseStore::open(
                Arc::new(config),
                Arc::new(clock),
                Arc::new(MemoryBackend::new()),
            )
            .await
            .unwrap();
            let engine = TransactionEngine::new(Arc::new(store), Arc::new(NoProbe)).unwrap();

            let source: SocketAddr = "0.0.0.0:68".parse().unwrap();
            let reply = engine.handle(&data, source).await;
            (reply, engine.store().active_count().await)
        });

        prop_assert!(bound <= 1);
        if let Some(reply) = reply {
            prop_assert_eq!(reply.packet.xid, header.xid);
            prop_assert!(matches!(
                reply.packet.message_type(),
                Some(MessageType::Offer | MessageType::Ack | MessageType::Nak)
            ));
        }
    }
}
