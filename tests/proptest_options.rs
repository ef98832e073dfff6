use std::net::Ipv4Addr;

use proptest::prelude::*;

use leasehold::{DhcpOption, DhcpPacket, Error, OptionSet};
use leasehold::packet::DHCP_MAGIC_COOKIE;

/// Codes with a typed variant, plus Pad and End.
const TYPED_CODES: [u8; 19] = [
    0, 1, 3, 6, 12, 15, 26, 28, 50, 51, 52, 53, 54, 55, 58, 59, 61, 82, 255,
];

fn address() -> impl Strategy<Value = Ipv4Addr> {
    any::<[u8; 4]>().prop_map(Ipv4Addr::from)
}

fn option() -> impl Strategy<Value = DhcpOption> {
    prop_oneof![
        address().prop_map(DhcpOption::SubnetMask),
        prop::collection::vec(address(), 0..100).prop_map(DhcpOption::Router),
        prop::collection::vec(address(), 0..100).prop_map(DhcpOption::DnsServer),
        ".{0,200}".prop_map(DhcpOption::Hostname),
        ".{0,200}".prop_map(DhcpOption::DomainName),
        any::<u32>().prop_map(DhcpOption::LeaseTime),
        any::<u32>().prop_map(DhcpOption::RenewalTime),
        any::<u16>().prop_map(DhcpOption::InterfaceMtu),
        prop::collection::vec(any::<u8>(), 2..600).prop_map(DhcpOption::ClientIdentifier),
        (
            any::<u8>().prop_filter("typed code", |code| !TYPED_CODES.contains(code)),
            prop::collection::vec(any::<u8>(), 1..600),
        )
            .prop_map(|(code, data)| DhcpOption::Unknown(code, data)),
    ]
}

fn bare_request() -> DhcpPacket {
    let mut data = vec![0u8; 240];
    data[0] = 1;
    data[1] = 1;
    data[2] = 6;
    data[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
    data.push(255);
    DhcpPacket::parse(&data).unwrap()
}

proptest! {
    #[test]
    fn option_sets_survive_encode_decode(options in prop::collection::vec(option(), 0..12)) {
        let set: OptionSet = options.into_iter().collect();
        let decoded = OptionSet::decode(&set.encode()).unwrap();
        prop_assert_eq!(decoded, set);
    }

    #[test]
    fn long_values_split_into_full_chunks(data in prop::collection::vec(any::<u8>(), 256..1200)) {
        let encoded = DhcpOption::ClientIdentifier(data.clone()).encode();
        let chunks = data.len().div_ceil(255);
        prop_assert_eq!(encoded.len(), data.len() + 2 * chunks);
        prop_assert_eq!(encoded[1], 255);
    }

    #[test]
    fn packet_options_survive_encode_parse(options in prop::collection::vec(option(), 0..8)) {
        let mut packet = bare_request();
        packet.options = options.into_iter().collect();

        let reparsed = DhcpPacket::parse(&packet.encode()).unwrap();
        prop_assert_eq!(reparsed.options, packet.options);
    }

    #[test]
    fn text_that_is_not_utf8_is_rejected(
        code in prop_oneof![Just(12u8), Just(15u8)],
        data in prop::collection::vec(any::<u8>(), 1..400)
            .prop_filter("invalid UTF-8", |data| std::str::from_utf8(data).is_err()),
    ) {
        let mut area = DhcpOption::Unknown(code, data).encode();
        area.push(255);
        let decoded = OptionSet::decode(&area);
        prop_assert!(
            matches!(decoded, Err(Error::MalformedOption { code: reported, .. }) if reported == code),
            "expected MalformedOption for code {}, got {:?}", code, decoded
        );
    }

    #[test]
    fn decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..1024)) {
        let _ = OptionSet::decode(&data);
    }
}
