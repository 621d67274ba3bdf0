use proptest::prelude::*;

use bootlease::options::{SUBOPTION_CIRCUIT_ID, SUBOPTION_REMOTE_ID};
use bootlease::{DhcpOption, DhcpPacket, Error, MessageType, RelayAgentInformation, Request};

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const DHCP_FIXED_HEADER_SIZE: usize = 240;
const RELAY_AGENT_INFO: u8 = 82;

fn valid_header() -> Vec<u8> {
    let mut packet = vec![0u8; DHCP_FIXED_HEADER_SIZE];
    packet[0] = 1;
    packet[1] = 1;
    packet[2] = 6;
    packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
    packet
}

fn sub_option(code: u8, data: &[u8]) -> Vec<u8> {
    let mut encoded = vec![code, data.len() as u8];
    encoded.extend_from_slice(data);
    encoded
}

/// Sub-options other than circuit id.
fn filler() -> impl Strategy<Value = Vec<(u8, Vec<u8>)>> {
    prop::collection::vec(
        (
            any::<u8>().prop_filter("not circuit id", |code| *code != SUBOPTION_CIRCUIT_ID),
            prop::collection::vec(any::<u8>(), 0..16),
        ),
        0..4,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2000))]

    #[test]
    fn parse_never_panics_on_arbitrary_bytes(data: Vec<u8>) {
        let _ = DhcpPacket::parse(&data);
    }

    #[test]
    fn parse_never_panics_on_valid_header_with_random_options(
        options_data in prop::collection::vec(any::<u8>(), 0..512)
    ) {
        let mut packet = valid_header();
        packet.extend_from_slice(&options_data);
        if let Ok(parsed) = DhcpPacket::parse(&packet) {
            // Whatever made it through the codec must be safe to dispatch.
            let _ = Request::new(parsed);
        }
    }

    #[test]
    fn short_packets_always_rejected(
        data in prop::collection::vec(any::<u8>(), 0..240)
    ) {
        prop_assert!(DhcpPacket::parse(&data).is_err());
    }

    #[test]
    fn excessive_hops_always_rejected(hops in 17u8..=255) {
        let mut packet = valid_header();
        packet[3] = hops;
        packet.push(255);
        prop_assert!(DhcpPacket::parse(&packet).is_err());
    }

    #[test]
    fn relay_parser_never_panics(payload: Vec<u8>) {
        let _ = RelayAgentInformation::parse(&payload);
    }

    #[test]
    fn relay_decoder_never_panics(raw in prop::collection::vec(any::<u8>(), 0..300)) {
        let _ = RelayAgentInformation::decode(&raw);
    }

    #[test]
    fn circuit_id_found_anywhere_in_chain(
        before in filler(),
        after in filler(),
        circuit in prop::collection::vec(any::<u8>(), 0..32),
    ) {
        let mut payload = Vec::new();
        for (code, data) in &before {
            payload.extend(sub_option(*code, data));
        }
        payload.extend(sub_option(SUBOPTION_CIRCUIT_ID, &circuit));
        for (code, data) in &after {
            payload.extend(sub_option(*code, data));
        }

        let info = RelayAgentInformation::parse(&payload).unwrap();
        prop_assert_eq!(info.circuit_id, Some(circuit));
    }

    #[test]
    fn truncated_sub_option_is_malformed(
        circuit in prop::collection::vec(any::<u8>(), 1..32),
        cut in 1usize..32,
    ) {
        let mut payload = sub_option(SUBOPTION_REMOTE_ID, b"relay-1");
        payload.extend(sub_option(SUBOPTION_CIRCUIT_ID, &circuit));
        let cut = cut.min(circuit.len());
        payload.truncate(payload.len() - cut);

        let is_malformed = matches!(
            RelayAgentInformation::parse(&payload),
            Err(Error::MalformedOption { code: RELAY_AGENT_INFO, .. })
        );
        prop_assert!(is_malformed);
    }

    #[test]
    fn declared_length_past_input_is_malformed(
        body in prop::collection::vec(any::<u8>(), 0..64),
        extra in 1usize..64,
    ) {
        let declared = (body.len() + extra).min(255);
        prop_assume!(declared > body.len());

        let mut raw = vec![RELAY_AGENT_INFO, declared as u8];
        raw.extend_from_slice(&body);

        let is_malformed = matches!(
            RelayAgentInformation::decode(&raw),
            Err(Error::MalformedOption { .. })
        );
        prop_assert!(is_malformed);
    }

    #[test]
    fn relay_info_survives_the_wire(
        circuit in prop::collection::vec(any::<u8>(), 1..32),
        xid in any::<u32>(),
    ) {
        let mut request = DhcpPacket::request(MessageType::Discover, xid, [2, 0, 0, 0, 0, 1]);
        request.giaddr = std::net::Ipv4Addr::new(10, 1, 0, 1);
        request
            .options
            .push(DhcpOption::RelayAgentInfo(sub_option(SUBOPTION_CIRCUIT_ID, &circuit)));

        let parsed = DhcpPacket::parse(&request.encode()).unwrap();
        let info = RelayAgentInformation::parse(parsed.relay_agent_info().unwrap()).unwrap();
        prop_assert_eq!(info.circuit_id, Some(circuit));
        prop_assert_eq!(parsed.giaddr, request.giaddr);
    }
}
