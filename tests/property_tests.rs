//! Property-based round-trip laws for the wire formats.

use proptest::prelude::*;

use tdmh::crypto::{Aead, AesGcm, AesOcb, Iv};
use tdmh::schedule::{DownlinkElement, InfoType, ScheduleElement, ScheduleHeader};
use tdmh::stream::{
    Direction, Period, Redundancy, SmeType, StreamId, StreamInfo, StreamManagementElement,
    StreamParameters, StreamStatus,
};
use tdmh::uplink::TopologyElement;
use tdmh::util::{Packet, RuntimeBitset};

fn arb_stream_id() -> impl Strategy<Value = StreamId> {
    (any::<u8>(), any::<u8>(), 0u8..16, 0u8..16)
        .prop_map(|(src, dst, sp, dp)| StreamId::new(src, dst, sp, dp))
}

fn arb_params() -> impl Strategy<Value = StreamParameters> {
    (
        prop_oneof![
            Just(Redundancy::None),
            Just(Redundancy::Double),
            Just(Redundancy::Triple),
            Just(Redundancy::DoubleSpatial),
            Just(Redundancy::TripleSpatial),
        ],
        prop_oneof![
            Just(Period::P1),
            Just(Period::P2),
            Just(Period::P5),
            Just(Period::P10),
            Just(Period::P20),
            Just(Period::P50),
            Just(Period::P100),
        ],
        0u8..128,
        prop_oneof![Just(Direction::Tx), Just(Direction::Rx)],
    )
        .prop_map(|(r, p, s, d)| StreamParameters::new(r, p, s, d))
}

proptest! {
    #[test]
    fn stream_id_roundtrip(id in arb_stream_id()) {
        prop_assert_eq!(StreamId::from_bytes(id.to_bytes()), id);
    }

    #[test]
    fn stream_params_roundtrip(params in arb_params()) {
        prop_assert_eq!(StreamParameters::from_bytes(params.to_bytes()), Some(params));
    }

    #[test]
    fn sme_roundtrip(id in arb_stream_id(), params in arb_params(), ty in 0u8..3) {
        let ty = SmeType::from_raw(ty).unwrap();
        let info = StreamInfo::new(id, params, StreamStatus::Connecting);
        let sme = StreamManagementElement::new(&info, ty);
        let mut pkt = Packet::new();
        sme.serialize(&mut pkt).unwrap();
        let parsed = StreamManagementElement::deserialize(&mut pkt).unwrap();
        prop_assert_eq!(parsed, sme);
        prop_assert!(pkt.is_empty());
    }

    #[test]
    fn schedule_header_roundtrip(
        total in any::<u16>(),
        current in any::<u16>(),
        id in any::<u32>(),
        activation in any::<u32>(),
        tiles in any::<u16>(),
        repetition in any::<u8>(),
    ) {
        let header = ScheduleHeader {
            total_packets: total,
            current_packet: current,
            schedule_id: id,
            activation_tile: activation,
            schedule_tiles: tiles,
            repetition,
        };
        let mut pkt = Packet::new();
        header.serialize(&mut pkt).unwrap();
        prop_assert_eq!(ScheduleHeader::deserialize(&mut pkt).unwrap(), header);
    }

    #[test]
    fn schedule_element_roundtrip(
        id in arb_stream_id(),
        params in arb_params(),
        tx in any::<u8>(),
        rx in any::<u8>(),
        offset in 0u32..(1 << 20),
    ) {
        let element = DownlinkElement::Schedule(ScheduleElement { id, params, tx, rx, offset });
        let mut pkt = Packet::new();
        element.serialize(&mut pkt).unwrap();
        prop_assert_eq!(DownlinkElement::deserialize(&mut pkt).unwrap(), Some(element));
    }

    #[test]
    fn info_element_roundtrip(id in arb_stream_id(), raw in 0u32..3) {
        let element = DownlinkElement::Info { id, ty: InfoType::from_raw(raw).unwrap() };
        let mut pkt = Packet::new();
        element.serialize(&mut pkt).unwrap();
        prop_assert_eq!(DownlinkElement::deserialize(&mut pkt).unwrap(), Some(element));
    }

    #[test]
    fn response_element_roundtrip(node in any::<u8>(), response in any::<[u8; 8]>()) {
        let element = DownlinkElement::Response { node_id: node, response };
        let mut pkt = Packet::new();
        element.serialize(&mut pkt).unwrap();
        prop_assert_eq!(DownlinkElement::deserialize(&mut pkt).unwrap(), Some(element));
    }

    #[test]
    fn topology_element_roundtrip(id in 0u8..32, bits in any::<[u8; 4]>(), weak in any::<bool>()) {
        let strong = RuntimeBitset::from_bytes(&bits);
        let weak_bits = weak.then(|| RuntimeBitset::from_bytes(&bits));
        let element = TopologyElement::from_bitsets(id, strong, weak_bits);
        let mut pkt = Packet::new();
        element.serialize(&mut pkt).unwrap();
        let parsed = TopologyElement::deserialize(&mut pkt, 4, weak).unwrap();
        prop_assert_eq!(parsed, element);
    }

    #[test]
    fn packet_put_get_chunks(chunks in proptest::collection::vec(
        proptest::collection::vec(any::<u8>(), 1..16), 1..8)
    ) {
        let mut pkt = Packet::new();
        for chunk in &chunks {
            pkt.put(chunk).unwrap();
        }
        for chunk in &chunks {
            let mut out = vec![0u8; chunk.len()];
            pkt.get(&mut out).unwrap();
            prop_assert_eq!(&out, chunk);
        }
        prop_assert!(pkt.is_empty());
    }

    #[test]
    fn gcm_roundtrip_any_lengths(
        key in any::<[u8; 16]>(),
        data in proptest::collection::vec(any::<u8>(), 0..64),
        aad in proptest::collection::vec(any::<u8>(), 0..32),
        tile in any::<u32>(),
        seq in any::<u64>(),
        index in any::<u32>(),
    ) {
        let mut gcm = AesGcm::new(&key);
        let mut buf = data.clone();
        gcm.set_nonce(tile, seq, index);
        let tag = gcm.encrypt_in_place(&mut buf, &aad);
        gcm.set_nonce(tile, seq, index);
        prop_assert!(gcm.decrypt_in_place(&mut buf, &aad, &tag));
        prop_assert_eq!(buf, data);
    }

    #[test]
    fn ocb_roundtrip_any_lengths(
        key in any::<[u8; 16]>(),
        data in proptest::collection::vec(any::<u8>(), 0..109),
        aad in proptest::collection::vec(any::<u8>(), 0..64),
        tile in any::<u32>(),
        seq in any::<u64>(),
        index in any::<u32>(),
    ) {
        let mut ocb = AesOcb::new(&key);
        let mut buf = data.clone();
        ocb.set_nonce(tile, seq, index);
        let tag = ocb.encrypt_in_place(&mut buf, &aad);
        ocb.set_nonce(tile, seq, index);
        prop_assert!(ocb.decrypt_in_place(&mut buf, &aad, &tag));
        prop_assert_eq!(buf, data);
    }

    #[test]
    fn ocb_rejects_corruption(
        key in any::<[u8; 16]>(),
        data in proptest::collection::vec(any::<u8>(), 1..64),
        flip in any::<usize>(),
    ) {
        let mut ocb = AesOcb::new(&key);
        let mut buf = data.clone();
        ocb.set_nonce(1, 2, 3);
        let tag = ocb.encrypt_in_place(&mut buf, b"ad");
        let idx = flip % buf.len();
        buf[idx] ^= 0x40;
        ocb.set_nonce(1, 2, 3);
        prop_assert!(!ocb.decrypt_in_place(&mut buf, b"ad", &tag));
    }

    #[test]
    fn iv_increment_is_injective(start in any::<[u8; 16]>()) {
        let mut iv = Iv::new(start);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            prop_assert!(seen.insert(*iv.as_bytes()));
            iv.increment();
        }
    }
}
