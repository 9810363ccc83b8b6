//! Cross-primitive crypto behavior: the AEAD seam through the packet
//! helpers, stream key derivation interoperability, and slot binding.

use std::sync::Arc;

use tdmh::config::NetworkConfig;
use tdmh::crypto::{Aead, AesGcm, AesOcb};
use tdmh::stream::{Direction, Period, Redundancy, StreamManager, StreamParameters};
use tdmh::util::Packet;

fn params() -> StreamParameters {
    StreamParameters::new(Redundancy::None, Period::P2, 16, Direction::Tx)
}

fn modes(key: &[u8; 16]) -> Vec<Box<dyn Aead>> {
    vec![Box::new(AesGcm::new(key)), Box::new(AesOcb::new(key))]
}

/// The packet tag helpers accept GCM and OCB3 interchangeably.
#[test]
fn packet_tag_seam_works_with_both_modes() {
    let key = [0x5au8; 16];
    for (mut tx, mut rx) in modes(&key).into_iter().zip(modes(&key)) {
        let mut pkt = Packet::new();
        pkt.put_pan_header(0xcafe).unwrap();
        pkt.put(b"control payload").unwrap();
        pkt.reserve_tag();

        tx.set_nonce(7, 1, 0);
        pkt.put_tag(tx.as_mut()).unwrap();

        rx.set_nonce(7, 1, 0);
        assert!(pkt.verify(rx.as_mut()).unwrap());
        assert!(pkt.check_pan_header(0xcafe));
    }
}

/// Encryption through the packet helper hides and restores the payload.
#[test]
fn packet_encrypt_seam_roundtrip() {
    let mut tx = AesOcb::new(&[1u8; 16]);
    let mut rx = AesOcb::new(&[1u8; 16]);

    let mut pkt = Packet::new();
    pkt.put(b"secret bytes").unwrap();
    pkt.reserve_tag();
    tx.set_nonce(3, 1, 0);
    pkt.encrypt_and_put_tag(&mut tx).unwrap();
    assert_ne!(pkt.remaining(), b"secret bytes".as_slice());

    rx.set_nonce(3, 1, 0);
    assert!(pkt.verify_and_decrypt(&mut rx).unwrap());
    assert_eq!(pkt.remaining(), b"secret bytes");
}

/// A tag computed for one slot never verifies in another: the slotInfo
/// binding makes replays fail across tiles, sequence numbers and key
/// generations.
#[test]
fn slot_binding_rejects_replay() {
    let mut ocb = AesOcb::new(&[9u8; 16]);
    ocb.set_nonce(100, 1, 0);
    let tag = ocb.encrypt_in_place(&mut [], b"beacon");

    for (tile, seq, mi) in [(101, 1, 0), (100, 2, 0), (100, 1, 1)] {
        ocb.set_nonce(tile, seq, mi);
        assert!(
            !ocb.decrypt_in_place(&mut [], b"beacon", &tag),
            "replay accepted at tile={tile} seq={seq} mi={mi}"
        );
    }
    ocb.set_nonce(100, 1, 0);
    assert!(ocb.decrypt_in_place(&mut [], b"beacon", &tag));
}

/// Two stream managers with the same derivation state produce
/// interoperable per-stream ciphers: what the source authenticates, the
/// destination verifies.
#[test]
fn stream_keys_interoperate_across_nodes() {
    let mut cfg_a = NetworkConfig::base(1, 6, 16);
    cfg_a.authenticate_data_messages = true;
    let mut cfg_b = NetworkConfig::base(2, 6, 16);
    cfg_b.authenticate_data_messages = true;

    let mgr_a = StreamManager::new(Arc::new(cfg_a), 1);
    let mgr_b = StreamManager::new(Arc::new(cfg_b), 2);
    let shared_iv = [0x77u8; 16];
    mgr_a.set_stream_key_iv(shared_iv);
    mgr_b.set_stream_key_iv(shared_iv);

    // Node 1 opens the stream; node 2 learns it from the schedule.
    let fd = mgr_a.connect(2, 3, params()).unwrap();
    let id = mgr_a.get_info(fd).unwrap().id;
    let element = tdmh::schedule::ScheduleElement::single_hop(id, params());
    mgr_b.set_schedule(std::slice::from_ref(&element));

    let mut payload = *b"data phase payload";
    let tag = mgr_a
        .with_stream_cipher(id, |ocb| {
            ocb.set_nonce(5, 1, 0);
            ocb.encrypt_in_place(&mut payload, &[])
        })
        .unwrap();
    let ok = mgr_b
        .with_stream_cipher(id, |ocb| {
            ocb.set_nonce(5, 1, 0);
            ocb.decrypt_in_place(&mut payload, &[], &tag)
        })
        .unwrap();
    assert!(ok);
    assert_eq!(&payload, b"data phase payload");
}

/// Different streams never share a key: a tag from one stream fails on
/// another even under the same master key and nonce.
#[test]
fn stream_keys_are_distinct_per_stream() {
    let mut cfg = NetworkConfig::base(1, 6, 16);
    cfg.authenticate_data_messages = true;
    let mgr = StreamManager::new(Arc::new(cfg), 1);
    mgr.set_stream_key_iv([0x31u8; 16]);

    let fd_a = mgr.connect(2, 3, params()).unwrap();
    let fd_b = mgr.connect(2, 4, params()).unwrap();
    let id_a = mgr.get_info(fd_a).unwrap().id;
    let id_b = mgr.get_info(fd_b).unwrap().id;

    let tag = mgr
        .with_stream_cipher(id_a, |ocb| {
            ocb.set_nonce(1, 1, 0);
            ocb.encrypt_in_place(&mut [], b"x")
        })
        .unwrap();
    let cross = mgr
        .with_stream_cipher(id_b, |ocb| {
            ocb.set_nonce(1, 1, 0);
            ocb.decrypt_in_place(&mut [], b"x", &tag)
        })
        .unwrap();
    assert!(!cross);
}
