//! Fuzz target: uplink message validation.
//!
//! The strict first-packet checks must reject or accept arbitrary frames
//! without panicking, and an accepted frame must deserialize exactly the
//! advertised number of elements.
//!
//! cargo fuzz run fuzz_uplink_message

#![no_main]

use libfuzzer_sys::fuzz_target;
use tdmh::config::NetworkConfig;
use tdmh::uplink::ReceiveUplinkMessage;
use tdmh::util::{Packet, UpdatableQueue};

fuzz_target!(|data: &[u8]| {
    let config = NetworkConfig::base(3, 6, 32);
    let mut message = ReceiveUplinkMessage::new(&config);
    let mut pkt = Packet::new();
    if pkt.load_frame(data).is_err() {
        return;
    }
    if message.process_packet(pkt, -60, None, None) {
        let mut topologies = UpdatableQueue::new();
        let mut smes = UpdatableQueue::new();
        message.deserialize_into(&mut topologies, &mut smes);
    }
});
