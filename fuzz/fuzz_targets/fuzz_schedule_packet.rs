//! Fuzz target: schedule packet parsing.
//!
//! Arbitrary frames must never panic the downlink parser: malformed
//! elements are dropped, truncated headers are errors, and parsing never
//! reads past the frame.
//!
//! cargo fuzz run fuzz_schedule_packet

#![no_main]

use libfuzzer_sys::fuzz_target;
use tdmh::schedule::SchedulePacket;
use tdmh::util::Packet;

fuzz_target!(|data: &[u8]| {
    let mut pkt = Packet::new();
    if pkt.load_frame(data).is_err() {
        return; // longer than a radio frame
    }
    if !pkt.check_pan_header(0xcafe) {
        return;
    }
    if let Ok(spkt) = SchedulePacket::deserialize(&mut pkt) {
        // Whatever parsed must re-serialize within one frame.
        let mut out = Packet::new();
        let _ = spkt.serialize(&mut out, 0xcafe);
    }
});
