#![no_main]

use libfuzzer_sys::fuzz_target;
use skiff_transport::wire::{read_message, PacketHeader, ReadOutcome, WirePacket, MAX_PAYLOAD_LEN};

/// Fuzz the datagram decode pipeline.
///
/// Any input must either decode or be refused; messages that do decode
/// respect the payload limit.
fuzz_target!(|data: &[u8]| {
    let mut buf = data;
    if let Some(packet) = WirePacket::decode(&mut buf) {
        assert!(packet.messages.len() + packet.rejected <= packet.header.message_count as usize);
        for msg in &packet.messages {
            assert!(msg.payload.len() <= MAX_PAYLOAD_LEN);
        }
    }

    let mut buf = data;
    let _ = PacketHeader::decode(&mut buf);

    // Message framing on its own, until the input runs dry.
    let mut buf = data;
    while let ReadOutcome::Message(_) | ReadOutcome::Rejected { .. } = read_message(&mut buf) {}
});
