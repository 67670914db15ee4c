//! Property-based tests for the Skiff wire format.
//!
//! Packets built from arbitrary message runs must decode back to the same
//! messages, never exceed the MTU, and arbitrary bytes must never panic the
//! decoder.

use bytes::Bytes;
use proptest::prelude::*;
use skiff_transport::seq::AckWindow;
use skiff_transport::wire::*;

// ─── Strategies ──────────────────────────────────────────────────────────────

fn message() -> impl Strategy<Value = WireMessage> {
    (
        any::<u8>(),
        any::<u16>(),
        any::<u16>(),
        prop::collection::vec(any::<u8>(), 0..150),
    )
        .prop_map(|(ty, reliable_id, sequence_id, payload)| {
            let mut msg = WireMessage::new(ty, payload);
            msg.reliable_id = reliable_id;
            msg.sequence_id = sequence_id;
            msg
        })
}

/// Payload sizes clustered around the limits.
fn payload_len() -> impl Strategy<Value = usize> {
    prop_oneof![
        Just(0usize),
        Just(MAX_PAYLOAD_LEN),
        Just(MAX_PAYLOAD_LEN + 1),
        Just(PACKET_MTU),
        0usize..MESSAGE_MTU,
    ]
}

fn header() -> impl Strategy<Value = PacketHeader> {
    (any::<u8>(), any::<u16>(), any::<u16>(), any::<u16>())
        .prop_map(|(sender, ack, highest, bits)| {
            PacketHeader::new(sender, ack, AckWindow::from_parts(highest, bits))
        })
}

proptest! {
    #[test]
    fn packet_roundtrip(header in header(), msgs in prop::collection::vec(message(), 0..6)) {
        let bytes = WirePacket::encode(header, &msgs).unwrap();
        let decoded = WirePacket::decode(&mut bytes.clone()).unwrap();

        prop_assert_eq!(decoded.header.sender, header.sender);
        prop_assert_eq!(decoded.header.ack, header.ack);
        prop_assert_eq!(decoded.header.ack_window(), header.ack_window());
        prop_assert_eq!(decoded.header.message_count as usize, msgs.len());
        prop_assert_eq!(decoded.rejected, 0);
        prop_assert_eq!(decoded.messages, msgs);
    }

    #[test]
    fn writer_never_exceeds_mtu(lens in prop::collection::vec(payload_len(), 1..12)) {
        let mut writer = PacketWriter::new(PacketHeader::new(0, 0, AckWindow::new()));
        let mut written = Vec::new();
        for (i, len) in lens.iter().enumerate() {
            let msg = WireMessage::new(i as u8, vec![0xAB; *len]);
            if writer.write_message(&msg) {
                written.push(msg);
            } else {
                prop_assert!(!writer.can_write(&msg));
            }
        }
        let bytes = writer.finish();
        prop_assert!(bytes.len() <= PACKET_MTU);

        let decoded = WirePacket::decode(&mut bytes.clone()).unwrap();
        prop_assert_eq!(decoded.messages, written);
    }

    #[test]
    fn decode_arbitrary_bytes_never_panics(data in prop::collection::vec(any::<u8>(), 0..1500)) {
        let len = data.len();
        match WirePacket::decode(&mut Bytes::from(data)) {
            None => prop_assert!(len < PACKET_HEADER_SIZE),
            Some(packet) => {
                prop_assert!(
                    packet.messages.len() + packet.rejected <= packet.header.message_count as usize
                );
                for msg in &packet.messages {
                    prop_assert!(msg.payload.len() <= MAX_PAYLOAD_LEN);
                }
            }
        }
    }

    #[test]
    fn truncated_packet_keeps_complete_prefix(
        msgs in prop::collection::vec(message(), 1..6),
        cut in 1usize..64,
    ) {
        let bytes = WirePacket::encode(PacketHeader::new(1, 2, AckWindow::new()), &msgs).unwrap();
        let keep = bytes.len().saturating_sub(cut).max(PACKET_HEADER_SIZE);
        let decoded = WirePacket::decode(&mut bytes.slice(..keep)).unwrap();

        prop_assert!(decoded.messages.len() <= msgs.len());
        prop_assert_eq!(&decoded.messages[..], &msgs[..decoded.messages.len()]);
        if keep < bytes.len() {
            prop_assert_eq!(decoded.rejected, 1);
        }
    }
}
