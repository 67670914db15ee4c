#![no_main]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use quanta::Clock;
use skiff_transport::connection::{ConnectionState, Guid, PeerConnection};
use skiff_transport::wire::{MessageOptions, WirePacket};
use skiff_transport::ConnectionId;

/// Feed arbitrary datagrams to a connection.
///
/// The input is split on 0xFF bytes into datagrams. Messages are stamped
/// reliable or in-order by type parity, the way a registry would. The
/// connection must never panic and must keep building valid packets.
fuzz_target!(|data: &[u8]| {
    let (clock, mock) = Clock::mock();
    let mut conn = PeerConnection::new(
        ConnectionId(1),
        SocketAddr::from(([127, 0, 0, 1], 9000)),
        Guid::from_name("fuzz"),
        ConnectionState::Unconfirmed,
        clock.now(),
    );

    for chunk in data.split(|&b| b == 0xFF).filter(|c| !c.is_empty()) {
        let len = chunk.len();
        let Some(packet) = WirePacket::decode(&mut Bytes::copy_from_slice(chunk)) else {
            continue;
        };
        conn.mark_packet_received(&packet.header, len, clock.now());
        for msg in packet.messages {
            let options = if msg.message_type % 2 == 0 {
                MessageOptions::RELIABLE
            } else {
                MessageOptions::RELIABLE | MessageOptions::INORDER
            };
            let _ = conn.process_message(msg.with_options(options));
        }

        mock.increment(Duration::from_millis(50));
        let out = conn.build_packet(clock.now(), 0, Duration::from_millis(150));
        assert!(WirePacket::decode(&mut out.clone()).is_some());
    }
});
