//! # Integration tests: sessions talking over an in-memory network
//!
//! Every test drives two or more [`Session`]s over a [`MemoryNetwork`] with a
//! shared mock clock, so timeouts and resend thresholds are deterministic.
//! Loss and reordering come from the simulated channel each session wraps
//! its transport in.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use quanta::{Clock, Mock};
use skiff_transport::config::SimulationConfig;
use skiff_transport::seq::AckWindow;
use skiff_transport::wire::{PacketHeader, WirePacket, INVALID_ACK, INVALID_CONNECTION_INDEX};
use skiff_transport::{
    ConnectionId, ConnectionState, ControlFlags, ErrorCode, MemoryNetwork, MessageOptions,
    Session, SessionConfig, SessionEvent, SessionState, Transport, WireMessage,
};

const STEP: Duration = Duration::from_millis(10);
const CHAT: u8 = 40;
const ORDERED: u8 = 41;

type Inbox = Arc<Mutex<Vec<(Option<ConnectionId>, Bytes)>>>;

// ─── Helpers ────────────────────────────────────────────────────────────────

struct Harness {
    net: MemoryNetwork,
    clock: Clock,
    mock: Arc<Mock>,
}

impl Harness {
    fn new() -> Self {
        // RUST_LOG=skiff_transport=debug to trace a failing run.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let (clock, mock) = Clock::mock();
        Harness {
            net: MemoryNetwork::new(),
            clock,
            mock,
        }
    }

    /// A started session at 127.0.0.1:`port` with CHAT (reliable) and
    /// ORDERED (reliable in-order) collectors registered.
    fn session(&self, port: u16, config: SessionConfig) -> (Session, Inbox) {
        let inbox: Inbox = Arc::default();
        let mut session = Session::new_with_clock(config, self.clock.clone());
        for (ty, options) in [
            (CHAT, MessageOptions::RELIABLE),
            (ORDERED, MessageOptions::RELIABLE | MessageOptions::INORDER),
        ] {
            let sink = Arc::clone(&inbox);
            session
                .register_message_type(
                    ty,
                    "collect",
                    move |ctx, msg| {
                        sink.lock()
                            .unwrap()
                            .push((ctx.sender(), msg.payload.clone()))
                    },
                    options,
                    ControlFlags::NONE,
                )
                .unwrap();
        }
        let transport = self.net.bind(addr(port)).unwrap();
        session.start_with(Box::new(transport)).unwrap();
        (session, inbox)
    }

    /// Advance the clock by one step and update every session.
    fn step(&self, sessions: &mut [&mut Session]) {
        self.mock.increment(STEP);
        for s in sessions.iter_mut() {
            s.update(STEP);
        }
    }

    fn run(&self, sessions: &mut [&mut Session], steps: usize) {
        for _ in 0..steps {
            self.step(sessions);
        }
    }

    /// Step until `done` holds; panics after `max_steps`.
    fn run_until(
        &self,
        sessions: &mut [&mut Session],
        max_steps: usize,
        mut done: impl FnMut(&[&mut Session]) -> bool,
    ) {
        for _ in 0..max_steps {
            if done(sessions) {
                return;
            }
            self.step(sessions);
        }
        assert!(done(sessions), "condition not met after {max_steps} steps");
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn simulated() -> SessionConfig {
    SessionConfig {
        simulation: Some(SimulationConfig::default()),
        ..SessionConfig::default()
    }
}

/// Host on port 1, one peer named `name` on `port`, handshake completed.
fn connected_pair(h: &Harness, config: SessionConfig) -> (Session, Inbox, Session, Inbox) {
    let (mut host, host_inbox) = h.session(1, config.clone());
    let (mut peer, peer_inbox) = h.session(2, config);
    host.host("host").unwrap();
    peer.join("peer", addr(1)).unwrap();
    h.run_until(&mut [&mut host, &mut peer], 200, |s| {
        s[1].state() == SessionState::Connected
    });
    host.drain_events();
    peer.drain_events();
    (host, host_inbox, peer, peer_inbox)
}

fn payload_ids(inbox: &Inbox) -> Vec<u16> {
    inbox
        .lock()
        .unwrap()
        .iter()
        .map(|(_, p)| u16::from_be_bytes([p[0], p[1]]))
        .collect()
}

// ─── Handshake ──────────────────────────────────────────────────────────────

#[test]
fn join_handshake_assigns_indices() {
    let h = Harness::new();
    let (mut host, _) = h.session(1, SessionConfig::default());
    let (mut peer, _) = h.session(2, SessionConfig::default());
    host.host("host").unwrap();
    peer.join("alice", addr(1)).unwrap();
    assert_eq!(peer.state(), SessionState::Joining);

    h.run_until(&mut [&mut host, &mut peer], 200, |s| {
        s[1].state() == SessionState::Connected
    });

    assert!(peer
        .drain_events()
        .contains(&SessionEvent::Joined {
            me: ConnectionId(1),
            host: ConnectionId(0)
        }));
    assert!(host
        .drain_events()
        .contains(&SessionEvent::PeerConnected(ConnectionId(1))));
    assert_eq!(peer.me(), Some(ConnectionId(1)));
    assert_eq!(peer.host_id(), Some(ConnectionId(0)));
    assert_eq!(peer.connection(ConnectionId(0)).unwrap().guid().name(), "host");
    assert_eq!(host.connection(ConnectionId(1)).unwrap().guid().name(), "alice");

    // Both sides settle into confirmed connections once traffic flows.
    h.run(&mut [&mut host, &mut peer], 20);
    assert_eq!(
        host.connection(ConnectionId(1)).unwrap().state(),
        ConnectionState::Confirmed
    );
    assert_eq!(
        peer.connection(ConnectionId(0)).unwrap().state(),
        ConnectionState::Confirmed
    );
    assert_eq!(peer.connection(ConnectionId(0)).unwrap().reliables_outstanding(), 0);
}

#[test]
fn join_denied_when_full() {
    let h = Harness::new();
    let (mut host, _) = h.session(1, SessionConfig::default());
    host.host("host").unwrap();

    let mut peers: Vec<Session> = (0..7)
        .map(|i| {
            let (mut s, _) = h.session(10 + i, SessionConfig::default());
            s.join(&format!("peer{i}"), addr(1)).unwrap();
            s
        })
        .collect();
    for _ in 0..100 {
        h.mock.increment(STEP);
        host.update(STEP);
        for p in &mut peers {
            p.update(STEP);
        }
    }
    assert!(peers.iter().all(|p| p.state() == SessionState::Connected));
    assert_eq!(host.connection_count(), 8);

    let (mut alice, _) = h.session(50, SessionConfig::default());
    alice.join("alice", addr(1)).unwrap();
    h.run_until(&mut [&mut host, &mut alice], 100, |s| {
        s[1].state() != SessionState::Joining
    });

    assert_eq!(alice.state(), SessionState::Disconnected);
    assert_eq!(alice.last_error(), Some(ErrorCode::JoinDeniedFull));
    assert!(alice
        .drain_events()
        .contains(&SessionEvent::JoinFailed(ErrorCode::JoinDeniedFull)));
}

#[test]
fn join_denied_when_closed() {
    let h = Harness::new();
    let (mut host, _) = h.session(1, SessionConfig::default());
    let (mut peer, _) = h.session(2, SessionConfig::default());
    host.host("host").unwrap();
    host.set_accepting_joins(false);
    peer.join("alice", addr(1)).unwrap();
    h.run_until(&mut [&mut host, &mut peer], 100, |s| {
        s[1].state() != SessionState::Joining
    });
    assert_eq!(peer.last_error(), Some(ErrorCode::JoinDeniedClosed));
    assert_eq!(host.connection_count(), 1);
}

#[test]
fn join_denied_when_name_taken() {
    let h = Harness::new();
    let (mut host, _) = h.session(1, SessionConfig::default());
    let (mut a, _) = h.session(2, SessionConfig::default());
    let (mut b, _) = h.session(3, SessionConfig::default());
    host.host("host").unwrap();
    a.join("alice", addr(1)).unwrap();
    h.run_until(&mut [&mut host, &mut a], 100, |s| {
        s[1].state() == SessionState::Connected
    });

    b.join("alice", addr(1)).unwrap();
    h.run_until(&mut [&mut host, &mut a, &mut b], 100, |s| {
        s[2].state() != SessionState::Joining
    });
    assert_eq!(b.last_error(), Some(ErrorCode::JoinDeniedGuidTaken));
    assert_eq!(a.state(), SessionState::Connected);
}

#[test]
fn join_denied_by_non_host() {
    let h = Harness::new();
    let (mut idle, _) = h.session(1, SessionConfig::default());
    let (mut peer, _) = h.session(2, SessionConfig::default());
    peer.join("alice", addr(1)).unwrap();
    h.run_until(&mut [&mut idle, &mut peer], 100, |s| {
        s[1].state() != SessionState::Joining
    });
    assert_eq!(peer.last_error(), Some(ErrorCode::JoinDeniedNotHost));
    assert_eq!(idle.state(), SessionState::Disconnected);
}

#[test]
fn join_times_out_without_host() {
    let h = Harness::new();
    let (mut peer, _) = h.session(2, SessionConfig::default());
    peer.join("alice", addr(99)).unwrap();

    // 4.9 s: still waiting.
    h.run(&mut [&mut peer], 490);
    assert_eq!(peer.state(), SessionState::Joining);

    h.run(&mut [&mut peer], 20);
    assert_eq!(peer.state(), SessionState::Disconnected);
    assert_eq!(peer.last_error(), Some(ErrorCode::JoinTimeout));

    // A failed join can be retried.
    assert!(peer.join("alice", addr(99)).is_ok());
}

#[test]
fn host_message_during_handshake_arrives_once_after_join() {
    let h = Harness::new();
    let (mut host, _) = h.session(1, SessionConfig::default());
    let (mut peer, peer_inbox) = h.session(2, SessionConfig::default());
    host.host("host").unwrap();
    peer.join("peer", addr(1)).unwrap();

    // Queue a reliable for the new peer before its JOIN_ACCEPT is through.
    h.run_until(&mut [&mut peer, &mut host], 50, |s| {
        s[1].connection(ConnectionId(1)).is_some()
    });
    assert_eq!(peer.state(), SessionState::Joining);
    host.send(ConnectionId(1), CHAT, 9u16.to_be_bytes().to_vec())
        .unwrap();

    h.run_until(&mut [&mut host, &mut peer], 200, |_| {
        !peer_inbox.lock().unwrap().is_empty()
    });
    assert_eq!(peer.state(), SessionState::Connected);
    h.run(&mut [&mut host, &mut peer], 50);

    let inbox = peer_inbox.lock().unwrap();
    assert_eq!(inbox.len(), 1, "delivered exactly once");
    assert_eq!(inbox[0].0, Some(ConnectionId(0)));
    assert_eq!(&inbox[0].1[..], &9u16.to_be_bytes()[..]);
    drop(inbox);
    let link = host.connection(ConnectionId(1)).unwrap();
    assert_eq!(link.reliables_outstanding(), 0);
}

// ─── Reliability ────────────────────────────────────────────────────────────

#[test]
fn reliable_messages_delivered_exactly_once_under_loss() {
    let h = Harness::new();
    let (mut host, host_inbox, mut peer, _) = connected_pair(&h, simulated());
    for sim in [host.simulation().unwrap(), peer.simulation().unwrap()] {
        sim.set_loss(0.3);
    }

    for i in 0..300u16 {
        peer.send(ConnectionId(0), CHAT, i.to_be_bytes().to_vec())
            .unwrap();
        if i % 10 == 0 {
            h.step(&mut [&mut host, &mut peer]);
        }
    }
    h.run_until(&mut [&mut host, &mut peer], 5_000, |s| {
        s[1].connection(ConnectionId(0))
            .is_some_and(|c| c.reliables_outstanding() == 0)
    });

    let mut ids = payload_ids(&host_inbox);
    assert_eq!(ids.len(), 300, "no duplicates, nothing missing");
    ids.sort_unstable();
    assert_eq!(ids, (0..300).collect::<Vec<_>>());
    assert!(peer.stats().totals.reliable_resends > 0);
    assert!(host_inbox
        .lock()
        .unwrap()
        .iter()
        .all(|(from, _)| *from == Some(ConnectionId(1))));
}

#[test]
fn in_order_messages_survive_loss_and_reordering() {
    let h = Harness::new();
    let (mut host, host_inbox, mut peer, _) = connected_pair(&h, simulated());
    let sim = host.simulation().unwrap();
    sim.set_loss(0.2);
    sim.set_latency(Duration::ZERO, Duration::from_millis(200));

    for i in 0..150u16 {
        peer.send(ConnectionId(0), ORDERED, i.to_be_bytes().to_vec())
            .unwrap();
        h.step(&mut [&mut host, &mut peer]);
    }
    h.run_until(&mut [&mut host, &mut peer], 5_000, |_| {
        host_inbox.lock().unwrap().len() == 150
    });

    assert_eq!(payload_ids(&host_inbox), (0..150).collect::<Vec<_>>());
    let stats = host.stats();
    assert!(stats.totals.out_of_order_buffered > 0, "reordering happened");
}

#[test]
fn lost_acks_cause_resends_but_single_delivery() {
    let h = Harness::new();
    let (mut host, host_inbox, mut peer, _) = connected_pair(&h, simulated());

    // The host hears the peer but the peer hears nothing back, so the
    // peer keeps resending the same reliable id.
    peer.simulation().unwrap().set_loss(1.0);
    peer.send(ConnectionId(0), CHAT, 7u16.to_be_bytes().to_vec())
        .unwrap();
    h.run(&mut [&mut host, &mut peer], 100);

    assert_eq!(payload_ids(&host_inbox), vec![7]);
    let resends = peer.stats().totals.reliable_resends;
    assert!(resends >= 3, "resent {resends} times");
    // The newest resend may still be on the wire.
    assert!(host.stats().totals.duplicates_dropped >= resends - 1);

    // Once acks get through the resends stop.
    peer.simulation().unwrap().set_loss(0.0);
    h.run(&mut [&mut host, &mut peer], 30);
    let peer_host = peer.connection(ConnectionId(0)).unwrap();
    assert_eq!(peer_host.reliables_outstanding(), 0);
    assert_eq!(payload_ids(&host_inbox), vec![7]);
}

#[test]
fn handler_reply_reaches_sender() {
    let h = Harness::new();
    let mut host = Session::new_with_clock(SessionConfig::default(), h.clock.clone());
    host.register_message_type(
        CHAT,
        "echo",
        |ctx, msg| ctx.reply(CHAT, msg.payload.clone()),
        MessageOptions::RELIABLE,
        ControlFlags::NONE,
    )
    .unwrap();
    host.start_with(Box::new(h.net.bind(addr(1)).unwrap())).unwrap();
    host.host("host").unwrap();

    let (mut peer, peer_inbox) = h.session(2, SessionConfig::default());
    peer.join("peer", addr(1)).unwrap();
    h.run_until(&mut [&mut host, &mut peer], 200, |s| {
        s[1].state() == SessionState::Connected
    });

    peer.send(ConnectionId(0), CHAT, Bytes::from_static(b"\x00\x2a"))
        .unwrap();
    h.run_until(&mut [&mut host, &mut peer], 100, |_| {
        !peer_inbox.lock().unwrap().is_empty()
    });
    assert_eq!(payload_ids(&peer_inbox), vec![42]);
}

#[test]
fn broadcast_reaches_every_peer() {
    let h = Harness::new();
    let (mut host, _) = h.session(1, SessionConfig::default());
    let (mut a, a_inbox) = h.session(2, SessionConfig::default());
    let (mut b, b_inbox) = h.session(3, SessionConfig::default());
    host.host("host").unwrap();
    a.join("a", addr(1)).unwrap();
    b.join("b", addr(1)).unwrap();
    h.run_until(&mut [&mut host, &mut a, &mut b], 200, |s| {
        s[1].state() == SessionState::Connected && s[2].state() == SessionState::Connected
    });

    assert_eq!(host.broadcast(CHAT, 1u16.to_be_bytes().to_vec()).unwrap(), 2);
    h.run(&mut [&mut host, &mut a, &mut b], 20);
    assert_eq!(payload_ids(&a_inbox), vec![1]);
    assert_eq!(payload_ids(&b_inbox), vec![1]);
}

#[test]
fn direct_send_skips_reliability_but_still_delivers() {
    let h = Harness::new();
    let (mut host, host_inbox, mut peer, _) = connected_pair(&h, SessionConfig::default());

    peer.send_direct(addr(1), CHAT, 5u16.to_be_bytes().to_vec())
        .unwrap();
    peer.send_direct(addr(1), ORDERED, 6u16.to_be_bytes().to_vec())
        .unwrap();
    h.run(&mut [&mut host, &mut peer], 5);
    assert_eq!(payload_ids(&host_inbox), vec![5, 6]);

    // The link's own reliable and in-order streams are untouched.
    peer.send(ConnectionId(0), CHAT, 7u16.to_be_bytes().to_vec())
        .unwrap();
    peer.send(ConnectionId(0), ORDERED, 8u16.to_be_bytes().to_vec())
        .unwrap();
    h.run(&mut [&mut host, &mut peer], 20);
    assert_eq!(payload_ids(&host_inbox), vec![5, 6, 7, 8]);
    assert!(host_inbox
        .lock()
        .unwrap()
        .iter()
        .all(|(from, _)| *from == Some(ConnectionId(1))));
    let totals = host.stats().totals;
    assert_eq!(totals.duplicates_dropped, 0);
    assert_eq!(totals.stale_dropped, 0);
}

// ─── Timeouts ───────────────────────────────────────────────────────────────

#[test]
fn silent_peer_goes_bad_then_times_out() {
    let h = Harness::new();
    let (mut host, _, _peer, _) = connected_pair(&h, SessionConfig::default());
    let id = ConnectionId(1);

    // Peer goes silent: only the host keeps updating.
    h.run(&mut [&mut host], 150);
    assert_eq!(host.connection(id).unwrap().state(), ConnectionState::Confirmed);

    h.run(&mut [&mut host], 60);
    assert_eq!(host.connection(id).unwrap().state(), ConnectionState::Bad);
    assert!(host
        .drain_events()
        .contains(&SessionEvent::ConnectionBad(id)));

    h.run(&mut [&mut host], 800);
    assert!(host.connection(id).is_none());
    assert!(host
        .drain_events()
        .contains(&SessionEvent::PeerDisconnected(id)));
    assert_eq!(host.state(), SessionState::Connected);
    assert!(host.last_error().is_none());
}

#[test]
fn silent_host_disconnects_peer_with_timeout() {
    let h = Harness::new();
    let (_host, _, mut peer, _) = connected_pair(&h, SessionConfig::default());

    h.run(&mut [&mut peer], 1_010);
    assert_eq!(peer.state(), SessionState::Disconnected);
    assert_eq!(peer.last_error(), Some(ErrorCode::ConnectionTimeout));
    assert!(peer.drain_events().contains(&SessionEvent::Disconnected));
}

#[test]
fn bad_connection_recovers_on_traffic() {
    let h = Harness::new();
    let (mut host, _, mut peer, _) = connected_pair(&h, SessionConfig::default());
    h.run(&mut [&mut host], 250);
    assert_eq!(
        host.connection(ConnectionId(1)).unwrap().state(),
        ConnectionState::Bad
    );
    h.run(&mut [&mut host, &mut peer], 10);
    assert_eq!(
        host.connection(ConnectionId(1)).unwrap().state(),
        ConnectionState::Confirmed
    );
}

#[test]
fn timeouts_can_be_disabled() {
    let h = Harness::new();
    let config = SessionConfig {
        timeouts_enabled: false,
        ..SessionConfig::default()
    };
    let (mut host, _, _peer, _) = connected_pair(&h, config);
    h.run(&mut [&mut host], 1_200);
    assert_eq!(
        host.connection(ConnectionId(1)).unwrap().state(),
        ConnectionState::Confirmed
    );
}

// ─── Teardown ───────────────────────────────────────────────────────────────

#[test]
fn kicked_peer_records_reason() {
    let h = Harness::new();
    let (mut host, _, mut peer, _) = connected_pair(&h, SessionConfig::default());
    host.kick(ConnectionId(1)).unwrap();
    assert!(host.connection(ConnectionId(1)).is_none());

    h.run(&mut [&mut host, &mut peer], 5);
    assert_eq!(peer.state(), SessionState::Disconnected);
    assert_eq!(peer.last_error(), Some(ErrorCode::Kicked));
    assert_eq!(peer.connection_count(), 0);
}

#[test]
fn host_quit_disconnects_peers() {
    let h = Harness::new();
    let (mut host, _, mut peer, _) = connected_pair(&h, SessionConfig::default());
    host.leave().unwrap();
    h.run(&mut [&mut host, &mut peer], 5);
    assert_eq!(peer.state(), SessionState::Disconnected);
    assert_eq!(peer.last_error(), Some(ErrorCode::HostQuit));
    assert!(peer.drain_events().contains(&SessionEvent::Disconnected));
}

#[test]
fn peer_leave_frees_slot() {
    let h = Harness::new();
    let (mut host, _, mut peer, _) = connected_pair(&h, SessionConfig::default());
    peer.leave().unwrap();
    assert_eq!(peer.state(), SessionState::Disconnected);
    assert!(peer.last_error().is_none());

    h.run(&mut [&mut host, &mut peer], 5);
    assert!(host.connection(ConnectionId(1)).is_none());
    assert_eq!(
        host.drain_events(),
        vec![SessionEvent::PeerDisconnected(ConnectionId(1))]
    );
}

#[test]
fn peer_rejoining_after_lost_leave_gets_fresh_link() {
    let h = Harness::new();
    let (mut host, host_inbox, mut peer, _) = connected_pair(&h, simulated());
    for i in 0..5u16 {
        peer.send(ConnectionId(0), CHAT, i.to_be_bytes().to_vec())
            .unwrap();
        peer.send(ConnectionId(0), ORDERED, (100 + i).to_be_bytes().to_vec())
            .unwrap();
    }
    h.run_until(&mut [&mut host, &mut peer], 100, |_| {
        host_inbox.lock().unwrap().len() == 10
    });

    // The farewell is lost and the peer process goes away.
    host.simulation().unwrap().set_loss(1.0);
    peer.leave().unwrap();
    h.run(&mut [&mut host], 3);
    host.simulation().unwrap().set_loss(0.0);
    drop(peer);
    assert!(host.connection(ConnectionId(1)).is_some());

    let (mut again, _) = h.session(2, simulated());
    again.join("peer", addr(1)).unwrap();
    h.run_until(&mut [&mut host, &mut again], 200, |s| {
        s[1].state() == SessionState::Connected
    });
    assert_eq!(again.me(), Some(ConnectionId(1)));
    let events = host.drain_events();
    let gone = events
        .iter()
        .position(|e| *e == SessionEvent::PeerDisconnected(ConnectionId(1)));
    let back = events
        .iter()
        .position(|e| *e == SessionEvent::PeerConnected(ConnectionId(1)));
    assert!(gone.is_some() && gone < back, "events {events:?}");

    for i in 10..15u16 {
        again.send(ConnectionId(0), CHAT, i.to_be_bytes().to_vec())
            .unwrap();
        again.send(ConnectionId(0), ORDERED, (100 + i).to_be_bytes().to_vec())
            .unwrap();
    }
    h.run_until(&mut [&mut host, &mut again], 200, |_| {
        host_inbox.lock().unwrap().len() == 20
    });
    let mut rejoined = payload_ids(&host_inbox).split_off(10);
    rejoined.sort_unstable();
    assert_eq!(rejoined, vec![10, 11, 12, 13, 14, 110, 111, 112, 113, 114]);
}

#[test]
fn host_teardown_order_is_peers_then_self() {
    let h = Harness::new();
    let (mut host, _) = h.session(1, SessionConfig::default());
    let (mut a, _) = h.session(2, SessionConfig::default());
    let (mut b, _) = h.session(3, SessionConfig::default());
    host.host("host").unwrap();
    a.join("a", addr(1)).unwrap();
    b.join("b", addr(1)).unwrap();
    h.run_until(&mut [&mut host, &mut a, &mut b], 200, |s| {
        s[1].state() == SessionState::Connected && s[2].state() == SessionState::Connected
    });
    host.drain_events();

    host.disconnect(ConnectionId(0));
    let events = host.drain_events();
    let first_two: Vec<_> = events[..2].to_vec();
    assert!(first_two.contains(&SessionEvent::PeerDisconnected(ConnectionId(1))));
    assert!(first_two.contains(&SessionEvent::PeerDisconnected(ConnectionId(2))));
    assert_eq!(events[2], SessionEvent::Disconnected);
    assert_eq!(host.connection_count(), 0);
}

#[test]
fn disconnecting_host_from_peer_disconnects_self() {
    let h = Harness::new();
    let (_host, _, mut peer, _) = connected_pair(&h, SessionConfig::default());
    peer.disconnect(ConnectionId(0));
    assert_eq!(peer.state(), SessionState::Disconnected);
    assert_eq!(peer.me(), None);
    assert_eq!(
        peer.drain_events(),
        vec![
            SessionEvent::PeerDisconnected(ConnectionId(0)),
            SessionEvent::Disconnected
        ]
    );
}

// ─── Diagnostics ────────────────────────────────────────────────────────────

#[test]
fn ping_measures_round_trip() {
    let h = Harness::new();
    let (mut host, _, mut peer, _) = connected_pair(&h, simulated());
    host.simulation()
        .unwrap()
        .set_latency(Duration::from_millis(30), Duration::from_millis(30));

    peer.ping(addr(1)).unwrap();
    h.run_until(&mut [&mut host, &mut peer], 100, |s| {
        s[1].connection(ConnectionId(0))
            .is_some_and(|c| c.rtt().sample_count() == 1)
    });
    let rtt = peer
        .drain_events()
        .into_iter()
        .find_map(|e| match e {
            SessionEvent::Pong { rtt, .. } => Some(rtt),
            _ => None,
        })
        .unwrap();
    assert!(rtt >= Duration::from_millis(30), "rtt {rtt:?}");
    assert!(rtt <= Duration::from_millis(60), "rtt {rtt:?}");
}

#[test]
fn ping_works_without_connection() {
    let h = Harness::new();
    let (mut a, _) = h.session(1, SessionConfig::default());
    let (mut b, _) = h.session(2, SessionConfig::default());
    a.ping(addr(2)).unwrap();
    h.run(&mut [&mut a, &mut b], 3);
    assert!(a
        .drain_events()
        .iter()
        .any(|e| matches!(e, SessionEvent::Pong { from, .. } if *from == addr(2))));
}

#[test]
fn stats_serialize_to_json() {
    let h = Harness::new();
    let (mut host, _, mut peer, _) = connected_pair(&h, SessionConfig::default());
    peer.send(ConnectionId(0), CHAT, 1u16.to_be_bytes().to_vec())
        .unwrap();
    h.run(&mut [&mut host, &mut peer], 20);

    let stats = host.stats();
    assert_eq!(stats.connection_count(), 2);
    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["connections"][1]["name"], "peer");
    assert!(json["totals"]["messages_delivered"].as_u64().unwrap() >= 1);
}

#[test]
fn unknown_message_types_are_counted() {
    let h = Harness::new();
    let (mut host, _, mut peer, _) = connected_pair(&h, SessionConfig::default());
    // Type 99 is registered on neither side, so build the datagram by hand.
    let mut raw = h.net.bind(addr(77)).unwrap();
    let bytes = WirePacket::encode(
        PacketHeader::new(INVALID_CONNECTION_INDEX, INVALID_ACK, AckWindow::new()),
        &[WireMessage::new(99, Bytes::from_static(b"?"))],
    )
    .unwrap();
    raw.send_to(addr(1), &bytes).unwrap();
    h.run(&mut [&mut host, &mut peer], 1);
    assert_eq!(host.stats().unknown_messages, 1);
    assert_eq!(host.state(), SessionState::Connected);
}
