//! End-to-end exercises of the connection state machine: two sans-I/O
//! endpoints wired back-to-back through a simulated network.

mod common;

use common::{base_config, MemoryTicketStore, Sim};
use quic_proto::connection::Event;
use quic_proto::{VERSION_DRAFT_22, SUPPORTED_VERSIONS};

use std::sync::Arc;

fn handshake_completed(events: &[Event]) -> Option<(Option<String>, bool, bool)> {
    events.iter().find_map(|e| match e {
        Event::HandshakeCompleted {
            alpn_protocol,
            early_data_accepted,
            session_resumed,
        } => Some((alpn_protocol.clone(), *early_data_accepted, *session_resumed)),
        _ => None,
    })
}

fn received_stream_data(events: &[Event], stream_id: u64) -> (Vec<u8>, bool) {
    let mut data = Vec::new();
    let mut fin = false;
    for event in events {
        if let Event::StreamDataReceived {
            stream_id: id,
            data: chunk,
            end_stream,
        } = event
        {
            if *id == stream_id {
                data.extend_from_slice(chunk);
                fin |= *end_stream;
            }
        }
    }
    (data, fin)
}

#[test]
fn connect_and_echo() {
    let mut sim = Sim::new(base_config(false), base_config(false), 0.0);

    assert!(
        sim.run_until(5.0, |s| handshake_completed(&s.client_events).is_some()
            && handshake_completed(&s.server_events).is_some()),
        "handshake did not complete"
    );
    let (alpn, _, resumed) = handshake_completed(&sim.client_events).unwrap();
    assert_eq!(alpn.as_deref(), Some("h"));
    assert!(!resumed);

    // client sends a request with FIN; server echoes it reversed
    sim.client
        .connection_mut(sim.client_handle)
        .send_stream_data(0, b"ping", true)
        .unwrap();
    assert!(
        sim.run_until(10.0, |s| received_stream_data(&s.server_events, 0).1),
        "server did not receive the request"
    );
    let (request, fin) = received_stream_data(&sim.server_events, 0);
    assert_eq!(request, b"ping");
    assert!(fin);

    let reversed: Vec<u8> = request.iter().rev().cloned().collect();
    let server_handle = sim.server_handle.expect("server connection exists");
    sim.server
        .connection_mut(server_handle)
        .send_stream_data(0, &reversed, true)
        .unwrap();
    assert!(
        sim.run_until(15.0, |s| received_stream_data(&s.client_events, 0).1),
        "client did not receive the echo"
    );
    let (echo, fin) = received_stream_data(&sim.client_events, 0);
    assert_eq!(echo, b"gnip");
    assert!(fin);
}

#[test]
fn large_transfer_raises_flow_control_windows() {
    let mut sim = Sim::new(base_config(false), base_config(false), 0.0);
    assert!(sim.run_until(5.0, |s| handshake_completed(&s.client_events).is_some()));

    // 2 MiB exceeds both the initial stream window and the initial
    // connection window, so the transfer only completes if MAX_DATA and
    // MAX_STREAM_DATA are raised along the way
    const TOTAL: usize = 2 * 1024 * 1024;
    let payload = vec![0x5A_u8; TOTAL];
    sim.client
        .connection_mut(sim.client_handle)
        .send_stream_data(0, &payload, true)
        .unwrap();

    assert!(
        sim.run_until(120.0, |s| received_stream_data(&s.server_events, 0).1),
        "transfer did not complete"
    );
    let (received, fin) = received_stream_data(&sim.server_events, 0);
    assert!(fin);
    assert_eq!(received.len(), TOTAL);
    assert!(received.iter().all(|&b| b == 0x5A));
}

#[test]
fn lossy_network_still_completes() {
    let mut sim = Sim::new(base_config(false), base_config(false), 0.25);

    const TOTAL: usize = 65_536;
    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();

    let mut max_pto = 0;
    let mut sent = false;
    for _ in 0..200_000 {
        if !sent && handshake_completed(&sim.client_events).is_some() {
            sim.client
                .connection_mut(sim.client_handle)
                .send_stream_data(0, &payload, true)
                .unwrap();
            sent = true;
        }
        if received_stream_data(&sim.server_events, 0).1 {
            break;
        }
        if !sim.poll_transfer() {
            sim.advance_time();
        }
        max_pto = max_pto.max(sim.client.connection(sim.client_handle).pto_count());
        assert!(sim.now < 300.0, "transfer is not making progress");
    }

    let (received, fin) = received_stream_data(&sim.server_events, 0);
    assert!(fin, "transfer did not complete under loss");
    assert_eq!(received, payload);
    assert!(max_pto <= 8, "pto backoff ran away: {}", max_pto);
}

#[test]
fn session_resumption() {
    // first connection: the server issues a ticket, the client stores it
    let store = Arc::new(MemoryTicketStore::default());
    let mut client_config = base_config(false);
    client_config.ticket_store = Some(store.clone());
    let mut sim = Sim::new(client_config, base_config(true), 0.0);
    assert!(sim.run_until(5.0, |s| handshake_completed(&s.client_events).is_some()));
    let (_, _, resumed) = handshake_completed(&sim.client_events).unwrap();
    assert!(!resumed);

    // let the ticket arrive
    let store_probe = store.clone();
    assert!(
        sim.run_until(10.0, move |_| store_probe.first().is_some()),
        "no session ticket was delivered"
    );
    let ticket = store.first().expect("ticket stored");
    assert_eq!(ticket.server_name, "example.com");

    // second connection resumes from the ticket
    let mut client_config = base_config(false);
    client_config.session_ticket = Some(ticket);
    let mut sim = Sim::new(client_config, base_config(true), 0.0);
    assert!(sim.run_until(5.0, |s| handshake_completed(&s.client_events).is_some()));
    let (_, _, resumed) = handshake_completed(&sim.client_events).unwrap();
    assert!(resumed, "session was not resumed");
    let (_, _, server_resumed) = handshake_completed(&sim.server_events).unwrap();
    assert!(server_resumed);
}

#[test]
fn stateless_retry() {
    let mut server_config = base_config(false);
    server_config.stateless_retry = true;
    let mut sim = Sim::new(base_config(false), server_config, 0.0);

    // the handshake only completes if the client adopted the retry token
    // and the server's original_connection_id parameter matched the
    // pre-retry DCID the client remembered
    assert!(
        sim.run_until(5.0, |s| handshake_completed(&s.client_events).is_some()
            && handshake_completed(&s.server_events).is_some()),
        "handshake with stateless retry did not complete"
    );

    // data still flows afterwards
    sim.client
        .connection_mut(sim.client_handle)
        .send_stream_data(0, b"after retry", true)
        .unwrap();
    assert!(sim.run_until(10.0, |s| received_stream_data(&s.server_events, 0).1));
    let (data, _) = received_stream_data(&sim.server_events, 0);
    assert_eq!(data, b"after retry");
}

#[test]
fn version_negotiation() {
    // the client prefers a version the server does not speak
    let mut client_config = base_config(false);
    client_config.supported_versions = vec![0x1A2A_3A4A, VERSION_DRAFT_22];
    let mut sim = Sim::new(client_config, base_config(false), 0.0);

    assert!(
        sim.run_until(5.0, |s| handshake_completed(&s.client_events).is_some()),
        "client did not fall back to the common version"
    );
    assert!(SUPPORTED_VERSIONS.contains(&VERSION_DRAFT_22));
}

#[test]
fn connection_migration_rotates_cids() {
    let mut sim = Sim::new(base_config(false), base_config(false), 0.0);
    assert!(sim.run_until(5.0, |s| handshake_completed(&s.client_events).is_some()
        && handshake_completed(&s.server_events).is_some()));
    let server_handle = sim.server_handle.expect("server connection exists");

    // a ping round trip guarantees both sides have exchanged their spare
    // connection IDs
    sim.client.connection_mut(sim.client_handle).send_ping(7);
    assert!(sim.run_until(10.0, |s| {
        s.client_events
            .iter()
            .any(|e| matches!(e, Event::PingAcknowledged { uid: 7 }))
    }));

    let host_cid_before = sim.server.connection(server_handle).host_cid();

    // the client moves to a new address and a fresh destination CID
    sim.client.connection_mut(sim.client_handle).change_connection_id();
    sim.client_source = "198.51.100.99:40001".parse().unwrap();
    let migrated = sim.client_source;
    sim.client
        .connection_mut(sim.client_handle)
        .send_stream_data(4, b"after move", true)
        .unwrap();

    // data keeps flowing across the new path
    assert!(
        sim.run_until(20.0, |s| received_stream_data(&s.server_events, 4).1),
        "data did not flow after migration"
    );
    let (data, _) = received_stream_data(&sim.server_events, 4);
    assert_eq!(data, b"after move");

    // the server adopted the new destination CID as its host CID
    assert_ne!(
        sim.server.connection(server_handle).host_cid(),
        host_cid_before
    );
    // ...and rotated to a fresh client CID, retiring the one it was using
    assert!(
        sim.run_until(25.0, |s| {
            s.client_events
                .iter()
                .any(|e| matches!(e, Event::ConnectionIdRetired { .. }))
        }),
        "client CID was not retired after the server rotated"
    );
    // the promoted network path is the migrated address
    assert!(
        sim.run_until(25.0, |s| s.last_server_dest == Some(migrated)),
        "server did not promote the migrated path"
    );
}

#[test]
fn key_update_and_pings() {
    let mut sim = Sim::new(base_config(false), base_config(false), 0.0);
    assert!(sim.run_until(5.0, |s| handshake_completed(&s.client_events).is_some()
        && handshake_completed(&s.server_events).is_some()));
    let server_handle = sim.server_handle.expect("server connection exists");

    assert!(!sim.client.connection(sim.client_handle).one_rtt_key_phase());
    assert!(!sim.server.connection(server_handle).one_rtt_key_phase());

    sim.client.connection_mut(sim.client_handle).request_key_update();
    sim.client.connection_mut(sim.client_handle).send_ping(1);
    sim.client.connection_mut(sim.client_handle).send_ping(2);

    let acked = |events: &[Event], uid: u64| {
        events
            .iter()
            .any(|e| matches!(e, Event::PingAcknowledged { uid: u } if *u == uid))
    };
    assert!(
        sim.run_until(10.0, |s| acked(&s.client_events, 1) && acked(&s.client_events, 2)),
        "pings were not acknowledged"
    );

    // the key phase flipped exactly once in each direction
    assert!(sim.client.connection(sim.client_handle).one_rtt_key_phase());
    assert!(sim.server.connection(server_handle).one_rtt_key_phase());

    // traffic still flows under the new keys
    sim.server
        .connection_mut(server_handle)
        .send_stream_data(1, b"updated", true)
        .unwrap();
    assert!(sim.run_until(15.0, |s| received_stream_data(&s.client_events, 1).1));
    let (data, _) = received_stream_data(&sim.client_events, 1);
    assert_eq!(data, b"updated");
}
