// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios over the simulated link

use core::time::Duration;
use minquic_core::FIRST_INTEROP_VERSION;
use minquic_transport::{
    testing::{Link, Recorder},
    CallbackEvent, State,
};

fn client_state(link: &Link) -> Option<State> {
    let handle = link.client.handles().next()?;
    link.client.connection(handle).map(|cnx| cnx.state())
}

fn server_state(link: &Link) -> Option<State> {
    let handle = link.server.handles().next()?;
    link.server.connection(handle).map(|cnx| cnx.state())
}

fn both_ready(link: &Link) -> bool {
    client_state(link) == Some(State::ClientReady) && server_state(link) == Some(State::ServerReady)
}

#[test]
fn handshake_completes() {
    let mut link = Link::new(0x1234);
    let client = link.connect(None);

    assert!(link.run_until(Duration::from_secs(5), both_ready));

    let connection = link.client.connection(client).unwrap();
    assert_eq!(connection.negotiated_version(), FIRST_INTEROP_VERSION);
    assert_eq!(connection.negotiated_protocol(), Some("minq-test"));
    let server_cnx = link.server.connection(link.server_handle().unwrap()).unwrap();
    assert_eq!(server_cnx.server_name(), Some("test.example.com"));
}

#[test]
fn version_negotiation_restarts_the_handshake() {
    let mut link = Link::new(0x3456);
    let server_addr = link.server_addr;
    let now = link.now;
    // propose a version the server does not know
    let client = link
        .client
        .client_connection(server_addr, now, 0x0102_0304, None, None, None);

    let mut saw_renegotiate = false;
    let done = link.run_until(Duration::from_secs(5), |link| {
        saw_renegotiate |= client_state(link) == Some(State::ClientRenegotiate);
        both_ready(link)
    });

    assert!(done);
    assert!(saw_renegotiate, "client should pass through renegotiation");
    let connection = link.client.connection(client).unwrap();
    assert_eq!(connection.negotiated_version(), FIRST_INTEROP_VERSION);
}

#[test]
fn handshake_recovers_from_early_losses() {
    let mut link = Link::new(0x77);
    // the second datagram in each direction disappears
    link.drop_mask_to_server = 0b10;
    link.drop_mask_to_client = 0b10;
    link.connect(None);

    // recovery budget: twice the initial retransmission timeout
    let recovered = link.run_until(Duration::from_secs(2), |link| {
        both_ready(link)
            && link
                .client
                .handles()
                .next()
                .and_then(|handle| link.client.connection(handle))
                .map(|cnx| cnx.is_backlog_empty())
                .unwrap_or(false)
    });
    assert!(recovered);
}

#[test]
fn idle_timeout_disconnects_both_ends() {
    let mut link = Link::new(0x99);
    let client_events = Recorder::new();
    let server_events = Recorder::new();
    {
        let recorder = server_events.clone();
        link.server
            .set_default_callback(Box::new(move || recorder.callback()));
    }
    link.connect(Some(client_events.callback()));
    assert!(link.run_until(Duration::from_secs(5), both_ready));

    // thirty silent seconds
    let both_gone = link.run_until(Duration::from_secs(40), |link| {
        client_state(link) == Some(State::Disconnected)
            && server_state(link) == Some(State::Disconnected)
    });
    assert!(both_gone);
    assert!(client_events.saw_event(0, CallbackEvent::Close));
    assert!(server_events.saw_event(0, CallbackEvent::Close));
}

#[test]
fn forged_stateless_reset_is_ignored() {
    let mut link = Link::new(0xabc);
    let client = link.connect(None);
    assert!(link.run_until(Duration::from_secs(5), both_ready));

    let server_cnxid = link.client.connection(client).unwrap().server_cnxid();

    // plausible-looking short header packet with a bogus token at the tail
    let mut forged = vec![0x41u8];
    forged.extend_from_slice(&server_cnxid.to_be_bytes());
    forged.extend_from_slice(&[0xee; 40]);
    let server_addr = link.server_addr;
    let now = link.now;
    link.client.incoming(&forged, server_addr, now);

    assert_eq!(client_state(&link), Some(State::ClientReady));
}

#[test]
fn genuine_stateless_reset_disconnects() {
    let mut link = Link::new(0xdef);
    let client = link.connect(None);
    assert!(link.run_until(Duration::from_secs(5), both_ready));

    // the server loses all state for this connection
    let server_handle = link.server_handle().unwrap();
    link.server.delete_connection(server_handle).unwrap();

    // the client's next packet draws a stateless reset
    link.client.add_to_stream(client, 1, b"anyone there?", false).unwrap();
    let reset = link.run_until(Duration::from_secs(5), |link| {
        client_state(link) == Some(State::Disconnected)
    });
    assert!(reset);
}

#[test]
fn orderly_close_reaches_the_peer() {
    let mut link = Link::new(0x5ca1e);
    let client = link.connect(None);
    assert!(link.run_until(Duration::from_secs(5), both_ready));

    link.client.close(client).unwrap();
    let closed = link.run_until(Duration::from_secs(5), |link| {
        client_state(link) == Some(State::Disconnected)
            && server_state(link) == Some(State::Disconnected)
    });
    assert!(closed);
}

#[test]
fn small_transfer_with_fin() {
    let mut link = Link::new(0xf00d);
    let server_events = Recorder::new();
    {
        let recorder = server_events.clone();
        link.server
            .set_default_callback(Box::new(move || recorder.callback()));
    }
    let client = link.connect(None);
    assert!(link.run_until(Duration::from_secs(5), both_ready));

    link.client
        .add_to_stream(client, 1, b"hello over quic", true)
        .unwrap();

    let delivered = link.run_until(Duration::from_secs(5), |_| {
        server_events.saw_event(1, CallbackEvent::Fin)
    });
    assert!(delivered);
    assert_eq!(server_events.stream_bytes(1), b"hello over quic");
}

#[test]
fn long_stream_survives_one_percent_loss() {
    let mut link = Link::new(0xbeef);
    let server_events = Recorder::new();
    {
        let recorder = server_events.clone();
        link.server
            .set_default_callback(Box::new(move || recorder.callback()));
    }
    let client = link.connect(None);
    assert!(link.run_until(Duration::from_secs(5), both_ready));

    link.loss_percent = 1;

    let mut payload = vec![0u8; 1_000_000];
    for (index, byte) in payload.iter_mut().enumerate() {
        *byte = (index % 251) as u8;
    }
    link.client.add_to_stream(client, 1, &payload, true).unwrap();

    let baseline = link.datagrams_sent;
    let delivered = link.run_until(Duration::from_secs(300), |_| {
        server_events.saw_event(1, CallbackEvent::Fin)
    });
    assert!(delivered);
    assert_eq!(server_events.stream_bytes(1), payload);

    // the emitted packet count stays within 4x of the ideal
    let ideal = 1_000_000 / 1_000;
    assert!(link.datagrams_sent - baseline < 4 * ideal);
}

#[test]
fn stream_reset_reaches_the_receiver() {
    let mut link = Link::new(0x4e5e7);
    let server_events = Recorder::new();
    {
        let recorder = server_events.clone();
        link.server
            .set_default_callback(Box::new(move || recorder.callback()));
    }
    let client = link.connect(None);
    assert!(link.run_until(Duration::from_secs(5), both_ready));

    link.client.add_to_stream(client, 3, b"partial", false).unwrap();
    let delivered = link.run_until(Duration::from_secs(5), |_| {
        !server_events.stream_bytes(3).is_empty()
    });
    assert!(delivered);

    link.client.reset_stream(client, 3).unwrap();
    let reset_seen = link.run_until(Duration::from_secs(5), |_| {
        server_events.saw_event(3, CallbackEvent::Reset)
    });
    assert!(reset_seen);

    // the sending side is closed for the application now
    assert!(link.client.add_to_stream(client, 3, b"more", false).is_err());
}

#[test]
fn duplicated_datagrams_change_nothing() {
    let mut link = Link::new(0xd0d0);
    link.duplicate_delivery = true;
    let server_events = Recorder::new();
    {
        let recorder = server_events.clone();
        link.server
            .set_default_callback(Box::new(move || recorder.callback()));
    }
    let client = link.connect(None);
    assert!(link.run_until(Duration::from_secs(5), both_ready));

    link.client
        .add_to_stream(client, 1, b"exactly once", true)
        .unwrap();
    let delivered = link.run_until(Duration::from_secs(5), |_| {
        server_events.saw_event(1, CallbackEvent::Fin)
    });
    assert!(delivered);
    // duplicate suppression: bytes arrive once, in order
    assert_eq!(server_events.stream_bytes(1), b"exactly once");
}

#[test]
fn stateless_retry_round_trip() {
    let mut link = Link::with_cookie_mode(0xc00c1e);
    link.connect(None);
    assert!(link.run_until(Duration::from_secs(5), both_ready));
}
