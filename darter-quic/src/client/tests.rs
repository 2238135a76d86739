//! # Client Connection Tests
//!
//! Scenario tests for the client state machine driven through mock
//! collaborators: a scripted TLS machine, transparent keyed ciphers, and
//! recording sockets and timers.

#![cfg(test)]

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use crate::client::{ClientConnection, ConnectionCallback, Lifecycle};
use crate::crypto::testing::{pair, TestCryptoFactory};
use crate::crypto::{CipherDirection, CipherSet, EncryptionLevel};
use crate::error::QuicError;
use crate::frames::{encode_frame, parse_frame, CryptoFrame, Frame, StreamFrame};
use crate::handshake::testing::{secret, success, ScriptedTlsMachine};
use crate::handshake::{HandshakePhase, TlsAction};
use crate::happyeyeballs::testing::{v4_addr, v6_addr, MockSocket, MockTimer, OpLog};
use crate::happyeyeballs::CachedFamily;
use crate::packet::{parse_header, Header, PacketType};
use crate::psk::{CachedPsk, InMemoryPskCache, PskCache};
use crate::transport::TransportParameters;
use crate::types::{ConnectionId, QUIC_VERSION_1};

const CLIENT_SCID: [u8; 8] = [1; 8];
const CLIENT_DCID: [u8; 8] = [0xaa; 8];
const SERVER_SCID: [u8; 8] = [0xbb; 8];

/// Key byte of the client's Initial read cipher under the test factory.
const INITIAL_KEY: u8 = 0xaa;
const HANDSHAKE_READ_KEY: u8 = 7;
const HANDSHAKE_WRITE_KEY: u8 = 8;
const ONE_RTT_READ_KEY: u8 = 9;
const ONE_RTT_WRITE_KEY: u8 = 10;
const ZERO_RTT_KEY: u8 = 5;

fn cid(bytes: &[u8]) -> ConnectionId {
    ConnectionId::from_slice(bytes).unwrap()
}

#[derive(Default)]
struct RecordingCallback {
    events: Rc<RefCell<Vec<String>>>,
}

impl ConnectionCallback for RecordingCallback {
    fn on_transport_ready(&mut self) {
        self.events.borrow_mut().push("transport_ready".into());
    }

    fn on_replay_safe(&mut self) {
        self.events.borrow_mut().push("replay_safe".into());
    }

    fn on_connection_end(&mut self) {
        self.events.borrow_mut().push("end".into());
    }

    fn on_connection_error(&mut self, error: QuicError) {
        self.events
            .borrow_mut()
            .push(format!("error:{error}"));
    }
}

struct Harness {
    conn: Rc<RefCell<ClientConnection>>,
    events: Rc<RefCell<Vec<String>>>,
    ops: OpLog,
    first_sent: Rc<RefCell<Vec<(Vec<u8>, SocketAddr)>>>,
    second_sent: Option<Rc<RefCell<Vec<(Vec<u8>, SocketAddr)>>>>,
    timer: MockTimer,
    start_time: Instant,
}

impl Harness {
    fn new(machine: ScriptedTlsMachine, dual_stack: bool) -> Self {
        let ops: OpLog = Rc::new(RefCell::new(Vec::new()));
        let first = MockSocket::new("first", ops.clone());
        let first_sent = first.sent.clone();
        let timer = MockTimer::default();
        let conn = ClientConnection::new_client(
            cid(&CLIENT_SCID),
            cid(&CLIENT_DCID),
            Box::new(machine),
            Rc::new(TestCryptoFactory),
            Box::new(first),
            Box::new(timer.clone()),
        );

        let mut second_sent = None;
        {
            let mut conn = conn.borrow_mut();
            conn.set_hostname("test.example.com");
            conn.add_peer_address(v6_addr()).unwrap();
            if dual_stack {
                conn.add_peer_address(v4_addr()).unwrap();
                let second = MockSocket::new("second", ops.clone());
                second_sent = Some(second.sent.clone());
                conn.add_socket(Box::new(second)).unwrap();
            }
        }

        Self {
            conn,
            events: Rc::new(RefCell::new(Vec::new())),
            ops,
            first_sent,
            second_sent,
            timer,
            start_time: Instant::now(),
        }
    }

    fn start(&self) {
        let callback = RecordingCallback {
            events: self.events.clone(),
        };
        ClientConnection::start(&self.conn, Box::new(callback), self.start_time).unwrap();
    }

    fn deliver(&self, peer: SocketAddr, datagram: Bytes) {
        self.conn
            .borrow_mut()
            .on_datagram(peer, datagram, self.start_time + Duration::from_millis(10));
    }

    fn phase(&self) -> HandshakePhase {
        self.conn.borrow().phase()
    }
}

/// Seal one server-side packet the client can decrypt with the transparent
/// test ciphers.
fn server_packet(level: EncryptionLevel, key: u8, pn: u64, frames: &[Frame<'_>]) -> Bytes {
    let mut payload = BytesMut::new();
    for frame in frames {
        encode_frame(frame, &mut payload);
    }
    if payload.len() < 24 {
        encode_frame(
            &Frame::Padding {
                count: (24 - payload.len()) as u64,
            },
            &mut payload,
        );
    }

    let header = match level {
        EncryptionLevel::Initial | EncryptionLevel::Handshake => {
            let ty = if level == EncryptionLevel::Initial {
                PacketType::Initial
            } else {
                PacketType::Handshake
            };
            let mut header = Header::long(
                ty,
                QUIC_VERSION_1,
                cid(&CLIENT_SCID),
                cid(&SERVER_SCID),
                pn,
                1,
            );
            header.payload_len = Some(1 + payload.len() as u64 + 16);
            header
        }
        EncryptionLevel::AppData => Header::short(cid(&CLIENT_SCID), pn, 1, false),
        EncryptionLevel::EarlyData => unreachable!("servers do not send 0-RTT"),
    };

    let mut sealer = CipherSet::new();
    sealer
        .install(level, CipherDirection::Write, pair(key))
        .unwrap();
    let mut buf = BytesMut::new();
    let pn_offset = header.encode(&mut buf);
    buf.extend_from_slice(&payload);
    sealer.seal(level, &mut buf, pn_offset, 1, pn).unwrap();
    buf.freeze()
}

fn crypto_packet(level: EncryptionLevel, key: u8, pn: u64, data: &[u8]) -> Bytes {
    server_packet(
        level,
        key,
        pn,
        &[Frame::Crypto(CryptoFrame { offset: 0, data })],
    )
}

/// Scripted machine for a full cold handshake: server-hello installs the
/// Handshake ciphers, the finished flight installs 1-RTT ciphers and
/// reports success.
fn cold_handshake_machine() -> ScriptedTlsMachine {
    let mut machine = ScriptedTlsMachine {
        on_connect: vec![TlsAction::WriteToSocket {
            level: EncryptionLevel::Initial,
            data: Bytes::from_static(b"client hello"),
        }],
        ..Default::default()
    };
    machine.on_process.push_back(vec![
        secret(EncryptionLevel::Handshake, CipherDirection::Read, HANDSHAKE_READ_KEY),
        secret(EncryptionLevel::Handshake, CipherDirection::Write, HANDSHAKE_WRITE_KEY),
        TlsAction::WriteToSocket {
            level: EncryptionLevel::Handshake,
            data: Bytes::from_static(b"client finished"),
        },
    ]);
    machine.on_process.push_back(vec![
        secret(EncryptionLevel::AppData, CipherDirection::Read, ONE_RTT_READ_KEY),
        secret(EncryptionLevel::AppData, CipherDirection::Write, ONE_RTT_WRITE_KEY),
        success(false),
    ]);
    machine
}

// ============================================================================
// Lifecycle and phase progression
// ============================================================================

#[test]
fn start_sends_padded_initial_flight() {
    let harness = Harness::new(cold_handshake_machine(), false);
    harness.start();

    assert!(harness.conn.borrow().is_self_owned());
    let sent = harness.first_sent.borrow();
    assert_eq!(sent.len(), 1);
    let (datagram, peer) = &sent[0];
    assert_eq!(*peer, v6_addr());
    // Client Initial datagrams are padded to the RFC 9000 minimum.
    assert!(datagram.len() >= 1200, "initial only {} bytes", datagram.len());
    // Long header, Initial type.
    assert_eq!(datagram[0] & 0x80, 0x80);
}

#[test]
fn phase_progresses_in_order_and_never_regresses() {
    let harness = Harness::new(cold_handshake_machine(), false);
    harness.start();
    assert_eq!(harness.phase(), HandshakePhase::Initial);

    harness.deliver(
        v6_addr(),
        crypto_packet(EncryptionLevel::Initial, INITIAL_KEY, 0, b"server hello"),
    );
    assert_eq!(harness.phase(), HandshakePhase::Handshake);

    harness.deliver(
        v6_addr(),
        crypto_packet(
            EncryptionLevel::Handshake,
            HANDSHAKE_READ_KEY,
            0,
            b"server finished",
        ),
    );
    assert_eq!(harness.phase(), HandshakePhase::OneRttKeysDerived);

    harness.deliver(
        v6_addr(),
        server_packet(EncryptionLevel::AppData, ONE_RTT_READ_KEY, 0, &[Frame::Ping]),
    );
    assert_eq!(harness.phase(), HandshakePhase::Established);

    // A second 1-RTT packet leaves the phase where it is.
    harness.deliver(
        v6_addr(),
        server_packet(EncryptionLevel::AppData, ONE_RTT_READ_KEY, 1, &[Frame::Ping]),
    );
    assert_eq!(harness.phase(), HandshakePhase::Established);

    let events = harness.events.borrow();
    assert!(events.contains(&"transport_ready".to_string()));
    assert!(events.contains(&"replay_safe".to_string()));
}

#[test]
fn undecryptable_one_rtt_packets_are_dropped_silently() {
    let harness = Harness::new(cold_handshake_machine(), false);
    harness.start();
    harness.deliver(
        v6_addr(),
        crypto_packet(EncryptionLevel::Initial, INITIAL_KEY, 0, b"server hello"),
    );
    harness.deliver(
        v6_addr(),
        crypto_packet(
            EncryptionLevel::Handshake,
            HANDSHAKE_READ_KEY,
            0,
            b"server finished",
        ),
    );

    let dropped_before = harness.conn.borrow().stats().packets_dropped;
    // Sealed with the wrong key: authentication fails, dropped silently.
    harness.deliver(
        v6_addr(),
        server_packet(EncryptionLevel::AppData, 0x77, 0, &[Frame::Ping]),
    );
    let conn = harness.conn.borrow();
    assert_eq!(conn.stats().packets_dropped, dropped_before + 1);
    assert_eq!(conn.lifecycle(), Lifecycle::Open);
    // Phase untouched: a failed decrypt must not establish the connection.
    assert_eq!(conn.phase(), HandshakePhase::OneRttKeysDerived);
}

#[test]
fn packets_ahead_of_their_cipher_are_buffered_then_flushed() {
    let harness = Harness::new(cold_handshake_machine(), false);
    harness.start();

    // Handshake packet arrives before the server Initial that installs the
    // Handshake read cipher.
    harness.deliver(
        v6_addr(),
        crypto_packet(
            EncryptionLevel::Handshake,
            HANDSHAKE_READ_KEY,
            0,
            b"server finished",
        ),
    );
    assert_eq!(harness.phase(), HandshakePhase::Initial);

    harness.deliver(
        v6_addr(),
        crypto_packet(EncryptionLevel::Initial, INITIAL_KEY, 0, b"server hello"),
    );
    // The buffered packet was replayed once its cipher existed, completing
    // the handshake in one step.
    assert_eq!(harness.phase(), HandshakePhase::OneRttKeysDerived);
}

#[test]
fn pending_packet_cap_drops_silently() {
    let harness = Harness::new(cold_handshake_machine(), false);
    harness.start();

    for pn in 0..15 {
        harness.deliver(
            v6_addr(),
            crypto_packet(EncryptionLevel::Handshake, HANDSHAKE_READ_KEY, pn, b"x"),
        );
    }
    let conn = harness.conn.borrow();
    // Ten buffered, the rest dropped, no error surfaced.
    assert_eq!(conn.stats().packets_dropped, 5);
    assert_eq!(conn.lifecycle(), Lifecycle::Open);
}

#[test]
fn close_delivers_exactly_one_terminal_event_and_releases_self() {
    let harness = Harness::new(cold_handshake_machine(), false);
    harness.start();
    assert!(harness.conn.borrow().is_self_owned());

    let now = harness.start_time + Duration::from_millis(50);
    harness.conn.borrow_mut().close(None, now);
    {
        let conn = harness.conn.borrow();
        assert!(!conn.is_self_owned());
        assert_eq!(conn.lifecycle(), Lifecycle::Draining);
    }
    // A CONNECTION_CLOSE went out on the wire.
    let close_sent = {
        let sent = harness.first_sent.borrow();
        let (datagram, _) = sent.last().unwrap().clone();
        let mut opener = CipherSet::new();
        opener
            .install(
                EncryptionLevel::Initial,
                CipherDirection::Read,
                pair(INITIAL_KEY),
            )
            .unwrap();
        let parsed = parse_header(&datagram, 8).unwrap();
        let mut packet = datagram.clone();
        let (_, plaintext) = opener
            .open(EncryptionLevel::Initial, &mut packet, parsed.pn_offset, None)
            .unwrap();
        let (frame, _) = parse_frame(&plaintext).unwrap();
        matches!(frame, Frame::ConnectionClose(_))
    };
    assert!(close_sent);

    harness.conn.borrow_mut().close(None, now);
    assert_eq!(*harness.events.borrow(), vec!["end".to_string()]);

    // Late datagrams are absorbed without any reaction.
    harness.deliver(
        v6_addr(),
        crypto_packet(EncryptionLevel::Initial, INITIAL_KEY, 5, b"late"),
    );
    assert_eq!(*harness.events.borrow(), vec!["end".to_string()]);
}

#[test]
fn peer_close_surfaces_once_without_reply() {
    let harness = Harness::new(cold_handshake_machine(), false);
    harness.start();
    harness.deliver(
        v6_addr(),
        crypto_packet(EncryptionLevel::Initial, INITIAL_KEY, 0, b"server hello"),
    );

    let sent_before = harness.first_sent.borrow().len();
    harness.deliver(
        v6_addr(),
        server_packet(
            EncryptionLevel::Initial,
            INITIAL_KEY,
            1,
            &[Frame::ConnectionClose(crate::frames::ConnectionCloseFrame {
                error_code: 0x0a,
                closing_frame_type: 0,
                reason: Bytes::from_static(b"bye"),
            })],
        ),
    );

    let events = harness.events.borrow();
    assert_eq!(events.len(), 1);
    assert!(events[0].starts_with("error:peer closed connection"));
    // No frames are sent in response to a peer close.
    assert_eq!(harness.first_sent.borrow().len(), sent_before);
    assert_eq!(harness.conn.borrow().lifecycle(), Lifecycle::Draining);
}

// ============================================================================
// Transport parameters
// ============================================================================

#[test]
fn server_transport_parameters_apply_exactly_once() {
    let mut machine = cold_handshake_machine();
    // A third flight that illegally reports success (and parameters) again.
    machine.on_process.push_back(vec![success(false)]);

    let harness = Harness::new(machine, false);
    harness.start();
    harness.deliver(
        v6_addr(),
        crypto_packet(EncryptionLevel::Initial, INITIAL_KEY, 0, b"server hello"),
    );
    harness.deliver(
        v6_addr(),
        crypto_packet(
            EncryptionLevel::Handshake,
            HANDSHAKE_READ_KEY,
            0,
            b"server finished",
        ),
    );
    {
        let conn = harness.conn.borrow();
        let params = conn.peer_transport_parameters().unwrap();
        assert_eq!(params.initial_max_data, 1 << 20);
    }

    // Second delivery is a protocol violation and tears the connection down.
    harness.deliver(
        v6_addr(),
        crypto_packet(
            EncryptionLevel::Handshake,
            HANDSHAKE_READ_KEY,
            1,
            b"illegal re-delivery",
        ),
    );
    let events = harness.events.borrow();
    assert_eq!(events.len(), 1);
    assert!(events[0].starts_with("error:transport error: protocol violation"));
}

#[test]
fn custom_transport_parameters_validate_before_start() {
    let harness = Harness::new(cold_handshake_machine(), false);
    let mut conn = harness.conn.borrow_mut();
    conn.set_custom_transport_parameter(
        crate::transport::CustomTransportParameter::new(0x4abc, Bytes::from_static(b"v"))
            .unwrap(),
    )
    .unwrap();
    // Duplicate identifier is rejected.
    assert!(conn
        .set_custom_transport_parameter(
            crate::transport::CustomTransportParameter::new(0x4abc, Bytes::from_static(b"w"))
                .unwrap(),
        )
        .is_err());
}

#[test]
fn late_peer_address_is_rejected() {
    let harness = Harness::new(cold_handshake_machine(), false);
    harness.start();
    let err = harness
        .conn
        .borrow_mut()
        .add_peer_address(v4_addr())
        .unwrap_err();
    assert!(matches!(err, QuicError::Local { .. }));
}

#[test]
fn retry_restarts_the_initial_flight_with_the_token() {
    let harness = Harness::new(cold_handshake_machine(), false);
    harness.start();
    let sent_before = harness.first_sent.borrow().len();

    // Retry: long header type 0b11, new server cid, then the token.
    let mut retry = BytesMut::new();
    retry.put_u8(0xf0);
    retry.put_u32(QUIC_VERSION_1);
    retry.put_u8(CLIENT_SCID.len() as u8);
    retry.put_slice(&CLIENT_SCID);
    retry.put_u8(8);
    retry.put_slice(&[0xcc; 8]);
    retry.put_slice(b"retry-token");
    harness.deliver(v6_addr(), retry.freeze());

    harness
        .conn
        .borrow_mut()
        .write_data(harness.start_time + Duration::from_millis(5))
        .unwrap();

    let sent = harness.first_sent.borrow();
    assert!(sent.len() > sent_before);
    let (datagram, _) = sent.last().unwrap();
    let parsed = parse_header(datagram, 8).unwrap();
    assert_eq!(parsed.header.packet_type, PacketType::Initial);
    // The new Initial echoes the retry token and targets the retry's cid.
    assert_eq!(parsed.header.token.as_deref(), Some(&b"retry-token"[..]));
    assert_eq!(parsed.header.dcid, cid(&[0xcc; 8]));
    // Initial keys were rederived from the retry's source connection id.
    let mut opener = CipherSet::new();
    opener
        .install(EncryptionLevel::Initial, CipherDirection::Read, pair(0xcc))
        .unwrap();
    let mut packet = datagram[..parsed.packet_len].to_vec();
    assert!(opener
        .open(EncryptionLevel::Initial, &mut packet, parsed.pn_offset, None)
        .is_ok());
}

#[test]
fn idle_timeout_closes_silently() {
    let harness = Harness::new(cold_handshake_machine(), false);
    harness
        .conn
        .borrow_mut()
        .set_idle_timeout(Duration::from_millis(100));
    harness.start();
    assert!(harness.conn.borrow().next_timeout().is_some());

    harness
        .conn
        .borrow_mut()
        .on_timeout(harness.start_time + Duration::from_secs(2));

    assert_eq!(
        *harness.events.borrow(),
        vec!["error:idle timeout".to_string()]
    );
    assert_eq!(harness.conn.borrow().lifecycle(), Lifecycle::Closed);
    assert!(!harness.conn.borrow().is_self_owned());
}

// ============================================================================
// Version negotiation
// ============================================================================

fn version_negotiation_datagram() -> Bytes {
    let header = Header::version_negotiation(
        cid(&CLIENT_SCID),
        cid(&SERVER_SCID),
        vec![0x0000_0002, 0xff00_001d],
    );
    let mut buf = BytesMut::new();
    header.encode(&mut buf);
    buf.freeze()
}

#[test]
fn version_negotiation_before_server_initial_is_fatal() {
    let harness = Harness::new(cold_handshake_machine(), false);
    harness.start();
    harness.deliver(v6_addr(), version_negotiation_datagram());

    let events = harness.events.borrow();
    assert_eq!(events.len(), 1);
    assert!(events[0].starts_with("error:transport error: version negotiation error"));
    assert_eq!(harness.conn.borrow().lifecycle(), Lifecycle::Closed);
}

#[test]
fn version_negotiation_after_server_initial_is_ignored() {
    let harness = Harness::new(cold_handshake_machine(), false);
    harness.start();
    harness.deliver(
        v6_addr(),
        crypto_packet(EncryptionLevel::Initial, INITIAL_KEY, 0, b"server hello"),
    );
    harness.deliver(v6_addr(), version_negotiation_datagram());

    assert!(harness.events.borrow().is_empty());
    assert_eq!(harness.conn.borrow().lifecycle(), Lifecycle::Open);
    assert_eq!(harness.conn.borrow().stats().version_negotiation_packets, 1);
}

// ============================================================================
// Happy eyeballs
// ============================================================================

#[test]
fn v6_wins_before_the_delay() {
    let harness = Harness::new(cold_handshake_machine(), true);
    harness
        .conn
        .borrow_mut()
        .set_happy_eyeballs_cached_family(CachedFamily::V6);
    harness.start();
    {
        let conn = harness.conn.borrow();
        assert_eq!(conn.peer_address(), Some(v6_addr()));
        assert!(!conn.happy_eyeballs_state().finished);
    }
    assert!(harness.timer.scheduled.borrow().is_some());

    harness.deliver(
        v6_addr(),
        crypto_packet(EncryptionLevel::Initial, INITIAL_KEY, 0, b"server hello"),
    );

    let conn = harness.conn.borrow();
    let state = conn.happy_eyeballs_state();
    assert!(state.finished);
    assert!(state.should_write_to_first_socket);
    assert!(!state.should_write_to_second_socket);
    assert!(*harness.timer.cancelled.borrow());
    assert_eq!(conn.peer_address(), Some(v6_addr()));
    assert_eq!(conn.original_peer_address(), Some(v6_addr()));
    // The losing v4 socket was paused, closed, and released.
    let ops = harness.ops.borrow();
    assert!(ops.iter().any(|op| op == "second:pause"));
    assert!(ops.iter().any(|op| op == "second:close"));
    assert!(state.second_socket.is_none());
}

#[test]
fn v4_wins_after_the_delay() {
    let harness = Harness::new(cold_handshake_machine(), true);
    harness
        .conn
        .borrow_mut()
        .set_happy_eyeballs_cached_family(CachedFamily::V6);
    harness.start();

    // Delay expires: the secondary starts racing with a copy of the
    // Initial flight.
    let now = harness.start_time + Duration::from_millis(200);
    harness.conn.borrow_mut().on_happy_eyeballs_timeout(now);
    {
        let conn = harness.conn.borrow();
        assert!(conn.happy_eyeballs_state().should_write_to_second_socket);
    }
    let second_sent = harness.second_sent.as_ref().unwrap();
    assert_eq!(second_sent.borrow().len(), 1);
    assert_eq!(second_sent.borrow()[0].1, v4_addr());

    // The reply lands on the v4 path first.
    harness.deliver(
        v4_addr(),
        crypto_packet(EncryptionLevel::Initial, INITIAL_KEY, 0, b"server hello"),
    );

    let conn = harness.conn.borrow();
    let state = conn.happy_eyeballs_state();
    assert!(state.finished);
    assert!(state.should_write_to_first_socket);
    assert!(!state.should_write_to_second_socket);
    assert_eq!(conn.peer_address(), Some(v4_addr()));
    assert_eq!(conn.original_peer_address(), Some(v4_addr()));
    // The sockets were swapped and the old primary torn down.
    let ops = harness.ops.borrow();
    assert!(ops.iter().any(|op| op == "first:pause"));
    assert!(ops.iter().any(|op| op == "first:close"));
}

// ============================================================================
// 0-RTT
// ============================================================================

fn zero_rtt_machine(early_data_accepted: bool) -> ScriptedTlsMachine {
    let mut machine = ScriptedTlsMachine {
        on_connect: vec![
            TlsAction::WriteToSocket {
                level: EncryptionLevel::Initial,
                data: Bytes::from_static(b"client hello with psk"),
            },
            secret(EncryptionLevel::EarlyData, CipherDirection::Write, ZERO_RTT_KEY),
        ],
        ..Default::default()
    };
    machine.on_process.push_back(vec![
        secret(EncryptionLevel::Handshake, CipherDirection::Read, HANDSHAKE_READ_KEY),
        secret(EncryptionLevel::AppData, CipherDirection::Read, ONE_RTT_READ_KEY),
        secret(EncryptionLevel::AppData, CipherDirection::Write, ONE_RTT_WRITE_KEY),
        success(early_data_accepted),
    ]);
    machine
}

fn cached_psk() -> CachedPsk {
    CachedPsk {
        identity: "ticket-0".into(),
        secret: Bytes::from_static(b"resumption-secret"),
        transport_params: TransportParameters {
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_remote: 1 << 16,
            initial_max_stream_data_uni: 1 << 15,
            initial_max_streams_bidi: 8,
            initial_max_streams_uni: 8,
            ..Default::default()
        },
        alpn: Some("h3".into()),
        ticket_age: Duration::from_secs(10),
    }
}

/// Decrypt one client datagram with the given server-side read key and
/// return its frames' stream payload, if any.
fn client_stream_payload(datagram: &[u8], level: EncryptionLevel, key: u8) -> Option<Vec<u8>> {
    let mut opener = CipherSet::new();
    opener.install(level, CipherDirection::Read, pair(key)).unwrap();
    let parsed = parse_header(datagram, 8).ok()?;
    let mut packet = datagram[..parsed.packet_len].to_vec();
    let (_, plaintext) = opener.open(level, &mut packet, parsed.pn_offset, None).ok()?;
    let mut payload = None;
    for frame in crate::frames::FrameIter::new(&plaintext) {
        if let Ok(Frame::Stream(StreamFrame { data, .. })) = frame {
            payload = Some(data.to_vec());
        }
    }
    payload
}

#[test]
fn rejected_zero_rtt_data_is_resent_under_one_rtt() {
    let cache = Rc::new(InMemoryPskCache::new());
    cache.put("test.example.com", cached_psk());

    let harness = Harness::new(zero_rtt_machine(false), false);
    harness.conn.borrow_mut().set_psk_cache(cache);
    harness.start();

    // Write early data; it goes out under the 0-RTT cipher.
    {
        let mut conn = harness.conn.borrow_mut();
        let stream = conn.open_bidirectional_stream().unwrap();
        conn.write_stream(stream, Bytes::from_static(b"early data"), false)
            .unwrap();
        conn.write_data(harness.start_time + Duration::from_millis(1))
            .unwrap();
    }
    let zero_rtt_payload = {
        let sent = harness.first_sent.borrow();
        sent.iter()
            .find_map(|(d, _)| client_stream_payload(d, EncryptionLevel::EarlyData, ZERO_RTT_KEY))
    };
    assert_eq!(zero_rtt_payload.as_deref(), Some(&b"early data"[..]));

    // The server rejects 0-RTT; the handshake completes under 1-RTT.
    harness.deliver(
        v6_addr(),
        crypto_packet(EncryptionLevel::Initial, INITIAL_KEY, 0, b"server flight"),
    );
    harness
        .conn
        .borrow_mut()
        .write_data(harness.start_time + Duration::from_millis(20))
        .unwrap();

    let one_rtt_payload = {
        let sent = harness.first_sent.borrow();
        sent.iter()
            .find_map(|(d, _)| client_stream_payload(d, EncryptionLevel::AppData, ONE_RTT_WRITE_KEY))
    };
    assert_eq!(one_rtt_payload.as_deref(), Some(&b"early data"[..]));
}

#[test]
fn accepted_zero_rtt_reports_replay_safe() {
    let cache = Rc::new(InMemoryPskCache::new());
    cache.put("test.example.com", cached_psk());

    let harness = Harness::new(zero_rtt_machine(true), false);
    harness.conn.borrow_mut().set_psk_cache(cache);
    harness.start();
    harness.deliver(
        v6_addr(),
        crypto_packet(EncryptionLevel::Initial, INITIAL_KEY, 0, b"server flight"),
    );

    let events = harness.events.borrow();
    assert!(events.contains(&"replay_safe".to_string()));
}

// ============================================================================
// Streams and acknowledgments
// ============================================================================

fn established_harness() -> Harness {
    let harness = Harness::new(cold_handshake_machine(), false);
    harness.start();
    harness.deliver(
        v6_addr(),
        crypto_packet(EncryptionLevel::Initial, INITIAL_KEY, 0, b"server hello"),
    );
    harness.deliver(
        v6_addr(),
        crypto_packet(
            EncryptionLevel::Handshake,
            HANDSHAKE_READ_KEY,
            0,
            b"server finished",
        ),
    );
    harness
}

#[test]
fn server_stream_data_is_readable_and_acked() {
    let harness = established_harness();
    harness.deliver(
        v6_addr(),
        server_packet(
            EncryptionLevel::AppData,
            ONE_RTT_READ_KEY,
            0,
            &[Frame::Stream(StreamFrame {
                stream_id: crate::types::StreamId(1),
                offset: 0,
                fin: true,
                data: b"response body",
            })],
        ),
    );
    assert_eq!(harness.phase(), HandshakePhase::Established);

    let mut conn = harness.conn.borrow_mut();
    let read = conn.read_stream(crate::types::StreamId(1)).unwrap();
    assert_eq!(&read.data[..], b"response body");
    assert!(read.fin);

    // The next write carries an ACK for the 1-RTT packet.
    conn.write_data(harness.start_time + Duration::from_millis(30))
        .unwrap();
    drop(conn);
    let acked = {
        let sent = harness.first_sent.borrow();
        sent.iter().rev().any(|(d, _)| {
            let mut opener = CipherSet::new();
            opener
                .install(
                    EncryptionLevel::AppData,
                    CipherDirection::Read,
                    pair(ONE_RTT_WRITE_KEY),
                )
                .unwrap();
            let Ok(parsed) = parse_header(d, 8) else { return false };
            if parsed.header.packet_type != PacketType::OneRtt {
                return false;
            }
            let mut packet = d.to_vec();
            let Ok((_, plaintext)) =
                opener.open(EncryptionLevel::AppData, &mut packet, parsed.pn_offset, None)
            else {
                return false;
            };
            crate::frames::FrameIter::new(&plaintext)
                .any(|f| matches!(f, Ok(Frame::Ack(_))))
        })
    };
    assert!(acked);
}

#[test]
fn events_record_new_streams() {
    let harness = established_harness();
    harness.deliver(
        v6_addr(),
        server_packet(
            EncryptionLevel::AppData,
            ONE_RTT_READ_KEY,
            0,
            &[Frame::Stream(StreamFrame {
                stream_id: crate::types::StreamId(3),
                offset: 0,
                fin: false,
                data: b"push",
            })],
        ),
    );
    // Stream 3 is server-initiated unidirectional.
    let events = harness.events.borrow();
    assert!(events.iter().any(|e| e == "transport_ready"));
}
