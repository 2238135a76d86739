//! The client connection: encryption-level-keyed reception, handshake
//! progression, transport parameter negotiation, and lifecycle.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::streams::StreamManager;
use super::ConnectionCallback;
use crate::congestion::{CongestionController, FixedWindowController, SentPacket};
use crate::crypto::{CipherDirection, CipherSet, CryptoFactory, EncryptionLevel};
use crate::error::{LocalErrorCode, QuicError, Result, TransportErrorCode};
use crate::frames::{
    encode_frame, encoded_size, AckFrame, AckRange, ApplicationCloseFrame, ConnectionCloseFrame,
    CryptoFrame, DataBlockedFrame, Frame, FrameIter, MaxDataFrame, PathResponseFrame, StreamFrame,
};
use crate::handshake::{ClientHandshake, HandshakeCallback, HandshakePhase, TlsMachine};
use crate::happyeyeballs::{
    self, CachedFamily, ConnAttemptTimer, DatagramSocket, HappyEyeballsState, SocketSettings,
};
use crate::packet::{
    packet_number_len, parse_header, Header, PacketNumberSpace, PacketType,
};
use crate::psk::{CachedPsk, PskCache};
use crate::qlog::{
    create_packet_event, create_version_negotiation_event, QLogEventType, QLogger,
};
use crate::transport::{ConnectionFlowControl, CustomTransportParameter, TransportParameters};
use crate::types::{
    ConnectionId, PacketNum, StreamId, Token, MIN_INITIAL_PACKET_SIZE, PENDING_PACKET_CAP,
    QUIC_VERSION_1,
};

/// How long Handshake keys are retained after the connection is
/// established.
const HANDSHAKE_KEY_RETENTION: Duration = Duration::from_secs(1);

/// RFC 8305 recommends a connection-attempt delay in the 100-250ms range.
const DEFAULT_CONN_ATTEMPT_DELAY: Duration = Duration::from_millis(150);

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// PTO floor used before an RTT sample exists.
const DEFAULT_PTO: Duration = Duration::from_millis(500);

/// Rough upper bound for serialized header bytes when budgeting a packet.
const HEADER_BUDGET: usize = 64;

const MAX_UDP_PAYLOAD: usize = 1252;

/// Connection lifecycle, orthogonal to the handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Configured but not started.
    Idle,
    /// Started; handshaking or established.
    Open,
    /// A close frame is queued or being sent.
    Closing,
    /// Terminal state reached; inbound datagrams are absorbed silently.
    Draining,
    /// Fully closed and released.
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Undecryptable, unparseable, or post-close packets dropped silently.
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub version_negotiation_packets: u64,
}

#[derive(Debug, Default)]
struct RttState {
    latest: Option<Duration>,
    smoothed: Option<Duration>,
}

impl RttState {
    fn update(&mut self, sample: Duration) {
        self.latest = Some(sample);
        self.smoothed = Some(match self.smoothed {
            None => sample,
            Some(smoothed) => (smoothed * 7 + sample) / 8,
        });
    }

    fn pto(&self) -> Duration {
        self.smoothed.map(|s| s * 2).unwrap_or(DEFAULT_PTO)
    }
}

/// Received packet numbers per space, merged into ranges for ACK frames.
#[derive(Debug, Default)]
struct AckTracker {
    /// Inclusive (start, end) runs, ascending, non-adjacent.
    ranges: Vec<(PacketNum, PacketNum)>,
    needs_ack: bool,
}

impl AckTracker {
    fn record(&mut self, pn: PacketNum) {
        let pos = self.ranges.partition_point(|&(_, end)| end + 1 < pn);
        match self.ranges.get_mut(pos) {
            Some(range) if pn + 1 >= range.0 && pn <= range.1 + 1 => {
                range.0 = range.0.min(pn);
                range.1 = range.1.max(pn);
                // Merge with the following run if now adjacent.
                if pos + 1 < self.ranges.len() && self.ranges[pos].1 + 1 >= self.ranges[pos + 1].0 {
                    let next = self.ranges.remove(pos + 1);
                    self.ranges[pos].1 = self.ranges[pos].1.max(next.1);
                }
            }
            _ => self.ranges.insert(pos, (pn, pn)),
        }
    }

    fn frame(&self) -> Option<AckFrame> {
        let &(start, largest) = self.ranges.last()?;
        let mut ack_ranges = tinyvec::TinyVec::default();
        let mut prev_start = start;
        for &(range_start, range_end) in self.ranges.iter().rev().skip(1) {
            ack_ranges.push(AckRange {
                gap: prev_start - range_end - 2,
                length: range_end - range_start,
            });
            prev_start = range_start;
        }
        Some(AckFrame {
            largest_acked: largest,
            ack_delay_us: 0,
            first_ack_range: largest - start,
            ack_ranges,
            ecn: None,
        })
    }
}

/// Retransmittable content of a sent packet.
#[derive(Debug, Clone)]
enum RetxFrame {
    Crypto {
        level: EncryptionLevel,
        offset: u64,
        data: Bytes,
    },
    Stream {
        id: StreamId,
        offset: u64,
        data: Bytes,
        fin: bool,
    },
}

struct OutstandingPacket {
    sent: SentPacket,
    level: EncryptionLevel,
    retx: Vec<RetxFrame>,
}

/// Outbound crypto stream for one encryption level.
#[derive(Default)]
struct CryptoSendStream {
    next_offset: u64,
    queue: Vec<(u64, Bytes)>,
}

impl CryptoSendStream {
    fn queue_fresh(&mut self, data: Bytes) {
        let len = data.len() as u64;
        self.queue.push((self.next_offset, data));
        self.next_offset += len;
    }

    fn requeue(&mut self, offset: u64, data: Bytes) {
        self.queue.push((offset, data));
    }

    fn pop_chunk(&mut self, budget: usize) -> Option<(u64, Bytes)> {
        if budget == 0 || self.queue.is_empty() {
            return None;
        }
        let index = self
            .queue
            .iter()
            .enumerate()
            .min_by_key(|(_, (offset, _))| *offset)
            .map(|(i, _)| i)?;
        let (offset, mut data) = self.queue.remove(index);
        if data.len() > budget {
            let tail = data.split_off(budget);
            self.queue.push((offset + budget as u64, tail));
        }
        Some((offset, data))
    }
}

/// Forwards new session tickets into the shared PSK cache. Held as its own
/// field so the handshake can borrow it while the connection is borrowed.
struct PskForwarder {
    cache: Option<Rc<dyn PskCache>>,
    hostname: Option<String>,
}

impl HandshakeCallback for PskForwarder {
    fn on_new_cached_psk(&mut self, psk: CachedPsk) {
        debug!(identity = %psk.identity, "caching new session ticket");
        if let (Some(cache), Some(hostname)) = (&self.cache, &self.hostname) {
            cache.put(hostname, psk);
        }
    }
}

/// The client-side QUIC connection.
///
/// Created unconnected via [`ClientConnection::new_client`]; addresses,
/// sockets, and configuration are supplied before [`ClientConnection::start`].
/// The connection owns itself from `start` until the terminal callback so
/// late-arriving peer datagrams are absorbed rather than triggering ICMP
/// replies from a closed socket.
pub struct ClientConnection {
    scid: ConnectionId,
    dcid: ConnectionId,
    version: u32,

    peer_address: Option<SocketAddr>,
    original_peer_address: Option<SocketAddr>,
    socket: Option<Box<dyn DatagramSocket>>,
    conn_timer: Box<dyn ConnAttemptTimer>,
    happy_eyeballs: HappyEyeballsState,
    cached_family: CachedFamily,
    conn_attempt_delay: Duration,
    socket_settings: SocketSettings,

    crypto_factory: Rc<dyn CryptoFactory>,
    ciphers: CipherSet,
    handshake: ClientHandshake,
    psk_forwarder: PskForwarder,
    psk_cache: Option<Rc<dyn PskCache>>,
    attempted_resumption: bool,

    phase: HandshakePhase,
    lifecycle: Lifecycle,

    hostname: Option<String>,
    local_params: TransportParameters,
    custom_params: Vec<CustomTransportParameter>,
    peer_params: Option<TransportParameters>,
    server_params_applied: bool,

    flow: ConnectionFlowControl,
    streams: StreamManager,
    congestion: Box<dyn CongestionController>,
    rtt: RttState,

    crypto_send: [CryptoSendStream; EncryptionLevel::COUNT],
    acks: [AckTracker; PacketNumberSpace::COUNT],
    next_pn: [PacketNum; PacketNumberSpace::COUNT],
    largest_recv_pn: [Option<PacketNum>; PacketNumberSpace::COUNT],
    outstanding: Vec<OutstandingPacket>,

    /// Packets received before their read cipher, buffered per level.
    pending: [VecDeque<(SocketAddr, Bytes, Instant)>; EncryptionLevel::COUNT],
    pending_path_responses: Vec<[u8; 8]>,
    pending_close: Option<(u64, bool, String)>,
    close_sent: bool,
    pto_probe_pending: bool,

    received_server_initial: bool,
    server_cid_applied: bool,
    retry_received: bool,
    retry_token: Option<Bytes>,
    new_token: Option<Token>,

    /// Copy of the latest Initial flight, replayed on the secondary socket
    /// when the connection-attempt delay expires.
    last_initial_datagram: Option<Bytes>,

    callback: Option<Box<dyn ConnectionCallback>>,
    self_ref: Option<Rc<RefCell<ClientConnection>>>,
    qlogger: Option<Rc<dyn QLogger>>,
    reference_time: Option<Instant>,

    idle_timeout: Duration,
    idle_deadline: Option<Instant>,
    handshake_key_discard_at: Option<Instant>,
    pto_deadline: Option<Instant>,

    transport_ready_notified: bool,
    replay_safe_notified: bool,
    terminal_delivered: bool,

    stats: ConnectionStats,
}

impl ClientConnection {
    /// Returns an un-connected, shared client transport. The connection is
    /// cleaned up when the app calls `close`/`close_now`, or on a terminal
    /// connection callback supplied on `start`.
    pub fn new_client(
        scid: ConnectionId,
        dcid: ConnectionId,
        machine: Box<dyn TlsMachine>,
        crypto_factory: Rc<dyn CryptoFactory>,
        socket: Box<dyn DatagramSocket>,
        conn_timer: Box<dyn ConnAttemptTimer>,
    ) -> Rc<RefCell<Self>> {
        let handshake = ClientHandshake::new(machine, crypto_factory.clone());
        let local_params = TransportParameters {
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 1 << 17,
            initial_max_stream_data_bidi_remote: 1 << 17,
            initial_max_stream_data_uni: 1 << 16,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            initial_source_connection_id: Some(scid.clone()),
            ..Default::default()
        };
        let flow = ConnectionFlowControl::new(local_params.initial_max_data);
        Rc::new(RefCell::new(Self {
            scid,
            dcid,
            version: QUIC_VERSION_1,
            peer_address: None,
            original_peer_address: None,
            socket: Some(socket),
            conn_timer,
            happy_eyeballs: HappyEyeballsState::new(),
            cached_family: CachedFamily::Unspecified,
            conn_attempt_delay: DEFAULT_CONN_ATTEMPT_DELAY,
            socket_settings: SocketSettings::default(),
            crypto_factory,
            ciphers: CipherSet::new(),
            handshake,
            psk_forwarder: PskForwarder {
                cache: None,
                hostname: None,
            },
            psk_cache: None,
            attempted_resumption: false,
            phase: HandshakePhase::Initial,
            lifecycle: Lifecycle::Idle,
            hostname: None,
            local_params,
            custom_params: Vec::new(),
            peer_params: None,
            server_params_applied: false,
            flow,
            streams: StreamManager::new(),
            congestion: Box::new(FixedWindowController::default()),
            rtt: RttState::default(),
            crypto_send: Default::default(),
            acks: Default::default(),
            next_pn: [0; PacketNumberSpace::COUNT],
            largest_recv_pn: [None; PacketNumberSpace::COUNT],
            outstanding: Vec::new(),
            pending: Default::default(),
            pending_path_responses: Vec::new(),
            pending_close: None,
            close_sent: false,
            pto_probe_pending: false,
            received_server_initial: false,
            server_cid_applied: false,
            retry_received: false,
            retry_token: None,
            new_token: None,
            last_initial_datagram: None,
            callback: None,
            self_ref: None,
            qlogger: None,
            reference_time: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            idle_deadline: None,
            handshake_key_discard_at: None,
            pto_deadline: None,
            transport_ready_notified: false,
            replay_safe_notified: false,
            terminal_delivered: false,
            stats: ConnectionStats::default(),
        }))
    }

    // ------------------------------------------------------------------
    // Pre-start configuration
    // ------------------------------------------------------------------

    fn ensure_not_started(&self) -> Result<()> {
        if self.lifecycle != Lifecycle::Idle {
            return Err(QuicError::local(
                LocalErrorCode::InvalidOperation,
                "not allowed after start",
            ));
        }
        Ok(())
    }

    /// Supply the hostname used for server validation and PSK lookup.
    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        let hostname = hostname.into();
        self.psk_forwarder.hostname = Some(hostname.clone());
        self.hostname = Some(hostname);
    }

    /// Supply a peer address. Must be called at least once before `start`;
    /// a late-arriving address is rejected.
    pub fn add_peer_address(&mut self, peer: SocketAddr) -> Result<()> {
        self.ensure_not_started()?;
        happyeyeballs::add_peer_address(&mut self.happy_eyeballs, peer)
    }

    /// Supply the secondary socket for the happy-eyeballs race.
    pub fn add_socket(&mut self, socket: Box<dyn DatagramSocket>) -> Result<()> {
        self.ensure_not_started()?;
        happyeyeballs::add_socket(&mut self.happy_eyeballs, socket)
    }

    pub fn set_happy_eyeballs_cached_family(&mut self, family: CachedFamily) {
        self.cached_family = family;
    }

    pub fn set_conn_attempt_delay(&mut self, delay: Duration) {
        self.conn_attempt_delay = delay;
    }

    pub fn set_socket_settings(&mut self, settings: SocketSettings) {
        self.socket_settings = settings;
    }

    /// Set the cache that remembers PSKs and server transport parameters
    /// from previous connections, enabling resumption and 0-RTT.
    pub fn set_psk_cache(&mut self, cache: Rc<dyn PskCache>) {
        self.psk_forwarder.cache = Some(cache.clone());
        self.psk_cache = Some(cache);
    }

    pub fn set_qlogger(&mut self, qlogger: Rc<dyn QLogger>) {
        self.qlogger = Some(qlogger);
    }

    pub fn set_congestion_controller(&mut self, controller: Box<dyn CongestionController>) {
        self.congestion = controller;
    }

    pub fn set_transport_parameters(&mut self, params: TransportParameters) {
        self.flow = ConnectionFlowControl::new(params.initial_max_data);
        self.local_params = params;
    }

    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }

    /// Register a custom transport parameter. Identifiers below the
    /// reserved threshold and duplicates are rejected; must precede `start`.
    pub fn set_custom_transport_parameter(
        &mut self,
        param: CustomTransportParameter,
    ) -> Result<()> {
        self.ensure_not_started()?;
        if self.custom_params.iter().any(|p| p.id == param.id) {
            return Err(QuicError::local(
                LocalErrorCode::AlreadyInstalled,
                "duplicate custom transport parameter",
            ));
        }
        self.custom_params.push(param);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the connection. Requires at least one configured peer address
    /// and the TLS machine supplied at construction. The connection takes a
    /// reference to itself, released on the terminal callback.
    pub fn start(
        this: &Rc<RefCell<Self>>,
        callback: Box<dyn ConnectionCallback>,
        now: Instant,
    ) -> Result<()> {
        let mut conn = this.borrow_mut();
        conn.ensure_not_started()?;
        conn.self_ref = Some(Rc::clone(this));
        match conn.start_inner(callback, now) {
            Ok(()) => Ok(()),
            Err(err) => {
                conn.deliver_terminal(Err(err.clone()));
                Err(err)
            }
        }
    }

    fn start_inner(&mut self, callback: Box<dyn ConnectionCallback>, now: Instant) -> Result<()> {
        self.ensure_not_started()?;
        self.callback = Some(callback);
        self.reference_time = Some(now);
        self.idle_deadline = Some(now + self.idle_timeout);

        let primary = happyeyeballs::start(
            &mut self.happy_eyeballs,
            self.cached_family,
            self.conn_timer.as_mut(),
            self.conn_attempt_delay,
            &self.socket_settings,
        )
        .ok_or_else(|| {
            QuicError::local(
                LocalErrorCode::InvalidOperation,
                "no peer address configured",
            )
        })?;
        self.peer_address = Some(primary);
        self.original_peer_address = Some(primary);

        let (read, write) = self
            .crypto_factory
            .initial_ciphers(&self.dcid)
            .map_err(|_| {
                QuicError::transport(
                    TransportErrorCode::InternalError,
                    "initial cipher derivation failed",
                )
            })?;
        self.install_cipher(EncryptionLevel::Initial, CipherDirection::Read, read)?;
        self.install_cipher(EncryptionLevel::Initial, CipherDirection::Write, write)?;

        self.lifecycle = Lifecycle::Open;
        self.start_crypto_handshake()?;
        self.write_data(now)?;
        Ok(())
    }

    fn start_crypto_handshake(&mut self) -> Result<()> {
        let mut params = self.local_params.clone();
        params.custom_parameters = self.custom_params.clone();
        let mut buf = BytesMut::new();
        params.encode(&mut buf);

        let psk = match (&self.psk_cache, &self.hostname) {
            (Some(cache), Some(hostname)) => cache.get(hostname),
            _ => None,
        };
        self.attempted_resumption = psk.is_some();
        if let Some(psk) = &psk {
            // 0-RTT data must respect the server limits cached with the
            // ticket until fresh parameters arrive.
            self.flow
                .send
                .update_max_data(psk.transport_params.initial_max_data);
            self.streams.apply_server_params(&psk.transport_params);
        }

        let hostname = self.hostname.clone();
        if let Err(err) =
            self.handshake
                .connect(hostname.as_deref(), psk, buf.freeze(), &mut self.psk_forwarder)
        {
            if self.attempted_resumption {
                self.remove_psk();
            }
            return Err(err);
        }
        self.post_handshake_update()
    }

    fn remove_psk(&mut self) {
        if let (Some(cache), Some(hostname)) = (&self.psk_cache, &self.hostname) {
            cache.remove(hostname);
        }
    }

    /// Close gracefully: sends CONNECTION_CLOSE (or APPLICATION_CLOSE for
    /// an application error) once writable, then delivers the terminal
    /// callback and releases the self-reference.
    pub fn close(&mut self, app_error: Option<(u64, String)>, now: Instant) {
        if self.terminal_delivered {
            return;
        }
        let (code, application, reason, result) = match app_error {
            Some((code, reason)) => (
                code,
                true,
                reason.clone(),
                Err(QuicError::Application { code, reason }),
            ),
            None => (
                TransportErrorCode::NoError.to_wire(),
                false,
                String::new(),
                Ok(()),
            ),
        };
        self.pending_close = Some((code, application, reason));
        self.lifecycle = Lifecycle::Closing;
        let _ = self.write_data(now);
        self.cancel_timers();
        self.lifecycle = Lifecycle::Draining;
        self.deliver_terminal(result);
    }

    /// Tear down immediately without sending any frame.
    pub fn close_now(&mut self, app_error: Option<(u64, String)>, now: Instant) {
        let _ = now;
        if self.terminal_delivered {
            return;
        }
        let result = match app_error {
            Some((code, reason)) => Err(QuicError::Application { code, reason }),
            None => Ok(()),
        };
        self.cancel_timers();
        self.release_sockets();
        self.lifecycle = Lifecycle::Closed;
        self.deliver_terminal(result);
    }

    fn close_with_error(&mut self, err: QuicError, now: Instant) {
        if self.terminal_delivered {
            return;
        }
        warn!(%err, "closing connection");
        if let Some(code) = err.close_code() {
            let application = matches!(err, QuicError::Application { .. });
            self.pending_close = Some((code, application, err.to_string()));
            self.lifecycle = Lifecycle::Closing;
            let _ = self.write_data(now);
        }
        self.cancel_timers();
        self.lifecycle = Lifecycle::Draining;
        self.deliver_terminal(Err(err));
    }

    fn on_peer_close(&mut self, code: u64, application: bool, reason: String) {
        debug!(code, application, "peer closed connection");
        self.cancel_timers();
        self.lifecycle = Lifecycle::Draining;
        let result = if !application && code == TransportErrorCode::NoError.to_wire() {
            Ok(())
        } else {
            Err(QuicError::PeerClose {
                code,
                application,
                reason,
            })
        };
        self.deliver_terminal(result);
    }

    /// Deliver exactly one terminal event, then release the self-reference.
    fn deliver_terminal(&mut self, result: Result<()>) {
        if self.terminal_delivered {
            return;
        }
        self.terminal_delivered = true;
        if let Some(callback) = self.callback.as_mut() {
            match result {
                Ok(()) => callback.on_connection_end(),
                Err(err) => callback.on_connection_error(err),
            }
        }
        self.self_ref = None;
    }

    fn cancel_timers(&mut self) {
        self.conn_timer.cancel();
        self.idle_deadline = None;
        self.pto_deadline = None;
        self.handshake_key_discard_at = None;
    }

    fn release_sockets(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.pause_read();
            socket.close();
        }
        if let Some(mut socket) = self.happy_eyeballs.second_socket.take() {
            socket.pause_read();
            socket.close();
        }
    }

    // ------------------------------------------------------------------
    // Reception
    // ------------------------------------------------------------------

    /// Process one UDP datagram, demultiplexing coalesced packets in wire
    /// order. Packets that cannot be decrypted are dropped silently (or
    /// buffered if their cipher is not yet installed).
    pub fn on_datagram(&mut self, peer: SocketAddr, data: Bytes, recv_time: Instant) {
        self.stats.bytes_received += data.len() as u64;
        match self.lifecycle {
            Lifecycle::Idle | Lifecycle::Draining | Lifecycle::Closed => {
                self.stats.packets_dropped += 1;
                return;
            }
            _ => {}
        }
        self.idle_deadline = Some(recv_time + self.idle_timeout);

        let mut offset = 0usize;
        while offset < data.len() {
            let slice = &data[offset..];
            let parsed = match parse_header(slice, self.scid.len()) {
                Ok(parsed) => parsed,
                Err(err) => {
                    trace!(%err, "dropping unparseable packet");
                    self.stats.packets_dropped += 1;
                    return;
                }
            };
            let packet_len = parsed.packet_len;

            match parsed.header.packet_type {
                PacketType::VersionNegotiation => {
                    self.on_version_negotiation(&parsed.header, slice.len(), recv_time);
                    return;
                }
                PacketType::Retry => {
                    self.on_retry(parsed.header);
                    return;
                }
                _ => {}
            }

            let level = match parsed.header.packet_type {
                PacketType::Initial => EncryptionLevel::Initial,
                PacketType::Handshake => EncryptionLevel::Handshake,
                PacketType::OneRtt => EncryptionLevel::AppData,
                // A client never receives 0-RTT packets.
                _ => {
                    self.stats.packets_dropped += 1;
                    offset += packet_len;
                    continue;
                }
            };

            if !self.ciphers.has_read_cipher(level) {
                self.buffer_pending(level, peer, data.slice(offset..offset + packet_len), recv_time);
                offset += packet_len;
                continue;
            }

            let mut packet = slice[..packet_len].to_vec();
            let space = level.pn_space();
            match self.ciphers.open(
                level,
                &mut packet,
                parsed.pn_offset,
                self.largest_recv_pn[space.index()],
            ) {
                Err(err) => {
                    trace!(?level, %err, "undecryptable packet dropped");
                    self.stats.packets_dropped += 1;
                    offset += packet_len;
                }
                Ok((pn, plaintext)) => {
                    offset += packet_len;
                    let mut header = parsed.header;
                    header.packet_number = Some(pn);
                    if let Err(err) = self.on_decrypted_packet(
                        peer, header, level, pn, &plaintext, packet_len, recv_time,
                    ) {
                        self.close_with_error(err, recv_time);
                        return;
                    }
                    if matches!(self.lifecycle, Lifecycle::Draining | Lifecycle::Closed) {
                        return;
                    }
                }
            }
        }
    }

    fn buffer_pending(
        &mut self,
        level: EncryptionLevel,
        peer: SocketAddr,
        packet: Bytes,
        recv_time: Instant,
    ) {
        let queue = &mut self.pending[level.index()];
        if queue.len() >= PENDING_PACKET_CAP {
            trace!(?level, "pending packet cap exceeded, dropping");
            self.stats.packets_dropped += 1;
            return;
        }
        trace!(?level, len = packet.len(), "buffering packet until cipher installed");
        queue.push_back((peer, packet, recv_time));
    }

    #[allow(clippy::too_many_arguments)]
    fn on_decrypted_packet(
        &mut self,
        peer: SocketAddr,
        header: Header,
        level: EncryptionLevel,
        pn: PacketNum,
        plaintext: &[u8],
        packet_size: usize,
        now: Instant,
    ) -> Result<()> {
        self.stats.packets_received += 1;

        // The first reply that decrypts settles the happy-eyeballs race.
        happyeyeballs::on_data_received(
            &mut self.happy_eyeballs,
            self.conn_timer.as_mut(),
            &mut self.socket,
            &mut self.peer_address,
            &mut self.original_peer_address,
            peer,
        );

        if level == EncryptionLevel::Initial {
            self.received_server_initial = true;
            if !self.server_cid_applied {
                if let Some(scid) = &header.scid {
                    trace!(server_cid = %scid, "adopting server connection id");
                    self.dcid = scid.clone();
                    self.server_cid_applied = true;
                }
            }
        }

        let space = level.pn_space();
        let largest = &mut self.largest_recv_pn[space.index()];
        *largest = Some(largest.map_or(pn, |l| l.max(pn)));

        // First 1-RTT packet that decrypts: the peer has implicitly
        // acknowledged the 1-RTT keys.
        if header.packet_type == PacketType::OneRtt && self.phase == HandshakePhase::OneRttKeysDerived
        {
            self.on_established(now);
        }

        let mut frames = Vec::new();
        for frame in FrameIter::new(plaintext) {
            frames.push(frame?);
        }

        if let Some(qlogger) = self.qlogger.clone() {
            qlogger.add_packet_event(create_packet_event(
                self.ref_time_us(now),
                QLogEventType::PacketReceived,
                &header,
                packet_size as u64,
                &frames,
            ));
        }

        let mut ack_eliciting = false;
        for frame in &frames {
            ack_eliciting |= frame.is_ack_eliciting();
            self.on_frame(frame, level, now)?;
            if self.terminal_delivered {
                return Ok(());
            }
        }

        self.acks[space.index()].record(pn);
        if ack_eliciting {
            self.acks[space.index()].needs_ack = true;
        }
        Ok(())
    }

    fn on_frame(&mut self, frame: &Frame<'_>, level: EncryptionLevel, now: Instant) -> Result<()> {
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}

            Frame::Crypto(f) => {
                self.handshake
                    .on_crypto_data(level, f.offset, f.data, &mut self.psk_forwarder)?;
                self.post_handshake_update()?;
                self.flush_pending(now);
            }

            Frame::Ack(f) => self.process_ack(level.pn_space(), f, now),

            Frame::Stream(f) => {
                let receipt = self.streams.on_stream_frame(f)?;
                self.flow.recv.on_received(receipt.flow_charge)?;
                let stream_id = f.stream_id;
                if let Some(callback) = self.callback.as_mut() {
                    if receipt.new_stream {
                        if stream_id.is_bidirectional() {
                            callback.on_new_bidirectional_stream(stream_id);
                        } else {
                            callback.on_new_unidirectional_stream(stream_id);
                        }
                    }
                    if receipt.readable {
                        callback.on_stream_readable(stream_id);
                    }
                }
            }

            Frame::MaxData(f) => self.flow.send.update_max_data(f.maximum_data),
            Frame::MaxStreamData(f) => self.streams.on_max_stream_data(f.stream_id, f.maximum_data),
            Frame::MaxStreams(f) => self.streams.on_max_streams(f.maximum_streams, f.bidirectional),

            Frame::DataBlocked(f) => trace!(limit = f.data_limit, "peer data blocked"),
            Frame::StreamDataBlocked(f) => {
                trace!(stream = %f.stream_id, limit = f.data_limit, "peer stream blocked")
            }
            Frame::StreamsBlocked(f) => trace!(limit = f.stream_limit, "peer streams blocked"),

            Frame::ResetStream(f) => self.streams.on_reset_stream(f.stream_id),
            Frame::StopSending(f) => self.streams.on_stop_sending(f.stream_id),

            Frame::NewConnectionId(f) => {
                trace!(sequence = f.sequence, cid = %f.connection_id, "peer issued connection id")
            }
            Frame::RetireConnectionId(f) => {
                trace!(sequence = f.sequence, "peer retired connection id")
            }

            Frame::PathChallenge(f) => self.pending_path_responses.push(f.data),
            Frame::PathResponse(_) => {}

            Frame::ConnectionClose(f) => {
                self.on_peer_close(
                    f.error_code,
                    false,
                    String::from_utf8_lossy(&f.reason).into_owned(),
                );
            }
            Frame::ApplicationClose(f) => {
                self.on_peer_close(
                    f.error_code,
                    true,
                    String::from_utf8_lossy(&f.reason).into_owned(),
                );
            }

            Frame::HandshakeDone => {
                trace!("handshake confirmed by server");
                if self.handshake_key_discard_at.is_none() {
                    self.handshake_key_discard_at = Some(now + HANDSHAKE_KEY_RETENTION);
                }
            }

            Frame::NewToken(f) => {
                self.new_token = Some(Token::new(f.token.clone()));
            }

            Frame::MinStreamData(f) => self.streams.on_min_stream_data(
                f.stream_id,
                f.maximum_data,
                f.minimum_stream_offset,
            ),
            Frame::ExpiredStreamData(f) => self
                .streams
                .on_expired_stream_data(f.stream_id, f.minimum_stream_offset),
        }
        Ok(())
    }

    fn on_version_negotiation(&mut self, header: &Header, size: usize, now: Instant) {
        self.stats.version_negotiation_packets += 1;
        if let Some(qlogger) = self.qlogger.clone() {
            qlogger.add_version_negotiation_event(create_version_negotiation_event(
                self.ref_time_us(now),
                QLogEventType::PacketReceived,
                size as u64,
                &header.supported_versions,
            ));
        }
        if self.received_server_initial {
            // A version negotiation packet after a valid server Initial is
            // spurious (RFC 9000 Section 6.2).
            trace!("ignoring late version negotiation packet");
            return;
        }
        debug!(versions = ?header.supported_versions, "version negotiation received");
        let err = QuicError::transport(
            TransportErrorCode::VersionNegotiationError,
            "server does not support our QUIC version",
        );
        self.cancel_timers();
        self.release_sockets();
        self.lifecycle = Lifecycle::Closed;
        self.deliver_terminal(Err(err));
    }

    fn on_retry(&mut self, header: Header) {
        if self.received_server_initial || self.retry_received {
            trace!("ignoring retry");
            return;
        }
        let Some(scid) = header.scid else { return };
        debug!(new_dcid = %scid, "retry received, restarting initial flight");
        self.retry_received = true;
        self.retry_token = header.token;
        self.dcid = scid;

        // Initial keys restart from the retry's source connection id.
        self.ciphers.discard(EncryptionLevel::Initial);
        match self.crypto_factory.initial_ciphers(&self.dcid) {
            Ok((read, write)) => {
                let _ = self
                    .ciphers
                    .install(EncryptionLevel::Initial, CipherDirection::Read, read);
                let _ = self
                    .ciphers
                    .install(EncryptionLevel::Initial, CipherDirection::Write, write);
            }
            Err(err) => {
                warn!(%err, "initial cipher rederivation failed after retry");
                return;
            }
        }
        self.requeue_level(EncryptionLevel::Initial);
    }

    // ------------------------------------------------------------------
    // Handshake plumbing
    // ------------------------------------------------------------------

    fn install_cipher(
        &mut self,
        level: EncryptionLevel,
        direction: CipherDirection,
        pair: crate::crypto::CipherPair,
    ) -> Result<()> {
        self.ciphers.install(level, direction, pair).map_err(|e| {
            QuicError::transport(TransportErrorCode::InternalError, e.to_string())
        })
    }

    /// Drain every edge-triggered output of the handshake adapter: new
    /// ciphers, the server's transport parameters, and the 0-RTT verdict.
    fn post_handshake_update(&mut self) -> Result<()> {
        if let Some(pair) = self.handshake.get_handshake_read_ciphers() {
            self.install_cipher(EncryptionLevel::Handshake, CipherDirection::Read, pair)?;
            self.advance_phase(HandshakePhase::Handshake);
        }
        if let Some(pair) = self.handshake.get_handshake_write_ciphers() {
            self.install_cipher(EncryptionLevel::Handshake, CipherDirection::Write, pair)?;
        }
        if let Some(pair) = self.handshake.get_zero_rtt_write_ciphers() {
            self.install_cipher(EncryptionLevel::EarlyData, CipherDirection::Write, pair)?;
        }
        if let Some(pair) = self.handshake.get_one_rtt_read_ciphers() {
            self.install_cipher(EncryptionLevel::AppData, CipherDirection::Read, pair)?;
        }
        if let Some(pair) = self.handshake.get_one_rtt_write_ciphers() {
            self.install_cipher(EncryptionLevel::AppData, CipherDirection::Write, pair)?;
        }

        if self.phase < HandshakePhase::OneRttKeysDerived
            && self.ciphers.has_read_cipher(EncryptionLevel::AppData)
            && self.ciphers.has_write_cipher(EncryptionLevel::AppData)
        {
            self.advance_phase(HandshakePhase::OneRttKeysDerived);
            // 1-RTT keys exist: Initial keys may be discarded.
            self.ciphers.discard(EncryptionLevel::Initial);
            self.pending[EncryptionLevel::Initial.index()].clear();
            self.notify_transport_ready();
            self.notify_replay_safe();
        }

        if let Some(params) = self.handshake.get_server_transport_params() {
            if self.server_params_applied {
                return Err(QuicError::transport(
                    TransportErrorCode::ProtocolViolation,
                    "server transport parameters delivered twice",
                ));
            }
            self.server_params_applied = true;
            params.validate().map_err(|e| {
                QuicError::transport(TransportErrorCode::TransportParameterError, e.to_string())
            })?;
            debug!(
                initial_max_data = params.initial_max_data,
                streams_bidi = params.initial_max_streams_bidi,
                "caching server transport parameters"
            );
            self.flow.send.update_max_data(params.initial_max_data);
            self.streams.apply_server_params(&params);
            self.peer_params = Some(params);
        }

        if let Some(rejected) = self.handshake.get_zero_rtt_rejected() {
            if rejected {
                debug!("zerortt rejected, rewriting early data under 1-rtt");
                self.ciphers.discard(EncryptionLevel::EarlyData);
                self.requeue_level(EncryptionLevel::EarlyData);
            } else {
                debug!("zerortt accepted");
                self.notify_replay_safe();
            }
        }

        Ok(())
    }

    /// Retry packets buffered before their cipher existed, for every level
    /// that now has a read cipher.
    fn flush_pending(&mut self, now: Instant) {
        for level in [
            EncryptionLevel::Initial,
            EncryptionLevel::Handshake,
            EncryptionLevel::EarlyData,
            EncryptionLevel::AppData,
        ] {
            if self.pending[level.index()].is_empty() || !self.ciphers.has_read_cipher(level) {
                continue;
            }
            let queue = std::mem::take(&mut self.pending[level.index()]);
            for (peer, packet, _recv_time) in queue {
                self.on_datagram(peer, packet, now);
            }
        }
    }

    fn advance_phase(&mut self, phase: HandshakePhase) {
        if phase > self.phase {
            debug!(from = ?self.phase, to = ?phase, "phase transition");
            self.phase = phase;
        }
    }

    fn on_established(&mut self, now: Instant) {
        self.advance_phase(HandshakePhase::Established);
        self.handshake.on_recv_one_rtt_protected_data();
        if self.handshake_key_discard_at.is_none() {
            self.handshake_key_discard_at = Some(now + HANDSHAKE_KEY_RETENTION);
        }
        self.notify_replay_safe();
    }

    fn notify_transport_ready(&mut self) {
        if self.transport_ready_notified {
            return;
        }
        self.transport_ready_notified = true;
        if let Some(callback) = self.callback.as_mut() {
            callback.on_transport_ready();
        }
    }

    fn notify_replay_safe(&mut self) {
        if self.replay_safe_notified {
            return;
        }
        self.replay_safe_notified = true;
        if let Some(callback) = self.callback.as_mut() {
            callback.on_replay_safe();
        }
    }

    // ------------------------------------------------------------------
    // ACK processing and loss
    // ------------------------------------------------------------------

    fn process_ack(&mut self, space: PacketNumberSpace, ack: &AckFrame, now: Instant) {
        let blocks = ack.blocks();
        let mut acked_bytes = 0u64;
        let mut rtt_sample = None;

        let mut remaining = Vec::with_capacity(self.outstanding.len());
        for packet in self.outstanding.drain(..) {
            let pn = packet.sent.packet_number;
            let acked = packet.sent.space == space
                && blocks.iter().any(|&(start, end)| pn >= start && pn <= end);
            if acked {
                acked_bytes += packet.sent.size as u64;
                if pn == ack.largest_acked {
                    rtt_sample = now.checked_duration_since(packet.sent.time_sent);
                }
            } else {
                remaining.push(packet);
            }
        }
        self.outstanding = remaining;

        if let Some(sample) = rtt_sample {
            self.rtt.update(sample);
        }
        if acked_bytes > 0 {
            self.congestion
                .on_packet_acked(acked_bytes, now, self.rtt.latest.unwrap_or_default());
        }

        self.detect_losses(space, ack.largest_acked, now);
        self.pto_deadline = if self.outstanding.iter().any(|p| p.sent.ack_eliciting) {
            Some(now + self.rtt.pto())
        } else {
            None
        };
    }

    fn detect_losses(&mut self, space: PacketNumberSpace, largest_acked: PacketNum, now: Instant) {
        let loss_delay = self
            .rtt
            .smoothed
            .map(|s| s + s / 8)
            .unwrap_or(DEFAULT_PTO);
        let mut lost_bytes = 0u64;
        let mut lost_frames = Vec::new();

        let mut remaining = Vec::with_capacity(self.outstanding.len());
        for packet in self.outstanding.drain(..) {
            let pn = packet.sent.packet_number;
            let in_space = packet.sent.space == space;
            let packet_threshold = in_space && pn + 3 <= largest_acked;
            let time_threshold = in_space
                && pn < largest_acked
                && now.saturating_duration_since(packet.sent.time_sent) > loss_delay;
            if packet_threshold || time_threshold {
                debug!(pn, "packet declared lost");
                lost_bytes += packet.sent.size as u64;
                lost_frames.extend(packet.retx);
            } else {
                remaining.push(packet);
            }
        }
        self.outstanding = remaining;

        for frame in lost_frames {
            self.requeue_frame(frame);
        }
        if lost_bytes > 0 {
            self.congestion.on_packet_loss(lost_bytes, now);
        }
    }

    fn requeue_frame(&mut self, frame: RetxFrame) {
        match frame {
            RetxFrame::Crypto { level, offset, data } => {
                self.crypto_send[level.index()].requeue(offset, data)
            }
            RetxFrame::Stream { id, offset, data, fin } => {
                self.streams.requeue(id, offset, data, fin)
            }
        }
    }

    /// Pull every outstanding packet of a level out of the ledger and
    /// requeue its content. Used after Retry (Initial) and 0-RTT rejection
    /// (EarlyData, resent under 1-RTT).
    fn requeue_level(&mut self, level: EncryptionLevel) {
        let mut frames = Vec::new();
        self.outstanding.retain_mut(|packet| {
            if packet.level == level {
                frames.append(&mut packet.retx);
                false
            } else {
                true
            }
        });
        for frame in frames {
            self.requeue_frame(frame);
        }
    }

    // ------------------------------------------------------------------
    // Transmission
    // ------------------------------------------------------------------

    /// Drain pending crypto, ACK, flow-control, and stream frames into
    /// packets, encrypt, and hand them to the socket(s).
    pub fn write_data(&mut self, now: Instant) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Idle | Lifecycle::Draining | Lifecycle::Closed => return Ok(()),
            _ => {}
        }

        for (level, data) in self.handshake.take_pending_writes() {
            self.crypto_send[level.index()].queue_fresh(data);
        }

        if let Some((code, application, reason)) = self.pending_close.clone() {
            if !self.close_sent {
                self.send_close_frame(code, application, &reason, now);
            }
            return Ok(());
        }

        for level in [
            EncryptionLevel::Initial,
            EncryptionLevel::Handshake,
            EncryptionLevel::EarlyData,
            EncryptionLevel::AppData,
        ] {
            self.write_level(level, now)?;
        }

        self.pto_deadline = if self.outstanding.iter().any(|p| p.sent.ack_eliciting) {
            Some(now + self.rtt.pto())
        } else {
            None
        };
        Ok(())
    }

    fn write_level(&mut self, level: EncryptionLevel, now: Instant) -> Result<()> {
        if !self.ciphers.has_write_cipher(level) {
            return Ok(());
        }
        // Once 1-RTT keys exist, early data moves to the 1-RTT level.
        if level == EncryptionLevel::EarlyData && self.phase >= HandshakePhase::OneRttKeysDerived {
            return Ok(());
        }

        for _ in 0..16 {
            if !self.build_and_send_packet(level, now)? {
                break;
            }
        }
        Ok(())
    }

    /// Assemble, protect, and emit at most one packet at `level`. Returns
    /// whether a packet was sent.
    fn build_and_send_packet(&mut self, level: EncryptionLevel, now: Instant) -> Result<bool> {
        let space = level.pn_space();
        let overhead = self
            .ciphers
            .write_overhead(level)
            .map_err(|e| QuicError::transport(TransportErrorCode::InternalError, e.to_string()))?;
        let budget = MAX_UDP_PAYLOAD - HEADER_BUDGET - overhead;

        // ACKs travel at the level matching their packet number space;
        // 0-RTT packets never carry them.
        let ack = if level != EncryptionLevel::EarlyData && self.acks[space.index()].needs_ack {
            self.acks[space.index()].frame()
        } else {
            None
        };
        let mut used = ack.as_ref().map(|a| encoded_size(&Frame::Ack(a.clone()))).unwrap_or(0);

        let crypto_chunk = self.crypto_send[level.index()].pop_chunk(budget.saturating_sub(used + 16));
        if let Some((_, data)) = &crypto_chunk {
            used += data.len() + 16;
        }

        let app_level = matches!(level, EncryptionLevel::EarlyData | EncryptionLevel::AppData);
        let path_responses: Vec<[u8; 8]> = if level == EncryptionLevel::AppData {
            std::mem::take(&mut self.pending_path_responses)
        } else {
            Vec::new()
        };
        used += path_responses.len() * 9;

        let max_data_update = if level == EncryptionLevel::AppData {
            self.flow.recv.poll_update()
        } else {
            None
        };
        if max_data_update.is_some() {
            used += 9;
        }

        let data_blocked = if app_level && self.flow.send.is_blocked() && self.streams.has_sendable_data()
        {
            Some(self.flow.send.max_data())
        } else {
            None
        };
        if data_blocked.is_some() {
            used += 9;
        }

        let stream_chunk = if app_level && self.congestion.writable_bytes() > 0 {
            let stream_budget = budget
                .saturating_sub(used + 16)
                .min(self.flow.send.available().min(u32::MAX as u64) as usize)
                .min(self.congestion.writable_bytes() as usize);
            let chunk = self.streams.next_outgoing_chunk(stream_budget);
            if let Some(chunk) = &chunk {
                self.flow
                    .send
                    .on_sent_through(chunk.offset + chunk.data.len() as u64);
            }
            chunk
        } else {
            None
        };

        let pto_probe = if self.pto_probe_pending && level != EncryptionLevel::EarlyData {
            self.pto_probe_pending = false;
            true
        } else {
            false
        };

        if ack.is_none()
            && crypto_chunk.is_none()
            && stream_chunk.is_none()
            && path_responses.is_empty()
            && max_data_update.is_none()
            && data_blocked.is_none()
            && !pto_probe
        {
            return Ok(false);
        }

        // Build the frame list over the owned pieces gathered above.
        let mut frames: Vec<Frame<'_>> = Vec::new();
        if let Some(ack) = &ack {
            frames.push(Frame::Ack(ack.clone()));
        }
        if let Some((offset, data)) = &crypto_chunk {
            frames.push(Frame::Crypto(CryptoFrame {
                offset: *offset,
                data: data.as_ref(),
            }));
        }
        for response in &path_responses {
            frames.push(Frame::PathResponse(PathResponseFrame { data: *response }));
        }
        if let Some(maximum_data) = max_data_update {
            frames.push(Frame::MaxData(MaxDataFrame { maximum_data }));
        }
        if let Some(data_limit) = data_blocked {
            frames.push(Frame::DataBlocked(DataBlockedFrame { data_limit }));
        }
        if let Some(chunk) = &stream_chunk {
            frames.push(Frame::Stream(StreamFrame {
                stream_id: chunk.stream_id,
                offset: chunk.offset,
                fin: chunk.fin,
                data: chunk.data.as_ref(),
            }));
        }
        if pto_probe {
            frames.push(Frame::Ping);
        }

        let pn = self.next_pn[space.index()];
        let pn_len = packet_number_len(pn, None);

        // Serialize the payload.
        let mut payload = BytesMut::new();
        for frame in &frames {
            encode_frame(frame, &mut payload);
        }

        // Pad so the sealed packet always contains a header-protection
        // sample; pad client Initial datagrams to the RFC minimum.
        let min_len = self
            .ciphers
            .min_plaintext_len(level, pn_len)
            .unwrap_or(20);
        let mut pad = min_len.saturating_sub(payload.len());
        if level == EncryptionLevel::Initial {
            let mut probe = Header::long(
                PacketType::Initial,
                self.version,
                self.dcid.clone(),
                self.scid.clone(),
                pn,
                pn_len,
            );
            probe.token = self.retry_token.clone();
            // The padded Length field lands in the two-byte varint range.
            probe.payload_len = Some(MIN_INITIAL_PACKET_SIZE as u64);
            let header_len = probe.encoded_len();
            pad = pad.max(
                MIN_INITIAL_PACKET_SIZE.saturating_sub(header_len + payload.len() + overhead),
            );
        }
        if pad > 0 {
            let padding = Frame::Padding { count: pad as u64 };
            encode_frame(&padding, &mut payload);
            frames.push(padding);
        }

        // Header.
        let mut buf = BytesMut::with_capacity(MAX_UDP_PAYLOAD);
        let header = match level {
            EncryptionLevel::Initial => {
                let mut header = Header::long(
                    PacketType::Initial,
                    self.version,
                    self.dcid.clone(),
                    self.scid.clone(),
                    pn,
                    pn_len,
                );
                header.token = self.retry_token.clone();
                header.payload_len = Some((pn_len + payload.len() + overhead) as u64);
                header
            }
            EncryptionLevel::Handshake => {
                let mut header = Header::long(
                    PacketType::Handshake,
                    self.version,
                    self.dcid.clone(),
                    self.scid.clone(),
                    pn,
                    pn_len,
                );
                header.payload_len = Some((pn_len + payload.len() + overhead) as u64);
                header
            }
            EncryptionLevel::EarlyData => {
                let mut header = Header::long(
                    PacketType::ZeroRtt,
                    self.version,
                    self.dcid.clone(),
                    self.scid.clone(),
                    pn,
                    pn_len,
                );
                header.payload_len = Some((pn_len + payload.len() + overhead) as u64);
                header
            }
            EncryptionLevel::AppData => Header::short(self.dcid.clone(), pn, pn_len, false),
        };

        let pn_offset = header.encode(&mut buf);
        buf.extend_from_slice(&payload);
        self.ciphers
            .seal(level, &mut buf, pn_offset, pn_len, pn)
            .map_err(|e| QuicError::transport(TransportErrorCode::InternalError, e.to_string()))?;

        if let Some(qlogger) = self.qlogger.clone() {
            qlogger.add_packet_event(create_packet_event(
                self.ref_time_us(now),
                QLogEventType::PacketSent,
                &header,
                buf.len() as u64,
                &frames,
            ));
        }

        let ack_eliciting = frames.iter().any(|f| f.is_ack_eliciting());
        let sent = SentPacket {
            packet_number: pn,
            space,
            size: buf.len(),
            time_sent: now,
            ack_eliciting,
        };
        if ack_eliciting {
            self.congestion.on_packet_sent(&sent);
            let mut retx = Vec::new();
            if let Some((offset, data)) = crypto_chunk {
                retx.push(RetxFrame::Crypto {
                    level,
                    offset,
                    data,
                });
            }
            if let Some(chunk) = stream_chunk {
                retx.push(RetxFrame::Stream {
                    id: chunk.stream_id,
                    offset: chunk.offset,
                    data: chunk.data,
                    fin: chunk.fin,
                });
            }
            self.outstanding.push(OutstandingPacket { sent, level, retx });
        }
        if ack.is_some() {
            self.acks[space.index()].needs_ack = false;
        }
        self.next_pn[space.index()] += 1;

        let datagram = buf.freeze();
        if level == EncryptionLevel::Initial {
            self.last_initial_datagram = Some(datagram.clone());
        }
        self.send_datagram(&datagram);
        Ok(true)
    }

    fn send_close_frame(&mut self, code: u64, application: bool, reason: &str, now: Instant) {
        // The close travels at the highest level with a write cipher.
        let level = [
            EncryptionLevel::AppData,
            EncryptionLevel::Handshake,
            EncryptionLevel::Initial,
        ]
        .into_iter()
        .find(|&l| self.ciphers.has_write_cipher(l));
        let Some(level) = level else { return };

        let frame = if application {
            Frame::ApplicationClose(ApplicationCloseFrame {
                error_code: code,
                reason: Bytes::copy_from_slice(reason.as_bytes()),
            })
        } else {
            Frame::ConnectionClose(ConnectionCloseFrame {
                error_code: code,
                closing_frame_type: 0,
                reason: Bytes::copy_from_slice(reason.as_bytes()),
            })
        };

        let space = level.pn_space();
        let pn = self.next_pn[space.index()];
        let pn_len = packet_number_len(pn, None);
        let overhead = match self.ciphers.write_overhead(level) {
            Ok(overhead) => overhead,
            Err(_) => return,
        };

        let mut payload = BytesMut::new();
        encode_frame(&frame, &mut payload);
        let min_len = self.ciphers.min_plaintext_len(level, pn_len).unwrap_or(20);
        if payload.len() < min_len {
            encode_frame(
                &Frame::Padding {
                    count: (min_len - payload.len()) as u64,
                },
                &mut payload,
            );
        }

        let header = match level {
            EncryptionLevel::AppData => Header::short(self.dcid.clone(), pn, pn_len, false),
            _ => {
                let ty = if level == EncryptionLevel::Initial {
                    PacketType::Initial
                } else {
                    PacketType::Handshake
                };
                let mut header = Header::long(
                    ty,
                    self.version,
                    self.dcid.clone(),
                    self.scid.clone(),
                    pn,
                    pn_len,
                );
                header.payload_len = Some((pn_len + payload.len() + overhead) as u64);
                if level == EncryptionLevel::Initial {
                    header.token = self.retry_token.clone();
                }
                header
            }
        };

        let mut buf = BytesMut::new();
        let pn_offset = header.encode(&mut buf);
        buf.extend_from_slice(&payload);
        if self
            .ciphers
            .seal(level, &mut buf, pn_offset, pn_len, pn)
            .is_ok()
        {
            self.next_pn[space.index()] += 1;
            self.close_sent = true;
            let datagram = buf.freeze();
            if let Some(qlogger) = self.qlogger.clone() {
                qlogger.add_packet_event(create_packet_event(
                    self.ref_time_us(now),
                    QLogEventType::PacketSent,
                    &header,
                    datagram.len() as u64,
                    &[frame],
                ));
            }
            self.send_datagram(&datagram);
        }
    }

    fn send_datagram(&mut self, data: &[u8]) {
        if self.happy_eyeballs.should_write_to_first_socket {
            if let (Some(socket), Some(peer)) = (self.socket.as_mut(), self.peer_address) {
                let _ = socket.send_to(data, peer);
            }
        }
        if self.happy_eyeballs.should_write_to_second_socket {
            let peer = self.happy_eyeballs.second_peer_address;
            if let (Some(socket), Some(peer)) =
                (self.happy_eyeballs.second_socket.as_mut(), peer)
            {
                let _ = socket.send_to(data, peer);
            }
        }
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += data.len() as u64;
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Earliest pending timer deadline, if any. The happy-eyeballs delay
    /// timer is owned by the event loop and not included here.
    pub fn next_timeout(&self) -> Option<Instant> {
        [
            self.idle_deadline,
            self.pto_deadline,
            self.handshake_key_discard_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Drive expired timers. Safe to call spuriously.
    pub fn on_timeout(&mut self, now: Instant) {
        if let Some(deadline) = self.handshake_key_discard_at {
            if now >= deadline {
                self.handshake_key_discard_at = None;
                self.ciphers.discard(EncryptionLevel::Handshake);
                self.pending[EncryptionLevel::Handshake.index()].clear();
            }
        }
        if let Some(deadline) = self.pto_deadline {
            if now >= deadline {
                self.pto_deadline = None;
                trace!("probe timeout");
                self.pto_probe_pending = true;
                let _ = self.write_data(now);
            }
        }
        if let Some(deadline) = self.idle_deadline {
            if now >= deadline {
                debug!("idle timeout");
                self.cancel_timers();
                self.release_sockets();
                self.lifecycle = Lifecycle::Closed;
                self.deliver_terminal(Err(QuicError::IdleTimeout));
            }
        }
    }

    /// The happy-eyeballs connection-attempt delay expired: the secondary
    /// socket races with a copy of the latest Initial flight.
    pub fn on_happy_eyeballs_timeout(&mut self, _now: Instant) {
        if self.happy_eyeballs.finished {
            return;
        }
        happyeyeballs::start_second_socket(&mut self.happy_eyeballs);
        if let Some(datagram) = self.last_initial_datagram.clone() {
            let peer = self.happy_eyeballs.second_peer_address;
            if let (Some(socket), Some(peer)) =
                (self.happy_eyeballs.second_socket.as_mut(), peer)
            {
                let _ = socket.send_to(&datagram, peer);
            }
        }
    }

    // ------------------------------------------------------------------
    // Application data
    // ------------------------------------------------------------------

    pub fn open_bidirectional_stream(&mut self) -> Result<StreamId> {
        self.streams.open_bidirectional()
    }

    pub fn open_unidirectional_stream(&mut self) -> Result<StreamId> {
        self.streams.open_unidirectional()
    }

    pub fn write_stream(&mut self, id: StreamId, data: Bytes, fin: bool) -> Result<()> {
        self.streams.write(id, data, fin)
    }

    pub fn read_stream(&mut self, id: StreamId) -> Option<super::StreamReadResult> {
        let result = self.streams.read(id);
        if let Some(read) = &result {
            self.flow.recv.on_consumed(read.data.len() as u64);
        }
        result
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.peer_address
    }

    pub fn original_peer_address(&self) -> Option<SocketAddr> {
        self.original_peer_address
    }

    pub fn is_tls_resumed(&self) -> bool {
        self.handshake.is_tls_resumed()
    }

    pub fn peer_transport_parameters(&self) -> Option<&TransportParameters> {
        self.peer_params.as_ref()
    }

    /// Address validation token received via NEW_TOKEN, usable on the next
    /// connection to this server.
    pub fn new_token(&self) -> Option<&Token> {
        self.new_token.as_ref()
    }

    pub fn happy_eyeballs_state(&self) -> &HappyEyeballsState {
        &self.happy_eyeballs
    }

    pub fn is_self_owned(&self) -> bool {
        self.self_ref.is_some()
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.scid
    }

    pub fn destination_connection_id(&self) -> &ConnectionId {
        &self.dcid
    }

    fn ref_time_us(&self, now: Instant) -> u64 {
        self.reference_time
            .and_then(|start| now.checked_duration_since(start))
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}
