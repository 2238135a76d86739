//! # TLS 1.3 Handshake Adapter
//!
//! Wraps a TLS 1.3 client state machine behind [`TlsMachine`]. CRYPTO bytes
//! tagged by encryption level are reassembled in offset order and fed to the
//! machine; the machine's tagged actions install ciphers, buffer outbound
//! CRYPTO data, surface the server's transport parameters, and report
//! success or failure.
//!
//! Every cipher accessor is edge-triggered: the owner takes the cipher
//! exactly once and subsequent calls return `None`.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::crypto::{CipherDirection, CipherPair, CryptoFactory, EncryptionLevel, TlsSecret};
use crate::error::{QuicError, Result, TransportErrorCode};
use crate::psk::CachedPsk;
use crate::transport::TransportParameters;

/// TLS alert used when the machine reports a failure without one.
const ALERT_INTERNAL_ERROR: u8 = 80;

/// Most crypto stream data buffered ahead of the contiguous edge before the
/// peer is considered abusive.
const MAX_CRYPTO_BUFFER: u64 = 1 << 17;

// ============================================================================
// Phases and Actions
// ============================================================================

/// Handshake phase mirrored by the transport. Monotonic; never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakePhase {
    Initial,
    Handshake,
    OneRttKeysDerived,
    Established,
}

/// Payload of a successful handshake report.
pub struct HandshakeSuccess {
    /// Raw transport_parameters extension from the server's encrypted
    /// extensions.
    pub server_transport_params: Bytes,
    /// Whether the server accepted early data; meaningless unless 0-RTT was
    /// attempted.
    pub early_data_accepted: bool,
    pub alpn: Option<String>,
    /// Whether the TLS session was resumed from a PSK.
    pub resumed: bool,
}

/// Fatal TLS failure reported by the machine.
pub struct TlsError {
    pub alert: Option<u8>,
    pub message: String,
}

/// Opaque deferred update produced by the TLS machine; applied back to it
/// by the adapter when the action is dispatched.
pub struct TlsStateUpdate(pub Box<dyn FnOnce(&mut dyn TlsMachine)>);

/// Tagged actions emitted by the TLS machine for each input.
pub enum TlsAction {
    /// TLS application data. QUIC does not carry TLS app-data; ignored.
    DeliverAppData { data: Bytes },
    /// Handshake bytes to send as a CRYPTO frame at the given level.
    WriteToSocket { level: EncryptionLevel, data: Bytes },
    /// The client may start writing 0-RTT data.
    ReportEarlyHandshakeSuccess,
    /// Handshake complete; 1-RTT keys are derivable.
    ReportHandshakeSuccess(HandshakeSuccess),
    /// Early data could not be written. Fatal.
    ReportEarlyWriteFailed,
    /// Fatal TLS failure.
    ReportError(TlsError),
    /// No further progress until more input arrives.
    WaitForData,
    /// Deferred machine-state update to apply.
    MutateState(TlsStateUpdate),
    /// The server issued a new session ticket.
    NewCachedPsk(CachedPsk),
    /// A traffic secret became available for a (level, direction).
    SecretAvailable(TlsSecret),
    /// The handshake read side is closed.
    EndOfData,
}

/// TLS 1.3 client state machine. Implementations own the TLS state and key
/// schedule; the adapter only routes bytes and dispatches actions.
pub trait TlsMachine {
    /// Begin the handshake. `transport_params` is the serialized
    /// transport_parameters extension to offer; `cached_psk` enables
    /// resumption and 0-RTT.
    fn connect(
        &mut self,
        hostname: Option<&str>,
        cached_psk: Option<CachedPsk>,
        transport_params: Bytes,
    ) -> Vec<TlsAction>;

    /// Feed contiguous handshake bytes received at `level`.
    fn process(&mut self, level: EncryptionLevel, data: &[u8]) -> Vec<TlsAction>;
}

/// Back reference from the handshake into its owner, typed as the callback
/// interface only.
pub trait HandshakeCallback {
    fn on_new_cached_psk(&mut self, psk: CachedPsk);
}

// ============================================================================
// Crypto Stream Reassembly
// ============================================================================

/// Offset-ordered reassembly for one level's crypto stream. Gaps are
/// buffered and delivered once contiguous.
#[derive(Default)]
struct CryptoStreamBuffer {
    next_offset: u64,
    segments: BTreeMap<u64, Bytes>,
}

impl CryptoStreamBuffer {
    fn insert(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        if end <= self.next_offset || data.is_empty() {
            // Entirely duplicate data.
            return Ok(());
        }
        if end - self.next_offset > MAX_CRYPTO_BUFFER {
            return Err(QuicError::transport(
                TransportErrorCode::CryptoBufferExceeded,
                "crypto stream buffered too far ahead",
            ));
        }
        // Trim the already-delivered prefix.
        let (offset, data) = if offset < self.next_offset {
            let skip = (self.next_offset - offset) as usize;
            (self.next_offset, &data[skip..])
        } else {
            (offset, data)
        };
        self.segments
            .entry(offset)
            .or_insert_with(|| Bytes::copy_from_slice(data));
        Ok(())
    }

    /// Pop the contiguous run starting at the delivery edge, if any.
    fn drain_contiguous(&mut self) -> Option<Bytes> {
        let mut out = BytesMut::new();
        while let Some((&offset, segment)) = self.segments.iter().next() {
            if offset > self.next_offset {
                break;
            }
            let Some(segment) = self.segments.remove(&offset) else {
                break;
            };
            let skip = (self.next_offset - offset) as usize;
            if skip < segment.len() {
                out.extend_from_slice(&segment[skip..]);
                self.next_offset = offset + segment.len() as u64;
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out.freeze())
        }
    }
}

// ============================================================================
// Client Handshake
// ============================================================================

/// The TLS/QUIC handshake adapter for the client role.
pub struct ClientHandshake {
    machine: Box<dyn TlsMachine>,
    factory: std::rc::Rc<dyn CryptoFactory>,

    phase: HandshakePhase,

    // Edge-triggered cipher handoff slots. Each is staged once by an action
    // and moved out once by the transport.
    handshake_read: Option<CipherPair>,
    handshake_write: Option<CipherPair>,
    one_rtt_read: Option<CipherPair>,
    one_rtt_write: Option<CipherPair>,
    zero_rtt_write: Option<CipherPair>,

    /// Outbound handshake bytes, framed as CRYPTO at their level by the
    /// transport's write path.
    pending_writes: Vec<(EncryptionLevel, Bytes)>,

    read_buffers: [CryptoStreamBuffer; EncryptionLevel::COUNT],

    server_params: Option<TransportParameters>,
    zero_rtt_rejected: Option<bool>,
    early_data_attempted: bool,
    resumed: bool,
    alpn: Option<String>,

    wait_for_data: bool,
    read_closed: bool,
    error: Option<QuicError>,
}

impl ClientHandshake {
    pub fn new(machine: Box<dyn TlsMachine>, factory: std::rc::Rc<dyn CryptoFactory>) -> Self {
        Self {
            machine,
            factory,
            phase: HandshakePhase::Initial,
            handshake_read: None,
            handshake_write: None,
            one_rtt_read: None,
            one_rtt_write: None,
            zero_rtt_write: None,
            pending_writes: Vec::new(),
            read_buffers: Default::default(),
            server_params: None,
            zero_rtt_rejected: None,
            early_data_attempted: false,
            resumed: false,
            alpn: None,
            wait_for_data: false,
            read_closed: false,
            error: None,
        }
    }

    /// Initiate the handshake. 0-RTT is attempted iff a cached PSK is
    /// supplied.
    pub fn connect(
        &mut self,
        hostname: Option<&str>,
        cached_psk: Option<CachedPsk>,
        transport_params: Bytes,
        callback: &mut dyn HandshakeCallback,
    ) -> Result<()> {
        self.early_data_attempted = cached_psk.is_some();
        let actions = self.machine.connect(hostname, cached_psk, transport_params);
        self.process_actions(actions, callback)
    }

    /// Deliver the payload of one CRYPTO frame. Bytes reach the TLS machine
    /// in offset order; out-of-order data is buffered until contiguous.
    pub fn on_crypto_data(
        &mut self,
        level: EncryptionLevel,
        offset: u64,
        data: &[u8],
        callback: &mut dyn HandshakeCallback,
    ) -> Result<()> {
        if self.read_closed {
            trace!(?level, "crypto data after end of stream, dropped");
            return Ok(());
        }
        self.read_buffers[level.index()].insert(offset, data)?;
        while let Some(chunk) = self.read_buffers[level.index()].drain_contiguous() {
            self.wait_for_data = false;
            let actions = self.machine.process(level, &chunk);
            self.process_actions(actions, callback)?;
            if self.wait_for_data || self.read_closed {
                break;
            }
        }
        Ok(())
    }

    fn process_actions(
        &mut self,
        actions: Vec<TlsAction>,
        callback: &mut dyn HandshakeCallback,
    ) -> Result<()> {
        for action in actions {
            match action {
                TlsAction::DeliverAppData { data } => {
                    // QUIC never carries TLS application data.
                    trace!(len = data.len(), "ignoring TLS app data");
                }

                TlsAction::WriteToSocket { level, data } => {
                    trace!(?level, len = data.len(), "handshake bytes queued");
                    self.pending_writes.push((level, data));
                }

                TlsAction::ReportEarlyHandshakeSuccess => {
                    debug!("early handshake success, 0-rtt writable");
                }

                TlsAction::ReportHandshakeSuccess(success) => {
                    self.advance_phase(HandshakePhase::OneRttKeysDerived);
                    self.resumed = success.resumed;
                    self.alpn = success.alpn;
                    if self.early_data_attempted {
                        self.zero_rtt_rejected = Some(!success.early_data_accepted);
                    }
                    let mut raw = success.server_transport_params.clone();
                    let params = TransportParameters::decode(&mut raw).map_err(|e| {
                        QuicError::transport(
                            TransportErrorCode::TransportParameterError,
                            e.to_string(),
                        )
                    })?;
                    self.server_params = Some(params);
                    debug!(resumed = self.resumed, "handshake success");
                }

                TlsAction::ReportEarlyWriteFailed => {
                    self.error = Some(QuicError::crypto(
                        ALERT_INTERNAL_ERROR,
                        "early write failed",
                    ));
                }

                TlsAction::ReportError(err) => {
                    self.error = Some(QuicError::crypto(
                        err.alert.unwrap_or(ALERT_INTERNAL_ERROR),
                        err.message,
                    ));
                }

                TlsAction::WaitForData => {
                    self.wait_for_data = true;
                }

                TlsAction::MutateState(update) => {
                    (update.0)(self.machine.as_mut());
                }

                TlsAction::NewCachedPsk(psk) => {
                    callback.on_new_cached_psk(psk);
                }

                TlsAction::SecretAvailable(secret) => {
                    self.install_secret(secret)?;
                }

                TlsAction::EndOfData => {
                    self.read_closed = true;
                }
            }
        }

        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn install_secret(&mut self, secret: TlsSecret) -> Result<()> {
        let pair = self.factory.cipher_from_secret(&secret).map_err(|_| {
            QuicError::crypto(ALERT_INTERNAL_ERROR, "cipher derivation failed")
        })?;
        trace!(level = ?secret.level, direction = ?secret.direction, "cipher derived");
        let slot = match (secret.level, secret.direction) {
            (EncryptionLevel::Handshake, CipherDirection::Read) => &mut self.handshake_read,
            (EncryptionLevel::Handshake, CipherDirection::Write) => &mut self.handshake_write,
            (EncryptionLevel::AppData, CipherDirection::Read) => &mut self.one_rtt_read,
            (EncryptionLevel::AppData, CipherDirection::Write) => &mut self.one_rtt_write,
            (EncryptionLevel::EarlyData, CipherDirection::Write) => &mut self.zero_rtt_write,
            _ => {
                // Initial secrets are derived by the transport from the
                // destination connection ID, and 0-RTT has no read side.
                return Ok(());
            }
        };
        *slot = Some(pair);
        if secret.level == EncryptionLevel::Handshake {
            self.advance_phase(HandshakePhase::Handshake);
        }
        Ok(())
    }

    fn advance_phase(&mut self, phase: HandshakePhase) {
        if phase > self.phase {
            debug!(from = ?self.phase, to = ?phase, "handshake phase advanced");
            self.phase = phase;
        }
    }

    // ------------------------------------------------------------------
    // Edge-triggered accessors: each returns its cipher exactly once.
    // ------------------------------------------------------------------

    pub fn get_handshake_read_ciphers(&mut self) -> Option<CipherPair> {
        self.handshake_read.take()
    }

    pub fn get_handshake_write_ciphers(&mut self) -> Option<CipherPair> {
        self.handshake_write.take()
    }

    pub fn get_one_rtt_read_ciphers(&mut self) -> Option<CipherPair> {
        self.one_rtt_read.take()
    }

    pub fn get_one_rtt_write_ciphers(&mut self) -> Option<CipherPair> {
        self.one_rtt_write.take()
    }

    pub fn get_zero_rtt_write_ciphers(&mut self) -> Option<CipherPair> {
        self.zero_rtt_write.take()
    }

    /// Edge-triggered: the server's transport parameters, available once
    /// after the encrypted extensions arrive.
    pub fn get_server_transport_params(&mut self) -> Option<TransportParameters> {
        self.server_params.take()
    }

    /// Edge-triggered three-state read: `None` if 0-RTT was never attempted
    /// (or the result was already taken), `Some(false)` accepted,
    /// `Some(true)` rejected.
    pub fn get_zero_rtt_rejected(&mut self) -> Option<bool> {
        self.zero_rtt_rejected.take()
    }

    /// Outbound handshake bytes to frame as CRYPTO at their level.
    pub fn take_pending_writes(&mut self) -> Vec<(EncryptionLevel, Bytes)> {
        std::mem::take(&mut self.pending_writes)
    }

    /// The peer sent 1-RTT protected data we could decrypt: it has
    /// implicitly acknowledged the 1-RTT keys.
    pub fn on_recv_one_rtt_protected_data(&mut self) {
        self.advance_phase(HandshakePhase::Established);
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn is_tls_resumed(&self) -> bool {
        self.resumed
    }

    pub fn application_protocol(&self) -> Option<&str> {
        self.alpn.as_deref()
    }

    pub fn early_data_attempted(&self) -> bool {
        self.early_data_attempted
    }
}

// ============================================================================
// Scripted machine for tests
// ============================================================================
