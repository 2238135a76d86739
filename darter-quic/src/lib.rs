//! # darter-quic: Client-Side QUIC Transport Core
//!
//! The connection state machine that multiplexes an encrypted, reliable,
//! stream-oriented session over UDP, for the client role:
//!
//! - **RFC 9000**: QUIC: A UDP-Based Multiplexed and Secure Transport
//! - **RFC 9001**: Using TLS to Secure QUIC
//! - **RFC 9002**: Loss Detection and Congestion Control (interface only)
//! - **RFC 8305**: Happy Eyeballs dual-stack connection racing
//!
//! ## Architecture Overview
//!
//! ```text
//! darter-quic/
//! ├── error          - Transport/application/crypto error taxonomy
//! ├── frames         - Frame types with zero-copy parsing
//! ├── packet         - Header codec and packet number arithmetic
//! ├── crypto         - AEAD/header-protection traits, per-level cipher set
//! ├── handshake      - TLS 1.3 client adapter with edge-triggered handoff
//! ├── happyeyeballs  - Dual-stack connect race (RFC 8305)
//! ├── transport      - Transport parameters and flow control
//! ├── congestion     - Bandwidth arithmetic and controller interface
//! ├── qlog           - Structured per-packet diagnostic events
//! ├── psk            - Session resumption cache interface
//! └── client         - Client connection state machine and lifecycle
//! ```
//!
//! ## Design Principles
//!
//! 1. **Callback-driven**: a connection is affinitised to one event loop.
//!    Socket reads, timer firings, and API calls are each a finite,
//!    non-blocking step; there are no internal locks and no hidden
//!    suspension points.
//!
//! 2. **Pluggable crypto**: the transport performs no cryptography itself.
//!    A [`crypto::CryptoFactory`] backend supplies AEAD and
//!    header-protection primitives; a [`handshake::TlsMachine`] drives the
//!    TLS 1.3 client state machine.
//!
//! 3. **Edge-triggered key handoff**: every cipher produced by the
//!    handshake is taken by the transport exactly once; a second read of
//!    the same slot returns empty.
//!
//! 4. **Self-owning lifecycle**: from `start` until the terminal callback
//!    the connection holds a reference to itself, so datagrams arriving
//!    after the application dropped its handle are absorbed silently
//!    instead of provoking ICMP unreachable replies.

pub mod client;
pub mod congestion;
pub mod crypto;
pub mod error;
pub mod frames;
pub mod handshake;
pub mod happyeyeballs;
pub mod packet;
pub mod psk;
pub mod qlog;
pub mod transport;
pub mod types;

pub use client::{ClientConnection, ConnectionCallback, ConnectionStats, Lifecycle};
pub use congestion::{Bandwidth, CongestionController, SentPacket};
pub use crypto::{Aead, CipherDirection, CipherSet, CryptoFactory, EncryptionLevel, HeaderKey};
pub use error::{LocalErrorCode, QuicError, Result, TransportErrorCode};
pub use frames::Frame;
pub use handshake::{ClientHandshake, HandshakePhase, TlsAction, TlsMachine};
pub use happyeyeballs::{CachedFamily, ConnAttemptTimer, DatagramSocket, HappyEyeballsState};
pub use packet::{parse_header, Header, PacketNumberSpace, PacketType};
pub use psk::{CachedPsk, PskCache};
pub use qlog::{QLogEventType, QLogPacketEvent, QLogger};
pub use transport::{CustomTransportParameter, TransportParameters};
pub use types::{ConnectionId, PacketNum, StreamId, Token, VarInt, QUIC_VERSION_1};
