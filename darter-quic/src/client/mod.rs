//! # Client Connection State Machine
//!
//! The client transport: owns the cipher set, the handshake adapter, the
//! happy-eyeballs race, per-stream state, and the outstanding-packet
//! ledger. All progress is callback-driven on one event loop; methods take
//! the current time explicitly and never block.

mod connection;
mod streams;

#[cfg(test)]
mod tests;

pub use connection::{ClientConnection, ConnectionStats, Lifecycle};
pub use streams::{StreamManager, StreamReadResult};

use crate::error::QuicError;
use crate::types::StreamId;

/// Application-facing connection callbacks. Exactly one terminal event
/// (`on_connection_end` or `on_connection_error`) is delivered per
/// connection.
pub trait ConnectionCallback {
    /// The handshake completed and 1-RTT data can be written.
    fn on_transport_ready(&mut self) {}

    /// Data written from this point is protected against replay (the
    /// handshake completed, or the server accepted 0-RTT).
    fn on_replay_safe(&mut self) {}

    fn on_new_bidirectional_stream(&mut self, _stream_id: StreamId) {}

    fn on_new_unidirectional_stream(&mut self, _stream_id: StreamId) {}

    fn on_stream_readable(&mut self, _stream_id: StreamId) {}

    /// Terminal: the connection ended without error.
    fn on_connection_end(&mut self) {}

    /// Terminal: the connection ended with an error.
    fn on_connection_error(&mut self, _error: QuicError) {}
}
