//! # Core QUIC Types (RFC 8999, RFC 9000)
//!
//! Fundamental types shared across the transport: connection IDs,
//! variable-length integers, stream identifiers, and wire constants.

use bytes::{Buf, BufMut, Bytes};

// ============================================================================
// Variable-Length Integer Encoding (RFC 9000 Section 16)
// ============================================================================

/// Variable-Length Integer (RFC 9000 Section 16)
///
/// The first two bits of the first byte indicate the encoded length:
/// 00=1 byte, 01=2 bytes, 10=4 bytes, 11=8 bytes. Maximum value: 2^62 - 1.
pub type VarInt = u64;

/// Maximum value representable as a VarInt (2^62 - 1)
pub const VARINT_MAX: u64 = (1u64 << 62) - 1;

/// Decode a VarInt from the front of a slice, returning (value, bytes consumed).
///
/// Returns `None` if the buffer is too short.
pub fn decode_varint(buf: &[u8]) -> Option<(VarInt, usize)> {
    let first = *buf.first()?;
    let len = 1usize << (first >> 6);
    if buf.len() < len {
        return None;
    }
    let mut value = (first as u64) & 0x3f;
    for byte in &buf[1..len] {
        value = (value << 8) | *byte as u64;
    }
    Some((value, len))
}

/// Decode a VarInt from a `Buf`, consuming the encoded bytes.
pub fn read_varint<B: Buf>(buf: &mut B) -> Option<VarInt> {
    if !buf.has_remaining() {
        return None;
    }
    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return None;
    }
    let value = match len {
        1 => buf.get_u8() as u64,
        2 => (buf.get_u16() & 0x3fff) as u64,
        4 => (buf.get_u32() & 0x3fff_ffff) as u64,
        8 => buf.get_u64() & 0x3fff_ffff_ffff_ffff,
        _ => unreachable!(),
    };
    Some(value)
}

/// Encode a VarInt into a `BufMut` using the shortest encoding.
pub fn write_varint<B: BufMut>(buf: &mut B, value: VarInt) {
    if value < 0x40 {
        buf.put_u8(value as u8);
    } else if value < 0x4000 {
        buf.put_u16(value as u16 | 0x4000);
    } else if value < 0x4000_0000 {
        buf.put_u32(value as u32 | 0x8000_0000);
    } else {
        buf.put_u64(value | 0xc000_0000_0000_0000);
    }
}

/// Size in bytes of the shortest encoding of `value`.
pub fn varint_size(value: VarInt) -> usize {
    if value < 0x40 {
        1
    } else if value < 0x4000 {
        2
    } else if value < 0x4000_0000 {
        4
    } else {
        8
    }
}

// ============================================================================
// Connection ID (RFC 9000 Section 5.1, RFC 8999 Section 5.3)
// ============================================================================

/// Maximum length of a Connection ID (RFC 9000 Section 17.2)
pub const MAX_CID_LENGTH: usize = 20;

/// Connection ID - opaque endpoint-chosen identifier, 0 to 20 bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    bytes: Bytes,
}

impl ConnectionId {
    /// Create a ConnectionId from owned bytes.
    ///
    /// Returns `None` if the length exceeds [`MAX_CID_LENGTH`].
    pub fn new(bytes: Bytes) -> Option<Self> {
        if bytes.len() > MAX_CID_LENGTH {
            return None;
        }
        Some(Self { bytes })
    }

    /// Create from a borrowed slice (copies the data).
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() > MAX_CID_LENGTH {
            return None;
        }
        Some(Self {
            bytes: Bytes::copy_from_slice(slice),
        })
    }

    /// Zero-length connection ID.
    pub fn empty() -> Self {
        Self { bytes: Bytes::new() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl core::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ConnectionId({:02x?})", &self.bytes[..])
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in &self.bytes[..] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Stream ID (RFC 9000 Section 2.1)
// ============================================================================

/// Stream ID - identifies a bidirectional or unidirectional stream.
///
/// The two least significant bits encode initiator and directionality:
/// - Bit 0: initiator (0=client, 1=server)
/// - Bit 1: direction (0=bidirectional, 1=unidirectional)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_bidirectional(&self) -> bool {
        (self.0 & 0x02) == 0
    }

    pub fn is_unidirectional(&self) -> bool {
        !self.is_bidirectional()
    }

    pub fn is_client_initiated(&self) -> bool {
        (self.0 & 0x01) == 0
    }

    pub fn is_server_initiated(&self) -> bool {
        !self.is_client_initiated()
    }
}

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Packet Number (RFC 9000 Section 12.3)
// ============================================================================

/// Packet number - 62-bit monotonically increasing value per number space.
pub type PacketNum = u64;

/// Address Validation Token (RFC 9000 Section 8.1)
///
/// Opaque blob issued by servers via Retry packets or NEW_TOKEN frames;
/// echoed by the client in subsequent Initial packets.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Token {
    bytes: Bytes,
}

impl Token {
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ============================================================================
// Constants
// ============================================================================

/// QUIC version 1 (RFC 9000)
pub const QUIC_VERSION_1: u32 = 0x0000_0001;

/// Version number reserved for version negotiation packets
pub const VERSION_NEGOTIATION: u32 = 0x0000_0000;

/// Minimum size of a client Initial datagram (RFC 9000 Section 14.1)
pub const MIN_INITIAL_PACKET_SIZE: usize = 1200;

/// Default maximum UDP payload the transport will send
pub const DEFAULT_UDP_SEND_PACKET_LEN: usize = 1252;

/// Transport parameter identifiers at or above this value are available for
/// locally-configured custom parameters; the space below is reserved for
/// standard parameters and registered extensions.
pub const CUSTOM_TRANSPORT_PARAMETER_THRESHOLD: u64 = 0x4000;

/// How many undecryptable packets are retained per encryption level while
/// waiting for the corresponding read cipher. Packets beyond the cap are
/// dropped silently.
pub const PENDING_PACKET_CAP: usize = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 63, 64, 16383, 16384, 1_073_741_823, 1_073_741_824, VARINT_MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_size(value));
            let (decoded, consumed) = decode_varint(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn varint_short_buffer() {
        // 2-byte encoding with only one byte present
        assert_eq!(decode_varint(&[0x40]), None);
        assert_eq!(decode_varint(&[]), None);
    }

    #[test]
    fn connection_id_length_limit() {
        assert!(ConnectionId::from_slice(&[0u8; 20]).is_some());
        assert!(ConnectionId::from_slice(&[0u8; 21]).is_none());
        assert!(ConnectionId::empty().is_empty());
    }

    #[test]
    fn stream_id_classification() {
        assert!(StreamId(0).is_bidirectional());
        assert!(StreamId(0).is_client_initiated());
        assert!(StreamId(1).is_server_initiated());
        assert!(StreamId(2).is_unidirectional());
        assert!(StreamId(3).is_unidirectional());
        assert!(StreamId(3).is_server_initiated());
    }
}
