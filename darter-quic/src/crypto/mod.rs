//! # Cryptographic Interface (RFC 9001)
//!
//! The transport does not implement cryptography. AEAD and header
//! protection are supplied by a pluggable backend; this module holds the
//! per-encryption-level cipher slots and performs packet protection and
//! unprotection around the backend primitives.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::trace;

use crate::packet::PacketNumberSpace;
use crate::types::{ConnectionId, PacketNum};

// ============================================================================
// Encryption Levels (RFC 9001 Section 4.1)
// ============================================================================

/// Encryption levels carrying QUIC packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionLevel {
    Initial = 0,
    Handshake = 1,
    EarlyData = 2,
    AppData = 3,
}

impl EncryptionLevel {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }

    /// The packet number space this level's packets live in.
    pub fn pn_space(self) -> PacketNumberSpace {
        match self {
            EncryptionLevel::Initial => PacketNumberSpace::Initial,
            EncryptionLevel::Handshake => PacketNumberSpace::Handshake,
            EncryptionLevel::EarlyData | EncryptionLevel::AppData => {
                PacketNumberSpace::ApplicationData
            }
        }
    }
}

/// Direction of a cipher within a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    Read,
    Write,
}

// ============================================================================
// Backend Traits
// ============================================================================

/// Authenticated encryption for packet payloads.
pub trait Aead {
    /// Encrypt `plaintext` bound to the packet number and header bytes.
    /// Returns ciphertext including the authentication tag.
    fn seal(&self, packet_number: PacketNum, associated_data: &[u8], plaintext: &[u8]) -> Vec<u8>;

    /// Decrypt and authenticate. Returns `None` on authentication failure.
    fn open(
        &self,
        packet_number: PacketNum,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Option<Vec<u8>>;

    /// Authentication tag length added by `seal`.
    fn overhead(&self) -> usize;
}

/// Header protection key (RFC 9001 Section 5.4).
pub trait HeaderKey {
    /// Length of the ciphertext sample the mask is computed from.
    fn sample_len(&self) -> usize;

    /// Compute the 5-byte protection mask from a ciphertext sample.
    fn mask(&self, sample: &[u8]) -> [u8; 5];
}

/// An AEAD together with its matching header-protection key.
pub struct CipherPair {
    pub aead: Box<dyn Aead>,
    pub header: Box<dyn HeaderKey>,
}

/// A secret exported by the TLS machine for one (level, direction).
#[derive(Clone)]
pub struct TlsSecret {
    pub level: EncryptionLevel,
    pub direction: CipherDirection,
    pub secret: Bytes,
}

/// Pluggable cryptographic backend. Implementations perform the QUIC-TLS
/// key schedule (HKDF over the TLS secrets, and the Initial derivation
/// from the client's destination connection ID per RFC 9001 Section 5.2).
pub trait CryptoFactory {
    /// Derive the client's Initial read and write cipher pairs from the
    /// destination connection ID chosen for the first Initial packet.
    fn initial_ciphers(
        &self,
        client_dst_cid: &ConnectionId,
    ) -> Result<(CipherPair, CipherPair), CipherError>;

    /// Derive a cipher pair from a TLS traffic secret.
    fn cipher_from_secret(&self, secret: &TlsSecret) -> Result<CipherPair, CipherError>;
}

// ============================================================================
// Cipher Set
// ============================================================================

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CipherError {
    /// No cipher installed for the requested level and direction.
    #[error("cipher unavailable")]
    CipherUnavailable,

    /// AEAD authentication failed.
    #[error("decrypt failed")]
    DecryptFailed,

    /// A second install at an occupied (level, direction) slot.
    #[error("cipher already installed")]
    AlreadyInstalled,

    /// Packet too short to contain a header-protection sample.
    #[error("packet too short")]
    ShortPacket,

    /// Backend failed to derive key material.
    #[error("key derivation failed")]
    KeyDerivation,
}

#[derive(Default)]
struct LevelSlots {
    read: Option<CipherPair>,
    write: Option<CipherPair>,
}

/// Per-level cipher storage. One read and one write cipher per encryption
/// level; installs are one-shot and ciphers are immutable until the level
/// is discarded.
#[derive(Default)]
pub struct CipherSet {
    levels: [LevelSlots; EncryptionLevel::COUNT],
}

impl CipherSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, level: EncryptionLevel) -> &LevelSlots {
        &self.levels[level.index()]
    }

    fn slot_mut(&mut self, level: EncryptionLevel) -> &mut LevelSlots {
        &mut self.levels[level.index()]
    }

    /// Install a cipher pair. A second install at the same (level,
    /// direction) before a discard is a program error.
    pub fn install(
        &mut self,
        level: EncryptionLevel,
        direction: CipherDirection,
        pair: CipherPair,
    ) -> Result<(), CipherError> {
        let slot = self.slot_mut(level);
        let target = match direction {
            CipherDirection::Read => &mut slot.read,
            CipherDirection::Write => &mut slot.write,
        };
        if target.is_some() {
            return Err(CipherError::AlreadyInstalled);
        }
        trace!(?level, ?direction, "cipher installed");
        *target = Some(pair);
        Ok(())
    }

    pub fn has_read_cipher(&self, level: EncryptionLevel) -> bool {
        self.slot(level).read.is_some()
    }

    pub fn has_write_cipher(&self, level: EncryptionLevel) -> bool {
        self.slot(level).write.is_some()
    }

    /// Drop both directions of a level. Used once 1-RTT keys exist
    /// (Initial) and after the retention window (Handshake).
    pub fn discard(&mut self, level: EncryptionLevel) {
        trace!(?level, "keys discarded");
        let slot = self.slot_mut(level);
        slot.read = None;
        slot.write = None;
    }

    /// AEAD overhead of the write cipher at `level`.
    pub fn write_overhead(&self, level: EncryptionLevel) -> Result<usize, CipherError> {
        let pair = self
            .slot(level)
            .write
            .as_ref()
            .ok_or(CipherError::CipherUnavailable)?;
        Ok(pair.aead.overhead())
    }

    /// Minimum payload (plaintext) size so that the sealed packet contains a
    /// full header-protection sample.
    pub fn min_plaintext_len(
        &self,
        level: EncryptionLevel,
        pn_len: usize,
    ) -> Result<usize, CipherError> {
        let pair = self
            .slot(level)
            .write
            .as_ref()
            .ok_or(CipherError::CipherUnavailable)?;
        let needed = pair.header.sample_len() + 4 - pn_len;
        Ok(needed.saturating_sub(pair.aead.overhead()))
    }

    /// Encrypt in place: `buf` holds the serialized header (through the
    /// truncated packet number at `pn_offset..pn_offset+pn_len`) followed by
    /// the plaintext payload. On return `buf` is the fully protected packet.
    pub fn seal(
        &self,
        level: EncryptionLevel,
        buf: &mut BytesMut,
        pn_offset: usize,
        pn_len: usize,
        packet_number: PacketNum,
    ) -> Result<(), CipherError> {
        let pair = self
            .slot(level)
            .write
            .as_ref()
            .ok_or(CipherError::CipherUnavailable)?;

        let header_len = pn_offset + pn_len;
        let plaintext = buf.split_off(header_len);
        let ciphertext = pair.aead.seal(packet_number, buf, &plaintext);
        buf.extend_from_slice(&ciphertext);

        apply_header_protection(pair.header.as_ref(), buf, pn_offset, pn_len)
    }

    /// Decrypt one packet in place. `packet` spans exactly one QUIC packet;
    /// the header bytes before `pn_offset` are already parsed but the packet
    /// number is still protected. Returns the full packet number and the
    /// decrypted payload.
    pub fn open(
        &self,
        level: EncryptionLevel,
        packet: &mut [u8],
        pn_offset: usize,
        largest_pn: Option<PacketNum>,
    ) -> Result<(PacketNum, Vec<u8>), CipherError> {
        let pair = self
            .slot(level)
            .read
            .as_ref()
            .ok_or(CipherError::CipherUnavailable)?;

        let sample_len = pair.header.sample_len();
        let sample_offset = pn_offset + 4;
        if packet.len() < sample_offset + sample_len {
            return Err(CipherError::ShortPacket);
        }
        let mask = pair
            .header
            .mask(&packet[sample_offset..sample_offset + sample_len]);

        let long = packet[0] & 0x80 != 0;
        packet[0] ^= mask[0] & if long { 0x0f } else { 0x1f };
        let pn_len = (packet[0] & 0x03) as usize + 1;
        if packet.len() < pn_offset + pn_len {
            return Err(CipherError::ShortPacket);
        }

        let mut truncated = 0u64;
        for i in 0..pn_len {
            packet[pn_offset + i] ^= mask[1 + i];
            truncated = (truncated << 8) | packet[pn_offset + i] as u64;
        }
        let packet_number = crate::packet::decode_packet_number(largest_pn, truncated, pn_len);

        let (associated_data, ciphertext) = packet.split_at(pn_offset + pn_len);
        let plaintext = pair
            .aead
            .open(packet_number, associated_data, ciphertext)
            .ok_or(CipherError::DecryptFailed)?;

        Ok((packet_number, plaintext))
    }
}

/// Mask the first byte's low bits and the packet number bytes of a sealed
/// packet (RFC 9001 Section 5.4.1).
fn apply_header_protection(
    header_key: &dyn HeaderKey,
    packet: &mut [u8],
    pn_offset: usize,
    pn_len: usize,
) -> Result<(), CipherError> {
    let sample_len = header_key.sample_len();
    let sample_offset = pn_offset + 4;
    if packet.len() < sample_offset + sample_len {
        return Err(CipherError::ShortPacket);
    }
    let mask = header_key.mask(&packet[sample_offset..sample_offset + sample_len]);

    let long = packet[0] & 0x80 != 0;
    packet[0] ^= mask[0] & if long { 0x0f } else { 0x1f };
    for i in 0..pn_len {
        packet[pn_offset + i] ^= mask[1 + i];
    }
    Ok(())
}

// ============================================================================
// Test Backend
// ============================================================================

/// Keyed transparent ciphers for tests: payloads are XORed with a key byte
/// and authenticated with a key-derived tag, so decryption under the wrong
/// key fails the way a real AEAD does.
#[cfg(test)]
pub mod testing {
    use super::*;

    pub struct XorAead {
        pub key: u8,
    }

    impl Aead for XorAead {
        fn seal(&self, _pn: PacketNum, _ad: &[u8], plaintext: &[u8]) -> Vec<u8> {
            let mut out: Vec<u8> = plaintext.iter().map(|b| b ^ self.key).collect();
            out.extend_from_slice(&[self.key; 16]);
            out
        }

        fn open(&self, _pn: PacketNum, _ad: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
            if ciphertext.len() < 16 {
                return None;
            }
            let (body, tag) = ciphertext.split_at(ciphertext.len() - 16);
            if tag != [self.key; 16] {
                return None;
            }
            Some(body.iter().map(|b| b ^ self.key).collect())
        }

        fn overhead(&self) -> usize {
            16
        }
    }

    pub struct IdentityHeaderKey;

    impl HeaderKey for IdentityHeaderKey {
        fn sample_len(&self) -> usize {
            16
        }

        fn mask(&self, _sample: &[u8]) -> [u8; 5] {
            [0u8; 5]
        }
    }

    pub fn pair(key: u8) -> CipherPair {
        CipherPair {
            aead: Box::new(XorAead { key }),
            header: Box::new(IdentityHeaderKey),
        }
    }

    /// Backend deriving deterministic test ciphers. The Initial key byte is
    /// the first byte of the destination CID; secret-derived keys use the
    /// first byte of the secret.
    pub struct TestCryptoFactory;

    impl CryptoFactory for TestCryptoFactory {
        fn initial_ciphers(
            &self,
            client_dst_cid: &ConnectionId,
        ) -> Result<(CipherPair, CipherPair), CipherError> {
            let key = client_dst_cid.as_bytes().first().copied().unwrap_or(0);
            Ok((pair(key), pair(key)))
        }

        fn cipher_from_secret(&self, secret: &TlsSecret) -> Result<CipherPair, CipherError> {
            let key = secret.secret.first().copied().unwrap_or(0);
            Ok(pair(key))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::packet::{Header, PacketType};
    use crate::types::QUIC_VERSION_1;

    fn cid(fill: u8) -> ConnectionId {
        ConnectionId::from_slice(&[fill; 8]).unwrap()
    }

    #[test]
    fn install_is_one_shot() {
        let mut set = CipherSet::new();
        set.install(EncryptionLevel::Initial, CipherDirection::Read, pair(1))
            .unwrap();
        let err = set
            .install(EncryptionLevel::Initial, CipherDirection::Read, pair(2))
            .unwrap_err();
        assert_eq!(err, CipherError::AlreadyInstalled);
        // The write slot at the same level is independent.
        set.install(EncryptionLevel::Initial, CipherDirection::Write, pair(1))
            .unwrap();
    }

    #[test]
    fn discard_empties_both_directions() {
        let mut set = CipherSet::new();
        set.install(EncryptionLevel::Initial, CipherDirection::Read, pair(1))
            .unwrap();
        set.install(EncryptionLevel::Initial, CipherDirection::Write, pair(1))
            .unwrap();
        set.discard(EncryptionLevel::Initial);
        assert!(!set.has_read_cipher(EncryptionLevel::Initial));
        assert!(!set.has_write_cipher(EncryptionLevel::Initial));
        // Reinstall after discard is allowed (Retry restarts Initial keys).
        set.install(EncryptionLevel::Initial, CipherDirection::Read, pair(3))
            .unwrap();
    }

    #[test]
    fn seal_open_round_trip() {
        let mut set = CipherSet::new();
        set.install(EncryptionLevel::Handshake, CipherDirection::Write, pair(7))
            .unwrap();
        set.install(EncryptionLevel::Handshake, CipherDirection::Read, pair(7))
            .unwrap();

        let mut header = Header::long(
            PacketType::Handshake,
            QUIC_VERSION_1,
            cid(1),
            cid(2),
            42,
            2,
        );
        let payload = b"crypto frame bytes padded out to sample size....";
        header.payload_len = Some(2 + payload.len() as u64 + 16);

        let mut buf = bytes::BytesMut::new();
        let pn_offset = header.encode(&mut buf);
        buf.extend_from_slice(payload);
        set.seal(EncryptionLevel::Handshake, &mut buf, pn_offset, 2, 42)
            .unwrap();

        let mut packet = buf.to_vec();
        let (pn, plaintext) = set
            .open(EncryptionLevel::Handshake, &mut packet, pn_offset, Some(41))
            .unwrap();
        assert_eq!(pn, 42);
        assert_eq!(plaintext, payload);
    }

    #[test]
    fn wrong_key_fails_open() {
        let mut sender = CipherSet::new();
        sender
            .install(EncryptionLevel::AppData, CipherDirection::Write, pair(9))
            .unwrap();
        let mut receiver = CipherSet::new();
        receiver
            .install(EncryptionLevel::AppData, CipherDirection::Read, pair(5))
            .unwrap();

        let header = Header::short(cid(1), 3, 1, false);
        let mut buf = bytes::BytesMut::new();
        let pn_offset = header.encode(&mut buf);
        buf.extend_from_slice(b"twenty bytes of data....");
        sender
            .seal(EncryptionLevel::AppData, &mut buf, pn_offset, 1, 3)
            .unwrap();

        let mut packet = buf.to_vec();
        let err = receiver
            .open(EncryptionLevel::AppData, &mut packet, pn_offset, None)
            .unwrap_err();
        assert_eq!(err, CipherError::DecryptFailed);
    }

    #[test]
    fn open_without_cipher_is_unavailable() {
        let set = CipherSet::new();
        let mut packet = vec![0x40; 64];
        let err = set
            .open(EncryptionLevel::AppData, &mut packet, 9, None)
            .unwrap_err();
        assert_eq!(err, CipherError::CipherUnavailable);
    }
}
