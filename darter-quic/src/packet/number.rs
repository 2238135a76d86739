//! Packet number truncation and expansion (RFC 9000 Appendix A).

use crate::types::PacketNum;

/// Number of bytes needed to encode `pn` given the largest acknowledged
/// packet number (RFC 9000 Section 17.1).
pub fn packet_number_len(pn: PacketNum, largest_acked: Option<PacketNum>) -> usize {
    let num_unacked = match largest_acked {
        Some(acked) => pn.saturating_sub(acked),
        None => pn + 1,
    };
    let range = num_unacked * 2;
    if range < (1 << 8) {
        1
    } else if range < (1 << 16) {
        2
    } else if range < (1 << 24) {
        3
    } else {
        4
    }
}

/// Truncate `pn` to `len` bytes for the wire.
pub fn encode_packet_number(pn: PacketNum, len: usize) -> u32 {
    debug_assert!((1..=4).contains(&len));
    (pn & ((1u64 << (len * 8)) - 1)) as u32
}

/// Expand a truncated packet number against the largest received packet
/// number (RFC 9000 Appendix A.3).
pub fn decode_packet_number(largest: Option<PacketNum>, truncated: u64, len: usize) -> PacketNum {
    let expected = largest.map(|l| l + 1).unwrap_or(0);
    let win = 1u64 << (len * 8);
    let hwin = win / 2;
    let mask = win - 1;
    let candidate = (expected & !mask) | truncated;
    if candidate + hwin <= expected && candidate + win < (1u64 << 62) {
        candidate + win
    } else if candidate > expected + hwin && candidate >= win {
        candidate - win
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_appendix_a_example() {
        // RFC 9000 A.3: largest 0xa82f30ea, truncated 0x9b32 in 2 bytes
        assert_eq!(
            decode_packet_number(Some(0xa82f30ea), 0x9b32, 2),
            0xa82f9b32
        );
    }

    #[test]
    fn first_packet() {
        assert_eq!(decode_packet_number(None, 0, 1), 0);
        assert_eq!(decode_packet_number(None, 5, 1), 5);
    }

    #[test]
    fn truncate_and_expand() {
        for pn in [0u64, 1, 255, 256, 65535, 1 << 20, (1 << 30) + 12345] {
            let largest = pn.checked_sub(1);
            let len = packet_number_len(pn, largest);
            let truncated = encode_packet_number(pn, len) as u64;
            assert_eq!(decode_packet_number(largest, truncated, len), pn);
        }
    }
}
