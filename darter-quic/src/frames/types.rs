//! Frame type definitions (RFC 9000 Section 19, plus the experimental
//! partial-reliability pair).

use bytes::Bytes;
use tinyvec::TinyVec;

use crate::types::{ConnectionId, PacketNum, StreamId, VarInt};

/// Frame type identifiers (RFC 9000 Section 19).
pub const FRAME_TYPE_PADDING: u64 = 0x00;
pub const FRAME_TYPE_PING: u64 = 0x01;
pub const FRAME_TYPE_ACK: u64 = 0x02;
pub const FRAME_TYPE_ACK_ECN: u64 = 0x03;
pub const FRAME_TYPE_RESET_STREAM: u64 = 0x04;
pub const FRAME_TYPE_STOP_SENDING: u64 = 0x05;
pub const FRAME_TYPE_CRYPTO: u64 = 0x06;
pub const FRAME_TYPE_NEW_TOKEN: u64 = 0x07;
pub const FRAME_TYPE_STREAM_BASE: u64 = 0x08; // 0x08-0x0f
pub const FRAME_TYPE_MAX_DATA: u64 = 0x10;
pub const FRAME_TYPE_MAX_STREAM_DATA: u64 = 0x11;
pub const FRAME_TYPE_MAX_STREAMS_BIDI: u64 = 0x12;
pub const FRAME_TYPE_MAX_STREAMS_UNI: u64 = 0x13;
pub const FRAME_TYPE_DATA_BLOCKED: u64 = 0x14;
pub const FRAME_TYPE_STREAM_DATA_BLOCKED: u64 = 0x15;
pub const FRAME_TYPE_STREAMS_BLOCKED_BIDI: u64 = 0x16;
pub const FRAME_TYPE_STREAMS_BLOCKED_UNI: u64 = 0x17;
pub const FRAME_TYPE_NEW_CONNECTION_ID: u64 = 0x18;
pub const FRAME_TYPE_RETIRE_CONNECTION_ID: u64 = 0x19;
pub const FRAME_TYPE_PATH_CHALLENGE: u64 = 0x1a;
pub const FRAME_TYPE_PATH_RESPONSE: u64 = 0x1b;
pub const FRAME_TYPE_CONNECTION_CLOSE: u64 = 0x1c;
pub const FRAME_TYPE_APPLICATION_CLOSE: u64 = 0x1d;
pub const FRAME_TYPE_HANDSHAKE_DONE: u64 = 0x1e;

/// Experimental partial-reliability frames (draft extension space).
pub const FRAME_TYPE_MIN_STREAM_DATA: u64 = 0xfe;
pub const FRAME_TYPE_EXPIRED_STREAM_DATA: u64 = 0xff;

/// STREAM frame flag bits encoded in the type byte (0x08-0x0f).
pub const STREAM_FRAME_BIT_FIN: u64 = 0x01;
pub const STREAM_FRAME_BIT_LEN: u64 = 0x02;
pub const STREAM_FRAME_BIT_OFF: u64 = 0x04;

/// ACK Range: a gap of unacknowledged packets followed by a run of
/// acknowledged ones (RFC 9000 Section 19.3.1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckRange {
    pub gap: VarInt,
    pub length: VarInt,
}

/// ECN counters reported in ACK_ECN frames (RFC 9000 Section 19.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: VarInt,
    pub ect1: VarInt,
    pub ce: VarInt,
}

/// ACK frame (RFC 9000 Section 19.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    /// Largest packet number acknowledged.
    pub largest_acked: PacketNum,
    /// Raw ack delay in microseconds, already scaled by the ack delay
    /// exponent on the read path.
    pub ack_delay_us: VarInt,
    /// Packets acknowledged contiguously below `largest_acked`.
    pub first_ack_range: VarInt,
    /// Additional (gap, length) pairs, descending.
    pub ack_ranges: TinyVec<[AckRange; 8]>,
    /// Present only in ACK_ECN frames.
    pub ecn: Option<EcnCounts>,
}

impl AckFrame {
    /// Iterate the acknowledged packet-number blocks as inclusive
    /// (start, end) pairs, largest first.
    pub fn blocks(&self) -> Vec<(PacketNum, PacketNum)> {
        let mut blocks = Vec::with_capacity(1 + self.ack_ranges.len());
        let mut end = self.largest_acked;
        let mut start = end.saturating_sub(self.first_ack_range);
        blocks.push((start, end));
        for range in &self.ack_ranges {
            // gap encodes the unacked run minus two
            if start < range.gap + 2 {
                break;
            }
            end = start - range.gap - 2;
            start = end.saturating_sub(range.length);
            blocks.push((start, end));
        }
        blocks
    }
}

/// RESET_STREAM frame (RFC 9000 Section 19.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStreamFrame {
    pub stream_id: StreamId,
    pub error_code: VarInt,
    pub final_size: VarInt,
}

/// STOP_SENDING frame (RFC 9000 Section 19.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSendingFrame {
    pub stream_id: StreamId,
    pub error_code: VarInt,
}

/// CRYPTO frame (RFC 9000 Section 19.6). Data borrows from the packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame<'a> {
    pub offset: VarInt,
    pub data: &'a [u8],
}

/// NEW_TOKEN frame (RFC 9000 Section 19.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTokenFrame {
    pub token: Bytes,
}

/// STREAM frame (RFC 9000 Section 19.8). Data borrows from the packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame<'a> {
    pub stream_id: StreamId,
    pub offset: VarInt,
    pub fin: bool,
    pub data: &'a [u8],
}

/// MAX_DATA frame (RFC 9000 Section 19.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxDataFrame {
    pub maximum_data: VarInt,
}

/// MAX_STREAM_DATA frame (RFC 9000 Section 19.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamDataFrame {
    pub stream_id: StreamId,
    pub maximum_data: VarInt,
}

/// MAX_STREAMS frame (RFC 9000 Section 19.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamsFrame {
    pub maximum_streams: VarInt,
    pub bidirectional: bool,
}

/// DATA_BLOCKED frame (RFC 9000 Section 19.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlockedFrame {
    pub data_limit: VarInt,
}

/// STREAM_DATA_BLOCKED frame (RFC 9000 Section 19.13).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataBlockedFrame {
    pub stream_id: StreamId,
    pub data_limit: VarInt,
}

/// STREAMS_BLOCKED frame (RFC 9000 Section 19.14).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamsBlockedFrame {
    pub stream_limit: VarInt,
    pub bidirectional: bool,
}

/// NEW_CONNECTION_ID frame (RFC 9000 Section 19.15).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionIdFrame {
    pub sequence: VarInt,
    pub retire_prior_to: VarInt,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: [u8; 16],
}

/// RETIRE_CONNECTION_ID frame (RFC 9000 Section 19.16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetireConnectionIdFrame {
    pub sequence: VarInt,
}

/// PATH_CHALLENGE frame (RFC 9000 Section 19.17).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathChallengeFrame {
    pub data: [u8; 8],
}

/// PATH_RESPONSE frame (RFC 9000 Section 19.18).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathResponseFrame {
    pub data: [u8; 8],
}

/// CONNECTION_CLOSE frame, transport variant 0x1c (RFC 9000 Section 19.19).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    pub error_code: VarInt,
    /// Frame type that triggered the close, zero when unknown.
    pub closing_frame_type: VarInt,
    pub reason: Bytes,
}

/// APPLICATION_CLOSE frame, variant 0x1d (RFC 9000 Section 19.19).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationCloseFrame {
    pub error_code: VarInt,
    pub reason: Bytes,
}

/// MIN_STREAM_DATA frame (experimental partial reliability): the receiver
/// asks the sender to advance its minimum retransmittable offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinStreamDataFrame {
    pub stream_id: StreamId,
    pub maximum_data: VarInt,
    pub minimum_stream_offset: VarInt,
}

/// EXPIRED_STREAM_DATA frame (experimental partial reliability): the sender
/// declares data below the offset abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredStreamDataFrame {
    pub stream_id: StreamId,
    pub minimum_stream_offset: VarInt,
}

/// Unified frame type - discriminated union over all handled frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    /// A run of PADDING bytes, coalesced with its length.
    Padding { count: u64 },
    Ping,
    Ack(AckFrame),
    ResetStream(ResetStreamFrame),
    StopSending(StopSendingFrame),
    Crypto(CryptoFrame<'a>),
    NewToken(NewTokenFrame),
    Stream(StreamFrame<'a>),
    MaxData(MaxDataFrame),
    MaxStreamData(MaxStreamDataFrame),
    MaxStreams(MaxStreamsFrame),
    DataBlocked(DataBlockedFrame),
    StreamDataBlocked(StreamDataBlockedFrame),
    StreamsBlocked(StreamsBlockedFrame),
    NewConnectionId(NewConnectionIdFrame),
    RetireConnectionId(RetireConnectionIdFrame),
    PathChallenge(PathChallengeFrame),
    PathResponse(PathResponseFrame),
    ConnectionClose(ConnectionCloseFrame),
    ApplicationClose(ApplicationCloseFrame),
    HandshakeDone,
    MinStreamData(MinStreamDataFrame),
    ExpiredStreamData(ExpiredStreamDataFrame),
}

impl<'a> Frame<'a> {
    /// ACK-eliciting frames require the peer to acknowledge the packet
    /// (RFC 9000 Section 13.2).
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding { .. }
                | Frame::Ack(_)
                | Frame::ConnectionClose(_)
                | Frame::ApplicationClose(_)
        )
    }

    /// Frames whose loss requires retransmission of their content.
    pub fn is_retransmittable(&self) -> bool {
        self.is_ack_eliciting()
    }
}
