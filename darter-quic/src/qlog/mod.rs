//! # Structured Protocol Events
//!
//! Every processed or emitted packet produces a structured record for
//! diagnostics. Emission is fire-and-forget through the [`QLogger`] trait;
//! the sink (file writer, ring buffer, network exporter) lives outside the
//! core.

use serde::Serialize;

use crate::frames::Frame;
use crate::packet::{Header, PacketType};

/// Packet type label used for short-header records.
pub const SHORT_HEADER_PACKET_TYPE: &str = "1RTT";
/// Packet type label for version-negotiation records.
pub const VERSION_NEGOTIATION_PACKET_TYPE: &str = "VersionNegotiation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QLogEventType {
    PacketSent,
    PacketReceived,
}

/// One per-frame record with type-specific fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "frame_type")]
pub enum FrameLog {
    Padding {
        num_frames: u64,
    },
    Ping,
    Ack {
        ack_blocks: Vec<(u64, u64)>,
        ack_delay_us: u64,
    },
    RstStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    Crypto {
        offset: u64,
        len: u64,
    },
    NewToken {
        token_len: u64,
    },
    Stream {
        stream_id: u64,
        offset: u64,
        len: u64,
        fin: bool,
    },
    MaxData {
        maximum_data: u64,
    },
    MaxStreamData {
        stream_id: u64,
        maximum_data: u64,
    },
    MaxStreams {
        max_streams: u64,
        is_bidirectional: bool,
    },
    DataBlocked {
        data_limit: u64,
    },
    StreamDataBlocked {
        stream_id: u64,
        data_limit: u64,
    },
    StreamsBlocked {
        stream_limit: u64,
        is_bidirectional: bool,
    },
    NewConnectionId {
        sequence: u64,
        token: String,
    },
    RetireConnectionId {
        sequence: u64,
    },
    PathChallenge {
        path_data: String,
    },
    PathResponse {
        path_data: String,
    },
    ConnectionClose {
        error_code: u64,
        reason_phrase: String,
        closing_frame_type: u64,
    },
    ApplicationClose {
        error_code: u64,
        reason_phrase: String,
    },
    HandshakeDone,
    MinStreamData {
        stream_id: u64,
        maximum_data: u64,
        minimum_stream_offset: u64,
    },
    ExpiredStreamData {
        stream_id: u64,
        minimum_stream_offset: u64,
    },
}

/// Structured record for one regular packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QLogPacketEvent {
    /// Microseconds since connection start.
    pub ref_time_us: u64,
    pub event_type: QLogEventType,
    pub packet_type: String,
    /// Absent for Retry packets, which carry no packet number.
    pub packet_number: Option<u64>,
    pub packet_size: u64,
    pub frames: Vec<FrameLog>,
}

/// Structured record for a version-negotiation packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QLogVersionNegotiationEvent {
    pub ref_time_us: u64,
    pub event_type: QLogEventType,
    pub packet_type: String,
    pub packet_size: u64,
    pub versions: Vec<u32>,
}

/// Fire-and-forget event sink.
pub trait QLogger {
    fn add_packet_event(&self, event: QLogPacketEvent);
    fn add_version_negotiation_event(&self, event: QLogVersionNegotiationEvent);
}

fn packet_type_label(packet_type: PacketType) -> &'static str {
    match packet_type {
        PacketType::Initial => "Initial",
        PacketType::ZeroRtt => "ZeroRtt",
        PacketType::Handshake => "Handshake",
        PacketType::Retry => "Retry",
        PacketType::VersionNegotiation => VERSION_NEGOTIATION_PACKET_TYPE,
        PacketType::OneRtt => SHORT_HEADER_PACKET_TYPE,
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Build the structured record for one regular packet. PADDING frames in
/// the packet are coalesced into a single record with a count.
pub fn create_packet_event(
    ref_time_us: u64,
    event_type: QLogEventType,
    header: &Header,
    packet_size: u64,
    frames: &[Frame<'_>],
) -> QLogPacketEvent {
    let packet_number = if header.packet_type == PacketType::Retry {
        // A Retry packet does not include a packet number.
        None
    } else {
        header.packet_number
    };

    let mut num_padding_frames = 0u64;
    let mut frame_logs = Vec::with_capacity(frames.len());
    for frame in frames {
        match frame {
            Frame::Padding { count } => num_padding_frames += count,
            Frame::Ping => frame_logs.push(FrameLog::Ping),
            Frame::Ack(f) => frame_logs.push(FrameLog::Ack {
                ack_blocks: f.blocks(),
                ack_delay_us: f.ack_delay_us,
            }),
            Frame::ResetStream(f) => frame_logs.push(FrameLog::RstStream {
                stream_id: f.stream_id.0,
                error_code: f.error_code,
                final_size: f.final_size,
            }),
            Frame::StopSending(f) => frame_logs.push(FrameLog::StopSending {
                stream_id: f.stream_id.0,
                error_code: f.error_code,
            }),
            Frame::Crypto(f) => frame_logs.push(FrameLog::Crypto {
                offset: f.offset,
                len: f.data.len() as u64,
            }),
            Frame::NewToken(f) => frame_logs.push(FrameLog::NewToken {
                token_len: f.token.len() as u64,
            }),
            Frame::Stream(f) => frame_logs.push(FrameLog::Stream {
                stream_id: f.stream_id.0,
                offset: f.offset,
                len: f.data.len() as u64,
                fin: f.fin,
            }),
            Frame::MaxData(f) => frame_logs.push(FrameLog::MaxData {
                maximum_data: f.maximum_data,
            }),
            Frame::MaxStreamData(f) => frame_logs.push(FrameLog::MaxStreamData {
                stream_id: f.stream_id.0,
                maximum_data: f.maximum_data,
            }),
            Frame::MaxStreams(f) => frame_logs.push(FrameLog::MaxStreams {
                max_streams: f.maximum_streams,
                is_bidirectional: f.bidirectional,
            }),
            Frame::DataBlocked(f) => frame_logs.push(FrameLog::DataBlocked {
                data_limit: f.data_limit,
            }),
            Frame::StreamDataBlocked(f) => frame_logs.push(FrameLog::StreamDataBlocked {
                stream_id: f.stream_id.0,
                data_limit: f.data_limit,
            }),
            Frame::StreamsBlocked(f) => frame_logs.push(FrameLog::StreamsBlocked {
                stream_limit: f.stream_limit,
                is_bidirectional: f.bidirectional,
            }),
            Frame::NewConnectionId(f) => frame_logs.push(FrameLog::NewConnectionId {
                sequence: f.sequence,
                token: hex(&f.stateless_reset_token),
            }),
            Frame::RetireConnectionId(f) => {
                frame_logs.push(FrameLog::RetireConnectionId { sequence: f.sequence })
            }
            Frame::PathChallenge(f) => frame_logs.push(FrameLog::PathChallenge {
                path_data: hex(&f.data),
            }),
            Frame::PathResponse(f) => frame_logs.push(FrameLog::PathResponse {
                path_data: hex(&f.data),
            }),
            Frame::ConnectionClose(f) => frame_logs.push(FrameLog::ConnectionClose {
                error_code: f.error_code,
                reason_phrase: String::from_utf8_lossy(&f.reason).into_owned(),
                closing_frame_type: f.closing_frame_type,
            }),
            Frame::ApplicationClose(f) => frame_logs.push(FrameLog::ApplicationClose {
                error_code: f.error_code,
                reason_phrase: String::from_utf8_lossy(&f.reason).into_owned(),
            }),
            Frame::HandshakeDone => frame_logs.push(FrameLog::HandshakeDone),
            Frame::MinStreamData(f) => frame_logs.push(FrameLog::MinStreamData {
                stream_id: f.stream_id.0,
                maximum_data: f.maximum_data,
                minimum_stream_offset: f.minimum_stream_offset,
            }),
            Frame::ExpiredStreamData(f) => frame_logs.push(FrameLog::ExpiredStreamData {
                stream_id: f.stream_id.0,
                minimum_stream_offset: f.minimum_stream_offset,
            }),
        }
    }
    if num_padding_frames > 0 {
        frame_logs.push(FrameLog::Padding {
            num_frames: num_padding_frames,
        });
    }

    QLogPacketEvent {
        ref_time_us,
        event_type,
        packet_type: packet_type_label(header.packet_type).to_string(),
        packet_number,
        packet_size,
        frames: frame_logs,
    }
}

/// Build the structured record for a version-negotiation packet.
pub fn create_version_negotiation_event(
    ref_time_us: u64,
    event_type: QLogEventType,
    packet_size: u64,
    versions: &[u32],
) -> QLogVersionNegotiationEvent {
    QLogVersionNegotiationEvent {
        ref_time_us,
        event_type,
        packet_type: VERSION_NEGOTIATION_PACKET_TYPE.to_string(),
        packet_size,
        versions: versions.to_vec(),
    }
}
