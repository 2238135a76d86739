//! Frame serialization into caller-provided buffers.

use bytes::BufMut;

use super::types::*;
use crate::types::{varint_size, write_varint};

/// Serialize a frame into `buf`.
///
/// `Frame::Padding { count }` writes `count` zero bytes.
pub fn encode_frame<B: BufMut>(frame: &Frame<'_>, buf: &mut B) {
    match frame {
        Frame::Padding { count } => {
            for _ in 0..*count {
                buf.put_u8(0x00);
            }
        }

        Frame::Ping => write_varint(buf, FRAME_TYPE_PING),

        Frame::Ack(ack) => {
            let ty = if ack.ecn.is_some() {
                FRAME_TYPE_ACK_ECN
            } else {
                FRAME_TYPE_ACK
            };
            write_varint(buf, ty);
            write_varint(buf, ack.largest_acked);
            write_varint(buf, ack.ack_delay_us);
            write_varint(buf, ack.ack_ranges.len() as u64);
            write_varint(buf, ack.first_ack_range);
            for range in &ack.ack_ranges {
                write_varint(buf, range.gap);
                write_varint(buf, range.length);
            }
            if let Some(ecn) = &ack.ecn {
                write_varint(buf, ecn.ect0);
                write_varint(buf, ecn.ect1);
                write_varint(buf, ecn.ce);
            }
        }

        Frame::ResetStream(f) => {
            write_varint(buf, FRAME_TYPE_RESET_STREAM);
            write_varint(buf, f.stream_id.0);
            write_varint(buf, f.error_code);
            write_varint(buf, f.final_size);
        }

        Frame::StopSending(f) => {
            write_varint(buf, FRAME_TYPE_STOP_SENDING);
            write_varint(buf, f.stream_id.0);
            write_varint(buf, f.error_code);
        }

        Frame::Crypto(f) => {
            write_varint(buf, FRAME_TYPE_CRYPTO);
            write_varint(buf, f.offset);
            write_varint(buf, f.data.len() as u64);
            buf.put_slice(f.data);
        }

        Frame::NewToken(f) => {
            write_varint(buf, FRAME_TYPE_NEW_TOKEN);
            write_varint(buf, f.token.len() as u64);
            buf.put_slice(&f.token);
        }

        Frame::Stream(f) => {
            // Always encode with explicit length and offset-when-nonzero so
            // frames can be packed after one another.
            let mut ty = FRAME_TYPE_STREAM_BASE | STREAM_FRAME_BIT_LEN;
            if f.offset != 0 {
                ty |= STREAM_FRAME_BIT_OFF;
            }
            if f.fin {
                ty |= STREAM_FRAME_BIT_FIN;
            }
            write_varint(buf, ty);
            write_varint(buf, f.stream_id.0);
            if f.offset != 0 {
                write_varint(buf, f.offset);
            }
            write_varint(buf, f.data.len() as u64);
            buf.put_slice(f.data);
        }

        Frame::MaxData(f) => {
            write_varint(buf, FRAME_TYPE_MAX_DATA);
            write_varint(buf, f.maximum_data);
        }

        Frame::MaxStreamData(f) => {
            write_varint(buf, FRAME_TYPE_MAX_STREAM_DATA);
            write_varint(buf, f.stream_id.0);
            write_varint(buf, f.maximum_data);
        }

        Frame::MaxStreams(f) => {
            let ty = if f.bidirectional {
                FRAME_TYPE_MAX_STREAMS_BIDI
            } else {
                FRAME_TYPE_MAX_STREAMS_UNI
            };
            write_varint(buf, ty);
            write_varint(buf, f.maximum_streams);
        }

        Frame::DataBlocked(f) => {
            write_varint(buf, FRAME_TYPE_DATA_BLOCKED);
            write_varint(buf, f.data_limit);
        }

        Frame::StreamDataBlocked(f) => {
            write_varint(buf, FRAME_TYPE_STREAM_DATA_BLOCKED);
            write_varint(buf, f.stream_id.0);
            write_varint(buf, f.data_limit);
        }

        Frame::StreamsBlocked(f) => {
            let ty = if f.bidirectional {
                FRAME_TYPE_STREAMS_BLOCKED_BIDI
            } else {
                FRAME_TYPE_STREAMS_BLOCKED_UNI
            };
            write_varint(buf, ty);
            write_varint(buf, f.stream_limit);
        }

        Frame::NewConnectionId(f) => {
            write_varint(buf, FRAME_TYPE_NEW_CONNECTION_ID);
            write_varint(buf, f.sequence);
            write_varint(buf, f.retire_prior_to);
            buf.put_u8(f.connection_id.len() as u8);
            buf.put_slice(f.connection_id.as_bytes());
            buf.put_slice(&f.stateless_reset_token);
        }

        Frame::RetireConnectionId(f) => {
            write_varint(buf, FRAME_TYPE_RETIRE_CONNECTION_ID);
            write_varint(buf, f.sequence);
        }

        Frame::PathChallenge(f) => {
            write_varint(buf, FRAME_TYPE_PATH_CHALLENGE);
            buf.put_slice(&f.data);
        }

        Frame::PathResponse(f) => {
            write_varint(buf, FRAME_TYPE_PATH_RESPONSE);
            buf.put_slice(&f.data);
        }

        Frame::ConnectionClose(f) => {
            write_varint(buf, FRAME_TYPE_CONNECTION_CLOSE);
            write_varint(buf, f.error_code);
            write_varint(buf, f.closing_frame_type);
            write_varint(buf, f.reason.len() as u64);
            buf.put_slice(&f.reason);
        }

        Frame::ApplicationClose(f) => {
            write_varint(buf, FRAME_TYPE_APPLICATION_CLOSE);
            write_varint(buf, f.error_code);
            write_varint(buf, f.reason.len() as u64);
            buf.put_slice(&f.reason);
        }

        Frame::HandshakeDone => write_varint(buf, FRAME_TYPE_HANDSHAKE_DONE),

        Frame::MinStreamData(f) => {
            write_varint(buf, FRAME_TYPE_MIN_STREAM_DATA);
            write_varint(buf, f.stream_id.0);
            write_varint(buf, f.maximum_data);
            write_varint(buf, f.minimum_stream_offset);
        }

        Frame::ExpiredStreamData(f) => {
            write_varint(buf, FRAME_TYPE_EXPIRED_STREAM_DATA);
            write_varint(buf, f.stream_id.0);
            write_varint(buf, f.minimum_stream_offset);
        }
    }
}

/// Serialized size of a frame, matching [`encode_frame`].
pub fn encoded_size(frame: &Frame<'_>) -> usize {
    match frame {
        Frame::Padding { count } => *count as usize,
        Frame::Ping | Frame::HandshakeDone => 1,
        Frame::Ack(ack) => {
            let mut size = varint_size(if ack.ecn.is_some() {
                FRAME_TYPE_ACK_ECN
            } else {
                FRAME_TYPE_ACK
            });
            size += varint_size(ack.largest_acked);
            size += varint_size(ack.ack_delay_us);
            size += varint_size(ack.ack_ranges.len() as u64);
            size += varint_size(ack.first_ack_range);
            for range in &ack.ack_ranges {
                size += varint_size(range.gap) + varint_size(range.length);
            }
            if let Some(ecn) = &ack.ecn {
                size += varint_size(ecn.ect0) + varint_size(ecn.ect1) + varint_size(ecn.ce);
            }
            size
        }
        Frame::ResetStream(f) => {
            varint_size(FRAME_TYPE_RESET_STREAM)
                + varint_size(f.stream_id.0)
                + varint_size(f.error_code)
                + varint_size(f.final_size)
        }
        Frame::StopSending(f) => {
            varint_size(FRAME_TYPE_STOP_SENDING)
                + varint_size(f.stream_id.0)
                + varint_size(f.error_code)
        }
        Frame::Crypto(f) => {
            varint_size(FRAME_TYPE_CRYPTO)
                + varint_size(f.offset)
                + varint_size(f.data.len() as u64)
                + f.data.len()
        }
        Frame::NewToken(f) => {
            varint_size(FRAME_TYPE_NEW_TOKEN) + varint_size(f.token.len() as u64) + f.token.len()
        }
        Frame::Stream(f) => {
            let mut size = varint_size(FRAME_TYPE_STREAM_BASE) + varint_size(f.stream_id.0);
            if f.offset != 0 {
                size += varint_size(f.offset);
            }
            size + varint_size(f.data.len() as u64) + f.data.len()
        }
        Frame::MaxData(f) => varint_size(FRAME_TYPE_MAX_DATA) + varint_size(f.maximum_data),
        Frame::MaxStreamData(f) => {
            varint_size(FRAME_TYPE_MAX_STREAM_DATA)
                + varint_size(f.stream_id.0)
                + varint_size(f.maximum_data)
        }
        Frame::MaxStreams(f) => {
            varint_size(FRAME_TYPE_MAX_STREAMS_BIDI) + varint_size(f.maximum_streams)
        }
        Frame::DataBlocked(f) => varint_size(FRAME_TYPE_DATA_BLOCKED) + varint_size(f.data_limit),
        Frame::StreamDataBlocked(f) => {
            varint_size(FRAME_TYPE_STREAM_DATA_BLOCKED)
                + varint_size(f.stream_id.0)
                + varint_size(f.data_limit)
        }
        Frame::StreamsBlocked(f) => {
            varint_size(FRAME_TYPE_STREAMS_BLOCKED_BIDI) + varint_size(f.stream_limit)
        }
        Frame::NewConnectionId(f) => {
            varint_size(FRAME_TYPE_NEW_CONNECTION_ID)
                + varint_size(f.sequence)
                + varint_size(f.retire_prior_to)
                + 1
                + f.connection_id.len()
                + 16
        }
        Frame::RetireConnectionId(f) => {
            varint_size(FRAME_TYPE_RETIRE_CONNECTION_ID) + varint_size(f.sequence)
        }
        Frame::PathChallenge(_) | Frame::PathResponse(_) => 1 + 8,
        Frame::ConnectionClose(f) => {
            varint_size(FRAME_TYPE_CONNECTION_CLOSE)
                + varint_size(f.error_code)
                + varint_size(f.closing_frame_type)
                + varint_size(f.reason.len() as u64)
                + f.reason.len()
        }
        Frame::ApplicationClose(f) => {
            varint_size(FRAME_TYPE_APPLICATION_CLOSE)
                + varint_size(f.error_code)
                + varint_size(f.reason.len() as u64)
                + f.reason.len()
        }
        Frame::MinStreamData(f) => {
            2 + varint_size(f.stream_id.0)
                + varint_size(f.maximum_data)
                + varint_size(f.minimum_stream_offset)
        }
        Frame::ExpiredStreamData(f) => {
            2 + varint_size(f.stream_id.0) + varint_size(f.minimum_stream_offset)
        }
    }
}
