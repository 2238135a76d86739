//! Zero-copy frame parsing (RFC 9000 Section 12.4).

use bytes::Bytes;
use tinyvec::TinyVec;

use super::types::*;
use crate::error::{QuicError, Result, TransportErrorCode};
use crate::types::{decode_varint, ConnectionId, StreamId};

fn malformed(what: &str) -> QuicError {
    QuicError::transport(TransportErrorCode::FrameEncodingError, what.to_string())
}

/// Cursor over a frame buffer tracking the consumed offset.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn varint(&mut self, what: &str) -> Result<u64> {
        let (value, consumed) =
            decode_varint(&self.buf[self.pos..]).ok_or_else(|| malformed(what))?;
        self.pos += consumed;
        Ok(value)
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            return Err(malformed(what));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let slice = self.take(N, what)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

/// Parse a single frame from the front of `buf`.
///
/// Returns the frame and the number of bytes consumed. Consecutive PADDING
/// bytes are coalesced into a single `Frame::Padding` with a count.
pub fn parse_frame(buf: &[u8]) -> Result<(Frame<'_>, usize)> {
    let mut reader = Reader::new(buf);
    let frame_type = reader.varint("frame type")?;

    if frame_type == FRAME_TYPE_PADDING {
        let mut count = 1u64;
        while reader.pos < buf.len() && buf[reader.pos] == 0x00 {
            reader.pos += 1;
            count += 1;
        }
        return Ok((Frame::Padding { count }, reader.pos));
    }

    let frame = match frame_type {
        FRAME_TYPE_PING => Frame::Ping,

        FRAME_TYPE_ACK | FRAME_TYPE_ACK_ECN => {
            let largest_acked = reader.varint("ack largest")?;
            let ack_delay_us = reader.varint("ack delay")?;
            let range_count = reader.varint("ack range count")?;
            let first_ack_range = reader.varint("ack first range")?;
            let mut ack_ranges: TinyVec<[AckRange; 8]> = TinyVec::default();
            for _ in 0..range_count {
                let gap = reader.varint("ack gap")?;
                let length = reader.varint("ack range length")?;
                ack_ranges.push(AckRange { gap, length });
            }
            let ecn = if frame_type == FRAME_TYPE_ACK_ECN {
                Some(EcnCounts {
                    ect0: reader.varint("ect0")?,
                    ect1: reader.varint("ect1")?,
                    ce: reader.varint("ce")?,
                })
            } else {
                None
            };
            Frame::Ack(AckFrame {
                largest_acked,
                ack_delay_us,
                first_ack_range,
                ack_ranges,
                ecn,
            })
        }

        FRAME_TYPE_RESET_STREAM => Frame::ResetStream(ResetStreamFrame {
            stream_id: StreamId(reader.varint("stream id")?),
            error_code: reader.varint("error code")?,
            final_size: reader.varint("final size")?,
        }),

        FRAME_TYPE_STOP_SENDING => Frame::StopSending(StopSendingFrame {
            stream_id: StreamId(reader.varint("stream id")?),
            error_code: reader.varint("error code")?,
        }),

        FRAME_TYPE_CRYPTO => {
            let offset = reader.varint("crypto offset")?;
            let length = reader.varint("crypto length")? as usize;
            let data = reader.take(length, "crypto data")?;
            Frame::Crypto(CryptoFrame { offset, data })
        }

        FRAME_TYPE_NEW_TOKEN => {
            let length = reader.varint("token length")? as usize;
            let token = reader.take(length, "token")?;
            Frame::NewToken(NewTokenFrame {
                token: Bytes::copy_from_slice(token),
            })
        }

        t if (FRAME_TYPE_STREAM_BASE..=0x0f).contains(&t) => {
            let stream_id = StreamId(reader.varint("stream id")?);
            let offset = if t & STREAM_FRAME_BIT_OFF != 0 {
                reader.varint("stream offset")?
            } else {
                0
            };
            let data = if t & STREAM_FRAME_BIT_LEN != 0 {
                let length = reader.varint("stream length")? as usize;
                reader.take(length, "stream data")?
            } else {
                reader.rest()
            };
            Frame::Stream(StreamFrame {
                stream_id,
                offset,
                fin: t & STREAM_FRAME_BIT_FIN != 0,
                data,
            })
        }

        FRAME_TYPE_MAX_DATA => Frame::MaxData(MaxDataFrame {
            maximum_data: reader.varint("max data")?,
        }),

        FRAME_TYPE_MAX_STREAM_DATA => Frame::MaxStreamData(MaxStreamDataFrame {
            stream_id: StreamId(reader.varint("stream id")?),
            maximum_data: reader.varint("max stream data")?,
        }),

        FRAME_TYPE_MAX_STREAMS_BIDI | FRAME_TYPE_MAX_STREAMS_UNI => {
            Frame::MaxStreams(MaxStreamsFrame {
                maximum_streams: reader.varint("max streams")?,
                bidirectional: frame_type == FRAME_TYPE_MAX_STREAMS_BIDI,
            })
        }

        FRAME_TYPE_DATA_BLOCKED => Frame::DataBlocked(DataBlockedFrame {
            data_limit: reader.varint("data limit")?,
        }),

        FRAME_TYPE_STREAM_DATA_BLOCKED => Frame::StreamDataBlocked(StreamDataBlockedFrame {
            stream_id: StreamId(reader.varint("stream id")?),
            data_limit: reader.varint("data limit")?,
        }),

        FRAME_TYPE_STREAMS_BLOCKED_BIDI | FRAME_TYPE_STREAMS_BLOCKED_UNI => {
            Frame::StreamsBlocked(StreamsBlockedFrame {
                stream_limit: reader.varint("stream limit")?,
                bidirectional: frame_type == FRAME_TYPE_STREAMS_BLOCKED_BIDI,
            })
        }

        FRAME_TYPE_NEW_CONNECTION_ID => {
            let sequence = reader.varint("sequence")?;
            let retire_prior_to = reader.varint("retire prior to")?;
            let cid_len = reader.take(1, "cid length")?[0] as usize;
            let cid = reader.take(cid_len, "connection id")?;
            let connection_id =
                ConnectionId::from_slice(cid).ok_or_else(|| malformed("connection id length"))?;
            let stateless_reset_token = reader.take_array::<16>("reset token")?;
            Frame::NewConnectionId(NewConnectionIdFrame {
                sequence,
                retire_prior_to,
                connection_id,
                stateless_reset_token,
            })
        }

        FRAME_TYPE_RETIRE_CONNECTION_ID => Frame::RetireConnectionId(RetireConnectionIdFrame {
            sequence: reader.varint("sequence")?,
        }),

        FRAME_TYPE_PATH_CHALLENGE => Frame::PathChallenge(PathChallengeFrame {
            data: reader.take_array::<8>("path challenge")?,
        }),

        FRAME_TYPE_PATH_RESPONSE => Frame::PathResponse(PathResponseFrame {
            data: reader.take_array::<8>("path response")?,
        }),

        FRAME_TYPE_CONNECTION_CLOSE => {
            let error_code = reader.varint("error code")?;
            let closing_frame_type = reader.varint("closing frame type")?;
            let reason_len = reader.varint("reason length")? as usize;
            let reason = reader.take(reason_len, "reason")?;
            Frame::ConnectionClose(ConnectionCloseFrame {
                error_code,
                closing_frame_type,
                reason: Bytes::copy_from_slice(reason),
            })
        }

        FRAME_TYPE_APPLICATION_CLOSE => {
            let error_code = reader.varint("error code")?;
            let reason_len = reader.varint("reason length")? as usize;
            let reason = reader.take(reason_len, "reason")?;
            Frame::ApplicationClose(ApplicationCloseFrame {
                error_code,
                reason: Bytes::copy_from_slice(reason),
            })
        }

        FRAME_TYPE_HANDSHAKE_DONE => Frame::HandshakeDone,

        FRAME_TYPE_MIN_STREAM_DATA => Frame::MinStreamData(MinStreamDataFrame {
            stream_id: StreamId(reader.varint("stream id")?),
            maximum_data: reader.varint("maximum data")?,
            minimum_stream_offset: reader.varint("minimum offset")?,
        }),

        FRAME_TYPE_EXPIRED_STREAM_DATA => Frame::ExpiredStreamData(ExpiredStreamDataFrame {
            stream_id: StreamId(reader.varint("stream id")?),
            minimum_stream_offset: reader.varint("minimum offset")?,
        }),

        _ => return Err(malformed("unknown frame type")),
    };

    Ok((frame, reader.pos))
}

/// Iterator over the frames of a decrypted packet payload.
pub struct FrameIter<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> FrameIter<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            buf: payload,
            pos: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<Frame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        match parse_frame(&self.buf[self.pos..]) {
            Ok((frame, consumed)) => {
                self.pos += consumed;
                Some(Ok(frame))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
