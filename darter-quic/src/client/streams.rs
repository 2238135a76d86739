//! Per-stream state for the client connection: send queues with explicit
//! offsets (so lost data can be requeued), offset-ordered receive
//! reassembly, and stream-count accounting.

use std::collections::BTreeMap;

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::error::{LocalErrorCode, QuicError, Result, TransportErrorCode};
use crate::frames::StreamFrame;
use crate::transport::{SendWindow, TransportParameters};
use crate::types::StreamId;

/// One queued send chunk at a fixed stream offset.
#[derive(Debug, Clone)]
struct SendChunk {
    offset: u64,
    data: Bytes,
    fin: bool,
}

/// Receive side of one stream.
#[derive(Default)]
struct RecvState {
    next_offset: u64,
    segments: BTreeMap<u64, Bytes>,
    fin_offset: Option<u64>,
    readable: BytesMut,
    fin_delivered: bool,
}

impl RecvState {
    /// Highest contiguous-or-buffered offset seen, for flow accounting.
    fn highest_seen(&self) -> u64 {
        self.segments
            .iter()
            .next_back()
            .map(|(off, data)| off + data.len() as u64)
            .unwrap_or(0)
            .max(self.next_offset)
    }

    fn on_frame(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<()> {
        let end = offset + data.len() as u64;
        if fin {
            match self.fin_offset {
                Some(existing) if existing != end => {
                    return Err(QuicError::transport(
                        TransportErrorCode::FinalSizeError,
                        "conflicting final sizes",
                    ));
                }
                _ => self.fin_offset = Some(end),
            }
        }
        if let Some(final_size) = self.fin_offset {
            if end > final_size {
                return Err(QuicError::transport(
                    TransportErrorCode::FinalSizeError,
                    "data beyond final size",
                ));
            }
        }
        if end > self.next_offset && !data.is_empty() {
            self.segments
                .entry(offset)
                .or_insert_with(|| Bytes::copy_from_slice(data));
        }
        self.assemble();
        Ok(())
    }

    fn assemble(&mut self) {
        while let Some((&offset, _)) = self.segments.iter().next() {
            if offset > self.next_offset {
                break;
            }
            let Some(segment) = self.segments.remove(&offset) else {
                break;
            };
            let skip = (self.next_offset - offset) as usize;
            if skip < segment.len() {
                self.readable.extend_from_slice(&segment[skip..]);
                self.next_offset = offset + segment.len() as u64;
            }
        }
    }

    fn fin_reached(&self) -> bool {
        self.fin_offset == Some(self.next_offset) && self.segments.is_empty()
    }
}

struct StreamState {
    id: StreamId,
    send_queue: Vec<SendChunk>,
    /// Next fresh offset for application writes.
    write_offset: u64,
    fin_queued: bool,
    send_window: SendWindow,
    recv: RecvState,
    /// Bytes already charged against connection-level receive flow control.
    flow_charged: u64,
}

impl StreamState {
    fn new(id: StreamId, send_limit: u64) -> Self {
        Self {
            id,
            send_queue: Vec::new(),
            write_offset: 0,
            fin_queued: false,
            send_window: SendWindow::new(send_limit),
            recv: RecvState::default(),
            flow_charged: 0,
        }
    }
}

/// Result of reading from a stream.
#[derive(Debug, PartialEq, Eq)]
pub struct StreamReadResult {
    pub data: Bytes,
    pub fin: bool,
}

/// A chunk scheduled for transmission.
#[derive(Debug, Clone)]
pub struct OutgoingChunk {
    pub stream_id: StreamId,
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

/// All per-stream state of a client connection.
pub struct StreamManager {
    streams: BTreeMap<StreamId, StreamState>,
    next_bidi: u64,
    next_uni: u64,
    /// How many streams of each kind the peer lets us open.
    peer_max_streams_bidi: u64,
    peer_max_streams_uni: u64,
    /// Peer-advertised per-stream send limits, applied to new streams.
    send_limit_bidi: u64,
    send_limit_uni: u64,
    /// Largest server-initiated stream ids seen, for new-stream detection.
    largest_server_bidi: Option<u64>,
    largest_server_uni: Option<u64>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self {
            streams: BTreeMap::new(),
            // Client-initiated ids: bidi 0,4,8..; uni 2,6,10..
            next_bidi: 0,
            next_uni: 2,
            peer_max_streams_bidi: 0,
            peer_max_streams_uni: 0,
            send_limit_bidi: 0,
            send_limit_uni: 0,
            largest_server_bidi: None,
            largest_server_uni: None,
        }
    }

    /// Apply the server's transport parameters. Called exactly once by the
    /// connection.
    pub fn apply_server_params(&mut self, params: &TransportParameters) {
        self.peer_max_streams_bidi = params.initial_max_streams_bidi;
        self.peer_max_streams_uni = params.initial_max_streams_uni;
        self.send_limit_bidi = params.initial_max_stream_data_bidi_remote;
        self.send_limit_uni = params.initial_max_stream_data_uni;
        for stream in self.streams.values_mut() {
            let limit = if stream.id.is_bidirectional() {
                self.send_limit_bidi
            } else {
                self.send_limit_uni
            };
            stream.send_window.update_max_data(limit);
        }
    }

    pub fn open_bidirectional(&mut self) -> Result<StreamId> {
        let opened = self.next_bidi / 4;
        if opened >= self.peer_max_streams_bidi {
            return Err(QuicError::transport(
                TransportErrorCode::StreamLimitError,
                "bidirectional stream limit reached",
            ));
        }
        let id = StreamId(self.next_bidi);
        self.next_bidi += 4;
        self.streams
            .insert(id, StreamState::new(id, self.send_limit_bidi));
        Ok(id)
    }

    pub fn open_unidirectional(&mut self) -> Result<StreamId> {
        let opened = (self.next_uni - 2) / 4;
        if opened >= self.peer_max_streams_uni {
            return Err(QuicError::transport(
                TransportErrorCode::StreamLimitError,
                "unidirectional stream limit reached",
            ));
        }
        let id = StreamId(self.next_uni);
        self.next_uni += 4;
        self.streams
            .insert(id, StreamState::new(id, self.send_limit_uni));
        Ok(id)
    }

    /// Queue application data at the next fresh offset.
    pub fn write(&mut self, id: StreamId, data: Bytes, fin: bool) -> Result<()> {
        let stream = self.streams.get_mut(&id).ok_or_else(|| {
            QuicError::local(LocalErrorCode::InvalidOperation, "unknown stream")
        })?;
        if stream.fin_queued {
            return Err(QuicError::local(
                LocalErrorCode::InvalidOperation,
                "stream already finished",
            ));
        }
        let offset = stream.write_offset;
        stream.write_offset += data.len() as u64;
        stream.fin_queued = fin;
        stream.send_queue.push(SendChunk { offset, data, fin });
        Ok(())
    }

    /// Pop the next sendable chunk across all streams, bounded by `budget`
    /// bytes and the per-stream flow-control window. Chunks too large for
    /// the budget are split.
    pub fn next_outgoing_chunk(&mut self, budget: usize) -> Option<OutgoingChunk> {
        if budget == 0 {
            return None;
        }
        for stream in self.streams.values_mut() {
            if stream.send_queue.is_empty() {
                continue;
            }
            // Lowest offset first so requeued (lost) data goes out before
            // fresh data.
            let Some(index) = stream
                .send_queue
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.offset)
                .map(|(i, _)| i)
            else {
                continue;
            };
            let chunk = &stream.send_queue[index];

            let window = stream.send_window.available_at(chunk.offset);
            if window == 0 && !chunk.data.is_empty() {
                trace!(stream = %stream.id, "stream blocked by flow control");
                continue;
            }

            let mut chunk = stream.send_queue.remove(index);
            let allowed = (budget as u64).min(window.max(1)).min(chunk.data.len().max(1) as u64);
            if (chunk.data.len() as u64) > allowed {
                // Split: the tail goes back on the queue.
                let tail = chunk.data.split_off(allowed as usize);
                let tail_chunk = SendChunk {
                    offset: chunk.offset + allowed,
                    data: tail,
                    fin: chunk.fin,
                };
                stream.send_queue.push(tail_chunk);
                chunk.fin = false;
            }
            stream
                .send_window
                .on_sent_through(chunk.offset + chunk.data.len() as u64);
            return Some(OutgoingChunk {
                stream_id: stream.id,
                offset: chunk.offset,
                data: chunk.data,
                fin: chunk.fin,
            });
        }
        None
    }

    /// Requeue a chunk whose packet was declared lost.
    pub fn requeue(&mut self, id: StreamId, offset: u64, data: Bytes, fin: bool) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.send_queue.push(SendChunk { offset, data, fin });
        }
    }

    pub fn has_sendable_data(&self) -> bool {
        self.streams.iter().any(|(_, s)| !s.send_queue.is_empty())
    }

    /// Process a received STREAM frame. Returns the connection-level flow
    /// control charge (newly seen bytes) and whether this opened a new
    /// server-initiated stream.
    pub fn on_stream_frame(&mut self, frame: &StreamFrame<'_>) -> Result<StreamFrameReceipt> {
        let id = frame.stream_id;
        let new_stream = if id.is_server_initiated() {
            let largest = if id.is_bidirectional() {
                &mut self.largest_server_bidi
            } else {
                &mut self.largest_server_uni
            };
            let is_new = largest.map(|l| id.0 > l).unwrap_or(true);
            if is_new {
                *largest = Some(id.0);
            }
            is_new
        } else if !self.streams.contains_key(&id) {
            return Err(QuicError::transport(
                TransportErrorCode::StreamStateError,
                "data on a stream we never opened",
            ));
        } else {
            false
        };

        let limit = if id.is_bidirectional() {
            self.send_limit_bidi
        } else {
            0
        };
        let stream = self
            .streams
            .entry(id)
            .or_insert_with(|| StreamState::new(id, limit));

        let before = stream.recv.highest_seen().max(stream.flow_charged);
        stream.recv.on_frame(frame.offset, frame.data, frame.fin)?;
        let after = stream.recv.highest_seen();
        let charge = after.saturating_sub(before);
        stream.flow_charged = stream.flow_charged.max(after);

        Ok(StreamFrameReceipt {
            flow_charge: charge,
            new_stream,
            readable: !stream.recv.readable.is_empty() || stream.recv.fin_reached(),
        })
    }

    /// Read buffered contiguous data.
    pub fn read(&mut self, id: StreamId) -> Option<StreamReadResult> {
        let stream = self.streams.get_mut(&id)?;
        let data = stream.recv.readable.split().freeze();
        let fin = stream.recv.fin_reached() && !stream.recv.fin_delivered;
        if fin {
            stream.recv.fin_delivered = true;
        }
        if data.is_empty() && !fin {
            return None;
        }
        Some(StreamReadResult { data, fin })
    }

    pub fn on_max_stream_data(&mut self, id: StreamId, maximum: u64) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.send_window.update_max_data(maximum);
        }
    }

    pub fn on_max_streams(&mut self, maximum: u64, bidirectional: bool) {
        let limit = if bidirectional {
            &mut self.peer_max_streams_bidi
        } else {
            &mut self.peer_max_streams_uni
        };
        if maximum > *limit {
            *limit = maximum;
        }
    }

    pub fn on_reset_stream(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.send_queue.clear();
            stream.recv.segments.clear();
        }
    }

    pub fn on_stop_sending(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.send_queue.clear();
        }
    }

    /// Partial reliability, sender side: the peer no longer wants data
    /// below `min_offset`; drop queued retransmissions under it.
    pub fn on_min_stream_data(&mut self, id: StreamId, maximum_data: u64, min_offset: u64) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.send_window.update_max_data(maximum_data);
            stream.send_queue.retain_mut(|chunk| {
                let end = chunk.offset + chunk.data.len() as u64;
                if end <= min_offset {
                    return false;
                }
                if chunk.offset < min_offset {
                    let skip = (min_offset - chunk.offset) as usize;
                    chunk.data.advance(skip);
                    chunk.offset = min_offset;
                }
                true
            });
        }
    }

    /// Partial reliability, receiver side: data below `min_offset` was
    /// abandoned by the sender; skip the gap.
    pub fn on_expired_stream_data(&mut self, id: StreamId, min_offset: u64) {
        if let Some(stream) = self.streams.get_mut(&id) {
            if stream.recv.next_offset < min_offset {
                stream.recv.next_offset = min_offset;
                let keep = stream.recv.segments.split_off(&min_offset);
                stream.recv.segments = keep;
                stream.recv.assemble();
            }
        }
    }
}

/// Accounting outcome of one received STREAM frame.
#[derive(Debug)]
pub struct StreamFrameReceipt {
    /// Newly seen bytes charged to connection-level flow control.
    pub flow_charge: u64,
    pub new_stream: bool,
    pub readable: bool,
}
