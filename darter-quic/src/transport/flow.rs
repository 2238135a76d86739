//! Flow-control windows (RFC 9000 Section 4).
//!
//! Credit-based accounting used at both connection and stream level. Send
//! windows track the peer's advertised limit against the highest offset we
//! have sent; receive windows track what we have allowed against what
//! arrived.

use crate::error::{QuicError, Result, TransportErrorCode};

/// Send-direction window: bounded by the peer's MAX_DATA /
/// MAX_STREAM_DATA advertisements.
#[derive(Debug, Clone)]
pub struct SendWindow {
    max_data: u64,
    highest_sent: u64,
}

impl SendWindow {
    pub fn new(max_data: u64) -> Self {
        Self {
            max_data,
            highest_sent: 0,
        }
    }

    /// Credit remaining past the highest offset sent so far.
    pub fn available(&self) -> u64 {
        self.max_data.saturating_sub(self.highest_sent)
    }

    /// Credit remaining for data starting at `offset` (retransmissions at
    /// lower offsets consume no new credit).
    pub fn available_at(&self, offset: u64) -> u64 {
        if offset < self.highest_sent {
            u64::MAX
        } else {
            self.max_data.saturating_sub(offset)
        }
    }

    pub fn on_sent_through(&mut self, end_offset: u64) {
        if end_offset > self.highest_sent {
            self.highest_sent = end_offset;
        }
    }

    /// Limits only ever grow; a smaller advertisement is ignored.
    pub fn update_max_data(&mut self, max_data: u64) {
        if max_data > self.max_data {
            self.max_data = max_data;
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.highest_sent >= self.max_data
    }

    pub fn max_data(&self) -> u64 {
        self.max_data
    }
}

/// Receive-direction window: what we allow the peer to send.
#[derive(Debug, Clone)]
pub struct RecvWindow {
    max_data: u64,
    window_size: u64,
    received: u64,
    consumed: u64,
    pending_update: bool,
}

impl RecvWindow {
    pub fn new(initial_max: u64) -> Self {
        Self {
            max_data: initial_max,
            window_size: initial_max,
            received: 0,
            consumed: 0,
            pending_update: false,
        }
    }

    /// Charge newly received bytes against the window.
    pub fn on_received(&mut self, bytes: u64) -> Result<()> {
        if self.received + bytes > self.max_data {
            return Err(QuicError::transport(
                TransportErrorCode::FlowControlError,
                "peer exceeded advertised flow control limit",
            ));
        }
        self.received += bytes;
        Ok(())
    }

    /// The application consumed bytes; once half the window is consumed a
    /// MAX_DATA update is scheduled.
    pub fn on_consumed(&mut self, bytes: u64) {
        self.consumed += bytes;
        if self.window_size > 0 && self.consumed + self.window_size / 2 > self.max_data {
            self.pending_update = true;
        }
    }

    /// Take the pending limit advertisement, if any.
    pub fn poll_update(&mut self) -> Option<u64> {
        if !self.pending_update {
            return None;
        }
        self.pending_update = false;
        self.max_data = self.consumed + self.window_size;
        Some(self.max_data)
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn max_data(&self) -> u64 {
        self.max_data
    }
}

/// Connection-level windows, both directions.
#[derive(Debug, Clone)]
pub struct ConnectionFlowControl {
    pub send: SendWindow,
    pub recv: RecvWindow,
}

impl ConnectionFlowControl {
    pub fn new(local_max_data: u64) -> Self {
        Self {
            // The peer's limit arrives with its transport parameters.
            send: SendWindow::new(0),
            recv: RecvWindow::new(local_max_data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_window_credit() {
        let mut window = SendWindow::new(100);
        assert_eq!(window.available(), 100);
        window.on_sent_through(60);
        assert_eq!(window.available(), 40);
        assert!(!window.is_blocked());
        window.on_sent_through(100);
        assert!(window.is_blocked());
        // Retransmissions below the high-water mark need no credit.
        assert_eq!(window.available_at(20), u64::MAX);
        window.update_max_data(150);
        assert_eq!(window.available(), 50);
        // Shrinking advertisements are ignored.
        window.update_max_data(10);
        assert_eq!(window.max_data(), 150);
    }

    #[test]
    fn recv_window_violation() {
        let mut window = RecvWindow::new(10);
        window.on_received(8).unwrap();
        assert!(window.on_received(3).is_err());
    }

    #[test]
    fn recv_window_updates_after_half_consumed() {
        let mut window = RecvWindow::new(100);
        window.on_received(80).unwrap();
        assert!(window.poll_update().is_none());
        window.on_consumed(60);
        let update = window.poll_update().unwrap();
        assert_eq!(update, 160);
        assert!(window.poll_update().is_none());
    }
}
