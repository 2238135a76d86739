//! # Happy Eyeballs (RFC 8305)
//!
//! Dual-stack connect race: when both an IPv4 and an IPv6 peer address are
//! configured, the primary socket starts immediately and a delay timer arms
//! the secondary. The first socket to produce a datagram that decrypts wins;
//! the loser is paused, closed, and released.
//!
//! All addresses are supplied before `start`; a late address is rejected by
//! the connection. Version 2 of RFC 8305 (interleaved resolution) would
//! split this module across the resolver and the transport and is not
//! attempted here.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::{LocalErrorCode, QuicError, Result};

/// Minimal view of an unconnected UDP socket. The event loop owns the real
/// socket; the racer only drives setup and teardown through this trait.
pub trait DatagramSocket {
    fn bind(&mut self, addr: SocketAddr) -> io::Result<()>;
    fn connect(&mut self, addr: SocketAddr) -> io::Result<()>;
    fn send_to(&mut self, data: &[u8], peer: SocketAddr) -> io::Result<usize>;
    fn set_reuse_addr(&mut self, on: bool) -> io::Result<()>;
    /// Set the don't-fragment bit on outgoing datagrams.
    fn set_dont_fragment(&mut self, on: bool) -> io::Result<()>;
    /// Enable PMTU probing (IP_PMTUDISC_PROBE / IPV6_PMTUDISC_PROBE).
    fn set_pmtu_probing(&mut self, on: bool) -> io::Result<()>;
    /// Route socket error messages (ICMP errors) to the error callback the
    /// event loop wired for this socket.
    fn set_error_messages_enabled(&mut self, _on: bool) {}
    fn resume_read(&mut self);
    fn pause_read(&mut self);
    fn close(&mut self);
}

/// Handle to the connection-attempt delay timer owned by the event loop.
pub trait ConnAttemptTimer {
    fn schedule(&mut self, delay: Duration);
    fn cancel(&mut self);
}

/// Socket options applied when setting up the secondary socket, mirroring
/// the transport's settings for the primary.
#[derive(Debug, Clone, Copy)]
pub struct SocketSettings {
    /// Probe the path MTU instead of setting the DF bit.
    pub turn_off_pmtud: bool,
    /// `connect()` the UDP socket to the peer.
    pub connect_udp: bool,
    /// Deliver socket error messages to the error callback.
    pub enable_socket_err_msg_callback: bool,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            turn_off_pmtud: false,
            connect_udp: false,
            enable_socket_err_msg_callback: true,
        }
    }
}

/// Address family hint cached from a previous successful connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedFamily {
    Unspecified,
    V4,
    V6,
}

/// Racer state owned by the connection.
pub struct HappyEyeballsState {
    pub v4_peer_address: Option<SocketAddr>,
    pub v6_peer_address: Option<SocketAddr>,
    /// Address the secondary socket races toward.
    pub second_peer_address: Option<SocketAddr>,
    pub second_socket: Option<Box<dyn DatagramSocket>>,
    pub finished: bool,
    pub should_write_to_first_socket: bool,
    pub should_write_to_second_socket: bool,
}

impl Default for HappyEyeballsState {
    fn default() -> Self {
        Self {
            v4_peer_address: None,
            v6_peer_address: None,
            second_peer_address: None,
            second_socket: None,
            finished: false,
            should_write_to_first_socket: true,
            should_write_to_second_socket: false,
        }
    }
}

impl HappyEyeballsState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Record a peer address. Each address family may be supplied at most once,
/// and only before the race starts.
pub fn add_peer_address(state: &mut HappyEyeballsState, peer: SocketAddr) -> Result<()> {
    trace!(%peer, "happy eyeballs add addr");
    let slot = match peer {
        SocketAddr::V4(_) => &mut state.v4_peer_address,
        SocketAddr::V6(_) => &mut state.v6_peer_address,
    };
    if slot.is_some() {
        return Err(QuicError::local(
            LocalErrorCode::AlreadyInstalled,
            "peer address already set for this family",
        ));
    }
    *slot = Some(peer);
    Ok(())
}

/// Supply the secondary socket. Required before `start` when both families
/// are configured.
pub fn add_socket(
    state: &mut HappyEyeballsState,
    socket: Box<dyn DatagramSocket>,
) -> Result<()> {
    if state.second_socket.is_some() {
        return Err(QuicError::local(
            LocalErrorCode::AlreadyInstalled,
            "second socket already set",
        ));
    }
    state.second_socket = Some(socket);
    Ok(())
}

/// Begin the race. Picks the primary by the cached family (IPv6 when no
/// hint, per RFC 8305), schedules the delay timer, and prepares the
/// secondary socket. Returns the primary peer address, which becomes both
/// `peer_address` and `original_peer_address` on the connection.
///
/// With a single configured family there is no race: the state is finished
/// immediately with no timer and no secondary socket.
pub fn start(
    state: &mut HappyEyeballsState,
    cached_family: CachedFamily,
    timer: &mut dyn ConnAttemptTimer,
    delay: Duration,
    settings: &SocketSettings,
) -> Option<SocketAddr> {
    match (state.v6_peer_address, state.v4_peer_address) {
        (Some(v6), Some(v4)) => {
            let (primary, secondary) = if cached_family == CachedFamily::V4 {
                debug!("happy eyeballs start, cache=v4");
                (v4, v6)
            } else {
                debug!("happy eyeballs start, cache=v6");
                (v6, v4)
            };
            state.second_peer_address = Some(secondary);

            timer.schedule(delay);

            let set_up = match state.second_socket.as_mut() {
                Some(socket) => set_up_socket(socket.as_mut(), secondary, settings),
                None => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "second socket missing",
                )),
            };
            if let Err(err) = set_up {
                // If the second socket cannot be set up, give the race up
                // and continue with the primary only.
                warn!(%err, "secondary socket setup failed");
                timer.cancel();
                state.finished = true;
            }
            Some(primary)
        }
        (Some(v6), None) => {
            state.finished = true;
            Some(v6)
        }
        (None, Some(v4)) => {
            state.finished = true;
            Some(v4)
        }
        (None, None) => None,
    }
}

/// Bind and configure a racing socket: wildcard bind on its family, DF bit
/// or PMTU probing, optional UDP connect, then start reading.
pub fn set_up_socket(
    socket: &mut dyn DatagramSocket,
    peer: SocketAddr,
    settings: &SocketSettings,
) -> io::Result<()> {
    socket.set_reuse_addr(false)?;
    let wildcard = match peer {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    socket.bind(wildcard)?;
    if settings.turn_off_pmtud {
        socket.set_pmtu_probing(true)?;
    } else {
        socket.set_dont_fragment(true)?;
    }
    if settings.connect_udp {
        socket.connect(peer)?;
    }
    if settings.enable_socket_err_msg_callback {
        socket.set_error_messages_enabled(true);
    }
    socket.resume_read();
    Ok(())
}

/// The delay timer fired: the secondary socket now sends its own copy of
/// the Initial flight.
pub fn start_second_socket(state: &mut HappyEyeballsState) {
    debug_assert!(!state.finished);
    if state.finished {
        return;
    }
    debug!("happy eyeballs delay expired, racing second socket");
    state.should_write_to_second_socket = true;
}

/// A datagram decrypted successfully: commit to the socket it arrived on.
///
/// Cancels the timer, swaps the sockets if the secondary won, updates
/// `peer_address` and `original_peer_address` to the winner, and pauses,
/// closes, and releases the loser.
pub fn on_data_received(
    state: &mut HappyEyeballsState,
    timer: &mut dyn ConnAttemptTimer,
    first_socket: &mut Option<Box<dyn DatagramSocket>>,
    peer_address: &mut Option<SocketAddr>,
    original_peer_address: &mut Option<SocketAddr>,
    from_peer: SocketAddr,
) {
    if state.finished {
        return;
    }
    debug!(%from_peer, "happy eyeballs finish");
    timer.cancel();
    state.finished = true;
    state.should_write_to_first_socket = true;
    state.should_write_to_second_socket = false;

    let current_family_matches = peer_address
        .map(|addr| addr.is_ipv4() == from_peer.is_ipv4())
        .unwrap_or(false);
    if !current_family_matches {
        // The second socket won: it takes the primary slot.
        std::mem::swap(first_socket, &mut state.second_socket);
        *original_peer_address = Some(from_peer);
        *peer_address = Some(from_peer);
    }

    if let Some(mut loser) = state.second_socket.take() {
        loser.pause_read();
        loser.close();
    }
}

// ============================================================================
// Test doubles
// ============================================================================

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Shared log of socket lifecycle operations.
    pub type OpLog = Rc<RefCell<Vec<String>>>;

    pub struct MockSocket {
        pub name: &'static str,
        pub ops: OpLog,
        pub fail_bind: bool,
        pub sent: Rc<RefCell<Vec<(Vec<u8>, SocketAddr)>>>,
    }

    impl MockSocket {
        pub fn new(name: &'static str, ops: OpLog) -> Self {
            Self {
                name,
                ops,
                fail_bind: false,
                sent: Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn log(&self, op: &str) {
            self.ops.borrow_mut().push(format!("{}:{}", self.name, op));
        }
    }

    impl DatagramSocket for MockSocket {
        fn bind(&mut self, addr: SocketAddr) -> io::Result<()> {
            if self.fail_bind {
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "bind failed"));
            }
            self.log(&format!("bind {addr}"));
            Ok(())
        }

        fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
            self.log(&format!("connect {addr}"));
            Ok(())
        }

        fn send_to(&mut self, data: &[u8], peer: SocketAddr) -> io::Result<usize> {
            self.sent.borrow_mut().push((data.to_vec(), peer));
            Ok(data.len())
        }

        fn set_reuse_addr(&mut self, _on: bool) -> io::Result<()> {
            Ok(())
        }

        fn set_dont_fragment(&mut self, _on: bool) -> io::Result<()> {
            self.log("df");
            Ok(())
        }

        fn set_pmtu_probing(&mut self, _on: bool) -> io::Result<()> {
            self.log("pmtud-probe");
            Ok(())
        }

        fn resume_read(&mut self) {
            self.log("resume");
        }

        fn pause_read(&mut self) {
            self.log("pause");
        }

        fn close(&mut self) {
            self.log("close");
        }
    }

    #[derive(Clone, Default)]
    pub struct MockTimer {
        pub scheduled: Rc<RefCell<Option<Duration>>>,
        pub cancelled: Rc<RefCell<bool>>,
    }

    impl ConnAttemptTimer for MockTimer {
        fn schedule(&mut self, delay: Duration) {
            *self.scheduled.borrow_mut() = Some(delay);
        }

        fn cancel(&mut self) {
            *self.cancelled.borrow_mut() = true;
        }
    }

    pub fn v4_addr() -> SocketAddr {
        "192.0.2.1:4433".parse().unwrap()
    }

    pub fn v6_addr() -> SocketAddr {
        "[2001:db8::1]:4433".parse().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn dual_stack_state(ops: &OpLog) -> HappyEyeballsState {
        let mut state = HappyEyeballsState::new();
        add_peer_address(&mut state, v4_addr()).unwrap();
        add_peer_address(&mut state, v6_addr()).unwrap();
        add_socket(&mut state, Box::new(MockSocket::new("second", ops.clone()))).unwrap();
        state
    }

    #[test]
    fn duplicate_family_rejected() {
        let mut state = HappyEyeballsState::new();
        add_peer_address(&mut state, v4_addr()).unwrap();
        assert!(add_peer_address(&mut state, "198.51.100.7:443".parse().unwrap()).is_err());
        add_peer_address(&mut state, v6_addr()).unwrap();
    }

    #[test]
    fn v6_is_primary_without_a_hint() {
        let ops: OpLog = Rc::new(RefCell::new(Vec::new()));
        let mut state = dual_stack_state(&ops);
        let mut timer = MockTimer::default();
        let primary = start(
            &mut state,
            CachedFamily::Unspecified,
            &mut timer,
            Duration::from_millis(150),
            &SocketSettings::default(),
        );
        assert_eq!(primary, Some(v6_addr()));
        assert_eq!(state.second_peer_address, Some(v4_addr()));
        assert_eq!(*timer.scheduled.borrow(), Some(Duration::from_millis(150)));
        assert!(!state.finished);
        // Secondary was bound on the v4 wildcard and is reading.
        let ops = ops.borrow();
        assert!(ops.iter().any(|op| op == "second:bind 0.0.0.0:0"));
        assert!(ops.iter().any(|op| op == "second:resume"));
    }

    #[test]
    fn cached_v4_flips_the_primary() {
        let ops: OpLog = Rc::new(RefCell::new(Vec::new()));
        let mut state = dual_stack_state(&ops);
        let mut timer = MockTimer::default();
        let primary = start(
            &mut state,
            CachedFamily::V4,
            &mut timer,
            Duration::from_millis(100),
            &SocketSettings::default(),
        );
        assert_eq!(primary, Some(v4_addr()));
        assert_eq!(state.second_peer_address, Some(v6_addr()));
        assert!(ops.borrow().iter().any(|op| op == "second:bind [::]:0"));
    }

    #[test]
    fn single_family_finishes_immediately() {
        let mut state = HappyEyeballsState::new();
        add_peer_address(&mut state, v4_addr()).unwrap();
        let mut timer = MockTimer::default();
        let primary = start(
            &mut state,
            CachedFamily::Unspecified,
            &mut timer,
            Duration::from_millis(100),
            &SocketSettings::default(),
        );
        assert_eq!(primary, Some(v4_addr()));
        assert!(state.finished);
        assert!(timer.scheduled.borrow().is_none());
        assert!(state.second_socket.is_none());
        assert!(state.should_write_to_first_socket);
        assert!(!state.should_write_to_second_socket);
    }

    #[test]
    fn secondary_setup_failure_gives_up_the_race() {
        let ops: OpLog = Rc::new(RefCell::new(Vec::new()));
        let mut state = HappyEyeballsState::new();
        add_peer_address(&mut state, v4_addr()).unwrap();
        add_peer_address(&mut state, v6_addr()).unwrap();
        let mut socket = MockSocket::new("second", ops.clone());
        socket.fail_bind = true;
        add_socket(&mut state, Box::new(socket)).unwrap();

        let mut timer = MockTimer::default();
        let primary = start(
            &mut state,
            CachedFamily::Unspecified,
            &mut timer,
            Duration::from_millis(100),
            &SocketSettings::default(),
        );
        assert_eq!(primary, Some(v6_addr()));
        assert!(state.finished);
        assert!(*timer.cancelled.borrow());
    }

    #[test]
    fn timer_expiry_enables_second_socket() {
        let ops: OpLog = Rc::new(RefCell::new(Vec::new()));
        let mut state = dual_stack_state(&ops);
        let mut timer = MockTimer::default();
        start(
            &mut state,
            CachedFamily::Unspecified,
            &mut timer,
            Duration::from_millis(100),
            &SocketSettings::default(),
        );
        assert!(!state.should_write_to_second_socket);
        start_second_socket(&mut state);
        assert!(state.should_write_to_second_socket);
    }

    #[test]
    fn primary_reply_finishes_and_closes_the_loser() {
        let ops: OpLog = Rc::new(RefCell::new(Vec::new()));
        let mut state = dual_stack_state(&ops);
        let mut timer = MockTimer::default();
        let mut peer = start(
            &mut state,
            CachedFamily::Unspecified,
            &mut timer,
            Duration::from_millis(100),
            &SocketSettings::default(),
        );
        let mut original_peer = peer;
        let mut first_socket: Option<Box<dyn DatagramSocket>> =
            Some(Box::new(MockSocket::new("first", ops.clone())));

        on_data_received(
            &mut state,
            &mut timer,
            &mut first_socket,
            &mut peer,
            &mut original_peer,
            v6_addr(),
        );

        assert!(state.finished);
        assert!(state.should_write_to_first_socket);
        assert!(!state.should_write_to_second_socket);
        assert!(*timer.cancelled.borrow());
        assert_eq!(peer, Some(v6_addr()));
        assert!(state.second_socket.is_none());
        let ops = ops.borrow();
        assert!(ops.iter().any(|op| op == "second:pause"));
        assert!(ops.iter().any(|op| op == "second:close"));
    }

    #[test]
    fn secondary_win_swaps_sockets_and_address() {
        let ops: OpLog = Rc::new(RefCell::new(Vec::new()));
        let mut state = dual_stack_state(&ops);
        let mut timer = MockTimer::default();
        let mut peer = start(
            &mut state,
            CachedFamily::Unspecified,
            &mut timer,
            Duration::from_millis(100),
            &SocketSettings::default(),
        );
        let mut original_peer = peer;
        let mut first_socket: Option<Box<dyn DatagramSocket>> =
            Some(Box::new(MockSocket::new("first", ops.clone())));
        start_second_socket(&mut state);

        // The v4 (secondary) socket gets the first decryptable reply.
        on_data_received(
            &mut state,
            &mut timer,
            &mut first_socket,
            &mut peer,
            &mut original_peer,
            v4_addr(),
        );

        assert!(state.finished);
        assert_eq!(peer, Some(v4_addr()));
        assert_eq!(original_peer, Some(v4_addr()));
        assert!(state.should_write_to_first_socket);
        assert!(!state.should_write_to_second_socket);
        // The old primary was demoted into the second slot then closed.
        let ops = ops.borrow();
        assert!(ops.iter().any(|op| op == "first:pause"));
        assert!(ops.iter().any(|op| op == "first:close"));
    }

    #[test]
    fn finish_is_idempotent() {
        let ops: OpLog = Rc::new(RefCell::new(Vec::new()));
        let mut state = dual_stack_state(&ops);
        let mut timer = MockTimer::default();
        let mut peer = start(
            &mut state,
            CachedFamily::Unspecified,
            &mut timer,
            Duration::from_millis(100),
            &SocketSettings::default(),
        );
        let mut original_peer = peer;
        let mut first_socket: Option<Box<dyn DatagramSocket>> =
            Some(Box::new(MockSocket::new("first", ops.clone())));
        on_data_received(
            &mut state,
            &mut timer,
            &mut first_socket,
            &mut peer,
            &mut original_peer,
            v6_addr(),
        );
        let close_count = ops.borrow().iter().filter(|op| op.ends_with(":close")).count();
        on_data_received(
            &mut state,
            &mut timer,
            &mut first_socket,
            &mut peer,
            &mut original_peer,
            v4_addr(),
        );
        assert_eq!(
            ops.borrow().iter().filter(|op| op.ends_with(":close")).count(),
            close_count
        );
        assert_eq!(peer, Some(v6_addr()));
    }
}
