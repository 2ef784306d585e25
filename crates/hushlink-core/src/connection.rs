//! Per-peer connection state machine.
//!
//! Manages the lifecycle of one peer connection: discovery, channel open,
//! handshake, steady state, and failure. Uses the action pattern: methods
//! take events and the current time as input and return actions for the
//! driver to execute. This keeps the state machine pure (no I/O) and
//! makes testing straightforward.
//!
//! # State Machine
//!
//! ```text
//! ┌──────────────┐ ConnectRequested ┌─────────────┐ DiscoveryHit ┌────────────┐
//! │ Disconnected │─────────────────>│ Discovering │─────────────>│ Connecting │
//! └──────────────┘                  └─────────────┘              └────────────┘
//!        ▲                                 │ Tick(timeout)              │ ChannelOpened
//!        │ ChannelClosed                   ↓                            ↓
//! ┌──────────────┐ HandshakeCompleted ┌────────┐  Tick/HandshakeFailed ┌─────────────┐
//! │  Connected   │<───────────────────│ Handshaking │──────────────────>│   Failed   │
//! └──────────────┘                    └────────┘                        └────────────┘
//! ```
//!
//! `Failed` is not sticky: a new `ConnectRequested` restarts the cycle.

use std::ops::Sub;
use std::time::{Duration, Instant};

use crate::error::ConnectionError;

/// Time allowed from discovery start until the channel is open.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Time allowed to complete the handshake once the channel is open.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection lifecycle state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No connection and none in progress.
    Disconnected,
    /// Looking for the peer via rendezvous or local discovery.
    Discovering,
    /// Peer located; opening a transport channel.
    Connecting,
    /// Channel open; exchanging handshake frames.
    Handshaking,
    /// Handshake verified; session established.
    Connected,
    /// Last attempt failed. Cleared by the next connect request.
    Failed,
}

/// Events fed into the state machine by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectEvent {
    /// Caller asked to connect to this peer.
    ConnectRequested,
    /// Discovery located the peer at an opaque address.
    DiscoveryHit {
        /// Transport-specific address string.
        address: String,
    },
    /// The transport channel is open.
    ChannelOpened,
    /// Handshake verified on both sides.
    HandshakeCompleted,
    /// Handshake was rejected or failed verification.
    HandshakeFailed {
        /// What went wrong, for the transition report.
        reason: String,
    },
    /// The transport channel closed or errored.
    ChannelClosed,
    /// Discovery or channel open failed before a channel existed.
    AttemptFailed {
        /// Driver-reported cause.
        reason: String,
    },
}

/// Actions returned by the state machine for the driver to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectAction {
    /// Start discovery for this peer.
    Discover,
    /// Open a transport channel to the discovered address.
    OpenChannel {
        /// Address reported by discovery.
        address: String,
    },
    /// Send the handshake frame over the open channel.
    SendHandshake,
    /// Close the transport channel gracefully.
    CloseChannel,
    /// Drop channel resources without a goodbye (timeout, failure).
    DiscardChannel,
    /// Report a state transition to observers.
    EmitTransition {
        /// State before the event.
        from: PeerState,
        /// State after the event.
        to: PeerState,
    },
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout covering discovery plus channel open.
    pub connect_timeout: Duration,
    /// Timeout for handshake completion.
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Pure per-peer connection state machine.
///
/// No I/O and no Environment storage; time is passed as a parameter to
/// the methods that need it. Generic over `Instant` to support both real
/// and virtual time.
#[derive(Debug, Clone)]
pub struct PeerConnection<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    peer_id: String,
    state: PeerState,
    config: ConnectionConfig,
    /// When the current phase (connect or handshake) started.
    phase_started: I,
    /// Last failure, kept for observers until the next attempt.
    last_error: Option<ConnectionError>,
}

impl<I> PeerConnection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a new machine in [`PeerState::Disconnected`].
    pub fn new(peer_id: impl Into<String>, now: I, config: ConnectionConfig) -> Self {
        Self {
            peer_id: peer_id.into(),
            state: PeerState::Disconnected,
            config,
            phase_started: now,
            last_error: None,
        }
    }

    /// Peer this machine tracks.
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// The error that put the machine in [`PeerState::Failed`], if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&ConnectionError> {
        self.last_error.as_ref()
    }

    /// Whether the peer is fully connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    fn transition(&mut self, to: PeerState, actions: &mut Vec<ConnectAction>) {
        let from = self.state;
        self.state = to;
        actions.push(ConnectAction::EmitTransition { from, to });
    }

    /// Feed an event into the machine.
    ///
    /// Returns the actions the driver must execute. A connect request on
    /// a peer that is already connecting, handshaking, or connected is a
    /// no-op, so callers may issue it without checking state first.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::InvalidState`] for events that are
    ///   meaningless in the current state (e.g. `ChannelOpened` while
    ///   disconnected), which indicates a driver bug.
    pub fn handle_event(
        &mut self,
        event: ConnectEvent,
        now: I,
    ) -> Result<Vec<ConnectAction>, ConnectionError> {
        let mut actions = Vec::new();

        match (self.state, event) {
            (PeerState::Disconnected | PeerState::Failed, ConnectEvent::ConnectRequested) => {
                self.last_error = None;
                self.phase_started = now;
                self.transition(PeerState::Discovering, &mut actions);
                actions.push(ConnectAction::Discover);
            },

            // Idempotent: an attempt is already in flight.
            (
                PeerState::Discovering
                | PeerState::Connecting
                | PeerState::Handshaking
                | PeerState::Connected,
                ConnectEvent::ConnectRequested,
            ) => {},

            (PeerState::Discovering, ConnectEvent::DiscoveryHit { address }) => {
                self.transition(PeerState::Connecting, &mut actions);
                actions.push(ConnectAction::OpenChannel { address });
            },

            // A late discovery hit after the attempt moved on is dropped.
            (_, ConnectEvent::DiscoveryHit { .. }) => {},

            (PeerState::Connecting, ConnectEvent::ChannelOpened) => {
                self.phase_started = now;
                self.transition(PeerState::Handshaking, &mut actions);
                actions.push(ConnectAction::SendHandshake);
            },

            (PeerState::Handshaking, ConnectEvent::HandshakeCompleted) => {
                self.transition(PeerState::Connected, &mut actions);
            },

            (PeerState::Handshaking, ConnectEvent::HandshakeFailed { reason }) => {
                self.last_error = Some(ConnectionError::HandshakeFailed {
                    peer_id: self.peer_id.clone(),
                    reason,
                });
                self.transition(PeerState::Failed, &mut actions);
                actions.push(ConnectAction::DiscardChannel);
            },

            (PeerState::Connected, ConnectEvent::ChannelClosed) => {
                self.transition(PeerState::Disconnected, &mut actions);
                actions.push(ConnectAction::DiscardChannel);
            },

            (
                PeerState::Connecting | PeerState::Handshaking,
                ConnectEvent::ChannelClosed,
            ) => {
                self.last_error = Some(ConnectionError::ChannelOpenFailed {
                    peer_id: self.peer_id.clone(),
                    reason: "channel closed before the handshake completed".to_owned(),
                });
                self.transition(PeerState::Failed, &mut actions);
                actions.push(ConnectAction::DiscardChannel);
            },

            // Channel close while not using a channel is harmless.
            (PeerState::Disconnected | PeerState::Failed, ConnectEvent::ChannelClosed) => {},

            (
                PeerState::Discovering | PeerState::Connecting,
                ConnectEvent::AttemptFailed { reason },
            ) => {
                self.last_error = Some(ConnectionError::ChannelOpenFailed {
                    peer_id: self.peer_id.clone(),
                    reason,
                });
                self.transition(PeerState::Failed, &mut actions);
            },

            // A late failure report after the attempt resolved is dropped.
            (_, ConnectEvent::AttemptFailed { .. }) => {},

            (state, event) => {
                return Err(ConnectionError::InvalidState {
                    state,
                    operation: match event {
                        ConnectEvent::ChannelOpened => "open channel",
                        ConnectEvent::HandshakeCompleted => "complete handshake",
                        ConnectEvent::HandshakeFailed { .. } => "fail handshake",
                        _ => "handle event",
                    },
                });
            },
        }

        Ok(actions)
    }

    /// Check phase deadlines.
    ///
    /// Call periodically. A phase past its timeout moves the machine to
    /// [`PeerState::Failed`] and returns the cleanup and transition
    /// actions; otherwise returns no actions.
    pub fn tick(&mut self, now: I) -> Vec<ConnectAction> {
        let (timeout, phase) = match self.state {
            PeerState::Discovering | PeerState::Connecting => {
                (self.config.connect_timeout, "connect")
            },
            PeerState::Handshaking => (self.config.handshake_timeout, "handshake"),
            _ => return Vec::new(),
        };

        let elapsed = now - self.phase_started;
        if elapsed <= timeout {
            return Vec::new();
        }

        self.last_error = Some(ConnectionError::Timeout { phase, elapsed });
        let mut actions = Vec::new();
        self.transition(PeerState::Failed, &mut actions);
        actions.push(ConnectAction::DiscardChannel);
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> (PeerConnection, Instant) {
        let t0 = Instant::now();
        (PeerConnection::new("peer-1", t0, ConnectionConfig::default()), t0)
    }

    /// Drive a machine to Connected, asserting each intermediate state.
    fn connect(conn: &mut PeerConnection, t0: Instant) {
        conn.handle_event(ConnectEvent::ConnectRequested, t0).unwrap();
        assert_eq!(conn.state(), PeerState::Discovering);
        conn.handle_event(ConnectEvent::DiscoveryHit { address: "mem:1".into() }, t0).unwrap();
        assert_eq!(conn.state(), PeerState::Connecting);
        conn.handle_event(ConnectEvent::ChannelOpened, t0).unwrap();
        assert_eq!(conn.state(), PeerState::Handshaking);
        conn.handle_event(ConnectEvent::HandshakeCompleted, t0).unwrap();
        assert_eq!(conn.state(), PeerState::Connected);
    }

    #[test]
    fn full_lifecycle_emits_transitions_and_actions() {
        let (mut conn, t0) = machine();

        let actions = conn.handle_event(ConnectEvent::ConnectRequested, t0).unwrap();
        assert_eq!(actions, vec![
            ConnectAction::EmitTransition {
                from: PeerState::Disconnected,
                to: PeerState::Discovering
            },
            ConnectAction::Discover,
        ]);

        let actions =
            conn.handle_event(ConnectEvent::DiscoveryHit { address: "mem:7".into() }, t0).unwrap();
        assert!(actions.contains(&ConnectAction::OpenChannel { address: "mem:7".into() }));

        let actions = conn.handle_event(ConnectEvent::ChannelOpened, t0).unwrap();
        assert!(actions.contains(&ConnectAction::SendHandshake));

        let actions = conn.handle_event(ConnectEvent::HandshakeCompleted, t0).unwrap();
        assert_eq!(actions, vec![ConnectAction::EmitTransition {
            from: PeerState::Handshaking,
            to: PeerState::Connected
        }]);
        assert!(conn.is_connected());
    }

    #[test]
    fn connect_is_idempotent_while_in_flight() {
        let (mut conn, t0) = machine();
        conn.handle_event(ConnectEvent::ConnectRequested, t0).unwrap();

        for _ in 0..3 {
            let actions = conn.handle_event(ConnectEvent::ConnectRequested, t0).unwrap();
            assert!(actions.is_empty());
            assert_eq!(conn.state(), PeerState::Discovering);
        }
    }

    #[test]
    fn connect_on_connected_peer_is_noop() {
        let (mut conn, t0) = machine();
        connect(&mut conn, t0);

        let actions = conn.handle_event(ConnectEvent::ConnectRequested, t0).unwrap();
        assert!(actions.is_empty());
        assert_eq!(conn.state(), PeerState::Connected);
    }

    #[test]
    fn failed_is_not_sticky() {
        let (mut conn, t0) = machine();
        conn.handle_event(ConnectEvent::ConnectRequested, t0).unwrap();
        conn.handle_event(ConnectEvent::DiscoveryHit { address: "mem:1".into() }, t0).unwrap();
        conn.handle_event(ConnectEvent::ChannelOpened, t0).unwrap();
        conn.handle_event(ConnectEvent::HandshakeFailed { reason: "bad key".into() }, t0)
            .unwrap();
        assert_eq!(conn.state(), PeerState::Failed);
        assert!(conn.last_error().is_some());

        let actions = conn.handle_event(ConnectEvent::ConnectRequested, t0).unwrap();
        assert_eq!(conn.state(), PeerState::Discovering);
        assert!(actions.contains(&ConnectAction::Discover));
        assert!(conn.last_error().is_none());
    }

    #[test]
    fn channel_close_from_connected_returns_to_disconnected() {
        let (mut conn, t0) = machine();
        connect(&mut conn, t0);

        let actions = conn.handle_event(ConnectEvent::ChannelClosed, t0).unwrap();
        assert_eq!(conn.state(), PeerState::Disconnected);
        assert!(actions.contains(&ConnectAction::DiscardChannel));

        // Retry restarts the cycle.
        conn.handle_event(ConnectEvent::ConnectRequested, t0).unwrap();
        assert_eq!(conn.state(), PeerState::Discovering);
    }

    #[test]
    fn channel_close_mid_handshake_fails_the_attempt() {
        let (mut conn, t0) = machine();
        conn.handle_event(ConnectEvent::ConnectRequested, t0).unwrap();
        conn.handle_event(ConnectEvent::DiscoveryHit { address: "mem:1".into() }, t0).unwrap();
        conn.handle_event(ConnectEvent::ChannelOpened, t0).unwrap();

        conn.handle_event(ConnectEvent::ChannelClosed, t0).unwrap();
        assert_eq!(conn.state(), PeerState::Failed);
        assert!(matches!(
            conn.last_error(),
            Some(ConnectionError::ChannelOpenFailed { .. })
        ));
    }

    #[test]
    fn connect_timeout_fails_with_timeout_error() {
        let (mut conn, t0) = machine();
        conn.handle_event(ConnectEvent::ConnectRequested, t0).unwrap();

        let actions = conn.tick(t0 + DEFAULT_CONNECT_TIMEOUT + Duration::from_secs(1));
        assert_eq!(conn.state(), PeerState::Failed);
        assert!(actions.contains(&ConnectAction::DiscardChannel));
        assert!(matches!(
            conn.last_error(),
            Some(ConnectionError::Timeout { phase: "connect", .. })
        ));
    }

    #[test]
    fn handshake_timeout_uses_handshake_deadline() {
        let (mut conn, t0) = machine();
        conn.handle_event(ConnectEvent::ConnectRequested, t0).unwrap();
        conn.handle_event(ConnectEvent::DiscoveryHit { address: "mem:1".into() }, t0).unwrap();

        // The handshake clock restarts when the channel opens.
        let t1 = t0 + Duration::from_secs(5);
        conn.handle_event(ConnectEvent::ChannelOpened, t1).unwrap();

        assert!(conn.tick(t1 + DEFAULT_HANDSHAKE_TIMEOUT).is_empty());
        let actions = conn.tick(t1 + DEFAULT_HANDSHAKE_TIMEOUT + Duration::from_secs(1));
        assert!(!actions.is_empty());
        assert!(matches!(
            conn.last_error(),
            Some(ConnectionError::Timeout { phase: "handshake", .. })
        ));
    }

    #[test]
    fn tick_is_quiet_when_connected() {
        let (mut conn, t0) = machine();
        connect(&mut conn, t0);
        assert!(conn.tick(t0 + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn late_discovery_hit_is_dropped() {
        let (mut conn, t0) = machine();
        connect(&mut conn, t0);

        let actions =
            conn.handle_event(ConnectEvent::DiscoveryHit { address: "mem:9".into() }, t0).unwrap();
        assert!(actions.is_empty());
        assert_eq!(conn.state(), PeerState::Connected);
    }

    #[test]
    fn failed_discovery_fails_the_attempt() {
        let (mut conn, t0) = machine();
        conn.handle_event(ConnectEvent::ConnectRequested, t0).unwrap();

        conn.handle_event(ConnectEvent::AttemptFailed { reason: "no route".into() }, t0).unwrap();
        assert_eq!(conn.state(), PeerState::Failed);
        assert!(matches!(
            conn.last_error(),
            Some(ConnectionError::ChannelOpenFailed { .. })
        ));
    }

    #[test]
    fn late_failure_report_is_dropped() {
        let (mut conn, t0) = machine();
        connect(&mut conn, t0);

        let actions = conn
            .handle_event(ConnectEvent::AttemptFailed { reason: "stale".into() }, t0)
            .unwrap();
        assert!(actions.is_empty());
        assert_eq!(conn.state(), PeerState::Connected);
    }

    #[test]
    fn channel_opened_while_disconnected_is_a_driver_bug() {
        let (mut conn, t0) = machine();
        assert!(matches!(
            conn.handle_event(ConnectEvent::ChannelOpened, t0),
            Err(ConnectionError::InvalidState { state: PeerState::Disconnected, .. })
        ));
    }

    #[test]
    fn handshake_completed_without_channel_is_a_driver_bug() {
        let (mut conn, t0) = machine();
        conn.handle_event(ConnectEvent::ConnectRequested, t0).unwrap();
        assert!(matches!(
            conn.handle_event(ConnectEvent::HandshakeCompleted, t0),
            Err(ConnectionError::InvalidState { .. })
        ));
    }
}
