//! Async connection manager.
//!
//! [`ConnectionManager`] is the driver around the sans-IO core: it owns
//! the [`SessionManager`], one [`PeerConnection`] machine per peer, and
//! the per-group [`GroupSync`] engines, and executes the actions those
//! machines return against a [`Dialer`] and its channels. All protocol
//! decisions stay in the core; this module does I/O, locking, and task
//! management only.
//!
//! One tokio task drives each open channel. Incoming frames are decrypted
//! and classified synchronously under short lock scopes; replies (delivery
//! receipts, gap repair) are written back on the same channel.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use hushlink_core::{
    ConnectAction, ConnectEvent, ConnectionConfig, ConnectionError, Environment, Group,
    GroupMember, GroupMessage, GroupSync, Peer, PeerConnection, PeerId, PeerState, TrustedPeer,
    sync::Applied,
};
use hushlink_crypto::{
    IdentityKeys, NONCE_SIZE, SENDER_KEY_SIZE, SessionManager,
    rendezvous::{daily_tokens_for_ids, hourly_tokens},
};
use hushlink_proto::{
    GroupControl, GroupEnvelope, GroupInvite, Handshake, ReceiptKind, SenderKeyDistribution,
    WireText, classify, receipt_frame, typing_frame,
};

use crate::error::ClientError;
use crate::events::{ClientEvent, PeerTransition};
use crate::relay::RendezvousRelay;
use crate::transport::{BoxedChannel, Dialer, TransportError};

/// Depth of the per-channel outbound queue.
const OUTBOUND_DEPTH: usize = 64;

/// Broadcast buffer for transitions and events.
const BROADCAST_DEPTH: usize = 256;

/// Hex characters in a pairing code.
const PAIRING_CODE_LEN: usize = 8;

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Name announced in handshakes.
    pub display_name: String,
    /// Connection phase timeouts.
    pub connection: ConnectionConfig,
    /// Interval between external announce/poll sweeps.
    pub announce_interval: Duration,
}

impl ManagerConfig {
    /// Configuration with default timeouts.
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            connection: ConnectionConfig::default(),
            announce_interval: Duration::from_secs(30),
        }
    }
}

/// Production environment: real monotonic clock, OS entropy, tokio timers.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// The system environment.
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        use rand::RngCore as _;
        rand::thread_rng().fill_bytes(buffer);
    }
}

/// Address announce published to a rendezvous relay, sealed pairwise.
#[derive(Debug, Serialize, Deserialize)]
struct ExternalAnnounce {
    stable_id: String,
    address: String,
}

struct PeerEntry {
    peer: Peer,
    machine: PeerConnection<Instant>,
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    cancel: Option<CancellationToken>,
}

struct ExternalAccess {
    pairing_code: String,
    cancel: CancellationToken,
}

struct Inner<E> {
    env: E,
    /// Stable public tag of the identity this device was provisioned
    /// with. Survives key rotation so trust records stay addressable.
    device_id: String,
    config: ManagerConfig,
    sessions: Mutex<SessionManager>,
    peers: Mutex<HashMap<String, PeerEntry>>,
    trusted: Mutex<HashMap<String, TrustedPeer>>,
    groups: Mutex<HashMap<String, GroupSync>>,
    dialer: Arc<dyn Dialer>,
    transitions: broadcast::Sender<PeerTransition>,
    events: broadcast::Sender<ClientEvent>,
    external: Mutex<Option<ExternalAccess>>,
    shutdown: CancellationToken,
}

/// Async driver for the Hushlink protocol stack.
///
/// Cheap to clone; clones share all state. Must be used inside a tokio
/// runtime: connecting and accepting spawn one driver task per channel.
pub struct ConnectionManager<E: Environment<Instant = Instant>> {
    inner: Arc<Inner<E>>,
}

impl<E: Environment<Instant = Instant>> Clone for ConnectionManager<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: Environment<Instant = Instant>> ConnectionManager<E> {
    /// Create a manager around a device identity.
    pub fn new(
        env: E,
        identity: IdentityKeys,
        dialer: Arc<dyn Dialer>,
        config: ManagerConfig,
    ) -> Self {
        let device_id = identity.public_tag();
        let (transitions, _) = broadcast::channel(BROADCAST_DEPTH);
        let (events, _) = broadcast::channel(BROADCAST_DEPTH);
        Self {
            inner: Arc::new(Inner {
                env,
                device_id,
                config,
                sessions: Mutex::new(SessionManager::new(identity)),
                peers: Mutex::new(HashMap::new()),
                trusted: Mutex::new(HashMap::new()),
                groups: Mutex::new(HashMap::new()),
                dialer,
                transitions,
                events,
                external: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Stable device id (identity public tag).
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Current identity generation.
    pub fn identity_generation(&self) -> u64 {
        self.inner.sessions.lock().generation()
    }

    /// Exchange public key of the current identity.
    pub fn public_key(&self) -> [u8; 32] {
        self.inner.sessions.lock().identity().exchange_public()
    }

    /// Subscribe to peer state transitions.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<PeerTransition> {
        self.inner.transitions.subscribe()
    }

    /// Subscribe to decoded application events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of all known peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.peers.lock().values().map(|e| e.peer.clone()).collect()
    }

    /// Connection state of a peer, if known.
    pub fn peer_state(&self, peer_id: &str) -> Option<PeerState> {
        self.inner.peers.lock().get(peer_id).map(|e| e.machine.state())
    }

    /// Durably trust a peer's key. Returns the peer's stable tag.
    pub fn trust_peer(&self, display_name: &str, public_key: [u8; 32]) -> String {
        let tag = IdentityKeys::tag_for_public(&public_key);
        let trusted = TrustedPeer::new(tag.clone(), display_name, public_key, Utc::now());
        self.inner.trusted.lock().insert(tag.clone(), trusted);
        tag
    }

    /// All trusted peers.
    pub fn trusted_peers(&self) -> Vec<TrustedPeer> {
        self.inner.trusted.lock().values().cloned().collect()
    }

    /// User confirmed a pending key change out of band.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownPeer`] when the peer is not trusted.
    pub fn acknowledge_key_change(&self, peer_id: &str) -> Result<(), ClientError> {
        let mut trusted = self.inner.trusted.lock();
        let record = trusted
            .get_mut(peer_id)
            .ok_or_else(|| ClientError::UnknownPeer { peer_id: peer_id.to_owned() })?;
        record.acknowledge_key_change();
        Ok(())
    }

    /// Connect to a peer by stable id, via dialer discovery.
    ///
    /// Idempotent: returns `Ok` immediately when an attempt is already in
    /// flight or the peer is connected.
    ///
    /// # Errors
    ///
    /// Connection, transport, or handshake failure; see
    /// [`ConnectionError::is_transient`] for retry guidance.
    pub async fn connect(&self, peer_id: &str) -> Result<(), ClientError> {
        self.connect_inner(peer_id, None).await
    }

    /// Connect to a peer at a known address, skipping discovery.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`ConnectionManager::connect`].
    pub async fn connect_at(&self, peer_id: &str, address: &str) -> Result<(), ClientError> {
        self.connect_inner(peer_id, Some(address.to_owned())).await
    }

    async fn connect_inner(
        &self,
        peer_id: &str,
        mut known_address: Option<String>,
    ) -> Result<(), ClientError> {
        self.ensure_peer(peer_id);
        let first = self.inner.feed(peer_id, ConnectEvent::ConnectRequested)?;
        if first.is_empty() {
            // Already in flight or connected.
            return Ok(());
        }

        let started = self.inner.env.now();
        let mut queue: VecDeque<ConnectAction> = first.into();
        let mut address: Option<String> = None;
        let mut channel: Option<BoxedChannel> = None;

        while let Some(action) = queue.pop_front() {
            match action {
                ConnectAction::EmitTransition { from, to } => {
                    self.inner.emit_transition(peer_id, from, to);
                },

                ConnectAction::Discover => {
                    if let Some(known) = known_address.take() {
                        // Caller-supplied addresses come from a relay
                        // announce or manual entry, not local discovery.
                        self.inner.set_peer_locality(peer_id, false);
                        queue.extend(
                            self.inner
                                .feed(peer_id, ConnectEvent::DiscoveryHit { address: known })?,
                        );
                        continue;
                    }
                    let budget = self.connect_budget(started);
                    match tokio::time::timeout(budget, self.inner.dialer.discover(peer_id)).await {
                        Ok(Ok(hit)) => {
                            self.inner.set_peer_locality(peer_id, true);
                            queue.extend(
                                self.inner
                                    .feed(peer_id, ConnectEvent::DiscoveryHit { address: hit })?,
                            );
                        },
                        Ok(Err(err)) => return self.attempt_failed(peer_id, &mut queue, err),
                        Err(_) => return self.connect_timed_out(peer_id, started, &mut queue),
                    }
                },

                ConnectAction::OpenChannel { address: addr } => {
                    let budget = self.connect_budget(started);
                    match tokio::time::timeout(budget, self.inner.dialer.open(&addr)).await {
                        Ok(Ok(opened)) => {
                            channel = Some(opened);
                            address = Some(addr);
                            queue.extend(self.inner.feed(peer_id, ConnectEvent::ChannelOpened)?);
                        },
                        Ok(Err(err)) => return self.attempt_failed(peer_id, &mut queue, err),
                        Err(_) => return self.connect_timed_out(peer_id, started, &mut queue),
                    }
                },

                ConnectAction::SendHandshake => {
                    let Some(mut opened) = channel.take() else {
                        return Err(ClientError::Protocol(
                            "handshake requested without an open channel".to_owned(),
                        ));
                    };
                    match self.run_handshake(peer_id, &mut opened).await {
                        Ok(()) => {
                            queue.extend(
                                self.inner.feed(peer_id, ConnectEvent::HandshakeCompleted)?,
                            );
                            self.attach_channel(peer_id, opened, address.take());
                            self.send_group_summaries(peer_id).await;
                        },
                        Err(err) => {
                            opened.close().await;
                            let actions = self.inner.feed(
                                peer_id,
                                ConnectEvent::HandshakeFailed { reason: err.to_string() },
                            )?;
                            self.inner.apply_transitions(peer_id, &actions);
                            self.inner.apply_transitions_queued(peer_id, &mut queue);
                            return Err(err);
                        },
                    }
                },

                ConnectAction::CloseChannel | ConnectAction::DiscardChannel => {
                    if let Some(mut opened) = channel.take() {
                        opened.close().await;
                    }
                },
            }
        }
        Ok(())
    }

    /// Remaining time in the combined discovery + channel open budget.
    fn connect_budget(&self, started: Instant) -> Duration {
        let elapsed = self.inner.env.now() - started;
        self.inner.config.connection.connect_timeout.checked_sub(elapsed).unwrap_or(Duration::ZERO)
    }

    fn attempt_failed(
        &self,
        peer_id: &str,
        queue: &mut VecDeque<ConnectAction>,
        err: TransportError,
    ) -> Result<(), ClientError> {
        let actions =
            self.inner.feed(peer_id, ConnectEvent::AttemptFailed { reason: err.to_string() })?;
        self.inner.apply_transitions(peer_id, &actions);
        self.inner.apply_transitions_queued(peer_id, queue);
        Err(err.into())
    }

    fn connect_timed_out(
        &self,
        peer_id: &str,
        started: Instant,
        queue: &mut VecDeque<ConnectAction>,
    ) -> Result<(), ClientError> {
        let now = self.inner.env.now();
        let ticked = {
            let mut peers = self.inner.peers.lock();
            peers.get_mut(peer_id).map(|e| e.machine.tick(now)).unwrap_or_default()
        };
        if ticked.is_empty() {
            // Deadline raced the machine's own clock; force the failure.
            let actions = self
                .inner
                .feed(peer_id, ConnectEvent::AttemptFailed { reason: "timed out".to_owned() })?;
            self.inner.apply_transitions(peer_id, &actions);
        } else {
            self.inner.apply_transitions(peer_id, &ticked);
        }
        self.inner.apply_transitions_queued(peer_id, queue);

        let recorded = {
            let peers = self.inner.peers.lock();
            peers.get(peer_id).and_then(|e| e.machine.last_error().cloned())
        };
        Err(recorded
            .unwrap_or(ConnectionError::Timeout { phase: "connect", elapsed: now - started })
            .into())
    }

    async fn run_handshake(
        &self,
        peer_id: &str,
        channel: &mut BoxedChannel,
    ) -> Result<(), ClientError> {
        let (frame, generation) = {
            let sessions = self.inner.sessions.lock();
            (self.inner.local_handshake(&sessions)?, sessions.generation())
        };
        channel.send(frame.into_bytes()).await?;

        let deadline = self.inner.config.connection.handshake_timeout;
        let Ok(reply) = tokio::time::timeout(deadline, channel.recv()).await else {
            return Err(
                ConnectionError::Timeout { phase: "handshake", elapsed: deadline }.into()
            );
        };
        let Some(reply) = reply else {
            return Err(ConnectionError::HandshakeFailed {
                peer_id: peer_id.to_owned(),
                reason: "channel closed before handshake reply".to_owned(),
            }
            .into());
        };

        let handshake = parse_handshake(peer_id, &reply)?;
        self.inner.verify_handshake(Some(peer_id), &handshake, generation)?;
        Ok(())
    }

    /// Accept an inbound channel.
    ///
    /// Reads the initiator's handshake, replies with ours, and hands the
    /// channel to a driver task. Returns the peer's stable id.
    ///
    /// # Errors
    ///
    /// Handshake verification failure, timeout, or a channel arriving for
    /// a peer whose connection is already in flight.
    pub async fn accept(&self, mut channel: BoxedChannel) -> Result<String, ClientError> {
        let deadline = self.inner.config.connection.handshake_timeout;
        let first = match tokio::time::timeout(deadline, channel.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                return Err(TransportError::ChannelClosed.into());
            },
            Err(_) => {
                channel.close().await;
                return Err(
                    ConnectionError::Timeout { phase: "handshake", elapsed: deadline }.into()
                );
            },
        };

        let handshake = parse_inbound_handshake(&first)?;
        let peer_id = handshake.stable_id.clone();
        self.ensure_peer(&peer_id);

        // Replay the inbound path through the state machine so observers
        // see the same transitions as for outbound connects.
        for event in [
            ConnectEvent::ConnectRequested,
            ConnectEvent::DiscoveryHit { address: "inbound".to_owned() },
            ConnectEvent::ChannelOpened,
        ] {
            match self.inner.feed(&peer_id, event) {
                Ok(actions) => self.inner.apply_transitions(&peer_id, &actions),
                Err(err) => {
                    channel.close().await;
                    return Err(err);
                },
            }
        }

        let generation = self.inner.sessions.lock().generation();
        if let Err(err) = self.inner.verify_handshake(None, &handshake, generation) {
            let actions = self
                .inner
                .feed(&peer_id, ConnectEvent::HandshakeFailed { reason: err.to_string() })?;
            self.inner.apply_transitions(&peer_id, &actions);
            channel.close().await;
            return Err(err);
        }

        let reply = {
            let sessions = self.inner.sessions.lock();
            self.inner.local_handshake(&sessions)?
        };
        if let Err(err) = channel.send(reply.into_bytes()).await {
            if let Ok(actions) = self.inner.feed(&peer_id, ConnectEvent::ChannelClosed) {
                self.inner.apply_transitions(&peer_id, &actions);
            }
            return Err(err.into());
        }

        let actions = self.inner.feed(&peer_id, ConnectEvent::HandshakeCompleted)?;
        self.inner.apply_transitions(&peer_id, &actions);
        self.attach_channel(&peer_id, channel, None);
        self.send_group_summaries(&peer_id).await;
        Ok(peer_id)
    }

    /// Tear down the channel to a peer, if any.
    pub fn disconnect(&self, peer_id: &str) {
        self.inner.teardown_channel(peer_id);
    }

    /// Send a chat message over the pairwise session.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] unless the peer is fully
    /// connected.
    pub async fn send_message(&self, peer_id: &str, text: &str) -> Result<(), ClientError> {
        if !self.is_connected(peer_id) {
            return Err(ConnectionError::NotConnected { peer_id: peer_id.to_owned() }.into());
        }
        let sealed = self.inner.seal_to(peer_id, text)?;
        self.inner.send_raw(peer_id, sealed).await
    }

    /// Send a typing indicator. Best effort: silently dropped when the
    /// peer is not connected.
    pub async fn send_typing(&self, peer_id: &str, active: bool) {
        self.send_signal(peer_id, &typing_frame(active)).await;
    }

    /// Send a read receipt. Best effort, like typing indicators.
    /// (Delivery receipts are sent automatically on message receipt.)
    pub async fn send_read_receipt(&self, peer_id: &str) {
        self.send_signal(peer_id, &receipt_frame(ReceiptKind::Read)).await;
    }

    async fn send_signal(&self, peer_id: &str, frame: &str) {
        if !self.is_connected(peer_id) {
            return;
        }
        match self.inner.seal_to(peer_id, frame) {
            Ok(sealed) => {
                if let Err(err) = self.inner.send_raw(peer_id, sealed).await {
                    tracing::debug!(peer_id, error = %err, "signal frame dropped");
                }
            },
            Err(err) => tracing::debug!(peer_id, error = %err, "signal frame not sealed"),
        }
    }

    /// Create a group with the local device as only member.
    pub fn create_group(&self, group_id: &str, name: &str) {
        let mut own_key = [0u8; SENDER_KEY_SIZE];
        self.inner.env.random_bytes(&mut own_key);
        let group = Group::new(
            group_id,
            name,
            &self.inner.device_id,
            &self.inner.config.display_name,
            Utc::now(),
        );
        self.inner.groups.lock().insert(group_id.to_owned(), GroupSync::new(group, own_key));
    }

    /// Invite a connected peer into a group.
    ///
    /// Adds the peer to the local roster, then sends the invitation to
    /// the invitee and a roster update to every other connected member.
    ///
    /// # Errors
    ///
    /// [`ClientError::UnknownGroup`], [`ConnectionError::NotConnected`],
    /// or the group member cap.
    pub async fn invite_to_group(&self, group_id: &str, peer_id: &str) -> Result<(), ClientError> {
        if !self.is_connected(peer_id) {
            return Err(ConnectionError::NotConnected { peer_id: peer_id.to_owned() }.into());
        }
        let (display_name, public_key) = {
            let peers = self.inner.peers.lock();
            let entry = peers
                .get(peer_id)
                .ok_or_else(|| ClientError::UnknownPeer { peer_id: peer_id.to_owned() })?;
            (entry.peer.display_name.clone(), entry.peer.public_key)
        };

        let (frame, recipients) = {
            let mut groups = self.inner.groups.lock();
            let sync = groups
                .get_mut(group_id)
                .ok_or_else(|| ClientError::UnknownGroup { group_id: group_id.to_owned() })?;
            let member = GroupMember {
                device_id: peer_id.to_owned(),
                display_name,
                public_key,
                joined_at: Utc::now(),
            };
            // The invite frame itself carries every sender key, so the
            // per-member distribution is redundant here.
            sync.add_member(member)?;
            let frame = sync.invite().to_frame()?;
            let recipients: Vec<String> = sync
                .group()
                .members
                .iter()
                .map(|m| m.device_id.clone())
                .filter(|id| id != &self.inner.device_id)
                .collect();
            (frame, recipients)
        };

        for recipient in recipients {
            if !self.is_connected(&recipient) {
                continue;
            }
            let sealed = match self.inner.seal_to(&recipient, &frame) {
                Ok(sealed) => sealed,
                Err(err) if recipient == peer_id => return Err(err),
                Err(err) => {
                    tracing::debug!(recipient = %recipient, error = %err, "roster update not sealed");
                    continue;
                },
            };
            match self.inner.send_raw(&recipient, sealed).await {
                Ok(()) => {},
                Err(err) if recipient == peer_id => return Err(err),
                Err(err) => {
                    tracing::debug!(recipient = %recipient, error = %err, "roster update dropped");
                },
            }
        }
        Ok(())
    }

    /// Seal and fan out a group message to every connected member.
    ///
    /// Returns the plaintext record for local display and storage.
    /// Members without a live channel catch up later through gap repair.
    ///
    /// # Errors
    ///
    /// [`ClientError::UnknownGroup`] or a sealing failure.
    pub async fn send_group_message(
        &self,
        group_id: &str,
        text: &str,
    ) -> Result<GroupMessage, ClientError> {
        let mut nonce = [0u8; NONCE_SIZE];
        self.inner.env.random_bytes(&mut nonce);

        let (frame, message, recipients) = {
            let mut groups = self.inner.groups.lock();
            let sync = groups
                .get_mut(group_id)
                .ok_or_else(|| ClientError::UnknownGroup { group_id: group_id.to_owned() })?;
            let (envelope, message) = sync.send(text.as_bytes(), nonce)?;
            let frame = envelope.to_frame()?;
            let recipients: Vec<String> = sync
                .group()
                .members
                .iter()
                .map(|m| m.device_id.clone())
                .filter(|id| id != &self.inner.device_id)
                .collect();
            (frame, message, recipients)
        };

        for recipient in recipients {
            if !self.is_connected(&recipient) {
                continue;
            }
            match self.inner.seal_to(&recipient, &frame) {
                Ok(sealed) => {
                    if let Err(err) = self.inner.send_raw(&recipient, sealed).await {
                        tracing::debug!(recipient = %recipient, error = %err, "group message dropped");
                    }
                },
                Err(err) => {
                    tracing::debug!(recipient = %recipient, error = %err, "group message not sealed");
                },
            }
        }
        Ok(message)
    }

    /// Groups the local device belongs to, as `(id, name)` pairs.
    pub fn groups(&self) -> Vec<(String, String)> {
        self.inner
            .groups
            .lock()
            .values()
            .map(|s| (s.group().id.clone(), s.group().name.clone()))
            .collect()
    }

    /// Enable relay rendezvous for trusted peers.
    ///
    /// Spawns a sweep task that announces the given address under the
    /// pairwise daily and hourly tokens of every trusted peer and polls
    /// the same tokens for their announces, connecting to any
    /// disconnected peer it finds. Returns a pairing code for
    /// out-of-band verification.
    pub fn enable_external(
        &self,
        relay: Arc<dyn RendezvousRelay>,
        announce_address: impl Into<String>,
    ) -> String {
        self.disable_external();
        let pairing_code = self.inner.env.random_hex(PAIRING_CODE_LEN);
        let cancel = self.inner.shutdown.child_token();
        *self.inner.external.lock() =
            Some(ExternalAccess { pairing_code: pairing_code.clone(), cancel: cancel.clone() });

        let manager = self.clone();
        let address = announce_address.into();
        tokio::spawn(async move {
            loop {
                manager.external_sweep(relay.as_ref(), &address).await;
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = manager.inner.env.sleep(manager.inner.config.announce_interval) => {},
                }
            }
        });
        pairing_code
    }

    /// Stop relay rendezvous.
    pub fn disable_external(&self) {
        if let Some(external) = self.inner.external.lock().take() {
            external.cancel.cancel();
        }
    }

    /// Pairing code of the active external access, if enabled.
    pub fn pairing_code(&self) -> Option<String> {
        self.inner.external.lock().as_ref().map(|e| e.pairing_code.clone())
    }

    async fn external_sweep(&self, relay: &dyn RendezvousRelay, announce_address: &str) {
        let trusted: Vec<TrustedPeer> = self.trusted_peers();
        for peer in trusted {
            // Announce sealing and hourly tokens need a session; derive
            // one from the trusted key if no handshake has happened yet.
            let secret = {
                let mut sessions = self.inner.sessions.lock();
                if !sessions.has_session(&peer.id)
                    && sessions.establish(&peer.id, &peer.public_key).is_err()
                {
                    continue;
                }
                sessions.shared_secret(&peer.id)
            };

            let now = Utc::now();
            let daily = daily_tokens_for_ids(&self.inner.device_id, &peer.id, now);
            let hourly = secret.map(|secret| hourly_tokens(&*secret, now));

            let mut tokens: Vec<&String> = daily.iter().collect();
            if let Some(hourly) = &hourly {
                tokens.extend(hourly.iter());
            }
            for token in tokens {
                let Ok(envelopes) = relay.poll(token).await else { continue };
                for envelope in envelopes {
                    self.handle_announce(&peer.id, &envelope).await;
                }
            }

            let announce = ExternalAnnounce {
                stable_id: self.inner.device_id.clone(),
                address: announce_address.to_owned(),
            };
            let Ok(json) = serde_json::to_string(&announce) else { continue };
            // Publish under the current window of each family only;
            // pollers check the adjacent windows too, covering timezone
            // and midnight skew.
            let mut publish_under = vec![&daily[1]];
            if let Some(hourly) = &hourly {
                publish_under.push(&hourly[1]);
            }
            for token in publish_under {
                let Ok(sealed) = self.inner.seal_to(&peer.id, &json) else { continue };
                if let Err(err) = relay.publish(token, sealed).await {
                    tracing::debug!(peer_id = %peer.id, error = %err, "announce publish failed");
                }
            }
        }
    }

    async fn handle_announce(&self, peer_id: &str, sealed: &[u8]) {
        let opened = {
            let mut sessions = self.inner.sessions.lock();
            sessions.open(peer_id, sealed)
        };
        // Replays of announces seen in earlier sweeps fail here; that is
        // the dedupe mechanism, not an attack.
        let Ok(bytes) = opened else { return };
        let Ok(announce) = serde_json::from_slice::<ExternalAnnounce>(&bytes) else {
            return;
        };
        if announce.stable_id == self.inner.device_id || announce.stable_id != peer_id {
            return;
        }
        if self.is_connected(peer_id) {
            return;
        }
        if let Err(err) = self.connect_at(peer_id, &announce.address).await {
            tracing::debug!(peer_id, error = %err, "rendezvous connect failed");
        }
    }

    /// Rotate the device identity.
    ///
    /// Destroys every pairwise session, tears down every channel, and
    /// bumps the generation so in-flight handshakes cannot complete
    /// against the old keys. Returns the new generation.
    pub fn regenerate_identity(&self) -> u64 {
        let generation = {
            let mut signing = [0u8; 32];
            let mut exchange = [0u8; 32];
            self.inner.env.random_bytes(&mut signing);
            self.inner.env.random_bytes(&mut exchange);
            self.inner.sessions.lock().regenerate_identity(signing, exchange)
        };
        for peer_id in self.known_peer_ids() {
            self.inner.teardown_channel(&peer_id);
        }
        tracing::info!(generation, "identity rotated");
        generation
    }

    /// Tear everything down: external access, every channel, all tasks.
    pub fn shutdown(&self) {
        self.disable_external();
        for peer_id in self.known_peer_ids() {
            self.inner.teardown_channel(&peer_id);
        }
        self.inner.shutdown.cancel();
    }

    fn known_peer_ids(&self) -> Vec<String> {
        self.inner.peers.lock().keys().cloned().collect()
    }

    fn is_connected(&self, peer_id: &str) -> bool {
        self.inner.peers.lock().get(peer_id).is_some_and(|e| e.machine.is_connected())
    }

    /// Hand a handshaken channel to its driver task.
    fn attach_channel(&self, peer_id: &str, channel: BoxedChannel, address: Option<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_DEPTH);
        let cancel = self.inner.shutdown.child_token();
        let displaced = {
            let mut peers = self.inner.peers.lock();
            let Some(entry) = peers.get_mut(peer_id) else { return };
            entry.outbound = Some(tx);
            let displaced = entry.cancel.replace(cancel.clone());
            if address.is_some() {
                entry.peer.address = address;
            }
            displaced
        };
        // Simultaneous connects can race a second channel in; the loser's
        // driver must not linger and steal frames from the winner.
        if let Some(displaced) = displaced {
            displaced.cancel();
        }
        tokio::spawn(drive_channel(
            Arc::clone(&self.inner),
            peer_id.to_owned(),
            channel,
            rx,
            cancel,
        ));
    }

    fn ensure_peer(&self, peer_id: &str) {
        let now = self.inner.env.now();
        let config = self.inner.config.connection.clone();
        let mut peers = self.inner.peers.lock();
        peers.entry(peer_id.to_owned()).or_insert_with(|| PeerEntry {
            peer: Peer::new(PeerId::from_string(peer_id), ""),
            machine: PeerConnection::new(peer_id, now, config),
            outbound: None,
            cancel: None,
        });
    }

    /// Advertise local group clocks to a freshly connected member.
    async fn send_group_summaries(&self, peer_id: &str) {
        let frames: Vec<String> = {
            let groups = self.inner.groups.lock();
            groups
                .values()
                .filter(|s| s.group().has_member(peer_id))
                .filter_map(|s| GroupControl::Summary(s.clock_summary()).to_frame().ok())
                .collect()
        };
        for frame in frames {
            match self.inner.seal_to(peer_id, &frame) {
                Ok(sealed) => {
                    if let Err(err) = self.inner.send_raw(peer_id, sealed).await {
                        tracing::debug!(peer_id, error = %err, "clock summary dropped");
                    }
                },
                Err(err) => tracing::debug!(peer_id, error = %err, "clock summary not sealed"),
            }
        }
    }
}

impl<E: Environment<Instant = Instant>> Inner<E> {
    fn feed(&self, peer_id: &str, event: ConnectEvent) -> Result<Vec<ConnectAction>, ClientError> {
        let now = self.env.now();
        let mut peers = self.peers.lock();
        let entry = peers
            .get_mut(peer_id)
            .ok_or_else(|| ClientError::UnknownPeer { peer_id: peer_id.to_owned() })?;
        Ok(entry.machine.handle_event(event, now)?)
    }

    fn set_peer_locality(&self, peer_id: &str, is_local: bool) {
        let mut peers = self.peers.lock();
        if let Some(entry) = peers.get_mut(peer_id) {
            entry.peer.is_local = is_local;
        }
    }

    fn emit_transition(&self, peer_id: &str, from: PeerState, to: PeerState) {
        {
            let mut peers = self.peers.lock();
            if let Some(entry) = peers.get_mut(peer_id) {
                entry.peer.state = to;
            }
        }
        tracing::debug!(peer_id, ?from, ?to, "peer transition");
        let _ = self
            .transitions
            .send(PeerTransition { peer_id: peer_id.to_owned(), from, to });
    }

    fn apply_transitions(&self, peer_id: &str, actions: &[ConnectAction]) {
        for action in actions {
            if let ConnectAction::EmitTransition { from, to } = action {
                self.emit_transition(peer_id, *from, *to);
            }
        }
    }

    fn apply_transitions_queued(&self, peer_id: &str, queue: &mut VecDeque<ConnectAction>) {
        while let Some(action) = queue.pop_front() {
            if let ConnectAction::EmitTransition { from, to } = action {
                self.emit_transition(peer_id, from, to);
            }
        }
    }

    fn emit_event(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn local_handshake(&self, sessions: &SessionManager) -> Result<String, ClientError> {
        let handshake = Handshake {
            public_key: BASE64.encode(sessions.identity().exchange_public()),
            stable_id: self.device_id.clone(),
            display_name: self.config.display_name.clone(),
            generation: sessions.generation(),
        };
        Ok(handshake.to_frame()?)
    }

    /// Verify a peer handshake and establish the session.
    ///
    /// `expected_peer` is set on the initiator side, where the caller
    /// already knows who it dialed.
    fn verify_handshake(
        &self,
        expected_peer: Option<&str>,
        handshake: &Handshake,
        started_generation: u64,
    ) -> Result<(), ClientError> {
        let peer_id = handshake.stable_id.as_str();
        if let Some(expected) = expected_peer
            && expected != peer_id
        {
            return Err(ConnectionError::HandshakeFailed {
                peer_id: expected.to_owned(),
                reason: format!("peer identified as {peer_id}"),
            }
            .into());
        }

        let public_key: [u8; 32] = BASE64
            .decode(&handshake.public_key)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| ConnectionError::HandshakeFailed {
                peer_id: peer_id.to_owned(),
                reason: "malformed exchange public key".to_owned(),
            })?;

        {
            let mut sessions = self.sessions.lock();
            if sessions.generation() != started_generation {
                return Err(ConnectionError::HandshakeFailed {
                    peer_id: peer_id.to_owned(),
                    reason: "local identity rotated during handshake".to_owned(),
                }
                .into());
            }
            sessions.establish(peer_id, &public_key)?;
        }

        let rotated = {
            let mut trusted = self.trusted.lock();
            trusted.get_mut(peer_id).map(|record| record.record_key(public_key, Utc::now()))
        };
        if rotated == Some(true) {
            tracing::warn!(peer_id, "trusted peer presented a new key");
            self.emit_event(ClientEvent::KeyRotation { peer_id: peer_id.to_owned() });
        }

        {
            let mut peers = self.peers.lock();
            if let Some(entry) = peers.get_mut(peer_id) {
                entry.peer.display_name = handshake.display_name.clone();
                entry.peer.public_key = Some(public_key);
                entry.peer.last_seen = Some(Utc::now());
            }
        }
        Ok(())
    }

    fn teardown_channel(&self, peer_id: &str) {
        let cancel = {
            let mut peers = self.peers.lock();
            peers.get_mut(peer_id).and_then(|entry| {
                entry.outbound = None;
                entry.cancel.take()
            })
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.on_channel_closed(peer_id);
    }

    fn on_channel_closed(&self, peer_id: &str) {
        // ChannelClosed is invalid while no channel exists (e.g. an
        // attempt abandoned in discovery); force the attempt failed so
        // the machine never strands mid-flight.
        let fed = self.feed(peer_id, ConnectEvent::ChannelClosed).or_else(|_| {
            self.feed(peer_id, ConnectEvent::AttemptFailed { reason: "disconnected".to_owned() })
        });
        let Ok(actions) = fed else {
            return;
        };
        {
            let mut peers = self.peers.lock();
            if let Some(entry) = peers.get_mut(peer_id) {
                entry.outbound = None;
                entry.cancel = None;
            }
        }
        self.apply_transitions(peer_id, &actions);
    }

    fn seal_to(&self, peer_id: &str, text: &str) -> Result<Vec<u8>, ClientError> {
        let mut nonce = [0u8; NONCE_SIZE];
        self.env.random_bytes(&mut nonce);
        let sessions = self.sessions.lock();
        Ok(sessions.seal(peer_id, text.as_bytes(), nonce)?)
    }

    async fn send_raw(&self, peer_id: &str, frame: Vec<u8>) -> Result<(), ClientError> {
        let tx = {
            let peers = self.peers.lock();
            peers.get(peer_id).and_then(|entry| entry.outbound.clone())
        }
        .ok_or_else(|| ConnectionError::NotConnected { peer_id: peer_id.to_owned() })?;
        tx.send(frame)
            .await
            .map_err(|_| ConnectionError::NotConnected { peer_id: peer_id.to_owned() }.into())
    }

    /// Decrypt, classify, and dispatch one incoming frame.
    ///
    /// Returns sealed reply frames to write back on the same channel.
    /// Undecryptable or malformed frames are dropped with a warning; they
    /// never tear the channel down.
    fn handle_frame(&self, peer_id: &str, frame: &[u8]) -> Vec<Vec<u8>> {
        let plaintext = {
            let mut sessions = self.sessions.lock();
            sessions.open(peer_id, frame)
        };
        let plaintext = match plaintext {
            Ok(plaintext) => plaintext,
            Err(err) => {
                tracing::warn!(peer_id, error = %err, "dropping undecryptable frame");
                if err.is_security_relevant() {
                    self.emit_event(ClientEvent::SecurityAlert {
                        peer_id: peer_id.to_owned(),
                        detail: err.to_string(),
                    });
                }
                return Vec::new();
            },
        };
        let Ok(text) = String::from_utf8(plaintext) else {
            tracing::warn!(peer_id, "dropping non-utf8 frame");
            return Vec::new();
        };

        {
            let mut peers = self.peers.lock();
            if let Some(entry) = peers.get_mut(peer_id) {
                entry.peer.last_seen = Some(Utc::now());
            }
        }

        match classify(&text) {
            Ok(WireText::Chat(message)) => {
                self.emit_event(ClientEvent::Message {
                    peer_id: peer_id.to_owned(),
                    text: message.to_owned(),
                });
                // Automatic delivery receipt.
                match self.seal_to(peer_id, &receipt_frame(ReceiptKind::Delivered)) {
                    Ok(sealed) => vec![sealed],
                    Err(_) => Vec::new(),
                }
            },
            Ok(WireText::Typing(active)) => {
                self.emit_event(ClientEvent::Typing { peer_id: peer_id.to_owned(), active });
                Vec::new()
            },
            Ok(WireText::Receipt(kind)) => {
                self.emit_event(ClientEvent::Receipt { peer_id: peer_id.to_owned(), kind });
                Vec::new()
            },
            Ok(WireText::GroupInvite(payload)) => self.handle_group_invite(peer_id, payload),
            Ok(WireText::GroupData(payload)) => {
                self.handle_group_data(peer_id, payload);
                Vec::new()
            },
            Ok(WireText::GroupSync(payload)) => self.handle_group_sync(peer_id, payload),
            Err(err) => {
                tracing::warn!(peer_id, error = %err, "dropping malformed frame");
                Vec::new()
            },
        }
    }

    fn handle_group_invite(&self, peer_id: &str, payload: &str) -> Vec<Vec<u8>> {
        let invite = match GroupInvite::from_payload(payload) {
            Ok(invite) => invite,
            Err(err) => {
                tracing::warn!(peer_id, error = %err, "dropping malformed group invite");
                return Vec::new();
            },
        };

        let already_member = self.groups.lock().contains_key(&invite.group_id);
        if already_member {
            self.refresh_roster(&invite);
            return Vec::new();
        }

        let mut own_key = [0u8; SENDER_KEY_SIZE];
        self.env.random_bytes(&mut own_key);
        let sync = match GroupSync::from_invite(&invite, &self.device_id, own_key, Utc::now()) {
            Ok(sync) => sync,
            Err(err) => {
                tracing::warn!(peer_id, group_id = %invite.group_id, error = %err, "rejected group invite");
                return Vec::new();
            },
        };
        self.groups.lock().insert(invite.group_id.clone(), sync);
        tracing::info!(group_id = %invite.group_id, "joined group via invitation");
        self.emit_event(ClientEvent::GroupJoined {
            group_id: invite.group_id.clone(),
            name: invite.name.clone(),
        });

        // Announce our own sender key back to the inviter.
        let distribution = SenderKeyDistribution {
            group_id: invite.group_id,
            member_id: self.device_id.clone(),
            sender_keys: BTreeMap::from([(self.device_id.clone(), BASE64.encode(own_key))]),
        };
        let Ok(frame) = GroupControl::Keys(distribution).to_frame() else {
            return Vec::new();
        };
        match self.seal_to(peer_id, &frame) {
            Ok(sealed) => vec![sealed],
            Err(_) => Vec::new(),
        }
    }

    /// Apply an invite received for a group we already belong to as a
    /// roster update.
    fn refresh_roster(&self, invite: &GroupInvite) {
        let mut groups = self.groups.lock();
        let Some(sync) = groups.get_mut(&invite.group_id) else { return };

        for member in &invite.members {
            if member.device_id == self.device_id || sync.group().has_member(&member.device_id) {
                continue;
            }
            let record = GroupMember {
                device_id: member.device_id.clone(),
                display_name: member.display_name.clone(),
                public_key: decode_key_bytes(&member.public_key),
                joined_at: Utc::now(),
            };
            if let Err(err) = sync.add_member(record) {
                tracing::warn!(group_id = %invite.group_id, error = %err, "roster update rejected");
            }
        }
        for (device_id, encoded) in &invite.sender_keys {
            if device_id == &self.device_id {
                continue;
            }
            let Ok(key) = BASE64.decode(encoded) else { continue };
            if let Err(err) = sync.install_member_key(device_id, &key) {
                tracing::debug!(group_id = %invite.group_id, device_id = %device_id, error = %err, "sender key not installed");
            }
        }
    }

    fn handle_group_data(&self, peer_id: &str, payload: &str) {
        let envelope = match GroupEnvelope::from_payload(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(peer_id, error = %err, "dropping malformed group envelope");
                return;
            },
        };

        let applied = {
            let mut groups = self.groups.lock();
            let Some(sync) = groups.get_mut(&envelope.group_id) else {
                tracing::debug!(peer_id, group_id = %envelope.group_id, "envelope for unknown group");
                return;
            };
            sync.apply(&envelope)
        };
        match applied {
            Ok(Applied::New(message)) => {
                self.emit_event(ClientEvent::GroupMessage {
                    peer_id: peer_id.to_owned(),
                    message,
                });
            },
            Ok(Applied::Duplicate) => {},
            Err(err) => {
                tracing::warn!(
                    peer_id,
                    group_id = %envelope.group_id,
                    error = %err,
                    security = err.is_security_relevant(),
                    "group envelope rejected"
                );
                if err.is_security_relevant() {
                    self.emit_event(ClientEvent::SecurityAlert {
                        peer_id: peer_id.to_owned(),
                        detail: err.to_string(),
                    });
                }
            },
        }
    }

    fn handle_group_sync(&self, peer_id: &str, payload: &str) -> Vec<Vec<u8>> {
        let control = match GroupControl::from_payload(payload) {
            Ok(control) => control,
            Err(err) => {
                tracing::warn!(peer_id, error = %err, "dropping malformed group control");
                return Vec::new();
            },
        };

        match control {
            GroupControl::Summary(summary) => {
                let request = {
                    let groups = self.groups.lock();
                    groups.get(&summary.group_id).and_then(|sync| sync.gap_request(&summary))
                };
                let Some(request) = request else { return Vec::new() };
                let Ok(frame) = GroupControl::Repair(request).to_frame() else {
                    return Vec::new();
                };
                match self.seal_to(peer_id, &frame) {
                    Ok(sealed) => vec![sealed],
                    Err(_) => Vec::new(),
                }
            },

            GroupControl::Repair(request) => {
                let served = {
                    let groups = self.groups.lock();
                    groups.get(&request.group_id).map(|sync| sync.serve_gap_request(&request))
                };
                match served {
                    Some(Ok(envelopes)) => envelopes
                        .iter()
                        .filter_map(|envelope| envelope.to_frame().ok())
                        .filter_map(|frame| self.seal_to(peer_id, &frame).ok())
                        .collect(),
                    Some(Err(err)) => {
                        tracing::warn!(peer_id, group_id = %request.group_id, error = %err, "gap repair refused");
                        Vec::new()
                    },
                    None => Vec::new(),
                }
            },

            GroupControl::Keys(distribution) => {
                let mut groups = self.groups.lock();
                let Some(sync) = groups.get_mut(&distribution.group_id) else {
                    return Vec::new();
                };
                for (device_id, encoded) in &distribution.sender_keys {
                    if device_id == &self.device_id {
                        continue;
                    }
                    let Ok(key) = BASE64.decode(encoded) else { continue };
                    if let Err(err) = sync.install_member_key(device_id, &key) {
                        tracing::debug!(device_id = %device_id, error = %err, "sender key not installed");
                    }
                }
                Vec::new()
            },
        }
    }
}

fn decode_key_bytes(encoded: &str) -> Option<[u8; 32]> {
    if encoded.is_empty() {
        return None;
    }
    BASE64.decode(encoded).ok().and_then(|bytes| bytes.try_into().ok())
}

fn parse_handshake(peer_id: &str, frame: &[u8]) -> Result<Handshake, ClientError> {
    let text = std::str::from_utf8(frame).map_err(|_| ConnectionError::HandshakeFailed {
        peer_id: peer_id.to_owned(),
        reason: "handshake frame is not utf-8".to_owned(),
    })?;
    Handshake::from_frame(text).map_err(|err| {
        ConnectionError::HandshakeFailed { peer_id: peer_id.to_owned(), reason: err.to_string() }
            .into()
    })
}

fn parse_inbound_handshake(frame: &[u8]) -> Result<Handshake, ClientError> {
    let text = std::str::from_utf8(frame)
        .map_err(|_| ClientError::Protocol("handshake frame is not utf-8".to_owned()))?;
    Ok(Handshake::from_frame(text)?)
}

/// Drive one channel: pump outbound frames, dispatch inbound ones.
async fn drive_channel<E: Environment<Instant = Instant>>(
    inner: Arc<Inner<E>>,
    peer_id: String,
    mut channel: BoxedChannel,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                channel.close().await;
                break;
            },

            inbound = channel.recv() => match inbound {
                Some(frame) => {
                    let replies = inner.handle_frame(&peer_id, &frame);
                    let mut write_failed = false;
                    for reply in replies {
                        if channel.send(reply).await.is_err() {
                            write_failed = true;
                            break;
                        }
                    }
                    if write_failed {
                        inner.on_channel_closed(&peer_id);
                        break;
                    }
                },
                None => {
                    inner.on_channel_closed(&peer_id);
                    break;
                },
            },

            queued = outbound.recv() => match queued {
                Some(frame) => {
                    if channel.send(frame).await.is_err() {
                        inner.on_channel_closed(&peer_id);
                        break;
                    }
                },
                None => {
                    channel.close().await;
                    break;
                },
            },
        }
    }
}
