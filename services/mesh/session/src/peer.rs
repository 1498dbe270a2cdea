//! Peer table and per-peer connection state machine.
//!
//! Every peer the node has ever heard of lives in one [`PeerTable`] keyed by
//! [`PeerId`]. Peers are never removed; a peer that drops out of range goes
//! back to [`ConnectionState::Disconnected`] and may reappear later.
//!
//! ```text
//!                discovered            link_established
//!  Disconnected ───────────► Connecting ───────────────► Connected
//!       ▲  ▲                     │                         │    │
//!       │  │ backoff elapsed     │ link lost / timeout     │    │ begin_disconnect /
//!       │  └──────── Failed ◄────┘◄────── link error ──────┘    │ clean link loss
//!       │                                                       ▼
//!       └──────────────────────────────────────────────── Disconnecting
//! ```

use bytes::Bytes;
use mesh_wire::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Connection state of a single peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No link and no attempt in progress
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Link established
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// Last attempt or link failed; waiting out the backoff
    Failed,
}

impl ConnectionState {
    /// Whether a discovery event should start a new connection attempt
    pub fn accepts_connect(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Everything the node knows about one peer
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer identifier
    pub id: PeerId,
    /// Advertised or announced nickname
    pub nickname: Option<String>,
    /// Current connection state
    pub state: ConnectionState,
    /// When the state last changed
    pub state_since: Instant,
    /// Last time anything was heard from this peer
    pub last_seen: Instant,
    /// Last reported signal strength
    pub rssi: Option<i32>,
    /// Opaque key material owned by the identity layer
    pub noise_public_key: Option<Bytes>,
    /// Opaque key material owned by the identity layer
    pub signing_public_key: Option<Bytes>,
    /// Consecutive failed attempts since the last successful link
    pub failures: u32,
    /// Number of links established over the peer's lifetime
    pub connection_count: u32,
    /// Start of the most recent connection attempt
    pub last_connection_attempt: Option<Instant>,
    /// Sent a `Leave` and has not been heard from since
    pub departed: bool,
}

impl Peer {
    fn new(id: PeerId, now: Instant) -> Self {
        Self {
            id,
            nickname: None,
            state: ConnectionState::Disconnected,
            state_since: now,
            last_seen: now,
            rssi: None,
            noise_public_key: None,
            signing_public_key: None,
            failures: 0,
            connection_count: 0,
            last_connection_attempt: None,
            departed: false,
        }
    }

    fn set_state(&mut self, state: ConnectionState, now: Instant) {
        if self.state != state {
            debug!("Peer {} {} -> {}", self.id, self.state, state);
            self.state = state;
            self.state_since = now;
        }
    }

    /// Serializable view relative to `now`
    pub fn snapshot(&self, now: Instant) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id,
            nickname: self.nickname.clone(),
            state: self.state,
            last_seen_ms_ago: now.saturating_duration_since(self.last_seen).as_millis() as u64,
            rssi: self.rssi,
            failures: self.failures,
            connection_count: self.connection_count,
            has_identity_keys: self.noise_public_key.is_some() || self.signing_public_key.is_some(),
            departed: self.departed,
        }
    }
}

/// Serializable summary of a peer for collaborators and reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    /// Peer identifier
    pub id: PeerId,
    /// Nickname, if known
    pub nickname: Option<String>,
    /// Connection state
    pub state: ConnectionState,
    /// Milliseconds since the peer was last heard from
    pub last_seen_ms_ago: u64,
    /// Last reported signal strength
    pub rssi: Option<i32>,
    /// Consecutive failures
    pub failures: u32,
    /// Lifetime link count
    pub connection_count: u32,
    /// Whether the identity layer attached keys
    pub has_identity_keys: bool,
    /// Peer announced that it left the mesh
    #[serde(default)]
    pub departed: bool,
}

/// Outcome of a discovery event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryAction {
    /// Start a connection attempt
    Connect,
    /// Already connecting or connected; nothing to do
    AlreadyActive,
    /// Peer is tearing down; ignore until it settles
    Ignored,
}

/// Single table of all known peers.
///
/// Peers live in an arena indexed by [`PeerId`], so there is exactly one
/// place to look up a peer and its link state.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: Vec<Peer>,
    index: HashMap<PeerId, usize>,
}

impl PeerTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a peer
    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.index.get(id).map(|&slot| &self.peers[slot])
    }

    /// Whether the peer has ever been seen
    pub fn contains(&self, id: &PeerId) -> bool {
        self.index.contains_key(id)
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are known
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Iterate over every known peer
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    /// Ids of peers with an established link
    pub fn connected(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|p| p.state == ConnectionState::Connected)
            .map(|p| p.id)
            .collect()
    }

    /// Get a peer, creating it in `Disconnected` if unknown
    pub fn upsert(&mut self, id: PeerId, now: Instant) -> &mut Peer {
        let slot = match self.index.get(&id) {
            Some(&slot) => slot,
            None => {
                info!("New peer {}", id);
                self.peers.push(Peer::new(id, now));
                let slot = self.peers.len() - 1;
                self.index.insert(id, slot);
                slot
            }
        };
        &mut self.peers[slot]
    }

    fn get_mut(&mut self, id: &PeerId) -> Option<&mut Peer> {
        match self.index.get(id) {
            Some(&slot) => Some(&mut self.peers[slot]),
            None => None,
        }
    }

    /// Handle a discovery event from the radio.
    ///
    /// Repeated discoveries while connecting or connected are no-ops, so a
    /// peer never gets two concurrent connection attempts.
    pub fn discovered(&mut self, id: PeerId, name: Option<String>, rssi: Option<i32>, now: Instant) -> DiscoveryAction {
        let peer = self.upsert(id, now);
        peer.last_seen = now;
        if rssi.is_some() {
            peer.rssi = rssi;
        }
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            peer.nickname = Some(name);
        }

        match peer.state {
            state if state.accepts_connect() => {
                peer.last_connection_attempt = Some(now);
                peer.set_state(ConnectionState::Connecting, now);
                DiscoveryAction::Connect
            }
            ConnectionState::Disconnecting => DiscoveryAction::Ignored,
            _ => DiscoveryAction::AlreadyActive,
        }
    }

    /// Handle a link-established event; returns `false` if already connected.
    ///
    /// Links initiated by the remote side may arrive for peers never
    /// discovered locally; those peers are created on the spot.
    pub fn link_established(&mut self, id: PeerId, now: Instant) -> bool {
        let peer = self.upsert(id, now);
        peer.last_seen = now;
        peer.departed = false;
        if peer.state == ConnectionState::Connected {
            return false;
        }
        peer.failures = 0;
        peer.connection_count += 1;
        peer.set_state(ConnectionState::Connected, now);
        info!("Peer {} connected (link #{})", id, peer.connection_count);
        true
    }

    /// Handle a link-lost event; returns the new state if the peer is known.
    ///
    /// A lost attempt always counts as a failure. An established link that
    /// drops with an error fails; one that drops cleanly just disconnects.
    pub fn link_lost(&mut self, id: PeerId, error: Option<&str>, now: Instant) -> Option<ConnectionState> {
        let peer = self.get_mut(&id)?;
        match (peer.state, error) {
            (ConnectionState::Connecting, _) | (ConnectionState::Connected, Some(_)) => {
                peer.failures += 1;
                warn!(
                    "Link to {} failed ({} consecutive): {}",
                    id,
                    peer.failures,
                    error.unwrap_or("attempt abandoned")
                );
                peer.set_state(ConnectionState::Failed, now);
            }
            (ConnectionState::Connected, None) => {
                peer.set_state(ConnectionState::Disconnecting, now);
                peer.set_state(ConnectionState::Disconnected, now);
                info!("Peer {} disconnected", id);
            }
            (ConnectionState::Disconnecting, _) => {
                peer.set_state(ConnectionState::Disconnected, now);
            }
            (ConnectionState::Disconnected, _) | (ConnectionState::Failed, _) => {}
        }
        Some(peer.state)
    }

    /// Record a connection error from any state
    pub fn connection_error(&mut self, id: PeerId, error: &str, now: Instant) -> Option<ConnectionState> {
        let peer = self.get_mut(&id)?;
        peer.failures += 1;
        warn!("Connection error for {} ({} consecutive): {}", id, peer.failures, error);
        peer.set_state(ConnectionState::Failed, now);
        Some(peer.state)
    }

    /// Start an orderly teardown of a connected peer
    pub fn begin_disconnect(&mut self, id: PeerId, now: Instant) -> bool {
        match self.get_mut(&id) {
            Some(peer) if peer.state == ConnectionState::Connected => {
                peer.set_state(ConnectionState::Disconnecting, now);
                true
            }
            _ => false,
        }
    }

    /// Note traffic from a peer
    pub fn touch(&mut self, id: &PeerId, now: Instant) {
        if let Some(peer) = self.get_mut(id) {
            peer.last_seen = now;
        }
    }

    /// Record a signal strength reading
    pub fn set_rssi(&mut self, id: &PeerId, rssi: i32) {
        if let Some(peer) = self.get_mut(id) {
            peer.rssi = Some(rssi);
        }
    }

    /// Update a peer's nickname
    pub fn set_nickname(&mut self, id: PeerId, nickname: String, now: Instant) {
        let peer = self.upsert(id, now);
        peer.last_seen = now;
        peer.departed = false;
        peer.nickname = Some(nickname);
    }

    /// Record a `Leave` from a peer; returns `false` for unknown peers.
    ///
    /// Link state is left to the radio events of a direct neighbour.
    pub fn mark_departed(&mut self, id: &PeerId, now: Instant) -> bool {
        match self.get_mut(id) {
            Some(peer) => {
                peer.last_seen = now;
                peer.departed = true;
                true
            }
            None => false,
        }
    }

    /// Attach identity-layer keys to a known peer
    pub fn set_identity_keys(&mut self, id: &PeerId, noise: Option<Bytes>, signing: Option<Bytes>) -> bool {
        match self.get_mut(id) {
            Some(peer) => {
                peer.noise_public_key = noise;
                peer.signing_public_key = signing;
                true
            }
            None => false,
        }
    }

    /// Enforce connection deadlines.
    ///
    /// Attempts older than `connect_timeout` fail; failed peers older than
    /// `backoff` return to `Disconnected`. Returns the peers whose state
    /// changed.
    pub fn sweep(&mut self, now: Instant, connect_timeout: Duration, backoff: Duration) -> Vec<(PeerId, ConnectionState)> {
        let mut changed = Vec::new();
        for peer in &mut self.peers {
            let age = now.saturating_duration_since(peer.state_since);
            match peer.state {
                ConnectionState::Connecting if age >= connect_timeout => {
                    peer.failures += 1;
                    warn!("Connection attempt to {} timed out", peer.id);
                    peer.set_state(ConnectionState::Failed, now);
                    changed.push((peer.id, peer.state));
                }
                ConnectionState::Failed if age >= backoff => {
                    peer.set_state(ConnectionState::Disconnected, now);
                    changed.push((peer.id, peer.state));
                }
                _ => {}
            }
        }
        changed
    }

    /// Force every peer to `Disconnected` and forget attempt timestamps
    pub fn reset_all(&mut self, now: Instant) {
        for peer in &mut self.peers {
            peer.last_connection_attempt = None;
            peer.set_state(ConnectionState::Disconnected, now);
        }
    }
}
