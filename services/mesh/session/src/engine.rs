//! Mesh engine: peer lifecycle, duplicate suppression and TTL relay.
//!
//! [`MeshEngine`] is plain synchronous state. It owns the [`PeerTable`], the
//! fragment assembler and the dedup cache, and is driven by exactly one
//! caller at a time (normally [`crate::MeshService`]). Radio I/O goes out
//! through the injected [`RadioTransport`]; deliveries and peer changes go
//! up through the injected [`MessageSink`].

use crate::events::{DeliveredMessage, MessageSink};
use crate::peer::{ConnectionState, DiscoveryAction, PeerSnapshot, PeerTable};
use crate::radio::{RadioError, RadioEvent, RadioTransport};
use bytes::Bytes;
use mesh_storage::{Dedup, DedupConfig, Fingerprint};
use mesh_wire::padding::PAD_BLOCK;
use mesh_wire::{
    decode, try_encode, Fragment, FragmentAssembler, FragmentKey, Fragmenter, MessageType, Packet, PeerId,
    WireError, DEFAULT_FRAGMENT_TIMEOUT, DEFAULT_MAX_FRAGMENT_SETS, DEFAULT_TTL, FRAGMENT_HEADER_SIZE,
    PEER_ID_SIZE, V1_HEADER_SIZE,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This node's id
    pub local_id: PeerId,
    /// Name advertised and announced to peers
    pub nickname: String,
    /// TTL stamped on locally originated packets
    pub default_ttl: u8,
    /// Largest frame the radio link accepts in one write
    pub max_frame_len: usize,
    /// Pad frames to 16-byte blocks
    pub pad: bool,
    /// Dedup cache sizing and eviction
    pub dedup: DedupConfig,
    /// Concurrent fragment sets tracked
    pub max_fragment_sets: usize,
    /// Age after which incomplete fragment sets are dropped
    pub fragment_timeout: Duration,
    /// Age after which a connection attempt fails
    pub connect_timeout: Duration,
    /// Time a failed peer waits before it may be retried
    pub failure_backoff: Duration,
    /// Period of the deadline sweep
    pub sweep_interval: Duration,
    /// Minimum time between periodic announces to connected peers
    pub announce_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_id: PeerId::from_u64(rand::random()),
            nickname: String::new(),
            default_ttl: DEFAULT_TTL,
            max_frame_len: 512,
            pad: true,
            dedup: DedupConfig::default(),
            max_fragment_sets: DEFAULT_MAX_FRAGMENT_SETS,
            fragment_timeout: DEFAULT_FRAGMENT_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            failure_backoff: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            announce_interval: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Fragment data bytes that keep a padded fragment frame within `max_frame_len`.
    ///
    /// Fragments of a unicast packet carry the recipient, so room for it is
    /// always reserved.
    pub fn fragment_chunk_size(&self) -> usize {
        let usable = self.max_frame_len - self.max_frame_len % PAD_BLOCK;
        usable
            .saturating_sub(V1_HEADER_SIZE + 2 * PEER_ID_SIZE + FRAGMENT_HEADER_SIZE)
            .min(u16::MAX as usize - FRAGMENT_HEADER_SIZE)
            .max(1)
    }
}

/// Engine errors returned to callers
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine has not been started or was stopped
    #[error("engine is not running")]
    NotRunning,

    /// Recipient is not in the peer table
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    /// Message would need more fragments than a receiver accepts
    #[error("payload too large to fragment: {0} bytes")]
    PayloadTooLarge(usize),

    /// Packet could not be encoded
    #[error("encode error: {0}")]
    Encode(#[from] WireError),

    /// The radio refused a request
    #[error("radio error: {0}")]
    Radio(#[from] RadioError),
}

/// Why an inbound frame was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Engine not running
    NotRunning,
    /// Frame did not decode
    Malformed,
    /// Our own packet echoed back
    OwnPacket,
    /// Already processed
    Duplicate,
}

/// Result of processing one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Discarded without side effects
    Dropped(DropReason),
    /// Accepted for processing
    Handled {
        /// A message reached the sink
        delivered: bool,
        /// Links the packet was relayed to
        relayed_to: usize,
    },
}

/// Result of a local send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SendReport {
    /// Frames per link (more than one when fragmented)
    pub frames: usize,
    /// Links written to
    pub links: usize,
}

/// Result of a deadline sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Incomplete fragment sets dropped
    pub expired_fragment_sets: usize,
    /// Peers whose connection state changed
    pub peer_transitions: usize,
    /// A periodic announce went out
    pub announced: bool,
}

/// Running counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Frames handed to the engine
    pub frames_received: u64,
    /// Frames written to the radio
    pub frames_sent: u64,
    /// Messages delivered to the sink
    pub delivered: u64,
    /// Packets relayed onward
    pub relayed: u64,
    /// Packets dropped as duplicates
    pub duplicates: u64,
    /// Frames that failed to decode
    pub malformed: u64,
    /// Fragmented messages reassembled
    pub reassembled: u64,
}

/// Dedup fingerprint of a packet.
///
/// Fragments are keyed by sender, fragment id and index. Everything else is
/// keyed by a content hash that leaves out the TTL, so relayed copies of the
/// same packet collide.
pub fn fingerprint_of(packet: &Packet) -> Result<Fingerprint, WireError> {
    if packet.is_fragment() {
        let fragment = Fragment::parse(&packet.payload)?;
        return Ok(Fingerprint::message(
            packet.sender_id.0,
            fragment.header.fragment_id,
            fragment.header.index as u32,
        ));
    }

    let timestamp = packet.timestamp.to_be_bytes();
    let packet_type = [packet.packet_type];
    let recipient = packet.unicast_recipient().unwrap_or(PeerId::BROADCAST);
    Ok(Fingerprint::content([
        &packet.sender_id.0[..],
        &timestamp[..],
        &packet_type[..],
        &recipient.0[..],
        &packet.payload[..],
    ]))
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Orchestrates one node of the mesh
#[derive(Debug)]
pub struct MeshEngine {
    config: EngineConfig,
    radio: Arc<dyn RadioTransport>,
    sink: Arc<dyn MessageSink>,
    peers: PeerTable,
    dedup: Box<dyn Dedup>,
    assembler: FragmentAssembler,
    fragmenter: Fragmenter,
    running: bool,
    last_announce: Option<Instant>,
    stats: EngineStats,
}

impl MeshEngine {
    /// Create an engine; it stays idle until [`MeshEngine::start`]
    pub fn new(config: EngineConfig, radio: Arc<dyn RadioTransport>, sink: Arc<dyn MessageSink>) -> Self {
        let dedup = config.dedup.build();
        let assembler = FragmentAssembler::new(config.max_fragment_sets, config.fragment_timeout);
        let fragmenter = Fragmenter::new(config.fragment_chunk_size());
        Self {
            config,
            radio,
            sink,
            peers: PeerTable::new(),
            dedup,
            assembler,
            fragmenter,
            running: false,
            last_announce: None,
            stats: EngineStats::default(),
        }
    }

    /// This node's id
    pub fn local_id(&self) -> PeerId {
        self.config.local_id
    }

    /// Current configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether the engine accepts traffic
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Start scanning and advertising
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.running {
            return Ok(());
        }
        self.radio.start_scanning()?;
        self.radio.start_advertising(&self.config.nickname)?;
        self.running = true;
        info!("Mesh engine {} started as '{}'", self.config.local_id, self.config.nickname);
        Ok(())
    }

    /// Leave the mesh and drop all transient state.
    ///
    /// Afterwards no connection attempt, fragment set or dedup entry
    /// survives, and every peer is `Disconnected`.
    pub fn stop(&mut self, now: Instant) {
        if !self.running {
            return;
        }

        let leave = Packet::new(
            MessageType::Leave,
            self.config.local_id,
            Bytes::copy_from_slice(self.config.nickname.as_bytes()),
            now_millis(),
        )
        .with_ttl(self.config.default_ttl);
        let connected = self.peers.connected();
        if let Err(e) = self.transmit(&leave, &connected) {
            debug!("Failed to send leave: {}", e);
        }

        for id in &connected {
            self.peers.begin_disconnect(*id, now);
            if let Err(e) = self.radio.disconnect(*id) {
                debug!("Disconnect from {} failed: {}", id, e);
            }
        }
        self.radio.stop_all();

        self.assembler.clear();
        self.dedup.clear();
        self.peers.reset_all(now);
        self.running = false;
        self.last_announce = None;

        for peer in self.peers.iter() {
            self.sink.peer_changed(&peer.snapshot(now));
        }
        info!("Mesh engine {} stopped ({} peers known)", self.config.local_id, self.peers.len());
    }

    /// Apply one radio event
    pub fn handle_event(&mut self, event: RadioEvent, now: Instant) -> Option<ReceiveOutcome> {
        if !self.running {
            debug!("Ignoring radio event for {} while stopped", event.peer());
            return None;
        }

        match event {
            RadioEvent::PeerDiscovered { peer, name, rssi } => {
                if peer == self.config.local_id {
                    return None;
                }
                if self.peers.discovered(peer, name, rssi, now) == DiscoveryAction::Connect {
                    debug!("Connecting to discovered peer {}", peer);
                    if let Err(e) = self.radio.connect(peer) {
                        self.peers.connection_error(peer, &e.to_string(), now);
                    }
                }
                self.notify_peer(&peer, now);
            }
            RadioEvent::LinkEstablished { peer } => {
                if self.peers.link_established(peer, now) {
                    self.notify_peer(&peer, now);
                    self.announce_to(&[peer]);
                }
            }
            RadioEvent::LinkLost { peer, error } => {
                if self.peers.link_lost(peer, error.as_deref(), now).is_some() {
                    self.notify_peer(&peer, now);
                }
            }
            RadioEvent::ConnectionError { peer, error } => {
                if self.peers.connection_error(peer, &error, now).is_some() {
                    self.notify_peer(&peer, now);
                }
            }
            RadioEvent::BytesReceived { peer, bytes } => {
                return Some(self.handle_bytes(peer, &bytes, now));
            }
        }
        None
    }

    /// Process one link frame received from `from`
    pub fn handle_bytes(&mut self, from: PeerId, bytes: &[u8], now: Instant) -> ReceiveOutcome {
        if !self.running {
            return ReceiveOutcome::Dropped(DropReason::NotRunning);
        }
        self.stats.frames_received += 1;
        self.peers.touch(&from, now);

        let Some(packet) = decode(bytes) else {
            debug!("Dropping malformed frame ({} bytes) from {}", bytes.len(), from);
            self.stats.malformed += 1;
            return ReceiveOutcome::Dropped(DropReason::Malformed);
        };
        if packet.sender_id == self.config.local_id {
            return ReceiveOutcome::Dropped(DropReason::OwnPacket);
        }

        let fingerprint = match fingerprint_of(&packet) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                debug!("Dropping packet from {}: {}", packet.sender_id, e);
                self.stats.malformed += 1;
                return ReceiveOutcome::Dropped(DropReason::Malformed);
            }
        };
        if self.dedup.check_and_remember(fingerprint) {
            self.stats.duplicates += 1;
            return ReceiveOutcome::Dropped(DropReason::Duplicate);
        }

        let delivered = if packet.is_fragment() {
            packet.is_addressed_to(self.config.local_id) && self.ingest_fragment(&packet, now)
        } else {
            self.dispatch_local(&packet, now)
        };
        let relayed_to = self.relay(&packet, from);

        ReceiveOutcome::Handled { delivered, relayed_to }
    }

    /// Originate a message.
    ///
    /// `recipient` of `None` (or the broadcast id) floods to everyone;
    /// otherwise the recipient must be a known peer.
    pub fn send(
        &mut self,
        message_type: impl Into<u8>,
        payload: Bytes,
        recipient: Option<PeerId>,
    ) -> Result<SendReport, EngineError> {
        if !self.running {
            return Err(EngineError::NotRunning);
        }

        let mut packet = Packet::new(message_type, self.config.local_id, payload, now_millis())
            .with_ttl(self.config.default_ttl);
        if let Some(recipient) = recipient.filter(|r| !r.is_broadcast()) {
            if !self.peers.contains(&recipient) {
                return Err(EngineError::PeerNotFound(recipient));
            }
            packet = packet.with_recipient(recipient);
        }

        let links = self.peers.connected();
        let frames = self.transmit(&packet, &links)?;
        debug!(
            "Sent {} byte message to {} links ({} frames each)",
            packet.payload.len(),
            links.len(),
            frames
        );
        Ok(SendReport {
            frames,
            links: links.len(),
        })
    }

    /// Enforce fragment and connection deadlines and re-announce when due.
    ///
    /// Periodic announces let peers that joined after the first exchange
    /// learn about nodes several hops away.
    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let expired_fragment_sets = self.assembler.sweep(now);
        let changed = self
            .peers
            .sweep(now, self.config.connect_timeout, self.config.failure_backoff);

        for (id, state) in &changed {
            if *state == ConnectionState::Failed {
                if let Err(e) = self.radio.disconnect(*id) {
                    debug!("Cancelling attempt to {} failed: {}", id, e);
                }
            }
            self.notify_peer(id, now);
        }

        let connected = self.peers.connected();
        let due = self
            .last_announce
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.announce_interval);
        let announced = self.running && due && !connected.is_empty();
        if announced {
            self.announce_to(&connected);
            self.last_announce = Some(now);
        }

        SweepReport {
            expired_fragment_sets,
            peer_transitions: changed.len(),
            announced,
        }
    }

    /// Change the advertised nickname and announce it to connected peers
    pub fn set_nickname(&mut self, nickname: String) -> Result<(), EngineError> {
        self.config.nickname = nickname;
        if self.running {
            self.radio.start_advertising(&self.config.nickname)?;
            let connected = self.peers.connected();
            self.announce_to(&connected);
        }
        Ok(())
    }

    /// Attach identity-layer keys to a peer
    pub fn set_peer_keys(
        &mut self,
        peer: PeerId,
        noise_public_key: Option<Bytes>,
        signing_public_key: Option<Bytes>,
    ) -> Result<(), EngineError> {
        if self.peers.set_identity_keys(&peer, noise_public_key, signing_public_key) {
            Ok(())
        } else {
            Err(EngineError::PeerNotFound(peer))
        }
    }

    /// Snapshot of the peer table
    pub fn peers(&self, now: Instant) -> Vec<PeerSnapshot> {
        self.peers.iter().map(|p| p.snapshot(now)).collect()
    }

    /// Whether a fingerprint is in the dedup cache
    pub fn has_seen(&self, fingerprint: &Fingerprint) -> bool {
        self.dedup.seen(fingerprint)
    }

    /// Dedup entries held
    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }

    /// Incomplete fragment sets held
    pub fn pending_fragments(&self) -> usize {
        self.assembler.len()
    }

    /// Running counters
    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    fn notify_peer(&self, id: &PeerId, now: Instant) {
        if let Some(peer) = self.peers.get(id) {
            self.sink.peer_changed(&peer.snapshot(now));
        }
    }

    fn announce_to(&mut self, links: &[PeerId]) {
        let announce = Packet::new(
            MessageType::Announce,
            self.config.local_id,
            Bytes::copy_from_slice(self.config.nickname.as_bytes()),
            now_millis(),
        )
        .with_ttl(self.config.default_ttl);
        if let Err(e) = self.transmit(&announce, links) {
            warn!("Failed to announce: {}", e);
        }
    }

    /// Act on a complete non-fragment packet; returns whether it was delivered
    fn dispatch_local(&mut self, packet: &Packet, now: Instant) -> bool {
        match packet.message_type() {
            Some(MessageType::Announce) => {
                let nickname = String::from_utf8_lossy(&packet.payload).trim_end_matches('\0').to_string();
                if nickname.is_empty() {
                    let peer = self.peers.upsert(packet.sender_id, now);
                    peer.last_seen = now;
                    peer.departed = false;
                } else {
                    self.peers.set_nickname(packet.sender_id, nickname, now);
                }
                debug!("Announce from {}", packet.sender_id);
                self.notify_peer(&packet.sender_id, now);
                false
            }
            Some(MessageType::Leave) => {
                info!("Peer {} left the mesh", packet.sender_id);
                if self.peers.mark_departed(&packet.sender_id, now) {
                    self.notify_peer(&packet.sender_id, now);
                }
                false
            }
            _ if packet.is_addressed_to(self.config.local_id) => {
                self.sink.delivered(DeliveredMessage {
                    sender: packet.sender_id,
                    recipient: packet.unicast_recipient(),
                    message_type: packet.packet_type,
                    payload: packet.payload.clone(),
                    ttl_remaining: packet.ttl,
                });
                self.stats.delivered += 1;
                true
            }
            _ => false,
        }
    }

    /// Feed a fragment to the assembler and act on a completed message
    fn ingest_fragment(&mut self, packet: &Packet, now: Instant) -> bool {
        let fragment = match Fragment::parse(&packet.payload) {
            Ok(fragment) => fragment,
            Err(_) => return false,
        };
        let key = FragmentKey {
            sender: packet.sender_id,
            message_id: fragment.header.fragment_id,
        };
        let Some(bytes) = self.assembler.ingest(
            key,
            fragment.header.index,
            fragment.header.total,
            fragment.data,
            now,
        ) else {
            return false;
        };

        let Some(inner) = decode(&bytes) else {
            debug!("Reassembled message from {} did not decode", packet.sender_id);
            self.stats.malformed += 1;
            return false;
        };
        if inner.is_fragment() || inner.sender_id == self.config.local_id {
            return false;
        }
        self.stats.reassembled += 1;
        // Hops left are those of the fragment that completed the set
        let inner = inner.with_ttl(packet.ttl);

        match fingerprint_of(&inner) {
            Ok(fingerprint) if !self.dedup.check_and_remember(fingerprint) => self.dispatch_local(&inner, now),
            Ok(_) => {
                self.stats.duplicates += 1;
                false
            }
            Err(_) => false,
        }
    }

    /// Forward a packet with one less hop; returns the number of links used
    fn relay(&mut self, packet: &Packet, from: PeerId) -> usize {
        if packet.unicast_recipient() == Some(self.config.local_id) {
            return 0;
        }
        let Some(next) = packet.relayed() else {
            debug!("Not relaying packet from {}: TTL exhausted", packet.sender_id);
            return 0;
        };

        let links: Vec<PeerId> = self
            .peers
            .connected()
            .into_iter()
            .filter(|id| *id != from && *id != packet.sender_id)
            .collect();
        if links.is_empty() {
            return 0;
        }

        match self.transmit(&next, &links) {
            Ok(_) => {
                self.stats.relayed += 1;
                debug!("Relayed packet from {} to {} links (ttl {})", packet.sender_id, links.len(), next.ttl);
                links.len()
            }
            Err(e) => {
                warn!("Failed to relay packet from {}: {}", packet.sender_id, e);
                0
            }
        }
    }

    /// Encode (fragmenting if needed) and write to each link; returns frames per link
    fn transmit(&mut self, packet: &Packet, links: &[PeerId]) -> Result<usize, EngineError> {
        let frames = self.frames_for(packet)?;
        for link in links {
            for frame in &frames {
                if let Err(e) = self.radio.send_bytes(*link, frame.clone()) {
                    warn!("Write to {} failed: {}", link, e);
                    break;
                }
                self.stats.frames_sent += 1;
            }
        }
        Ok(frames.len())
    }

    fn frames_for(&self, packet: &Packet) -> Result<Vec<Bytes>, EngineError> {
        let encoded = try_encode(packet, self.config.pad)?;
        if encoded.len() <= self.config.max_frame_len {
            return Ok(vec![encoded]);
        }

        let inner = try_encode(packet, false)?;
        let parts = self
            .fragmenter
            .split(packet, &inner, rand::random())
            .map_err(|_| EngineError::PayloadTooLarge(packet.payload.len()))?;
        parts
            .iter()
            .map(|part| try_encode(part, self.config.pad).map_err(EngineError::from))
            .collect()
    }
}
