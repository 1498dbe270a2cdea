//! Multi-node relay scenarios over an in-memory radio.

use bytes::Bytes;
use mesh_session::{
    fingerprint_of, DeliveredMessage, EngineConfig, MeshEngine, MessageSink, RadioError, RadioEvent,
    RadioTransport,
};
use mesh_wire::{decode, MessageType, PeerId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

type Queue = Arc<Mutex<VecDeque<(PeerId, PeerId, Bytes)>>>;

#[derive(Debug)]
struct AirRadio {
    local: PeerId,
    links: Mutex<HashSet<PeerId>>,
    queue: Queue,
}

impl RadioTransport for AirRadio {
    fn send_bytes(&self, peer: PeerId, bytes: Bytes) -> Result<(), RadioError> {
        if !self.links.lock().unwrap().contains(&peer) {
            return Err(RadioError::NotConnected(peer));
        }
        self.queue.lock().unwrap().push_back((self.local, peer, bytes));
        Ok(())
    }

    fn connect(&self, _peer: PeerId) -> Result<(), RadioError> {
        Ok(())
    }

    fn disconnect(&self, peer: PeerId) -> Result<(), RadioError> {
        self.links.lock().unwrap().remove(&peer);
        Ok(())
    }

    fn start_scanning(&self) -> Result<(), RadioError> {
        Ok(())
    }

    fn start_advertising(&self, _name: &str) -> Result<(), RadioError> {
        Ok(())
    }

    fn stop_all(&self) {
        self.links.lock().unwrap().clear();
    }
}

#[derive(Debug, Default)]
struct Inbox(Mutex<Vec<DeliveredMessage>>);

impl Inbox {
    fn messages(&self) -> Vec<DeliveredMessage> {
        self.0.lock().unwrap().clone()
    }
}

impl MessageSink for Inbox {
    fn delivered(&self, message: DeliveredMessage) {
        self.0.lock().unwrap().push(message);
    }
}

struct Node {
    engine: MeshEngine,
    radio: Arc<AirRadio>,
    inbox: Arc<Inbox>,
}

struct Mesh {
    nodes: HashMap<PeerId, Node>,
    queue: Queue,
    now: Instant,
}

impl Mesh {
    fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            now: Instant::now(),
        }
    }

    fn add(&mut self, id: PeerId, nickname: &str, configure: impl FnOnce(&mut EngineConfig)) {
        let radio = Arc::new(AirRadio {
            local: id,
            links: Mutex::new(HashSet::new()),
            queue: self.queue.clone(),
        });
        let inbox = Arc::new(Inbox::default());
        let mut config = EngineConfig {
            local_id: id,
            nickname: nickname.to_string(),
            ..EngineConfig::default()
        };
        configure(&mut config);
        let mut engine = MeshEngine::new(config, radio.clone(), inbox.clone());
        engine.start().unwrap();
        self.nodes.insert(id, Node { engine, radio, inbox });
    }

    fn link(&mut self, a: PeerId, b: PeerId) {
        for (local, remote) in [(a, b), (b, a)] {
            let node = self.nodes.get_mut(&local).unwrap();
            node.radio.links.lock().unwrap().insert(remote);
            node.engine
                .handle_event(RadioEvent::LinkEstablished { peer: remote }, self.now);
        }
        self.pump();
    }

    /// Deliver queued frames until the air is quiet; returns frames moved
    fn pump(&mut self) -> usize {
        let mut moved = 0;
        loop {
            let next = self.queue.lock().unwrap().pop_front();
            let Some((from, to, bytes)) = next else {
                return moved;
            };
            moved += 1;
            if let Some(node) = self.nodes.get_mut(&to) {
                node.engine.handle_bytes(from, &bytes, self.now);
            }
        }
    }

    fn queued_from(&self, sender: PeerId) -> Vec<Bytes> {
        self.queue
            .lock()
            .unwrap()
            .iter()
            .filter(|(from, _, _)| *from == sender)
            .map(|(_, _, bytes)| bytes.clone())
            .collect()
    }

    fn node(&self, id: PeerId) -> &Node {
        &self.nodes[&id]
    }

    fn node_mut(&mut self, id: PeerId) -> &mut Node {
        self.nodes.get_mut(&id).unwrap()
    }
}

fn ids() -> (PeerId, PeerId, PeerId) {
    (PeerId::from_u64(0xA), PeerId::from_u64(0xB), PeerId::from_u64(0xC))
}

fn line() -> Mesh {
    let (a, b, c) = ids();
    let mut mesh = Mesh::new();
    mesh.add(a, "alice", |_| {});
    mesh.add(b, "bob", |_| {});
    mesh.add(c, "carol", |_| {});
    mesh.link(a, b);
    mesh.link(b, c);
    mesh
}

#[test]
fn test_broadcast_relays_through_middle_peer() {
    let (a, b, c) = ids();
    let mut mesh = line();

    mesh.node_mut(a)
        .engine
        .send(MessageType::Message, Bytes::from_static(b"cashu token"), None)
        .unwrap();

    let sent = mesh.queued_from(a);
    assert_eq!(sent.len(), 1);
    let packet = decode(&sent[0]).unwrap();
    assert_eq!(packet.ttl, 7);
    let fingerprint = fingerprint_of(&packet).unwrap();
    let relayed_before = mesh.node(c).engine.stats().relayed;

    mesh.pump();

    let at_b = mesh.node(b).inbox.messages();
    assert_eq!(at_b.len(), 1);
    assert_eq!(at_b[0].sender, a);
    assert_eq!(at_b[0].ttl_remaining, 7);

    let at_c = mesh.node(c).inbox.messages();
    assert_eq!(at_c.len(), 1);
    assert_eq!(&at_c[0].payload[..], b"cashu token");
    assert_eq!(at_c[0].ttl_remaining, 6);

    assert!(mesh.node(b).engine.has_seen(&fingerprint));
    assert!(mesh.node(c).engine.has_seen(&fingerprint));
    assert_eq!(mesh.node(c).engine.stats().relayed, relayed_before);
    assert!(mesh.node(a).inbox.messages().is_empty());
}

#[test]
fn test_triangle_delivers_once() {
    let (a, b, c) = ids();
    let mut mesh = line();
    mesh.link(a, c);

    mesh.node_mut(a)
        .engine
        .send(MessageType::Message, Bytes::from_static(b"dup"), None)
        .unwrap();
    mesh.pump();

    for id in [b, c] {
        let node = mesh.node(id);
        assert_eq!(node.inbox.messages().len(), 1);
        assert!(node.engine.stats().duplicates >= 1);
    }
}

#[test]
fn test_hop_limit_bounds_reach() {
    let (a, b, c) = ids();
    let d = PeerId::from_u64(0xD);
    let mut mesh = Mesh::new();
    mesh.add(a, "alice", |config| config.default_ttl = 2);
    mesh.add(b, "bob", |_| {});
    mesh.add(c, "carol", |_| {});
    mesh.add(d, "dave", |_| {});
    mesh.link(a, b);
    mesh.link(b, c);
    mesh.link(c, d);

    mesh.node_mut(a)
        .engine
        .send(MessageType::Message, Bytes::from_static(b"short range"), None)
        .unwrap();
    mesh.pump();

    assert_eq!(mesh.node(b).inbox.messages().len(), 1);
    let at_c = mesh.node(c).inbox.messages();
    assert_eq!(at_c.len(), 1);
    assert_eq!(at_c[0].ttl_remaining, 1);
    assert!(mesh.node(d).inbox.messages().is_empty());
}

#[test]
fn test_unicast_to_announced_multi_hop_peer() {
    let (a, b, c) = ids();
    let mut mesh = line();

    let carol = mesh
        .node(a)
        .engine
        .peers(mesh.now)
        .into_iter()
        .find(|p| p.id == c)
        .unwrap();
    assert_eq!(carol.nickname.as_deref(), Some("carol"));

    mesh.node_mut(a)
        .engine
        .send(MessageType::Message, Bytes::from_static(b"for carol"), Some(c))
        .unwrap();
    mesh.pump();

    assert!(mesh.node(b).inbox.messages().is_empty());
    let at_c = mesh.node(c).inbox.messages();
    assert_eq!(at_c.len(), 1);
    assert_eq!(at_c[0].recipient, Some(c));
}

#[test]
fn test_fragmented_message_crosses_relay() {
    let (a, b, c) = ids();
    let mut mesh = Mesh::new();
    for (id, name) in [(a, "alice"), (b, "bob"), (c, "carol")] {
        mesh.add(id, name, |config| config.max_frame_len = 128);
    }
    mesh.link(a, b);
    mesh.link(b, c);

    let payload: Bytes = (0..3000).map(|_| rand::random::<u8>()).collect::<Vec<u8>>().into();
    let report = mesh
        .node_mut(a)
        .engine
        .send(MessageType::Message, payload.clone(), None)
        .unwrap();
    assert!(report.frames > 1);
    mesh.pump();

    for (id, ttl) in [(b, 7), (c, 6)] {
        let node = mesh.node(id);
        let messages = node.inbox.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, payload);
        assert_eq!(messages[0].ttl_remaining, ttl);
        assert_eq!(node.engine.pending_fragments(), 0);
    }
}

#[test]
fn test_stopped_node_leaves_and_drops_traffic() {
    let (a, b, c) = ids();
    let mut mesh = line();
    let now = mesh.now;

    mesh.node_mut(b).engine.stop(now);
    mesh.pump();

    assert!(!mesh.node(b).engine.is_running());
    assert_eq!(mesh.node(b).engine.dedup_len(), 0);

    mesh.node_mut(a)
        .engine
        .send(MessageType::Message, Bytes::from_static(b"anyone?"), None)
        .unwrap();
    mesh.pump();

    assert!(mesh.node(b).inbox.messages().is_empty());
    assert!(mesh.node(c).inbox.messages().is_empty());
}
