//! In-process mesh: loopback radios wired together over tokio channels.

use crate::config::SimConfig;
use crate::{component_debug, component_info, component_warn};
use anyhow::{Context, Result};
use bytes::Bytes;
use mesh_session::{
    DeliveredMessage, MeshEngine, MeshHandle, MeshService, MeshStatus, MessageSink, PeerSnapshot, RadioError,
    RadioEvent, RadioTransport, SendReport,
};
use mesh_wire::PeerId;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of each node's radio event queue
const EVENT_QUEUE_SIZE: usize = 4096;

/// Shared medium connecting every loopback radio
#[derive(Debug)]
pub struct Air {
    endpoints: HashMap<PeerId, mpsc::Sender<RadioEvent>>,
    range: HashMap<PeerId, HashSet<PeerId>>,
    names: Mutex<HashMap<PeerId, String>>,
    links: Mutex<HashSet<(PeerId, PeerId)>>,
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Air {
    fn deliver(&self, to: PeerId, event: RadioEvent) -> Result<(), RadioError> {
        let endpoint = self.endpoints.get(&to).ok_or(RadioError::NotConnected(to))?;
        endpoint
            .try_send(event)
            .map_err(|e| RadioError::Platform(format!("event queue for {}: {}", to, e)))
    }

    fn in_range(&self, a: PeerId, b: PeerId) -> bool {
        self.range.get(&a).is_some_and(|peers| peers.contains(&b))
    }

    fn is_linked(&self, a: PeerId, b: PeerId) -> bool {
        lock(&self.links).contains(&link_key(a, b))
    }

    fn drop_link(&self, a: PeerId, b: PeerId) -> bool {
        lock(&self.links).remove(&link_key(a, b))
    }
}

/// Radio for one simulated node
#[derive(Debug)]
pub struct LoopbackRadio {
    local: PeerId,
    air: Arc<Air>,
}

impl RadioTransport for LoopbackRadio {
    fn send_bytes(&self, peer: PeerId, bytes: Bytes) -> Result<(), RadioError> {
        if !self.air.is_linked(self.local, peer) {
            return Err(RadioError::NotConnected(peer));
        }
        self.air.deliver(
            peer,
            RadioEvent::BytesReceived {
                peer: self.local,
                bytes,
            },
        )
    }

    fn connect(&self, peer: PeerId) -> Result<(), RadioError> {
        if !self.air.in_range(self.local, peer) {
            return self.air.deliver(
                self.local,
                RadioEvent::ConnectionError {
                    peer,
                    error: "out of range".to_string(),
                },
            );
        }
        let fresh = lock(&self.air.links).insert(link_key(self.local, peer));
        self.air.deliver(self.local, RadioEvent::LinkEstablished { peer })?;
        if fresh {
            self.air.deliver(peer, RadioEvent::LinkEstablished { peer: self.local })?;
        }
        Ok(())
    }

    fn disconnect(&self, peer: PeerId) -> Result<(), RadioError> {
        if self.air.drop_link(self.local, peer) {
            self.air.deliver(
                peer,
                RadioEvent::LinkLost {
                    peer: self.local,
                    error: None,
                },
            )?;
        }
        Ok(())
    }

    fn start_scanning(&self) -> Result<(), RadioError> {
        let names = lock(&self.air.names).clone();
        for peer in self.air.range.get(&self.local).into_iter().flatten() {
            self.air.deliver(
                self.local,
                RadioEvent::PeerDiscovered {
                    peer: *peer,
                    name: names.get(peer).cloned(),
                    rssi: Some(-60),
                },
            )?;
        }
        Ok(())
    }

    fn start_advertising(&self, name: &str) -> Result<(), RadioError> {
        lock(&self.air.names).insert(self.local, name.to_string());
        Ok(())
    }

    fn stop_all(&self) {
        let peers: Vec<PeerId> = lock(&self.air.links)
            .iter()
            .filter_map(|(a, b)| match (*a == self.local, *b == self.local) {
                (true, _) => Some(*b),
                (_, true) => Some(*a),
                _ => None,
            })
            .collect();
        for peer in peers {
            if let Err(e) = self.disconnect(peer) {
                component_debug!("radio", "Dropping link {} -> {} failed: {}", self.local, peer, e);
            }
        }
    }
}

/// Sink forwarding deliveries to the simulator
#[derive(Debug)]
pub struct ChannelSink {
    node: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl MessageSink for ChannelSink {
    fn delivered(&self, message: DeliveredMessage) {
        component_info!(
            "sim",
            "{} received {} bytes from {} (ttl {})",
            self.node,
            message.payload.len(),
            message.sender,
            message.ttl_remaining
        );
        let delivery = Delivery {
            node: self.node.clone(),
            message,
        };
        if self.tx.send(delivery).is_err() {
            component_warn!("sim", "Delivery collector closed");
        }
    }

    fn peer_changed(&self, peer: &PeerSnapshot) {
        component_debug!("sim", "{} sees {} as {}", self.node, peer.id, peer.state);
    }
}

/// A message delivered at a node
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    /// Receiving node
    pub node: String,
    /// The message
    pub message: DeliveredMessage,
}

/// Outcome of a scripted send
#[derive(Debug, Clone, Serialize)]
pub struct SendRecord {
    /// Sending node
    pub from: String,
    /// Recipient, if unicast
    pub to: Option<String>,
    /// Payload size
    pub bytes: usize,
    /// Frames and links on success
    pub report: Option<SendReport>,
    /// Error on failure
    pub error: Option<String>,
}

struct SimNode {
    nickname: String,
    handle: MeshHandle,
    task: JoinHandle<Result<(), mesh_session::EngineError>>,
}

/// Running simulation
pub struct Simulation {
    nodes: Vec<SimNode>,
    ids: HashMap<String, PeerId>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// Everything observed during a run
#[derive(Debug, Serialize)]
pub struct Outcome {
    /// Scripted sends
    pub sends: Vec<SendRecord>,
    /// Deliveries in arrival order
    pub deliveries: Vec<Delivery>,
    /// Node status captured just before each node stopped
    pub nodes: Vec<NodeOutcome>,
}

/// Final state of one node
#[derive(Debug, Serialize)]
pub struct NodeOutcome {
    /// Node nickname
    pub nickname: String,
    /// Status before teardown
    pub status: MeshStatus,
}

impl Simulation {
    /// Build radios and engines and spawn one service per node
    pub fn spawn(config: &SimConfig) -> Result<Self> {
        let ids: HashMap<String, PeerId> = config
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (node.nickname.clone(), config.node_id(index)))
            .collect();

        let mut range: HashMap<PeerId, HashSet<PeerId>> = HashMap::new();
        for [a, b] in &config.links {
            let lookup = |name: &String| ids.get(name).copied().with_context(|| format!("Unknown node '{}'", name));
            let (a, b) = (lookup(a)?, lookup(b)?);
            range.entry(a).or_default().insert(b);
            range.entry(b).or_default().insert(a);
        }

        let mut endpoints = HashMap::new();
        let mut receivers = HashMap::new();
        for id in ids.values() {
            let (tx, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
            endpoints.insert(*id, tx);
            receivers.insert(*id, rx);
        }

        let air = Arc::new(Air {
            endpoints,
            range,
            names: Mutex::new(HashMap::new()),
            links: Mutex::new(HashSet::new()),
        });
        // Every node advertises before anyone scans
        for (nickname, id) in &ids {
            lock(&air.names).insert(*id, nickname.clone());
        }

        let (delivery_tx, deliveries) = mpsc::unbounded_channel();
        let mut nodes = Vec::with_capacity(config.nodes.len());
        for (index, node) in config.nodes.iter().enumerate() {
            let id = config.node_id(index);
            let radio = Arc::new(LoopbackRadio { local: id, air: air.clone() });
            let sink = Arc::new(ChannelSink {
                node: node.nickname.clone(),
                tx: delivery_tx.clone(),
            });
            let engine = MeshEngine::new(config.engine.engine_config(id, &node.nickname), radio, sink);
            let event_rx = receivers
                .remove(&id)
                .with_context(|| format!("No event queue for node {}", node.nickname))?;
            let (service, handle) = MeshService::new(engine, event_rx);
            let task = tokio::spawn(service.run());

            component_info!("sim", "Spawned node {} as {}", node.nickname, id);
            nodes.push(SimNode {
                nickname: node.nickname.clone(),
                handle,
                task,
            });
        }

        Ok(Self { nodes, ids, deliveries })
    }

    /// Run the scripted sends in order
    pub async fn run_script(&self, config: &SimConfig) -> Vec<SendRecord> {
        let mut records = Vec::with_capacity(config.messages.len());
        for message in &config.messages {
            if !message.after.is_zero() {
                tokio::time::sleep(message.after).await;
            }

            let mut payload = message.payload.as_bytes().to_vec();
            payload.extend((0..message.random_bytes).map(|_| rand::random::<u8>()));
            let bytes = payload.len();

            let Some(node) = self.nodes.iter().find(|n| n.nickname == message.from) else {
                continue;
            };
            let recipient = message.to.as_ref().and_then(|to| self.ids.get(to).copied());
            let result = node
                .handle
                .send(message.message_type, Bytes::from(payload), recipient)
                .await;

            match &result {
                Ok(report) => component_info!(
                    "sim",
                    "{} sent {} bytes to {} ({} frames on {} links)",
                    message.from,
                    bytes,
                    message.to.as_deref().unwrap_or("everyone"),
                    report.frames,
                    report.links
                ),
                Err(e) => component_warn!("sim", "{} failed to send: {}", message.from, e),
            }

            records.push(SendRecord {
                from: message.from.clone(),
                to: message.to.clone(),
                bytes,
                report: result.as_ref().ok().copied(),
                error: result.err().map(|e| e.to_string()),
            });
        }
        records
    }

    /// Stop every node and collect what happened
    pub async fn shutdown(mut self, sends: Vec<SendRecord>) -> Result<Outcome> {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let status = node
                .handle
                .stop()
                .await
                .with_context(|| format!("Node {} stopped early", node.nickname))?;
            nodes.push(NodeOutcome {
                nickname: node.nickname.clone(),
                status,
            });
        }

        for node in self.nodes.drain(..) {
            node.task
                .await
                .with_context(|| format!("Node {} panicked", node.nickname))?
                .with_context(|| format!("Node {} failed", node.nickname))?;
        }

        let mut deliveries = Vec::new();
        while let Ok(delivery) = self.deliveries.try_recv() {
            deliveries.push(delivery);
        }

        Ok(Outcome {
            sends,
            deliveries,
            nodes,
        })
    }
}
