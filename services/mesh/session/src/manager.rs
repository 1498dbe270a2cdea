//! Async driver for a [`MeshEngine`].
//!
//! The service owns the engine and is its only caller, which gives the
//! engine the single serialized context it relies on. Radio events, API
//! commands and the periodic sweep are all funnelled through one
//! `tokio::select!` loop.

use crate::engine::{EngineError, EngineStats, MeshEngine, SendReport};
use crate::peer::PeerSnapshot;
use crate::radio::RadioEvent;
use bytes::Bytes;
use mesh_wire::PeerId;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Capacity of the command channel
const COMMAND_CHANNEL_SIZE: usize = 64;

/// Commands accepted by the service loop
#[derive(Debug)]
pub enum MeshCommand {
    /// Originate a message
    Send {
        /// Raw type byte
        message_type: u8,
        /// Application payload
        payload: Bytes,
        /// Recipient, `None` to broadcast
        recipient: Option<PeerId>,
        /// Reply channel
        reply: oneshot::Sender<Result<SendReport, EngineError>>,
    },
    /// Change the advertised nickname
    SetNickname {
        /// New nickname
        nickname: String,
        /// Reply channel
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    /// Attach identity keys to a peer
    SetPeerKeys {
        /// Peer id
        peer: PeerId,
        /// Opaque key material
        noise_public_key: Option<Bytes>,
        /// Opaque key material
        signing_public_key: Option<Bytes>,
        /// Reply channel
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    /// Read the current status
    Status {
        /// Reply channel
        reply: oneshot::Sender<MeshStatus>,
    },
    /// Stop the engine and end the loop
    Stop {
        /// Reply channel, answered with the final status
        reply: oneshot::Sender<MeshStatus>,
    },
}

/// Point-in-time view of a node
#[derive(Debug, Clone, Serialize)]
pub struct MeshStatus {
    /// This node's id
    pub local_id: PeerId,
    /// Whether the engine is accepting traffic
    pub running: bool,
    /// Peer table
    pub peers: Vec<PeerSnapshot>,
    /// Dedup entries held
    pub dedup_entries: usize,
    /// Incomplete fragment sets held
    pub pending_fragments: usize,
    /// Running counters
    pub stats: EngineStats,
}

impl MeshStatus {
    fn of(engine: &MeshEngine) -> Self {
        Self {
            local_id: engine.local_id(),
            running: engine.is_running(),
            peers: engine.peers(now()),
            dedup_entries: engine.dedup_len(),
            pending_fragments: engine.pending_fragments(),
            stats: engine.stats(),
        }
    }
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Cloneable handle for talking to a running [`MeshService`]
#[derive(Debug, Clone)]
pub struct MeshHandle {
    command_tx: mpsc::Sender<MeshCommand>,
}

impl MeshHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> MeshCommand) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .await
            .map_err(|_| EngineError::NotRunning)?;
        rx.await.map_err(|_| EngineError::NotRunning)
    }

    /// Originate a message
    pub async fn send(
        &self,
        message_type: impl Into<u8>,
        payload: Bytes,
        recipient: Option<PeerId>,
    ) -> Result<SendReport, EngineError> {
        let message_type = message_type.into();
        self.request(|reply| MeshCommand::Send {
            message_type,
            payload,
            recipient,
            reply,
        })
        .await?
    }

    /// Change the advertised nickname
    pub async fn set_nickname(&self, nickname: impl Into<String>) -> Result<(), EngineError> {
        let nickname = nickname.into();
        self.request(|reply| MeshCommand::SetNickname { nickname, reply })
            .await?
    }

    /// Attach identity keys to a peer
    pub async fn set_peer_keys(
        &self,
        peer: PeerId,
        noise_public_key: Option<Bytes>,
        signing_public_key: Option<Bytes>,
    ) -> Result<(), EngineError> {
        self.request(|reply| MeshCommand::SetPeerKeys {
            peer,
            noise_public_key,
            signing_public_key,
            reply,
        })
        .await?
    }

    /// Current peer table
    pub async fn peers(&self) -> Result<Vec<PeerSnapshot>, EngineError> {
        Ok(self.status().await?.peers)
    }

    /// Current status
    pub async fn status(&self) -> Result<MeshStatus, EngineError> {
        self.request(|reply| MeshCommand::Status { reply }).await
    }

    /// Stop the service; returns the status captured just before teardown
    pub async fn stop(&self) -> Result<MeshStatus, EngineError> {
        self.request(|reply| MeshCommand::Stop { reply }).await
    }
}

/// Event loop that owns one engine
#[derive(Debug)]
pub struct MeshService {
    engine: MeshEngine,
    event_rx: mpsc::Receiver<RadioEvent>,
    command_rx: mpsc::Receiver<MeshCommand>,
}

impl MeshService {
    /// Wrap an engine fed by `event_rx`; returns the service and its handle
    pub fn new(engine: MeshEngine, event_rx: mpsc::Receiver<RadioEvent>) -> (Self, MeshHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        (
            Self {
                engine,
                event_rx,
                command_rx,
            },
            MeshHandle { command_tx },
        )
    }

    /// Run until stopped or until every handle is dropped
    pub async fn run(mut self) -> Result<(), EngineError> {
        self.engine.start()?;
        info!("Starting mesh service for node {}", self.engine.local_id());

        let mut sweep = tokio::time::interval(self.engine.config().sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                // Radio events first so commands observe every event queued before them
                Some(event) = self.event_rx.recv() => {
                    self.engine.handle_event(event, now());
                }

                _ = sweep.tick() => {
                    let report = self.engine.sweep(now());
                    if report.expired_fragment_sets > 0 || report.peer_transitions > 0 {
                        debug!(
                            "Sweep expired {} fragment sets, moved {} peers",
                            report.expired_fragment_sets, report.peer_transitions
                        );
                    }
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(MeshCommand::Stop { reply }) => {
                            let status = MeshStatus::of(&self.engine);
                            self.engine.stop(now());
                            let _ = reply.send(status);
                            break;
                        }
                        Some(command) => self.handle_command(command),
                        None => {
                            self.engine.stop(now());
                            break;
                        }
                    }
                }
            }
        }

        info!("Mesh service for node {} shut down", self.engine.local_id());
        Ok(())
    }

    fn handle_command(&mut self, command: MeshCommand) {
        match command {
            MeshCommand::Send {
                message_type,
                payload,
                recipient,
                reply,
            } => {
                let _ = reply.send(self.engine.send(message_type, payload, recipient));
            }
            MeshCommand::SetNickname { nickname, reply } => {
                let _ = reply.send(self.engine.set_nickname(nickname));
            }
            MeshCommand::SetPeerKeys {
                peer,
                noise_public_key,
                signing_public_key,
                reply,
            } => {
                let _ = reply.send(self.engine.set_peer_keys(peer, noise_public_key, signing_public_key));
            }
            MeshCommand::Status { reply } => {
                let _ = reply.send(MeshStatus::of(&self.engine));
            }
            MeshCommand::Stop { .. } => {}
        }
    }
}
