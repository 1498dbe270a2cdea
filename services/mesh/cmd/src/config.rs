//! Simulator configuration.
//!
//! A scenario is read from a YAML file and then adjusted by environment
//! variables. Without a file the built-in three-node scenario is used.

use anyhow::{bail, Context, Result};
use mesh_session::EngineConfig;
use mesh_storage::{DedupConfig, EvictionPolicy};
use mesh_wire::{MessageType, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Durations written as humantime strings (`"250ms"`, `"30s"`)
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Whole simulator scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Quiet period allowed for discovery and again for delivery
    #[serde(with = "duration_str")]
    pub settle: Duration,
    /// Engine settings shared by every node
    pub engine: EngineSettings,
    /// Participating nodes
    pub nodes: Vec<NodeConfig>,
    /// Pairs of nicknames within radio range of each other
    pub links: Vec<[String; 2]>,
    /// Messages sent once the mesh has settled
    pub messages: Vec<ScriptedMessage>,
}

/// Engine settings in config-file form
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// TTL for originated packets
    pub default_ttl: u8,
    /// Largest link frame
    pub max_frame_len: usize,
    /// Pad frames to 16-byte blocks
    pub pad: bool,
    /// Dedup cache capacity
    pub dedup_capacity: usize,
    /// Dedup eviction policy
    pub dedup_policy: EvictionPolicy,
    /// Concurrent fragment sets per node
    pub max_fragment_sets: usize,
    /// Fragment reassembly timeout
    #[serde(with = "duration_str")]
    pub fragment_timeout: Duration,
    /// Connection attempt timeout
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
    /// Backoff after a failure
    #[serde(with = "duration_str")]
    pub failure_backoff: Duration,
    /// Sweep period
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,
    /// Periodic announce period
    #[serde(with = "duration_str")]
    pub announce_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            default_ttl: engine.default_ttl,
            max_frame_len: engine.max_frame_len,
            pad: engine.pad,
            dedup_capacity: engine.dedup.capacity,
            dedup_policy: engine.dedup.policy,
            max_fragment_sets: engine.max_fragment_sets,
            fragment_timeout: engine.fragment_timeout,
            connect_timeout: engine.connect_timeout,
            failure_backoff: engine.failure_backoff,
            sweep_interval: engine.sweep_interval,
            announce_interval: engine.announce_interval,
        }
    }
}

impl EngineSettings {
    /// Engine configuration for one node
    pub fn engine_config(&self, local_id: PeerId, nickname: &str) -> EngineConfig {
        EngineConfig {
            local_id,
            nickname: nickname.to_string(),
            default_ttl: self.default_ttl,
            max_frame_len: self.max_frame_len,
            pad: self.pad,
            dedup: DedupConfig {
                capacity: self.dedup_capacity,
                policy: self.dedup_policy,
            },
            max_fragment_sets: self.max_fragment_sets,
            fragment_timeout: self.fragment_timeout,
            connect_timeout: self.connect_timeout,
            failure_backoff: self.failure_backoff,
            sweep_interval: self.sweep_interval,
            announce_interval: self.announce_interval,
        }
    }
}

/// One simulated device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Nickname, also used to refer to the node in links and messages
    pub nickname: String,
    /// Explicit peer id (hex); derived from the position when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PeerId>,
}

/// A message sent by the scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedMessage {
    /// Sending node
    pub from: String,
    /// Recipient node, broadcast when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Raw message type byte
    #[serde(default = "default_message_type")]
    pub message_type: u8,
    /// Text payload
    #[serde(default)]
    pub payload: String,
    /// Random bytes appended to the payload
    #[serde(default)]
    pub random_bytes: usize,
    /// Pause before sending
    #[serde(default, with = "duration_str")]
    pub after: Duration,
}

fn default_message_type() -> u8 {
    MessageType::Message.into()
}

impl Default for SimConfig {
    fn default() -> Self {
        let node = |nickname: &str| NodeConfig {
            nickname: nickname.to_string(),
            id: None,
        };
        let link = |a: &str, b: &str| [a.to_string(), b.to_string()];
        Self {
            settle: Duration::from_millis(300),
            engine: EngineSettings {
                sweep_interval: Duration::from_millis(50),
                announce_interval: Duration::from_millis(100),
                ..EngineSettings::default()
            },
            nodes: vec![node("alice"), node("bob"), node("carol")],
            links: vec![link("alice", "bob"), link("bob", "carol")],
            messages: vec![
                ScriptedMessage {
                    from: "alice".to_string(),
                    to: None,
                    message_type: default_message_type(),
                    payload: "cashuAeyJ0b2tlbiI6W3sibWludCI6Im1lc2gifV19".to_string(),
                    random_bytes: 0,
                    after: Duration::ZERO,
                },
                ScriptedMessage {
                    from: "alice".to_string(),
                    to: Some("carol".to_string()),
                    message_type: default_message_type(),
                    payload: "for carol only".to_string(),
                    random_bytes: 0,
                    after: Duration::from_millis(20),
                },
                ScriptedMessage {
                    from: "carol".to_string(),
                    to: None,
                    message_type: default_message_type(),
                    payload: "large:".to_string(),
                    random_bytes: 2000,
                    after: Duration::from_millis(20),
                },
            ],
        }
    }
}

impl SimConfig {
    /// Load from `config_path` (or use the built-in scenario), then apply
    /// environment overrides
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => Self::load_from_file(path)?,
            None => {
                info!("No config file given, using the built-in scenario");
                Self::default()
            }
        };

        config.apply_environment_overrides();

        info!(
            "Scenario: {} nodes, {} links, {} messages, ttl={}, frame={} bytes",
            config.nodes.len(),
            config.links.len(),
            config.messages.len(),
            config.engine.default_ttl,
            config.engine.max_frame_len
        );

        Ok(config)
    }

    fn load_from_file(config_path: &Path) -> Result<Self> {
        match std::fs::read_to_string(config_path) {
            Ok(content) => {
                let config = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", config_path))?;
                info!("Loaded configuration from {:?}", config_path);
                Ok(config)
            }
            Err(e) => {
                warn!("Config file {:?} not readable ({}), using defaults", config_path, e);
                Ok(Self::default())
            }
        }
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(ttl) = std::env::var("MESH_DEFAULT_TTL") {
            match ttl.parse::<u8>() {
                Ok(ttl) => {
                    self.engine.default_ttl = ttl;
                    info!("Default TTL overridden by environment: {}", ttl);
                }
                Err(e) => warn!("Ignoring MESH_DEFAULT_TTL={}: {}", ttl, e),
            }
        }

        if let Ok(frame) = std::env::var("MESH_MAX_FRAME_LEN") {
            match frame.parse::<usize>() {
                Ok(frame) => {
                    self.engine.max_frame_len = frame;
                    info!("Max frame length overridden by environment: {}", frame);
                }
                Err(e) => warn!("Ignoring MESH_MAX_FRAME_LEN={}: {}", frame, e),
            }
        }

        if let Ok(capacity) = std::env::var("MESH_DEDUP_CAPACITY") {
            match capacity.parse::<usize>() {
                Ok(capacity) => {
                    self.engine.dedup_capacity = capacity;
                    info!("Dedup capacity overridden by environment: {}", capacity);
                }
                Err(e) => warn!("Ignoring MESH_DEDUP_CAPACITY={}: {}", capacity, e),
            }
        }

        if let Ok(settle) = std::env::var("MESH_SETTLE") {
            match humantime::parse_duration(&settle) {
                Ok(settle) => {
                    self.settle = settle;
                    info!("Settle time overridden by environment: {:?}", settle);
                }
                Err(e) => warn!("Ignoring MESH_SETTLE={}: {}", settle, e),
            }
        }
    }

    /// Peer id of the node at `index`
    pub fn node_id(&self, index: usize) -> PeerId {
        self.nodes[index].id.unwrap_or_else(|| PeerId::from_u64(index as u64 + 1))
    }

    /// Reject scenarios that refer to unknown nodes or reuse names and ids
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("Scenario has no nodes");
        }
        if self.engine.default_ttl == 0 {
            bail!("default_ttl must be at least 1");
        }
        if self.engine.max_frame_len < 64 {
            bail!("max_frame_len {} is too small (minimum 64)", self.engine.max_frame_len);
        }

        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for (index, node) in self.nodes.iter().enumerate() {
            if !names.insert(node.nickname.as_str()) {
                bail!("Duplicate node nickname '{}'", node.nickname);
            }
            let id = self.node_id(index);
            if id.is_broadcast() || !ids.insert(id) {
                bail!("Node '{}' has an unusable or duplicate id {}", node.nickname, id);
            }
        }

        for [a, b] in &self.links {
            for name in [a, b] {
                if !names.contains(name.as_str()) {
                    bail!("Link refers to unknown node '{}'", name);
                }
            }
            if a == b {
                bail!("Node '{}' cannot link to itself", a);
            }
        }

        for message in &self.messages {
            if !names.contains(message.from.as_str()) {
                bail!("Message sender '{}' is not a node", message.from);
            }
            if let Some(to) = &message.to {
                if !names.contains(to.as_str()) {
                    bail!("Message recipient '{}' is not a node", to);
                }
            }
        }

        Ok(())
    }
}
