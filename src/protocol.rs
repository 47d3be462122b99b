//! Wire protocol: sync messages between paired peers and the signaling
//! vocabulary spoken with the signal server.
//!
//! Both travel as canonical JSON in WebSocket text frames:
//! ```text
//! peer ↔ peer:   { "clock": { "<actor>": <seq>, ... }, "changes": [ ... ] }
//! client → signal: { "type": "Join", "join": ["<key>", ...] }
//! signal → client: { "type": "Introduction", "id": "<peer>", "keys": [...] }
//! ```
//!
//! A sync message with `changes` is a data push; with the field omitted
//! entirely it is a pull request for anything newer than `clock`. Clock keys
//! serialize sorted ascending, so identical messages are byte-identical on
//! every peer.

use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;

/// One opaque, immutable CRDT change. The sync layer never looks inside;
/// causality is the engine's problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Change(Vec<u8>);

impl Change {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Peer-to-peer sync message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub clock: VectorClock,
    /// Omitted (not null) when this message is a pull request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<Change>>,
}

impl SyncMessage {
    /// A pull request: "here is what I hold, send me anything newer."
    pub fn pull(clock: VectorClock) -> Self {
        Self {
            clock,
            changes: None,
        }
    }

    /// A data push carrying changes the peer lacks.
    pub fn push(clock: VectorClock, changes: Vec<Change>) -> Self {
        Self {
            clock,
            changes: Some(changes),
        }
    }

    pub fn is_pull(&self) -> bool {
        self.changes.is_none()
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Client-to-signal-server messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Advertise interest in a set of discovery keys.
    Join { join: Vec<String> },
}

/// Signal-server-to-client messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Another peer shares interest in `keys`; dial it.
    Introduction { id: String, keys: Vec<String> },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
