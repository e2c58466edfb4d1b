//! Wire protocol event types
//!
//! All events are JSON-serialized and length-prefixed on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nexus_core::{Message, RoomKey};

/// A finalized message as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Server-confirmed durable id.
    pub id: Uuid,
    /// Client-generated id, echoed back verbatim for sender-side
    /// reconciliation.
    pub client_id: Uuid,
    pub room: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub anonymous: bool,
}

impl From<Message> for WireMessage {
    fn from(msg: Message) -> Self {
        Self {
            id: msg.id,
            client_id: msg.client_id,
            room: msg.room.as_str().to_string(),
            sender_id: msg.sender_id,
            sender_name: msg.sender_name,
            content: msg.content,
            timestamp: msg.timestamp,
            sequence: msg.sequence,
            anonymous: msg.anonymous,
        }
    }
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        Self {
            id: wire.id,
            client_id: wire.client_id,
            room: RoomKey::from_raw(wire.room),
            sender_id: wire.sender_id,
            sender_name: wire.sender_name,
            content: wire.content,
            timestamp: wire.timestamp,
            sequence: wire.sequence,
            anonymous: wire.anonymous,
        }
    }
}

/// Protocol events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Client associates a user identity with its connection. Idempotent;
    /// overwrites any prior association.
    Announce {
        user_id: String,
        display_name: String,
    },

    /// Client registers in a room. Joining an already-joined room is a
    /// no-op.
    JoinRoom { room: String },

    /// Client leaves a room. The room's history persists regardless.
    LeaveRoom { room: String },

    /// Client submits a message for a room.
    SendMessage {
        room: String,
        client_id: Uuid,
        content: String,
        anonymous: bool,
    },

    /// Client requests recent room history.
    FetchHistory { room: String, limit: u32 },

    /// Server handshake: the freshly assigned connection id.
    Welcome { connection_id: Uuid },

    /// Fan-out delivery of a committed message, sender included.
    Deliver(WireMessage),

    /// A send was rejected; reported to the sender only.
    SendRejected { client_id: Uuid, reason: String },

    /// Recent room history, commit order.
    History {
        room: String,
        messages: Vec<WireMessage>,
    },

    /// The store is persistently failing; the service is degraded.
    Degraded { reason: String },

    /// Liveness check.
    Ping,

    /// Liveness response.
    Pong,
}

impl Event {
    /// Serialize event to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize event from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
