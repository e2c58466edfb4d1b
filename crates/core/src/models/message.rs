//! Message model
//!
//! A message is immutable after creation. Edits are not supported; the only
//! removal path is cascading room deletion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::RoomKey;

/// Display name used when the author opts into anonymous posting.
///
/// A content attribute only: the sender identifier stays intact for
/// moderation and for the sender's own "mine" rendering.
pub const ANONYMOUS_NAME: &str = "Anonymous";

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Durable identifier, assigned server-side on first commit.
    pub id: Uuid,
    /// Client-generated identifier, threaded through the server echo so the
    /// sender can reconcile its optimistic copy by exact match.
    pub client_id: Uuid,
    pub room: RoomKey,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    /// Server commit time.
    pub timestamp: DateTime<Utc>,
    /// Per-room commit order. Ties in wall-clock time never matter.
    pub sequence: u64,
    pub anonymous: bool,
}

/// An outgoing message before the server has confirmed it.
#[derive(Debug, Clone)]
pub struct Draft {
    pub client_id: Uuid,
    pub room: RoomKey,
    pub content: String,
    pub anonymous: bool,
}

impl Draft {
    /// Build a draft, trimming the content and rejecting malformed input
    /// synchronously.
    pub fn new(room: RoomKey, content: impl Into<String>, anonymous: bool) -> Result<Self> {
        let content = content.into().trim().to_string();
        validate(&room, &content)?;
        Ok(Self {
            client_id: Uuid::new_v4(),
            room,
            content,
            anonymous,
        })
    }
}

/// Validate a room key and message content.
pub fn validate(room: &RoomKey, content: &str) -> Result<()> {
    if room.is_empty() {
        return Err(Error::Validation("room key is empty".into()));
    }
    if content.trim().is_empty() {
        return Err(Error::Validation("message content is empty".into()));
    }
    Ok(())
}

impl Message {
    /// Server-side finalization: assigns the durable identifier, commit
    /// timestamp, and per-room sequence. Anonymous messages carry the
    /// anonymized display name on the wire.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize(
        client_id: Uuid,
        room: RoomKey,
        sender_id: String,
        sender_name: String,
        content: String,
        sequence: u64,
        anonymous: bool,
    ) -> Self {
        let sender_name = if anonymous {
            ANONYMOUS_NAME.to_string()
        } else {
            sender_name
        };
        Self {
            id: Uuid::new_v4(),
            client_id,
            room,
            sender_id,
            sender_name,
            content,
            timestamp: Utc::now(),
            sequence,
            anonymous,
        }
    }

    /// Client-side optimistic copy. The durable id doubles as the client id
    /// until the server echo replaces it.
    pub fn optimistic(draft: &Draft, sender_id: &str, sender_name: &str) -> Self {
        let sender_name = if draft.anonymous {
            ANONYMOUS_NAME
        } else {
            sender_name
        };
        Self {
            id: draft.client_id,
            client_id: draft.client_id,
            room: draft.room.clone(),
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            content: draft.content.clone(),
            timestamp: Utc::now(),
            sequence: 0,
            anonymous: draft.anonymous,
        }
    }

    /// Whether this is a local optimistic copy awaiting its echo.
    pub fn is_optimistic(&self) -> bool {
        self.id == self.client_id && self.sequence == 0
    }
}
