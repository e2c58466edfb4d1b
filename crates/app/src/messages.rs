//! Per-room message log with optimistic reconciliation
//!
//! Each room holds one ordered list of messages. Optimistic local entries
//! (id == client_id, sequence 0) are appended at send time; when the
//! server echo arrives its durable form replaces the optimistic entry in
//! place, so the sender's view never flickers or duplicates. An optional
//! on-disk cache mirrors whatever the log holds so a restart paints
//! instantly.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use nexus_core::{Database, Message, MessageRepository, RoomKey};

/// How many cached rows to load per room on startup
const CACHE_LOAD_LIMIT: u32 = 200;

/// In-memory message state per room, optionally mirrored to disk.
pub struct MessageLog {
    rooms: HashMap<String, Vec<Message>>,
    cache: Option<Arc<Database>>,
}

impl MessageLog {
    pub fn new(cache: Option<Arc<Database>>) -> Self {
        Self {
            rooms: HashMap::new(),
            cache,
        }
    }

    /// Paint a room from the cache, if one is configured and the room is
    /// not loaded yet.
    pub fn load(&mut self, room: &str) {
        if self.rooms.contains_key(room) {
            return;
        }
        let mut entries = Vec::new();
        if let Some(cache) = &self.cache {
            match cache.history(&RoomKey::from_raw(room), CACHE_LOAD_LIMIT) {
                Ok(cached) => {
                    debug!(room, count = cached.len(), "Loaded room from cache");
                    entries = cached;
                }
                Err(e) => warn!(room, error = %e, "Cache read failed"),
            }
        }
        self.rooms.insert(room.to_string(), entries);
    }

    /// Append an optimistic local message at send time.
    pub fn optimistic_insert(&mut self, message: Message) {
        let room = message.room.as_str().to_string();
        self.rooms.entry(room.clone()).or_default().push(message);
        self.mirror(&room);
    }

    /// Apply a server delivery. Returns true when it settled one of our own
    /// optimistic entries (the echo case); false for a foreign message.
    /// Redelivery of an already-known durable id is ignored.
    pub fn apply_delivery(&mut self, message: Message) -> bool {
        let room = message.room.as_str().to_string();
        let entries = self.rooms.entry(room.clone()).or_default();

        if entries.iter().any(|m| !m.is_optimistic() && m.id == message.id) {
            debug!(room, id = %message.id, "Duplicate delivery ignored");
            return false;
        }

        let own_echo = entries
            .iter()
            .position(|m| m.is_optimistic() && m.client_id == message.client_id);

        match own_echo {
            Some(idx) => {
                // Replace in place so the entry keeps its position
                entries[idx] = message;
                self.mirror(&room);
                true
            }
            None => {
                entries.push(message);
                self.mirror(&room);
                false
            }
        }
    }

    /// Reconcile server history into a room. The result is the union of
    /// the snapshot and what the log already holds: confirmed entries the
    /// snapshot missed (deliveries committed after the server's read) are
    /// kept and ordered by sequence, and unconfirmed locals stay at the
    /// end.
    pub fn merge_history(&mut self, room: &str, history: Vec<Message>) {
        let entries = self.rooms.entry(room.to_string()).or_default();

        let mut merged = history;
        let mut locals = Vec::new();
        for m in entries.drain(..) {
            if m.is_optimistic() {
                if !merged.iter().any(|h| h.client_id == m.client_id) {
                    locals.push(m);
                }
            } else if !merged.iter().any(|h| h.id == m.id) {
                merged.push(m);
            }
        }
        merged.sort_by_key(|m| m.sequence);
        merged.extend(locals);

        *entries = merged;
        self.mirror(room);
    }

    /// Messages for a room, display order.
    pub fn messages(&self, room: &str) -> &[Message] {
        self.rooms.get(room).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Rewrite the cache rows for one room to match the in-memory list.
    /// Cache trouble is logged and swallowed; the cache is best-effort.
    fn mirror(&self, room: &str) {
        let Some(cache) = &self.cache else { return };
        let Some(entries) = self.rooms.get(room) else {
            return;
        };

        let key = RoomKey::from_raw(room);
        if let Err(e) = cache.delete_room(&key) {
            warn!(room, error = %e, "Cache clear failed");
            return;
        }
        for message in entries {
            if let Err(e) = cache.append(message) {
                warn!(room, error = %e, "Cache write failed");
                return;
            }
        }
    }
}
