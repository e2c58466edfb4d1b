//! Room actors
//!
//! One task per room owns that room's membership set and sequence counter.
//! Every mutation flows through the actor's mailbox, so persist-then-fanout
//! for one room is linearized while distinct rooms proceed in parallel.
//! There is no process-wide lock on the publish path.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use nexus_core::{Message, MessageRepository, RoomKey};

use crate::protocol::{Event, WireMessage};

/// Mailbox depth per room
const ROOM_MAILBOX: usize = 64;

/// Commands accepted by a room actor
pub(crate) enum RoomCmd {
    /// Register a connection. Idempotent.
    Join {
        conn_id: Uuid,
        tx: mpsc::Sender<Event>,
    },

    /// Remove a connection. The last leave never destroys the room's
    /// history.
    Leave { conn_id: Uuid },

    /// Persist a message and fan it out to every member, sender included.
    /// `reply` is the sending connection's outbound channel; rejections go
    /// there and nowhere else.
    Publish {
        client_id: Uuid,
        sender_id: String,
        sender_name: String,
        content: String,
        anonymous: bool,
        reply: mpsc::Sender<Event>,
    },

    /// Membership snapshot
    Members {
        reply: oneshot::Sender<Vec<Uuid>>,
    },
}

/// Room directory: spawns an actor per room on first use.
///
/// Rooms spring into existence when any connection joins them or any
/// message targets them; actors stay resident afterwards (membership may
/// drain to zero, history lives in the store regardless).
pub(crate) struct RoomRegistry {
    rooms: RwLock<HashMap<String, mpsc::Sender<RoomCmd>>>,
    store: Arc<dyn MessageRepository + Send + Sync>,
    degraded_threshold: u32,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn MessageRepository + Send + Sync>, degraded_threshold: u32) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            degraded_threshold,
        }
    }

    /// Handle for a room, spawning its actor if this is the first time the
    /// key is seen.
    pub async fn room(&self, key: &str) -> mpsc::Sender<RoomCmd> {
        if let Some(tx) = self.rooms.read().await.get(key) {
            return tx.clone();
        }

        let mut rooms = self.rooms.write().await;
        // Lost the race to another spawner?
        if let Some(tx) = rooms.get(key) {
            return tx.clone();
        }

        let (tx, rx) = mpsc::channel(ROOM_MAILBOX);
        tokio::spawn(room_task(
            RoomKey::from_raw(key),
            rx,
            self.store.clone(),
            self.degraded_threshold,
        ));
        rooms.insert(key.to_string(), tx.clone());

        info!(room = key, "Room actor spawned");
        tx
    }

    /// Handle for a room only if its actor already exists. Leave paths use
    /// this so that leaving never conjures a room.
    pub async fn lookup(&self, key: &str) -> Option<mpsc::Sender<RoomCmd>> {
        self.rooms.read().await.get(key).cloned()
    }
}

/// One room's event loop: all membership and sequence mutation happens here.
async fn room_task(
    key: RoomKey,
    mut rx: mpsc::Receiver<RoomCmd>,
    store: Arc<dyn MessageRepository + Send + Sync>,
    degraded_threshold: u32,
) {
    let mut members: HashMap<Uuid, mpsc::Sender<Event>> = HashMap::new();

    // Resume the sequence after the last committed message
    let mut next_sequence = match store.last_sequence(&key) {
        Ok(last) => last + 1,
        Err(e) => {
            warn!(room = %key, error = %e, "Failed to read last sequence, starting at 1");
            1
        }
    };

    let mut store_failures: u32 = 0;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RoomCmd::Join { conn_id, tx } => {
                members.insert(conn_id, tx);
                debug!(room = %key, conn_id = %conn_id, members = members.len(), "Joined room");
            }
            RoomCmd::Leave { conn_id } => {
                if members.remove(&conn_id).is_some() {
                    debug!(room = %key, conn_id = %conn_id, members = members.len(), "Left room");
                }
            }
            RoomCmd::Publish {
                client_id,
                sender_id,
                sender_name,
                content,
                anonymous,
                reply,
            } => {
                let message = Message::finalize(
                    client_id,
                    key.clone(),
                    sender_id,
                    sender_name,
                    content,
                    next_sequence,
                    anonymous,
                );

                // Durability precedes visibility: a failed append means no
                // fan-out, and only the sender hears about it.
                if let Err(e) = store.append(&message) {
                    warn!(room = %key, error = %e, "Message append failed");
                    store_failures += 1;

                    let _ = reply
                        .send(Event::SendRejected {
                            client_id,
                            reason: "message could not be persisted".into(),
                        })
                        .await;

                    if store_failures == degraded_threshold {
                        warn!(room = %key, failures = store_failures, "Store degraded");
                        let degraded = Event::Degraded {
                            reason: "message store unavailable".into(),
                        };
                        for tx in members.values() {
                            let _ = tx.send(degraded.clone()).await;
                        }
                    }
                    continue;
                }

                store_failures = 0;
                next_sequence += 1;

                let wire = WireMessage::from(message);
                debug!(room = %key, sequence = wire.sequence, "Committed, fanning out");
                for tx in members.values() {
                    if tx.send(Event::Deliver(wire.clone())).await.is_err() {
                        debug!(room = %key, "Failed to queue delivery for member");
                    }
                }
            }
            RoomCmd::Members { reply } => {
                let _ = reply.send(members.keys().copied().collect());
            }
        }
    }

    debug!(room = %key, "Room actor stopped");
}
