//! Outbox: pending-send tracking
//!
//! Every optimistic send is tracked here by its client-generated id until
//! the server echoes it back (confirmed) or rejects it / times out
//! (failed). The outbox holds bookkeeping only; message content lives in
//! the message log.

use std::collections::HashMap;
use std::time::Instant;

use uuid::Uuid;

/// Lifecycle of one tracked send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Sent, awaiting the server echo.
    Pending,
    /// The echo arrived; the message is durable.
    Confirmed,
    /// Rejected or expired without an echo.
    Failed,
}

struct Entry {
    state: DeliveryState,
    sent_at: Instant,
}

/// Tracks in-flight sends by client id.
#[derive(Default)]
pub struct Outbox {
    entries: HashMap<Uuid, Entry>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a send.
    pub fn track(&mut self, client_id: Uuid) {
        self.entries.insert(
            client_id,
            Entry {
                state: DeliveryState::Pending,
                sent_at: Instant::now(),
            },
        );
    }

    /// Mark a send confirmed. Returns false for unknown ids (echoes of
    /// messages sent before a restart, or duplicates).
    pub fn confirm(&mut self, client_id: Uuid) -> bool {
        match self.entries.get_mut(&client_id) {
            Some(entry) if entry.state == DeliveryState::Pending => {
                entry.state = DeliveryState::Confirmed;
                true
            }
            _ => false,
        }
    }

    /// Mark a send failed. Returns false for unknown or already-settled ids.
    pub fn fail(&mut self, client_id: Uuid) -> bool {
        match self.entries.get_mut(&client_id) {
            Some(entry) if entry.state == DeliveryState::Pending => {
                entry.state = DeliveryState::Failed;
                true
            }
            _ => false,
        }
    }

    pub fn state(&self, client_id: Uuid) -> Option<DeliveryState> {
        self.entries.get(&client_id).map(|e| e.state)
    }

    pub fn is_pending(&self, client_id: Uuid) -> bool {
        self.state(client_id) == Some(DeliveryState::Pending)
    }

    /// Ids still awaiting an echo.
    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == DeliveryState::Pending)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Sweep entries older than `max_age_ms`: pending sends are settled as
    /// failed and their ids returned; already-settled entries are dropped,
    /// so the map never grows without bound.
    pub fn expire(&mut self, max_age_ms: u64) -> Vec<Uuid> {
        let mut expired = Vec::new();
        self.entries.retain(|id, entry| {
            if (entry.sent_at.elapsed().as_millis() as u64) < max_age_ms {
                return true;
            }
            if entry.state == DeliveryState::Pending {
                entry.state = DeliveryState::Failed;
                expired.push(*id);
                true
            } else {
                false
            }
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
