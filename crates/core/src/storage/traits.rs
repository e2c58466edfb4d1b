//! Storage repository traits
//!
//! The message store is an external collaborator as far as the messaging
//! core is concerned; this trait is the seam. The shipped implementation is
//! SQLite, but tests and future backends only need ordered append and
//! range read.

use crate::error::Result;
use crate::models::{Message, RoomKey};

/// Message repository operations
pub trait MessageRepository {
    /// Durably append a message under its room key. Fan-out must never
    /// proceed unless this has succeeded.
    fn append(&self, message: &Message) -> Result<()>;

    /// The most recent `limit` messages for a room, in commit order.
    fn history(&self, room: &RoomKey, limit: u32) -> Result<Vec<Message>>;

    /// Highest committed sequence for a room, 0 if the room has no history.
    fn last_sequence(&self, room: &RoomKey) -> Result<u64>;

    /// Remove a room's entire history (cascade from community deletion).
    /// Returns the number of messages removed.
    fn delete_room(&self, room: &RoomKey) -> Result<u64>;

    /// Message count for a room.
    fn count(&self, room: &RoomKey) -> Result<u64>;
}
