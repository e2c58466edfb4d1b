//! Message storage operations

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Message, RoomKey};

pub struct MessageStore<'a> {
    conn: &'a Connection,
}

impl<'a> MessageStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Append a message under its room key.
    pub fn append(&self, message: &Message) -> Result<()> {
        self.conn.execute(
            "INSERT INTO messages (id, client_id, room_key, sender_id, sender_name, content, created_at, sequence, anonymous)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.id.to_string(),
                message.client_id.to_string(),
                message.room.as_str(),
                message.sender_id,
                message.sender_name,
                message.content,
                message.timestamp.to_rfc3339(),
                message.sequence,
                message.anonymous as i32,
            ],
        )?;
        Ok(())
    }

    /// The most recent `limit` messages for a room, oldest first.
    pub fn history(&self, room: &RoomKey, limit: u32) -> Result<Vec<Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, client_id, room_key, sender_id, sender_name, content, created_at, sequence, anonymous
             FROM messages WHERE room_key = ?1
             ORDER BY sequence DESC
             LIMIT ?2",
        )?;

        let mut messages: Vec<Message> = stmt
            .query_map(params![room.as_str(), limit], Self::map_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Reverse to get commit order
        messages.reverse();
        Ok(messages)
    }

    /// Highest committed sequence for a room, 0 if empty.
    pub fn last_sequence(&self, room: &RoomKey) -> Result<u64> {
        let max: Option<u64> = self.conn.query_row(
            "SELECT MAX(sequence) FROM messages WHERE room_key = ?1",
            params![room.as_str()],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    /// Remove a room's entire history.
    pub fn delete_room(&self, room: &RoomKey) -> Result<u64> {
        let removed = self.conn.execute(
            "DELETE FROM messages WHERE room_key = ?1",
            params![room.as_str()],
        )?;
        Ok(removed as u64)
    }

    /// Message count for a room.
    pub fn count(&self, room: &RoomKey) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE room_key = ?1",
            params![room.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
        Ok(Message {
            id: parse_uuid(row, 0)?,
            client_id: parse_uuid(row, 1)?,
            room: RoomKey::from_raw(row.get::<_, String>(2)?),
            sender_id: row.get(3)?,
            sender_name: row.get(4)?,
            content: row.get(5)?,
            timestamp: parse_timestamp(row, 6)?,
            sequence: row.get(7)?,
            anonymous: row.get::<_, i32>(8)? != 0,
        })
    }
}

fn parse_uuid(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
