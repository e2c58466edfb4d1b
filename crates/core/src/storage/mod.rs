//! SQLite storage layer for Nexus
//!
//! One `Database` handle per process side: the server's durable store, or a
//! client's local cache. Both use the same schema.

mod messages;
pub(crate) mod migrations;
mod traits;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::instrument;

use crate::error::Result;
use crate::models::{Message, RoomKey};

pub use messages::MessageStore;
pub use traits::MessageRepository;

/// Main database handle
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create database at the given path
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open in-memory database (for testing)
    #[instrument]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get current schema version
    pub fn schema_version(&self) -> u32 {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })
        .unwrap_or(0)
    }
}

impl MessageRepository for Database {
    fn append(&self, message: &Message) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        MessageStore::new(&conn).append(message)
    }

    fn history(&self, room: &RoomKey, limit: u32) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        MessageStore::new(&conn).history(room, limit)
    }

    fn last_sequence(&self, room: &RoomKey) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        MessageStore::new(&conn).last_sequence(room)
    }

    fn delete_room(&self, room: &RoomKey) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        MessageStore::new(&conn).delete_room(room)
    }

    fn count(&self, room: &RoomKey) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        MessageStore::new(&conn).count(room)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Draft;

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("nexus.db")).unwrap();
        assert!(db.schema_version() > 0);
    }

    #[test]
    fn test_repository_through_trait() {
        let db = Database::open_in_memory().unwrap();
        let repo: &dyn MessageRepository = &db;

        let room = RoomKey::community("7");
        let draft = Draft::new(room.clone(), "hello", false).unwrap();
        let msg = Message::finalize(
            draft.client_id,
            room.clone(),
            "u1".into(),
            "Alice".into(),
            draft.content,
            1,
            false,
        );

        repo.append(&msg).unwrap();
        assert_eq!(repo.count(&room).unwrap(), 1);
        assert_eq!(repo.history(&room, 10).unwrap()[0].content, "hello");
    }
}
