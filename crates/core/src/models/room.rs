//! Room identity
//!
//! Rooms are not stored entities. A deterministic string key alone defines
//! a room: it exists the moment any connection joins it or any message
//! targets it, and only a cascading community deletion removes its history.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Namespace prefix for community (group) rooms.
const COMMUNITY_PREFIX: &str = "community-";

/// The unit of message broadcast scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    /// Direct room between two users. Both sides compute the same key
    /// independently of who initiates.
    pub fn direct(a: &str, b: &str) -> Self {
        Self::direct_among([a, b])
    }

    /// Direct room among an arbitrary participant set, e.g. two users plus
    /// the job posting their conversation is about.
    pub fn direct_among<'a, I>(ids: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut parts: Vec<&str> = ids.into_iter().collect();
        parts.sort_unstable();
        RoomKey(parts.join("-"))
    }

    /// Group room for a community.
    pub fn community(community_id: &str) -> Self {
        RoomKey(format!("{COMMUNITY_PREFIX}{community_id}"))
    }

    /// Wrap a key that was already derived elsewhere (wire input).
    pub fn from_raw(key: impl Into<String>) -> Self {
        RoomKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_community(&self) -> bool {
        self.0.starts_with(COMMUNITY_PREFIX)
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoomKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
