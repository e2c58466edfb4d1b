//! Nexus Core Library
//!
//! Data model, validation, configuration, and message storage for the
//! Nexus room-based messaging core.

pub mod config;
pub mod error;
pub mod models;
pub mod storage;

pub use config::{Config, ReconnectConfig, ServerConfig};
pub use error::{Error, Result};
pub use models::{validate, Draft, Message, RoomKey, ANONYMOUS_NAME};
pub use storage::{Database, MessageRepository, MessageStore};
