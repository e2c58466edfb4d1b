//! Core data models

mod message;
mod room;

pub use message::{validate, Draft, Message, ANONYMOUS_NAME};
pub use room::RoomKey;
