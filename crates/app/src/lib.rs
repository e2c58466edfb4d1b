//! Nexus Application Library
//!
//! Client-side session layer: the message log with optimistic
//! reconciliation, the outbox tracking in-flight sends, and the session
//! that ties them to a server connection with automatic reconnect.

pub mod messages;
pub mod outbox;
pub mod session;

pub use messages::MessageLog;
pub use outbox::{DeliveryState, Outbox};
pub use session::{backoff_delay, Identity, Session, SessionEvent, SessionState};
