//! Nexus Network Library
//!
//! Framed TCP transport for the Nexus messaging core: the wire protocol,
//! the server with its per-room actors, and the client connection handle.

pub mod client;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod server;

pub use client::{Client, ClientEvent, ConnectionState};
pub use error::{Error, Result};
pub use protocol::{Event, WireMessage};
pub use server::Server;
