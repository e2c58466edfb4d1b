//! Messaging client connection
//!
//! A thin connection handle over one TCP session: commands go down a
//! channel to the connection task, server events come back up. Liveness is
//! enforced here (the server pings; silence past the caller-supplied
//! deadline tears the connection down), but reconnecting is the caller's
//! business.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{Event, WireMessage};

/// Queue depths for the command and event channels
const CHANNEL_CAPACITY: usize = 128;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to the owner of a [`Client`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Handshake completed; the server assigned this connection id.
    Connected { connection_id: Uuid },
    /// A committed message, ours or anyone else's.
    Delivered(WireMessage),
    /// Our send was refused; `client_id` names which one.
    Rejected { client_id: Uuid, reason: String },
    /// Room history in commit order.
    History {
        room: String,
        messages: Vec<WireMessage>,
    },
    /// The server reported persistent store trouble.
    Degraded { reason: String },
    /// The connection ended, cleanly or not.
    Disconnected,
}

enum Cmd {
    Send(Event),
    Close,
}

/// One live connection to the server.
pub struct Client {
    state: ConnectionState,
    cmd_tx: mpsc::Sender<Cmd>,
    event_rx: mpsc::Receiver<ClientEvent>,
}

impl Client {
    /// Connect and complete the Welcome handshake. `liveness` bounds how
    /// long the server may stay silent before the connection is declared
    /// dead; it must exceed the server's heartbeat interval.
    #[instrument]
    pub async fn connect(addr: SocketAddr, liveness: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        debug!("TCP connected, awaiting handshake");

        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(connection_task(stream, liveness, cmd_rx, event_tx));

        Ok(Self {
            state: ConnectionState::Connecting,
            cmd_tx,
            event_rx,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Next event from the connection. Returns `None` once the connection
    /// task is gone for good.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        let event = self.event_rx.recv().await;
        match &event {
            Some(ClientEvent::Connected { .. }) => self.state = ConnectionState::Connected,
            Some(ClientEvent::Disconnected) | None => self.state = ConnectionState::Disconnected,
            _ => {}
        }
        event
    }

    pub async fn announce(&self, user_id: &str, display_name: &str) -> Result<()> {
        self.send_event(Event::Announce {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
        })
        .await
    }

    pub async fn join_room(&self, room: &str) -> Result<()> {
        self.send_event(Event::JoinRoom {
            room: room.to_string(),
        })
        .await
    }

    pub async fn leave_room(&self, room: &str) -> Result<()> {
        self.send_event(Event::LeaveRoom {
            room: room.to_string(),
        })
        .await
    }

    pub async fn send_message(
        &self,
        room: &str,
        client_id: Uuid,
        content: &str,
        anonymous: bool,
    ) -> Result<()> {
        self.send_event(Event::SendMessage {
            room: room.to_string(),
            client_id,
            content: content.to_string(),
            anonymous,
        })
        .await
    }

    pub async fn fetch_history(&self, room: &str, limit: u32) -> Result<()> {
        self.send_event(Event::FetchHistory {
            room: room.to_string(),
            limit,
        })
        .await
    }

    /// Close the connection. Safe to call more than once.
    pub async fn disconnect(&mut self) {
        let _ = self.cmd_tx.send(Cmd::Close).await;
        self.state = ConnectionState::Disconnected;
    }

    async fn send_event(&self, event: Event) -> Result<()> {
        self.cmd_tx
            .send(Cmd::Send(event))
            .await
            .map_err(|_| Error::NotConnected)
    }
}

async fn connection_task(
    stream: TcpStream,
    liveness: Duration,
    mut cmd_rx: mpsc::Receiver<Cmd>,
    event_tx: mpsc::Sender<ClientEvent>,
) {
    let (mut reader, mut writer) = stream.into_split();

    // First frame must be the Welcome
    let handshake = tokio::time::timeout(liveness, read_frame(&mut reader)).await;
    let connection_id = match handshake {
        Ok(Ok(Event::Welcome { connection_id })) => connection_id,
        Ok(Ok(other)) => {
            warn!(?other, "Handshake got unexpected event");
            let _ = event_tx.send(ClientEvent::Disconnected).await;
            return;
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Handshake read failed");
            let _ = event_tx.send(ClientEvent::Disconnected).await;
            return;
        }
        Err(_) => {
            warn!("Handshake timed out");
            let _ = event_tx.send(ClientEvent::Disconnected).await;
            return;
        }
    };

    info!(%connection_id, "Connected");
    if event_tx
        .send(ClientEvent::Connected { connection_id })
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            read = tokio::time::timeout(liveness, read_frame(&mut reader)) => {
                match read {
                    Ok(Ok(Event::Ping)) => {
                        if write_frame(&mut writer, &Event::Pong).await.is_err() {
                            break;
                        }
                    }
                    Ok(Ok(event)) => {
                        if let Some(client_event) = translate(event) {
                            if event_tx.send(client_event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        debug!(error = %e, "Connection lost");
                        break;
                    }
                    Err(_) => {
                        warn!("Server silent past liveness deadline");
                        break;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Cmd::Send(event)) => {
                        if let Err(e) = write_frame(&mut writer, &event).await {
                            debug!(error = %e, "Write failed");
                            break;
                        }
                    }
                    Some(Cmd::Close) | None => {
                        debug!("Closing connection");
                        break;
                    }
                }
            }
        }
    }

    let _ = event_tx.send(ClientEvent::Disconnected).await;
}

/// Map a server event to the owner-facing kind. Pings are handled inline;
/// client-to-server kinds arriving here are protocol noise and dropped.
fn translate(event: Event) -> Option<ClientEvent> {
    match event {
        Event::Deliver(m) => Some(ClientEvent::Delivered(m)),
        Event::SendRejected { client_id, reason } => {
            Some(ClientEvent::Rejected { client_id, reason })
        }
        Event::History { room, messages } => Some(ClientEvent::History { room, messages }),
        Event::Degraded { reason } => Some(ClientEvent::Degraded { reason }),
        Event::Pong => None,
        other => {
            debug!(?other, "Dropping unexpected server event");
            None
        }
    }
}
