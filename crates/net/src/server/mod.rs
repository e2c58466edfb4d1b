//! Messaging server
//!
//! Accepts TCP connections, tracks per-connection identity and room
//! membership, and routes client events to the room actors. Each
//! connection gets a reader loop and a writer task; the writer drains an
//! mpsc queue so room fan-out never blocks on a slow socket directly.

mod room;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use nexus_core::{validate, MessageRepository, ServerConfig};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::Event;

use room::{RoomCmd, RoomRegistry};

/// Outbound queue depth per connection
const CONN_QUEUE: usize = 128;

/// History rows returned when the client asks for more than we allow
const MAX_HISTORY_LIMIT: u32 = 500;

/// Per-connection bookkeeping held by the server.
struct ConnHandle {
    /// Set once the client announces; sends are refused before that.
    user_id: Option<String>,
    display_name: Option<String>,
    /// Rooms this connection joined, for cleanup on disconnect.
    rooms: HashSet<String>,
    /// Outbound event queue drained by the connection's writer task.
    tx: mpsc::Sender<Event>,
}

/// The messaging server.
///
/// Owns the listener, the connection table, and the room registry. Cloneable
/// pieces are handed to per-connection tasks; `shutdown` stops them all.
pub struct Server {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    connections: Arc<RwLock<HashMap<Uuid, ConnHandle>>>,
    registry: Arc<RoomRegistry>,
    config: ServerConfig,
}

impl Server {
    /// Bind and start accepting connections.
    #[instrument(skip(config, store))]
    pub async fn start(
        config: &ServerConfig,
        store: Arc<dyn MessageRepository + Send + Sync>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.bind_port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "Server listening");

        let (shutdown_tx, _) = broadcast::channel(1);
        let connections = Arc::new(RwLock::new(HashMap::new()));
        let registry = Arc::new(RoomRegistry::new(
            store.clone(),
            config.degraded_threshold,
        ));

        let server = Self {
            addr,
            shutdown_tx: shutdown_tx.clone(),
            connections: connections.clone(),
            registry: registry.clone(),
            config: config.clone(),
        };

        tokio::spawn(accept_loop(
            listener,
            connections.clone(),
            registry,
            store,
            server.config.clone(),
            shutdown_tx.clone(),
        ));

        tokio::spawn(heartbeat_task(
            connections,
            Duration::from_millis(server.config.heartbeat_interval_ms),
            shutdown_tx.subscribe(),
        ));

        Ok(server)
    }

    /// Address the server actually bound (port 0 resolves here).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal every server task to stop.
    pub fn shutdown(&self) {
        info!("Server shutting down");
        let _ = self.shutdown_tx.send(());
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Connection ids currently registered in a room.
    pub async fn room_members(&self, room: &str) -> Vec<Uuid> {
        let Some(tx) = self.registry.lookup(room).await else {
            return Vec::new();
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(RoomCmd::Members { reply: reply_tx }).await.is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

async fn accept_loop(
    listener: TcpListener,
    connections: Arc<RwLock<HashMap<Uuid, ConnHandle>>>,
    registry: Arc<RoomRegistry>,
    store: Arc<dyn MessageRepository + Send + Sync>,
    config: ServerConfig,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Connection accepted");
                        tokio::spawn(handle_connection(
                            stream,
                            connections.clone(),
                            registry.clone(),
                            store.clone(),
                            config.clone(),
                            shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Accept loop stopping");
                break;
            }
        }
    }
}

#[instrument(skip_all, fields(conn_id))]
async fn handle_connection(
    stream: TcpStream,
    connections: Arc<RwLock<HashMap<Uuid, ConnHandle>>>,
    registry: Arc<RoomRegistry>,
    store: Arc<dyn MessageRepository + Send + Sync>,
    config: ServerConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let conn_id = Uuid::new_v4();
    tracing::Span::current().record("conn_id", tracing::field::display(conn_id));

    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Event>(CONN_QUEUE);

    // Handshake before anything else
    if let Err(e) = write_frame(&mut writer, &Event::Welcome { connection_id: conn_id }).await {
        warn!(error = %e, "Handshake write failed");
        return;
    }

    connections.write().await.insert(
        conn_id,
        ConnHandle {
            user_id: None,
            display_name: None,
            rooms: HashSet::new(),
            tx: tx.clone(),
        },
    );
    info!("Connection registered");

    // Writer task: drains the outbound queue. Dropping `rx`'s senders or a
    // write failure ends it.
    let writer_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &event).await {
                debug!(error = %e, "Write failed, stopping writer");
                break;
            }
        }
    });

    let conn_timeout = Duration::from_millis(config.connection_timeout_ms);

    loop {
        tokio::select! {
            read = tokio::time::timeout(conn_timeout, read_frame(&mut reader)) => {
                match read {
                    Ok(Ok(event)) => {
                        handle_event(conn_id, event, &connections, &registry, &*store, &tx).await;
                    }
                    Ok(Err(Error::ConnectionClosed)) => {
                        debug!("Peer closed connection");
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "Read failed");
                        break;
                    }
                    Err(_) => {
                        warn!("Connection timed out");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Connection stopping on shutdown");
                break;
            }
        }
    }

    remove_connection(conn_id, &connections, &registry).await;
    drop(tx);
    let _ = writer_task.await;
    info!("Connection closed");
}

/// Dispatch one client event.
async fn handle_event(
    conn_id: Uuid,
    event: Event,
    connections: &Arc<RwLock<HashMap<Uuid, ConnHandle>>>,
    registry: &Arc<RoomRegistry>,
    store: &(dyn MessageRepository + Send + Sync),
    tx: &mpsc::Sender<Event>,
) {
    match event {
        Event::Announce {
            user_id,
            display_name,
        } => {
            debug!(user_id, "Identity announced");
            let mut conns = connections.write().await;
            if let Some(handle) = conns.get_mut(&conn_id) {
                // Re-announcing overwrites; reconnecting clients do this.
                handle.user_id = Some(user_id);
                handle.display_name = Some(display_name);
            }
        }

        Event::JoinRoom { room } => {
            if room.is_empty() {
                return;
            }
            let room_tx = registry.room(&room).await;
            let _ = room_tx
                .send(RoomCmd::Join {
                    conn_id,
                    tx: tx.clone(),
                })
                .await;
            let mut conns = connections.write().await;
            if let Some(handle) = conns.get_mut(&conn_id) {
                handle.rooms.insert(room);
            }
        }

        Event::LeaveRoom { room } => {
            if let Some(room_tx) = registry.lookup(&room).await {
                let _ = room_tx.send(RoomCmd::Leave { conn_id }).await;
            }
            let mut conns = connections.write().await;
            if let Some(handle) = conns.get_mut(&conn_id) {
                handle.rooms.remove(&room);
            }
        }

        Event::SendMessage {
            room,
            client_id,
            content,
            anonymous,
        } => {
            if let Err(e) = validate(&nexus_core::RoomKey::from_raw(&room), &content) {
                let _ = tx
                    .send(Event::SendRejected {
                        client_id,
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }

            let identity = {
                let conns = connections.read().await;
                conns.get(&conn_id).and_then(|h| {
                    Some((h.user_id.clone()?, h.display_name.clone()?))
                })
            };
            let Some((sender_id, sender_name)) = identity else {
                let _ = tx
                    .send(Event::SendRejected {
                        client_id,
                        reason: "identity not announced".into(),
                    })
                    .await;
                return;
            };

            // A send targets the room whether or not the sender joined it;
            // the room actor serializes commit and fan-out.
            let room_tx = registry.room(&room).await;
            let _ = room_tx
                .send(RoomCmd::Publish {
                    client_id,
                    sender_id,
                    sender_name,
                    content,
                    anonymous,
                    reply: tx.clone(),
                })
                .await;
        }

        Event::FetchHistory { room, limit } => {
            let limit = limit.min(MAX_HISTORY_LIMIT);
            let key = nexus_core::RoomKey::from_raw(&room);
            match store.history(&key, limit) {
                Ok(messages) => {
                    let _ = tx
                        .send(Event::History {
                            room,
                            messages: messages.into_iter().map(Into::into).collect(),
                        })
                        .await;
                }
                Err(e) => {
                    warn!(room, error = %e, "History read failed");
                }
            }
        }

        Event::Ping => {
            let _ = tx.send(Event::Pong).await;
        }

        Event::Pong => {
            // Liveness satisfied by the read itself
        }

        other => {
            debug!(?other, "Ignoring unexpected client event");
        }
    }
}

/// Purge a connection from every room it joined and from the table.
async fn remove_connection(
    conn_id: Uuid,
    connections: &Arc<RwLock<HashMap<Uuid, ConnHandle>>>,
    registry: &Arc<RoomRegistry>,
) {
    let handle = connections.write().await.remove(&conn_id);
    let Some(handle) = handle else { return };

    for room in &handle.rooms {
        if let Some(room_tx) = registry.lookup(room).await {
            let _ = room_tx.send(RoomCmd::Leave { conn_id }).await;
        }
    }
    debug!(rooms = handle.rooms.len(), "Connection purged from rooms");
}

/// Periodic ping to every connection; dead sockets surface as write
/// failures in their writer tasks.
async fn heartbeat_task(
    connections: Arc<RwLock<HashMap<Uuid, ConnHandle>>>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let conns = connections.read().await;
                for handle in conns.values() {
                    let _ = handle.tx.try_send(Event::Ping);
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Heartbeat task stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_core::{Database, Message, Result as CoreResult, RoomKey};
    use tokio::io::{AsyncRead, AsyncWrite};

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_port: 0,
            heartbeat_interval_ms: 60_000,
            connection_timeout_ms: 120_000,
            send_timeout_ms: 5000,
            degraded_threshold: 3,
        }
    }

    fn memory_store() -> Arc<dyn MessageRepository + Send + Sync> {
        Arc::new(Database::open_in_memory().unwrap())
    }

    async fn connect(addr: SocketAddr) -> (TcpStream, Uuid) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let event = read_frame(&mut stream).await.unwrap();
        match event {
            Event::Welcome { connection_id } => (stream, connection_id),
            other => panic!("Expected Welcome, got {:?}", other),
        }
    }

    async fn send<W: AsyncWrite + Unpin>(stream: &mut W, event: Event) {
        write_frame(stream, &event).await.unwrap();
    }

    /// Read frames until one that isn't a Ping shows up.
    async fn next_event<R: AsyncRead + Unpin>(stream: &mut R) -> Event {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), read_frame(stream))
                .await
                .expect("timed out waiting for event")
                .unwrap();
            if !matches!(event, Event::Ping) {
                return event;
            }
        }
    }

    async fn announce(stream: &mut TcpStream, user_id: &str, name: &str) {
        send(
            stream,
            Event::Announce {
                user_id: user_id.into(),
                display_name: name.into(),
            },
        )
        .await;
    }

    #[tokio::test]
    async fn test_server_starts_and_accepts() {
        let server = Server::start(&test_config(), memory_store()).await.unwrap();
        let (_stream, conn_id) = connect(server.addr()).await;
        assert!(!conn_id.is_nil());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connection_count().await, 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let server = Server::start(&test_config(), memory_store()).await.unwrap();
        let (mut stream, conn_id) = connect(server.addr()).await;

        for _ in 0..3 {
            send(
                &mut stream,
                Event::JoinRoom {
                    room: "community-7".into(),
                },
            )
            .await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let members = server.room_members("community-7").await;
        assert_eq!(members, vec![conn_id]);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_purges_membership() {
        let server = Server::start(&test_config(), memory_store()).await.unwrap();
        let (mut stream, _) = connect(server.addr()).await;

        send(&mut stream, Event::JoinRoom { room: "a-b".into() }).await;
        send(&mut stream, Event::JoinRoom { room: "community-1".into() }).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.room_members("a-b").await.len(), 1);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(server.room_members("a-b").await.is_empty());
        assert!(server.room_members("community-1").await.is_empty());
        assert_eq!(server.connection_count().await, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_fanout_preserves_commit_order() {
        let server = Server::start(&test_config(), memory_store()).await.unwrap();
        let addr = server.addr();

        let (mut sender, _) = connect(addr).await;
        let (mut rx_a, _) = connect(addr).await;
        let (mut rx_b, _) = connect(addr).await;

        announce(&mut sender, "u1", "Alice").await;
        for stream in [&mut sender, &mut rx_a, &mut rx_b] {
            send(stream, Event::JoinRoom { room: "u1-u2".into() }).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        for i in 0..5 {
            send(
                &mut sender,
                Event::SendMessage {
                    room: "u1-u2".into(),
                    client_id: Uuid::new_v4(),
                    content: format!("msg {}", i),
                    anonymous: false,
                },
            )
            .await;
        }

        for stream in [&mut rx_a, &mut rx_b] {
            let mut sequences = Vec::new();
            for _ in 0..5 {
                match next_event(stream).await {
                    Event::Deliver(m) => sequences.push(m.sequence),
                    other => panic!("Expected Deliver, got {:?}", other),
                }
            }
            assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn test_sender_receives_own_echo_with_client_id() {
        let server = Server::start(&test_config(), memory_store()).await.unwrap();
        let (mut stream, _) = connect(server.addr()).await;

        announce(&mut stream, "u1", "Alice").await;
        send(&mut stream, Event::JoinRoom { room: "community-1".into() }).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client_id = Uuid::new_v4();
        send(
            &mut stream,
            Event::SendMessage {
                room: "community-1".into(),
                client_id,
                content: "hello".into(),
                anonymous: false,
            },
        )
        .await;

        match next_event(&mut stream).await {
            Event::Deliver(m) => {
                assert_eq!(m.client_id, client_id);
                assert_ne!(m.id, client_id);
                assert_eq!(m.sequence, 1);
            }
            other => panic!("Expected Deliver, got {:?}", other),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn test_send_before_announce_rejected() {
        let server = Server::start(&test_config(), memory_store()).await.unwrap();
        let (mut stream, _) = connect(server.addr()).await;

        let client_id = Uuid::new_v4();
        send(
            &mut stream,
            Event::SendMessage {
                room: "community-1".into(),
                client_id,
                content: "hello".into(),
                anonymous: false,
            },
        )
        .await;

        match next_event(&mut stream).await {
            Event::SendRejected { client_id: id, .. } => assert_eq!(id, client_id),
            other => panic!("Expected SendRejected, got {:?}", other),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn test_empty_content_rejected_before_persist() {
        let store = memory_store();
        let server = Server::start(&test_config(), store.clone()).await.unwrap();
        let (mut stream, _) = connect(server.addr()).await;

        announce(&mut stream, "u1", "Alice").await;
        let client_id = Uuid::new_v4();
        send(
            &mut stream,
            Event::SendMessage {
                room: "community-1".into(),
                client_id,
                content: "   ".into(),
                anonymous: false,
            },
        )
        .await;

        match next_event(&mut stream).await {
            Event::SendRejected { client_id: id, .. } => assert_eq!(id, client_id),
            other => panic!("Expected SendRejected, got {:?}", other),
        }
        assert_eq!(store.count(&RoomKey::from_raw("community-1")).unwrap(), 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_anonymous_send_masks_name() {
        let server = Server::start(&test_config(), memory_store()).await.unwrap();
        let addr = server.addr();

        let (mut sender, _) = connect(addr).await;
        let (mut receiver, _) = connect(addr).await;

        announce(&mut sender, "u1", "Alice").await;
        send(&mut sender, Event::JoinRoom { room: "community-3".into() }).await;
        send(&mut receiver, Event::JoinRoom { room: "community-3".into() }).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        send(
            &mut sender,
            Event::SendMessage {
                room: "community-3".into(),
                client_id: Uuid::new_v4(),
                content: "secret".into(),
                anonymous: true,
            },
        )
        .await;

        match next_event(&mut receiver).await {
            Event::Deliver(m) => {
                assert_eq!(m.sender_name, nexus_core::ANONYMOUS_NAME);
                assert_eq!(m.sender_id, "u1");
                assert!(m.anonymous);
            }
            other => panic!("Expected Deliver, got {:?}", other),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn test_history_returns_commit_order() {
        let server = Server::start(&test_config(), memory_store()).await.unwrap();
        let (mut stream, _) = connect(server.addr()).await;

        announce(&mut stream, "u1", "Alice").await;
        send(&mut stream, Event::JoinRoom { room: "community-5".into() }).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        for i in 0..3 {
            send(
                &mut stream,
                Event::SendMessage {
                    room: "community-5".into(),
                    client_id: Uuid::new_v4(),
                    content: format!("m{}", i),
                    anonymous: false,
                },
            )
            .await;
        }
        for _ in 0..3 {
            assert!(matches!(next_event(&mut stream).await, Event::Deliver(_)));
        }

        send(
            &mut stream,
            Event::FetchHistory {
                room: "community-5".into(),
                limit: 50,
            },
        )
        .await;

        match next_event(&mut stream).await {
            Event::History { room, messages } => {
                assert_eq!(room, "community-5");
                let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
                assert_eq!(contents, vec!["m0", "m1", "m2"]);
            }
            other => panic!("Expected History, got {:?}", other),
        }
        server.shutdown();
    }

    /// Store whose appends always fail: the rejection path must reach the
    /// sender and nothing must be delivered.
    struct FailingStore;

    impl MessageRepository for FailingStore {
        fn append(&self, _: &Message) -> CoreResult<()> {
            Err(nexus_core::Error::Validation("store offline".into()))
        }
        fn history(&self, _: &RoomKey, _: u32) -> CoreResult<Vec<Message>> {
            Ok(Vec::new())
        }
        fn last_sequence(&self, _: &RoomKey) -> CoreResult<u64> {
            Ok(0)
        }
        fn delete_room(&self, _: &RoomKey) -> CoreResult<u64> {
            Ok(0)
        }
        fn count(&self, _: &RoomKey) -> CoreResult<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_failed_persist_rejects_sender_and_delivers_nothing() {
        let server = Server::start(&test_config(), Arc::new(FailingStore))
            .await
            .unwrap();
        let addr = server.addr();

        let (mut sender, _) = connect(addr).await;
        let (mut receiver, _) = connect(addr).await;

        announce(&mut sender, "u1", "Alice").await;
        send(&mut sender, Event::JoinRoom { room: "u1-u2".into() }).await;
        send(&mut receiver, Event::JoinRoom { room: "u1-u2".into() }).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client_id = Uuid::new_v4();
        send(
            &mut sender,
            Event::SendMessage {
                room: "u1-u2".into(),
                client_id,
                content: "doomed".into(),
                anonymous: false,
            },
        )
        .await;

        match next_event(&mut sender).await {
            Event::SendRejected { client_id: id, .. } => assert_eq!(id, client_id),
            other => panic!("Expected SendRejected, got {:?}", other),
        }

        // The receiver must see no delivery at all
        let quiet = tokio::time::timeout(Duration::from_millis(300), async {
            loop {
                match read_frame(&mut receiver).await.unwrap() {
                    Event::Ping => continue,
                    other => return other,
                }
            }
        })
        .await;
        assert!(quiet.is_err(), "receiver got an event: {:?}", quiet);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_degraded_notice_after_repeated_failures() {
        let mut config = test_config();
        config.degraded_threshold = 2;
        let server = Server::start(&config, Arc::new(FailingStore)).await.unwrap();
        let (mut stream, _) = connect(server.addr()).await;

        announce(&mut stream, "u1", "Alice").await;
        send(&mut stream, Event::JoinRoom { room: "community-9".into() }).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        for _ in 0..2 {
            send(
                &mut stream,
                Event::SendMessage {
                    room: "community-9".into(),
                    client_id: Uuid::new_v4(),
                    content: "x".into(),
                    anonymous: false,
                },
            )
            .await;
        }

        let mut saw_degraded = false;
        for _ in 0..3 {
            match next_event(&mut stream).await {
                Event::Degraded { .. } => {
                    saw_degraded = true;
                    break;
                }
                Event::SendRejected { .. } => continue,
                other => panic!("Unexpected event: {:?}", other),
            }
        }
        assert!(saw_degraded);
        server.shutdown();
    }
}
