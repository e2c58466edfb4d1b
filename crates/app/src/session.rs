//! Client session
//!
//! Owns the connection lifecycle on behalf of a user: connects, announces
//! identity, reconnects with jittered exponential backoff, and keeps the
//! message log and outbox reconciled with what the server delivers. The
//! [`Session`] handle is the application-facing API; the work happens in a
//! spawned task.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use nexus_core::{Config, Database, Draft, Message, ReconnectConfig, RoomKey};
use nexus_net::{Client, ClientEvent};

use crate::messages::MessageLog;
use crate::outbox::{DeliveryState, Outbox};

/// History rows requested when (re)joining a room
const HISTORY_LIMIT: u32 = 100;

/// Outbox expiry sweep period
const EXPIRE_TICK_MS: u64 = 1000;

/// Queue depths for the session's channels
const CHANNEL_CAPACITY: usize = 64;

/// The user this session acts as.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Offline,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// A room's message list changed; re-render it.
    RoomUpdated { room: String },
    /// A send settled as failed; its copy stays in the log, unconfirmed.
    SendFailed { client_id: Uuid, reason: String },
    /// The server reported persistent store trouble.
    Degraded { reason: String },
}

enum SessionCmd {
    Join { room: String },
    Leave { room: String },
    Send { draft: Draft },
    Shutdown,
}

struct Shared {
    state: RwLock<SessionState>,
    log: Mutex<MessageLog>,
    outbox: Mutex<Outbox>,
    identity: Identity,
}

/// Handle to a running session.
pub struct Session {
    shared: Arc<Shared>,
    cmd_tx: mpsc::Sender<SessionCmd>,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: mpsc::Receiver<SessionEvent>,
}

impl Session {
    /// Start a session against a server address. The session connects in
    /// the background and keeps reconnecting until shut down.
    #[instrument(skip(config, cache))]
    pub fn start(
        addr: SocketAddr,
        identity: Identity,
        config: Config,
        cache: Option<Arc<Database>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: RwLock::new(SessionState::Offline),
            log: Mutex::new(MessageLog::new(cache)),
            outbox: Mutex::new(Outbox::new()),
            identity,
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(session_task(
            addr,
            config,
            shared.clone(),
            cmd_rx,
            event_tx.clone(),
        ));

        Self {
            shared,
            cmd_tx,
            event_tx,
            event_rx,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.read().unwrap()
    }

    /// Next session event.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.recv().await
    }

    /// Current message list for a room, display order.
    pub fn messages(&self, room: &str) -> Vec<Message> {
        self.shared.log.lock().unwrap().messages(room).to_vec()
    }

    /// Delivery state of a tracked send. Settled entries are swept out
    /// eventually, after which this returns `None`.
    pub fn delivery_state(&self, client_id: Uuid) -> Option<DeliveryState> {
        self.shared.outbox.lock().unwrap().state(client_id)
    }

    pub async fn join_room(&self, room: &RoomKey) {
        let _ = self
            .cmd_tx
            .send(SessionCmd::Join {
                room: room.as_str().to_string(),
            })
            .await;
    }

    pub async fn leave_room(&self, room: &RoomKey) {
        let _ = self
            .cmd_tx
            .send(SessionCmd::Leave {
                room: room.as_str().to_string(),
            })
            .await;
    }

    /// Send a message: the optimistic copy lands in the log before this
    /// returns, and the returned client id tracks the send in the outbox.
    /// While disconnected the copy is settled as failed immediately — it
    /// stays visible in the log, unconfirmed, and is never queued.
    pub async fn send(
        &self,
        room: &RoomKey,
        content: &str,
        anonymous: bool,
    ) -> nexus_core::Result<Uuid> {
        let draft = Draft::new(room.clone(), content, anonymous)?;

        let optimistic = Message::optimistic(
            &draft,
            &self.shared.identity.user_id,
            &self.shared.identity.display_name,
        );
        let client_id = draft.client_id;

        self.shared
            .log
            .lock()
            .unwrap()
            .optimistic_insert(optimistic);
        self.shared.outbox.lock().unwrap().track(client_id);

        if self.state() != SessionState::Connected {
            self.shared.outbox.lock().unwrap().fail(client_id);
            let _ = self
                .event_tx
                .send(SessionEvent::SendFailed {
                    client_id,
                    reason: "not connected".into(),
                })
                .await;
            return Ok(client_id);
        }

        self.cmd_tx
            .send(SessionCmd::Send { draft })
            .await
            .map_err(|_| nexus_core::Error::Validation("session stopped".into()))?;

        Ok(client_id)
    }

    /// Stop the session and close the connection.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCmd::Shutdown).await;
    }
}

/// Delay before reconnect attempt `attempt` (zero-based): exponential in
/// the multiplier, capped at the maximum, with symmetric random jitter.
pub fn backoff_delay(cfg: &ReconnectConfig, attempt: u32) -> Duration {
    let base = cfg.base_delay_ms as f64 * cfg.multiplier.powi(attempt.min(16) as i32);
    let capped = base.min(cfg.max_delay_ms as f64);
    let jitter = capped * cfg.jitter_factor * (rand::random::<f64>() * 2.0 - 1.0);
    Duration::from_millis((capped + jitter).max(0.0) as u64)
}

async fn session_task(
    addr: SocketAddr,
    config: Config,
    shared: Arc<Shared>,
    mut cmd_rx: mpsc::Receiver<SessionCmd>,
    event_tx: mpsc::Sender<SessionEvent>,
) {
    let liveness = Duration::from_millis(config.server.connection_timeout_ms);
    let send_timeout_ms = config.server.send_timeout_ms;

    let mut rooms: HashSet<String> = HashSet::new();
    let mut first_connect = true;
    let mut attempt: u32 = 0;

    loop {
        let connecting_state = if first_connect {
            SessionState::Connecting
        } else {
            SessionState::Reconnecting
        };
        set_state(&shared, &event_tx, connecting_state).await;

        let mut client = match connect_with_handshake(addr, liveness).await {
            Ok(client) => client,
            Err(e) => {
                let delay = backoff_delay(&config.reconnect, attempt);
                attempt = attempt.saturating_add(1);
                debug!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "Connect failed, backing off");
                if wait_or_shutdown(delay, &mut cmd_rx, &shared, &event_tx, &mut rooms).await {
                    set_state(&shared, &event_tx, SessionState::Offline).await;
                    return;
                }
                continue;
            }
        };
        attempt = 0;
        first_connect = false;

        if let Err(e) = resume(&client, &shared, &rooms).await {
            warn!(error = %e, "Resume failed, reconnecting");
            client.disconnect().await;
            continue;
        }

        set_state(&shared, &event_tx, SessionState::Connected).await;
        info!("Session connected");

        let reconnect_now = run_connected(
            &mut client,
            &shared,
            &mut cmd_rx,
            &event_tx,
            &mut rooms,
            send_timeout_ms,
        )
        .await;

        client.disconnect().await;
        if !reconnect_now {
            set_state(&shared, &event_tx, SessionState::Offline).await;
            return;
        }
    }
}

async fn set_state(
    shared: &Arc<Shared>,
    event_tx: &mpsc::Sender<SessionEvent>,
    state: SessionState,
) {
    {
        let mut current = shared.state.write().unwrap();
        if *current == state {
            return;
        }
        *current = state;
    }
    let _ = event_tx.send(SessionEvent::StateChanged(state)).await;
}

/// Connect and wait for the handshake to complete.
async fn connect_with_handshake(addr: SocketAddr, liveness: Duration) -> nexus_net::Result<Client> {
    let mut client = Client::connect(addr, liveness).await?;
    match client.next_event().await {
        Some(ClientEvent::Connected { .. }) => Ok(client),
        _ => Err(nexus_net::Error::Handshake(
            "connection ended before welcome".into(),
        )),
    }
}

/// Re-establish identity and room state on a fresh connection.
async fn resume(
    client: &Client,
    shared: &Arc<Shared>,
    rooms: &HashSet<String>,
) -> nexus_net::Result<()> {
    client
        .announce(&shared.identity.user_id, &shared.identity.display_name)
        .await?;
    for room in rooms {
        client.join_room(room).await?;
        client.fetch_history(room, HISTORY_LIMIT).await?;
    }
    Ok(())
}

/// The connected event loop. Returns true to reconnect, false to stop.
async fn run_connected(
    client: &mut Client,
    shared: &Arc<Shared>,
    cmd_rx: &mut mpsc::Receiver<SessionCmd>,
    event_tx: &mpsc::Sender<SessionEvent>,
    rooms: &mut HashSet<String>,
    send_timeout_ms: u64,
) -> bool {
    let mut expire_tick = tokio::time::interval(Duration::from_millis(EXPIRE_TICK_MS));
    expire_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = client.next_event() => {
                match event {
                    Some(ClientEvent::Delivered(wire)) => {
                        let message = Message::from(wire);
                        let room = message.room.as_str().to_string();
                        let client_id = message.client_id;
                        let settled = shared.log.lock().unwrap().apply_delivery(message);
                        if settled {
                            shared.outbox.lock().unwrap().confirm(client_id);
                        }
                        let _ = event_tx.send(SessionEvent::RoomUpdated { room }).await;
                    }
                    Some(ClientEvent::Rejected { client_id, reason }) => {
                        warn!(%client_id, reason, "Send rejected");
                        shared.outbox.lock().unwrap().fail(client_id);
                        let _ = event_tx
                            .send(SessionEvent::SendFailed { client_id, reason })
                            .await;
                    }
                    Some(ClientEvent::History { room, messages }) => {
                        let history: Vec<Message> =
                            messages.into_iter().map(Message::from).collect();
                        shared.log.lock().unwrap().merge_history(&room, history);
                        let _ = event_tx.send(SessionEvent::RoomUpdated { room }).await;
                    }
                    Some(ClientEvent::Degraded { reason }) => {
                        let _ = event_tx.send(SessionEvent::Degraded { reason }).await;
                    }
                    Some(ClientEvent::Connected { .. }) => {}
                    Some(ClientEvent::Disconnected) | None => {
                        warn!("Connection lost");
                        return true;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SessionCmd::Join { room }) => {
                        rooms.insert(room.clone());
                        shared.log.lock().unwrap().load(&room);
                        if client.join_room(&room).await.is_err()
                            || client.fetch_history(&room, HISTORY_LIMIT).await.is_err()
                        {
                            return true;
                        }
                        let _ = event_tx.send(SessionEvent::RoomUpdated { room }).await;
                    }
                    Some(SessionCmd::Leave { room }) => {
                        rooms.remove(&room);
                        if client.leave_room(&room).await.is_err() {
                            return true;
                        }
                    }
                    Some(SessionCmd::Send { draft }) => {
                        let sent = client
                            .send_message(
                                draft.room.as_str(),
                                draft.client_id,
                                &draft.content,
                                draft.anonymous,
                            )
                            .await;
                        if sent.is_err() {
                            return true;
                        }
                    }
                    Some(SessionCmd::Shutdown) | None => {
                        debug!("Session shutting down");
                        return false;
                    }
                }
            }
            _ = expire_tick.tick() => {
                let expired = shared.outbox.lock().unwrap().expire(send_timeout_ms);
                for client_id in expired {
                    let _ = event_tx
                        .send(SessionEvent::SendFailed {
                            client_id,
                            reason: "no confirmation from server".into(),
                        })
                        .await;
                }
            }
        }
    }
}

/// Sleep the backoff delay while still honoring commands. Returns true if
/// a shutdown arrived.
async fn wait_or_shutdown(
    delay: Duration,
    cmd_rx: &mut mpsc::Receiver<SessionCmd>,
    shared: &Arc<Shared>,
    event_tx: &mpsc::Sender<SessionEvent>,
    rooms: &mut HashSet<String>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SessionCmd::Join { room }) => {
                        // Joined for real on the next successful connect
                        shared.log.lock().unwrap().load(&room);
                        rooms.insert(room);
                    }
                    Some(SessionCmd::Leave { room }) => {
                        rooms.remove(&room);
                    }
                    Some(SessionCmd::Send { draft }) => {
                        // Can't deliver while offline; settle it as failed
                        shared.outbox.lock().unwrap().fail(draft.client_id);
                        let _ = event_tx
                            .send(SessionEvent::SendFailed {
                                client_id: draft.client_id,
                                reason: "not connected".into(),
                            })
                            .await;
                    }
                    Some(SessionCmd::Shutdown) | None => return true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_core::{Database, ServerConfig};
    use nexus_net::Server;

    fn test_config(bind_port: u16) -> Config {
        Config {
            server: ServerConfig {
                bind_port,
                heartbeat_interval_ms: 60_000,
                connection_timeout_ms: 120_000,
                send_timeout_ms: 5000,
                degraded_threshold: 3,
            },
            reconnect: ReconnectConfig {
                base_delay_ms: 10,
                multiplier: 2.0,
                max_delay_ms: 50,
                jitter_factor: 0.0,
            },
        }
    }

    fn identity(user_id: &str, name: &str) -> Identity {
        Identity {
            user_id: user_id.into(),
            display_name: name.into(),
        }
    }

    async fn start_server() -> Server {
        let store = Arc::new(Database::open_in_memory().unwrap());
        Server::start(&test_config(0).server, store).await.unwrap()
    }

    async fn wait_for_state(session: &mut Session, target: SessionState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if session.state() == target {
                    return;
                }
                match session.next_event().await {
                    Some(SessionEvent::StateChanged(s)) if s == target => return,
                    Some(_) => continue,
                    None => panic!("session task ended"),
                }
            }
        })
        .await
        .expect("timed out waiting for session state");
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let cfg = ReconnectConfig {
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_factor: 0.0,
        };
        assert_eq!(backoff_delay(&cfg, 0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&cfg, 3), Duration::from_millis(8000));
        // Capped from attempt 5 on
        assert_eq!(backoff_delay(&cfg, 5), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(&cfg, 100), Duration::from_millis(30_000));
    }

    #[test]
    fn test_backoff_jitter_stays_in_band() {
        let cfg = ReconnectConfig {
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_factor: 0.5,
        };
        for _ in 0..100 {
            let delay = backoff_delay(&cfg, 0).as_millis() as u64;
            assert!((500..=1500).contains(&delay), "delay {} out of band", delay);
        }
    }

    #[tokio::test]
    async fn test_session_connects() {
        let server = start_server().await;
        let mut session = Session::start(
            server.addr(),
            identity("u1", "Alice"),
            test_config(0),
            None,
        );

        wait_for_state(&mut session, SessionState::Connected).await;
        session.shutdown().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_send_settles_optimistic_copy() {
        let server = start_server().await;
        let mut session = Session::start(
            server.addr(),
            identity("u1", "Alice"),
            test_config(0),
            None,
        );
        wait_for_state(&mut session, SessionState::Connected).await;

        let room = RoomKey::community("1");
        session.join_room(&room).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client_id = session.send(&room, "hello", false).await.unwrap();

        // Optimistic copy is visible immediately
        let messages = session.messages(room.as_str());
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_optimistic());
        assert_eq!(messages[0].client_id, client_id);
        assert_eq!(session.delivery_state(client_id), Some(DeliveryState::Pending));

        // After the echo it is durable, same position, no duplicate
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match session.next_event().await {
                    Some(SessionEvent::RoomUpdated { .. }) => {
                        let messages = session.messages(room.as_str());
                        if messages.len() == 1 && !messages[0].is_optimistic() {
                            assert_eq!(messages[0].client_id, client_id);
                            assert_eq!(messages[0].sequence, 1);
                            return;
                        }
                    }
                    Some(_) => continue,
                    None => panic!("session task ended"),
                }
            }
        })
        .await
        .expect("echo never settled");
        assert_eq!(
            session.delivery_state(client_id),
            Some(DeliveryState::Confirmed)
        );

        session.shutdown().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_offline_send_fails_visibly() {
        // Nothing is listening here
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut session = Session::start(addr, identity("u1", "Alice"), test_config(0), None);

        let room = RoomKey::community("1");
        let client_id = session.send(&room, "hello", false).await.unwrap();

        // The copy stays in the log, settled as failed, never queued
        let messages = session.messages(room.as_str());
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_optimistic());
        assert_eq!(session.delivery_state(client_id), Some(DeliveryState::Failed));

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match session.next_event().await {
                    Some(SessionEvent::SendFailed { client_id: id, .. }) => {
                        assert_eq!(id, client_id);
                        return;
                    }
                    Some(_) => continue,
                    None => panic!("session task ended"),
                }
            }
        })
        .await
        .expect("no SendFailed event for offline send");
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_room_joined_while_backing_off_is_joined_on_connect() {
        // Reserve a port, then leave it dark so the session backs off
        let reserved = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let mut session = Session::start(
            addr,
            identity("u1", "Alice"),
            test_config(0),
            None,
        );
        let room = RoomKey::community("late");
        session.join_room(&room).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Now the server comes up on that port
        let store = Arc::new(Database::open_in_memory().unwrap());
        let server = Server::start(&test_config(addr.port()).server, store)
            .await
            .unwrap();

        wait_for_state(&mut session, SessionState::Connected).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !server.room_members(room.as_str()).await.is_empty() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("room joined during backoff was never joined after connect");

        session.shutdown().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_two_sessions_exchange_messages() {
        let server = start_server().await;
        let room = RoomKey::direct("u1", "u2");

        let mut alice = Session::start(
            server.addr(),
            identity("u1", "Alice"),
            test_config(0),
            None,
        );
        let mut bob = Session::start(
            server.addr(),
            identity("u2", "Bob"),
            test_config(0),
            None,
        );
        wait_for_state(&mut alice, SessionState::Connected).await;
        wait_for_state(&mut bob, SessionState::Connected).await;

        alice.join_room(&room).await;
        bob.join_room(&room).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        alice.send(&room, "hi bob", false).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match bob.next_event().await {
                    Some(SessionEvent::RoomUpdated { .. }) => {
                        let messages = bob.messages(room.as_str());
                        if messages.iter().any(|m| m.content == "hi bob") {
                            return;
                        }
                    }
                    Some(_) => continue,
                    None => panic!("session task ended"),
                }
            }
        })
        .await
        .expect("bob never saw the message");

        alice.shutdown().await;
        bob.shutdown().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_cache_survives_restart() {
        let server = start_server().await;
        let cache = Arc::new(Database::open_in_memory().unwrap());
        let room = RoomKey::community("9");

        {
            let mut session = Session::start(
                server.addr(),
                identity("u1", "Alice"),
                test_config(0),
                Some(cache.clone()),
            );
            wait_for_state(&mut session, SessionState::Connected).await;
            session.join_room(&room).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            session.send(&room, "remembered", false).await.unwrap();

            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    match session.next_event().await {
                        Some(SessionEvent::RoomUpdated { .. }) => {
                            let messages = session.messages(room.as_str());
                            if messages.iter().any(|m| !m.is_optimistic()) {
                                return;
                            }
                        }
                        Some(_) => continue,
                        None => panic!("session task ended"),
                    }
                }
            })
            .await
            .expect("send never confirmed");
            session.shutdown().await;
        }

        // A fresh session over the same cache paints the room immediately
        let mut fresh = Session::start(
            server.addr(),
            identity("u1", "Alice"),
            test_config(0),
            Some(cache),
        );
        wait_for_state(&mut fresh, SessionState::Connected).await;
        fresh.join_room(&room).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let messages = fresh.messages(room.as_str());
        assert!(messages.iter().any(|m| m.content == "remembered"));
        fresh.shutdown().await;
        server.shutdown();
    }
}
