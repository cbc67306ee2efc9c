//! Connection supervisor: accept loop, per-connection receive loops, the
//! liveness sweep, and the disconnect cascade.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lobby_config::{Config, ConfigError};
use lobby_net::{
    ConnectionConfig, ConnectionHandle, ConnectionId, FrameConfig, FrameReader, IdGenerator,
    SocketConfig, configure_stream, create_listener, encode_frame, flag_raised,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dispatch::{LobbyState, dispatch_line};
use crate::error::LobbyError;
use crate::protocol::{Event, UserId};
use crate::registry::Session;
use crate::rooms::ExitOutcome;

/// Runtime settings for [`LobbyServer`].
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Address to bind to. Default: `0.0.0.0:5000`.
    pub listen_addr: SocketAddr,
    /// Maximum concurrent connections. Default: 512.
    pub max_connections: usize,
    /// Inbound framing limits.
    pub frame: FrameConfig,
    /// Outbound queue and write timeout.
    pub connection: ConnectionConfig,
    /// Socket options for the listener and accepted streams.
    pub socket: SocketConfig,
    /// Period of the liveness sweep. Default: 5s.
    pub liveness_interval: Duration,
    /// Reap sessions silent for longer than this. Default: never.
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            max_connections: 512,
            frame: FrameConfig::default(),
            connection: ConnectionConfig::default(),
            socket: SocketConfig::default(),
            liveness_interval: Duration::from_secs(5),
            idle_timeout: None,
        }
    }
}

impl ServerSettings {
    /// Derive settings from the loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let server = &config.server;
        Ok(Self {
            listen_addr: server.listen_addr()?,
            max_connections: server.max_connections,
            frame: FrameConfig {
                max_frame_size: server.max_frame_bytes,
            },
            connection: ConnectionConfig {
                queue_capacity: server.outbound_queue,
                write_timeout: server.write_timeout(),
            },
            socket: SocketConfig {
                keepalive: server.tcp_keepalive(),
                backlog: u32::try_from(server.max_connections).unwrap_or(u32::MAX),
            },
            liveness_interval: server.liveness_interval(),
            idle_timeout: server.idle_timeout(),
        })
    }
}

/// TCP lobby server.
pub struct LobbyServer {
    settings: ServerSettings,
    state: Arc<LobbyState>,
    id_gen: Arc<IdGenerator>,
    active: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
}

impl LobbyServer {
    /// Create a server around existing lobby state.
    pub fn new(settings: ServerSettings, state: Arc<LobbyState>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            settings,
            state,
            id_gen: Arc::new(IdGenerator::new()),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Shared lobby state.
    pub fn state(&self) -> &Arc<LobbyState> {
        &self.state
    }

    /// Number of open client connections.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        create_listener(self.settings.listen_addr, &self.settings.socket).await
    }

    /// Bind and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = self.bind().await?;
        self.run_with_listener(listener).await
    }

    /// Serve on a pre-bound listener (useful for tests).
    ///
    /// Also runs the liveness sweep for as long as the accept loop lives.
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!("Lobby listening on {}", listener.local_addr()?);
        let sweep = spawn_liveness_sweep(
            Arc::clone(&self.state),
            self.settings.liveness_interval,
            self.settings.idle_timeout,
            self.shutdown_tx.subscribe(),
        );
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => self.accept(stream, peer_addr),
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
                _ = flag_raised(&mut shutdown_rx) => {
                    tracing::info!("Lobby shutting down");
                    break;
                }
            }
        }

        sweep.abort();
        Ok(())
    }

    /// Signal the accept loop and every connection to stop.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn accept(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if self.active.load(Ordering::Relaxed) >= self.settings.max_connections {
            tracing::warn!("Connection limit reached, rejecting {peer_addr}");
            return;
        }
        if let Err(e) = configure_stream(&stream, &self.settings.socket) {
            tracing::warn!(%peer_addr, error = %e, "Failed to configure socket");
        }

        let id = self.id_gen.next_id();
        let (reader, writer) = stream.into_split();
        let connection =
            ConnectionHandle::spawn(id, Some(peer_addr), writer, &self.settings.connection);
        tracing::info!(connection = %id, %peer_addr, "Accepted connection");

        self.active.fetch_add(1, Ordering::Relaxed);
        let active = Arc::clone(&self.active);
        let state = Arc::clone(&self.state);
        let frame_config = self.settings.frame.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            handle_connection(&state, connection, reader, frame_config, shutdown_rx).await;
            active.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(connection = %id, "Connection closed");
        });
    }
}

/// Per-connection receive loop: frames are decoded and dispatched in order.
async fn handle_connection<R>(
    state: &Arc<LobbyState>,
    connection: ConnectionHandle,
    reader: R,
    frame_config: FrameConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut frames = FrameReader::new(reader, frame_config);
    let mut closed = connection.closed();
    // Users this connection has entered the lobby as.
    let mut bound = HashSet::new();

    loop {
        tokio::select! {
            frame = frames.next_frame() => match frame {
                Ok(Some(line)) => {
                    connection.touch();
                    if let Some(reply) = dispatch_line(state, &connection, &line).await {
                        if let Event::EnterLobbyResult { user_id, .. } = &reply {
                            bound.insert(*user_id);
                        }
                        reply_to(&connection, &reply);
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    reply_to(&connection, &Event::error(&LobbyError::Parse(e.to_string())));
                }
                Err(e) => {
                    tracing::debug!(connection = %connection.id(), error = %e, "Read failed");
                    break;
                }
            },
            _ = flag_raised(&mut closed) => break,
            _ = flag_raised(&mut shutdown_rx) => break,
        }
    }

    connection.close();
    release_connection(state, connection.id(), bound).await;
}

/// Clean up after a finished connection.
///
/// Users still bound to it get the full cascade. Users whose session was
/// already reaped may have claimed a seat through a command that was in
/// flight at the time; that seat is released here. Users who have since
/// logged in elsewhere are left alone.
async fn release_connection(
    state: &LobbyState,
    connection: ConnectionId,
    bound: HashSet<UserId>,
) {
    let mut departed = bound;
    departed.extend(state.sessions.users_for_connection(connection));

    for user_id in departed {
        if disconnect_cascade(state, user_id, Some(connection)).await.is_some() {
            continue;
        }
        if state.sessions.lookup(user_id).is_none() && vacate_seat(state, user_id).await {
            tracing::info!(%user_id, %connection, "Released seat held after session ended");
            state.broadcaster.room_list().await;
        }
    }
}

fn reply_to(connection: &ConnectionHandle, event: &Event) {
    let frame = match encode_frame(event) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(command = event.command(), error = %e, "Failed to encode reply");
            return;
        }
    };
    if let Err(e) = connection.send_frame(frame) {
        tracing::debug!(connection = %connection.id(), error = %e, "Reply dropped");
    }
}

/// Tear down everything a departing user holds.
///
/// Removes the session (only if still bound to `expected` when given, so a
/// stale connection cannot evict a fresh login), vacates the user's seat
/// (deleting the room and broadcasting `room-closed` if they hosted it, or
/// pushing `room-update` otherwise), then refreshes the lobby room list.
pub async fn disconnect_cascade(
    state: &LobbyState,
    user_id: UserId,
    expected: Option<ConnectionId>,
) -> Option<Arc<Session>> {
    let removed = match expected {
        Some(connection) => Some(state.sessions.remove_if_connection(user_id, connection)?),
        None => state.sessions.remove(user_id),
    };

    vacate_seat(state, user_id).await;
    state.broadcaster.room_list().await;

    match &removed {
        Some(session) => tracing::info!(
            %user_id,
            online_secs = session.online_for().as_secs(),
            "Session ended"
        ),
        None => tracing::info!(%user_id, "Session ended"),
    }
    removed
}

/// Release whatever seat `user_id` holds and tell the room. Returns whether
/// a seat was released.
async fn vacate_seat(state: &LobbyState, user_id: UserId) -> bool {
    let Some((room_id, outcome)) = state.rooms.release_user(user_id).await else {
        return false;
    };
    match outcome {
        ExitOutcome::Closed { .. } => {
            state.broadcaster.room_closed(room_id).await;
        }
        ExitOutcome::Left { .. } => {
            state.broadcaster.room_update(room_id).await;
        }
    }
    true
}

/// Spawn the periodic liveness sweep.
pub fn spawn_liveness_sweep(
    state: Arc<LobbyState>,
    interval: Duration,
    idle_timeout: Option<Duration>,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    run_every(interval, shutdown_rx, move || {
        let state = Arc::clone(&state);
        async move { sweep_once(&state, idle_timeout).await }
    })
}

/// Run `pass` on every tick of `interval` until shutdown.
///
/// Each pass runs on its own task, so a pass that panics is logged and the
/// next tick still runs.
fn run_every<F, Fut>(
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut pass: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = usize> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match tokio::spawn(pass()).await {
                        Ok(0) => {}
                        Ok(reaped) => tracing::info!(reaped, "Liveness sweep reaped sessions"),
                        Err(e) => tracing::error!(error = %e, "Liveness sweep failed"),
                    }
                }
                _ = flag_raised(&mut shutdown_rx) => break,
            }
        }
    })
}

/// One liveness pass. Returns the number of sessions reaped.
pub async fn sweep_once(state: &LobbyState, idle_timeout: Option<Duration>) -> usize {
    let mut reaped = 0;
    for session in state.sessions.all() {
        let dead = !session.is_alive();
        let idle = idle_timeout.is_some_and(|limit| session.connection.idle_for() > limit);
        if !dead && !idle {
            continue;
        }

        tracing::warn!(
            user_id = %session.user_id,
            connection = %session.connection.id(),
            dead,
            idle,
            online_secs = session.online_for().as_secs(),
            "Reaping session"
        );
        session.connection.close();
        if disconnect_cascade(state, session.user_id, Some(session.connection.id()))
            .await
            .is_some()
        {
            reaped += 1;
        }
    }
    reaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use lobby_net::EncodedFrame;
    use serde_json::{Value, json};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    fn online(state: &LobbyState, id: i64, name: &str) -> (ConnectionHandle, mpsc::Receiver<EncodedFrame>) {
        let (conn, rx) = ConnectionHandle::channel(ConnectionId(id as u64), None, 32);
        state.sessions.upsert(UserId(id), name, conn.clone());
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<EncodedFrame>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_slice(&frame).unwrap());
        }
        out
    }

    async fn next_command(rx: &mut mpsc::Receiver<EncodedFrame>, command: &str) -> Value {
        let wait = async {
            loop {
                let frame = rx.recv().await.expect("connection queue closed");
                let event: Value = serde_json::from_slice(&frame).unwrap();
                if event["Command"] == command {
                    return event;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap()
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_server_futures_can_be_spawned() {
        let server = LobbyServer::new(ServerSettings::default(), Arc::new(LobbyState::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert_send(&server.run_with_listener(listener));

        let state = Arc::new(LobbyState::default());
        let (conn, _rx) = ConnectionHandle::channel(ConnectionId(1), None, 8);
        let (_client, server_side) = tokio::io::duplex(64);
        let (_tx, shutdown_rx) = watch::channel(false);
        assert_send(&handle_connection(
            &state,
            conn,
            server_side,
            FrameConfig::default(),
            shutdown_rx,
        ));
    }

    #[tokio::test]
    async fn test_seat_claimed_after_reap_is_released_with_connection() {
        let state = Arc::new(LobbyState::default());
        let (_watch_conn, mut watch_rx) = online(&state, 2, "u2");
        let (conn, mut replies) = ConnectionHandle::channel(ConnectionId(1), None, 32);
        let (mut client, server_side) = tokio::io::duplex(4096);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                handle_connection(&state, conn, server_side, FrameConfig::default(), shutdown_rx)
                    .await;
            }
        });

        client
            .write_all(b"{\"Command\":\"enter-lobby\",\"UserId\":1,\"Username\":\"u1\"}\n")
            .await
            .unwrap();
        next_command(&mut replies, "enter-lobby-result").await;

        // The session is reaped while the connection keeps reading.
        disconnect_cascade(&state, UserId(1), None).await;
        client
            .write_all(b"{\"Command\":\"create-room\",\"HostId\":1,\"RoomName\":\"Late\"}\n")
            .await
            .unwrap();
        next_command(&mut replies, "create-room-result").await;
        assert_eq!(state.rooms.len(), 1);

        drop(client);
        task.await.unwrap();

        assert!(state.rooms.is_empty());
        assert_eq!(state.rooms.seat_of(UserId(1)), None);
        let events = drain(&mut watch_rx);
        assert!(events.iter().any(|e| e["Command"] == "room-closed"));
        let last = events.last().unwrap();
        assert_eq!(last["Command"], "room-list-update");
        assert_eq!(last["Rooms"], json!([]));
    }

    #[tokio::test]
    async fn test_released_connection_spares_user_logged_in_elsewhere() {
        let state = Arc::new(LobbyState::default());
        let (_new_conn, _new_rx) = online(&state, 1, "u1");
        let room = state
            .rooms
            .create_room("Alpha", UserId(1), "u1", "Normal")
            .await
            .unwrap();

        // An older connection that had also entered as u1 goes away.
        release_connection(&state, ConnectionId(99), HashSet::from([UserId(1)])).await;

        assert!(state.sessions.lookup(UserId(1)).is_some());
        assert_eq!(state.rooms.seat_of(UserId(1)), Some(room));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_loop_reaps_on_tick() {
        let state = Arc::new(LobbyState::default());
        let (_host_conn, host_rx) = online(&state, 1, "u1");
        let (_watch_conn, mut watch_rx) = online(&state, 2, "u2");
        state
            .rooms
            .create_room("Alpha", UserId(1), "u1", "Normal")
            .await
            .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweep = spawn_liveness_sweep(
            Arc::clone(&state),
            Duration::from_secs(5),
            None,
            shutdown_rx,
        );

        drop(host_rx);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(state.sessions.lookup(UserId(1)).is_some());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(state.sessions.lookup(UserId(1)).is_none());
        assert!(state.rooms.is_empty());
        assert!(drain(&mut watch_rx).iter().any(|e| e["Command"] == "room-closed"));

        shutdown_tx.send_replace(true);
        sweep.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_loop_survives_a_panicking_pass() {
        let passes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&passes);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweep = run_every(Duration::from_secs(5), shutdown_rx, move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first pass fails");
                }
                0
            }
        });

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 2);

        shutdown_tx.send_replace(true);
        sweep.await.unwrap();
    }

    #[tokio::test]
    async fn test_reaper_closes_dead_hosts_room() {
        let state = LobbyState::default();
        let (_host_conn, host_rx) = online(&state, 1, "u1");
        let (_watch_conn, mut watch_rx) = online(&state, 2, "u2");
        let room = state
            .rooms
            .create_room("Alpha", UserId(1), "u1", "Normal")
            .await
            .unwrap();

        // Host's socket goes away.
        drop(host_rx);
        assert_eq!(sweep_once(&state, None).await, 1);

        assert!(state.sessions.lookup(UserId(1)).is_none());
        assert!(state.rooms.list_rooms().await.is_empty());
        let events = drain(&mut watch_rx);
        assert_eq!(events[0], json!({"Command": "room-closed", "RoomId": room.0}));
        assert_eq!(events[1]["Command"], "room-list-update");
        assert_eq!(events[1]["Rooms"], json!([]));
    }

    #[tokio::test]
    async fn test_reaper_vacates_dead_guest_seat() {
        let state = LobbyState::default();
        let (_host_conn, mut host_rx) = online(&state, 1, "u1");
        let (_guest_conn, guest_rx) = online(&state, 2, "u2");
        let room = state
            .rooms
            .create_room("Alpha", UserId(1), "u1", "Normal")
            .await
            .unwrap();
        state.rooms.join_room(room, UserId(2), "u2").await.unwrap();

        drop(guest_rx);
        sweep_once(&state, None).await;

        assert_eq!(state.rooms.seat_of(UserId(2)), None);
        let events = drain(&mut host_rx);
        assert_eq!(events[0]["Command"], "room-update");
        assert_eq!(events[0]["Players"][1]["Username"], "Open");
    }

    #[tokio::test]
    async fn test_reaper_leaves_live_sessions_alone() {
        let state = LobbyState::default();
        let (_conn, _rx) = online(&state, 1, "u1");
        assert_eq!(sweep_once(&state, None).await, 0);
        assert!(state.sessions.lookup(UserId(1)).is_some());
    }

    #[tokio::test]
    async fn test_idle_timeout_reaps_silent_session() {
        let state = LobbyState::default();
        let (_conn, _rx) = online(&state, 1, "u1");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sweep_once(&state, Some(Duration::from_millis(10))).await, 1);
        assert!(state.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_stale_connection_does_not_evict_new_login() {
        let state = LobbyState::default();
        let (old, _old_rx) = ConnectionHandle::channel(ConnectionId(10), None, 8);
        let (new, _new_rx) = ConnectionHandle::channel(ConnectionId(11), None, 8);
        state.sessions.upsert(UserId(1), "u1", old.clone());
        state.sessions.upsert(UserId(1), "u1", new);

        assert!(disconnect_cascade(&state, UserId(1), Some(old.id())).await.is_none());
        assert!(state.sessions.lookup(UserId(1)).is_some());
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.server.port = 6000;
        config.server.idle_timeout_secs = 90;
        config.server.tcp_keepalive_secs = 0;

        let settings = ServerSettings::from_config(&config).unwrap();
        assert_eq!(settings.listen_addr.port(), 6000);
        assert_eq!(settings.idle_timeout, Some(Duration::from_secs(90)));
        assert!(settings.socket.keepalive.is_none());
        assert_eq!(settings.socket.backlog, 512);
        assert_eq!(settings.frame.max_frame_size, 64 * 1024);
    }
}
