//! End-to-end lobby flows over real TCP connections.

use std::sync::Arc;
use std::time::Duration;

use lobby_server::{LobbyServer, LobbyState, ServerSettings};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

const WAIT: Duration = Duration::from_secs(5);

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn send(&mut self, request: Value) {
        self.send_raw(&request.to_string()).await;
    }

    /// Read until an event with the given `Command` arrives, skipping others.
    async fn expect(&mut self, command: &str) -> Value {
        let read = async {
            loop {
                let line = self
                    .lines
                    .next_line()
                    .await
                    .unwrap()
                    .unwrap_or_else(|| panic!("connection closed waiting for {command}"));
                let event: Value = serde_json::from_str(&line).unwrap();
                if event["Command"] == command {
                    return event;
                }
            }
        };
        tokio::time::timeout(WAIT, read)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {command}"))
    }

    /// Assert the server hangs up without sending anything.
    async fn expect_closed(&mut self) {
        let read = tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out waiting for the server to close");
        assert!(
            matches!(read, Ok(None) | Err(_)),
            "connection stayed open: {read:?}"
        );
    }

    async fn enter(&mut self, user_id: i64, name: &str) -> Value {
        self.send(json!({"Command": "enter-lobby", "UserId": user_id, "Username": name}))
            .await;
        self.expect("enter-lobby-result").await
    }
}

async fn start_server() -> (Arc<LobbyServer>, std::net::SocketAddr) {
    start_server_with(ServerSettings::default()).await
}

async fn start_server_with(settings: ServerSettings) -> (Arc<LobbyServer>, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(LobbyServer::new(settings, Arc::new(LobbyState::default())));
    let runner = Arc::clone(&server);
    tokio::spawn(async move { runner.run_with_listener(listener).await });
    (server, addr)
}

fn slot_user(room: &Value, slot: u64) -> i64 {
    room["Players"]
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["PlayerSlot"] == slot)
        .unwrap()["UserId"]
        .as_i64()
        .unwrap()
}

#[tokio::test]
async fn test_create_join_and_move() {
    let (server, addr) = start_server().await;
    let mut host = Client::connect(addr).await;
    let mut guest = Client::connect(addr).await;

    host.enter(1, "host").await;
    let reply = guest.enter(2, "guest").await;
    assert_eq!(reply["OnlineUsers"], json!(["guest", "host"]));

    host.send(json!({"Command": "create-room", "HostId": 1, "RoomName": "Alpha"}))
        .await;
    let created = host.expect("create-room-result").await;
    let room_id = created["RoomId"].as_u64().unwrap();

    guest
        .send(json!({"Command": "join-room", "RoomId": room_id, "UserId": 2, "Username": "guest"}))
        .await;
    let joined = guest.expect("join-room-result").await;
    assert_eq!(joined["Slot"], 2);

    let update = host.expect("room-update").await;
    assert_eq!(slot_user(&update, 1), 1);

    guest
        .send(json!({"Command": "move-slot", "RoomId": room_id, "FromSlot": 2, "ToSlot": 4}))
        .await;
    guest.expect("move-slot-result").await;
    let update = loop {
        let update = host.expect("room-update").await;
        if slot_user(&update, 4) == 2 {
            break update;
        }
    };
    assert_eq!(slot_user(&update, 2), 0);

    server.shutdown();
}

#[tokio::test]
async fn test_host_move_swaps_seats() {
    let (server, addr) = start_server().await;
    let mut host = Client::connect(addr).await;
    let mut guest = Client::connect(addr).await;
    host.enter(1, "host").await;
    guest.enter(2, "guest").await;

    host.send(json!({"Command": "create-room", "HostId": 1, "RoomName": "Swap"}))
        .await;
    let room_id = host.expect("create-room-result").await["RoomId"]
        .as_u64()
        .unwrap();
    guest
        .send(json!({"Command": "join-room", "RoomId": room_id, "UserId": 2, "Username": "guest"}))
        .await;
    guest.expect("join-room-result").await;

    host.send(json!({"Command": "move-slot", "RoomId": room_id, "FromSlot": 1, "ToSlot": 2}))
        .await;
    host.expect("move-slot-result").await;

    host.send(json!({"Command": "request-room-info", "RoomId": room_id}))
        .await;
    let info = host.expect("room-info").await;
    assert_eq!(slot_user(&info, 1), 2);
    assert_eq!(slot_user(&info, 2), 1);
    assert_eq!(info["HostId"], 1);

    server.shutdown();
}

#[tokio::test]
async fn test_bad_input_keeps_connection_open() {
    let (server, addr) = start_server().await;
    let mut client = Client::connect(addr).await;

    client.send_raw("this is not json").await;
    let error = client.expect("error").await;
    assert_eq!(error["Kind"], "ParseError");

    client.send(json!({"Command": "dance"})).await;
    let error = client.expect("error").await;
    assert_eq!(error["Kind"], "UnknownCommand");

    client.send(json!({"Command": "ping"})).await;
    client.expect("pong").await;

    server.shutdown();
}

#[tokio::test]
async fn test_whisper_to_unknown_user_delivers_nothing() {
    let (server, addr) = start_server().await;
    let mut client = Client::connect(addr).await;
    client.enter(1, "solo").await;

    client
        .send(json!({
            "Command": "chat",
            "UserId": 1,
            "ChatType": "whisper",
            "Message": "anyone?",
            "TargetUsername": "ghost"
        }))
        .await;
    let result = client.expect("chat-result").await;
    assert_eq!(result["Delivered"], 0);

    server.shutdown();
}

#[tokio::test]
async fn test_host_disconnect_closes_room() {
    let (server, addr) = start_server().await;
    let mut host = Client::connect(addr).await;
    let mut guest = Client::connect(addr).await;
    host.enter(1, "host").await;
    guest.enter(2, "guest").await;

    host.send(json!({"Command": "create-room", "HostId": 1, "RoomName": "Doomed"}))
        .await;
    let room_id = host.expect("create-room-result").await["RoomId"]
        .as_u64()
        .unwrap();
    guest
        .send(json!({"Command": "join-room", "RoomId": room_id, "UserId": 2, "Username": "guest"}))
        .await;
    guest.expect("join-room-result").await;

    drop(host);
    let closed = guest.expect("room-closed").await;
    assert_eq!(closed["RoomId"], room_id);

    guest.send(json!({"Command": "request-room-list"})).await;
    let list = guest.expect("room-list-update").await;
    assert_eq!(list["Rooms"], json!([]));
    assert!(server.state().sessions.lookup(lobby_server::UserId(1)).is_none());

    server.shutdown();
}

#[tokio::test]
async fn test_connection_cap_turns_away_extra_clients() {
    let (server, addr) = start_server_with(ServerSettings {
        max_connections: 1,
        ..ServerSettings::default()
    })
    .await;

    let mut first = Client::connect(addr).await;
    first.send(json!({"Command": "ping"})).await;
    first.expect("pong").await;

    let mut second = Client::connect(addr).await;
    second.expect_closed().await;

    first.send(json!({"Command": "ping"})).await;
    first.expect("pong").await;
    assert_eq!(server.active_connections(), 1);

    server.shutdown();
}
