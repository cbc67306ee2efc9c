//! Request and event types for the lobby wire protocol.
//!
//! Every line on the wire is a JSON object carrying a `Command` tag. Inbound
//! lines are parsed exactly once, at the dispatch boundary, into a typed
//! [`Request`]; handlers never look at raw JSON. Outbound messages are
//! [`Event`] values whose variant name becomes the `Command` tag.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LobbyError, LobbyResult, describe};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Account identifier supplied by the client. `0` marks an empty slot.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Room identifier assigned by the room store.
///
/// Negative ids parse and match no room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub i64);

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// CommandTag
// ---------------------------------------------------------------------------

/// Command names understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandTag {
    EnterLobby,
    Logout,
    CreateRoom,
    JoinRoom,
    KickPlayer,
    MoveSlot,
    ChangeHost,
    OpenSlot,
    CloseSlot,
    ExitRoom,
    Chat,
    SystemChat,
    RequestRoomList,
    RequestRoomInfo,
    GameStart,
    GetSessionInfo,
    Ping,
}

impl CommandTag {
    const ALL: [CommandTag; 17] = [
        CommandTag::EnterLobby,
        CommandTag::Logout,
        CommandTag::CreateRoom,
        CommandTag::JoinRoom,
        CommandTag::KickPlayer,
        CommandTag::MoveSlot,
        CommandTag::ChangeHost,
        CommandTag::OpenSlot,
        CommandTag::CloseSlot,
        CommandTag::ExitRoom,
        CommandTag::Chat,
        CommandTag::SystemChat,
        CommandTag::RequestRoomList,
        CommandTag::RequestRoomInfo,
        CommandTag::GameStart,
        CommandTag::GetSessionInfo,
        CommandTag::Ping,
    ];

    /// Wire name of the command.
    pub fn name(self) -> &'static str {
        match self {
            CommandTag::EnterLobby => "enter-lobby",
            CommandTag::Logout => "logout",
            CommandTag::CreateRoom => "create-room",
            CommandTag::JoinRoom => "join-room",
            CommandTag::KickPlayer => "kick-player",
            CommandTag::MoveSlot => "move-slot",
            CommandTag::ChangeHost => "change-host",
            CommandTag::OpenSlot => "open-slot",
            CommandTag::CloseSlot => "close-slot",
            CommandTag::ExitRoom => "exit-room",
            CommandTag::Chat => "chat",
            CommandTag::SystemChat => "system-chat",
            CommandTag::RequestRoomList => "request-room-list",
            CommandTag::RequestRoomInfo => "request-room-info",
            CommandTag::GameStart => "game-start",
            CommandTag::GetSessionInfo => "get-session-info",
            CommandTag::Ping => "ping",
        }
    }

    /// Look up a command by name, ignoring ASCII case and surrounding space.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|tag| tag.name().eq_ignore_ascii_case(name))
    }
}

impl std::fmt::Display for CommandTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// `enter-lobby`: bind this connection to an identity.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnterLobby {
    pub user_id: UserId,
    pub username: String,
}

/// `logout`: explicit disconnect cascade for a user.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Logout {
    pub user_id: UserId,
}

/// `create-room`: open a new room with the requester seated as host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateRoom {
    pub host_id: UserId,
    pub room_name: String,
    #[serde(default)]
    pub difficulty: Option<String>,
    /// Host display name; falls back to the session's name.
    #[serde(default)]
    pub host: Option<String>,
}

/// `join-room`: take the lowest open slot.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinRoom {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: String,
}

/// Requests that name a room and a target player (`kick-player`,
/// `change-host`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TargetPlayer {
    pub room_id: RoomId,
    pub target_user_id: UserId,
}

/// `move-slot`: move or swap the occupant of `from_slot`.
///
/// Slot numbers stay signed so out-of-range values reach the room store and
/// are rejected there as validation errors rather than parse errors.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MoveSlot {
    pub room_id: RoomId,
    pub from_slot: i64,
    pub to_slot: i64,
}

/// `open-slot` / `close-slot`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SlotRequest {
    pub room_id: RoomId,
    pub slot: i64,
}

/// `exit-room`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExitRoom {
    pub room_id: RoomId,
    pub user_id: UserId,
}

/// `chat`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Chat {
    pub user_id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub chat_type: Option<String>,
    pub message: String,
    #[serde(default)]
    pub target_username: Option<String>,
    /// Overrides the sender's current room for room chat.
    #[serde(default)]
    pub room_id: Option<RoomId>,
}

/// `system-chat`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemChat {
    #[serde(default)]
    pub sender: Option<String>,
    pub message: String,
}

/// Requests that only name a room (`request-room-info`, `game-start`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RoomRef {
    pub room_id: RoomId,
}

/// `get-session-info`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionQuery {
    pub user_id: UserId,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A fully parsed inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    EnterLobby(EnterLobby),
    Logout(Logout),
    CreateRoom(CreateRoom),
    JoinRoom(JoinRoom),
    KickPlayer(TargetPlayer),
    MoveSlot(MoveSlot),
    ChangeHost(TargetPlayer),
    OpenSlot(SlotRequest),
    CloseSlot(SlotRequest),
    ExitRoom(ExitRoom),
    Chat(Chat),
    SystemChat(SystemChat),
    RequestRoomList,
    RequestRoomInfo(RoomRef),
    GameStart(RoomRef),
    GetSessionInfo(SessionQuery),
    Ping,
}

impl Request {
    /// Parse one request line.
    ///
    /// Malformed JSON, a missing or non-string `Command`, and missing or
    /// mistyped fields are [`LobbyError::Parse`]; an unrecognised command
    /// name is [`LobbyError::UnknownCommand`].
    pub fn parse(line: &[u8]) -> LobbyResult<Request> {
        let value: Value = serde_json::from_slice(line)?;
        let command = match &value {
            Value::Object(map) => match map.get("Command") {
                Some(Value::String(command)) => command.clone(),
                Some(other) => {
                    return Err(LobbyError::Parse(format!(
                        "Command must be a string, got {}",
                        describe(other)
                    )));
                }
                None => return Err(LobbyError::Parse("missing Command field".into())),
            },
            other => {
                return Err(LobbyError::Parse(format!(
                    "expected a JSON object, got {}",
                    describe(other)
                )));
            }
        };

        let tag = CommandTag::from_name(&command)
            .ok_or_else(|| LobbyError::UnknownCommand(command.trim().to_string()))?;
        Self::from_tagged(tag, value)
    }

    fn from_tagged(tag: CommandTag, value: Value) -> LobbyResult<Request> {
        let request = match tag {
            CommandTag::EnterLobby => Request::EnterLobby(fields(tag, value)?),
            CommandTag::Logout => Request::Logout(fields(tag, value)?),
            CommandTag::CreateRoom => Request::CreateRoom(fields(tag, value)?),
            CommandTag::JoinRoom => Request::JoinRoom(fields(tag, value)?),
            CommandTag::KickPlayer => Request::KickPlayer(fields(tag, value)?),
            CommandTag::MoveSlot => Request::MoveSlot(fields(tag, value)?),
            CommandTag::ChangeHost => Request::ChangeHost(fields(tag, value)?),
            CommandTag::OpenSlot => Request::OpenSlot(fields(tag, value)?),
            CommandTag::CloseSlot => Request::CloseSlot(fields(tag, value)?),
            CommandTag::ExitRoom => Request::ExitRoom(fields(tag, value)?),
            CommandTag::Chat => Request::Chat(fields(tag, value)?),
            CommandTag::SystemChat => Request::SystemChat(fields(tag, value)?),
            CommandTag::RequestRoomList => Request::RequestRoomList,
            CommandTag::RequestRoomInfo => Request::RequestRoomInfo(fields(tag, value)?),
            CommandTag::GameStart => Request::GameStart(fields(tag, value)?),
            CommandTag::GetSessionInfo => Request::GetSessionInfo(fields(tag, value)?),
            CommandTag::Ping => Request::Ping,
        };
        Ok(request)
    }

    /// Routing tag of this request.
    pub fn tag(&self) -> CommandTag {
        match self {
            Request::EnterLobby(_) => CommandTag::EnterLobby,
            Request::Logout(_) => CommandTag::Logout,
            Request::CreateRoom(_) => CommandTag::CreateRoom,
            Request::JoinRoom(_) => CommandTag::JoinRoom,
            Request::KickPlayer(_) => CommandTag::KickPlayer,
            Request::MoveSlot(_) => CommandTag::MoveSlot,
            Request::ChangeHost(_) => CommandTag::ChangeHost,
            Request::OpenSlot(_) => CommandTag::OpenSlot,
            Request::CloseSlot(_) => CommandTag::CloseSlot,
            Request::ExitRoom(_) => CommandTag::ExitRoom,
            Request::Chat(_) => CommandTag::Chat,
            Request::SystemChat(_) => CommandTag::SystemChat,
            Request::RequestRoomList => CommandTag::RequestRoomList,
            Request::RequestRoomInfo(_) => CommandTag::RequestRoomInfo,
            Request::GameStart(_) => CommandTag::GameStart,
            Request::GetSessionInfo(_) => CommandTag::GetSessionInfo,
            Request::Ping => CommandTag::Ping,
        }
    }
}

fn fields<T: DeserializeOwned>(tag: CommandTag, value: Value) -> LobbyResult<T> {
    serde_json::from_value(value)
        .map_err(|e| LobbyError::Parse(format!("invalid {tag} request: {e}")))
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// One row of the lobby room list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub room_name: String,
    pub host: String,
    pub host_id: UserId,
    pub difficulty: String,
    /// Occupied slots.
    pub current_players: usize,
    /// Slots that are not closed.
    pub max_players: usize,
}

/// One slot as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SlotView {
    pub player_slot: u8,
    /// `0` for an empty slot.
    pub user_id: UserId,
    /// Occupant name, or `"Open"` / `"Closed"` for an empty slot.
    pub username: String,
    pub is_host: bool,
    pub is_closed: bool,
}

/// Complete state of one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub room_name: String,
    pub host: String,
    pub host_id: UserId,
    pub difficulty: String,
    pub players: Vec<SlotView>,
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Outbound message. The kebab-case variant name is the `Command` tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "Command", rename_all = "kebab-case", rename_all_fields = "PascalCase")]
pub enum Event {
    EnterLobbyResult {
        user_id: UserId,
        username: String,
        online_users: Vec<String>,
        message: String,
    },
    LogoutResult {
        message: String,
    },
    CreateRoomResult {
        room_id: RoomId,
        message: String,
    },
    JoinRoomResult {
        room_id: RoomId,
        slot: u8,
        message: String,
    },
    KickResult {
        room_id: RoomId,
        target_user_id: UserId,
        message: String,
    },
    MoveSlotResult {
        room_id: RoomId,
        from_slot: u8,
        to_slot: u8,
        message: String,
    },
    ChangeHostResult {
        room_id: RoomId,
        host_id: UserId,
        message: String,
    },
    OpenSlotResult {
        room_id: RoomId,
        slot: u8,
        message: String,
    },
    CloseSlotResult {
        room_id: RoomId,
        slot: u8,
        message: String,
    },
    ExitRoomResult {
        room_id: RoomId,
        room_deleted: bool,
        message: String,
    },
    Chat {
        chat_type: String,
        sender: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
    },
    ChatResult {
        delivered: usize,
    },
    SystemChat {
        sender: String,
        message: String,
    },
    RoomListUpdate {
        rooms: Vec<RoomSummary>,
    },
    RoomUpdate(RoomSnapshot),
    RoomInfo(RoomSnapshot),
    RoomClosed {
        room_id: RoomId,
    },
    GameStart(RoomSnapshot),
    SessionInfo {
        user_id: UserId,
        username: String,
    },
    Kicked {
        room_id: RoomId,
    },
    Pong,
    Error {
        kind: String,
        message: String,
    },
}

impl Event {
    /// Error envelope for a failed request.
    pub fn error(error: &LobbyError) -> Self {
        Event::Error {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }

    /// The `Command` tag this event serializes with.
    pub fn command(&self) -> &'static str {
        match self {
            Event::EnterLobbyResult { .. } => "enter-lobby-result",
            Event::LogoutResult { .. } => "logout-result",
            Event::CreateRoomResult { .. } => "create-room-result",
            Event::JoinRoomResult { .. } => "join-room-result",
            Event::KickResult { .. } => "kick-result",
            Event::MoveSlotResult { .. } => "move-slot-result",
            Event::ChangeHostResult { .. } => "change-host-result",
            Event::OpenSlotResult { .. } => "open-slot-result",
            Event::CloseSlotResult { .. } => "close-slot-result",
            Event::ExitRoomResult { .. } => "exit-room-result",
            Event::Chat { .. } => "chat",
            Event::ChatResult { .. } => "chat-result",
            Event::SystemChat { .. } => "system-chat",
            Event::RoomListUpdate { .. } => "room-list-update",
            Event::RoomUpdate(_) => "room-update",
            Event::RoomInfo(_) => "room-info",
            Event::RoomClosed { .. } => "room-closed",
            Event::GameStart(_) => "game-start",
            Event::SessionInfo { .. } => "session-info",
            Event::Kicked { .. } => "kicked",
            Event::Pong => "pong",
            Event::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn to_json(event: &Event) -> Value {
        serde_json::to_value(event).unwrap()
    }

    #[test]
    fn test_command_lookup_ignores_case() {
        assert_eq!(CommandTag::from_name("ENTER-LOBBY"), Some(CommandTag::EnterLobby));
        assert_eq!(CommandTag::from_name(" Move-Slot "), Some(CommandTag::MoveSlot));
        assert_eq!(CommandTag::from_name("fly"), None);
    }

    #[test]
    fn test_every_tag_round_trips_through_its_name() {
        for tag in CommandTag::ALL {
            assert_eq!(CommandTag::from_name(tag.name()), Some(tag));
        }
    }

    #[test]
    fn test_parse_enter_lobby() {
        let request =
            Request::parse(br#"{"Command":"enter-lobby","UserId":7,"Username":"kim"}"#).unwrap();
        assert_eq!(
            request,
            Request::EnterLobby(EnterLobby {
                user_id: UserId(7),
                username: "kim".into(),
            })
        );
        assert_eq!(request.tag(), CommandTag::EnterLobby);
    }

    #[test]
    fn test_parse_create_room_optional_fields() {
        let request =
            Request::parse(br#"{"Command":"Create-Room","HostId":1,"RoomName":"Alpha"}"#).unwrap();
        let Request::CreateRoom(create) = request else {
            panic!("expected create-room");
        };
        assert_eq!(create.room_name, "Alpha");
        assert!(create.difficulty.is_none());
        assert!(create.host.is_none());
    }

    #[test]
    fn test_parse_payloadless_commands() {
        assert_eq!(Request::parse(br#"{"Command":"ping"}"#).unwrap(), Request::Ping);
        assert_eq!(
            Request::parse(br#"{"Command":"request-room-list"}"#).unwrap(),
            Request::RequestRoomList
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Request::parse(b"{not json"), Err(LobbyError::Parse(_))));
        assert!(matches!(Request::parse(b"[1,2]"), Err(LobbyError::Parse(_))));
        assert!(matches!(Request::parse(br#"{"UserId":1}"#), Err(LobbyError::Parse(_))));
        assert!(matches!(Request::parse(br#"{"Command":5}"#), Err(LobbyError::Parse(_))));
        // Known command, missing required field.
        assert!(matches!(
            Request::parse(br#"{"Command":"join-room","RoomId":1}"#),
            Err(LobbyError::Parse(_))
        ));
    }

    #[test]
    fn test_unknown_command() {
        let err = Request::parse(br#"{"Command":"teleport"}"#).unwrap_err();
        assert_eq!(err, LobbyError::UnknownCommand("teleport".into()));
    }

    #[test]
    fn test_slot_numbers_out_of_range_still_parse() {
        let request =
            Request::parse(br#"{"Command":"move-slot","RoomId":1,"FromSlot":0,"ToSlot":9}"#)
                .unwrap();
        assert!(matches!(
            request,
            Request::MoveSlot(MoveSlot { from_slot: 0, to_slot: 9, .. })
        ));
    }

    #[test]
    fn test_event_tags_and_field_names() {
        let event = Event::RoomClosed { room_id: RoomId(3) };
        assert_eq!(to_json(&event), json!({"Command": "room-closed", "RoomId": 3}));
        assert_eq!(to_json(&Event::Pong), json!({"Command": "pong"}));
        assert_eq!(to_json(&event)["Command"], event.command());
    }

    #[test]
    fn test_error_envelope() {
        let event = Event::error(&LobbyError::conflict("no open slot"));
        assert_eq!(
            to_json(&event),
            json!({"Command": "error", "Kind": "ConflictError", "Message": "no open slot"})
        );
    }

    #[test]
    fn test_snapshot_event_is_flattened() {
        let snapshot = RoomSnapshot {
            room_id: RoomId(1),
            room_name: "Alpha".into(),
            host: "kim".into(),
            host_id: UserId(1),
            difficulty: "Normal".into(),
            players: vec![SlotView {
                player_slot: 1,
                user_id: UserId(1),
                username: "kim".into(),
                is_host: true,
                is_closed: false,
            }],
        };
        let value = to_json(&Event::RoomUpdate(snapshot));
        assert_eq!(value["Command"], "room-update");
        assert_eq!(value["RoomName"], "Alpha");
        assert_eq!(value["Players"][0]["PlayerSlot"], 1);
        assert_eq!(value["Players"][0]["IsHost"], true);
    }

    #[test]
    fn test_chat_event_omits_absent_target() {
        let event = Event::Chat {
            chat_type: "All".into(),
            sender: "kim".into(),
            message: "hi".into(),
            target_username: None,
            room_id: None,
        };
        let value = to_json(&event);
        assert!(value.get("TargetUsername").is_none());
        assert_eq!(value["ChatType"], "All");
    }
}
