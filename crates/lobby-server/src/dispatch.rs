//! Command dispatch: one typed request in, at most one reply out.
//!
//! Each request runs on its own task so a panicking handler is reported as
//! an `InternalError` instead of taking the connection loop down with it.

use std::sync::Arc;

use lobby_config::LobbyRules;
use lobby_net::ConnectionHandle;

use crate::broadcast::{Audience, Broadcaster};
use crate::error::{LobbyError, LobbyResult};
use crate::protocol::{
    Chat, CommandTag, CreateRoom, EnterLobby, Event, ExitRoom, JoinRoom, MoveSlot, Request, RoomId,
    RoomRef, SlotRequest, SystemChat, TargetPlayer, UserId,
};
use crate::registry::SessionRegistry;
use crate::rooms::{ExitOutcome, RoomStore};
use crate::supervisor::disconnect_cascade;

/// Shared state handed to every handler.
pub struct LobbyState {
    pub sessions: Arc<SessionRegistry>,
    pub rooms: Arc<RoomStore>,
    pub broadcaster: Broadcaster,
    pub rules: LobbyRules,
}

impl LobbyState {
    /// Build empty lobby state enforcing `rules`.
    pub fn new(rules: LobbyRules) -> Self {
        let sessions = Arc::new(SessionRegistry::new());
        let rooms = Arc::new(RoomStore::new(rules.max_room_name_width));
        let broadcaster = Broadcaster::new(Arc::clone(&sessions), Arc::clone(&rooms));
        Self {
            sessions,
            rooms,
            broadcaster,
            rules,
        }
    }

    /// Display name to show for `user_id` when a request does not carry one.
    fn display_name(&self, user_id: UserId, supplied: Option<&str>) -> String {
        if let Some(name) = supplied.map(str::trim).filter(|name| !name.is_empty()) {
            return name.to_string();
        }
        self.sessions
            .lookup(user_id)
            .map(|session| session.display_name.clone())
            .unwrap_or_else(|| format!("Player {user_id}"))
    }
}

impl Default for LobbyState {
    fn default() -> Self {
        Self::new(LobbyRules::default())
    }
}

/// Parse and dispatch one inbound line.
pub async fn dispatch_line(
    state: &Arc<LobbyState>,
    connection: &ConnectionHandle,
    line: &[u8],
) -> Option<Event> {
    match Request::parse(line) {
        Ok(request) => dispatch(state, connection, request).await,
        Err(e) => {
            tracing::debug!(connection = %connection.id(), error = %e, "Rejected request");
            Some(Event::error(&e))
        }
    }
}

/// Run the handler for `request` and turn its outcome into a reply.
pub async fn dispatch(
    state: &Arc<LobbyState>,
    connection: &ConnectionHandle,
    request: Request,
) -> Option<Event> {
    let tag = request.tag();
    tracing::debug!(connection = %connection.id(), command = %tag, "Dispatching");

    let task_state = Arc::clone(state);
    let task_connection = connection.clone();
    contained(tag, connection, async move {
        handle(&task_state, &task_connection, request).await
    })
    .await
}

/// Run a handler future on its own task, mapping errors and panics to an
/// error reply.
async fn contained<F>(tag: CommandTag, connection: &ConnectionHandle, handler: F) -> Option<Event>
where
    F: Future<Output = LobbyResult<Option<Event>>> + Send + 'static,
{
    match tokio::spawn(handler).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            tracing::debug!(connection = %connection.id(), command = %tag, error = %e, "Request failed");
            Some(Event::error(&e))
        }
        Err(join_error) => {
            tracing::error!(
                connection = %connection.id(),
                command = %tag,
                error = %join_error,
                "Handler aborted"
            );
            Some(Event::error(&LobbyError::Internal(format!(
                "{tag} could not be completed"
            ))))
        }
    }
}

async fn handle(
    state: &LobbyState,
    connection: &ConnectionHandle,
    request: Request,
) -> LobbyResult<Option<Event>> {
    match request {
        Request::EnterLobby(req) => enter_lobby(state, connection, req).await,
        Request::Logout(req) => logout(state, req.user_id).await,
        Request::CreateRoom(req) => create_room(state, req).await,
        Request::JoinRoom(req) => join_room(state, req).await,
        Request::KickPlayer(req) => kick_player(state, req).await,
        Request::MoveSlot(req) => move_slot(state, req).await,
        Request::ChangeHost(req) => change_host(state, req).await,
        Request::OpenSlot(req) => set_slot(state, req, true).await,
        Request::CloseSlot(req) => set_slot(state, req, false).await,
        Request::ExitRoom(req) => exit_room(state, req).await,
        Request::Chat(req) => chat(state, req).await,
        Request::SystemChat(req) => system_chat(state, req).await,
        Request::RequestRoomList => Ok(Some(Event::RoomListUpdate {
            rooms: state.rooms.list_rooms().await,
        })),
        Request::RequestRoomInfo(RoomRef { room_id }) => {
            Ok(Some(Event::RoomInfo(state.rooms.snapshot(room_id).await?)))
        }
        Request::GameStart(RoomRef { room_id }) => game_start(state, room_id).await,
        Request::GetSessionInfo(req) => {
            let session = state
                .sessions
                .lookup(req.user_id)
                .ok_or_else(|| LobbyError::not_found(format!("no session for user {}", req.user_id)))?;
            Ok(Some(Event::SessionInfo {
                user_id: session.user_id,
                username: session.display_name.clone(),
            }))
        }
        Request::Ping => Ok(Some(Event::Pong)),
    }
}

// ---------------------------------------------------------------------------
// Session handlers
// ---------------------------------------------------------------------------

async fn enter_lobby(
    state: &LobbyState,
    connection: &ConnectionHandle,
    req: EnterLobby,
) -> LobbyResult<Option<Event>> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(LobbyError::validation("Username must not be empty"));
    }

    let (session, previous) = state
        .sessions
        .upsert(req.user_id, username, connection.clone());
    if let Some(previous) = previous
        && !previous.connection.same_connection(connection)
    {
        tracing::info!(
            user_id = %req.user_id,
            old = %previous.connection.id(),
            new = %connection.id(),
            "Session replaced"
        );
    }
    tracing::info!(user_id = %session.user_id, name = username, connection = %connection.id(), "Entered lobby");

    // The current room list goes out ahead of the reply.
    let rooms = state.rooms.list_rooms().await;
    state
        .broadcaster
        .send(Audience::User(req.user_id), &Event::RoomListUpdate { rooms })
        .await;

    let mut online_users: Vec<String> = state
        .sessions
        .all_live()
        .iter()
        .map(|session| session.display_name.clone())
        .collect();
    online_users.sort();

    Ok(Some(Event::EnterLobbyResult {
        user_id: req.user_id,
        username: username.to_string(),
        message: format!("{} online", online_users.len()),
        online_users,
    }))
}

async fn logout(state: &LobbyState, user_id: UserId) -> LobbyResult<Option<Event>> {
    let known = state.sessions.lookup(user_id).is_some();
    disconnect_cascade(state, user_id, None).await;
    let message = if known {
        "logged out"
    } else {
        "no active session"
    };
    Ok(Some(Event::LogoutResult {
        message: message.to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Room handlers
// ---------------------------------------------------------------------------

async fn create_room(state: &LobbyState, req: CreateRoom) -> LobbyResult<Option<Event>> {
    let host_name = state.display_name(req.host_id, req.host.as_deref());
    let difficulty = req
        .difficulty
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(&state.rules.default_difficulty);

    let room_id = state
        .rooms
        .create_room(&req.room_name, req.host_id, &host_name, difficulty)
        .await?;

    state.broadcaster.room_update(room_id).await;
    state.broadcaster.room_list().await;
    Ok(Some(Event::CreateRoomResult {
        room_id,
        message: "room created".into(),
    }))
}

async fn join_room(state: &LobbyState, req: JoinRoom) -> LobbyResult<Option<Event>> {
    let name = state.display_name(req.user_id, Some(&req.username));
    let outcome = state.rooms.join_room(req.room_id, req.user_id, &name).await?;

    if !outcome.already_seated {
        state.broadcaster.room_update(req.room_id).await;
        state.broadcaster.room_list().await;
    }
    Ok(Some(Event::JoinRoomResult {
        room_id: req.room_id,
        slot: outcome.slot,
        message: if outcome.already_seated {
            "already in this room".into()
        } else {
            "joined room".into()
        },
    }))
}

async fn kick_player(state: &LobbyState, req: TargetPlayer) -> LobbyResult<Option<Event>> {
    state
        .rooms
        .kick_player(req.room_id, req.target_user_id)
        .await?;

    state
        .broadcaster
        .send(
            Audience::User(req.target_user_id),
            &Event::Kicked {
                room_id: req.room_id,
            },
        )
        .await;
    state.broadcaster.room_update(req.room_id).await;
    state.broadcaster.room_list().await;
    Ok(Some(Event::KickResult {
        room_id: req.room_id,
        target_user_id: req.target_user_id,
        message: "player kicked".into(),
    }))
}

async fn move_slot(state: &LobbyState, req: MoveSlot) -> LobbyResult<Option<Event>> {
    let outcome = state
        .rooms
        .move_slot(req.room_id, req.from_slot, req.to_slot)
        .await?;

    state.broadcaster.room_update(req.room_id).await;
    // Both values were range-checked by the store.
    let (from_slot, to_slot) = (req.from_slot as u8, req.to_slot as u8);
    Ok(Some(Event::MoveSlotResult {
        room_id: req.room_id,
        from_slot,
        to_slot,
        message: if outcome.swapped {
            format!("host swapped slot {from_slot} with slot {to_slot}")
        } else {
            format!("moved from slot {from_slot} to slot {to_slot}")
        },
    }))
}

async fn change_host(state: &LobbyState, req: TargetPlayer) -> LobbyResult<Option<Event>> {
    let changed = state
        .rooms
        .change_host(req.room_id, req.target_user_id)
        .await?;

    if changed {
        state.broadcaster.room_update(req.room_id).await;
        state.broadcaster.room_list().await;
    }
    Ok(Some(Event::ChangeHostResult {
        room_id: req.room_id,
        host_id: req.target_user_id,
        message: if changed {
            "host changed".into()
        } else {
            "already the host".into()
        },
    }))
}

async fn set_slot(state: &LobbyState, req: SlotRequest, open: bool) -> LobbyResult<Option<Event>> {
    let change = if open {
        state.rooms.open_slot(req.room_id, req.slot).await?
    } else {
        state.rooms.close_slot(req.room_id, req.slot).await?
    };

    if let Some(evicted) = change.evicted {
        state
            .broadcaster
            .send(
                Audience::User(evicted),
                &Event::Kicked {
                    room_id: req.room_id,
                },
            )
            .await;
    }
    if change.changed {
        state.broadcaster.room_update(req.room_id).await;
        state.broadcaster.room_list().await;
    }

    let slot = req.slot as u8;
    Ok(Some(if open {
        Event::OpenSlotResult {
            room_id: req.room_id,
            slot,
            message: format!("slot {slot} opened"),
        }
    } else {
        Event::CloseSlotResult {
            room_id: req.room_id,
            slot,
            message: format!("slot {slot} closed"),
        }
    }))
}

async fn exit_room(state: &LobbyState, req: ExitRoom) -> LobbyResult<Option<Event>> {
    let outcome = state.rooms.exit_room(req.room_id, req.user_id).await?;

    let room_deleted = match outcome {
        ExitOutcome::Closed { .. } => {
            state.broadcaster.room_closed(req.room_id).await;
            true
        }
        ExitOutcome::Left { .. } => {
            state.broadcaster.room_update(req.room_id).await;
            false
        }
    };
    state.broadcaster.room_list().await;

    Ok(Some(Event::ExitRoomResult {
        room_id: req.room_id,
        room_deleted,
        message: if room_deleted {
            "room deleted".into()
        } else {
            "left room".into()
        },
    }))
}

async fn game_start(state: &LobbyState, room_id: RoomId) -> LobbyResult<Option<Event>> {
    let snapshot = state.rooms.snapshot(room_id).await?;
    let report = state
        .broadcaster
        .send(Audience::Room(room_id), &Event::GameStart(snapshot))
        .await;
    tracing::info!(%room_id, players = report.delivered, "Game started");
    Ok(None)
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// Chat routing scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    All,
    Room,
    Whisper,
}

impl ChatKind {
    /// Parse a `ChatType` value, ignoring case. Absent means `All`.
    pub fn parse(raw: Option<&str>) -> LobbyResult<Self> {
        let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Ok(ChatKind::All);
        };
        match raw.to_ascii_lowercase().as_str() {
            "all" | "lobby" => Ok(ChatKind::All),
            "room" => Ok(ChatKind::Room),
            "whisper" => Ok(ChatKind::Whisper),
            _ => Err(LobbyError::validation(format!("unknown ChatType {raw}"))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ChatKind::All => "All",
            ChatKind::Room => "Room",
            ChatKind::Whisper => "Whisper",
        }
    }
}

fn check_message(state: &LobbyState, message: &str) -> LobbyResult<()> {
    if message.trim().is_empty() {
        return Err(LobbyError::validation("message must not be empty"));
    }
    let len = message.chars().count();
    if len > state.rules.max_chat_length {
        return Err(LobbyError::validation(format!(
            "message is {len} characters, limit is {}",
            state.rules.max_chat_length
        )));
    }
    Ok(())
}

async fn chat(state: &LobbyState, req: Chat) -> LobbyResult<Option<Event>> {
    check_message(state, &req.message)?;
    let kind = ChatKind::parse(req.chat_type.as_deref())?;
    let sender = state.display_name(req.user_id, req.username.as_deref());

    let target = req
        .target_username
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());

    let (audience, room_id) = match kind {
        ChatKind::All => (Audience::Lobby, None),
        ChatKind::Room => {
            let room_id = req
                .room_id
                .or_else(|| state.rooms.seat_of(req.user_id))
                .ok_or_else(|| LobbyError::validation("not seated in a room"))?;
            // Surfaces a missing room as NotFound rather than a silent drop.
            state.rooms.members(room_id).await?;
            (Audience::Room(room_id), Some(room_id))
        }
        ChatKind::Whisper => {
            let target =
                target.ok_or_else(|| LobbyError::validation("whisper needs a TargetUsername"))?;
            (
                Audience::Whisper {
                    sender: req.user_id,
                    target,
                },
                None,
            )
        }
    };

    let event = Event::Chat {
        chat_type: kind.as_str().to_string(),
        sender,
        message: req.message.clone(),
        target_username: (kind == ChatKind::Whisper).then(|| target.unwrap_or_default().to_string()),
        room_id,
    };
    let report = state.broadcaster.send(audience, &event).await;
    Ok(Some(Event::ChatResult {
        delivered: report.delivered,
    }))
}

async fn system_chat(state: &LobbyState, req: SystemChat) -> LobbyResult<Option<Event>> {
    check_message(state, &req.message)?;
    let sender = req
        .sender
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("System")
        .to_string();

    let report = state
        .broadcaster
        .send(
            Audience::Lobby,
            &Event::SystemChat {
                sender,
                message: req.message,
            },
        )
        .await;
    Ok(Some(Event::ChatResult {
        delivered: report.delivered,
    }))
}
