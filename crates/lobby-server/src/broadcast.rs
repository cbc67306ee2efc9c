//! Best-effort fan-out of events to lobby audiences.
//!
//! An event is encoded once and the shared frame is queued on every
//! recipient's connection. Queueing never blocks: a full or closed queue
//! counts as a failed delivery and the loop moves on.

use std::sync::Arc;

use lobby_net::{EncodedFrame, encode_frame};

use crate::protocol::{Event, RoomId, UserId};
use crate::registry::{Session, SessionRegistry};
use crate::rooms::RoomStore;

/// Who an event is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience<'a> {
    /// Every live session.
    Lobby,
    /// Live sessions seated in the room.
    Room(RoomId),
    /// The sender and the session with the given display name.
    Whisper { sender: UserId, target: &'a str },
    /// A single user.
    User(UserId),
}

/// Delivery tally for one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Sessions the audience resolved to.
    pub recipients: usize,
    /// Frames successfully queued.
    pub delivered: usize,
    /// Frames that could not be queued.
    pub failed: usize,
}

/// Resolves audiences against the registry and room store.
pub struct Broadcaster {
    sessions: Arc<SessionRegistry>,
    rooms: Arc<RoomStore>,
}

impl Broadcaster {
    pub fn new(sessions: Arc<SessionRegistry>, rooms: Arc<RoomStore>) -> Self {
        Self { sessions, rooms }
    }

    /// Live sessions making up `audience`.
    pub async fn resolve(&self, audience: Audience<'_>) -> Vec<Arc<Session>> {
        match audience {
            Audience::Lobby => self.sessions.all_live(),
            Audience::Room(room_id) => match self.rooms.members(room_id).await {
                Ok(members) => members
                    .into_iter()
                    .filter_map(|user_id| self.sessions.lookup(user_id))
                    .filter(|session| session.is_alive())
                    .collect(),
                Err(_) => Vec::new(),
            },
            Audience::Whisper { sender, target } => {
                let Some(target) = self.sessions.lookup_by_name(target) else {
                    tracing::debug!(%sender, target, "Whisper target not online, dropping");
                    return Vec::new();
                };
                let mut recipients = Vec::with_capacity(2);
                if let Some(from) = self.sessions.lookup(sender)
                    && from.is_alive()
                    && from.user_id != target.user_id
                {
                    recipients.push(from);
                }
                if target.is_alive() {
                    recipients.push(target);
                }
                recipients
            }
            Audience::User(user_id) => self
                .sessions
                .lookup(user_id)
                .filter(|session| session.is_alive())
                .into_iter()
                .collect(),
        }
    }

    /// Encode `event` and queue it for everyone in `audience`.
    pub async fn send(&self, audience: Audience<'_>, event: &Event) -> FanoutReport {
        let frame = match encode_frame(event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(command = event.command(), error = %e, "Failed to encode event");
                return FanoutReport::default();
            }
        };
        let recipients = self.resolve(audience).await;
        let report = deliver(&recipients, &frame);
        tracing::debug!(
            command = event.command(),
            ?audience,
            recipients = report.recipients,
            failed = report.failed,
            "Broadcast"
        );
        report
    }

    /// Push the full room list to the whole lobby.
    pub async fn room_list(&self) -> FanoutReport {
        let rooms = self.rooms.list_rooms().await;
        self.send(Audience::Lobby, &Event::RoomListUpdate { rooms })
            .await
    }

    /// Push a full snapshot of a room to its members.
    pub async fn room_update(&self, room_id: RoomId) -> FanoutReport {
        match self.rooms.snapshot(room_id).await {
            Ok(snapshot) => {
                self.send(Audience::Room(room_id), &Event::RoomUpdate(snapshot))
                    .await
            }
            Err(_) => FanoutReport::default(),
        }
    }

    /// Tell the whole lobby a room is gone.
    pub async fn room_closed(&self, room_id: RoomId) -> FanoutReport {
        self.send(Audience::Lobby, &Event::RoomClosed { room_id })
            .await
    }
}

fn deliver(recipients: &[Arc<Session>], frame: &EncodedFrame) -> FanoutReport {
    let mut report = FanoutReport {
        recipients: recipients.len(),
        ..Default::default()
    };
    for session in recipients {
        match session.send(Arc::clone(frame)) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                report.failed += 1;
                tracing::warn!(
                    user_id = %session.user_id,
                    connection = %session.connection.id(),
                    error = %e,
                    "Dropped broadcast frame"
                );
            }
        }
    }
    report
}
