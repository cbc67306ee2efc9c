//! Room and slot store.
//!
//! Each room sits behind its own [`tokio::sync::Mutex`]; every mutation of a
//! room, including multi-slot swaps, happens inside that one critical section.
//! Rooms are independent of each other and are mutated in parallel.
//!
//! A system-wide seat index (`UserId -> RoomId`) backs the rule that a user
//! occupies at most one slot anywhere. Seat claims go through
//! [`DashMap::entry`], which is atomic per user, and are only ever written
//! while the owning room's lock is held, so the index and the slots can
//! never disagree.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;

use crate::error::{LobbyError, LobbyResult};
use crate::protocol::{RoomId, RoomSnapshot, RoomSummary, SlotView, UserId};

/// Seats per room.
pub const SLOT_COUNT: usize = 4;

/// Default limit on a room name's display width.
pub const DEFAULT_MAX_NAME_WIDTH: usize = 20;

/// 1-based slot number.
pub type SlotNumber = u8;

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

/// A seated player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seat {
    pub user_id: UserId,
    pub name: String,
    pub is_host: bool,
}

/// State of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Open,
    Closed,
    Occupied(Seat),
}

impl SlotState {
    fn seat(&self) -> Option<&Seat> {
        match self {
            SlotState::Occupied(seat) => Some(seat),
            _ => None,
        }
    }
}

/// Validate a client-supplied slot number.
pub fn slot_number(raw: i64) -> LobbyResult<SlotNumber> {
    if (1..=SLOT_COUNT as i64).contains(&raw) {
        Ok(raw as SlotNumber)
    } else {
        Err(LobbyError::validation(format!(
            "slot {raw} is out of range 1..={SLOT_COUNT}"
        )))
    }
}

fn index(slot: SlotNumber) -> usize {
    usize::from(slot) - 1
}

// ---------------------------------------------------------------------------
// Display width
// ---------------------------------------------------------------------------

/// Whether `c` renders two columns wide (Hangul, CJK, kana, full-width forms).
fn is_wide(c: char) -> bool {
    matches!(c as u32,
        0x1100..=0x115F
        | 0x2E80..=0x303E
        | 0x3041..=0x33FF
        | 0x3400..=0x4DBF
        | 0x4E00..=0x9FFF
        | 0xA000..=0xA4CF
        | 0xA960..=0xA97F
        | 0xAC00..=0xD7A3
        | 0xD7B0..=0xD7FF
        | 0xF900..=0xFAFF
        | 0xFE30..=0xFE4F
        | 0xFF00..=0xFF60
        | 0xFFE0..=0xFFE6
        | 0x1F300..=0x1F64F
        | 0x1F900..=0x1F9FF
        | 0x20000..=0x3FFFD)
}

/// Visual width of a room name: wide characters count 2, others 1.
pub fn display_width(text: &str) -> usize {
    text.chars().map(|c| if is_wide(c) { 2 } else { 1 }).sum()
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Room {
    id: RoomId,
    name: String,
    difficulty: String,
    slots: [SlotState; SLOT_COUNT],
    /// Set once the room is torn down. Holders of a stale `Arc` see this
    /// under the lock and treat the room as gone.
    deleted: bool,
}

impl Room {
    fn slot_of(&self, user_id: UserId) -> Option<SlotNumber> {
        self.slots
            .iter()
            .position(|slot| slot.seat().is_some_and(|seat| seat.user_id == user_id))
            .map(|i| (i + 1) as SlotNumber)
    }

    fn host(&self) -> Option<&Seat> {
        self.slots
            .iter()
            .filter_map(SlotState::seat)
            .find(|seat| seat.is_host)
    }

    fn occupants(&self) -> Vec<UserId> {
        self.slots
            .iter()
            .filter_map(SlotState::seat)
            .map(|seat| seat.user_id)
            .collect()
    }

    fn summary(&self) -> RoomSummary {
        let (host, host_id) = self
            .host()
            .map(|seat| (seat.name.clone(), seat.user_id))
            .unwrap_or_default();
        RoomSummary {
            room_id: self.id,
            room_name: self.name.clone(),
            host,
            host_id,
            difficulty: self.difficulty.clone(),
            current_players: self.slots.iter().filter(|s| s.seat().is_some()).count(),
            max_players: self
                .slots
                .iter()
                .filter(|s| !matches!(s, SlotState::Closed))
                .count(),
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        let summary = self.summary();
        let players = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                let player_slot = (i + 1) as SlotNumber;
                match slot {
                    SlotState::Occupied(seat) => SlotView {
                        player_slot,
                        user_id: seat.user_id,
                        username: seat.name.clone(),
                        is_host: seat.is_host,
                        is_closed: false,
                    },
                    SlotState::Open => SlotView {
                        player_slot,
                        user_id: UserId(0),
                        username: "Open".into(),
                        is_host: false,
                        is_closed: false,
                    },
                    SlotState::Closed => SlotView {
                        player_slot,
                        user_id: UserId(0),
                        username: "Closed".into(),
                        is_host: false,
                        is_closed: true,
                    },
                }
            })
            .collect();
        RoomSnapshot {
            room_id: self.id,
            room_name: summary.room_name,
            host: summary.host,
            host_id: summary.host_id,
            difficulty: summary.difficulty,
            players,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of a successful join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub slot: SlotNumber,
    /// The user already sat in this room; nothing changed.
    pub already_seated: bool,
}

/// Result of a successful move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOutcome {
    pub mover: UserId,
    /// The mover was the host, so the two slots were swapped.
    pub swapped: bool,
    /// Occupant of the target slot that was swapped into the source slot.
    pub displaced: Option<UserId>,
}

/// Result of opening or closing a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotChange {
    /// Player removed from the slot, if it was occupied.
    pub evicted: Option<UserId>,
    /// Whether the slot state actually changed.
    pub changed: bool,
}

/// What happened when a user left a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// A non-host left; their slot is open again.
    Left { slot: SlotNumber },
    /// The host left and the room was deleted. Lists everyone who was seated.
    Closed { occupants: Vec<UserId> },
}

// ---------------------------------------------------------------------------
// RoomStore
// ---------------------------------------------------------------------------

/// Authoritative in-memory room state.
pub struct RoomStore {
    rooms: DashMap<RoomId, Arc<Mutex<Room>>>,
    seats: DashMap<UserId, RoomId>,
    next_id: AtomicI64,
    max_name_width: usize,
}

impl Default for RoomStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_NAME_WIDTH)
    }
}

impl RoomStore {
    /// Create an empty store enforcing the given room-name width.
    pub fn new(max_name_width: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            seats: DashMap::new(),
            next_id: AtomicI64::new(1),
            max_name_width,
        }
    }

    fn room(&self, room_id: RoomId) -> LobbyResult<Arc<Mutex<Room>>> {
        // Clone the Arc out so no map guard is held across an await.
        self.rooms
            .get(&room_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| LobbyError::not_found(format!("room {room_id} does not exist")))
    }

    /// Claim `user_id`'s system-wide seat for `room_id`.
    ///
    /// Must be called with `room_id`'s lock held.
    fn claim_seat(&self, user_id: UserId, room_id: RoomId) -> LobbyResult<()> {
        match self.seats.entry(user_id) {
            Entry::Vacant(vacant) => {
                vacant.insert(room_id);
                Ok(())
            }
            Entry::Occupied(occupied) if *occupied.get() == room_id => Ok(()),
            Entry::Occupied(occupied) => Err(LobbyError::conflict(format!(
                "user {user_id} is already seated in room {}",
                occupied.get()
            ))),
        }
    }

    /// Release `user_id`'s seat if it points at `room_id`.
    ///
    /// Must be called with `room_id`'s lock held.
    fn release_seat(&self, user_id: UserId, room_id: RoomId) {
        self.seats.remove_if(&user_id, |_, seated_in| *seated_in == room_id);
    }

    /// Create a room with the host in slot 1 and slots 2-4 open.
    pub async fn create_room(
        &self,
        name: &str,
        host_id: UserId,
        host_name: &str,
        difficulty: &str,
    ) -> LobbyResult<RoomId> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LobbyError::validation("room name must not be empty"));
        }
        let width = display_width(name);
        if width > self.max_name_width {
            return Err(LobbyError::validation(format!(
                "room name is {width} columns wide, limit is {}",
                self.max_name_width
            )));
        }

        let room_id = RoomId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let room = Arc::new(Mutex::new(Room {
            id: room_id,
            name: name.to_string(),
            difficulty: difficulty.to_string(),
            slots: [
                SlotState::Occupied(Seat {
                    user_id: host_id,
                    name: host_name.to_string(),
                    is_host: true,
                }),
                SlotState::Open,
                SlotState::Open,
                SlotState::Open,
            ],
            deleted: false,
        }));

        let guard = room.lock().await;
        self.claim_seat(host_id, room_id)?;
        self.rooms.insert(room_id, Arc::clone(&room));
        drop(guard);

        tracing::info!(%room_id, host = %host_id, name, "Room created");
        Ok(room_id)
    }

    /// Seat a user in the lowest open slot.
    pub async fn join_room(
        &self,
        room_id: RoomId,
        user_id: UserId,
        name: &str,
    ) -> LobbyResult<JoinOutcome> {
        let room = self.room(room_id)?;
        let mut room = room.lock().await;
        if room.deleted {
            return Err(LobbyError::not_found(format!("room {room_id} does not exist")));
        }

        if let Some(slot) = room.slot_of(user_id) {
            return Ok(JoinOutcome {
                slot,
                already_seated: true,
            });
        }

        let free = room
            .slots
            .iter()
            .position(|slot| matches!(slot, SlotState::Open))
            .ok_or_else(|| LobbyError::conflict("no open slot"))?;

        self.claim_seat(user_id, room_id)?;
        room.slots[free] = SlotState::Occupied(Seat {
            user_id,
            name: name.to_string(),
            is_host: false,
        });

        let slot = (free + 1) as SlotNumber;
        tracing::debug!(%room_id, %user_id, slot, "Player joined");
        Ok(JoinOutcome {
            slot,
            already_seated: false,
        })
    }

    /// Move the occupant of `from` to `to`.
    ///
    /// A non-host may only move into an open slot. The host swaps the two
    /// slots wholesale, whatever `to` holds.
    pub async fn move_slot(&self, room_id: RoomId, from: i64, to: i64) -> LobbyResult<MoveOutcome> {
        if from == to {
            return Err(LobbyError::validation("source and target slot are the same"));
        }
        let (from, to) = (slot_number(from)?, slot_number(to)?);

        let room = self.room(room_id)?;
        let mut room = room.lock().await;
        if room.deleted {
            return Err(LobbyError::not_found(format!("room {room_id} does not exist")));
        }

        let mover = room.slots[index(from)]
            .seat()
            .cloned()
            .ok_or_else(|| LobbyError::not_found(format!("slot {from} has no player")))?;

        if mover.is_host {
            let displaced = room.slots[index(to)].seat().map(|seat| seat.user_id);
            room.slots.swap(index(from), index(to));
            tracing::debug!(%room_id, from, to, "Host swapped slots");
            return Ok(MoveOutcome {
                mover: mover.user_id,
                swapped: true,
                displaced,
            });
        }

        match room.slots[index(to)] {
            SlotState::Open => {}
            SlotState::Closed => return Err(LobbyError::conflict(format!("slot {to} is closed"))),
            SlotState::Occupied(_) => {
                return Err(LobbyError::conflict(format!("slot {to} is occupied")));
            }
        }
        room.slots[index(to)] = SlotState::Occupied(mover.clone());
        room.slots[index(from)] = SlotState::Open;
        tracing::debug!(%room_id, from, to, "Player moved");
        Ok(MoveOutcome {
            mover: mover.user_id,
            swapped: false,
            displaced: None,
        })
    }

    /// Vacate the target's slot. The host cannot be kicked.
    pub async fn kick_player(&self, room_id: RoomId, target: UserId) -> LobbyResult<SlotNumber> {
        let room = self.room(room_id)?;
        let mut room = room.lock().await;
        if room.deleted {
            return Err(LobbyError::not_found(format!("room {room_id} does not exist")));
        }

        let slot = room
            .slot_of(target)
            .ok_or_else(|| LobbyError::not_found(format!("user {target} is not in room {room_id}")))?;
        if room.slots[index(slot)].seat().is_some_and(|seat| seat.is_host) {
            return Err(LobbyError::validation("the host cannot be kicked"));
        }

        room.slots[index(slot)] = SlotState::Open;
        self.release_seat(target, room_id);
        tracing::info!(%room_id, user_id = %target, slot, "Player kicked");
        Ok(slot)
    }

    /// Hand the host flag to another occupant. Returns `false` if the target
    /// already was the host.
    pub async fn change_host(&self, room_id: RoomId, new_host: UserId) -> LobbyResult<bool> {
        let room = self.room(room_id)?;
        let mut room = room.lock().await;
        if room.deleted {
            return Err(LobbyError::not_found(format!("room {room_id} does not exist")));
        }

        let target = room.slot_of(new_host).ok_or_else(|| {
            LobbyError::not_found(format!("user {new_host} is not in room {room_id}"))
        })?;
        if room.slots[index(target)].seat().is_some_and(|seat| seat.is_host) {
            return Ok(false);
        }

        for slot in room.slots.iter_mut() {
            if let SlotState::Occupied(seat) = slot {
                seat.is_host = seat.user_id == new_host;
            }
        }
        tracing::info!(%room_id, host = %new_host, "Host changed");
        Ok(true)
    }

    /// Force a slot open, evicting its occupant.
    pub async fn open_slot(&self, room_id: RoomId, slot: i64) -> LobbyResult<SlotChange> {
        self.set_slot(room_id, slot, SlotState::Open).await
    }

    /// Force a slot closed, evicting its occupant.
    pub async fn close_slot(&self, room_id: RoomId, slot: i64) -> LobbyResult<SlotChange> {
        self.set_slot(room_id, slot, SlotState::Closed).await
    }

    async fn set_slot(&self, room_id: RoomId, slot: i64, state: SlotState) -> LobbyResult<SlotChange> {
        let slot = slot_number(slot)?;
        let room = self.room(room_id)?;
        let mut room = room.lock().await;
        if room.deleted {
            return Err(LobbyError::not_found(format!("room {room_id} does not exist")));
        }

        let current = &room.slots[index(slot)];
        if *current == state {
            return Ok(SlotChange {
                evicted: None,
                changed: false,
            });
        }
        let evicted = match current.seat() {
            Some(seat) if seat.is_host => {
                return Err(LobbyError::validation("the host's slot cannot be opened or closed"));
            }
            Some(seat) => Some(seat.user_id),
            None => None,
        };

        if let Some(user_id) = evicted {
            self.release_seat(user_id, room_id);
            tracing::info!(%room_id, %user_id, slot, "Player evicted from slot");
        }
        room.slots[index(slot)] = state;
        Ok(SlotChange {
            evicted,
            changed: true,
        })
    }

    /// Remove a user from a room. The host leaving deletes the room.
    pub async fn exit_room(&self, room_id: RoomId, user_id: UserId) -> LobbyResult<ExitOutcome> {
        let room = self.room(room_id)?;
        let mut room = room.lock().await;
        if room.deleted {
            return Err(LobbyError::not_found(format!("room {room_id} does not exist")));
        }

        let slot = room
            .slot_of(user_id)
            .ok_or_else(|| LobbyError::not_found(format!("user {user_id} is not in room {room_id}")))?;

        if room.slots[index(slot)].seat().is_some_and(|seat| seat.is_host) {
            let occupants = room.occupants();
            for occupant in &occupants {
                self.release_seat(*occupant, room_id);
            }
            room.deleted = true;
            self.rooms.remove(&room_id);
            tracing::info!(%room_id, host = %user_id, "Room closed by host");
            return Ok(ExitOutcome::Closed { occupants });
        }

        room.slots[index(slot)] = SlotState::Open;
        self.release_seat(user_id, room_id);
        tracing::debug!(%room_id, %user_id, slot, "Player left room");
        Ok(ExitOutcome::Left { slot })
    }

    /// Take `user_id` out of whatever room they sit in.
    pub async fn release_user(&self, user_id: UserId) -> Option<(RoomId, ExitOutcome)> {
        // The seat can move between the index read and the room lock (a kick,
        // say); re-read a few times before giving up.
        for _ in 0..3 {
            let room_id = self.seat_of(user_id)?;
            match self.exit_room(room_id, user_id).await {
                Ok(outcome) => return Some((room_id, outcome)),
                Err(_) => {
                    if !self.rooms.contains_key(&room_id) {
                        self.seats.remove_if(&user_id, |_, seated_in| *seated_in == room_id);
                    }
                }
            }
        }
        None
    }

    /// Room the user is seated in, if any.
    pub fn seat_of(&self, user_id: UserId) -> Option<RoomId> {
        self.seats.get(&user_id).map(|entry| *entry.value())
    }

    /// Users currently seated in a room.
    pub async fn members(&self, room_id: RoomId) -> LobbyResult<Vec<UserId>> {
        let room = self.room(room_id)?;
        let room = room.lock().await;
        if room.deleted {
            return Err(LobbyError::not_found(format!("room {room_id} does not exist")));
        }
        Ok(room.occupants())
    }

    /// Full snapshot of one room.
    pub async fn snapshot(&self, room_id: RoomId) -> LobbyResult<RoomSnapshot> {
        let room = self.room(room_id)?;
        let room = room.lock().await;
        if room.deleted {
            return Err(LobbyError::not_found(format!("room {room_id} does not exist")));
        }
        Ok(room.snapshot())
    }

    /// Summary of every room, ordered by id.
    pub async fn list_rooms(&self) -> Vec<RoomSummary> {
        let rooms: Vec<_> = self
            .rooms
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut summaries = Vec::with_capacity(rooms.len());
        for room in rooms {
            let room = room.lock().await;
            if !room.deleted {
                summaries.push(room.summary());
            }
        }
        summaries.sort_by_key(|summary| summary.room_id);
        summaries
    }

    /// Number of rooms.
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Whether there are no rooms.
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
