//! Multiplayer lobby coordination core.
//!
//! Clients hold one persistent TCP connection speaking newline-delimited
//! JSON. The [`supervisor`] accepts connections and runs one receive loop
//! each; [`dispatch`] turns every line into a typed [`protocol::Request`] and
//! routes it to a handler; handlers mutate the [`registry`] (who is online)
//! and the [`rooms`] store (who sits where), and the [`broadcast`] engine
//! pushes full-state updates to the affected audiences.

pub mod broadcast;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod supervisor;

pub use broadcast::{Audience, Broadcaster, FanoutReport};
pub use dispatch::{LobbyState, dispatch, dispatch_line};
pub use error::{LobbyError, LobbyResult};
pub use protocol::{CommandTag, Event, Request, RoomId, UserId};
pub use registry::{Session, SessionRegistry};
pub use rooms::{RoomStore, SLOT_COUNT, SlotState};
pub use supervisor::{
    LobbyServer, ServerSettings, disconnect_cascade, spawn_liveness_sweep, sweep_once,
};
