//! Transport plumbing for the lobby: newline-delimited JSON framing,
//! per-connection outbound queues, socket tuning, and the UDP match relay.
//!
//! Nothing in this crate knows about rooms or sessions.

pub mod connection;
pub mod framing;
pub mod platform;
pub mod relay;

pub use connection::{
    ConnectionConfig, ConnectionHandle, ConnectionId, IdGenerator, SendError, flag_raised,
};
pub use framing::{EncodedFrame, FrameConfig, FrameError, FrameReader, encode_frame, write_frame};
pub use platform::{SocketConfig, configure_stream, create_listener};
pub use relay::{EndpointRegistry, MatchRelay, RelayStats, parse_datagram};
