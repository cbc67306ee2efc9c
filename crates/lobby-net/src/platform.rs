//! TCP socket tuning for lobby connections.
//!
//! Replies are small JSON lines, so every accepted stream runs with
//! TCP_NODELAY. Keepalive surfaces a client that vanished without a FIN as a
//! read error instead of a read that never returns.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

/// Unanswered keepalives before the kernel gives up on a peer.
const KEEPALIVE_RETRIES: u32 = 3;

/// Socket options for the lobby listener and its connections.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Idle time before the first keepalive; `None` disables keepalive.
    pub keepalive: Option<Duration>,
    /// Pending-connection queue length for the listener.
    pub backlog: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            keepalive: Some(Duration::from_secs(30)),
            backlog: 128,
        }
    }
}

impl SocketConfig {
    /// Gap between keepalives: a third of the idle time, at least 1s.
    fn retry_interval(idle: Duration) -> Duration {
        (idle / KEEPALIVE_RETRIES).max(Duration::from_secs(1))
    }
}

/// Apply nodelay and keepalive to an accepted stream.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(true)?;

    let Some(idle) = config.keepalive else {
        return Ok(());
    };
    let keepalive = TcpKeepalive::new()
        .with_time(idle)
        .with_interval(SocketConfig::retry_interval(idle));
    #[cfg(any(target_os = "linux", target_os = "windows"))]
    let keepalive = keepalive.with_retries(KEEPALIVE_RETRIES);

    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Bind the lobby listener. IPv6 addresses also accept IPv4 clients.
pub async fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    // Restarting the server must not wait out TIME_WAIT.
    #[cfg(not(target_os = "windows"))]
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog.min(i32::MAX as u32) as i32)?;
    TcpListener::from_std(socket.into())
}
