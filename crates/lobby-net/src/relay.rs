//! Best-effort UDP match relay.
//!
//! A broadcast mirror for in-match traffic: every well-formed datagram is
//! forwarded byte-for-byte to every endpoint the relay has heard from,
//! except the sender. There are no sessions, retries or ordering.
//!
//! Datagrams look like `header|json-payload`. The header is 1..=32 ASCII
//! alphanumerics, `-` or `_`, and the payload must parse as JSON; anything
//! else is dropped.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UdpSocket;
use tokio::sync::{RwLock, watch};

use crate::connection::flag_raised;

/// Longest accepted datagram header.
pub const MAX_HEADER_LEN: usize = 32;

/// Split a datagram into `(header, payload)` if it is well formed.
pub fn parse_datagram(datagram: &[u8]) -> Option<(&str, &str)> {
    let text = std::str::from_utf8(datagram).ok()?;
    let (header, payload) = text.split_once('|')?;
    let header_ok = !header.is_empty()
        && header.len() <= MAX_HEADER_LEN
        && header
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !header_ok {
        return None;
    }
    serde_json::from_str::<serde::de::IgnoredAny>(payload).ok()?;
    Some((header, payload))
}

/// Set of remote endpoints seen by the relay. Entries never expire.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: RwLock<HashSet<SocketAddr>>,
}

impl EndpointRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an endpoint. Returns `true` the first time it is seen.
    pub async fn remember(&self, addr: SocketAddr) -> bool {
        if self.endpoints.read().await.contains(&addr) {
            return false;
        }
        self.endpoints.write().await.insert(addr)
    }

    /// Snapshot of every endpoint except `sender`.
    pub async fn others(&self, sender: SocketAddr) -> Vec<SocketAddr> {
        self.endpoints
            .read()
            .await
            .iter()
            .copied()
            .filter(|addr| *addr != sender)
            .collect()
    }

    /// Number of known endpoints.
    pub async fn len(&self) -> usize {
        self.endpoints.read().await.len()
    }

    /// Whether no endpoint has been seen yet.
    pub async fn is_empty(&self) -> bool {
        self.endpoints.read().await.is_empty()
    }
}

/// Counters for relay traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Datagrams received.
    pub received: u64,
    /// Individual copies sent to peers.
    pub forwarded: u64,
    /// Datagrams discarded as malformed or oversized.
    pub dropped: u64,
    /// Copies that failed to send.
    pub send_failures: u64,
}

#[derive(Default)]
struct RelayCounters {
    received: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    send_failures: AtomicU64,
}

/// UDP broadcast-to-all-but-sender relay.
pub struct MatchRelay {
    socket: UdpSocket,
    endpoints: Arc<EndpointRegistry>,
    max_datagram: usize,
    counters: RelayCounters,
    shutdown_tx: watch::Sender<bool>,
}

impl MatchRelay {
    /// Bind the relay socket.
    pub async fn bind(addr: SocketAddr, max_datagram: usize) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket, max_datagram))
    }

    /// Wrap an already bound socket.
    pub fn from_socket(socket: UdpSocket, max_datagram: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            socket,
            endpoints: Arc::new(EndpointRegistry::new()),
            max_datagram: max_datagram.max(1),
            counters: RelayCounters::default(),
            shutdown_tx,
        }
    }

    /// Address the relay is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Known endpoints.
    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.endpoints
    }

    /// Current traffic counters.
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            received: self.counters.received.load(Ordering::Relaxed),
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
        }
    }

    /// Receive and forward datagrams until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        // One spare byte to detect oversized datagrams.
        let mut buf = vec![0u8; self.max_datagram + 1];
        tracing::info!("Match relay listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, from)) => self.relay(&buf[..n], from).await,
                        // ICMP port-unreachable from a departed peer surfaces
                        // here on some platforms; it is not fatal.
                        Err(e) => tracing::debug!(error = %e, "Relay receive error"),
                    }
                }
                _ = flag_raised(&mut shutdown_rx) => {
                    tracing::info!("Match relay shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Signal [`run`](Self::run) to return.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    async fn relay(&self, datagram: &[u8], from: SocketAddr) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        if self.endpoints.remember(from).await {
            tracing::debug!(%from, "New relay endpoint");
        }

        if datagram.len() > self.max_datagram {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%from, len = datagram.len(), "Dropping oversized datagram");
            return;
        }
        let Some((header, _)) = parse_datagram(datagram) else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%from, "Dropping datagram without a recognizable header");
            return;
        };

        let targets = self.endpoints.others(from).await;
        tracing::trace!(%from, header, peers = targets.len(), "Relaying datagram");
        for target in targets {
            match self.socket.send_to(datagram, target).await {
                Ok(_) => {
                    self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%target, error = %e, "Relay send failed");
                }
            }
        }
    }
}
