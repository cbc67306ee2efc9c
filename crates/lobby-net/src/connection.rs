//! Per-connection outbound handle.
//!
//! Every accepted stream gets a [`ConnectionHandle`]: a bounded queue of
//! encoded frames drained by a dedicated writer task. Senders never touch the
//! socket, so a stalled peer can only fill its own queue; once the queue is
//! full further sends fail immediately with [`SendError::QueueFull`].
//!
//! The handle also carries the liveness state the supervisor checks: an
//! `alive` flag cleared by the reader (end-of-stream) or the writer (write
//! error or timeout), and a last-seen timestamp refreshed on every inbound
//! frame.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::framing::{EncodedFrame, write_frame};

/// Resolve once `flag` reads `true` or its sender is gone.
///
/// The borrow taken by [`watch::Receiver::wait_for`] is released before
/// returning, so the future can sit in a `select!` arm of a spawned task.
pub async fn flag_raised(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|raised| *raised).await;
}

/// Unique identifier for a TCP connection within a server run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound settings for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Frames buffered before sends start failing. Default: 256.
    pub queue_capacity: usize,
    /// Upper bound on a single socket write. Default: 2s.
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            write_timeout: Duration::from_secs(2),
        }
    }
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The connection is closed or its writer has stopped.
    #[error("connection closed")]
    Closed,
    /// The peer is not draining its queue fast enough.
    #[error("outbound queue full")]
    QueueFull,
}

struct ConnectionInner {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    outbound: mpsc::Sender<EncodedFrame>,
    alive: AtomicBool,
    opened_at: Instant,
    /// Milliseconds since `opened_at` of the last inbound frame.
    last_seen_ms: AtomicU64,
    close_tx: watch::Sender<bool>,
}

/// Cheap, cloneable handle to one client connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl ConnectionHandle {
    /// Create a handle whose frames land in the returned receiver instead of
    /// a socket. The caller owns draining it.
    pub fn channel(
        id: ConnectionId,
        peer_addr: Option<SocketAddr>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<EncodedFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (close_tx, _) = watch::channel(false);
        let handle = Self {
            inner: Arc::new(ConnectionInner {
                id,
                peer_addr,
                outbound: tx,
                alive: AtomicBool::new(true),
                opened_at: Instant::now(),
                last_seen_ms: AtomicU64::new(0),
                close_tx,
            }),
        };
        (handle, rx)
    }

    /// Create a handle and spawn the writer task that drains it into
    /// `writer`.
    pub fn spawn<W>(
        id: ConnectionId,
        peer_addr: Option<SocketAddr>,
        writer: W,
        config: &ConnectionConfig,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (handle, rx) = Self::channel(id, peer_addr, config.queue_capacity);
        let task_handle = handle.clone();
        let write_timeout = config.write_timeout;
        tokio::spawn(async move {
            task_handle.writer_loop(writer, rx, write_timeout).await;
        });
        handle
    }

    async fn writer_loop<W>(
        self,
        mut writer: W,
        mut rx: mpsc::Receiver<EncodedFrame>,
        write_timeout: Duration,
    ) where
        W: AsyncWrite + Unpin,
    {
        let mut closed = self.closed();
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    match tokio::time::timeout(write_timeout, write_frame(&mut writer, &frame)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::debug!(connection = %self.id(), error = %e, "Write failed");
                            break;
                        }
                        Err(_) => {
                            tracing::warn!(connection = %self.id(), "Write timed out");
                            break;
                        }
                    }
                }
                _ = flag_raised(&mut closed) => break,
            }
        }
        self.mark_dead();
        let _ = writer.shutdown().await;
        tracing::trace!(connection = %self.id(), "Writer stopped");
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Remote address, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Queue a frame without waiting.
    pub fn send_frame(&self, frame: EncodedFrame) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }
        self.inner.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Whether the connection is still usable.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire) && !self.inner.outbound.is_closed()
    }

    /// Flag the connection as dead without signalling the writer.
    pub fn mark_dead(&self) {
        self.inner.alive.store(false, Ordering::Release);
    }

    /// Mark the connection dead and stop its writer.
    pub fn close(&self) {
        self.mark_dead();
        self.inner.close_tx.send_replace(true);
    }

    /// Receiver that flips to `true` once [`close`](Self::close) is called.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.inner.close_tx.subscribe()
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        let elapsed = self.inner.opened_at.elapsed().as_millis() as u64;
        self.inner.last_seen_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last inbound frame (or since open, if none).
    pub fn idle_for(&self) -> Duration {
        let last_seen = Duration::from_millis(self.inner.last_seen_ms.load(Ordering::Relaxed));
        self.inner.opened_at.elapsed().saturating_sub(last_seen)
    }

    /// Whether two handles refer to the same connection.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
