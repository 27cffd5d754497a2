//! Byte-stream connection: cheap-to-clone handle plus a write driver task.
//!
//! A [`Connection`] is the handle side. Writes are nonblocking enqueues onto
//! an outbound queue drained by a spawned driver that owns the write half of
//! the stream; the read half is owned by the peer's decode pump. Closing is
//! a signal: the driver and the pump both observe it and wind down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};

use crate::error::RpcError;

/// Peer lifecycle.
///
/// `Open → Closing` on local or remote close initiation; `Closing → Closed`
/// once the pump has drained, failed outstanding work, and fired callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Frames flow in both directions.
    Open,
    /// Shutdown initiated; no new writes are accepted.
    Closing,
    /// Terminal: all resources released.
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Handle to one reliable byte-stream connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    outbound: mpsc::UnboundedSender<Bytes>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    state: AtomicU8,
    close_tx: watch::Sender<bool>,
}

impl Connection {
    /// Split `stream`, spawn the write driver, and hand back the read half
    /// plus a close-signal subscription for the caller's decode pump.
    ///
    /// Both subscriptions are taken here, before any task is spawned, so a
    /// close initiated before the tasks first run is still observed.
    pub(crate) fn open<S>(
        stream: S,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> (Self, ReadHalf<S>, watch::Receiver<bool>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (close_tx, driver_closed) = watch::channel(false);
        let pump_closed = close_tx.subscribe();

        let conn = Self {
            inner: Arc::new(ConnInner {
                outbound: out_tx,
                peer_addr,
                local_addr,
                state: AtomicU8::new(STATE_OPEN),
                close_tx,
            }),
        };

        tokio::spawn(write_driver(write_half, out_rx, driver_closed, conn.clone()));

        (conn, read_half, pump_closed)
    }

    /// Enqueue `bytes` for transmission. Never blocks; the driver serializes
    /// enqueued buffers onto the stream in order.
    pub fn write(&self, bytes: Bytes) -> Result<(), RpcError> {
        if self.state() != PeerState::Open {
            return Err(RpcError::Closed);
        }
        self.inner.outbound.send(bytes).map_err(|_| RpcError::Closed)
    }

    /// Initiate shutdown. Idempotent; only the first call transitions the
    /// state and signals the driver and pump.
    pub fn close(&self) {
        if self
            .inner
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.inner.close_tx.send(true);
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_OPEN => PeerState::Open,
            STATE_CLOSING => PeerState::Closing,
            _ => PeerState::Closed,
        }
    }

    /// True once shutdown has been initiated (or completed).
    pub fn is_closed(&self) -> bool {
        self.state() != PeerState::Open
    }

    /// Remote address, when the underlying stream has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Local address, when the underlying stream has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Enter the terminal state. Called by the pump after outstanding work
    /// has been failed.
    pub(crate) fn finalize_closed(&self) {
        self.inner.state.store(STATE_CLOSED, Ordering::Release);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("peer_addr", &self.inner.peer_addr)
            .finish_non_exhaustive()
    }
}

async fn write_driver<S>(
    mut writer: WriteHalf<S>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    mut closed: watch::Receiver<bool>,
    conn: Connection,
) where
    S: AsyncWrite + Send + 'static,
{
    loop {
        tokio::select! {
            chunk = outbound.recv() => {
                let Some(chunk) = chunk else { break };
                if let Err(e) = writer.write_all(&chunk).await {
                    tracing::debug!(error = %e, "write failed; closing connection");
                    conn.close();
                    break;
                }
                if let Err(e) = writer.flush().await {
                    tracing::debug!(error = %e, "flush failed; closing connection");
                    conn.close();
                    break;
                }
            }
            _ = closed.changed() => break,
        }
    }
    let _ = writer.shutdown().await;
}
