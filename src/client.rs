//! Client peer: channel allocation, response correlation, and the pending
//! queue.
//!
//! Every in-flight call occupies one slot in a fixed-size channel table;
//! calls past the budget queue FIFO until a response frees a slot.
//!
//! ```text
//!   send_message ──► free slot? ──yes──► install waiter, encode, write
//!                        │
//!                        no ──► queue (pre-encoded if the codec recodes)
//!
//!   response frame ──► take waiter for its channel ──► fulfill ──► flush
//!                                                                  queue
//! ```
//!
//! The table and queue are guarded by one lock per peer; encoding on the
//! allocated path, writing, and waiter completion all happen outside it.

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;

use crate::codec::{Channel, Codec, Frame, MAX_CHANNELS, UNASSIGNED_CHANNEL};
use crate::connection::Connection;
use crate::error::RpcError;
use crate::peer::{run_pump, PeerHooks, PeerShared};

const DEFAULT_MAX_CHANNELS: usize = 64;

fn default_max_channels() -> usize {
    std::env::var("MUXRPC_MAX_CHANNELS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_CHANNELS)
}

/// Peer construction options.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    max_channels: usize,
}

impl PeerConfig {
    /// Defaults, with `MUXRPC_MAX_CHANNELS` honored when set.
    pub fn new() -> Self {
        Self {
            max_channels: default_max_channels(),
        }
    }

    /// Set the channel budget. Must be in `1..=MAX_CHANNELS`; checked at
    /// peer construction.
    pub fn max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels;
        self
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self::new()
    }
}

type Responder = oneshot::Sender<Result<Bytes, RpcError>>;

/// Payload of a call waiting for a free channel, shaped once at enqueue
/// time by the codec's recoding capability.
enum QueuedPayload {
    /// Raw request; encoded at flush time once a channel is known.
    Raw(Bytes),
    /// Pre-encoded with the unassigned sentinel; recoded at flush time.
    Encoded(BytesMut),
}

struct QueuedCall {
    payload: QueuedPayload,
    tx: Responder,
}

struct CallTable {
    /// `None` = free. A slot is cleared only by the response that arrives
    /// for it (or by the close sweep) — never by a timeout.
    channels: Vec<Option<Responder>>,
    queue: VecDeque<QueuedCall>,
}

impl CallTable {
    fn free_slot(&self) -> Option<usize> {
        self.channels.iter().position(|slot| slot.is_none())
    }
}

enum Placement {
    /// Slot taken; encode and write with this channel.
    Slot(Channel, Bytes),
    Queued,
    Rejected(RpcError, Responder),
}

/// Client endpoint of one connection.
///
/// `send_message` may be called from any thread; decode-side processing
/// runs on the peer's pump task.
pub struct ClientPeer<C: Codec> {
    shared: Arc<PeerShared<C>>,
    table: Mutex<CallTable>,
}

impl<C: Codec> std::fmt::Debug for ClientPeer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPeer").finish_non_exhaustive()
    }
}

impl<C: Codec> ClientPeer<C> {
    /// Connect over TCP and start the peer.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        codec: C,
        config: PeerConfig,
    ) -> Result<Arc<Self>, RpcError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr().ok();
        let local_addr = stream.local_addr().ok();
        Self::start_inner(stream, codec, config, peer_addr, local_addr)
    }

    /// Start the peer over any byte stream (for in-process transports,
    /// pipes, or tests). Must be called from within a Tokio runtime.
    pub fn start<S>(stream: S, codec: C, config: PeerConfig) -> Result<Arc<Self>, RpcError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::start_inner(stream, codec, config, None, None)
    }

    fn start_inner<S>(
        stream: S,
        codec: C,
        config: PeerConfig,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Result<Arc<Self>, RpcError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if config.max_channels == 0 || config.max_channels > MAX_CHANNELS {
            return Err(RpcError::InvalidArgument(format!(
                "max_channels must be in 1..={MAX_CHANNELS}, got {}",
                config.max_channels
            )));
        }

        let (conn, read_half, closed) = Connection::open(stream, peer_addr, local_addr);
        let peer = Arc::new(Self {
            shared: Arc::new(PeerShared::new(conn, codec)),
            table: Mutex::new(CallTable {
                channels: std::iter::repeat_with(|| None)
                    .take(config.max_channels)
                    .collect(),
                queue: VecDeque::new(),
            }),
        });

        tokio::spawn(run_pump(peer.shared.clone(), peer.clone(), read_half, closed));

        Ok(peer)
    }

    /// Issue one call. Returns immediately with an incomplete future; the
    /// allocation (or enqueue) and the write happen before this returns.
    ///
    /// The future completes exactly once: with the response, a
    /// [`RpcError::TimedOut`] when `timeout` elapses first (the late
    /// response is then discarded on arrival), a [`RpcError::Closed`] when
    /// the connection goes down first, or an encode error.
    pub fn send_message(
        &self,
        request: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Bytes, RpcError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.submit(request.into(), tx);
        // The deadline is anchored here, at submission, so holding the
        // future unpolled does not widen the timeout window.
        let deadline = timeout.map(|limit| tokio::time::Instant::now() + limit);

        async move {
            let outcome = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, rx).await {
                    Ok(done) => done,
                    Err(_) => return Err(RpcError::TimedOut),
                },
                None => rx.await,
            };
            // A dropped responder without an explicit completion means the
            // peer tore down without sweeping this call.
            outcome.unwrap_or(Err(RpcError::Closed))
        }
    }

    fn submit(&self, request: Bytes, tx: Responder) {
        let placement = {
            let mut table = self.table.lock();
            if self.shared.conn.is_closed() {
                // The close sweep may already have drained the table; a
                // waiter installed now would never be failed.
                Placement::Rejected(RpcError::Closed, tx)
            } else if let Some(idx) = table.free_slot() {
                table.channels[idx] = Some(tx);
                Placement::Slot(idx as Channel, request)
            } else {
                tracing::trace!(
                    queued = table.queue.len() + 1,
                    "all channels busy; queueing call"
                );
                let mut codec = self.shared.codec.lock();
                if codec.recoding() {
                    let mut buf = BytesMut::new();
                    match codec.encode(&request, UNASSIGNED_CHANNEL, &mut buf) {
                        Ok(()) => {
                            drop(codec);
                            table.queue.push_back(QueuedCall {
                                payload: QueuedPayload::Encoded(buf),
                                tx,
                            });
                            Placement::Queued
                        }
                        Err(e) => Placement::Rejected(RpcError::Encode(e), tx),
                    }
                } else {
                    drop(codec);
                    table.queue.push_back(QueuedCall {
                        payload: QueuedPayload::Raw(request),
                        tx,
                    });
                    Placement::Queued
                }
            }
        };

        match placement {
            Placement::Slot(channel, request) => self.write_call(&request, channel),
            Placement::Queued => {}
            Placement::Rejected(err, tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }

    /// Encode and write a call that holds `channel`. On encode failure the
    /// slot is released and the freed slot offered to the queue; on write
    /// failure the close sweep owns cleanup, with a local fallback for the
    /// race where the sweep already ran.
    fn write_call(&self, request: &Bytes, channel: Channel) {
        let mut buf = BytesMut::new();
        let encoded = self.shared.codec.lock().encode(request, channel, &mut buf);
        match encoded {
            Ok(()) => {
                if self.shared.conn.write(buf.freeze()).is_err() {
                    self.fail_slot(channel, RpcError::Closed);
                }
            }
            Err(e) => {
                tracing::debug!(channel, error = %e, "request encode failed");
                self.fail_slot(channel, RpcError::Encode(e));
                self.flush_queue();
            }
        }
    }

    fn fail_slot(&self, channel: Channel, err: RpcError) {
        let waiter = {
            let mut table = self.table.lock();
            table.channels[channel as usize].take()
        };
        if let Some(tx) = waiter {
            let _ = tx.send(Err(err));
        }
    }

    /// Drain the queue head into free slots, strict FIFO. The whole scan
    /// runs under the table lock; writes are nonblocking enqueues so the
    /// drained calls hit the wire in queue order.
    fn flush_queue(&self) {
        let mut rejected: Vec<(Responder, RpcError)> = Vec::new();
        {
            let mut table = self.table.lock();
            while !table.queue.is_empty() {
                let Some(idx) = table.free_slot() else { break };
                let Some(QueuedCall { payload, tx }) = table.queue.pop_front() else {
                    break;
                };
                let channel = idx as Channel;

                let bytes = match payload {
                    QueuedPayload::Encoded(mut buf) => {
                        match self.shared.codec.lock().recode(&mut buf, channel) {
                            Ok(()) => buf.freeze(),
                            Err(e) => {
                                rejected.push((tx, RpcError::Encode(e)));
                                continue;
                            }
                        }
                    }
                    QueuedPayload::Raw(request) => {
                        let mut buf = BytesMut::new();
                        match self.shared.codec.lock().encode(&request, channel, &mut buf) {
                            Ok(()) => buf.freeze(),
                            Err(e) => {
                                rejected.push((tx, RpcError::Encode(e)));
                                continue;
                            }
                        }
                    }
                };

                table.channels[idx] = Some(tx);
                if self.shared.conn.write(bytes).is_err() {
                    // Connection went down mid-drain; the sweep fails the
                    // installed waiter and the rest of the queue.
                    break;
                }
            }
        }

        for (tx, err) in rejected {
            let _ = tx.send(Err(err));
        }
    }

    /// Channels currently awaiting a response, ascending (for diagnostics).
    pub fn reserved_channels(&self) -> Vec<Channel> {
        let table = self.table.lock();
        table
            .channels
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|_| idx as Channel))
            .collect()
    }

    /// Calls waiting for a free channel (for diagnostics).
    pub fn queued_len(&self) -> usize {
        self.table.lock().queue.len()
    }

    /// Register a callback fired once when the peer closes. Callbacks run
    /// in registration order; registering after close fires immediately.
    pub fn on_closed(&self, cb: impl FnOnce() + Send + 'static) {
        self.shared.register_on_closed(Box::new(cb));
    }

    /// Initiate shutdown; idempotent.
    pub fn close(&self) {
        self.shared.conn.close();
    }

    /// True once shutdown has been initiated.
    pub fn is_closed(&self) -> bool {
        self.shared.conn.is_closed()
    }

    /// Remote address, when the stream has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.conn.peer_addr()
    }

    /// Local address, when the stream has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.conn.local_addr()
    }
}

impl<C: Codec> PeerHooks for ClientPeer<C> {
    fn handle_message(&self, frame: Frame) {
        let channel = frame.channel;
        let waiter = {
            let mut table = self.table.lock();
            match table.channels.get_mut(channel as usize) {
                Some(slot) => slot.take(),
                None => None,
            }
        };

        match waiter {
            Some(tx) => {
                // send fails when the caller already timed out or abandoned
                // the future; the late response is discarded and the slot
                // stays freed.
                if tx.send(Ok(frame.payload)).is_err() {
                    tracing::trace!(channel, "response for completed call discarded");
                }
            }
            None => {
                tracing::debug!(channel, "response with no outstanding call dropped");
            }
        }

        self.flush_queue();
    }

    fn handle_closed(&self) {
        let (reserved, queued) = {
            let mut table = self.table.lock();
            let reserved: Vec<Responder> = table
                .channels
                .iter_mut()
                .filter_map(|slot| slot.take())
                .collect();
            let queued: Vec<Responder> = table.queue.drain(..).map(|call| call.tx).collect();
            (reserved, queued)
        };

        if !reserved.is_empty() || !queued.is_empty() {
            tracing::debug!(
                reserved = reserved.len(),
                queued = queued.len(),
                "failing outstanding calls on close"
            );
        }
        for tx in reserved.into_iter().chain(queued) {
            let _ = tx.send(Err(RpcError::Closed));
        }
    }
}

/// Outgoing-connection supervisor: owns a set of client peers and routes
/// calls to an open one, round-robin.
pub struct Client<C: Codec> {
    config: PeerConfig,
    peers: Mutex<Vec<Arc<ClientPeer<C>>>>,
    next: AtomicUsize,
}

impl<C: Codec> Client<C> {
    pub fn new(config: PeerConfig) -> Self {
        Self {
            config,
            peers: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    /// Establish a connection and adopt the resulting peer.
    pub async fn connect(
        &self,
        addr: impl ToSocketAddrs,
        codec: C,
    ) -> Result<Arc<ClientPeer<C>>, RpcError> {
        let peer = ClientPeer::connect(addr, codec, self.config.clone()).await?;
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }

    /// Issue a call on some open peer. Fails with [`RpcError::Closed`] when
    /// no peer is open.
    pub fn send_message(
        &self,
        request: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Bytes, RpcError>> + Send + 'static {
        let call = self
            .pick_peer()
            .map(|peer| peer.send_message(request, timeout));
        async move {
            match call {
                Some(fut) => fut.await,
                None => Err(RpcError::Closed),
            }
        }
    }

    /// Peers still open.
    pub fn peer_count(&self) -> usize {
        let mut peers = self.peers.lock();
        peers.retain(|p| !p.is_closed());
        peers.len()
    }

    fn pick_peer(&self) -> Option<Arc<ClientPeer<C>>> {
        let mut peers = self.peers.lock();
        peers.retain(|p| !p.is_closed());
        if peers.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % peers.len();
        Some(peers[idx].clone())
    }
}
