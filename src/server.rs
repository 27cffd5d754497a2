//! Server peer, the [`Service`] extension point, and the accept-loop
//! supervisor.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;

use crate::codec::{Codec, Frame};
use crate::connection::Connection;
use crate::error::RpcError;
use crate::peer::{run_pump, PeerHooks, PeerShared};

/// Application extension point for the server side.
pub trait Service: Send + Sync + 'static {
    /// Produce the response for one request.
    ///
    /// Every request must be answered: a request left without a response
    /// permanently occupies one of the calling peer's channels.
    fn handle_request(
        &self,
        request: Bytes,
        conn: Connection,
    ) -> impl Future<Output = Result<Bytes, RpcError>> + Send;

    /// Called once for each accepted connection.
    fn handle_connection(&self, conn: &Connection) {
        let _ = conn;
    }
}

/// Server endpoint of one connection: decodes requests, dispatches them to
/// the [`Service`], and writes each response back on the request's channel.
///
/// Dispatch is concurrent across channels; responses interleave in whatever
/// order the handlers finish.
pub struct ServerPeer<C: Codec, S: Service> {
    shared: Arc<PeerShared<C>>,
    service: Arc<S>,
}

impl<C: Codec, S: Service> ServerPeer<C, S> {
    /// Start a peer over any byte stream. Must be called from within a
    /// Tokio runtime.
    pub fn start<T>(stream: T, codec: C, service: Arc<S>) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::start_inner(stream, codec, service, None, None)
    }

    fn start_inner<T>(
        stream: T,
        codec: C,
        service: Arc<S>,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (conn, read_half, closed) = Connection::open(stream, peer_addr, local_addr);
        let peer = Arc::new(Self {
            shared: Arc::new(PeerShared::new(conn, codec)),
            service,
        });

        tokio::spawn(run_pump(peer.shared.clone(), peer.clone(), read_half, closed));

        peer
    }

    /// Handle to the underlying connection.
    pub fn connection(&self) -> Connection {
        self.shared.conn.clone()
    }

    /// Register a callback fired once when the peer closes.
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
}

impl<C: Codec, S: Service> PeerHooks for ServerPeer<C, S> {
    fn handle_message(&self, frame: Frame) {
        let channel = frame.channel;
        let service = self.service.clone();
        let shared = self.shared.clone();

        // Dispatch off the pump so a slow handler never stalls decoding of
        // other channels.
        tokio::spawn(async move {
            let conn = shared.conn.clone();
            match service.handle_request(frame.payload, conn.clone()).await {
                Ok(response) => {
                    let mut buf = BytesMut::new();
                    let encoded = shared.codec.lock().encode(&response, channel, &mut buf);
                    match encoded {
                        Ok(()) => {
                            if conn.write(buf.freeze()).is_err() {
                                tracing::debug!(channel, "connection closed before response write");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(channel, error = %e, "response encode failed");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(channel, error = %e, "request handler failed; no response sent");
                }
            }
        });
    }

    fn handle_closed(&self) {}
}

/// Accept-loop supervisor: binds a listener and wraps each accepted
/// connection in a [`ServerPeer`].
pub struct Server<C, S, F> {
    listener: TcpListener,
    make_codec: F,
    service: Arc<S>,
    shutdown: watch::Sender<bool>,
    // Subscribed at bind time so a shutdown signalled before run() starts
    // is still observed.
    shutdown_rx: watch::Receiver<bool>,
    _codec: std::marker::PhantomData<fn() -> C>,
}

impl<C, S, F> Server<C, S, F>
where
    C: Codec,
    S: Service,
    F: Fn() -> C + Send + 'static,
{
    /// Bind the listener. Resolves once the address is held.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        make_codec: F,
        service: S,
    ) -> Result<Self, RpcError> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        Ok(Self {
            listener,
            make_codec,
            service: Arc::new(service),
            shutdown,
            shutdown_rx,
            _codec: std::marker::PhantomData,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, RpcError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle that stops [`run`](Self::run) and closes accepted peers.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Accept until shut down.
    pub async fn run(self) -> Result<(), RpcError> {
        let mut shutdown = self.shutdown_rx.clone();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }
        let mut accepted: Vec<Connection> = Vec::new();

        loop {
            tokio::select! {
                incoming = self.listener.accept() => {
                    let (stream, peer_addr) = incoming?;
                    let _ = stream.set_nodelay(true);
                    let local_addr = stream.local_addr().ok();
                    tracing::debug!(%peer_addr, "accepted connection");

                    let peer = ServerPeer::start_inner(
                        stream,
                        (self.make_codec)(),
                        self.service.clone(),
                        Some(peer_addr),
                        local_addr,
                    );
                    let conn = peer.connection();
                    self.service.handle_connection(&conn);
                    accepted.retain(|c| !c.is_closed());
                    accepted.push(conn);
                }
                _ = shutdown.changed() => {
                    tracing::debug!(connections = accepted.len(), "server shutting down");
                    for conn in &accepted {
                        conn.close();
                    }
                    return Ok(());
                }
            }
        }
    }
}

/// Clonable signal that stops a running [`Server`].
#[derive(Clone)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}
