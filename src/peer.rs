//! Shared peer plumbing: the decode pump and the close lifecycle.
//!
//! Both peer flavors are compositions over [`PeerShared`]: a connection, a
//! codec behind a lock, and the `on_closed` callback registry. The pump owns
//! the read half, drives the codec, and hands each decoded frame to the
//! peer's [`PeerHooks`] implementation exactly once in decode order.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use crate::codec::{Codec, Frame};
use crate::connection::{Connection, PeerState};

const READ_BUF_SIZE: usize = 16 * 1024;

/// Polymorphic peer behavior: client and server differ only here.
pub(crate) trait PeerHooks: Send + Sync + 'static {
    /// One decoded frame, in decode order.
    fn handle_message(&self, frame: Frame);

    /// Connection teardown. Runs exactly once, before `on_closed` callbacks.
    fn handle_closed(&self);
}

/// Fields common to both peer flavors.
pub(crate) struct PeerShared<C: Codec> {
    pub(crate) conn: Connection,
    pub(crate) codec: Mutex<C>,
    on_closed: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl<C: Codec> PeerShared<C> {
    pub(crate) fn new(conn: Connection, codec: C) -> Self {
        Self {
            conn,
            codec: Mutex::new(codec),
            on_closed: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback fired once when the peer closes, in registration
    /// order. A callback registered after close runs immediately.
    ///
    /// The state check happens under the registry lock, the same lock
    /// [`fire_closed`](Self::fire_closed) holds while flipping to `Closed`
    /// and draining: a registration either lands before the drain or
    /// observes `Closed` and runs here.
    pub(crate) fn register_on_closed(&self, cb: Box<dyn FnOnce() + Send>) {
        {
            let mut callbacks = self.on_closed.lock();
            if self.conn.state() != PeerState::Closed {
                callbacks.push(cb);
                return;
            }
        }
        cb();
    }

    /// Enter the terminal state and fire registered callbacks.
    fn fire_closed(&self) {
        let callbacks = {
            let mut callbacks = self.on_closed.lock();
            self.conn.finalize_closed();
            std::mem::take(&mut *callbacks)
        };
        for cb in callbacks {
            cb();
        }
    }
}

/// Read-and-dispatch loop. Exits on EOF, read error, decode error, or the
/// close signal; all exits converge on the same teardown sequence.
pub(crate) async fn run_pump<C, H, R>(
    shared: Arc<PeerShared<C>>,
    hooks: Arc<H>,
    mut reader: R,
    mut closed: watch::Receiver<bool>,
) where
    C: Codec,
    H: PeerHooks,
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut frames = Vec::new();

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        tracing::trace!("peer sent EOF");
                        break;
                    }
                    Ok(n) => {
                        let decoded = shared.codec.lock().decode(&buf[..n], &mut frames);
                        if let Err(e) = decoded {
                            tracing::warn!(error = %e, "decode failed; closing connection");
                            break;
                        }
                        for frame in frames.drain(..) {
                            hooks.handle_message(frame);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "read failed");
                        break;
                    }
                }
            }
            _ = closed.changed() => break,
        }
    }

    shared.conn.close();
    hooks.handle_closed();
    shared.fire_closed();
}
