//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Once};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use muxrpc::{BinaryCodec, Channel, Codec, CodecError, Connection, Frame, RpcError, Service};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// Echoes every request.
pub struct Echo;

impl Service for Echo {
    fn handle_request(
        &self,
        request: Bytes,
        _conn: Connection,
    ) -> impl Future<Output = Result<Bytes, RpcError>> + Send {
        async move { Ok(request) }
    }
}

/// Answers "ping" with "pong".
pub struct Pong;

impl Service for Pong {
    fn handle_request(
        &self,
        request: Bytes,
        _conn: Connection,
    ) -> impl Future<Output = Result<Bytes, RpcError>> + Send {
        async move {
            assert_eq!(request.as_ref(), b"ping");
            Ok(Bytes::from_static(b"pong"))
        }
    }
}

/// A request captured by [`Gate`] together with its pending responder.
pub type GatedRequest = (Bytes, oneshot::Sender<Bytes>);

/// Hands every request to the test, which answers (or withholds) at will.
pub struct Gate {
    inbox: mpsc::UnboundedSender<GatedRequest>,
}

impl Gate {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GatedRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { inbox: tx }, rx)
    }
}

impl Service for Gate {
    fn handle_request(
        &self,
        request: Bytes,
        _conn: Connection,
    ) -> impl Future<Output = Result<Bytes, RpcError>> + Send {
        let (tx, rx) = oneshot::channel();
        let _ = self.inbox.send((request, tx));
        async move { rx.await.map_err(|_| RpcError::Closed) }
    }
}

/// Collect `n` gated requests, keyed by payload so spawn races don't matter.
pub async fn collect_requests(
    rx: &mut mpsc::UnboundedReceiver<GatedRequest>,
    n: usize,
) -> std::collections::HashMap<Vec<u8>, oneshot::Sender<Bytes>> {
    let mut held = std::collections::HashMap::new();
    for _ in 0..n {
        let (request, responder) = rx.recv().await.expect("gate dropped");
        held.insert(request.to_vec(), responder);
    }
    held
}

/// Delegating codec that records every eager encode with the unassigned
/// sentinel and every recode, so tests can observe the queued-call path.
pub struct SpyCodec {
    inner: BinaryCodec,
    pub unassigned_encodes: Arc<Mutex<usize>>,
    pub recoded: Arc<Mutex<Vec<Channel>>>,
}

impl SpyCodec {
    pub fn new() -> Self {
        Self {
            inner: BinaryCodec::new(),
            unassigned_encodes: Arc::new(Mutex::new(0)),
            recoded: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Codec for SpyCodec {
    fn encode(
        &mut self,
        payload: &[u8],
        channel: Channel,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError> {
        if channel == muxrpc::UNASSIGNED_CHANNEL {
            *self.unassigned_encodes.lock() += 1;
        }
        self.inner.encode(payload, channel, dst)
    }

    fn decode(&mut self, chunk: &[u8], out: &mut Vec<Frame>) -> Result<(), CodecError> {
        self.inner.decode(chunk, out)
    }

    fn recoding(&self) -> bool {
        true
    }

    fn recode(&self, frame: &mut BytesMut, channel: Channel) -> Result<(), CodecError> {
        self.inner.recode(frame, channel)?;
        self.recoded.lock().push(channel);
        Ok(())
    }
}

/// Same wire format as [`BinaryCodec`] but advertises no recoding, forcing
/// queued calls down the raw-payload path.
pub struct NonRecodingCodec(BinaryCodec);

impl NonRecodingCodec {
    pub fn new() -> Self {
        Self(BinaryCodec::new())
    }
}

impl Codec for NonRecodingCodec {
    fn encode(
        &mut self,
        payload: &[u8],
        channel: Channel,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError> {
        self.0.encode(payload, channel, dst)
    }

    fn decode(&mut self, chunk: &[u8], out: &mut Vec<Frame>) -> Result<(), CodecError> {
        self.0.decode(chunk, out)
    }
}
