//! End-to-end scenarios: a client peer and a server peer joined by an
//! in-process duplex stream.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use muxrpc::{BinaryCodec, Channel, ClientPeer, PeerConfig, RpcError, ServerPeer};

use common::{collect_requests, init_tracing, Echo, Gate, Pong, SpyCodec};

fn duplex_pair() -> (tokio::io::DuplexStream, tokio::io::DuplexStream) {
    tokio::io::duplex(64 * 1024)
}

#[tokio::test]
async fn basic_round_trip_uses_channel_zero() {
    init_tracing();
    let (a, b) = duplex_pair();
    let client = ClientPeer::start(a, BinaryCodec::new(), PeerConfig::new().max_channels(4)).unwrap();
    let _server = ServerPeer::start(b, BinaryCodec::new(), Arc::new(Pong));

    let response = client.send_message("ping", None);
    assert_eq!(client.reserved_channels(), vec![0]);

    assert_eq!(response.await.unwrap().as_ref(), b"pong");
    assert_eq!(client.reserved_channels(), Vec::<Channel>::new());
}

#[tokio::test]
async fn multiplexing_with_out_of_order_responses() {
    init_tracing();
    let (a, b) = duplex_pair();
    let client = ClientPeer::start(a, BinaryCodec::new(), PeerConfig::new().max_channels(2)).unwrap();
    let (gate, mut requests) = Gate::new();
    let _server = ServerPeer::start(b, BinaryCodec::new(), Arc::new(gate));

    let fut_a = client.send_message("a", None);
    let fut_b = client.send_message("b", None);
    let fut_c = client.send_message("c", None);

    // "a" and "b" hold the two channels; "c" waits.
    assert_eq!(client.reserved_channels(), vec![0, 1]);
    assert_eq!(client.queued_len(), 1);

    let mut held = collect_requests(&mut requests, 2).await;

    // Answer "b" first: responses need not follow request order.
    held.remove(b"b".as_slice()).unwrap().send(Bytes::from_static(b"B")).unwrap();
    assert_eq!(fut_b.await.unwrap().as_ref(), b"B");

    // The freed channel admits "c".
    let mut held_c = collect_requests(&mut requests, 1).await;
    assert_eq!(client.queued_len(), 0);

    held.remove(b"a".as_slice()).unwrap().send(Bytes::from_static(b"A")).unwrap();
    held_c.remove(b"c".as_slice()).unwrap().send(Bytes::from_static(b"C")).unwrap();

    assert_eq!(fut_a.await.unwrap().as_ref(), b"A");
    assert_eq!(fut_c.await.unwrap().as_ref(), b"C");
    assert_eq!(client.reserved_channels(), Vec::<Channel>::new());
}

#[tokio::test]
async fn timeout_fires_while_queued_call_stays_pending() {
    init_tracing();
    let (a, b) = duplex_pair();
    let client = ClientPeer::start(a, BinaryCodec::new(), PeerConfig::new().max_channels(1)).unwrap();
    let (gate, mut requests) = Gate::new();
    let _server = ServerPeer::start(b, BinaryCodec::new(), Arc::new(gate));

    let started = Instant::now();
    let fut_slow = client.send_message("slow", Some(Duration::from_millis(50)));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let fut_second = client.send_message("second", None);
    assert_eq!(client.queued_len(), 1);

    assert!(matches!(fut_slow.await, Err(RpcError::TimedOut)));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(40), "fired at {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "fired at {elapsed:?}");

    // The channel is still reserved by the timed-out call, so the second
    // call stays queued and pending.
    assert_eq!(client.reserved_channels(), vec![0]);
    assert_eq!(client.queued_len(), 1);

    tokio::pin!(fut_second);
    assert!(
        tokio::time::timeout(Duration::from_millis(50), &mut fut_second)
            .await
            .is_err(),
        "second call should still be pending"
    );

    // Server withheld both; release the first (late, discarded) and then
    // the second drains and completes.
    let mut held = collect_requests(&mut requests, 1).await;
    held.remove(b"slow".as_slice()).unwrap().send(Bytes::from_static(b"late")).unwrap();

    let mut held = collect_requests(&mut requests, 1).await;
    held.remove(b"second".as_slice()).unwrap().send(Bytes::from_static(b"done")).unwrap();
    assert_eq!(fut_second.await.unwrap().as_ref(), b"done");
}

#[tokio::test]
async fn remote_close_fails_all_outstanding_calls() {
    init_tracing();
    let (a, b) = duplex_pair();
    let client = ClientPeer::start(a, BinaryCodec::new(), PeerConfig::new().max_channels(4)).unwrap();
    let (gate, mut requests) = Gate::new();
    let server = ServerPeer::start(b, BinaryCodec::new(), Arc::new(gate));

    let fut_0 = client.send_message("r0", None);
    let fut_1 = client.send_message("r1", None);
    let fut_2 = client.send_message("r2", None);
    assert_eq!(client.reserved_channels(), vec![0, 1, 2]);

    // Hold the requests unanswered, then drop the connection server-side.
    let _held = collect_requests(&mut requests, 3).await;
    let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
    let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let fired2 = fired.clone();
    client.on_closed(move || {
        fired2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let _ = closed_tx.send(());
    });

    server.close();

    assert!(matches!(fut_0.await, Err(RpcError::Closed)));
    assert!(matches!(fut_1.await, Err(RpcError::Closed)));
    assert!(matches!(fut_2.await, Err(RpcError::Closed)));

    closed_rx.await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(client.is_closed());
}

#[tokio::test]
async fn recoding_codec_preencodes_queued_calls() {
    init_tracing();
    let (a, b) = duplex_pair();
    let spy = SpyCodec::new();
    let unassigned_encodes = spy.unassigned_encodes.clone();
    let recoded = spy.recoded.clone();

    let client = ClientPeer::start(a, spy, PeerConfig::new().max_channels(1)).unwrap();
    let _server = ServerPeer::start(b, BinaryCodec::new(), Arc::new(Echo));

    let fut_first = client.send_message("first", None);
    let fut_second = client.send_message("second", None);

    // The second call was eager-encoded with the placeholder channel at
    // enqueue time.
    assert_eq!(*unassigned_encodes.lock(), 1);
    assert!(recoded.lock().is_empty());

    assert_eq!(fut_first.await.unwrap().as_ref(), b"first");
    assert_eq!(fut_second.await.unwrap().as_ref(), b"second");

    // Flush rewrote the placeholder to the assigned channel, and the server
    // decoded the same logical message.
    assert_eq!(*recoded.lock(), vec![0]);
}

#[tokio::test]
async fn non_recoding_codec_encodes_queued_calls_at_flush() {
    init_tracing();
    let (a, b) = duplex_pair();
    let client = ClientPeer::start(
        a,
        common::NonRecodingCodec::new(),
        PeerConfig::new().max_channels(1),
    )
    .unwrap();
    let _server = ServerPeer::start(b, BinaryCodec::new(), Arc::new(Echo));

    let fut_first = client.send_message("first", None);
    let fut_second = client.send_message("second", None);
    assert_eq!(client.queued_len(), 1);

    assert_eq!(fut_first.await.unwrap().as_ref(), b"first");
    assert_eq!(fut_second.await.unwrap().as_ref(), b"second");
}

#[tokio::test]
async fn budget_overflow_queues_and_drains_fifo() {
    init_tracing();
    let (a, b) = duplex_pair();
    let client = ClientPeer::start(a, BinaryCodec::new(), PeerConfig::new().max_channels(2)).unwrap();
    let (gate, mut requests) = Gate::new();
    let _server = ServerPeer::start(b, BinaryCodec::new(), Arc::new(gate));

    let futures: Vec<_> = (0..5)
        .map(|i| client.send_message(format!("r{i}"), None))
        .collect();

    // Exactly max_channels reserved, the remaining three queued.
    assert_eq!(client.reserved_channels(), vec![0, 1]);
    assert_eq!(client.queued_len(), 3);

    // Answering one request at a time releases queued calls in submission
    // order: r2, then r3, then r4.
    let mut held = collect_requests(&mut requests, 2).await;
    for i in 0..5usize {
        let key = format!("r{i}").into_bytes();
        held.remove(&key)
            .unwrap_or_else(|| panic!("request r{i} not yet released"))
            .send(Bytes::from(format!("ok{i}")))
            .unwrap();
        if i + 2 < 5 {
            let next = collect_requests(&mut requests, 1).await;
            held.extend(next);
        }
    }

    for (i, fut) in futures.into_iter().enumerate() {
        assert_eq!(fut.await.unwrap(), Bytes::from(format!("ok{i}")));
    }
    assert_eq!(client.queued_len(), 0);
    assert_eq!(client.reserved_channels(), Vec::<Channel>::new());
}
