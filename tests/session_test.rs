//! Session behavior over in-memory byte streams

mod common;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use sockudo_wire::{
    CloseReason, Config, Error, Frame, OpCode, Role, TryRecvError, WebSocketSession,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use common::{init_test_logging, wire};

#[tokio::test]
async fn test_client_server_round_trip() {
    init_test_logging();
    // Large enough to hold everything before the server starts reading
    let (a, b) = tokio::io::duplex(256 * 1024);
    let client = WebSocketSession::client(a, Config::default());
    let mut server = WebSocketSession::server(b, Config::default());

    assert!(client.masking());
    assert!(!server.masking());

    client.send(Frame::text("hello")).await.unwrap();
    client.send(Frame::binary(vec![1u8, 2, 3])).await.unwrap();
    client.send(Frame::binary(vec![7u8; 70_000])).await.unwrap();
    client.flush().await.unwrap();

    assert_eq!(server.recv().await.unwrap().unwrap(), Frame::text("hello"));
    assert_eq!(server.recv().await.unwrap().unwrap(), Frame::binary(vec![1u8, 2, 3]));
    let big = server.recv().await.unwrap().unwrap();
    assert_eq!(big.payload().len(), 70_000);

    // And back, unmasked
    server.send(Frame::text("world")).await.unwrap();
    server.flush().await.unwrap();
    let (mut incoming, _outgoing, _terminate) = client.split();
    assert_eq!(incoming.recv().await.unwrap().unwrap(), Frame::text("world"));
}

#[tokio::test]
async fn test_close_once() {
    init_test_logging();
    let (a, b) = tokio::io::duplex(4096);
    let client = WebSocketSession::client(a, Config::default());
    let mut server = WebSocketSession::server(b, Config::default());

    client.close(CloseReason::normal()).await.unwrap();
    client
        .close(CloseReason::new(CloseReason::GOING_AWAY, "again"))
        .await
        .unwrap();
    client
        .send(Frame::close(&CloseReason::new(CloseReason::GOING_AWAY, "third")))
        .await
        .unwrap();
    assert!(matches!(
        client.send(Frame::text("late")).await,
        Err(Error::ConnectionClosed)
    ));

    let close = server.recv().await.unwrap().unwrap();
    assert_eq!(close.opcode(), OpCode::Close);
    assert_eq!(close.close_reason().unwrap().unwrap().code, CloseReason::NORMAL);

    // The client shut its half down after the close frame
    assert!(server.recv().await.is_none());
}

#[tokio::test]
async fn test_fragments_delivered_raw() {
    init_test_logging();
    let (a, b) = tokio::io::duplex(4096);
    let client = WebSocketSession::client(a, Config::default());
    let mut server = WebSocketSession::server(b, Config::default());

    client
        .send(Frame::new(OpCode::Text, Bytes::from_static(b"He"), false))
        .await
        .unwrap();
    client.send(Frame::ping("p")).await.unwrap();
    client.send(Frame::continuation("ll", false)).await.unwrap();
    client.send(Frame::pong("q")).await.unwrap();
    client.send(Frame::continuation("o", true)).await.unwrap();
    client.flush().await.unwrap();

    let mut received = Vec::new();
    for _ in 0..5 {
        received.push(server.recv().await.unwrap().unwrap());
    }

    let opcodes: Vec<OpCode> = received.iter().map(|f| f.opcode()).collect();
    assert_eq!(
        opcodes,
        vec![OpCode::Text, OpCode::Ping, OpCode::Continuation, OpCode::Pong, OpCode::Continuation]
    );
    let fins: Vec<bool> = received.iter().map(|f| f.is_final()).collect();
    assert_eq!(fins, vec![false, true, false, true, true]);

    let text: Vec<u8> = received
        .iter()
        .filter(|f| f.opcode().is_data())
        .flat_map(|f| f.payload().to_vec())
        .collect();
    assert_eq!(text, b"Hello");
}

#[tokio::test]
async fn test_server_rejects_unmasked_frames() {
    init_test_logging();
    let (mut peer, stream) = tokio::io::duplex(4096);
    let mut server = WebSocketSession::server(stream, Config::default());

    peer.write_all(&wire(&[Frame::text("plain")], None))
        .await
        .unwrap();

    assert!(matches!(server.recv().await, Some(Err(Error::Protocol(_)))));
    assert!(server.recv().await.is_none());
}

#[tokio::test]
async fn test_client_rejects_masked_frames() {
    init_test_logging();
    let (mut peer, stream) = tokio::io::duplex(4096);
    let mut client = WebSocketSession::client(stream, Config::default());

    peer.write_all(&wire(&[Frame::text("hidden")], Some([1, 2, 3, 4])))
        .await
        .unwrap();

    assert!(matches!(client.recv().await, Some(Err(Error::Protocol(_)))));
}

#[tokio::test]
async fn test_frame_too_big() {
    init_test_logging();
    let (mut peer, stream) = tokio::io::duplex(4096);
    let config = Config::builder().max_frame_size(16).build();
    let mut client = WebSocketSession::client(stream, config);
    assert_eq!(client.max_frame_size(), 16);

    peer.write_all(&wire(&[Frame::binary(vec![0u8; 17])], None))
        .await
        .unwrap();

    assert!(matches!(
        client.recv().await,
        Some(Err(Error::FrameTooBig { size: 17, max: 16 }))
    ));
    assert!(client.recv().await.is_none());
}

#[tokio::test]
async fn test_end_of_stream_is_not_an_error() {
    init_test_logging();
    let (peer, stream) = tokio::io::duplex(4096);
    let mut client = WebSocketSession::client(stream, Config::default());
    drop(peer);
    assert!(client.recv().await.is_none());
}

#[tokio::test]
async fn test_try_recv_tells_empty_from_ended() {
    init_test_logging();
    let (mut peer, stream) = tokio::io::duplex(4096);
    let mut client = WebSocketSession::client(stream, Config::default());

    assert!(matches!(client.incoming().try_recv(), Err(TryRecvError::Empty)));

    peer.write_all(&wire(&[Frame::text("last")], None))
        .await
        .unwrap();
    drop(peer);

    // The frame stays receivable after the source ended
    assert_eq!(client.recv().await.unwrap().unwrap(), Frame::text("last"));
    assert!(client.recv().await.is_none());
    assert!(matches!(
        client.incoming().try_recv(),
        Err(TryRecvError::Disconnected)
    ));
}

/// Sink that fails every write the way a reset connection does
struct ResetSink;

impl AsyncWrite for ResetSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "sink reset")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn is_reset(error: &Error) -> bool {
    matches!(error, Error::Io(e) if e.kind() == io::ErrorKind::ConnectionReset)
}

#[tokio::test]
async fn test_sink_failure_closes_both_queues() {
    init_test_logging();
    let (_peer, source) = tokio::io::duplex(4096);
    let mut session = WebSocketSession::new(source, ResetSink, Role::Server, Config::default());

    session.send(Frame::text("doomed")).await.unwrap();
    let flushed = session.flush().await.unwrap_err();
    assert!(is_reset(&flushed), "flush failed with {flushed:?}");

    let sent = session.send(Frame::text("after")).await.unwrap_err();
    assert!(is_reset(&sent), "send failed with {sent:?}");
    let flushed = session.flush().await.unwrap_err();
    assert!(is_reset(&flushed), "second flush failed with {flushed:?}");

    // The source is still open, yet the incoming queue ends with the cause
    let received = tokio::time::timeout(Duration::from_secs(5), session.recv())
        .await
        .unwrap();
    match received {
        Some(Err(e)) => assert!(is_reset(&e), "incoming ended with {e:?}"),
        other => panic!("expected the sink failure, got {other:?}"),
    }
    assert!(session.recv().await.is_none());
}

/// Source that fails its first read
struct ResetSource;

impl AsyncRead for ResetSource {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "source reset")))
    }
}

#[tokio::test]
async fn test_source_failure_fails_senders() {
    init_test_logging();
    let (sink, _peer) = tokio::io::duplex(4096);
    let mut session = WebSocketSession::new(ResetSource, sink, Role::Client, Config::default());

    match session.recv().await {
        Some(Err(e)) => assert!(is_reset(&e), "incoming ended with {e:?}"),
        other => panic!("expected the source failure, got {other:?}"),
    }

    let sent = session.send(Frame::text("after")).await.unwrap_err();
    assert!(is_reset(&sent), "send failed with {sent:?}");
    let flushed = session.flush().await.unwrap_err();
    assert!(is_reset(&flushed), "flush failed with {flushed:?}");
}

#[tokio::test]
async fn test_terminate_fails_senders() {
    init_test_logging();
    let (_peer, stream) = tokio::io::duplex(4096);
    let mut session = WebSocketSession::from_stream(stream, Role::Server, Config::default());
    let outgoing = session.outgoing();

    session.terminate();
    assert!(session.is_terminated());
    assert!(session.recv().await.is_none());

    // The writer is gone: sends fail instead of blocking
    tokio::time::timeout(Duration::from_secs(5), async {
        while outgoing.send(Frame::text("x")).await.is_ok() {}
    })
    .await
    .unwrap();
    assert!(outgoing.flush().await.is_err());
}

/// Infinite source serving one small binary frame per read
struct CountingSource {
    reads: Arc<AtomicUsize>,
}

impl AsyncRead for CountingSource {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        buf.put_slice(&[0x82, 0x01, n as u8]);
        Poll::Ready(Ok(()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_backpressure_suspends_reader() {
    init_test_logging();
    let reads = Arc::new(AtomicUsize::new(0));
    let source = CountingSource {
        reads: reads.clone(),
    };
    let config = Config::builder().channel_capacity(8).build();
    let mut session = WebSocketSession::new(source, tokio::io::sink(), Role::Client, config);

    // Nothing is read before anyone receives
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(reads.load(Ordering::SeqCst), 0);

    assert!(matches!(session.incoming().try_recv(), Err(TryRecvError::Empty)));
    tokio::time::sleep(Duration::from_millis(10)).await;
    // Eight queued frames plus one waiting to be pushed
    assert_eq!(reads.load(Ordering::SeqCst), 9);
    assert_eq!(session.incoming().len(), 8);

    let first = session.recv().await.unwrap().unwrap();
    assert_eq!(&first.payload()[..], &[0]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(reads.load(Ordering::SeqCst), 10);
    assert_eq!(session.incoming().len(), 8);
}
