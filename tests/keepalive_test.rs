//! Default session: keepalive, close echo, reassembly and transforms

mod common;

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use sockudo_wire::{
    CloseReason, Config, DefaultWebSocketSession, Error, Frame, FrameTransform, OpCode, Result,
    TryRecvError, WebSocketSession,
};

use common::init_test_logging;
use tokio::time::Instant;

fn pair(server_config: Config) -> (WebSocketSession, DefaultWebSocketSession) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = WebSocketSession::client(a, Config::default());
    let server = DefaultWebSocketSession::new(WebSocketSession::server(b, server_config));
    (client, server)
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_terminates_without_reason() {
    init_test_logging();
    let config = Config::builder()
        .ping_interval(Duration::from_secs(1))
        .timeout(Duration::from_secs(2))
        .build();
    // The raw client never reads, so pings go unanswered
    let (_client, mut server) = pair(config);
    server.start(Vec::new()).unwrap();

    assert_eq!(server.close_reason().await, None);
    assert!(server.is_terminated());
    assert!(server.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_pongs_keep_session_alive() {
    init_test_logging();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let mut client = DefaultWebSocketSession::new(WebSocketSession::client(a, Config::default()));
    client.start(Vec::new()).unwrap();

    let config = Config::builder()
        .ping_interval(Duration::from_secs(1))
        .timeout(Duration::from_millis(500))
        .build();
    let mut server = DefaultWebSocketSession::new(WebSocketSession::server(b, config));
    server.start(Vec::new()).unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!server.is_terminated());
    assert!(!client.is_terminated());

    // Pings and pongs never reach the application
    assert!(matches!(client.incoming().try_recv(), Err(TryRecvError::Empty)));
    assert!(matches!(server.incoming().try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_ping_interval_enabled_at_runtime() {
    init_test_logging();
    let (_client, mut server) = pair(Config::default());
    server.start(Vec::new()).unwrap();
    assert_eq!(server.ping_interval(), None);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!server.is_terminated());

    let handle = server.handle();
    handle.set_timeout(Duration::from_secs(2));
    handle.set_ping_interval(Some(Duration::from_secs(1)));
    let started = Instant::now();

    // First ping after one second, then two seconds of silence
    assert_eq!(server.close_reason().await, None);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(server.is_terminated());
}

#[tokio::test(start_paused = true)]
async fn test_ping_interval_disabled_at_runtime() {
    init_test_logging();
    let config = Config::builder()
        .ping_interval(Duration::from_secs(1))
        .timeout(Duration::from_secs(2))
        .build();
    let (_client, mut server) = pair(config);
    server.start(Vec::new()).unwrap();
    server.set_ping_interval(None);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!server.is_terminated());
}

#[tokio::test(start_paused = true)]
async fn test_shorter_timeout_restarts_pinger() {
    init_test_logging();
    let config = Config::builder()
        .ping_interval(Duration::from_secs(1))
        .timeout(Duration::from_secs(60))
        .build();
    let (_client, mut server) = pair(config);
    server.start(Vec::new()).unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!server.is_terminated());

    server.set_timeout(Duration::from_secs(2));
    let started = Instant::now();
    assert_eq!(server.close_reason().await, None);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "terminated after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(60), "terminated after {elapsed:?}");
}

#[tokio::test]
async fn test_rejected_close_leaves_session_open() {
    init_test_logging();
    let (mut client, mut server) = pair(Config::default());
    server.start(Vec::new()).unwrap();

    // Does not fit in a control frame
    let oversized = CloseReason::new(CloseReason::NORMAL, "x".repeat(200));
    assert!(matches!(server.close(oversized).await, Err(Error::Protocol(_))));

    server.send(Frame::text("still open")).await.unwrap();
    server.close(CloseReason::normal()).await.unwrap();

    assert_eq!(client.recv().await.unwrap().unwrap(), Frame::text("still open"));
    let close = client.recv().await.unwrap().unwrap();
    assert_eq!(close.close_reason().unwrap(), Some(CloseReason::normal()));
    assert_eq!(server.close_reason().await, Some(CloseReason::normal()));
}

#[tokio::test]
async fn test_peer_close_is_echoed() {
    init_test_logging();
    let (mut client, mut server) = pair(Config::default());
    server.start(Vec::new()).unwrap();

    client
        .close(CloseReason::new(CloseReason::GOING_AWAY, "bye"))
        .await
        .unwrap();

    let echo = client.recv().await.unwrap().unwrap();
    assert_eq!(echo.opcode(), OpCode::Close);
    let reason = echo.close_reason().unwrap().unwrap();
    assert_eq!(reason.code, CloseReason::GOING_AWAY);
    assert_eq!(reason.message, "bye");

    assert!(server.recv().await.is_none());
    assert_eq!(server.close_reason().await, Some(reason));
}

#[tokio::test]
async fn test_empty_close_echoed_as_normal() {
    init_test_logging();
    let (mut client, mut server) = pair(Config::default());
    server.start(Vec::new()).unwrap();

    client.send(Frame::close_empty()).await.unwrap();
    client.flush().await.unwrap();

    let echo = client.recv().await.unwrap().unwrap();
    assert_eq!(
        echo.close_reason().unwrap(),
        Some(CloseReason::new(CloseReason::NORMAL, "OK"))
    );
    assert!(server.recv().await.is_none());
}

#[tokio::test]
async fn test_local_close_wins() {
    init_test_logging();
    let (mut client, mut server) = pair(Config::default());
    server.start(Vec::new()).unwrap();

    server.going_away("shutting down").await.unwrap();
    let close = client.recv().await.unwrap().unwrap();
    assert_eq!(
        close.close_reason().unwrap(),
        Some(CloseReason::new(CloseReason::GOING_AWAY, "shutting down"))
    );

    // The peer answers with a different reason; the first one sticks
    client
        .close(CloseReason::new(CloseReason::NORMAL, "ack"))
        .await
        .unwrap();
    assert!(server.recv().await.is_none());
    assert_eq!(
        server.close_reason().await.map(|r| r.code),
        Some(CloseReason::GOING_AWAY)
    );
}

#[tokio::test]
async fn test_ping_answered_and_message_reassembled() {
    init_test_logging();
    let (mut client, mut server) = pair(Config::default());
    server.start(Vec::new()).unwrap();

    client
        .send(Frame::new(OpCode::Text, Bytes::from_static(b"Hel"), false))
        .await
        .unwrap();
    client.send(Frame::ping("are you there")).await.unwrap();
    client.send(Frame::continuation("lo", true)).await.unwrap();
    client.flush().await.unwrap();

    let message = server.recv().await.unwrap().unwrap();
    assert_eq!(message, Frame::text("Hello"));

    let pong = client.recv().await.unwrap().unwrap();
    assert_eq!(pong, Frame::pong("are you there"));
}

#[tokio::test]
async fn test_pings_delivered_without_auto_pong() {
    init_test_logging();
    let (mut client, mut server) = pair(Config::builder().auto_pong(false).build());
    server.start(Vec::new()).unwrap();

    client.send(Frame::ping("manual")).await.unwrap();
    client.flush().await.unwrap();

    assert_eq!(server.recv().await.unwrap().unwrap(), Frame::ping("manual"));
    server.send(Frame::pong("manual")).await.unwrap();
    server.flush().await.unwrap();
    assert_eq!(client.recv().await.unwrap().unwrap(), Frame::pong("manual"));
}

#[tokio::test]
async fn test_reassembled_message_too_big() {
    init_test_logging();
    let (mut client, mut server) = pair(Config::builder().max_frame_size(8).build());
    server.start(Vec::new()).unwrap();

    client
        .send(Frame::new(OpCode::Binary, Bytes::from(vec![1u8; 5]), false))
        .await
        .unwrap();
    client
        .send(Frame::continuation(vec![2u8; 5], true))
        .await
        .unwrap();
    client.flush().await.unwrap();

    assert!(matches!(
        server.recv().await,
        Some(Err(Error::FrameTooBig { size: 10, max: 8 }))
    ));
    assert!(server.recv().await.is_none());

    let close = client.recv().await.unwrap().unwrap();
    assert_eq!(close.close_reason().unwrap().unwrap().code, CloseReason::TOO_BIG);
    assert_eq!(
        server.close_reason().await.map(|r| r.code),
        Some(CloseReason::TOO_BIG)
    );
}

#[tokio::test]
async fn test_terminate_resolves_none() {
    init_test_logging();
    let (_client, mut server) = pair(Config::default());
    server.start(Vec::new()).unwrap();
    let handle = server.handle();

    handle.terminate();
    assert!(handle.is_terminated());
    assert_eq!(handle.close_reason().await, None);
    assert!(server.recv().await.is_none());
}

/// Reverses payload bytes on the way out and back on the way in
struct Reverse;

impl FrameTransform for Reverse {
    fn name(&self) -> &str {
        "reverse"
    }

    fn transform_incoming(&self, frame: Frame) -> Result<Frame> {
        self.transform_outgoing(frame)
    }

    fn transform_outgoing(&self, frame: Frame) -> Result<Frame> {
        let mut payload = BytesMut::from(&frame.payload()[..]);
        payload.reverse();
        Ok(Frame::new(frame.opcode(), payload.freeze(), frame.is_final()))
    }
}

#[tokio::test]
async fn test_transforms_apply_to_data_frames() {
    init_test_logging();
    let (mut client, mut server) = pair(Config::default());
    server
        .start(vec![Box::new(Reverse) as Box<dyn FrameTransform>])
        .unwrap();
    assert!(matches!(server.start(Vec::new()), Err(Error::AlreadyStarted)));

    client.send(Frame::text("olleh")).await.unwrap();
    client.flush().await.unwrap();
    assert_eq!(server.recv().await.unwrap().unwrap(), Frame::text("hello"));

    let handle = server.handle();
    handle.send(Frame::binary(vec![1u8, 2, 3])).await.unwrap();
    handle.send(Frame::ping("abc")).await.unwrap();
    handle.flush().await.unwrap();

    assert_eq!(client.recv().await.unwrap().unwrap(), Frame::binary(vec![3u8, 2, 1]));
    // Control frames bypass transforms
    assert_eq!(client.recv().await.unwrap().unwrap(), Frame::ping("abc"));
}
