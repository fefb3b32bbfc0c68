//! In-Memory Echo
//!
//! Runs a keepalive echo server and a raw client over a `tokio::io::duplex`
//! pipe, so no handshake or socket is needed.
//! Run with: RUST_LOG=debug cargo run --example duplex_echo

use std::time::Duration;

use tracing_subscriber::EnvFilter;

use sockudo_wire::error::Result;
use sockudo_wire::{CloseReason, Config, DefaultWebSocketSession, Frame, OpCode, WebSocketSession};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    // Echo server with a pinger
    let config = Config::builder()
        .ping_interval(Duration::from_secs(5))
        .timeout(Duration::from_secs(2))
        .build();
    let mut server = DefaultWebSocketSession::new(WebSocketSession::server(server_io, config));
    server.start(Vec::new())?;

    let server_task = tokio::spawn(async move {
        while let Some(frame) = server.recv().await {
            match frame {
                Ok(frame) => {
                    if let Err(e) = server.send(frame).await {
                        eprintln!("Echo error: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("Receive error: {}", e);
                    break;
                }
            }
        }
        server.close_reason().await
    });

    // Raw client: sees every frame, including the close echo
    let mut client = WebSocketSession::client(client_io, Config::default());
    for text in ["hello", "sockudo", "wire"] {
        client.send(Frame::text(text)).await?;
    }
    client.flush().await?;

    while let Some(frame) = client.recv().await {
        let frame = frame?;
        match frame.opcode() {
            OpCode::Text => {
                println!("echo: {}", frame.as_text()?);
                if frame.payload().as_ref() == b"wire" {
                    client.close(CloseReason::normal()).await?;
                }
            }
            OpCode::Close => {
                println!("server closed with {:?}", frame.close_reason()?);
                break;
            }
            other => println!("control frame: {:?}", other),
        }
    }

    let reason = server_task.await.ok().flatten();
    println!("server close reason: {:?}", reason);
    Ok(())
}
