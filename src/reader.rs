//! Reader task and the incoming frame queue
//!
//! The reader owns the byte source. It drives the parser and collector over
//! the bytes it reads and pushes every completed frame onto a bounded queue.
//! When the queue is full the reader suspends before pushing, which in turn
//! stops it from reading further bytes; this is the only backpressure path
//! from the application to the transport.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures_core::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::collector::FrameCollector;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::parser::FrameParser;
use crate::session::{Failure, Lifecycle, wait_terminated};

pub use tokio::sync::mpsc::error::TryRecvError;

/// Reader state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    /// Decoding a frame header
    Header,
    /// Collecting a frame payload
    Body,
    /// Source reached end of stream
    End,
}

/// Frame reader over an async byte source
pub(crate) struct WebSocketReader<R> {
    source: R,
    parser: FrameParser,
    collector: FrameCollector,
    state: ReaderState,
    read_buf: BytesMut,
    read_buffer_size: usize,
    failure: Arc<Failure>,
}

impl<R> WebSocketReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Create a reader; `expect_masked` is true on the server side
    pub(crate) fn new(
        source: R,
        max_frame_size: usize,
        expect_masked: bool,
        read_buffer_size: usize,
        failure: Arc<Failure>,
    ) -> Self {
        Self {
            source,
            parser: FrameParser::new(max_frame_size, expect_masked),
            collector: FrameCollector::new(),
            state: ReaderState::Header,
            read_buf: BytesMut::with_capacity(read_buffer_size),
            read_buffer_size,
            failure,
        }
    }

    /// Run until end of stream, a fatal error or termination
    ///
    /// End of stream and termination end the queue cleanly. A decode or I/O
    /// error is pushed as the queue's last item, and so is a sink failure
    /// reported by the writer. An I/O error of the source also becomes the
    /// cause the writer fails with.
    pub(crate) async fn run(
        mut self,
        tx: mpsc::Sender<Result<Frame>>,
        mut terminated: watch::Receiver<bool>,
    ) {
        debug!("reader started");

        let failure = self.failure.clone();
        let outcome = tokio::select! {
            biased;
            _ = wait_terminated(&mut terminated) => {
                debug!("reader cancelled");
                return;
            }
            cause = failure.wait() => {
                debug!(error = %cause, "stopping reader after sink failure");
                Err(cause)
            }
            outcome = self.read_loop(&tx) => outcome,
        };

        match outcome {
            Ok(()) => debug!("reader reached end of stream"),
            Err(e) => {
                if e.is_io() {
                    failure.set(e.clone());
                }
                warn!(error = %e, "reader failed");
                tokio::select! {
                    biased;
                    _ = wait_terminated(&mut terminated) => {}
                    _ = tx.send(Err(e)) => {}
                }
            }
        }
    }

    async fn read_loop(&mut self, tx: &mpsc::Sender<Result<Frame>>) -> Result<()> {
        loop {
            match self.state {
                ReaderState::Header => {
                    self.parser.feed(&mut self.read_buf)?;
                    if self.parser.body_ready() {
                        self.collector
                            .start(self.parser.length(), &mut self.read_buf);
                        self.state = ReaderState::Body;
                        continue;
                    }
                }
                ReaderState::Body => {
                    self.collector.handle(&mut self.read_buf);
                    if !self.collector.has_remaining() {
                        let payload = self.collector.take(self.parser.mask_key());
                        let frame = Frame::new(self.parser.opcode(), payload, self.parser.fin());
                        self.parser.body_complete();
                        self.state = ReaderState::Header;

                        trace!(
                            opcode = ?frame.opcode(),
                            fin = frame.is_final(),
                            len = frame.payload().len(),
                            "frame received"
                        );

                        if tx.send(Ok(frame)).await.is_err() {
                            // Nobody is listening any more
                            self.state = ReaderState::End;
                            return Ok(());
                        }
                        continue;
                    }
                }
                ReaderState::End => return Ok(()),
            }

            self.read_buf.reserve(self.read_buffer_size);
            let n = self.source.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                let mid_frame = self.state == ReaderState::Body
                    || !self.parser.is_idle()
                    || !self.read_buf.is_empty();
                self.state = ReaderState::End;
                if mid_frame {
                    return Err(Error::Io(Arc::new(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "end of stream inside a frame",
                    ))));
                }
                return Ok(());
            }
        }
    }
}

/// Receiving side of a session: a finite, non-restartable sequence of frames
///
/// Ends with `None` at end of stream or after cancellation. A fatal error is
/// delivered once as `Some(Err(_))` before the end.
///
/// The reader task is spawned on the first receive.
pub struct Incoming {
    rx: mpsc::Receiver<Result<Frame>>,
    lifecycle: Arc<Lifecycle>,
}

impl Incoming {
    pub(crate) fn new(rx: mpsc::Receiver<Result<Frame>>, lifecycle: Arc<Lifecycle>) -> Self {
        Self { rx, lifecycle }
    }

    /// Receive the next frame
    pub async fn recv(&mut self) -> Option<Result<Frame>> {
        self.lifecycle.start_reader();
        self.rx.recv().await
    }

    /// Receive a frame if one is ready, without waiting
    ///
    /// Fails with [`TryRecvError::Empty`] while nothing is buffered and with
    /// [`TryRecvError::Disconnected`] once the queue has ended.
    pub fn try_recv(&mut self) -> std::result::Result<Result<Frame>, TryRecvError> {
        self.lifecycle.start_reader();
        self.rx.try_recv()
    }

    /// Number of frames currently buffered
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether no frame is currently buffered
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Stream for Incoming {
    type Item = Result<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.lifecycle.start_reader();
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for Incoming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Incoming")
            .field("buffered", &self.rx.len())
            .finish()
    }
}
