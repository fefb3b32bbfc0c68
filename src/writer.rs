//! Writer task and the outgoing frame queue
//!
//! The writer owns the byte sink. It drains a bounded queue of frames and
//! flush requests, coalesces whatever is immediately available through the
//! serializer, and writes the result to the sink. Once a close frame has
//! been flushed the loop ends: the queue is closed, everything still queued
//! is discarded (flush requests are acknowledged) and later sends fail
//! instead of blocking. A sink error, or a source error seen by the reader,
//! ends the loop the same way with that error as the cause.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::frame::{Frame, OpCode};
use crate::serializer::Serializer;
use crate::session::{Failure, Lifecycle, wait_terminated};

/// Item accepted by the writer queue
#[derive(Debug)]
pub(crate) enum WriterItem {
    /// Frame to serialize
    Frame(Frame),
    /// Request to flush everything queued before it
    Flush(oneshot::Sender<Result<()>>),
}

/// State shared by every [`Outgoing`] handle and the writer task
#[derive(Debug)]
pub(crate) struct OutgoingState {
    /// Byte-stream failure shared with the reader
    failure: Arc<Failure>,
    /// A close frame was accepted into the queue
    close_sent: AtomicBool,
    /// The close frame reached the sink
    close_flushed: AtomicBool,
}

impl OutgoingState {
    pub(crate) fn new(failure: Arc<Failure>) -> Self {
        Self {
            failure,
            close_sent: AtomicBool::new(false),
            close_flushed: AtomicBool::new(false),
        }
    }
}

/// Sending side of a session
///
/// Cloneable; every clone feeds the same queue. Frames are written in the
/// order their `send` calls completed.
#[derive(Clone)]
pub struct Outgoing {
    tx: mpsc::Sender<WriterItem>,
    state: Arc<OutgoingState>,
    _lifecycle: Arc<Lifecycle>,
}

impl Outgoing {
    pub(crate) fn new(
        tx: mpsc::Sender<WriterItem>,
        state: Arc<OutgoingState>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            tx,
            state,
            _lifecycle: lifecycle,
        }
    }

    /// Enqueue a frame, waiting while the queue is full
    ///
    /// Fails once the writer has stopped, with the I/O error that stopped it
    /// if there was one. A second close frame is dropped silently so at most
    /// one ever reaches the wire.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        frame.validate()?;
        if let Some(cause) = self.state.failure.get() {
            return Err(cause.clone());
        }

        let is_close = frame.opcode() == OpCode::Close;
        if is_close && self.state.close_sent.swap(true, Ordering::AcqRel) {
            trace!("close already sent, dropping close frame");
            return Ok(());
        }

        if self.tx.send(WriterItem::Frame(frame)).await.is_err() {
            if is_close {
                self.state.close_sent.store(false, Ordering::Release);
            }
            return Err(self.closed_error());
        }
        Ok(())
    }

    /// Wait until everything enqueued so far has been written and flushed
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterItem::Flush(ack_tx)).await.is_err() {
            return self.closed_flush_result();
        }
        match ack_rx.await {
            Ok(result) => result,
            Err(_) => self.closed_flush_result(),
        }
    }

    /// Whether a close frame was accepted into the queue
    pub fn is_close_sent(&self) -> bool {
        self.state.close_sent.load(Ordering::Acquire)
    }

    /// Whether the writer has stopped accepting frames
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn closed_flush_result(&self) -> Result<()> {
        // After the close frame reached the sink nothing else can be pending
        if self.state.close_flushed.load(Ordering::Acquire) {
            return Ok(());
        }
        Err(self.closed_error())
    }

    fn closed_error(&self) -> Error {
        self.state
            .failure
            .get()
            .cloned()
            .unwrap_or(Error::ConnectionClosed)
    }
}

impl std::fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outgoing")
            .field("closed", &self.tx.is_closed())
            .field("close_sent", &self.is_close_sent())
            .finish()
    }
}

/// How the write loop ended
enum Outcome {
    /// Close frame written and flushed
    CloseFlushed,
    /// Every sender is gone
    QueueClosed,
    /// Sink failure
    Failed(Error),
}

/// Frame writer over an async byte sink
pub(crate) struct WebSocketWriter<W> {
    sink: W,
    serializer: Serializer,
    write_buf: BytesMut,
    pending_flush: Option<oneshot::Sender<Result<()>>>,
    close_queued: bool,
    state: Arc<OutgoingState>,
}

impl<W> WebSocketWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(
        sink: W,
        masking: bool,
        write_buffer_size: usize,
        state: Arc<OutgoingState>,
    ) -> Self {
        Self {
            sink,
            serializer: Serializer::new(masking, write_buffer_size),
            write_buf: BytesMut::with_capacity(write_buffer_size),
            pending_flush: None,
            close_queued: false,
            state,
        }
    }

    /// Run until the close frame is flushed, the queue closes, the sink
    /// fails or the session is terminated
    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::Receiver<WriterItem>,
        mut terminated: watch::Receiver<bool>,
    ) {
        debug!(masking = self.serializer.masking(), "writer started");

        let failure = self.state.failure.clone();
        let outcome = tokio::select! {
            biased;
            _ = wait_terminated(&mut terminated) => {
                // Dropping the queue fails every pending send and flush
                debug!("writer cancelled");
                return;
            }
            cause = failure.wait() => {
                debug!(error = %cause, "stopping writer after source failure");
                Outcome::Failed(cause)
            }
            result = self.write_loop(&mut rx) => match result {
                Ok(true) => Outcome::CloseFlushed,
                Ok(false) => Outcome::QueueClosed,
                Err(e) => {
                    warn!(error = %e, "writer failed");
                    Outcome::Failed(e)
                }
            },
        };

        let ack: Result<()> = match outcome {
            Outcome::CloseFlushed => {
                debug!("close frame flushed, writer finished");
                self.state.close_flushed.store(true, Ordering::Release);
                Ok(())
            }
            Outcome::QueueClosed => {
                debug!("outgoing queue closed, writer finished");
                Ok(())
            }
            Outcome::Failed(e) => {
                // Also ends the incoming queue with this cause
                failure.set(e.clone());
                Err(e)
            }
        };

        if let Some(flush) = self.pending_flush.take() {
            let _ = flush.send(ack.clone());
        }

        // Refuse new items, then discard what is still queued
        rx.close();
        while let Some(item) = rx.recv().await {
            match item {
                WriterItem::Flush(flush) => {
                    let _ = flush.send(ack.clone());
                }
                WriterItem::Frame(frame) => {
                    trace!(opcode = ?frame.opcode(), "discarding frame after writer shutdown");
                }
            }
        }

        tokio::select! {
            biased;
            _ = wait_terminated(&mut terminated) => {}
            _ = self.sink.shutdown() => {}
        }
    }

    /// Returns `Ok(true)` when the close frame was flushed and `Ok(false)`
    /// when every sender dropped
    async fn write_loop(&mut self, rx: &mut mpsc::Receiver<WriterItem>) -> Result<bool> {
        loop {
            if self.serializer.is_empty() && self.pending_flush.is_none() && !self.close_queued {
                match rx.recv().await {
                    Some(item) => self.accept(item),
                    None => return Ok(false),
                }
            }

            // Coalesce whatever is immediately available
            while self.serializer.has_capacity() && !self.close_queued && self.pending_flush.is_none() {
                match rx.try_recv() {
                    Ok(item) => self.accept(item),
                    Err(_) => break,
                }
            }

            self.write_buf.clear();
            let n = self.serializer.serialize(&mut self.write_buf);
            if n > 0 {
                self.sink.write_all(&self.write_buf).await?;
                trace!(bytes = n, "wrote to sink");
            }

            if self.serializer.is_empty() {
                if let Some(flush) = self.pending_flush.take() {
                    self.sink.flush().await?;
                    let _ = flush.send(Ok(()));
                }
                if self.close_queued {
                    self.sink.flush().await?;
                    return Ok(true);
                }
            }
        }
    }

    fn accept(&mut self, item: WriterItem) {
        match item {
            WriterItem::Frame(frame) => {
                trace!(
                    opcode = ?frame.opcode(),
                    fin = frame.is_final(),
                    len = frame.payload().len(),
                    "frame queued for write"
                );
                if frame.opcode() == OpCode::Close {
                    self.close_queued = true;
                }
                self.serializer.enqueue(frame);
            }
            WriterItem::Flush(flush) => {
                self.pending_flush = Some(flush);
            }
        }
    }
}
