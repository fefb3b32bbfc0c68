//! WebSocket session
//!
//! Composes the reader and writer tasks behind a single bidirectional frame
//! interface. The session owns the masking policy (fixed by [`Role`]), the
//! frame size limit and the lifecycle: graceful [`WebSocketSession::close`]
//! versus immediate [`WebSocketSession::terminate`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::Config;
use crate::error::{CloseReason, Error, Result};
use crate::frame::Frame;
use crate::reader::{Incoming, WebSocketReader};
use crate::writer::{Outgoing, OutgoingState, WebSocketWriter};

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connection-initiating side: masks every outgoing frame, rejects
    /// masked incoming frames
    Client,
    /// Accepting side: never masks, rejects unmasked incoming frames
    Server,
}

impl Role {
    /// Whether outgoing frames are masked
    #[inline]
    pub fn masks_outgoing(&self) -> bool {
        *self == Role::Client
    }

    /// Whether incoming frames must be masked
    #[inline]
    pub fn expects_masked(&self) -> bool {
        *self == Role::Server
    }
}

type ReaderFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Termination flag and the not-yet-spawned reader of one session
///
/// Every user-facing handle keeps it alive. Dropping the last one acts as a
/// termination.
pub(crate) struct Lifecycle {
    terminated: watch::Sender<bool>,
    reader_started: AtomicBool,
    pending_reader: Mutex<Option<ReaderFuture>>,
}

impl Lifecycle {
    fn new(pending_reader: ReaderFuture) -> (Self, watch::Receiver<bool>) {
        let (terminated, rx) = watch::channel(false);
        let lifecycle = Self {
            terminated,
            reader_started: AtomicBool::new(false),
            pending_reader: Mutex::new(Some(pending_reader)),
        };
        (lifecycle, rx)
    }

    /// Spawn the reader task if nobody has yet
    pub(crate) fn start_reader(&self) {
        if self.reader_started.load(Ordering::Acquire) {
            return;
        }
        if let Some(reader) = self.pending_reader.lock().take() {
            self.reader_started.store(true, Ordering::Release);
            debug!("spawning reader on first receive");
            tokio::spawn(reader);
        }
    }

    pub(crate) fn terminate(&self) {
        if !self.terminated.send_replace(true) {
            debug!("session terminated");
        }
        // Never started: dropping the future releases the byte source
        self.pending_reader.lock().take();
        self.reader_started.store(true, Ordering::Release);
    }

    pub(crate) fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.terminated.subscribe()
    }
}

/// Resolve once the session is terminated or its last handle is dropped
pub(crate) async fn wait_terminated(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|terminated| *terminated).await;
}

/// First byte-stream failure of a session, seen by both of its tasks
///
/// Whichever task hits an I/O error first records it here; the other one
/// stops and reports the same cause on its queue.
#[derive(Debug)]
pub(crate) struct Failure {
    cause: OnceLock<Error>,
    failed: watch::Sender<bool>,
}

impl Default for Failure {
    fn default() -> Self {
        Self {
            cause: OnceLock::new(),
            failed: watch::channel(false).0,
        }
    }
}

impl Failure {
    /// Record `error` unless a cause is already set
    pub(crate) fn set(&self, error: Error) {
        if self.cause.set(error).is_ok() {
            self.failed.send_replace(true);
        }
    }

    pub(crate) fn get(&self) -> Option<&Error> {
        self.cause.get()
    }

    /// Resolve with the cause once one is recorded
    pub(crate) async fn wait(&self) -> Error {
        let mut rx = self.failed.subscribe();
        let _ = rx.wait_for(|failed| *failed).await;
        self.cause.get().cloned().unwrap_or(Error::ConnectionClosed)
    }
}

/// Cloneable handle that can terminate a session from anywhere
#[derive(Clone)]
pub struct TerminateHandle {
    lifecycle: Arc<Lifecycle>,
}

impl TerminateHandle {
    /// Immediately cancel both tasks and drop the byte stream
    pub fn terminate(&self) {
        self.lifecycle.terminate();
    }

    /// Whether the session was terminated
    pub fn is_terminated(&self) -> bool {
        self.lifecycle.is_terminated()
    }

    /// Resolve once the session is terminated
    pub async fn terminated(&self) {
        let mut rx = self.lifecycle.subscribe();
        wait_terminated(&mut rx).await;
    }
}

impl std::fmt::Debug for TerminateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminateHandle")
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// A WebSocket session over an already-upgraded byte stream
///
/// Frames are exchanged through two bounded queues: [`Incoming`] (fed by the
/// reader task) and [`Outgoing`] (drained by the writer task). Control frames
/// are delivered and sent as-is; see
/// [`DefaultWebSocketSession`](crate::DefaultWebSocketSession) for automatic
/// ping/pong and close handling.
///
/// Must be created inside a Tokio runtime: the writer task is spawned
/// immediately, the reader task on the first receive.
///
/// # Example
///
/// ```ignore
/// let mut ws = WebSocketSession::client(stream, Config::default());
/// ws.send(Frame::text("hello")).await?;
/// ws.flush().await?;
/// while let Some(frame) = ws.recv().await {
///     println!("{:?}", frame?);
/// }
/// ```
pub struct WebSocketSession {
    role: Role,
    config: Config,
    incoming: Incoming,
    outgoing: Outgoing,
    terminate: TerminateHandle,
}

impl WebSocketSession {
    /// Create a session from separate source and sink halves
    pub fn new<R, W>(source: R, sink: W, role: Role, config: Config) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let capacity = config.channel_capacity.max(1);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);

        let failure = Arc::new(Failure::default());
        let reader = WebSocketReader::new(
            source,
            config.max_frame_size,
            role.expects_masked(),
            config.read_buffer_size,
            failure.clone(),
        );

        // The reader needs the termination signal, which only exists once
        // the lifecycle does; hand it over through a oneshot.
        let (term_tx, term_rx) = tokio::sync::oneshot::channel::<watch::Receiver<bool>>();
        let pending: ReaderFuture = Box::pin(async move {
            if let Ok(terminated) = term_rx.await {
                reader.run(in_tx, terminated).await;
            }
        });

        let (lifecycle, terminated) = Lifecycle::new(pending);
        let _ = term_tx.send(terminated.clone());
        let lifecycle = Arc::new(lifecycle);

        let state = Arc::new(OutgoingState::new(failure));
        let writer = WebSocketWriter::new(
            sink,
            role.masks_outgoing(),
            config.write_buffer_size,
            state.clone(),
        );
        tokio::spawn(writer.run(out_rx, terminated));

        debug!(?role, max_frame_size = config.max_frame_size, "session created");

        Self {
            role,
            incoming: Incoming::new(in_rx, lifecycle.clone()),
            outgoing: Outgoing::new(out_tx, state, lifecycle.clone()),
            terminate: TerminateHandle { lifecycle },
            config,
        }
    }

    /// Create a session over a duplex stream
    pub fn from_stream<S>(stream: S, role: Role, config: Config) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (source, sink) = tokio::io::split(stream);
        Self::new(source, sink, role, config)
    }

    /// Create a server-side session
    pub fn server<S>(stream: S, config: Config) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::from_stream(stream, Role::Server, config)
    }

    /// Create a client-side session
    pub fn client<S>(stream: S, config: Config) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::from_stream(stream, Role::Client, config)
    }

    /// Endpoint role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether outgoing frames are masked
    pub fn masking(&self) -> bool {
        self.role.masks_outgoing()
    }

    /// Maximum accepted frame size
    pub fn max_frame_size(&self) -> usize {
        self.config.max_frame_size
    }

    /// Session configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Incoming frame queue
    pub fn incoming(&mut self) -> &mut Incoming {
        &mut self.incoming
    }

    /// Outgoing frame queue handle
    pub fn outgoing(&self) -> Outgoing {
        self.outgoing.clone()
    }

    /// Handle for terminating the session from another task
    pub fn terminate_handle(&self) -> TerminateHandle {
        self.terminate.clone()
    }

    pub(crate) fn lifecycle(&self) -> Arc<Lifecycle> {
        self.terminate.lifecycle.clone()
    }

    /// Receive the next frame
    pub async fn recv(&mut self) -> Option<Result<Frame>> {
        self.incoming.recv().await
    }

    /// Enqueue a frame, waiting under backpressure
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.outgoing.send(frame).await
    }

    /// Wait until everything enqueued so far reached the sink
    pub async fn flush(&self) -> Result<()> {
        self.outgoing.flush().await
    }

    /// Graceful close: send a close frame carrying `reason`, then flush
    ///
    /// Only the first close frame is written; later calls return at once.
    pub async fn close(&self, reason: CloseReason) -> Result<()> {
        if self.outgoing.is_close_sent() {
            return Ok(());
        }
        debug!(%reason, "closing session");
        self.outgoing.send(Frame::close(&reason)).await?;
        self.outgoing.flush().await
    }

    /// Immediate, non-graceful shutdown without a close exchange
    pub fn terminate(&self) {
        self.terminate.terminate();
    }

    /// Whether the session was terminated
    pub fn is_terminated(&self) -> bool {
        self.terminate.is_terminated()
    }

    /// Split into the incoming queue, the outgoing handle and a terminate handle
    pub fn split(self) -> (Incoming, Outgoing, TerminateHandle) {
        (self.incoming, self.outgoing, self.terminate)
    }
}

impl std::fmt::Debug for WebSocketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSession")
            .field("role", &self.role)
            .field("max_frame_size", &self.config.max_frame_size)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
