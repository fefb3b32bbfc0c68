//! Default session: keepalive, close handshake and message reassembly
//!
//! [`DefaultWebSocketSession`] wraps a [`WebSocketSession`] and takes over the
//! control frames:
//!
//! - pings are answered with a pong carrying the same payload
//! - pongs only count as activity and are never delivered
//! - an incoming close is echoed (unless a close was already sent) and
//!   resolves the close reason
//! - fragmented text and binary messages are reassembled before delivery
//! - an optional pinger sends periodic pings and terminates the session when
//!   nothing arrives within the timeout; both settings can change at runtime
//!
//! Nothing runs until [`DefaultWebSocketSession::start`] is called.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::Config;
use crate::error::{CloseReason, Error, Result};
use crate::extension::{FrameTransform, apply_incoming, apply_outgoing};
use crate::frame::{Frame, OpCode};
use crate::mask::generate_mask;
use crate::reader::Incoming;
use crate::session::{Role, TerminateHandle, WebSocketSession};
use crate::writer::Outgoing;

/// Longest message a close frame can carry after its status code
const MAX_CLOSE_MESSAGE_LEN: usize = 123;

/// Settings the pinger runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Keepalive {
    ping_interval: Option<Duration>,
    timeout: Duration,
}

/// Negotiated close reason, assigned once
#[derive(Debug, Clone)]
enum CloseState {
    Pending,
    Resolved(Option<CloseReason>),
}

/// State shared by the session, its handles and its background tasks
struct Inner {
    outgoing: Outgoing,
    terminate: TerminateHandle,
    config: Config,
    role: Role,
    /// A close frame was sent or is being sent
    closed: AtomicBool,
    close_reason: watch::Sender<CloseState>,
    /// Bumped on every received frame
    activity: watch::Sender<u64>,
    /// Current keepalive settings; every change restarts the pinger
    keepalive: watch::Sender<Keepalive>,
    transforms: OnceLock<Vec<Box<dyn FrameTransform>>>,
}

impl Inner {
    fn transforms(&self) -> &[Box<dyn FrameTransform>] {
        self.transforms.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Assign the close reason unless it already was; returns whether it was
    fn resolve(&self, reason: Option<CloseReason>) -> bool {
        self.close_reason.send_if_modified(|state| match state {
            CloseState::Pending => {
                *state = CloseState::Resolved(reason);
                true
            }
            CloseState::Resolved(_) => false,
        })
    }

    async fn close_reason(&self) -> Option<CloseReason> {
        let mut rx = self.close_reason.subscribe();
        let state = rx
            .wait_for(|state| matches!(state, CloseState::Resolved(_)))
            .await;
        match state {
            Ok(state) => match &*state {
                CloseState::Resolved(reason) => reason.clone(),
                CloseState::Pending => None,
            },
            Err(_) => None,
        }
    }

    /// Send the one close frame of this session and flush it
    ///
    /// A close frame that cannot be sent leaves the session open and the
    /// reason unresolved.
    async fn close_sequence(&self, reason: CloseReason) -> Result<()> {
        let frame = Frame::close(&reason);
        frame.validate()?;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(%reason, "sending close frame");
        if let Err(e) = self.outgoing.send(frame).await {
            self.closed.store(false, Ordering::Release);
            return Err(e);
        }
        self.resolve(Some(reason));
        self.outgoing.flush().await
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        match frame.opcode() {
            OpCode::Close => {
                let reason = frame.close_reason()?.unwrap_or_else(CloseReason::normal);
                self.close_sequence(reason).await
            }
            OpCode::Text | OpCode::Binary if frame.is_final() => {
                let frame = apply_outgoing(self.transforms(), frame)?;
                self.outgoing.send(frame).await
            }
            _ => self.outgoing.send(frame).await,
        }
    }

    fn terminate(&self) {
        if self.resolve(None) {
            debug!("session terminated before a close frame");
        }
        self.terminate.terminate();
    }

    fn observe_activity(&self) {
        self.activity.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn keepalive(&self) -> Keepalive {
        *self.keepalive.borrow()
    }

    fn set_ping_interval(&self, interval: Option<Duration>) {
        self.keepalive.send_modify(|k| k.ping_interval = interval);
    }

    fn set_timeout(&self, timeout: Duration) {
        self.keepalive.send_modify(|k| k.timeout = timeout);
    }

    /// Close with a status matching a fatal incoming error, then report it
    async fn fail(&self, error: Error, tx: &mpsc::Sender<Result<Frame>>) {
        warn!(error = %error, "incoming frame rejected");
        let code = match &error {
            Error::FrameTooBig { .. } => Some(CloseReason::TOO_BIG),
            e if e.is_protocol() => Some(CloseReason::PROTOCOL_ERROR),
            _ => None,
        };
        if let Some(code) = code {
            let reason = CloseReason::new(code, close_message(&error));
            if let Err(e) = self.close_sequence(reason).await {
                debug!(error = %e, "could not send close frame");
            }
        }
        let _ = tx.send(Err(error)).await;
    }
}

fn close_message(error: &Error) -> String {
    let mut message = error.to_string();
    if message.len() > MAX_CLOSE_MESSAGE_LEN {
        let mut end = MAX_CLOSE_MESSAGE_LEN;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

/// Joins fragmented data frames into complete messages
#[derive(Debug)]
struct Reassembler {
    max_size: usize,
    opcode: Option<OpCode>,
    body: BytesMut,
}

impl Reassembler {
    fn new(max_size: usize) -> Self {
        Self {
            max_size,
            opcode: None,
            body: BytesMut::new(),
        }
    }

    /// Returns the complete message once its final fragment arrived
    fn push(&mut self, frame: Frame) -> Result<Option<Frame>> {
        match frame.opcode() {
            OpCode::Continuation => {
                let Some(opcode) = self.opcode else {
                    return Err(Error::Protocol("continuation frame without a message"));
                };
                self.append(frame.payload())?;
                if !frame.is_final() {
                    return Ok(None);
                }
                self.opcode = None;
                Ok(Some(Frame::new(opcode, self.body.split().freeze(), true)))
            }
            opcode => {
                if self.opcode.is_some() {
                    return Err(Error::Protocol("new message before the previous one finished"));
                }
                if frame.is_final() {
                    return Ok(Some(frame));
                }
                self.opcode = Some(opcode);
                self.append(frame.payload())?;
                Ok(None)
            }
        }
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        let size = self.body.len() + data.len();
        if size > self.max_size {
            return Err(Error::FrameTooBig {
                size: size as u64,
                max: self.max_size,
            });
        }
        self.body.extend_from_slice(data);
        Ok(())
    }
}

/// Route raw incoming frames until a close frame, an error or the end
async fn run_incoming(inner: Arc<Inner>, mut raw: Incoming, tx: mpsc::Sender<Result<Frame>>) {
    let mut reassembler = Reassembler::new(inner.config.max_frame_size);

    loop {
        let item = tokio::select! {
            biased;
            item = raw.recv() => item,
            _ = tx.closed() => {
                debug!("default session dropped");
                break;
            }
        };

        let frame = match item {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                inner.fail(e, &tx).await;
                break;
            }
            None => break,
        };

        inner.observe_activity();

        match frame.opcode() {
            OpCode::Close => {
                let reason = match frame.close_reason() {
                    Ok(reason) => reason.unwrap_or_else(|| CloseReason::new(CloseReason::NORMAL, "OK")),
                    Err(e) => {
                        inner.fail(e, &tx).await;
                        break;
                    }
                };
                debug!(%reason, "close frame received");
                if let Err(e) = inner.close_sequence(reason).await {
                    debug!(error = %e, "could not echo close frame");
                }
                break;
            }
            OpCode::Pong => trace!(len = frame.payload().len(), "pong received"),
            OpCode::Ping if inner.config.auto_pong => {
                trace!(len = frame.payload().len(), "answering ping");
                if let Err(e) = inner.outgoing.send(Frame::pong(frame.into_payload())).await {
                    debug!(error = %e, "could not send pong");
                }
            }
            OpCode::Ping => {
                if tx.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
            _ => {
                let message = match reassembler.push(frame) {
                    Ok(Some(message)) => message,
                    Ok(None) => continue,
                    Err(e) => {
                        inner.fail(e, &tx).await;
                        break;
                    }
                };
                let message = match apply_incoming(inner.transforms(), message) {
                    Ok(message) => message,
                    Err(e) => {
                        inner.fail(e, &tx).await;
                        break;
                    }
                };
                if tx.send(Ok(message)).await.is_err() {
                    break;
                }
            }
        }
    }

    inner.terminate();
}

/// Ping every `period` and terminate when the peer stays silent for
/// `timeout` after a ping; returns when pinging is over for good
async fn run_pinger(inner: &Inner, period: Duration, timeout: Duration) {
    let mut activity = inner.activity.subscribe();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if inner.closed.load(Ordering::Acquire) {
            break;
        }

        let _ = activity.borrow_and_update();
        let nonce = u32::from_ne_bytes(generate_mask());
        let payload = format!("[ping {nonce:08x} ping]");
        trace!(%payload, "sending ping");
        if inner.outgoing.send(Frame::ping(payload)).await.is_err() {
            break;
        }

        match tokio::time::timeout(timeout, activity.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                warn!(?timeout, "peer silent after ping, terminating");
                inner.terminate();
                break;
            }
        }
    }
}

/// Run the pinger with the current keepalive settings, restarting it
/// whenever they change
async fn run_keepalive(inner: Arc<Inner>) {
    let terminate = inner.terminate.clone();
    let mut settings = inner.keepalive.subscribe();

    let supervisor = async {
        loop {
            let current = *settings.borrow_and_update();
            let pinger = async {
                match current.ping_interval.filter(|period| !period.is_zero()) {
                    Some(period) => run_pinger(&inner, period, current.timeout).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                changed = settings.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = *settings.borrow();
                    debug!(
                        ping_interval = ?next.ping_interval,
                        timeout = ?next.timeout,
                        "keepalive settings changed, restarting pinger"
                    );
                }
                _ = pinger => break,
            }
        }
    };

    tokio::select! {
        biased;
        _ = terminate.terminated() => {}
        _ = supervisor => {}
    }
    debug!("pinger stopped");
}

/// Session with automatic ping/pong, close echo, reassembly and a
/// negotiated close reason
///
/// # Example
///
/// ```ignore
/// let mut ws = DefaultWebSocketSession::new(WebSocketSession::server(stream, config));
/// ws.start(Vec::new())?;
/// while let Some(frame) = ws.recv().await {
///     ws.send(frame?).await?;
/// }
/// println!("closed with {:?}", ws.close_reason().await);
/// ```
pub struct DefaultWebSocketSession {
    /// Raw session and the filtered queue's sender until `start`
    pending: Option<(WebSocketSession, mpsc::Sender<Result<Frame>>)>,
    incoming: Incoming,
    inner: Arc<Inner>,
}

impl DefaultWebSocketSession {
    /// Wrap a raw session
    pub fn new(session: WebSocketSession) -> Self {
        let config = session.config().clone();
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let incoming = Incoming::new(rx, session.lifecycle());
        let (close_reason, _) = watch::channel(CloseState::Pending);
        let (activity, _) = watch::channel(0);
        let (keepalive, _) = watch::channel(Keepalive {
            ping_interval: config.ping_interval,
            timeout: config.timeout,
        });

        let inner = Arc::new(Inner {
            outgoing: session.outgoing(),
            terminate: session.terminate_handle(),
            role: session.role(),
            config,
            closed: AtomicBool::new(false),
            close_reason,
            activity,
            keepalive,
            transforms: OnceLock::new(),
        });

        Self {
            pending: Some((session, tx)),
            incoming,
            inner,
        }
    }

    /// Install `transforms` and spawn the background tasks
    ///
    /// Must be called once, inside a Tokio runtime; a second call fails with
    /// [`Error::AlreadyStarted`].
    pub fn start(&mut self, transforms: Vec<Box<dyn FrameTransform>>) -> Result<()> {
        let Some((session, tx)) = self.pending.take() else {
            return Err(Error::AlreadyStarted);
        };

        let names: Vec<&str> = transforms.iter().map(|t| t.name()).collect();
        debug!(role = ?self.inner.role, transforms = ?names, "starting default session");
        let _ = self.inner.transforms.set(transforms);

        let (raw, _, _) = session.split();
        tokio::spawn(run_incoming(self.inner.clone(), raw, tx));

        tokio::spawn(run_keepalive(self.inner.clone()));
        Ok(())
    }

    /// Endpoint role
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Configuration the session was created with
    ///
    /// The keepalive settings may have changed since; see
    /// [`ping_interval`](Self::ping_interval) and [`timeout`](Self::timeout).
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Current ping interval; `None` when pinging is off
    pub fn ping_interval(&self) -> Option<Duration> {
        self.inner.keepalive().ping_interval
    }

    /// Change the ping interval, restarting the pinger
    ///
    /// `None` stops pinging. Takes effect immediately when the session is
    /// running, otherwise on [`start`](Self::start).
    pub fn set_ping_interval(&self, interval: Option<Duration>) {
        self.inner.set_ping_interval(interval);
    }

    /// Current idle timeout after a ping
    pub fn timeout(&self) -> Duration {
        self.inner.keepalive().timeout
    }

    /// Change the idle timeout after a ping, restarting the pinger
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.set_timeout(timeout);
    }

    /// Queue of delivered frames: whole messages, plus pings when
    /// `auto_pong` is disabled
    pub fn incoming(&mut self) -> &mut Incoming {
        &mut self.incoming
    }

    /// Receive the next message
    pub async fn recv(&mut self) -> Option<Result<Frame>> {
        self.incoming.recv().await
    }

    /// Cloneable handle to the sending side
    pub fn handle(&self) -> DefaultSessionHandle {
        DefaultSessionHandle {
            inner: self.inner.clone(),
        }
    }

    /// Send a frame; a close frame starts the close handshake
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.inner.send(frame).await
    }

    /// Wait until everything sent so far reached the peer's byte stream
    pub async fn flush(&self) -> Result<()> {
        self.inner.outgoing.flush().await
    }

    /// Graceful close; only the first close frame is sent
    pub async fn close(&self, reason: CloseReason) -> Result<()> {
        self.inner.close_sequence(reason).await
    }

    /// Graceful close with [`CloseReason::GOING_AWAY`]
    pub async fn going_away(&self, message: impl Into<String>) -> Result<()> {
        self.close(CloseReason::new(CloseReason::GOING_AWAY, message))
            .await
    }

    /// Immediate shutdown without a close exchange
    pub fn terminate(&self) {
        self.inner.terminate();
    }

    /// Whether the session was terminated
    pub fn is_terminated(&self) -> bool {
        self.inner.terminate.is_terminated()
    }

    /// The first close reason sent or received, or `None` when the
    /// connection ended without one
    pub async fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason().await
    }
}

impl std::fmt::Debug for DefaultWebSocketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultWebSocketSession")
            .field("role", &self.inner.role)
            .field("started", &self.pending.is_none())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// Cloneable sending handle of a [`DefaultWebSocketSession`]
#[derive(Clone)]
pub struct DefaultSessionHandle {
    inner: Arc<Inner>,
}

impl DefaultSessionHandle {
    /// Send a frame; a close frame starts the close handshake
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.inner.send(frame).await
    }

    /// Wait until everything sent so far reached the byte stream
    pub async fn flush(&self) -> Result<()> {
        self.inner.outgoing.flush().await
    }

    /// Graceful close; only the first close frame is sent
    pub async fn close(&self, reason: CloseReason) -> Result<()> {
        self.inner.close_sequence(reason).await
    }

    /// See [`DefaultWebSocketSession::set_ping_interval`]
    pub fn set_ping_interval(&self, interval: Option<Duration>) {
        self.inner.set_ping_interval(interval);
    }

    /// See [`DefaultWebSocketSession::set_timeout`]
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.set_timeout(timeout);
    }

    /// Immediate shutdown without a close exchange
    pub fn terminate(&self) {
        self.inner.terminate();
    }

    /// Whether the session was terminated
    pub fn is_terminated(&self) -> bool {
        self.inner.terminate.is_terminated()
    }

    /// See [`DefaultWebSocketSession::close_reason`]
    pub async fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason().await
    }
}

impl std::fmt::Debug for DefaultSessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultSessionHandle")
            .field("role", &self.inner.role)
            .finish()
    }
}
