//! # Sockudo-Wire: WebSocket wire-protocol engine
//!
//! Turns a raw bidirectional byte stream into a sequence of typed frames and
//! back again, enforcing the RFC 6455 framing rules: fragmentation, masking,
//! control-frame interleaving, size limits and the close handshake.
//!
//! The HTTP upgrade is out of scope: a session starts from an already
//! upgraded byte stream.
//!
//! ## Architecture
//!
//! - **Frame model** ([`frame`]): opcode, FIN flag and payload
//! - **Parser + collector** ([`parser`], [`collector`]): incremental decode
//! - **Serializer** ([`serializer`]): resumable encode with optional masking
//! - **Reader / writer** ([`reader`], [`writer`]): one background task each,
//!   talking to the application through bounded queues
//! - **Session** ([`session`]): role-based masking, lifecycle, close
//! - **Default session** ([`default_session`]): ping/pong keepalive, idle
//!   timeout, close echo, reassembly and the negotiated close reason
//!
//! ## Example
//!
//! ```ignore
//! use sockudo_wire::{Config, DefaultWebSocketSession, Frame, WebSocketSession};
//!
//! async fn handle(stream: tokio::net::TcpStream) -> sockudo_wire::Result<()> {
//!     let config = Config::builder()
//!         .ping_interval(std::time::Duration::from_secs(30))
//!         .build();
//!     let mut ws = DefaultWebSocketSession::new(WebSocketSession::server(stream, config));
//!     ws.start(Vec::new())?;
//!
//!     while let Some(frame) = ws.recv().await {
//!         ws.send(frame?).await?;
//!     }
//!     Ok(())
//! }
//! ```

use std::time::Duration;

pub mod collector;
pub mod default_session;
pub mod error;
pub mod extension;
pub mod frame;
pub mod mask;
pub mod parser;
pub mod reader;
pub mod serializer;
pub mod session;
pub mod writer;

pub use default_session::{DefaultSessionHandle, DefaultWebSocketSession};
pub use error::{CloseReason, Error, Result};
pub use extension::FrameTransform;
pub use frame::{Frame, OpCode};
pub use reader::{Incoming, TryRecvError};
pub use session::{Role, TerminateHandle, WebSocketSession};
pub use writer::Outgoing;

/// Default write buffer size (16KB)
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Default read chunk size (64KB)
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default capacity of the incoming and outgoing frame queues
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8;

/// Default maximum frame size (16MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default idle timeout armed after each ping (15s)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload encoded in the 7-bit length field
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Largest payload encoded in the 16-bit extended length
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Configuration for WebSocket sessions
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sockudo_wire::Config;
///
/// let config = Config::builder()
///     .max_frame_size(1024 * 1024)
///     .ping_interval(Duration::from_secs(20))
///     .timeout(Duration::from_secs(10))
///     .build();
/// assert_eq!(config.channel_capacity, 8);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum frame size, and maximum reassembled message size in the
    /// default session (default: 16MB)
    pub max_frame_size: usize,
    /// Bytes requested from the source per read (default: 64KB)
    pub read_buffer_size: usize,
    /// Bytes serialized per sink write (default: 16KB)
    pub write_buffer_size: usize,
    /// Capacity of the incoming and outgoing frame queues (default: 8)
    pub channel_capacity: usize,
    /// Ping period; `None` disables the pinger (default: `None`)
    pub ping_interval: Option<Duration>,
    /// Idle timeout after a ping before the session is terminated (default: 15s)
    pub timeout: Duration,
    /// Answer pings automatically (default: true)
    ///
    /// When disabled, pings are delivered to the application, which becomes
    /// responsible for the pong.
    pub auto_pong: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            ping_interval: None,
            timeout: DEFAULT_TIMEOUT,
            auto_pong: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for WebSocket configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set read chunk size
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size.max(1);
        self
    }

    /// Set write buffer size
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Set the capacity of both frame queues
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity.max(1);
        self
    }

    /// Enable the pinger with the given period
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = Some(interval);
        self
    }

    /// Disable the pinger
    pub fn no_ping(mut self) -> Self {
        self.config.ping_interval = None;
        self
    }

    /// Set the idle timeout armed after each ping
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Enable or disable automatic pong replies
    pub fn auto_pong(mut self, enabled: bool) -> Self {
        self.config.auto_pong = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::default_session::DefaultWebSocketSession;
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::session::{Role, WebSocketSession};
}
