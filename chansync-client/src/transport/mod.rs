//! Push transport abstraction for chansync.
//!
//! This module provides a pluggable transport layer for the persistent,
//! low-latency event channel (a WebSocket in production, a mock in tests).
//!
//! # Design
//!
//! The transport trait is async and connection-oriented:
//! - `connect()` establishes an authenticated session
//! - `send()` transmits one encoded [`ClientCommand`](chansync_types::ClientCommand) frame
//! - `recv()` waits for one encoded [`ServerEvent`](chansync_types::ServerEvent) frame
//! - `close()` gracefully terminates
//!
//! An error from `recv()` is the authoritative signal that the session is
//! gone. Missing heartbeat acknowledgements are not.
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new();
//! transport.connect(&Credential::new("token")).await?;
//! transport.send(&ClientCommand::join("general".into()).to_bytes()?).await?;
//! let frame = transport.recv().await?;
//! ```

mod mock;

pub use mock::MockTransport;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The server rejected the credential.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// Opaque session credential (e.g. a bearer token).
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a credential string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw credential, for the transport handshake.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Transport trait for the push channel.
///
/// Implementations handle the underlying connection mechanism
/// (WebSocket, mock, etc).
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Open an authenticated session.
    async fn connect(&self, credential: &Credential) -> Result<(), TransportError>;

    /// Send one encoded command frame.
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Receive one encoded event frame.
    ///
    /// Waits until a frame is available. Returns an error once the session
    /// has ended.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the session gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}
