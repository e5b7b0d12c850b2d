//! # Transport Abstraction
//!
//! A minimal, async interface for moving bytes between netrons.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: A transport knows nothing about packets or values.
//!   It moves opaque buffers, one buffer per packet.
//! - **Duplex**: Either side may send at any time; inbound buffers are pulled
//!   by the peer's receive pump until the stream ends.

use async_trait::async_trait;

use crate::address::Address;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer is unreachable or the connection was dropped.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// Nobody is listening at the requested address.
    #[error("connection refused: {0}")]
    Refused(String),
    /// Generic I/O error or internal transport failure.
    #[error("i/o error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A duplex byte pipe to one remote endpoint.
///
/// Object-safe, so peers hold it as `Arc<dyn Transport>`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Writes one framed packet.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next inbound packet. `Ok(None)` means the stream has ended.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Shuts the pipe down. Both ends observe the end of stream.
    async fn close(&self);
}

/// Opens transports to addresses; the transport-level half of `connect`.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: &Address) -> Result<Box<dyn Transport>>;
}
