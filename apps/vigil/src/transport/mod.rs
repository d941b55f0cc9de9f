//! Message-framed links to the alert backend.
//!
//! The connection manager owns exactly one live [`Transport`] at a
//! time and dials replacements through a [`TransportConnector`], so
//! reconnection logic never cares whether the link is a real
//! websocket or an in-process pair.

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod websocket;

pub use memory::{pair, MemoryConnector, MemoryTransport};
pub use websocket::{WebSocketConnector, WebSocketTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Next inbound message, or `None` once the peer side is gone.
    /// Implementations must be cancel-safe: a dropped `recv` future
    /// loses no messages.
    async fn recv(&mut self) -> Option<Vec<u8>>;

    fn is_connected(&self) -> bool;
}

/// Dials a fresh [`Transport`]; invoked on every (re)connect attempt.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;
}
