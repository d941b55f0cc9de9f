//! In-process transport for tests and embedding.
//!
//! Two cross-wired channel halves form a duplex link; dropping either
//! end closes the peer's receive stream, which is exactly how a lost
//! socket presents itself to the connection manager.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Transport, TransportConnector, TransportError};

pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Build both ends of a duplex link.
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    (
        MemoryTransport { tx: tx_a, rx: rx_b },
        MemoryTransport { tx: tx_b, rx: rx_a },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| TransportError::NotConnected)
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Connector that manufactures a fresh in-process pair per dial.
///
/// The client side is returned to the caller; the server side lands in
/// the accept queue so a test can script backend behavior for each
/// successive connection.
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryTransport>,
    refuse: AtomicBool,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryTransport>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                refuse: AtomicBool::new(false),
            },
            accept_rx,
        )
    }

    /// While set, every dial fails; used to exercise backoff.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".into()));
        }
        let (client, server) = pair();
        self.accept_tx
            .send(server)
            .map_err(|_| TransportError::Connect("accept queue closed".into()))?;
        Ok(Box::new(client))
    }
}
