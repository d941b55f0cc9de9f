//! Topic-keyed broadcast bus that decouples state-owning services from
//! their observers. UI layers subscribe to a topic and receive typed
//! notices without ever touching the publisher's locks.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage<T> {
    pub topic: String,
    pub payload: T,
}

#[derive(Debug, Error)]
pub enum BusError {
    /// Nobody is subscribed to the topic; the message was dropped.
    #[error("bus topic has no subscribers")]
    NoSubscribers,
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus<T: Clone + Send + 'static>: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage<T>>;
    fn publish(&self, topic: &str, payload: T) -> BusResult<()>;
}

const DEFAULT_CAPACITY: usize = 64;

/// In-memory bus backed by one broadcast channel per topic. Slow
/// receivers lag rather than block the publisher.
#[derive(Debug)]
pub struct LocalBus<T> {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage<T>>>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> LocalBus<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: parking_lot::RwLock::new(HashMap::new()),
            capacity,
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage<T>> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl<T: Clone + Send + 'static> Default for LocalBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Bus<T> for LocalBus<T> {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage<T>> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: T) -> BusResult<()> {
        let sender = self.sender_for(topic);
        sender
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .map(|_| ())
            .map_err(|_| BusError::NoSubscribers)
    }
}
