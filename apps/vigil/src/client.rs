//! Client facade: wires the registry, the connection task, and the
//! periodic state flusher together behind one handle.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::warn;
use update_bus::{Bus, BusMessage, LocalBus};
use url::Url;

use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::registry::{Notice, RegistryStats, SubscriptionRegistry, NOTICE_TOPIC};
use crate::storage::{FileStore, StateStore, StoreError};
use crate::transport::{TransportConnector, WebSocketConnector};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct VigilClient {
    registry: Arc<SubscriptionRegistry>,
    connection: ConnectionManager,
    notices: Arc<LocalBus<Notice>>,
    flush_task: JoinHandle<()>,
}

impl VigilClient {
    /// Production wiring: file-backed state, websocket transport.
    pub fn new(config: Config) -> Result<Self, CoreError> {
        let url = Url::parse(&config.server_url)?;
        let dir = match &config.state_dir {
            Some(dir) => dir.clone(),
            None => FileStore::default_dir()?,
        };
        let store: Arc<dyn StateStore> = Arc::new(FileStore::new(dir)?);
        let connector: Arc<dyn TransportConnector> = Arc::new(WebSocketConnector::new(url));
        Ok(Self::with_parts(config, store, connector))
    }

    /// Embedder wiring: caller supplies the store and the transport.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn StateStore>,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        let notices = Arc::new(LocalBus::new());
        let registry = Arc::new(SubscriptionRegistry::open(
            store,
            notices.clone() as Arc<dyn Bus<Notice>>,
            config.max_cached_events,
        ));
        let connection =
            ConnectionManager::spawn(config.connection(), connector, registry.clone());
        let flush_task = spawn_flusher(
            registry.clone(),
            Duration::from_millis(config.flush_interval_ms),
        );
        Self {
            registry,
            connection,
            notices,
            flush_task,
        }
    }

    /// Add a channel; takes effect on the live connection immediately
    /// and, through persistence, on every later one.
    pub fn subscribe(&self, channel: &str) -> bool {
        let added = self.registry.subscribe(channel);
        if added {
            self.connection.notify_subscribed(channel);
        }
        added
    }

    pub fn unsubscribe(&self, channel: &str) -> bool {
        let removed = self.registry.unsubscribe(channel);
        if removed {
            self.connection.notify_unsubscribed(channel);
        }
        removed
    }

    /// Start dialing in the background; returns immediately.
    pub fn connect(&self) {
        self.connection.connect();
    }

    /// Drop the link and stop reconnecting. Resolves once pending
    /// timers and repair retries are cancelled.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Disconnect, stop background tasks, and write out state.
    pub async fn shutdown(self) {
        self.connection.shutdown().await;
        self.flush_task.abort();
        let _ = self.flush_task.await;
        if let Err(err) = self.registry.force_save() {
            warn!(target = "vigil::client", error = %err, "final state flush failed");
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.watch_status()
    }

    /// Stream of state-change notices for a UI layer.
    pub fn notices(&self) -> broadcast::Receiver<BusMessage<Notice>> {
        self.notices.subscribe(NOTICE_TOPIC)
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }
}

fn spawn_flusher(registry: Arc<SubscriptionRegistry>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; nothing is dirty yet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            registry.force_save_if_dirty();
        }
    })
}
