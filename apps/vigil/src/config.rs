use std::path::PathBuf;
use std::time::Duration;

use crate::connection::ConnectionConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_url: String,
    /// Override for the persisted-state directory; platform default
    /// when unset.
    pub state_dir: Option<PathBuf>,
    pub log_filter: String,
    pub max_cached_events: usize,
    pub flush_interval_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub connect_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub backfill_timeout_ms: u64,
    pub backfill_max_attempts: u32,
    pub backfill_retry_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let server_url =
            std::env::var("VIGIL_SERVER_URL").unwrap_or_else(|_| "ws://127.0.0.1:4180/ws".into());
        let state_dir = std::env::var("VIGIL_STATE_DIR").ok().map(PathBuf::from);
        let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,vigil=debug".into());
        let max_cached_events = std::env::var("VIGIL_MAX_CACHED_EVENTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(500);
        let flush_interval_ms = std::env::var("VIGIL_FLUSH_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5_000);
        let reconnect_initial_ms = std::env::var("VIGIL_RECONNECT_INITIAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1_000);
        let reconnect_max_ms = std::env::var("VIGIL_RECONNECT_MAX_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30_000);
        let connect_timeout_ms = std::env::var("VIGIL_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        let ping_interval_ms = std::env::var("VIGIL_PING_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20_000);
        let pong_timeout_ms = std::env::var("VIGIL_PONG_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        let backfill_timeout_ms = std::env::var("VIGIL_BACKFILL_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        let backfill_max_attempts = std::env::var("VIGIL_BACKFILL_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        let backfill_retry_ms = std::env::var("VIGIL_BACKFILL_RETRY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2_000);
        let sweep_interval_ms = std::env::var("VIGIL_SWEEP_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(500);
        Self {
            server_url,
            state_dir,
            log_filter,
            max_cached_events,
            flush_interval_ms,
            reconnect_initial_ms,
            reconnect_max_ms,
            connect_timeout_ms,
            ping_interval_ms,
            pong_timeout_ms,
            backfill_timeout_ms,
            backfill_max_attempts,
            backfill_retry_ms,
            sweep_interval_ms,
        }
    }

    /// Connection-task view of the tunables.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            reconnect_initial: Duration::from_millis(self.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            pong_timeout: Duration::from_millis(self.pong_timeout_ms),
            backfill_timeout: Duration::from_millis(self.backfill_timeout_ms),
            backfill_max_attempts: self.backfill_max_attempts,
            backfill_retry: Duration::from_millis(self.backfill_retry_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:4180/ws".into(),
            state_dir: None,
            log_filter: "info,vigil=debug".into(),
            max_cached_events: 500,
            flush_interval_ms: 5_000,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            connect_timeout_ms: 10_000,
            ping_interval_ms: 20_000,
            pong_timeout_ms: 10_000,
            backfill_timeout_ms: 10_000,
            backfill_max_attempts: 5,
            backfill_retry_ms: 2_000,
            sweep_interval_ms: 500,
        }
    }
}
