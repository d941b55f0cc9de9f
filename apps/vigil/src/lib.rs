pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod registry;
pub mod storage;
pub mod sync;
pub mod telemetry;
pub mod transport;

pub use client::{CoreError, VigilClient};
pub use config::Config;
pub use connection::{ConnectionPhase, ConnectionStatus};
pub use registry::{Event, IngestOutcome, Notice, SubscriptionRegistry};

/// Milliseconds since the Unix epoch; clamps to 0 if the clock is
/// before 1970.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
