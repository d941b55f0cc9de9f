//! Connection lifecycle: dialing, keepalive, reconnection, and gap
//! repair.
//!
//! A single task owns the transport. Callers talk to it through a
//! command channel and observe it through a watch channel, so
//! `connect` returns immediately while `disconnect` resolves only
//! after pending reconnect timers and backfill retries are cancelled.
//! Frames coming off the wire are routed straight into the registry;
//! a `Gap` outcome arms a repair entry that the periodic sweep drives
//! through request, timeout, retry, and exhaustion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_proto::{decode_server, encode_client, ChannelId, ClientFrame, ResumePoint, Seq, ServerFrame};

use crate::registry::{BackfillOutcome, IngestOutcome, SubscriptionRegistry};
use crate::transport::{Transport, TransportConnector, TransportError};

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub backfill_timeout: Duration,
    pub backfill_max_attempts: u32,
    pub backfill_retry: Duration,
    /// Cadence of the housekeeping tick that checks ping and repair
    /// deadlines.
    pub sweep_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(10),
            backfill_timeout: Duration::from_secs(10),
            backfill_max_attempts: 5,
            backfill_retry: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub phase: ConnectionPhase,
    /// Consecutive failed dials since the last healthy connection.
    pub reconnect_attempt: u32,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    /// Short human-readable phase for status lines.
    pub fn describe(&self) -> String {
        match self.phase {
            ConnectionPhase::Idle => "idle".to_string(),
            ConnectionPhase::Connecting if self.reconnect_attempt > 0 => {
                format!("reconnecting (attempt {})", self.reconnect_attempt)
            }
            ConnectionPhase::Connecting => "connecting".to_string(),
            ConnectionPhase::Connected => "connected".to_string(),
            ConnectionPhase::Disconnected => match &self.last_error {
                Some(err) => format!("disconnected: {err}"),
                None => "disconnected".to_string(),
            },
        }
    }
}

enum Cmd {
    Connect,
    Disconnect { ack: oneshot::Sender<()> },
    Shutdown { ack: oneshot::Sender<()> },
    Subscribe { channel: ChannelId },
    Unsubscribe { channel: ChannelId },
}

pub struct ConnectionManager {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    status_rx: watch::Receiver<ConnectionStatus>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn spawn(
        config: ConnectionConfig,
        connector: Arc<dyn TransportConnector>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus {
            phase: ConnectionPhase::Idle,
            reconnect_attempt: 0,
            last_error: None,
        });
        let runner = Runner {
            config,
            connector,
            registry,
            cmd_rx,
            status_tx,
            client_id: Uuid::new_v4().to_string(),
        };
        let task = tokio::spawn(run(runner));
        Self {
            cmd_tx,
            status_rx,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Start dialing. Returns immediately; progress is visible through
    /// the status watch.
    pub fn connect(&self) {
        let _ = self.cmd_tx.send(Cmd::Connect);
    }

    /// Drop the link and stop reconnecting. Resolves once the task has
    /// cancelled its reconnect timer and any in-flight repair retries.
    pub async fn disconnect(&self) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Disconnect { ack }).is_ok() {
            let _ = done.await;
        }
    }

    /// Disconnect and terminate the task.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Shutdown { ack }).is_ok() {
            let _ = done.await;
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Tell a live connection about a new subscription. No-op while
    /// offline; the next subscribe frame carries the full set anyway.
    pub fn notify_subscribed(&self, channel: &str) {
        let _ = self.cmd_tx.send(Cmd::Subscribe {
            channel: channel.to_string(),
        });
    }

    pub fn notify_unsubscribed(&self, channel: &str) {
        let _ = self.cmd_tx.send(Cmd::Unsubscribe {
            channel: channel.to_string(),
        });
    }
}

/// One tracked backfill conversation for a channel in catch-up.
struct Repair {
    from_seq: Seq,
    to_seq: Seq,
    attempts: u32,
    phase: RepairPhase,
}

impl Repair {
    fn new(from_seq: Seq, to_seq: Seq) -> Self {
        Self {
            from_seq,
            to_seq,
            attempts: 0,
            phase: RepairPhase::RetryAt { at: Instant::now() },
        }
    }
}

enum RepairPhase {
    InFlight { deadline: Instant },
    RetryAt { at: Instant },
}

enum DialEnd {
    Connected(Box<dyn Transport>),
    Failed(String),
    ToIdle,
    Stop,
}

enum SessionEnd {
    Retry(String),
    ToIdle,
    Stop,
}

enum BackoffEnd {
    Elapsed,
    ToIdle,
    Stop,
}

struct Runner {
    config: ConnectionConfig,
    connector: Arc<dyn TransportConnector>,
    registry: Arc<SubscriptionRegistry>,
    cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    status_tx: watch::Sender<ConnectionStatus>,
    client_id: String,
}

async fn run(mut runner: Runner) {
    loop {
        // Idle: nothing scheduled until someone asks to connect.
        match runner.cmd_rx.recv().await {
            None => return,
            Some(Cmd::Connect) => {}
            Some(Cmd::Disconnect { ack }) => {
                let _ = ack.send(());
                continue;
            }
            Some(Cmd::Shutdown { ack }) => {
                let _ = ack.send(());
                return;
            }
            Some(Cmd::Subscribe { .. }) | Some(Cmd::Unsubscribe { .. }) => continue,
        }

        let mut attempt: u32 = 0;
        loop {
            runner.publish(ConnectionPhase::Connecting, attempt, None);
            let end = match runner.dial().await {
                DialEnd::Connected(transport) => {
                    // A healthy session closes out the outage; the next
                    // drop starts counting (and backing off) from one.
                    attempt = 0;
                    runner.run_connected(transport).await
                }
                DialEnd::Failed(reason) => SessionEnd::Retry(reason),
                DialEnd::ToIdle => break,
                DialEnd::Stop => return,
            };
            match end {
                SessionEnd::Retry(reason) => {
                    attempt += 1;
                    let delay = backoff_delay(&runner.config, attempt);
                    warn!(
                        target = "vigil::connection",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason,
                        "link down; retrying"
                    );
                    runner.publish(ConnectionPhase::Disconnected, attempt, Some(reason));
                    match runner.wait_backoff(delay).await {
                        BackoffEnd::Elapsed => continue,
                        BackoffEnd::ToIdle => break,
                        BackoffEnd::Stop => return,
                    }
                }
                SessionEnd::ToIdle => break,
                SessionEnd::Stop => return,
            }
        }
    }
}

impl Runner {
    fn publish(&self, phase: ConnectionPhase, reconnect_attempt: u32, last_error: Option<String>) {
        self.status_tx.send_replace(ConnectionStatus {
            phase,
            reconnect_attempt,
            last_error,
        });
    }

    /// Dial while still servicing commands, so a disconnect issued
    /// mid-dial abandons the attempt instead of queueing behind it.
    async fn dial(&mut self) -> DialEnd {
        let connector = self.connector.clone();
        let connect_timeout = self.config.connect_timeout;
        let connect = async move {
            match timeout(connect_timeout, connector.connect()).await {
                Ok(Ok(transport)) => Ok(transport),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err("connect timed out".to_string()),
            }
        };
        tokio::pin!(connect);
        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(transport) => DialEnd::Connected(transport),
                        Err(reason) => DialEnd::Failed(reason),
                    };
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return DialEnd::Stop,
                    Some(Cmd::Disconnect { ack }) => {
                        self.publish(ConnectionPhase::Idle, 0, None);
                        let _ = ack.send(());
                        return DialEnd::ToIdle;
                    }
                    Some(Cmd::Shutdown { ack }) => {
                        let _ = ack.send(());
                        return DialEnd::Stop;
                    }
                    // Already connecting; membership changes ride the
                    // subscribe frame sent once the dial lands.
                    Some(Cmd::Connect)
                    | Some(Cmd::Subscribe { .. })
                    | Some(Cmd::Unsubscribe { .. }) => {}
                },
            }
        }
    }

    /// Sleep out the reconnect delay, but let commands cut it short.
    async fn wait_backoff(&mut self, delay: Duration) -> BackoffEnd {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return BackoffEnd::Elapsed,
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return BackoffEnd::Stop,
                    Some(Cmd::Connect) => return BackoffEnd::Elapsed,
                    Some(Cmd::Disconnect { ack }) => {
                        self.publish(ConnectionPhase::Idle, 0, None);
                        let _ = ack.send(());
                        return BackoffEnd::ToIdle;
                    }
                    Some(Cmd::Shutdown { ack }) => {
                        let _ = ack.send(());
                        return BackoffEnd::Stop;
                    }
                    Some(Cmd::Subscribe { .. }) | Some(Cmd::Unsubscribe { .. }) => {}
                },
            }
        }
    }

    async fn run_connected(&mut self, mut transport: Box<dyn Transport>) -> SessionEnd {
        let resume = self.registry.resume_points();
        let channel_count = resume.len();
        let frame = ClientFrame::Subscribe {
            client: self.client_id.clone(),
            channels: resume,
        };
        if let Err(err) = send_frame(transport.as_ref(), &frame).await {
            return SessionEnd::Retry(err.to_string());
        }
        self.publish(ConnectionPhase::Connected, 0, None);
        info!(
            target = "vigil::connection",
            channels = channel_count,
            "connected and subscribed"
        );

        // Channels that were mid catch-up when the last link dropped
        // get their repair restarted right away, attempts reset.
        let mut repairs: HashMap<ChannelId, Repair> = HashMap::new();
        for (channel, record) in self.registry.sync_records() {
            if record.catch_up {
                let mut repair = Repair::new(record.last_applied_seq + 1, record.highest_seen_seq);
                if let Err(err) = self.request_backfill(transport.as_ref(), &channel, &mut repair).await {
                    return SessionEnd::Retry(err);
                }
                repairs.insert(channel, repair);
            }
        }

        let mut sweep = interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_ping = Instant::now();
        let mut awaiting_pong: Option<Instant> = None;

        enum Step {
            Cmd(Option<Cmd>),
            Inbound(Option<Vec<u8>>),
            Sweep,
        }

        loop {
            // Both recv calls are channel reads underneath, so losing
            // the race in select drops nothing.
            let step = tokio::select! {
                cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
                inbound = transport.recv() => Step::Inbound(inbound),
                _ = sweep.tick() => Step::Sweep,
            };
            match step {
                Step::Cmd(None) => return SessionEnd::Stop,
                Step::Cmd(Some(Cmd::Connect)) => {}
                Step::Cmd(Some(Cmd::Disconnect { ack })) => {
                    repairs.clear();
                    self.publish(ConnectionPhase::Idle, 0, None);
                    let _ = ack.send(());
                    return SessionEnd::ToIdle;
                }
                Step::Cmd(Some(Cmd::Shutdown { ack })) => {
                    let _ = ack.send(());
                    return SessionEnd::Stop;
                }
                Step::Cmd(Some(Cmd::Subscribe { channel })) => {
                    let resume_from_seq = self
                        .registry
                        .sync_records()
                        .into_iter()
                        .find(|(id, _)| id == &channel)
                        .map(|(_, record)| record.last_applied_seq)
                        .unwrap_or(0);
                    let frame = ClientFrame::Subscribe {
                        client: self.client_id.clone(),
                        channels: vec![ResumePoint {
                            channel,
                            resume_from_seq,
                        }],
                    };
                    if let Err(err) = send_frame(transport.as_ref(), &frame).await {
                        return SessionEnd::Retry(err.to_string());
                    }
                }
                Step::Cmd(Some(Cmd::Unsubscribe { channel })) => {
                    repairs.remove(&channel);
                    let frame = ClientFrame::Unsubscribe { channel };
                    if let Err(err) = send_frame(transport.as_ref(), &frame).await {
                        return SessionEnd::Retry(err.to_string());
                    }
                }
                Step::Inbound(None) => {
                    return SessionEnd::Retry("connection closed by peer".to_string());
                }
                Step::Inbound(Some(bytes)) => match decode_server(&bytes) {
                    Ok(frame) => {
                        if let Some(end) = self
                            .handle_frame(transport.as_ref(), frame, &mut repairs, &mut awaiting_pong)
                            .await
                        {
                            return end;
                        }
                    }
                    Err(err) => {
                        warn!(
                            target = "vigil::connection",
                            error = %err,
                            "dropping malformed frame"
                        );
                    }
                },
                Step::Sweep => {
                    if let Some(deadline) = awaiting_pong {
                        if Instant::now() >= deadline {
                            return SessionEnd::Retry("keepalive timed out".to_string());
                        }
                    } else if last_ping.elapsed() >= self.config.ping_interval {
                        let frame = ClientFrame::Ping {
                            timestamp_ms: crate::now_ms(),
                        };
                        if let Err(err) = send_frame(transport.as_ref(), &frame).await {
                            return SessionEnd::Retry(err.to_string());
                        }
                        last_ping = Instant::now();
                        awaiting_pong = Some(Instant::now() + self.config.pong_timeout);
                    }
                    if let Err(err) = self.sweep_repairs(transport.as_ref(), &mut repairs).await {
                        return SessionEnd::Retry(err);
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        transport: &dyn Transport,
        frame: ServerFrame,
        repairs: &mut HashMap<ChannelId, Repair>,
        awaiting_pong: &mut Option<Instant>,
    ) -> Option<SessionEnd> {
        match frame {
            ServerFrame::Event(event) => {
                let channel = event.channel.clone();
                match self.registry.ingest(event) {
                    IngestOutcome::Applied { .. }
                    | IngestOutcome::Duplicate
                    | IngestOutcome::Ignored => {}
                    IngestOutcome::Gap { from_seq, to_seq } => {
                        if let Err(err) = self
                            .start_repair(transport, repairs, channel, from_seq, to_seq)
                            .await
                        {
                            return Some(SessionEnd::Retry(err));
                        }
                    }
                }
                None
            }
            ServerFrame::Backfill {
                channel,
                from_seq,
                to_seq,
                events,
                complete,
            } => {
                debug!(
                    target = "vigil::connection",
                    channel,
                    from_seq,
                    to_seq,
                    count = events.len(),
                    complete,
                    "backfill response"
                );
                match self.registry.apply_backfill(&channel, events) {
                    BackfillOutcome::CaughtUp => {
                        repairs.remove(&channel);
                        info!(target = "vigil::connection", channel, "catch-up complete");
                    }
                    BackfillOutcome::StillMissing { from_seq, to_seq } => {
                        let mut repair = repairs
                            .remove(&channel)
                            .unwrap_or_else(|| Repair::new(from_seq, to_seq));
                        repair.from_seq = from_seq;
                        repair.to_seq = to_seq;
                        if repair.attempts >= self.config.backfill_max_attempts {
                            self.give_up_repair(&channel, &repair);
                        } else if let Err(err) =
                            self.request_backfill(transport, &channel, &mut repair).await
                        {
                            return Some(SessionEnd::Retry(err));
                        } else {
                            repairs.insert(channel, repair);
                        }
                    }
                }
                None
            }
            ServerFrame::SubscribeAck { channels } => {
                debug!(
                    target = "vigil::connection",
                    count = channels.len(),
                    "subscription acknowledged"
                );
                None
            }
            ServerFrame::Pong { .. } => {
                *awaiting_pong = None;
                None
            }
            ServerFrame::Error {
                code,
                message,
                recoverable,
            } => {
                warn!(
                    target = "vigil::connection",
                    code = code.0,
                    message,
                    recoverable,
                    "backend reported an error"
                );
                None
            }
        }
    }

    /// Arm (or widen) the repair entry for a channel that just
    /// reported a gap. A fresh entry fires its first request
    /// immediately; an existing one keeps its in-flight request and
    /// only widens the tracked range.
    async fn start_repair(
        &self,
        transport: &dyn Transport,
        repairs: &mut HashMap<ChannelId, Repair>,
        channel: ChannelId,
        from_seq: Seq,
        to_seq: Seq,
    ) -> Result<(), String> {
        match repairs.get_mut(&channel) {
            Some(repair) => {
                repair.from_seq = from_seq;
                repair.to_seq = to_seq;
                Ok(())
            }
            None => {
                let mut repair = Repair::new(from_seq, to_seq);
                self.request_backfill(transport, &channel, &mut repair).await?;
                repairs.insert(channel, repair);
                Ok(())
            }
        }
    }

    async fn request_backfill(
        &self,
        transport: &dyn Transport,
        channel: &str,
        repair: &mut Repair,
    ) -> Result<(), String> {
        repair.attempts += 1;
        debug!(
            target = "vigil::connection",
            channel,
            from_seq = repair.from_seq,
            to_seq = repair.to_seq,
            attempt = repair.attempts,
            "requesting backfill"
        );
        let frame = ClientFrame::BackfillRequest {
            channel: channel.to_string(),
            from_seq: repair.from_seq,
            to_seq: repair.to_seq,
        };
        send_frame(transport, &frame)
            .await
            .map_err(|err| err.to_string())?;
        repair.phase = RepairPhase::InFlight {
            deadline: Instant::now() + self.config.backfill_timeout,
        };
        Ok(())
    }

    /// Time out stale repair requests and fire the ones whose retry
    /// delay has elapsed.
    async fn sweep_repairs(
        &self,
        transport: &dyn Transport,
        repairs: &mut HashMap<ChannelId, Repair>,
    ) -> Result<(), String> {
        let now = Instant::now();
        let due: Vec<ChannelId> = repairs
            .iter()
            .filter(|(_, repair)| match repair.phase {
                RepairPhase::InFlight { deadline } => now >= deadline,
                RepairPhase::RetryAt { at } => now >= at,
            })
            .map(|(channel, _)| channel.clone())
            .collect();
        for channel in due {
            let (in_flight, exhausted) = match repairs.get(&channel) {
                Some(repair) => (
                    matches!(repair.phase, RepairPhase::InFlight { .. }),
                    repair.attempts >= self.config.backfill_max_attempts,
                ),
                None => continue,
            };
            if in_flight && exhausted {
                if let Some(repair) = repairs.remove(&channel) {
                    self.give_up_repair(&channel, &repair);
                }
                continue;
            }
            let Some(repair) = repairs.get_mut(&channel) else {
                continue;
            };
            if in_flight {
                warn!(
                    target = "vigil::connection",
                    channel,
                    attempt = repair.attempts,
                    "backfill request timed out"
                );
                repair.phase = RepairPhase::RetryAt {
                    at: now + self.config.backfill_retry,
                };
            } else {
                self.request_backfill(transport, &channel, repair).await?;
            }
        }
        Ok(())
    }

    /// The channel stays flagged as catching up in the registry; the
    /// next successful reconnect restarts repair with fresh attempts.
    fn give_up_repair(&self, channel: &str, repair: &Repair) {
        warn!(
            target = "vigil::connection",
            channel,
            from_seq = repair.from_seq,
            to_seq = repair.to_seq,
            attempts = repair.attempts,
            "backfill attempts exhausted"
        );
    }
}

async fn send_frame(transport: &dyn Transport, frame: &ClientFrame) -> Result<(), TransportError> {
    let text = encode_client(frame).map_err(|err| TransportError::Send(err.to_string()))?;
    transport.send(text.as_bytes()).await
}

fn backoff_delay(config: &ConnectionConfig, attempt: u32) -> Duration {
    let base = backoff_base_ms(config, attempt);
    let jitter = if base == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=base / 4)
    };
    Duration::from_millis(base + jitter)
}

/// Exponential growth from `reconnect_initial`, capped at
/// `reconnect_max`. Attempt numbering starts at 1.
fn backoff_base_ms(config: &ConnectionConfig, attempt: u32) -> u64 {
    let initial = config.reconnect_initial.as_millis() as u64;
    let max = config.reconnect_max.as_millis() as u64;
    let shift = attempt.saturating_sub(1).min(16);
    initial.saturating_mul(1u64 << shift).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = config();
        assert_eq!(backoff_base_ms(&config, 1), 1_000);
        assert_eq!(backoff_base_ms(&config, 2), 2_000);
        assert_eq!(backoff_base_ms(&config, 3), 4_000);
        assert_eq!(backoff_base_ms(&config, 5), 16_000);
        assert_eq!(backoff_base_ms(&config, 6), 30_000);
        assert_eq!(backoff_base_ms(&config, 60), 30_000);
    }

    #[test]
    fn backoff_jitter_stays_in_band() {
        let config = config();
        for attempt in 1..=8 {
            let base = backoff_base_ms(&config, attempt);
            for _ in 0..32 {
                let delay = backoff_delay(&config, attempt).as_millis() as u64;
                assert!(delay >= base);
                assert!(delay <= base + base / 4);
            }
        }
    }

    #[test]
    fn status_descriptions_read_well() {
        let status = ConnectionStatus {
            phase: ConnectionPhase::Idle,
            reconnect_attempt: 0,
            last_error: None,
        };
        assert_eq!(status.describe(), "idle");
        assert!(!status.is_connected());

        let status = ConnectionStatus {
            phase: ConnectionPhase::Connecting,
            reconnect_attempt: 3,
            last_error: None,
        };
        assert_eq!(status.describe(), "reconnecting (attempt 3)");

        let status = ConnectionStatus {
            phase: ConnectionPhase::Connected,
            reconnect_attempt: 0,
            last_error: None,
        };
        assert!(status.is_connected());

        let status = ConnectionStatus {
            phase: ConnectionPhase::Disconnected,
            reconnect_attempt: 1,
            last_error: Some("keepalive timed out".to_string()),
        };
        assert_eq!(status.describe(), "disconnected: keepalive timed out");
    }
}
