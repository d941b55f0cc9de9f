//! Command-line surface: a headless watch mode plus offline state
//! inspection and maintenance.

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use update_bus::{Bus, LocalBus};

use crate::client::VigilClient;
use crate::config::Config;
use crate::registry::{Notice, SubscriptionRegistry};
use crate::storage::{FileStore, StateStore};

#[derive(Parser, Debug)]
#[command(
    name = "vigil",
    about = "Subscribe to alert channels and keep an ordered, deduplicated local event cache",
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "VIGIL_SERVER_URL",
        help = "WebSocket URL of the alert backend"
    )]
    pub server: Option<String>,

    #[arg(
        long = "state-dir",
        global = true,
        env = "VIGIL_STATE_DIR",
        value_name = "PATH",
        help = "Directory for persisted state (platform default when omitted)"
    )]
    pub state_dir: Option<std::path::PathBuf>,

    #[arg(
        long = "log-filter",
        global = true,
        env = "RUST_LOG",
        help = "Tracing filter, e.g. info,vigil=debug"
    )]
    pub log_filter: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect and stream incoming events to stdout.
    Watch(WatchArgs),
    /// Print channel cursors and cache counters from local state.
    Stats,
    /// Wipe cached events, unread counters, and saved events while
    /// keeping the subscribed channels.
    Clear,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[arg(
        long = "channel",
        value_name = "CHANNEL",
        help = "Channel to subscribe to; repeat for several"
    )]
    pub channels: Vec<String>,

    #[arg(long, help = "Mark events read as they are printed")]
    pub mark_read: bool,
}

/// Merge CLI overrides onto the environment-derived config.
pub fn build_config(cli: &Cli) -> Config {
    let mut config = Config::from_env();
    if let Some(server) = &cli.server {
        config.server_url = server.clone();
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir = Some(dir.clone());
    }
    if let Some(filter) = &cli.log_filter {
        config.log_filter = filter.clone();
    }
    config
}

pub async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    match cli.command {
        Command::Watch(args) => run_watch(config, args).await,
        Command::Stats => run_stats(config),
        Command::Clear => run_clear(config),
    }
}

async fn run_watch(config: Config, args: WatchArgs) -> anyhow::Result<()> {
    let client = VigilClient::new(config)?;
    for channel in &args.channels {
        client.subscribe(channel);
    }
    if client.registry().channels().is_empty() {
        anyhow::bail!("no channels subscribed; pass --channel at least once");
    }

    let mut notices = client.notices();
    let mut status = client.watch_status();
    client.connect();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(target = "vigil::cli", "interrupt; shutting down");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let line = status.borrow().describe();
                eprintln!("* {line}");
            }
            notice = notices.recv() => match notice {
                Ok(message) => print_notice(&client, message.payload, args.mark_read),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target = "vigil::cli", skipped, "notice stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
    Ok(())
}

fn print_notice(client: &VigilClient, notice: Notice, mark_read: bool) {
    match notice {
        Notice::EventApplied { event } => {
            println!("[{}] #{} {}", event.channel, event.seq, event.payload);
            if mark_read {
                client.registry().mark_read(&event.channel, event.seq);
            }
        }
        Notice::CatchUpStarted { channel } => eprintln!("* {channel}: catching up"),
        Notice::CatchUpFinished { channel } => eprintln!("* {channel}: caught up"),
        Notice::Cleared => eprintln!("* cache cleared"),
        Notice::UnreadChanged { .. } => {}
    }
}

fn run_stats(config: Config) -> anyhow::Result<()> {
    let registry = open_local_registry(&config)?;
    let stats = registry.stats();
    println!("channels: {}", stats.channel_count);
    println!("events:   {}", stats.total_events);
    println!("saved:    {}", stats.saved_count);
    for channel in &stats.per_channel {
        println!(
            "  {}  applied={} seen={} unread={} cached={}{}",
            channel.channel,
            channel.last_applied_seq,
            channel.highest_seen_seq,
            channel.unread,
            channel.cached,
            if channel.catch_up { "  (catching up)" } else { "" },
        );
    }
    Ok(())
}

fn run_clear(config: Config) -> anyhow::Result<()> {
    let registry = open_local_registry(&config)?;
    registry.clear_cached_data()?;
    println!("cached events, counters, and saved events cleared; subscriptions kept");
    Ok(())
}

/// Open the persisted registry without spinning up a connection; used
/// by the offline subcommands.
fn open_local_registry(config: &Config) -> anyhow::Result<SubscriptionRegistry> {
    let dir = match &config.state_dir {
        Some(dir) => dir.clone(),
        None => FileStore::default_dir()?,
    };
    let store: Arc<dyn StateStore> = Arc::new(FileStore::new(dir)?);
    let bus: Arc<dyn Bus<Notice>> = Arc::new(LocalBus::new());
    Ok(SubscriptionRegistry::open(
        store,
        bus,
        config.max_cached_events,
    ))
}
