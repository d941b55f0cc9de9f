//! Subscription registry: the single owner of channel, cache, and
//! read-state data.
//!
//! Every mutation funnels through one mutex so ingest, backfill,
//! reads, and persistence all observe a consistent picture. Sequencing
//! decisions are delegated to the [`SyncTracker`]; this module applies
//! the side effects (cache insert, unread counters, eviction,
//! persistence marking) only when the tracker says `Apply`. Storage
//! writes always happen after the state lock is released, under a
//! flush gate that keeps blobs landing on disk in snapshot order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use update_bus::Bus;
use vigil_proto::{EventFrame, ResumePoint};

use crate::storage::{StateStore, StoreError};
use crate::sync::{Admission, ChannelSyncRecord, SyncTracker};

pub use vigil_proto::{ChannelId, Seq};

/// Topic all registry notices are published on.
pub const NOTICE_TOPIC: &str = "updates";

const KEY_CHANNELS: &str = "channels";
const KEY_EVENTS: &str = "events";
const KEY_SAVED: &str = "saved";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub subscribed_at_ms: i64,
}

/// A cached event. Identity is `(channel, seq)`; the payload never
/// participates in dedup decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub channel: ChannelId,
    pub seq: Seq,
    pub payload: serde_json::Value,
    pub timestamp_ms: i64,
    pub read: bool,
    pub saved: bool,
}

impl Event {
    fn from_frame(frame: EventFrame) -> Self {
        Self {
            channel: frame.channel,
            seq: frame.seq,
            payload: frame.payload,
            timestamp_ms: frame.timestamp_ms,
            read: false,
            saved: false,
        }
    }

    pub fn id(&self) -> EventId {
        EventId {
            channel: self.channel.clone(),
            seq: self.seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub channel: ChannelId,
    pub seq: Seq,
}

/// Published on [`NOTICE_TOPIC`] whenever observable state changes.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    EventApplied { event: Event },
    UnreadChanged { channel: ChannelId, unread: u64 },
    CatchUpStarted { channel: ChannelId },
    CatchUpFinished { channel: ChannelId },
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Event (and possibly parked successors) landed in the cache.
    Applied { last_applied_seq: Seq },
    Duplicate,
    /// Event was parked; the caller should request backfill for the
    /// inclusive range.
    Gap { from_seq: Seq, to_seq: Seq },
    /// Channel is not subscribed; the event was dropped.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    CaughtUp,
    /// The supplied batch left a hole; re-request this range.
    StillMissing { from_seq: Seq, to_seq: Seq },
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelOverview {
    pub channel: ChannelId,
    pub last_applied_seq: Seq,
    pub highest_seen_seq: Seq,
    pub total_received: u64,
    pub catch_up: bool,
    pub cached: usize,
    pub unread: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub channel_count: usize,
    pub total_events: u64,
    pub saved_count: usize,
    pub per_channel: Vec<ChannelOverview>,
}

#[derive(Default)]
struct RegistryState {
    channels: BTreeMap<ChannelId, Channel>,
    tracker: SyncTracker,
    caches: HashMap<ChannelId, VecDeque<Event>>,
    unread: HashMap<ChannelId, u64>,
    /// Events that arrived ahead of an open gap, keyed by seq, waiting
    /// for the hole to fill.
    pending: HashMap<ChannelId, BTreeMap<Seq, Event>>,
    saved: BTreeMap<EventId, Event>,
    channels_dirty: bool,
    events_dirty: bool,
    saved_dirty: bool,
}

#[derive(Serialize, Deserialize, Default)]
struct ChannelsBlob {
    channels: Vec<Channel>,
}

#[derive(Serialize, Deserialize, Default)]
struct EventsBlob {
    tracker: SyncTracker,
    caches: HashMap<ChannelId, Vec<Event>>,
    unread: HashMap<ChannelId, u64>,
}

#[derive(Serialize, Deserialize, Default)]
struct SavedBlob {
    events: Vec<Event>,
}

pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
    /// Held across every snapshot-and-write pair so blobs land on disk
    /// in snapshot order; a slow writer can never overwrite a newer
    /// blob with an older one. Always acquired before `state`, never
    /// while holding it.
    flush: Mutex<()>,
    store: Arc<dyn StateStore>,
    notices: Arc<dyn Bus<Notice>>,
    max_cached_events: usize,
}

impl SubscriptionRegistry {
    /// Restore persisted state from `store`, tolerating missing or
    /// corrupt blobs by starting that portion fresh.
    pub fn open(
        store: Arc<dyn StateStore>,
        notices: Arc<dyn Bus<Notice>>,
        max_cached_events: usize,
    ) -> Self {
        let mut state = RegistryState::default();

        if let Some(blob) = load_blob::<ChannelsBlob>(store.as_ref(), KEY_CHANNELS) {
            for channel in blob.channels {
                state.channels.insert(channel.id.clone(), channel);
            }
        }
        let subscribed: Vec<ChannelId> = state.channels.keys().cloned().collect();

        if let Some(blob) = load_blob::<EventsBlob>(store.as_ref(), KEY_EVENTS) {
            state.tracker = blob.tracker;
            for (channel, events) in blob.caches {
                if !state.channels.contains_key(&channel) {
                    continue;
                }
                let mut unread = blob
                    .unread
                    .get(&channel)
                    .copied()
                    .unwrap_or_else(|| events.iter().filter(|e| !e.read).count() as u64);
                let mut cache: VecDeque<Event> = events.into();
                while cache.len() > max_cached_events {
                    if let Some(evicted) = cache.pop_front() {
                        if !evicted.read {
                            unread = unread.saturating_sub(1);
                        }
                    }
                }
                state.caches.insert(channel.clone(), cache);
                state.unread.insert(channel, unread);
            }
            let tracked: Vec<ChannelId> = state
                .tracker
                .channels()
                .map(|(channel, _)| channel.clone())
                .collect();
            for channel in tracked {
                if !state.channels.contains_key(&channel) {
                    state.tracker.forget(&channel);
                }
            }
        }

        if let Some(blob) = load_blob::<SavedBlob>(store.as_ref(), KEY_SAVED) {
            for event in blob.events {
                state.saved.insert(event.id(), event);
            }
        }

        for channel in &subscribed {
            state.tracker.track(channel);
            state.caches.entry(channel.clone()).or_default();
            state.unread.entry(channel.clone()).or_insert(0);
        }

        debug!(
            target = "vigil::registry",
            channels = state.channels.len(),
            saved = state.saved.len(),
            "registry restored"
        );

        Self {
            state: Mutex::new(state),
            flush: Mutex::new(()),
            store,
            notices,
            max_cached_events,
        }
    }

    /// Add a channel. Returns false (and does nothing) if already
    /// subscribed. The channel list is persisted right away.
    pub fn subscribe(&self, channel: &str) -> bool {
        {
            let mut state = self.state.lock();
            if state.channels.contains_key(channel) {
                return false;
            }
            state.channels.insert(
                channel.to_string(),
                Channel {
                    id: channel.to_string(),
                    subscribed_at_ms: crate::now_ms(),
                },
            );
            state.tracker.track(channel);
            state.caches.entry(channel.to_string()).or_default();
            state.unread.entry(channel.to_string()).or_insert(0);
        }
        self.persist_channels();
        true
    }

    /// Remove a channel together with its cache, counters, and sync
    /// record. Saved events from the channel stay in the saved set.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        {
            let mut state = self.state.lock();
            if state.channels.remove(channel).is_none() {
                return false;
            }
            state.tracker.forget(channel);
            state.caches.remove(channel);
            state.unread.remove(channel);
            state.pending.remove(channel);
            state.events_dirty = true;
        }
        self.persist_channels();
        true
    }

    /// Route one live event through admission. Side effects happen
    /// only on `Apply`; gapped events are parked until backfill or
    /// later live arrivals fill the hole.
    pub fn ingest(&self, frame: EventFrame) -> IngestOutcome {
        let mut notices = Vec::new();
        let outcome = {
            let mut state = self.state.lock();
            if !state.channels.contains_key(&frame.channel) {
                debug!(
                    target = "vigil::registry",
                    channel = %frame.channel,
                    seq = frame.seq,
                    "dropping event for unsubscribed channel"
                );
                return IngestOutcome::Ignored;
            }
            let channel = frame.channel.clone();
            let was_catch_up = in_catch_up(&state, &channel);
            match state.tracker.admit(&channel, frame.seq) {
                Admission::Duplicate => IngestOutcome::Duplicate,
                Admission::Apply => {
                    apply_event(
                        &mut state,
                        Event::from_frame(frame),
                        &mut notices,
                        self.max_cached_events,
                    );
                    drain_pending(&mut state, &channel, &mut notices, self.max_cached_events);
                    let record = state.tracker.record(&channel).unwrap_or_default();
                    push_unread_notice(&state, &channel, &mut notices);
                    if was_catch_up && !record.catch_up {
                        notices.push(Notice::CatchUpFinished {
                            channel: channel.clone(),
                        });
                    }
                    state.events_dirty = true;
                    IngestOutcome::Applied {
                        last_applied_seq: record.last_applied_seq,
                    }
                }
                Admission::Gap { from_seq, to_seq } => {
                    park_pending(
                        &mut state,
                        &channel,
                        Event::from_frame(frame),
                        self.max_cached_events,
                    );
                    // The tracker advanced highest_seen, which lives in
                    // the events blob even though the parked event does
                    // not.
                    state.events_dirty = true;
                    if !was_catch_up {
                        notices.push(Notice::CatchUpStarted {
                            channel: channel.clone(),
                        });
                    }
                    IngestOutcome::Gap { from_seq, to_seq }
                }
            }
        };
        self.publish(notices);
        outcome
    }

    /// Apply a batch of backfilled events through the same admission
    /// path, then drain any parked successors. Returns whether the
    /// channel is caught up or which hole remains.
    pub fn apply_backfill(&self, channel: &str, events: Vec<EventFrame>) -> BackfillOutcome {
        let mut notices = Vec::new();
        let outcome = {
            let mut state = self.state.lock();
            if !state.channels.contains_key(channel) {
                return BackfillOutcome::CaughtUp;
            }
            let was_catch_up = in_catch_up(&state, channel);
            let mut frames = events;
            frames.sort_by_key(|frame| frame.seq);
            let mut applied = 0usize;
            for frame in frames {
                if frame.channel != channel {
                    warn!(
                        target = "vigil::registry",
                        expected = channel,
                        got = %frame.channel,
                        seq = frame.seq,
                        "backfill batch contained a frame for another channel"
                    );
                    continue;
                }
                match state.tracker.admit(channel, frame.seq) {
                    Admission::Apply => {
                        apply_event(
                            &mut state,
                            Event::from_frame(frame),
                            &mut notices,
                            self.max_cached_events,
                        );
                        applied += 1;
                    }
                    Admission::Duplicate => {}
                    Admission::Gap { .. } => {
                        // The response itself skipped sequences; park
                        // and let the remainder request cover it.
                        park_pending(
                            &mut state,
                            channel,
                            Event::from_frame(frame),
                            self.max_cached_events,
                        );
                    }
                }
            }
            drain_pending(&mut state, channel, &mut notices, self.max_cached_events);
            if applied > 0 {
                state.events_dirty = true;
                push_unread_notice(&state, channel, &mut notices);
            }
            let record = state.tracker.record(channel).unwrap_or_default();
            debug!(
                target = "vigil::registry",
                channel,
                applied,
                last_applied_seq = record.last_applied_seq,
                catch_up = record.catch_up,
                "backfill batch processed"
            );
            if record.catch_up {
                BackfillOutcome::StillMissing {
                    from_seq: record.last_applied_seq + 1,
                    to_seq: record.highest_seen_seq,
                }
            } else {
                if was_catch_up {
                    notices.push(Notice::CatchUpFinished {
                        channel: channel.to_string(),
                    });
                }
                BackfillOutcome::CaughtUp
            }
        };
        self.publish(notices);
        outcome
    }

    /// Snapshot of a channel's cache, ascending by seq.
    pub fn events(&self, channel: &str) -> Vec<Event> {
        self.state
            .lock()
            .caches
            .get(channel)
            .map(|cache| cache.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, channel: &str) -> u64 {
        self.state.lock().unread.get(channel).copied().unwrap_or(0)
    }

    /// Mark one cached event read. Idempotent; returns true when the
    /// flag actually flipped.
    pub fn mark_read(&self, channel: &str, seq: Seq) -> bool {
        let mut notices = Vec::new();
        let changed = {
            let mut state = self.state.lock();
            let mut changed = false;
            if let Some(event) = state
                .caches
                .get_mut(channel)
                .and_then(|cache| cache.iter_mut().find(|e| e.seq == seq))
            {
                if !event.read {
                    event.read = true;
                    changed = true;
                }
            }
            if changed {
                let unread = state.unread.entry(channel.to_string()).or_insert(0);
                *unread = unread.saturating_sub(1);
                let id = EventId {
                    channel: channel.to_string(),
                    seq,
                };
                if let Some(saved) = state.saved.get_mut(&id) {
                    saved.read = true;
                    state.saved_dirty = true;
                }
                state.events_dirty = true;
                push_unread_notice(&state, channel, &mut notices);
            }
            changed
        };
        self.publish(notices);
        changed
    }

    /// Mark every cached event on the channel read. Returns how many
    /// flags flipped.
    pub fn mark_all_read(&self, channel: &str) -> u64 {
        let mut notices = Vec::new();
        let flipped = {
            let mut state = self.state.lock();
            let mut flipped = 0u64;
            let mut read_ids = Vec::new();
            if let Some(cache) = state.caches.get_mut(channel) {
                for event in cache.iter_mut() {
                    if !event.read {
                        event.read = true;
                        flipped += 1;
                        read_ids.push(event.seq);
                    }
                }
            }
            if flipped > 0 {
                state.unread.insert(channel.to_string(), 0);
                for seq in read_ids {
                    let id = EventId {
                        channel: channel.to_string(),
                        seq,
                    };
                    if let Some(saved) = state.saved.get_mut(&id) {
                        saved.read = true;
                        state.saved_dirty = true;
                    }
                }
                state.events_dirty = true;
                push_unread_notice(&state, channel, &mut notices);
            }
            flipped
        };
        self.publish(notices);
        flipped
    }

    /// Bookmark a cached event so it survives cache eviction and
    /// restarts. Returns false if the event is not in the cache.
    pub fn save_event(&self, channel: &str, seq: Seq) -> bool {
        let mut state = self.state.lock();
        let copy = match state
            .caches
            .get_mut(channel)
            .and_then(|cache| cache.iter_mut().find(|e| e.seq == seq))
        {
            Some(event) => {
                event.saved = true;
                event.clone()
            }
            None => return false,
        };
        state.saved.insert(copy.id(), copy);
        state.events_dirty = true;
        state.saved_dirty = true;
        true
    }

    pub fn unsave_event(&self, channel: &str, seq: Seq) -> bool {
        let mut state = self.state.lock();
        let id = EventId {
            channel: channel.to_string(),
            seq,
        };
        if state.saved.remove(&id).is_none() {
            return false;
        }
        if let Some(event) = state
            .caches
            .get_mut(channel)
            .and_then(|cache| cache.iter_mut().find(|e| e.seq == seq))
        {
            event.saved = false;
            state.events_dirty = true;
        }
        state.saved_dirty = true;
        true
    }

    /// Saved events across all channels, ordered by channel then seq.
    pub fn saved_events(&self) -> Vec<Event> {
        self.state.lock().saved.values().cloned().collect()
    }

    /// Distinct events ever applied, summed over all channels.
    pub fn total_event_count(&self) -> u64 {
        self.state
            .lock()
            .tracker
            .channels()
            .map(|(_, record)| record.total_received)
            .sum()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.state.lock().channels.values().cloned().collect()
    }

    /// Resume cursors for the subscribe frame, one per channel.
    pub fn resume_points(&self) -> Vec<ResumePoint> {
        let state = self.state.lock();
        state
            .channels
            .keys()
            .map(|channel| ResumePoint {
                channel: channel.clone(),
                resume_from_seq: state
                    .tracker
                    .record(channel)
                    .map(|record| record.last_applied_seq)
                    .unwrap_or(0),
            })
            .collect()
    }

    /// Current sync record per subscribed channel; used to re-arm
    /// repair after a reconnect.
    pub fn sync_records(&self) -> Vec<(ChannelId, ChannelSyncRecord)> {
        let state = self.state.lock();
        state
            .channels
            .keys()
            .map(|channel| {
                (
                    channel.clone(),
                    state.tracker.record(channel).unwrap_or_default(),
                )
            })
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        let per_channel: Vec<ChannelOverview> = state
            .channels
            .keys()
            .map(|channel| {
                let record = state.tracker.record(channel).unwrap_or_default();
                ChannelOverview {
                    channel: channel.clone(),
                    last_applied_seq: record.last_applied_seq,
                    highest_seen_seq: record.highest_seen_seq,
                    total_received: record.total_received,
                    catch_up: record.catch_up,
                    cached: state.caches.get(channel).map(|c| c.len()).unwrap_or(0),
                    unread: state.unread.get(channel).copied().unwrap_or(0),
                }
            })
            .collect();
        RegistryStats {
            channel_count: per_channel.len(),
            total_events: per_channel.iter().map(|c| c.total_received).sum(),
            saved_count: state.saved.len(),
            per_channel,
        }
    }

    /// Drop every cached event, unread counter, and saved event, and
    /// zero all sync records, but keep the subscribed channels. The
    /// next reconnect resubscribes from seq 0. Backs the user-facing
    /// "clear app data" action.
    pub fn clear_cached_data(&self) -> Result<(), StoreError> {
        {
            let mut state = self.state.lock();
            for cache in state.caches.values_mut() {
                cache.clear();
            }
            for unread in state.unread.values_mut() {
                *unread = 0;
            }
            state.pending.clear();
            state.saved.clear();
            state.tracker.reset_all();
            state.events_dirty = true;
            state.saved_dirty = true;
        }
        let result = self.force_save();
        self.publish(vec![Notice::Cleared]);
        result
    }

    /// Flush all three blobs now. Failed blobs stay dirty and are
    /// retried on the next flush.
    pub fn force_save(&self) -> Result<(), StoreError> {
        let _flush = self.flush.lock();
        let (channels, events, saved) = {
            let mut state = self.state.lock();
            state.channels_dirty = false;
            state.events_dirty = false;
            state.saved_dirty = false;
            (
                channels_blob(&state),
                events_blob(&state),
                saved_blob(&state),
            )
        };
        let mut first_err = None;
        self.write_blob(KEY_CHANNELS, &channels, DirtyFlag::Channels, &mut first_err);
        self.write_blob(KEY_EVENTS, &events, DirtyFlag::Events, &mut first_err);
        self.write_blob(KEY_SAVED, &saved, DirtyFlag::Saved, &mut first_err);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Flush only the blobs with unsaved changes; meant for the
    /// periodic flusher. Errors are logged and leave the dirty flag
    /// set.
    pub fn force_save_if_dirty(&self) {
        let _flush = self.flush.lock();
        let (channels, events, saved) = {
            let mut state = self.state.lock();
            let channels = state.channels_dirty.then(|| channels_blob(&state));
            let events = state.events_dirty.then(|| events_blob(&state));
            let saved = state.saved_dirty.then(|| saved_blob(&state));
            state.channels_dirty = false;
            state.events_dirty = false;
            state.saved_dirty = false;
            (channels, events, saved)
        };
        let mut first_err = None;
        if let Some(blob) = channels {
            self.write_blob(KEY_CHANNELS, &blob, DirtyFlag::Channels, &mut first_err);
        }
        if let Some(blob) = events {
            self.write_blob(KEY_EVENTS, &blob, DirtyFlag::Events, &mut first_err);
        }
        if let Some(blob) = saved {
            self.write_blob(KEY_SAVED, &blob, DirtyFlag::Saved, &mut first_err);
        }
    }

    fn write_blob<T: Serialize>(
        &self,
        key: &str,
        blob: &T,
        flag: DirtyFlag,
        first_err: &mut Option<StoreError>,
    ) {
        let bytes = match serde_json::to_vec(blob) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(target = "vigil::registry", key, error = %err, "state serialization failed");
                return;
            }
        };
        if let Err(err) = self.store.save(key, &bytes) {
            warn!(
                target = "vigil::registry",
                key,
                error = %err,
                "state write failed; will retry on next flush"
            );
            self.mark_dirty(flag);
            if first_err.is_none() {
                *first_err = Some(err);
            }
        }
    }

    fn mark_dirty(&self, flag: DirtyFlag) {
        let mut state = self.state.lock();
        match flag {
            DirtyFlag::Channels => state.channels_dirty = true,
            DirtyFlag::Events => state.events_dirty = true,
            DirtyFlag::Saved => state.saved_dirty = true,
        }
    }

    /// Write the channel list now. Snapshots under the flush gate like
    /// every other save path.
    fn persist_channels(&self) {
        let _flush = self.flush.lock();
        let blob = {
            let mut state = self.state.lock();
            state.channels_dirty = false;
            channels_blob(&state)
        };
        let mut first_err = None;
        self.write_blob(KEY_CHANNELS, &blob, DirtyFlag::Channels, &mut first_err);
    }

    fn publish(&self, notices: Vec<Notice>) {
        for notice in notices {
            let _ = self.notices.publish(NOTICE_TOPIC, notice);
        }
    }
}

#[derive(Clone, Copy)]
enum DirtyFlag {
    Channels,
    Events,
    Saved,
}

fn in_catch_up(state: &RegistryState, channel: &str) -> bool {
    state
        .tracker
        .record(channel)
        .map(|record| record.catch_up)
        .unwrap_or(false)
}

/// Insert an already-admitted event into its cache and evict past the
/// bound. Eviction and unread bookkeeping stay atomic: both happen
/// under the same lock, in the same pass.
fn apply_event(state: &mut RegistryState, event: Event, notices: &mut Vec<Notice>, cap: usize) {
    let channel = event.channel.clone();
    notices.push(Notice::EventApplied {
        event: event.clone(),
    });
    let cache = state.caches.entry(channel.clone()).or_default();
    cache.push_back(event);
    let unread = state.unread.entry(channel).or_insert(0);
    *unread += 1;
    while cache.len() > cap {
        if let Some(evicted) = cache.pop_front() {
            if !evicted.read {
                *unread = unread.saturating_sub(1);
            }
        }
    }
}

/// Park an event that arrived ahead of an open gap. The per-channel
/// buffer is bounded by the cache cap: once the drain replays it, only
/// the newest `cap` events can stay cached anyway, so the oldest
/// parked seqs are dropped and the backfill request covers that range
/// again.
fn park_pending(state: &mut RegistryState, channel: &str, event: Event, cap: usize) {
    let parked = state.pending.entry(channel.to_string()).or_default();
    parked.insert(event.seq, event);
    while parked.len() > cap {
        parked.pop_first();
    }
}

/// Replay parked events that became contiguous after an apply, and
/// discard parked copies the cursor has already passed.
fn drain_pending(
    state: &mut RegistryState,
    channel: &str,
    notices: &mut Vec<Notice>,
    cap: usize,
) {
    loop {
        let next_seq = match state.tracker.record(channel) {
            Some(record) => record.last_applied_seq + 1,
            None => return,
        };
        let event = match state
            .pending
            .get_mut(channel)
            .and_then(|parked| parked.remove(&next_seq))
        {
            Some(event) => event,
            None => break,
        };
        if matches!(state.tracker.admit(channel, event.seq), Admission::Apply) {
            apply_event(state, event, notices, cap);
        }
    }
    let cursor = state
        .tracker
        .record(channel)
        .map(|record| record.last_applied_seq)
        .unwrap_or(0);
    if let Some(parked) = state.pending.get_mut(channel) {
        parked.retain(|seq, _| *seq > cursor);
    }
    if state
        .pending
        .get(channel)
        .is_some_and(|parked| parked.is_empty())
    {
        state.pending.remove(channel);
    }
}

fn push_unread_notice(state: &RegistryState, channel: &str, notices: &mut Vec<Notice>) {
    notices.push(Notice::UnreadChanged {
        channel: channel.to_string(),
        unread: state.unread.get(channel).copied().unwrap_or(0),
    });
}

fn channels_blob(state: &RegistryState) -> ChannelsBlob {
    ChannelsBlob {
        channels: state.channels.values().cloned().collect(),
    }
}

fn events_blob(state: &RegistryState) -> EventsBlob {
    EventsBlob {
        tracker: state.tracker.clone(),
        caches: state
            .caches
            .iter()
            .map(|(channel, cache)| (channel.clone(), cache.iter().cloned().collect()))
            .collect(),
        unread: state.unread.clone(),
    }
}

fn saved_blob(state: &RegistryState) -> SavedBlob {
    SavedBlob {
        events: state.saved.values().cloned().collect(),
    }
}

fn load_blob<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Option<T> {
    match store.load(key) {
        Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
            Ok(blob) => Some(blob),
            Err(err) => {
                warn!(
                    target = "vigil::registry",
                    key,
                    error = %err,
                    "persisted blob is corrupt; starting fresh"
                );
                None
            }
        },
        Ok(None) => None,
        Err(err) => {
            warn!(target = "vigil::registry", key, error = %err, "failed to load persisted blob");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::sync::mpsc;
    use std::thread;
    use tokio::sync::broadcast::error::TryRecvError;
    use update_bus::LocalBus;

    fn build(max_cached: usize) -> (SubscriptionRegistry, Arc<MemoryStore>, Arc<LocalBus<Notice>>) {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(LocalBus::new());
        let registry = SubscriptionRegistry::open(
            store.clone() as Arc<dyn StateStore>,
            bus.clone() as Arc<dyn Bus<Notice>>,
            max_cached,
        );
        (registry, store, bus)
    }

    fn frame(channel: &str, seq: Seq) -> EventFrame {
        EventFrame {
            channel: channel.to_string(),
            seq,
            payload: json!({ "n": seq }),
            timestamp_ms: seq as i64,
        }
    }

    fn seqs(events: &[Event]) -> Vec<Seq> {
        events.iter().map(|e| e.seq).collect()
    }

    /// Store that can stall one save on command, letting a test hold a
    /// writer mid-flush while another thread mutates and saves.
    struct HoldableStore {
        inner: MemoryStore,
        hold_key: Mutex<Option<String>>,
        started: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl HoldableStore {
        fn new() -> (Arc<Self>, mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (started_tx, started_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            let store = Arc::new(Self {
                inner: MemoryStore::new(),
                hold_key: Mutex::new(None),
                started: Mutex::new(started_tx),
                release: Mutex::new(release_rx),
            });
            (store, started_rx, release_tx)
        }

        fn hold_next(&self, key: &str) {
            *self.hold_key.lock() = Some(key.to_string());
        }
    }

    impl StateStore for HoldableStore {
        fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.load(key)
        }

        fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
            let held = {
                let mut hold = self.hold_key.lock();
                if hold.as_deref() == Some(key) {
                    hold.take();
                    true
                } else {
                    false
                }
            };
            if held {
                self.started.lock().send(()).expect("signal the hold");
                self.release.lock().recv().expect("await release");
            }
            self.inner.save(key, bytes)
        }

        fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn subscribe_is_idempotent_and_persists() {
        let (registry, store, _bus) = build(100);
        assert!(registry.subscribe("front-door"));
        assert!(!registry.subscribe("front-door"));
        assert_eq!(registry.channels().len(), 1);
        assert!(store.keys().contains(&"channels".to_string()));
    }

    #[test]
    fn in_order_ingest_applies_and_counts() {
        let (registry, _store, _bus) = build(100);
        registry.subscribe("front-door");
        for seq in 1..=3 {
            assert_eq!(
                registry.ingest(frame("front-door", seq)),
                IngestOutcome::Applied {
                    last_applied_seq: seq
                }
            );
        }
        assert_eq!(seqs(&registry.events("front-door")), vec![1, 2, 3]);
        assert_eq!(registry.unread_count("front-door"), 3);
        assert_eq!(registry.total_event_count(), 3);
    }

    #[test]
    fn duplicate_ingest_is_a_noop() {
        let (registry, _store, _bus) = build(100);
        registry.subscribe("cam");
        registry.ingest(frame("cam", 1));
        registry.ingest(frame("cam", 2));
        assert_eq!(registry.ingest(frame("cam", 2)), IngestOutcome::Duplicate);
        assert_eq!(registry.ingest(frame("cam", 1)), IngestOutcome::Duplicate);
        assert_eq!(seqs(&registry.events("cam")), vec![1, 2]);
        assert_eq!(registry.unread_count("cam"), 2);
        assert_eq!(registry.total_event_count(), 2);
    }

    #[test]
    fn gap_parks_event_and_reports_range() {
        let (registry, _store, _bus) = build(100);
        registry.subscribe("cam");
        registry.ingest(frame("cam", 1));
        registry.ingest(frame("cam", 2));
        assert_eq!(
            registry.ingest(frame("cam", 4)),
            IngestOutcome::Gap {
                from_seq: 3,
                to_seq: 4
            }
        );
        // The parked event is not visible until the hole fills.
        assert_eq!(seqs(&registry.events("cam")), vec![1, 2]);
        assert_eq!(registry.unread_count("cam"), 2);
    }

    #[test]
    fn backfill_fills_hole_and_drains_parked_events() {
        let (registry, _store, _bus) = build(100);
        registry.subscribe("cam");
        registry.ingest(frame("cam", 1));
        registry.ingest(frame("cam", 2));
        registry.ingest(frame("cam", 4));
        registry.ingest(frame("cam", 5));

        let outcome = registry.apply_backfill("cam", vec![frame("cam", 3)]);
        assert_eq!(outcome, BackfillOutcome::CaughtUp);
        assert_eq!(seqs(&registry.events("cam")), vec![1, 2, 3, 4, 5]);
        assert_eq!(registry.unread_count("cam"), 5);

        let stats = registry.stats();
        let cam = &stats.per_channel[0];
        assert_eq!(cam.last_applied_seq, 5);
        assert!(!cam.catch_up);
        assert_eq!(cam.total_received, 5);
    }

    #[test]
    fn partial_backfill_reports_remaining_hole() {
        let (registry, _store, _bus) = build(100);
        registry.subscribe("cam");
        registry.ingest(frame("cam", 1));
        registry.ingest(frame("cam", 5));

        let outcome = registry.apply_backfill("cam", vec![frame("cam", 2), frame("cam", 3)]);
        assert_eq!(
            outcome,
            BackfillOutcome::StillMissing {
                from_seq: 4,
                to_seq: 5
            }
        );
        assert_eq!(seqs(&registry.events("cam")), vec![1, 2, 3]);

        let outcome = registry.apply_backfill("cam", vec![frame("cam", 4)]);
        assert_eq!(outcome, BackfillOutcome::CaughtUp);
        assert_eq!(seqs(&registry.events("cam")), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn gap_parking_is_bounded_by_the_cache_cap() {
        let (registry, _store, _bus) = build(10);
        registry.subscribe("cam");
        registry.ingest(frame("cam", 1));
        // Hold seq 2 open while the live stream runs far ahead; only
        // the newest ten arrivals stay parked.
        for seq in 3..=500 {
            registry.ingest(frame("cam", seq));
        }
        assert_eq!(seqs(&registry.events("cam")), vec![1]);

        // Filling the hole replays what is still parked; the dropped
        // prefix is reported for another backfill round.
        let outcome = registry.apply_backfill("cam", vec![frame("cam", 2)]);
        assert_eq!(
            outcome,
            BackfillOutcome::StillMissing {
                from_seq: 3,
                to_seq: 500
            }
        );

        let remainder: Vec<EventFrame> = (3..=490).map(|seq| frame("cam", seq)).collect();
        assert_eq!(
            registry.apply_backfill("cam", remainder),
            BackfillOutcome::CaughtUp
        );
        assert_eq!(
            seqs(&registry.events("cam")),
            (491..=500).collect::<Vec<Seq>>()
        );
        assert_eq!(registry.unread_count("cam"), 10);
        assert_eq!(registry.total_event_count(), 500);
    }

    #[test]
    fn shuffled_live_arrival_still_yields_ascending_cache() {
        let (registry, _store, _bus) = build(100);
        registry.subscribe("cam");
        for seq in [3, 1, 2, 5, 4] {
            registry.ingest(frame("cam", seq));
        }
        assert_eq!(seqs(&registry.events("cam")), vec![1, 2, 3, 4, 5]);
        assert_eq!(registry.total_event_count(), 5);
        assert!(!registry.stats().per_channel[0].catch_up);
    }

    #[test]
    fn mark_read_decrements_once() {
        let (registry, _store, _bus) = build(100);
        registry.subscribe("cam");
        registry.ingest(frame("cam", 1));
        registry.ingest(frame("cam", 2));
        registry.ingest(frame("cam", 3));

        assert!(registry.mark_read("cam", 2));
        assert_eq!(registry.unread_count("cam"), 2);
        assert!(!registry.mark_read("cam", 2));
        assert_eq!(registry.unread_count("cam"), 2);
        assert!(!registry.mark_read("cam", 99));

        assert_eq!(registry.mark_all_read("cam"), 2);
        assert_eq!(registry.unread_count("cam"), 0);
        assert!(registry.events("cam").iter().all(|e| e.read));
    }

    #[test]
    fn eviction_keeps_unread_accounting_consistent() {
        let (registry, _store, _bus) = build(3);
        registry.subscribe("cam");
        for seq in 1..=5 {
            registry.ingest(frame("cam", seq));
        }
        assert_eq!(seqs(&registry.events("cam")), vec![3, 4, 5]);
        assert_eq!(registry.unread_count("cam"), 3);

        registry.mark_read("cam", 3);
        assert_eq!(registry.unread_count("cam"), 2);
        // Evicting the read event must not touch the unread counter.
        registry.ingest(frame("cam", 6));
        assert_eq!(seqs(&registry.events("cam")), vec![4, 5, 6]);
        assert_eq!(registry.unread_count("cam"), 3);

        let unread_in_cache = registry
            .events("cam")
            .iter()
            .filter(|e| !e.read)
            .count() as u64;
        assert_eq!(registry.unread_count("cam"), unread_in_cache);
    }

    #[test]
    fn saved_events_survive_eviction() {
        let (registry, _store, _bus) = build(3);
        registry.subscribe("cam");
        for seq in 1..=3 {
            registry.ingest(frame("cam", seq));
        }
        assert!(registry.save_event("cam", 1));
        registry.ingest(frame("cam", 4));
        registry.ingest(frame("cam", 5));

        assert_eq!(seqs(&registry.events("cam")), vec![3, 4, 5]);
        let saved = registry.saved_events();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].seq, 1);
        assert!(saved[0].saved);

        assert!(registry.unsave_event("cam", 1));
        assert!(registry.saved_events().is_empty());
        assert!(!registry.unsave_event("cam", 1));
    }

    #[test]
    fn save_requires_cached_event() {
        let (registry, _store, _bus) = build(100);
        registry.subscribe("cam");
        assert!(!registry.save_event("cam", 7));
    }

    #[test]
    fn clear_preserves_subscriptions_and_zeroes_cursors() {
        let (registry, _store, _bus) = build(100);
        registry.subscribe("a");
        registry.subscribe("b");
        registry.ingest(frame("a", 1));
        registry.ingest(frame("a", 2));
        registry.ingest(frame("b", 1));
        registry.save_event("a", 1);

        registry.clear_cached_data().expect("clear");

        let ids: Vec<ChannelId> = registry.channels().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert!(registry.events("a").is_empty());
        assert!(registry.events("b").is_empty());
        assert_eq!(registry.unread_count("a"), 0);
        assert!(registry.saved_events().is_empty());
        assert_eq!(registry.total_event_count(), 0);
        for point in registry.resume_points() {
            assert_eq!(point.resume_from_seq, 0);
        }
    }

    #[test]
    fn unsubscribe_drops_channel_state_but_keeps_saved() {
        let (registry, _store, _bus) = build(100);
        registry.subscribe("cam");
        registry.ingest(frame("cam", 1));
        registry.save_event("cam", 1);

        assert!(registry.unsubscribe("cam"));
        assert!(!registry.unsubscribe("cam"));
        assert!(registry.events("cam").is_empty());
        assert_eq!(registry.stats().channel_count, 0);
        assert_eq!(registry.saved_events().len(), 1);
        assert_eq!(registry.ingest(frame("cam", 2)), IngestOutcome::Ignored);
    }

    #[test]
    fn persistence_round_trip_restores_everything() {
        let store = Arc::new(MemoryStore::new());
        {
            let bus = Arc::new(LocalBus::new());
            let registry = SubscriptionRegistry::open(
                store.clone() as Arc<dyn StateStore>,
                bus as Arc<dyn Bus<Notice>>,
                100,
            );
            registry.subscribe("a");
            registry.subscribe("b");
            registry.ingest(frame("a", 1));
            registry.ingest(frame("a", 2));
            registry.ingest(frame("a", 4)); // open gap
            registry.ingest(frame("b", 1));
            registry.mark_read("a", 1);
            registry.save_event("b", 1);
            registry.force_save().expect("save");
        }

        let bus = Arc::new(LocalBus::new());
        let restored = SubscriptionRegistry::open(
            store as Arc<dyn StateStore>,
            bus as Arc<dyn Bus<Notice>>,
            100,
        );
        assert_eq!(seqs(&restored.events("a")), vec![1, 2]);
        assert_eq!(restored.unread_count("a"), 1);
        assert_eq!(restored.saved_events().len(), 1);
        let points = restored.resume_points();
        assert_eq!(points[0].resume_from_seq, 2); // channel a
        assert_eq!(points[1].resume_from_seq, 1); // channel b
        // The open gap survives as catch_up; the parked event does not
        // (it will be replayed by the backend on resume).
        let stats = restored.stats();
        let a = stats.per_channel.iter().find(|c| c.channel == "a").unwrap();
        assert!(a.catch_up);
        assert_eq!(a.highest_seen_seq, 4);
    }

    #[test]
    fn write_failure_marks_dirty_and_retries() {
        let (registry, store, _bus) = build(100);
        registry.subscribe("cam");
        store.fail_writes(true);
        registry.ingest(frame("cam", 1));
        assert!(registry.force_save().is_err());

        store.fail_writes(false);
        registry.force_save_if_dirty();
        assert!(store.keys().contains(&"events".to_string()));

        // Everything flushed: a further flush writes nothing new.
        let writes_before = store.write_count();
        registry.force_save_if_dirty();
        assert_eq!(store.write_count(), writes_before);
    }

    #[test]
    fn stalled_flush_cannot_overwrite_cleared_state() {
        let (store, flush_started, release_flush) = HoldableStore::new();
        let bus = Arc::new(LocalBus::new());
        let registry = Arc::new(SubscriptionRegistry::open(
            store.clone() as Arc<dyn StateStore>,
            bus as Arc<dyn Bus<Notice>>,
            100,
        ));
        registry.subscribe("cam");
        registry.ingest(frame("cam", 1));
        registry.ingest(frame("cam", 2));

        // A background flush stalls inside the events write.
        store.hold_next("events");
        let flusher = {
            let registry = registry.clone();
            thread::spawn(move || registry.force_save_if_dirty())
        };
        flush_started.recv().expect("flush reached the store");

        // Clearing while that write is in flight must still leave the
        // cleared blobs as the last ones on disk.
        let clearer = {
            let registry = registry.clone();
            thread::spawn(move || registry.clear_cached_data())
        };
        thread::sleep(std::time::Duration::from_millis(50));
        release_flush.send(()).expect("release the stalled write");
        flusher.join().expect("flusher thread");
        clearer
            .join()
            .expect("clear thread")
            .expect("clear persists");

        let bus = Arc::new(LocalBus::new());
        let restored = SubscriptionRegistry::open(
            store as Arc<dyn StateStore>,
            bus as Arc<dyn Bus<Notice>>,
            100,
        );
        assert!(restored.events("cam").is_empty());
        assert_eq!(restored.unread_count("cam"), 0);
        assert_eq!(restored.total_event_count(), 0);
        assert_eq!(restored.channels().len(), 1);
        for point in restored.resume_points() {
            assert_eq!(point.resume_from_seq, 0);
        }
    }

    #[test]
    fn notices_cover_apply_unread_and_catch_up() {
        let (registry, _store, bus) = build(100);
        let mut rx = bus.subscribe(NOTICE_TOPIC);
        registry.subscribe("cam");

        registry.ingest(frame("cam", 1));
        match rx.try_recv().expect("applied notice").payload {
            Notice::EventApplied { event } => assert_eq!(event.seq, 1),
            other => panic!("unexpected notice: {other:?}"),
        }
        match rx.try_recv().expect("unread notice").payload {
            Notice::UnreadChanged { unread, .. } => assert_eq!(unread, 1),
            other => panic!("unexpected notice: {other:?}"),
        }

        registry.ingest(frame("cam", 3));
        assert!(matches!(
            rx.try_recv().expect("catch-up start").payload,
            Notice::CatchUpStarted { .. }
        ));

        registry.apply_backfill("cam", vec![frame("cam", 2)]);
        let mut finished = false;
        loop {
            match rx.try_recv() {
                Ok(msg) => {
                    if matches!(msg.payload, Notice::CatchUpFinished { .. }) {
                        finished = true;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(err) => panic!("bus closed: {err:?}"),
            }
        }
        assert!(finished);
    }
}
