//! Per-channel sequence bookkeeping.
//!
//! The tracker is a pure state machine: it decides whether an incoming
//! sequence number should be applied, dropped as a duplicate, or held
//! back because a gap opened, and it never touches caches, storage, or
//! the network. The registry consults it before every cache mutation
//! and feeds backfilled events back through the same admission path.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use vigil_proto::{ChannelId, Seq};

/// Admission decision for one `(channel, seq)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Next contiguous sequence; the caller applies the event.
    Apply,
    /// Already applied; the caller drops the event.
    Duplicate,
    /// Sequence jumped ahead. The caller parks the event and requests
    /// backfill for the inclusive range carried here.
    Gap { from_seq: Seq, to_seq: Seq },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSyncRecord {
    /// Highest sequence applied in contiguous order.
    pub last_applied_seq: Seq,
    /// Highest sequence ever observed; ahead of `last_applied_seq`
    /// while a gap is open.
    pub highest_seen_seq: Seq,
    /// Distinct events applied over the channel's lifetime. Duplicates
    /// and parked events do not count until they land.
    pub total_received: u64,
    /// True while `highest_seen_seq > last_applied_seq`.
    pub catch_up: bool,
}

impl ChannelSyncRecord {
    fn admit(&mut self, seq: Seq) -> Admission {
        if seq <= self.last_applied_seq {
            return Admission::Duplicate;
        }
        if seq == self.last_applied_seq + 1 {
            self.last_applied_seq = seq;
            if self.highest_seen_seq < seq {
                self.highest_seen_seq = seq;
            }
            self.total_received += 1;
            self.catch_up = self.highest_seen_seq > self.last_applied_seq;
            return Admission::Apply;
        }
        if self.highest_seen_seq < seq {
            self.highest_seen_seq = seq;
        }
        self.catch_up = true;
        Admission::Gap {
            from_seq: self.last_applied_seq + 1,
            to_seq: self.highest_seen_seq,
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub channel: ChannelId,
    pub last_applied_seq: Seq,
    pub highest_seen_seq: Seq,
    pub total_received: u64,
    pub catch_up: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub channel_count: usize,
    pub total_events: u64,
    pub per_channel: Vec<ChannelStats>,
}

/// Tracks one `ChannelSyncRecord` per subscribed channel. Serializable
/// so resume cursors survive restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncTracker {
    records: HashMap<ChannelId, ChannelSyncRecord>,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, channel: &str) {
        self.records.entry(channel.to_string()).or_default();
    }

    pub fn forget(&mut self, channel: &str) {
        self.records.remove(channel);
    }

    pub fn record(&self, channel: &str) -> Option<ChannelSyncRecord> {
        self.records.get(channel).copied()
    }

    /// Decide what to do with `seq` on `channel`, mutating the record
    /// accordingly. Channels are tracked on first sight.
    pub fn admit(&mut self, channel: &str, seq: Seq) -> Admission {
        self.records
            .entry(channel.to_string())
            .or_default()
            .admit(seq)
    }

    /// Zero the record but keep the channel tracked; the next subscribe
    /// frame will carry `resume_from_seq = 0`.
    pub fn reset(&mut self, channel: &str) {
        if let Some(record) = self.records.get_mut(channel) {
            record.reset();
        }
    }

    pub fn reset_all(&mut self) {
        for record in self.records.values_mut() {
            record.reset();
        }
    }

    pub fn channels(&self) -> impl Iterator<Item = (&ChannelId, &ChannelSyncRecord)> {
        self.records.iter()
    }

    pub fn stats(&self) -> SyncStats {
        let mut per_channel: Vec<ChannelStats> = self
            .records
            .iter()
            .map(|(channel, record)| ChannelStats {
                channel: channel.clone(),
                last_applied_seq: record.last_applied_seq,
                highest_seen_seq: record.highest_seen_seq,
                total_received: record.total_received,
                catch_up: record.catch_up,
            })
            .collect();
        per_channel.sort_by(|a, b| a.channel.cmp(&b.channel));
        SyncStats {
            channel_count: per_channel.len(),
            total_events: per_channel.iter().map(|c| c.total_received).sum(),
            per_channel,
        }
    }
}
