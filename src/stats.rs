//! Counters for non-fatal sync and discovery events
//!
//! Failures that are recovered locally (bad datagrams, unreachable probes,
//! postponed syncs) are counted here rather than surfaced.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::sync::MergeOutcome;

#[derive(Debug, Default)]
pub struct SyncStats {
    announcements_received: AtomicU64,
    malformed_datagrams: AtomicU64,
    probes_failed: AtomicU64,
    peers_evicted: AtomicU64,
    records_applied: AtomicU64,
    records_already_applied: AtomicU64,
    records_stale: AtomicU64,
    records_rejected: AtomicU64,
    conflicts_recorded: AtomicU64,
    batches_flushed: AtomicU64,
    batches_retained: AtomicU64,
    sync_sessions_completed: AtomicU64,
    sync_sessions_postponed: AtomicU64,
}

/// Point-in-time copy of [`SyncStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub announcements_received: u64,
    pub malformed_datagrams: u64,
    pub probes_failed: u64,
    pub peers_evicted: u64,
    pub records_applied: u64,
    pub records_already_applied: u64,
    pub records_stale: u64,
    pub records_rejected: u64,
    pub conflicts_recorded: u64,
    pub batches_flushed: u64,
    pub batches_retained: u64,
    pub sync_sessions_completed: u64,
    pub sync_sessions_postponed: u64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn announcement_received(&self) {
        self.announcements_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_datagram(&self) {
        self.malformed_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probe_failed(&self) {
        self.probes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peers_evicted(&self, count: usize) {
        self.peers_evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: MergeOutcome) {
        let counter = match outcome {
            MergeOutcome::Applied => &self.records_applied,
            MergeOutcome::AlreadyApplied => &self.records_already_applied,
            MergeOutcome::IgnoredStale => &self.records_stale,
            MergeOutcome::ConflictRecorded => &self.conflicts_recorded,
            MergeOutcome::NotFound | MergeOutcome::Rejected => &self.records_rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_flushed(&self) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_retained(&self) {
        self.batches_retained.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_completed(&self) {
        self.sync_sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_postponed(&self) {
        self.sync_sessions_postponed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            announcements_received: self.announcements_received.load(Ordering::Relaxed),
            malformed_datagrams: self.malformed_datagrams.load(Ordering::Relaxed),
            probes_failed: self.probes_failed.load(Ordering::Relaxed),
            peers_evicted: self.peers_evicted.load(Ordering::Relaxed),
            records_applied: self.records_applied.load(Ordering::Relaxed),
            records_already_applied: self.records_already_applied.load(Ordering::Relaxed),
            records_stale: self.records_stale.load(Ordering::Relaxed),
            records_rejected: self.records_rejected.load(Ordering::Relaxed),
            conflicts_recorded: self.conflicts_recorded.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_retained: self.batches_retained.load(Ordering::Relaxed),
            sync_sessions_completed: self.sync_sessions_completed.load(Ordering::Relaxed),
            sync_sessions_postponed: self.sync_sessions_postponed.load(Ordering::Relaxed),
        }
    }
}
